//! Prometheus metrics for the content manager.
//!
//! Grounded in the teacher's `DnsMetrics`: a struct wrapping a
//! `prometheus::Registry`, one field per gauge/counter, constructed once
//! at startup and cloned cheaply (prometheus metric handles are already
//! `Arc`-backed internally).

use prometheus::{IntCounter, IntGauge, Registry};

#[derive(Clone)]
pub struct ContentMetrics {
    registry: Registry,
    pub opening: IntGauge,
    pub established: IntGauge,
    pub buffered: IntGauge,
    pub terminations: IntCounter,
    pub bytes_sent_v4: IntCounter,
    pub bytes_sent_v6: IntCounter,
}

impl ContentMetrics {
    pub fn new() -> Self {
        let registry = Registry::new();

        let opening = IntGauge::new("charon_opening_downloads", "downloaders awaiting connect")
            .expect("metric names are static and valid");
        let established =
            IntGauge::new("charon_established_downloads", "downloaders relaying data")
                .expect("metric names are static and valid");
        let buffered = IntGauge::new("charon_buffered_downloads", "downloaders with queued writes")
            .expect("metric names are static and valid");
        let terminations = IntCounter::new("charon_downloader_terminations_total", "downloaders torn down")
            .expect("metric names are static and valid");
        let bytes_sent_v4 = IntCounter::new("charon_bytes_sent_v4_total", "bytes written over IPv4 downloaders")
            .expect("metric names are static and valid");
        let bytes_sent_v6 = IntCounter::new("charon_bytes_sent_v6_total", "bytes written over IPv6 downloaders")
            .expect("metric names are static and valid");

        for collector in [
            Box::new(opening.clone()) as Box<dyn prometheus::core::Collector>,
            Box::new(established.clone()),
            Box::new(buffered.clone()),
            Box::new(terminations.clone()),
            Box::new(bytes_sent_v4.clone()),
            Box::new(bytes_sent_v6.clone()),
        ] {
            let _ = registry.register(collector);
        }

        Self {
            registry,
            opening,
            established,
            buffered,
            terminations,
            bytes_sent_v4,
            bytes_sent_v6,
        }
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn opening_set(&self, n: i64) {
        self.opening.set(n);
    }

    pub fn established_set(&self, n: i64) {
        self.established.set(n);
    }

    pub fn buffered_inc(&self) {
        self.buffered.inc();
    }

    pub fn buffered_dec(&self) {
        self.buffered.dec();
    }

    pub fn record_termination(&self) {
        self.terminations.inc();
    }

    pub fn record_sent(&self, v4: u64, v6: u64) {
        self.bytes_sent_v4.inc_by(v4);
        self.bytes_sent_v6.inc_by(v6);
    }
}

impl Default for ContentMetrics {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gauges_start_at_zero() {
        let metrics = ContentMetrics::new();
        assert_eq!(metrics.opening.get(), 0);
        assert_eq!(metrics.established.get(), 0);
    }

    #[test]
    fn registry_exposes_registered_families() {
        let metrics = ContentMetrics::new();
        let families = metrics.registry().gather();
        assert!(families.iter().any(|f| f.name() == "charon_opening_downloads"));
    }
}
