use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::path::PathBuf;

/// A `(host, port)` allowlist entry, either side of which may be the
/// wildcard `"*"`. Matches spec.md §6.2's `security.local`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalAllow {
    pub host: String,
    pub port: String,
}

impl LocalAllow {
    pub fn matches(&self, host: &str, port: u16) -> bool {
        (self.host == "*" || self.host == host)
            && (self.port == "*" || self.port == port.to_string())
    }
}

/// Content manager configuration.
///
/// Grounded in `config.rs`'s `DnsConfig`: a plain struct with a
/// hand-written `Default` plus environment-variable overrides, rather than
/// a config-file crate (the teacher doesn't use one for this struct
/// either).
#[derive(Debug, Clone)]
pub struct Config {
    /// Root directory for `get_local_content`/`read_local_content`.
    /// Resolved to its canonical absolute form at load time.
    pub web_html: PathBuf,

    /// Local bind address used for outbound IPv4 connections.
    pub tcp4_bind: Ipv4Addr,

    /// Local bind address used for outbound IPv6 connections.
    pub tcp6_bind: Ipv6Addr,

    /// Allowlist guarding traffic to locally-owned addresses.
    pub security_local: Vec<LocalAllow>,

    /// Addresses this process considers "locally owned" (interface
    /// addresses). Downloads to these addresses are checked against
    /// `security_local` before a Downloader is created.
    pub local_addresses: Vec<IpAddr>,

    /// `tracing` target used for download-subsystem log events (replaces
    /// the spec's abstract `log.download` channel name).
    pub log_download_target: &'static str,

    /// Number of reusable send buffers kept in the Downloader buffer pool.
    pub buffer_pool_size: usize,

    /// Capacity of each pooled send buffer.
    pub buffer_capacity: usize,
}

impl Default for Config {
    fn default() -> Self {
        let web_html = std::env::var("CHARON_WEB_HTML")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("./web"));

        let web_html = std::fs::canonicalize(&web_html).unwrap_or(web_html);

        Self {
            web_html,
            tcp4_bind: Ipv4Addr::UNSPECIFIED,
            tcp6_bind: Ipv6Addr::UNSPECIFIED,
            security_local: Vec::new(),
            local_addresses: Vec::new(),
            log_download_target: "download",
            buffer_pool_size: 128,
            buffer_capacity: 4096,
        }
    }
}

impl Config {
    /// True if `addr` is one of this process's locally-owned addresses.
    pub fn is_local_address(&self, addr: &IpAddr) -> bool {
        self.local_addresses.contains(addr)
    }

    /// True if some `security.local` entry permits `(host, port)`.
    pub fn allows_local(&self, host: &str, port: u16) -> bool {
        self.security_local.iter().any(|e| e.matches(host, port))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wildcard_host_and_port_match_anything() {
        let entry = LocalAllow {
            host: "*".into(),
            port: "*".into(),
        };
        assert!(entry.matches("10.0.0.1", 80));
        assert!(entry.matches("anything", 1));
    }

    #[test]
    fn exact_entry_only_matches_itself() {
        let entry = LocalAllow {
            host: "10.0.0.1".into(),
            port: "443".into(),
        };
        assert!(entry.matches("10.0.0.1", 443));
        assert!(!entry.matches("10.0.0.1", 80));
        assert!(!entry.matches("10.0.0.2", 443));
    }

    #[test]
    fn default_config_has_no_allowlist_entries() {
        let cfg = Config::default();
        assert!(!cfg.allows_local("10.0.0.1", 80));
    }
}
