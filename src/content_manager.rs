//! The central registry tying clients, `Downloader`s, and local content
//! together: the Rust counterpart of `ContentManager` in
//! `original_source/lib/exaproxy/reactor/content/manager.py`.
//!
//! The original keeps three parallel dicts (`opening`, `established`,
//! `byclient`) plus a `buffered` list. spec.md §9 design note 2 collapses
//! these into a single `client -> Downloader` map carrying its own
//! `Phase`, plus a secondary `sock -> client` index for poller callbacks
//! that only know the socket token — the registry simplification recorded
//! there.
//!
//! All failures are recovered locally per spec.md §7: nothing here returns
//! `Result` across the public boundary. Internal fallibility (a bad host,
//! a missing local file, a write that hits a real socket error) is caught
//! and turned into one of the degraded `Outcome`s the spec calls for.

use crate::config::Config;
use crate::downloader::{Downloader, Method, Phase};
use crate::local_content::{self, LocalHeaderCache};
use crate::metrics::ContentMetrics;
use crate::pool::BufferPool;
use crate::poller::{Channel, Poller};
use crate::verb::{Length, Verb};
use mio::Token;
use std::collections::HashMap;
use std::path::PathBuf;

struct Entry {
    downloader: Downloader,
    token: Token,
    /// Mirrors membership of this socket in the original's `buffered`
    /// list: true while the downloader's own internal send buffer still
    /// has unflushed residue. The bytes themselves live inside the
    /// `Downloader`, not here.
    buffered: bool,
    corked: bool,
}

/// What `get_content` returned, for the "content" half of spec.md §4.3's
/// `(content, length, buffered, buffer_change)` tuple.
#[derive(Debug)]
pub enum Outcome {
    /// A downloader now owns this client's data; `prelude` is whatever
    /// bytes (if any) should be relayed to the client right away — empty
    /// for a freshly opened connection, since the real response only
    /// arrives once the upstream is established.
    Stream(Vec<u8>),
    /// Serve a local file: its precomputed header and resolved path.
    /// Streaming the body itself is the formatter's job (out of scope,
    /// spec.md §1).
    File { header: Vec<u8>, path: PathBuf },
    /// Serve `body` (if any) then close the client connection.
    Close(Option<Vec<u8>>),
}

/// The full return shape of `get_content`, mirroring spec.md §4.3's
/// `(content, length, buffered, buffer_change)`. `buffered`/`buffer_change`
/// are `None` ("absent") for verbs that never touch a downloader.
#[derive(Debug)]
pub struct GetContentResult {
    pub content: Outcome,
    pub length: Length,
    pub buffered: Option<bool>,
    pub buffer_change: Option<bool>,
}

impl GetContentResult {
    fn local(content: Outcome) -> Self {
        Self { content, length: Length::Fixed(0), buffered: None, buffer_change: None }
    }
}

/// Owns every live outbound connection and serves local content.
pub struct ContentManager {
    config: Config,
    downloaders: HashMap<u64, Entry>,
    by_socket: HashMap<Token, u64>,
    header_cache: LocalHeaderCache,
    buffer_pool: BufferPool,
    metrics: ContentMetrics,
    next_token: usize,
}

impl ContentManager {
    pub fn new(config: Config) -> Self {
        let buffer_pool = BufferPool::new(config.buffer_capacity, config.buffer_pool_size);
        Self {
            metrics: ContentMetrics::new(),
            config,
            downloaders: HashMap::new(),
            by_socket: HashMap::new(),
            header_cache: LocalHeaderCache::new(),
            buffer_pool,
            next_token: 1,
        }
    }

    /// Whether `client` currently owns a registered downloader, in either
    /// phase. Mirrors `hasClient`.
    pub fn has_client(&self, client: u64) -> bool {
        self.downloaders.contains_key(&client)
    }

    /// The poller token backing `client`'s downloader, if any. Lets the
    /// surrounding reactor (or a test) recover the token to drive
    /// `start_download`/`flush_buffered` without maintaining a second
    /// client-to-token map of its own.
    pub fn token_for_client(&self, client: u64) -> Option<Token> {
        self.downloaders.get(&client).map(|e| e.token)
    }

    /// Dispatch one command for `client`. Mirrors `getContent`.
    pub fn get_content(&mut self, client: u64, verb: Verb, poller: &mut impl Poller) -> GetContentResult {
        match verb {
            Verb::Close => {
                self.terminate(client, poller);
                GetContentResult::local(Outcome::Close(None))
            }
            Verb::Monitor { path } => {
                let body = local_content::http(200, &local_content::page_html(&path));
                GetContentResult::local(Outcome::Close(Some(body)))
            }
            Verb::Redirect { url } => {
                let body = format!(
                    "HTTP/1.1 302 Surfprotected\r\nCache-Control: no-store\r\nLocation: {url}\r\n\r\n\r\n"
                )
                .into_bytes();
                GetContentResult::local(Outcome::Close(Some(body)))
            }
            Verb::Http { bytes } => GetContentResult::local(Outcome::Close(Some(bytes))),
            Verb::Icap { response, length } => GetContentResult {
                content: Outcome::Stream(response),
                length: Length::parse(&length),
                buffered: None,
                buffer_change: None,
            },
            Verb::File { code, reason } => {
                let content = match self.header_cache.get(&self.config.web_html, code, &reason) {
                    Ok((header, path)) => Outcome::File { header, path },
                    Err(_) => Outcome::Close(Some(local_content::not_implemented(&reason))),
                };
                GetContentResult::local(content)
            }
            Verb::Rewrite { code, reason, comment, protocol, url, host, client_ip } => {
                let data = [
                    ("url", url.as_str()),
                    ("host", host.as_str()),
                    ("client_ip", client_ip.as_str()),
                    ("protocol", protocol.as_str()),
                    ("comment", comment.as_str()),
                ];
                let body = match local_content::read_local_content(&self.config.web_html, code, &reason, &data)
                {
                    Ok(body) => body,
                    Err(_) => local_content::not_implemented(&reason),
                };
                GetContentResult::local(Outcome::Close(Some(body)))
            }
            Verb::Download { host, port, upgrade, length, request } => {
                let length = Length::for_download(&upgrade, &length);
                self.dispatch_downloader(client, host, port, Method::Download, &request, length, 400, poller)
            }
            Verb::Connect { host, port, data } => {
                self.dispatch_downloader(client, host, port, Method::Connect, &data, Length::Stream, 400, poller)
            }
            Verb::Intercept { host, port, data } => {
                self.dispatch_downloader(client, host, port, Method::Intercept, &data, Length::Stream, 400, poller)
            }
        }
    }

    /// Mirrors `getDownloader` + the downloader half of `getContent`:
    /// reuse an existing downloader for `client` when host/port match,
    /// otherwise tear down any stale one and open a fresh connection,
    /// subject to the IPv4/IPv6 bind check and the `security.local`
    /// allowlist (spec.md §4.3.1).
    #[allow(clippy::too_many_arguments)]
    fn dispatch_downloader(
        &mut self,
        client: u64,
        host: String,
        port: u16,
        method: Method,
        payload: &[u8],
        length: Length,
        failure_code: u16,
        poller: &mut impl Poller,
    ) -> GetContentResult {
        if let Some(entry) = self.downloaders.get_mut(&client) {
            if entry.downloader.host == host && entry.downloader.port == port {
                let (buffered, buffer_change) = self.write_or_buffer(client, payload, poller);
                return GetContentResult {
                    content: Outcome::Stream(Vec::new()),
                    length,
                    buffered: Some(buffered),
                    buffer_change: Some(buffer_change),
                };
            }
            self.terminate(client, poller);
        }

        let Ok(ip) = host.parse::<std::net::IpAddr>() else {
            tracing::error!(target: self.config.log_download_target, %host, "host is neither IPv4 nor IPv6");
            return self.refused(method, failure_code, length);
        };

        if self.config.is_local_address(&ip) && !self.config.allows_local(&host, port) {
            tracing::warn!(target: self.config.log_download_target, %host, port, "refused: no security.local entry matches");
            return self.refused(method, failure_code, length);
        }

        let downloader = match Downloader::construct(
            client,
            host,
            port,
            method,
            std::net::IpAddr::V4(self.config.tcp4_bind),
            std::net::IpAddr::V6(self.config.tcp6_bind),
            &self.buffer_pool,
        ) {
            Ok(d) => d,
            Err(_) => return self.refused(method, failure_code, length),
        };

        let token = Token(self.next_token);
        self.next_token += 1;

        let fd = downloader.as_raw_fd();
        let mut entry = Entry { downloader, token, buffered: false, corked: false };
        entry.downloader.buffer_data(payload);

        self.downloaders.insert(client, entry);
        self.by_socket.insert(token, client);
        poller.track(token, fd);
        poller.add_write_socket(Channel::OpeningDownload, token);
        self.metrics.opening_set(
            self.downloaders.values().filter(|e| e.downloader.phase == Phase::Opening).count() as i64,
        );

        GetContentResult {
            content: Outcome::Stream(Vec::new()),
            length,
            buffered: Some(false),
            buffer_change: Some(false),
        }
    }

    /// What to return when a downloader couldn't be created or allowed:
    /// `noconnect.html` for `download`/`connect`, a silent drop for
    /// `intercept` (spec.md §4.3, §7 item 2/3).
    fn refused(&mut self, method: Method, code: u16, length: Length) -> GetContentResult {
        let content = match method {
            Method::Intercept => Outcome::Close(None),
            _ => Outcome::Close(Some(self.noconnect_response(code))),
        };
        GetContentResult { content, length, buffered: None, buffer_change: None }
    }

    fn noconnect_response(&self, code: u16) -> Vec<u8> {
        match local_content::read_local_content(&self.config.web_html, code, "noconnect.html", &[]) {
            Ok(body) => body,
            Err(_) => local_content::http(code, b"unable to reach the requested host"),
        }
    }

    /// Promote a connection from `Opening` to `Established` once the
    /// poller reports it writable for the first time. Mirrors
    /// `startDownload`. Returns `(client, response_bytes, buffer_change)`
    /// for the caller to relay to the client, or `None` if `token` wasn't
    /// a known opening socket.
    pub fn start_download(&mut self, token: Token, poller: &mut impl Poller) -> Option<(u64, Option<Vec<u8>>, bool)> {
        let &client = self.by_socket.get(&token)?;
        let phase_ok = self.downloaders.get(&client).map(|e| e.downloader.phase == Phase::Opening)?;
        if !phase_ok {
            return None;
        }

        poller.remove_write_socket(Channel::OpeningDownload, token);

        let method = self.downloaders[&client].downloader.method;
        let conversation = self
            .downloaders
            .get_mut(&client)
            .and_then(|e| e.downloader.start_conversation().ok());

        let (ok, response, still_buffered) = match conversation {
            Some(result) => result,
            None => (false, None, false),
        };

        if !ok {
            self.terminate(client, poller);
            let fallback = match method {
                Method::Intercept => None,
                _ => Some(self.noconnect_response(400)),
            };
            return Some((client, fallback, false));
        }

        poller.add_read_socket(Channel::ReadDownload, token);
        if let Some(entry) = self.downloaders.get_mut(&client) {
            entry.buffered = still_buffered;
        }
        if still_buffered {
            poller.add_write_socket(Channel::WriteDownload, token);
        }
        self.metrics.established_set(
            self.downloaders.values().filter(|e| e.downloader.phase == Phase::Established).count() as i64,
        );

        Some((client, response, still_buffered))
    }

    /// Send (or queue, if the socket can't accept it all right now) data
    /// from the client toward its downloader. Mirrors `sendClientData`,
    /// including the §4.3.2 backpressure bookkeeping. A socket write
    /// error terminates the downloader, matching `readData`'s "absent
    /// signals unrecoverable error" rule applied symmetrically to writes.
    /// Returns `(buffered, buffer_change)` for the caller to report back
    /// through `GetContentResult`.
    fn write_or_buffer(&mut self, client: u64, data: &[u8], poller: &mut impl Poller) -> (bool, bool) {
        enum Effect {
            None,
            /// Became buffered while still opening: there is no connected
            /// socket yet, so there is nothing to subscribe `write_download`
            /// to — only the opening socket's own write-readiness (already
            /// subscribed by `dispatch_downloader`) drives promotion.
            BecameBufferedWhileOpening,
            BecameBuffered(Token),
            BecameUnbuffered(Token),
            WriteFailed,
        }

        let mut now_buffered = false;
        let effect = {
            let Some(entry) = self.downloaders.get_mut(&client) else { return (false, false) };
            let was_buffered = entry.buffered;
            let token = entry.token;
            match entry.downloader.phase {
                Phase::Opening => {
                    let still = entry.downloader.buffer_data(data);
                    entry.buffered = still;
                    now_buffered = still;
                    if still && !was_buffered { Effect::BecameBufferedWhileOpening } else { Effect::None }
                }
                Phase::Established => match entry.downloader.write_data(data) {
                    Ok((still, _v4, _v6)) => {
                        entry.buffered = still;
                        now_buffered = still;
                        match (was_buffered, still) {
                            (false, true) => Effect::BecameBuffered(token),
                            (true, false) => Effect::BecameUnbuffered(token),
                            _ => Effect::None,
                        }
                    }
                    Err(_) => Effect::WriteFailed,
                },
            }
        };

        match effect {
            Effect::None => (now_buffered, false),
            Effect::BecameBufferedWhileOpening => {
                self.metrics.buffered_inc();
                (now_buffered, true)
            }
            Effect::BecameBuffered(token) => {
                poller.add_write_socket(Channel::WriteDownload, token);
                self.metrics.buffered_inc();
                (now_buffered, true)
            }
            Effect::BecameUnbuffered(token) => {
                poller.remove_write_socket(Channel::WriteDownload, token);
                self.metrics.buffered_dec();
                (now_buffered, true)
            }
            Effect::WriteFailed => {
                self.terminate(client, poller);
                (false, false)
            }
        }
    }

    /// Relay one chunk read from `token`'s downloader socket to its client.
    /// Mirrors `readData`: an empty read (origin EOF) or a hard error both
    /// terminate the downloader, matching `readData`'s "absent signals
    /// unrecoverable error" rule. Returns `(client, bytes)` only on an
    /// actual, non-empty read.
    pub fn read_data(&mut self, token: Token, poller: &mut impl Poller) -> Option<(u64, Vec<u8>)> {
        let &client = self.by_socket.get(&token)?;

        enum Effect {
            Data(Vec<u8>),
            WouldBlock,
            Eof,
        }

        let effect = {
            let entry = self.downloaders.get_mut(&client)?;
            if entry.downloader.phase != Phase::Established {
                return None;
            }
            let mut buf = [0u8; 8192];
            match entry.downloader.read_data(&mut buf) {
                Ok(Some(bytes)) if !bytes.is_empty() => Effect::Data(bytes),
                Ok(Some(_)) | Err(_) => Effect::Eof,
                Ok(None) => Effect::WouldBlock,
            }
        };

        match effect {
            Effect::Data(bytes) => Some((client, bytes)),
            Effect::WouldBlock => None,
            Effect::Eof => {
                self.terminate(client, poller);
                None
            }
        }
    }

    /// Send data toward the downloader identified by its socket token,
    /// for callers that only have the token (a poller callback) rather
    /// than the client id. Mirrors `sendSocketData`, reusing
    /// `write_or_buffer`'s backpressure bookkeeping. Returns `(client,
    /// buffered, buffer_change)`.
    pub fn send_socket_data(&mut self, token: Token, data: &[u8], poller: &mut impl Poller) -> Option<(u64, bool, bool)> {
        let &client = self.by_socket.get(&token)?;
        if self.downloaders.get(&client).map(|e| e.downloader.phase) != Some(Phase::Established) {
            return None;
        }
        let (buffered, buffer_change) = self.write_or_buffer(client, data, poller);
        Some((client, buffered, buffer_change))
    }

    /// Send data toward `client`'s downloader, in either phase. Mirrors
    /// `sendClientData`, generalized so it's callable outside of
    /// `get_content`'s own `dispatch_downloader` path. Returns `(buffered,
    /// buffer_change)`, or `None` if `client` has no registered downloader.
    pub fn send_client_data(&mut self, client: u64, data: &[u8], poller: &mut impl Poller) -> Option<(bool, bool)> {
        if !self.has_client(client) {
            return None;
        }
        Some(self.write_or_buffer(client, data, poller))
    }

    /// Drain as much of the buffered backlog for `client` as the socket
    /// will currently accept, called when its write channel signals
    /// ready. Returns whether the residue cleared this call
    /// (`buffer_change`), mirroring §4.3.2's "no residue AND socket was
    /// buffered" rule.
    pub fn flush_buffered(&mut self, token: Token, poller: &mut impl Poller) -> bool {
        let Some(&client) = self.by_socket.get(&token) else { return false };

        enum Effect {
            Drained,
            StillResidual,
            WriteFailed,
        }

        let effect = {
            let Some(entry) = self.downloaders.get_mut(&client) else { return false };
            if !entry.buffered {
                poller.remove_write_socket(Channel::WriteDownload, token);
                return false;
            }

            match entry.downloader.write_data(&[]) {
                Ok((still, _v4, _v6)) => {
                    entry.buffered = still;
                    if still { Effect::StillResidual } else { Effect::Drained }
                }
                Err(_) => Effect::WriteFailed,
            }
        };

        match effect {
            Effect::Drained => {
                poller.remove_write_socket(Channel::WriteDownload, token);
                self.metrics.buffered_dec();
                true
            }
            Effect::StillResidual => false,
            Effect::WriteFailed => {
                self.terminate(client, poller);
                true
            }
        }
    }

    /// `retryDownload` in the original is a stub that always returns
    /// `None`; no retry behavior is implemented here either (spec.md
    /// §11's supplemented-feature note: the original never implemented it
    /// and spec.md does not ask for it).
    pub fn retry_download(&mut self, _client: u64) -> Option<()> {
        None
    }

    pub fn cork_client_download(&mut self, client: u64, poller: &mut impl Poller) {
        if let Some(entry) = self.downloaders.get_mut(&client) {
            if !entry.corked {
                entry.corked = true;
                poller.cork_read_socket(Channel::ReadDownload, entry.token);
            }
        }
    }

    /// Uncorking only takes effect once the downloader is established,
    /// matching `uncorkClientDownload`'s phase check.
    pub fn uncork_client_download(&mut self, client: u64, poller: &mut impl Poller) {
        if let Some(entry) = self.downloaders.get_mut(&client) {
            if entry.corked && entry.downloader.phase == Phase::Established {
                entry.corked = false;
                poller.uncork_read_socket(Channel::ReadDownload, entry.token);
            }
        }
    }

    /// Idempotently tear down `client`'s downloader, if any: unsubscribe
    /// from every channel it may be on and drop it from both registries.
    /// Mirrors `_terminate`.
    pub fn terminate(&mut self, client: u64, poller: &mut impl Poller) -> bool {
        let Some(mut entry) = self.downloaders.remove(&client) else {
            return false;
        };
        self.by_socket.remove(&entry.token);

        poller.remove_write_socket(Channel::OpeningDownload, entry.token);
        poller.remove_read_socket(Channel::ReadDownload, entry.token);
        poller.remove_write_socket(Channel::WriteDownload, entry.token);
        poller.untrack(entry.token);
        self.metrics.record_sent(entry.downloader.total_sent4(), entry.downloader.total_sent6());
        entry.downloader.shutdown();
        self.metrics.record_termination();
        true
    }

    /// End a client's download without waiting on socket teardown,
    /// called when a client is instead served local content. Mirrors
    /// `endClientDownload`.
    pub fn end_client_download(&mut self, client: u64, poller: &mut impl Poller) {
        self.terminate(client, poller);
    }

    /// Tear down every registered downloader and clear every channel.
    /// Mirrors `stop()`.
    pub fn stop(&mut self, poller: &mut impl Poller) {
        let clients: Vec<u64> = self.downloaders.keys().copied().collect();
        for client in clients {
            self.terminate(client, poller);
        }
        poller.clear_read(Channel::OpeningDownload);
        poller.clear_write(Channel::OpeningDownload);
        poller.clear_read(Channel::ReadDownload);
        poller.clear_write(Channel::ReadDownload);
        poller.clear_read(Channel::WriteDownload);
        poller.clear_write(Channel::WriteDownload);
    }

    pub fn metrics(&self) -> &ContentMetrics {
        &self.metrics
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::poller::MioPoller;

    fn manager() -> (ContentManager, MioPoller) {
        (ContentManager::new(Config::default()), MioPoller::new().unwrap())
    }

    #[test]
    fn has_client_false_before_any_downloader() {
        let (cm, _poller) = manager();
        assert!(!cm.has_client(1));
    }

    #[test]
    fn monitor_verb_is_a_local_close_with_no_registry_entry() {
        let (mut cm, mut poller) = manager();
        let result = cm.get_content(1, Verb::Monitor { path: "/status".into() }, &mut poller);
        assert!(matches!(result.content, Outcome::Close(Some(_))));
        assert!(!cm.has_client(1));
        assert_eq!(result.length, Length::Fixed(0));
    }

    #[test]
    fn close_verb_terminates_idempotently() {
        let (mut cm, mut poller) = manager();
        let result = cm.get_content(1, Verb::Close, &mut poller);
        assert!(matches!(result.content, Outcome::Close(None)));
        assert!(!cm.terminate(1, &mut poller));
    }

    #[test]
    fn redirect_produces_the_exact_synthetic_bytes() {
        let (mut cm, mut poller) = manager();
        let result = cm.get_content(1, Verb::Redirect { url: "http://safe.example/".into() }, &mut poller);
        match result.content {
            Outcome::Close(Some(body)) => {
                assert_eq!(
                    body,
                    b"HTTP/1.1 302 Surfprotected\r\nCache-Control: no-store\r\nLocation: http://safe.example/\r\n\r\n\r\n"
                        .to_vec()
                );
            }
            _ => panic!("expected a close-with-body outcome"),
        }
        assert_eq!(result.buffered, None);
        assert_eq!(result.buffer_change, None);
    }

    #[test]
    fn http_verb_returns_bytes_verbatim() {
        let (mut cm, mut poller) = manager();
        let result = cm.get_content(1, Verb::Http { bytes: b"HTTP/1.1 204 No Content\r\n\r\n".to_vec() }, &mut poller);
        match result.content {
            Outcome::Close(Some(body)) => assert_eq!(body, b"HTTP/1.1 204 No Content\r\n\r\n".to_vec()),
            _ => panic!("expected verbatim bytes"),
        }
    }

    #[test]
    fn icap_streams_the_response_with_its_own_length() {
        let (mut cm, mut poller) = manager();
        let result = cm.get_content(
            1,
            Verb::Icap { response: b"adapted body".to_vec(), length: "12".into() },
            &mut poller,
        );
        assert!(matches!(result.content, Outcome::Stream(ref b) if b == b"adapted body"));
        assert_eq!(result.length, Length::Fixed(12));
        assert_eq!(result.buffered, None);
    }

    #[test]
    fn unreachable_download_host_serves_noconnect_with_code_400() {
        let (mut cm, mut poller) = manager();
        let result = cm.get_content(
            1,
            Verb::Download {
                host: "not-an-ip".into(),
                port: 80,
                upgrade: "http/1.1".into(),
                length: "0".into(),
                request: Vec::new(),
            },
            &mut poller,
        );
        assert!(matches!(result.content, Outcome::Close(Some(_))));
        assert!(!cm.has_client(1));
    }

    #[test]
    fn intercept_failure_is_a_silent_drop() {
        let (mut cm, mut poller) = manager();
        let result = cm.get_content(
            1,
            Verb::Intercept { host: "not-an-ip".into(), port: 443, data: Vec::new() },
            &mut poller,
        );
        assert!(matches!(result.content, Outcome::Close(None)));
    }

    #[test]
    fn retry_download_is_always_a_stub() {
        let (mut cm, _poller) = manager();
        assert!(cm.retry_download(42).is_none());
    }
}
