//! The tagged command the content manager acts on.
//!
//! `exaproxy`'s `ContentManager.getContent` dispatches on a bare string and
//! re-validates its argument arity inline for every branch (see
//! `original_source/lib/exaproxy/reactor/content/manager.py`). spec.md §9
//! design note 1 calls for replacing that with a closed, compile-time
//! checked set of commands, each carrying exactly the arguments it needs.
//! `Verb` is that replacement: the decision engine (out of scope here)
//! builds one of these directly, so there is no stringly-typed arity check
//! left to fail at this boundary.

/// The upstream request-body length an exchange announced, per spec.md
/// §4.3: digit-only tokens parse to a concrete count, `-1` means
/// open-ended streaming, and anything else is handed back exactly as the
/// caller supplied it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Length {
    /// Open-ended; the caller announced no (or a non-HTTP/1.x) upgrade.
    Stream,
    /// A digit-only token, parsed.
    Fixed(u64),
    /// Non-digit token, handed back untouched for the caller to interpret.
    Raw(String),
}

impl Length {
    /// Parse a length token: digits-only becomes `Fixed`, anything else is
    /// echoed back verbatim as `Raw`. Used directly by `icap`, and by
    /// `download` once the upgrade check has decided digit parsing even
    /// applies.
    pub fn parse(token: &str) -> Length {
        if !token.is_empty() && token.bytes().all(|b| b.is_ascii_digit()) {
            match token.parse::<u64>() {
                Ok(n) => Length::Fixed(n),
                Err(_) => Length::Raw(token.to_string()),
            }
        } else {
            Length::Raw(token.to_string())
        }
    }

    /// `download`'s length rule: `-1` (open-ended) unless `upgrade` is one
    /// of the plain-HTTP values, in which case the token is parsed as
    /// usual. A non-empty, non-HTTP/1.x upgrade (e.g. `"websocket"`) means
    /// the body length the client announced is meaningless to the
    /// upstream tunnel, so it is streamed open-ended instead.
    pub fn for_download(upgrade: &str, token: &str) -> Length {
        match upgrade {
            "" | "http/1.0" | "http/1.1" => Length::parse(token),
            _ => Length::Stream,
        }
    }
}

/// A single command handed to `ContentManager::get_content`, matching
/// spec.md §4.3's verb table one variant per row with exactly that row's
/// required arguments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verb {
    /// Open (or reuse) an outbound connection and relay `request`.
    /// `length` is the raw token the client announced; the content
    /// manager applies the upgrade-dependent parsing rule (spec.md
    /// §4.3) rather than the caller pre-deciding it.
    Download {
        host: String,
        port: u16,
        upgrade: String,
        length: String,
        request: Vec<u8>,
    },
    /// Tunnel raw bytes to `host:port` (CONNECT-style); on failure the
    /// client still sees a `noconnect.html` response.
    Connect {
        host: String,
        port: u16,
        data: Vec<u8>,
    },
    /// Like `Connect`, but a failed connection is dropped silently rather
    /// than answered with `noconnect.html`.
    Intercept {
        host: String,
        port: u16,
        data: Vec<u8>,
    },
    /// Redirect the client without ever touching an upstream.
    Redirect { url: String },
    /// Serve bytes produced by an embedded HTTP responder, verbatim.
    Http { bytes: Vec<u8> },
    /// Stream an ICAP adaptation service's response back to the client.
    /// `length` is the raw token; parsed the same way as `download`'s.
    Icap { response: Vec<u8>, length: String },
    /// Serve a file from the local web root under the given status code.
    File { code: u16, reason: String },
    /// Read `reason` from the web root, percent-format it, and wrap the
    /// result in an HTTP response of `code`.
    Rewrite {
        code: u16,
        reason: String,
        comment: String,
        protocol: String,
        url: String,
        host: String,
        client_ip: String,
    },
    /// Observe the request without altering its flow; `path` selects the
    /// canned monitoring page to render.
    Monitor { path: String },
    /// Terminate the client connection immediately.
    Close,
}

impl Verb {
    /// True for verbs that open or reuse an outbound `Downloader`
    /// connection, as opposed to ones answered entirely locally.
    pub fn needs_downloader(&self) -> bool {
        matches!(self, Verb::Download { .. } | Verb::Connect { .. } | Verb::Intercept { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn length_parses_digit_only_tokens() {
        assert_eq!(Length::parse("42"), Length::Fixed(42));
        assert_eq!(Length::parse("0"), Length::Fixed(0));
    }

    #[test]
    fn length_echoes_non_digit_tokens_back_untouched() {
        assert_eq!(Length::parse("xyz"), Length::Raw("xyz".into()));
    }

    #[test]
    fn download_length_streams_on_non_http_upgrade() {
        assert_eq!(Length::for_download("websocket", "42"), Length::Stream);
    }

    #[test]
    fn download_length_parses_normally_for_plain_http() {
        assert_eq!(Length::for_download("http/1.1", "42"), Length::Fixed(42));
        assert_eq!(Length::for_download("http/1.1", "xyz"), Length::Raw("xyz".into()));
        assert_eq!(Length::for_download("", "7"), Length::Fixed(7));
    }

    #[test]
    fn local_only_verbs_do_not_need_a_downloader() {
        assert!(!Verb::File { code: 200, reason: "/index.html".into() }.needs_downloader());
        assert!(!Verb::Monitor { path: "/status".into() }.needs_downloader());
        assert!(!Verb::Close.needs_downloader());
    }

    #[test]
    fn tunnel_verbs_need_a_downloader() {
        assert!(Verb::Connect { host: "1.2.3.4".into(), port: 443, data: vec![] }.needs_downloader());
        assert!(Verb::Intercept { host: "1.2.3.4".into(), port: 443, data: vec![] }.needs_downloader());
    }
}
