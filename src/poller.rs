//! The readiness multiplexer the content manager consumes.
//!
//! spec.md §6.1 specifies this as an external contract: a set of named
//! logical channels (`opening_download`, `read_download`,
//! `write_download`) that the surrounding reactor polls, with cork/uncork
//! to suspend delivery without unsubscribing. `Poller` is that contract;
//! `MioPoller` is one concrete, idempotent implementation grounded in the
//! teacher's `TransportManager`/`ConnectionManager` pattern of pairing a
//! trait with a ready-to-use default, adapted to `mio` since spec.md §5
//! requires a single-threaded, non-blocking, lock-free core rather than
//! tokio's task-based model.

use mio::unix::SourceFd;
use mio::{Events, Interest, Poll, Token};
use std::collections::{HashMap, HashSet};
use std::io;
use std::os::fd::RawFd;
use std::time::Duration;

/// Logical readiness channels referenced by the content manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Channel {
    OpeningDownload,
    ReadDownload,
    WriteDownload,
}

/// Readiness subscription keyed by logical channel name.
///
/// Every method must be idempotent against duplicate add/remove calls:
/// spec.md §6.1 requires this to tolerate the overlap window during
/// phase promotion, where a socket can be momentarily registered on both
/// `opening_download` and `read_download`.
pub trait Poller {
    fn add_read_socket(&mut self, channel: Channel, token: Token);
    fn remove_read_socket(&mut self, channel: Channel, token: Token);
    fn add_write_socket(&mut self, channel: Channel, token: Token);
    fn remove_write_socket(&mut self, channel: Channel, token: Token);
    fn cork_read_socket(&mut self, channel: Channel, token: Token);
    fn uncork_read_socket(&mut self, channel: Channel, token: Token);
    fn clear_read(&mut self, channel: Channel);
    fn clear_write(&mut self, channel: Channel);

    /// Associate `token` with the OS-level fd backing a live Downloader
    /// socket, so a later channel subscription has something real to
    /// register readiness interest against. Not part of spec.md §6.1's
    /// four-channel contract itself — it's the hookup a concrete poller
    /// needs to turn that contract into actual epoll/kqueue registration.
    /// Defaults to a no-op since a `Poller` that tracks sockets some other
    /// way (or doesn't need to) shouldn't have to implement it. Must be
    /// idempotent, same as every other method here.
    fn track(&mut self, _token: Token, _fd: RawFd) {}

    /// Drop `token`'s association created by `track`, deregistering it
    /// from the underlying readiness mechanism. No-op by default; see
    /// `track`.
    fn untrack(&mut self, _token: Token) {}
}

#[derive(Default)]
struct ChannelState {
    reading: HashSet<Token>,
    writing: HashSet<Token>,
    corked: HashSet<Token>,
}

/// An in-process `Poller` backed by `mio::Poll`.
///
/// A socket is handed to the poller as a raw fd via `track`, not as an
/// owned `mio` type: the fd's actual owner is the `Downloader` that reads
/// and writes it, so registration goes through `SourceFd`, which lets
/// `mio` register OS-level readiness interest against a fd without taking
/// it over. The fd is registered with `mio` the first time it's
/// subscribed to any channel and deregistered once no channel references
/// it anymore. Corking a read subscription suppresses delivery in
/// `poll()` without touching the underlying `mio` registration, matching
/// spec.md's "cork silently preserves any subscription" rule.
pub struct MioPoller {
    poll: Poll,
    channels: HashMap<Channel, ChannelState>,
    sockets: HashMap<Token, RawFd>,
}

impl MioPoller {
    pub fn new() -> io::Result<Self> {
        Ok(Self {
            poll: Poll::new()?,
            channels: HashMap::new(),
            sockets: HashMap::new(),
        })
    }

    fn interest_for(&self, token: Token) -> Option<Interest> {
        let reading = self
            .channels
            .values()
            .any(|s| s.reading.contains(&token));
        let writing = self
            .channels
            .values()
            .any(|s| s.writing.contains(&token));

        match (reading, writing) {
            (true, true) => Some(Interest::READABLE | Interest::WRITABLE),
            (true, false) => Some(Interest::READABLE),
            (false, true) => Some(Interest::WRITABLE),
            (false, false) => None,
        }
    }

    fn sync_registration(&mut self, token: Token) {
        let Some(&fd) = self.sockets.get(&token) else { return };
        let Some(interest) = self.interest_for(token) else {
            let _ = self.poll.registry().deregister(&mut SourceFd(&fd));
            return;
        };

        if self
            .poll
            .registry()
            .reregister(&mut SourceFd(&fd), token, interest)
            .is_err()
        {
            let _ = self.poll.registry().register(&mut SourceFd(&fd), token, interest);
        }
    }

    /// Whether `token` is currently subscribed for read readiness on
    /// `channel`, irrespective of cork state. Exposed for tests that need
    /// to observe the backpressure bookkeeping from outside the crate.
    pub fn is_subscribed_read(&self, channel: Channel, token: Token) -> bool {
        self.channels.get(&channel).is_some_and(|s| s.reading.contains(&token))
    }

    /// Whether `token` is currently subscribed for write readiness on
    /// `channel`.
    pub fn is_subscribed_write(&self, channel: Channel, token: Token) -> bool {
        self.channels.get(&channel).is_some_and(|s| s.writing.contains(&token))
    }

    /// Block for readiness up to `timeout`, returning the tokens that
    /// became ready on each non-corked channel they're subscribed to.
    pub fn poll(&mut self, timeout: Option<Duration>) -> io::Result<Vec<(Channel, Token, bool, bool)>> {
        let mut events = Events::with_capacity(128);
        self.poll.poll(&mut events, timeout)?;

        let mut ready = Vec::new();
        for event in events.iter() {
            let token = event.token();
            for (&channel, state) in self.channels.iter() {
                if state.corked.contains(&token) {
                    continue;
                }
                let readable = event.is_readable() && state.reading.contains(&token);
                let writable = event.is_writable() && state.writing.contains(&token);
                if readable || writable {
                    ready.push((channel, token, readable, writable));
                }
            }
        }
        Ok(ready)
    }
}

impl Poller for MioPoller {
    fn add_read_socket(&mut self, channel: Channel, token: Token) {
        let state = self.channels.entry(channel).or_default();
        if state.reading.insert(token) {
            self.sync_registration(token);
        }
    }

    fn remove_read_socket(&mut self, channel: Channel, token: Token) {
        if let Some(state) = self.channels.get_mut(&channel) {
            if state.reading.remove(&token) {
                self.sync_registration(token);
            }
        }
    }

    fn add_write_socket(&mut self, channel: Channel, token: Token) {
        let state = self.channels.entry(channel).or_default();
        if state.writing.insert(token) {
            self.sync_registration(token);
        }
    }

    fn remove_write_socket(&mut self, channel: Channel, token: Token) {
        if let Some(state) = self.channels.get_mut(&channel) {
            if state.writing.remove(&token) {
                self.sync_registration(token);
            }
        }
    }

    fn cork_read_socket(&mut self, channel: Channel, token: Token) {
        self.channels.entry(channel).or_default().corked.insert(token);
    }

    fn uncork_read_socket(&mut self, channel: Channel, token: Token) {
        if let Some(state) = self.channels.get_mut(&channel) {
            state.corked.remove(&token);
        }
    }

    fn clear_read(&mut self, channel: Channel) {
        if let Some(state) = self.channels.get_mut(&channel) {
            let tokens: Vec<Token> = state.reading.drain().collect();
            for token in tokens {
                self.sync_registration(token);
            }
        }
    }

    fn clear_write(&mut self, channel: Channel) {
        if let Some(state) = self.channels.get_mut(&channel) {
            let tokens: Vec<Token> = state.writing.drain().collect();
            for token in tokens {
                self.sync_registration(token);
            }
        }
    }

    /// Calling this twice for the same token is a no-op.
    fn track(&mut self, token: Token, fd: RawFd) {
        self.sockets.entry(token).or_insert(fd);
    }

    fn untrack(&mut self, token: Token) {
        for state in self.channels.values_mut() {
            state.reading.remove(&token);
            state.writing.remove(&token);
            state.corked.remove(&token);
        }
        if let Some(fd) = self.sockets.remove(&token) {
            let _ = self.poll.registry().deregister(&mut SourceFd(&fd));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn duplicate_add_and_remove_is_idempotent() {
        let mut poller = MioPoller::new().unwrap();
        let token = Token(1);

        poller.add_write_socket(Channel::WriteDownload, token);
        poller.add_write_socket(Channel::WriteDownload, token);
        assert!(
            poller.channels[&Channel::WriteDownload]
                .writing
                .contains(&token)
        );

        poller.remove_write_socket(Channel::WriteDownload, token);
        poller.remove_write_socket(Channel::WriteDownload, token);
        assert!(
            !poller.channels[&Channel::WriteDownload]
                .writing
                .contains(&token)
        );
    }

    #[test]
    fn add_then_remove_leaves_channel_state_matching_initial() {
        let mut poller = MioPoller::new().unwrap();
        let token = Token(7);

        let before = poller.channels.get(&Channel::WriteDownload).is_none();
        poller.add_write_socket(Channel::WriteDownload, token);
        poller.remove_write_socket(Channel::WriteDownload, token);
        let after_empty = poller.channels[&Channel::WriteDownload].writing.is_empty();

        assert!(before);
        assert!(after_empty);
    }

    #[test]
    fn cork_suppresses_without_unsubscribing() {
        let mut poller = MioPoller::new().unwrap();
        let token = Token(3);

        poller.add_read_socket(Channel::ReadDownload, token);
        poller.cork_read_socket(Channel::ReadDownload, token);
        assert!(
            poller.channels[&Channel::ReadDownload]
                .reading
                .contains(&token)
        );
        assert!(
            poller.channels[&Channel::ReadDownload]
                .corked
                .contains(&token)
        );

        poller.uncork_read_socket(Channel::ReadDownload, token);
        assert!(
            !poller.channels[&Channel::ReadDownload]
                .corked
                .contains(&token)
        );
    }

    #[test]
    fn clear_read_empties_channel() {
        let mut poller = MioPoller::new().unwrap();
        poller.add_read_socket(Channel::ReadDownload, Token(1));
        poller.add_read_socket(Channel::ReadDownload, Token(2));
        poller.clear_read(Channel::ReadDownload);
        assert!(poller.channels[&Channel::ReadDownload].reading.is_empty());
    }

    #[test]
    fn tracked_fd_delivers_a_real_readiness_event() {
        use std::io::Write;
        use std::net::{TcpListener, TcpStream};
        use std::os::fd::AsRawFd;

        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).unwrap();
        let mut server_side = listener.accept().unwrap().0;
        server_side.write_all(b"hi").unwrap();

        let mut poller = MioPoller::new().unwrap();
        let token = Token(42);
        poller.track(token, client.as_raw_fd());
        poller.add_read_socket(Channel::ReadDownload, token);

        let ready = poller
            .poll(Some(Duration::from_millis(500)))
            .unwrap();
        assert!(
            ready
                .iter()
                .any(|&(channel, t, readable, _)| channel == Channel::ReadDownload && t == token && readable)
        );

        poller.untrack(token);
        assert!(!poller.is_subscribed_read(Channel::ReadDownload, token));
    }
}
