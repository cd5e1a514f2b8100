//! Per-connection blocking state.
//!
//! A connection whose request missed the slave cache is suspended until the
//! coordinator answers. The whole protocol is one state per connection and
//! one transition function, [`ClientState::on`]:
//!
//! ```text
//!            RequestHit                 WriteDone
//!   Idle ----------------> Writable ---------------> Idle
//!     |                       ^
//!     | RequestPending        | Fulfilled
//!     v                       |
//!   AwaitingCache ------------+
//!
//!   Timeout from any state -> Idle (the connection is then closed)
//! ```

use bytes::Bytes;

use crate::entry::ClientId;

/// Where a connection is in the request/reply cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ClientState {
    /// Reading requests, nothing to write.
    #[default]
    Idle,
    /// Blocked on a pending cache entry. Neither read nor write interest.
    AwaitingCache,
    /// A reply is buffered and must be flushed.
    Writable,
}

/// Something that happened to a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientEvent {
    /// A request was answered from the slave cache.
    RequestHit,
    /// A request hit a pending entry and the client was registered.
    RequestPending,
    /// The entry the client waited on was filled.
    Fulfilled,
    /// The output buffer drained completely.
    WriteDone,
    /// The client exceeded its idle or blocked time.
    Timeout,
}

impl ClientState {
    /// Applies `event` and returns the next state.
    ///
    /// Events that make no sense in the current state leave it unchanged. In
    /// particular a blocked client ignores everything except `Fulfilled` and
    /// `Timeout`, and `Fulfilled` is ignored unless the client is blocked.
    #[must_use]
    pub fn on(self, event: ClientEvent) -> ClientState {
        match (self, event) {
            (_, ClientEvent::Timeout) => ClientState::Idle,
            (ClientState::AwaitingCache, ClientEvent::Fulfilled) => ClientState::Writable,
            (ClientState::AwaitingCache, _) => ClientState::AwaitingCache,
            (_, ClientEvent::RequestHit) => ClientState::Writable,
            (_, ClientEvent::RequestPending) => ClientState::AwaitingCache,
            (ClientState::Writable, ClientEvent::WriteDone) => ClientState::Idle,
            (state, _) => state,
        }
    }

    /// Whether new requests should be read.
    pub fn wants_read(self) -> bool {
        !self.is_blocked()
    }

    /// Whether buffered output should be flushed.
    pub fn wants_write(self) -> bool {
        self == ClientState::Writable
    }

    /// Returns true while the client waits on the cache.
    pub fn is_blocked(self) -> bool {
        self == ClientState::AwaitingCache
    }
}

/// Suspends and resumes connections on behalf of the cache.
///
/// The network layer owns the sockets; the cache only hands out
/// [`ClientId`]s and calls back through this trait.
pub trait Blocker {
    /// Stops all readiness interest for `client` until it is unblocked.
    fn block_client(&mut self, client: ClientId);

    /// Attaches `reply` as the client's pending output and resumes write
    /// readiness. Unknown or already closed clients are ignored.
    fn unblock_client(&mut self, client: ClientId, reply: Bytes);
}
