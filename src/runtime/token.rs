//! Connection handles and their mapping onto poll tokens.
//!
//! A `ConnId` is the slab index of a connection in the registry. It doubles
//! as the mio `Token` for that connection's socket, while the listener and
//! the shutdown waker take reserved tokens at the top of the range.

use mio::Token;
use std::fmt;

/// Token of the listening socket.
pub const LISTENER: Token = Token(usize::MAX);

/// Token of the shutdown waker.
pub const WAKER: Token = Token(usize::MAX - 1);

/// Opaque handle to a live connection.
///
/// Handles are reused once a connection is torn down, so a stale handle may
/// refer to a newer connection; lookups must tolerate that.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnId(usize);

impl ConnId {
    pub(crate) fn new(idx: usize) -> Self {
        Self(idx)
    }

    pub(crate) fn index(self) -> usize {
        self.0
    }

    /// Poll token for this connection.
    pub fn token(self) -> Token {
        Token(self.0)
    }

    /// Map a poll token back to a connection handle.
    ///
    /// Returns `None` for the reserved listener and waker tokens.
    pub fn from_token(token: Token) -> Option<Self> {
        if token == LISTENER || token == WAKER {
            None
        } else {
            Some(Self(token.0))
        }
    }
}

impl fmt::Display for ConnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
