//! Per-connection session state (`spec.md` §4.d) and the slotmap-backed
//! pool that owns it. Mirrors the original C `context_t`/`pool_t` pair,
//! with raw pointers replaced by `slotmap` keys and arena indices.

use std::rc::Rc;

use mio::net::TcpStream;
use slotmap::{new_key_type, SlotMap};

use crate::buffer::Buffer;
use crate::crypto::CryptoState;
use crate::error::{Error, Result};
use crate::timer::TimerToken;
use crate::user::UserRecord;

new_key_type! {
    /// Stable handle to a [`Context`], safe to carry through `mio::Token`
    /// and timer callback data across poll iterations.
    pub struct ContextKey;
}

/// Which side of the tunnel a context belongs to. The relay state
/// machine and the handshake framing both branch on this.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Local,
    Remote,
}

/// Which socket a readiness event or half-close applies to, matching the
/// `MASK_CLIENT` / `MASK_REMOTE` bits of the original C context mask.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    Client,
    Remote,
}

/// Hand-rolled bit flags tracking which sockets are live and which
/// directions have seen a half-close. A dependency on `bitflags` buys
/// nothing over four `const` bits for a set this small.
pub type SessionMask = u8;

pub const MASK_CLIENT: SessionMask = 0b0001;
pub const MASK_REMOTE: SessionMask = 0b0010;
pub const MASK_CLIENT_EOF: SessionMask = 0b0100;
pub const MASK_REMOTE_EOF: SessionMask = 0b1000;

/// One tunneled connection's full state: both sockets (the remote side
/// is absent until the handshake resolves it), the request/response
/// buffers (reused across the handshake and the relay phase per
/// `spec.md` §4.h "Design Notes"), the crypto state, and bookkeeping.
pub struct Context {
    pub role: Role,
    pub mask: SessionMask,
    pub client: Option<TcpStream>,
    pub remote: Option<TcpStream>,
    /// Client -> remote direction buffer. During the handshake this
    /// holds the 1024-byte (local) or inbound (remote) handshake frame;
    /// after the handshake it's repurposed as the relay buffer for the
    /// same direction.
    pub req_buf: Buffer,
    /// Remote -> client direction buffer, same reuse pattern.
    pub res_buf: Buffer,
    pub crypto: CryptoState,
    pub user: Option<Rc<UserRecord>>,
    pub handshake_timer: Option<TimerToken>,
}

impl Context {
    fn new(role: Role) -> Self {
        Self {
            role,
            mask: 0,
            client: None,
            remote: None,
            req_buf: Buffer::with_capacity(crate::buffer::HANDSHAKE_SIZE.max(crate::buffer::BUFSIZE)),
            res_buf: Buffer::with_capacity(crate::buffer::HANDSHAKE_SIZE.max(crate::buffer::BUFSIZE)),
            crypto: CryptoState::new([0u8; 32]),
            user: None,
            handshake_timer: None,
        }
    }

    pub fn has_client(&self) -> bool {
        self.mask & MASK_CLIENT != 0
    }

    pub fn has_remote(&self) -> bool {
        self.mask & MASK_REMOTE != 0
    }

    pub fn set_client_eof(&mut self) {
        self.mask |= MASK_CLIENT_EOF;
    }

    pub fn set_remote_eof(&mut self) {
        self.mask |= MASK_REMOTE_EOF;
    }

    pub fn client_eof(&self) -> bool {
        self.mask & MASK_CLIENT_EOF != 0
    }

    pub fn remote_eof(&self) -> bool {
        self.mask & MASK_REMOTE_EOF != 0
    }
}

/// Fixed-capacity arena of in-flight [`Context`]s, bounding the number of
/// concurrent connections (`spec.md` §4.d, resolved capacity: 100 — see
/// `SPEC_FULL.md` §4.d).
pub struct ContextPool {
    contexts: SlotMap<ContextKey, Context>,
    capacity: usize,
}

impl ContextPool {
    pub fn new(capacity: usize) -> Self {
        Self {
            contexts: SlotMap::with_key(),
            capacity,
        }
    }

    /// Allocate a fresh context for a newly-accepted or newly-dialed
    /// connection. Fails with [`Error::PoolExhausted`] once `capacity`
    /// live contexts are outstanding.
    pub fn get(&mut self, role: Role) -> Result<ContextKey> {
        if self.contexts.len() >= self.capacity {
            return Err(Error::PoolExhausted);
        }
        Ok(self.contexts.insert(Context::new(role)))
    }

    pub fn lookup(&self, key: ContextKey) -> Option<&Context> {
        self.contexts.get(key)
    }

    pub fn lookup_mut(&mut self, key: ContextKey) -> Option<&mut Context> {
        self.contexts.get_mut(key)
    }

    /// Remove and return a context, dropping both of its sockets. Callers
    /// must deregister any still-registered socket from the `mio::Poll`
    /// before calling this — `TcpStream::drop` closes the fd but does
    /// not deregister it, and a stale registration would leak a slot in
    /// the poller's interest list.
    pub fn release(&mut self, key: ContextKey) -> Option<Context> {
        self.contexts.remove(key)
    }

    pub fn len(&self) -> usize {
        self.contexts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.contexts.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocates_and_releases_within_capacity() {
        let mut pool = ContextPool::new(2);
        let a = pool.get(Role::Local).unwrap();
        let _b = pool.get(Role::Local).unwrap();
        assert!(pool.get(Role::Local).is_err());

        assert!(pool.release(a).is_some());
        assert!(pool.get(Role::Local).is_ok());
    }

    #[test]
    fn mask_tracks_eof_independently() {
        let mut ctx = Context::new(Role::Remote);
        ctx.mask |= MASK_CLIENT | MASK_REMOTE;
        assert!(ctx.has_client() && ctx.has_remote());
        assert!(!ctx.client_eof());

        ctx.set_client_eof();
        assert!(ctx.client_eof());
        assert!(!ctx.remote_eof());
    }
}
