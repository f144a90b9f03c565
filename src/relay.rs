//! Full-duplex relay state machine (`spec.md` §4.h): once a tunnel's
//! handshake has installed its streaming crypto keys, both directions
//! pump bytes between the client-side and remote-side sockets, applying
//! the role-appropriate transform and the subscription-swap backpressure
//! rule described there.
//!
//! Built from two mirrored half-duplex directions. Which one encrypts
//! and which one decrypts depends on [`Role`]: a local proxy encrypts
//! what it reads from the SOCKS5 application and decrypts what it reads
//! from the remote proxy; a remote proxy does the opposite.

use std::io::{self, Read, Write};

use mio::net::TcpStream;
use mio::Interest;

use crate::buffer::Buffer;
use crate::context::{Context, Role};
use crate::crypto::CryptoState;
use crate::error::{is_would_block, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    ClientToRemote,
    RemoteToClient,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Transform {
    Encrypt,
    Decrypt,
}

fn transform_for(role: Role, direction: Direction) -> Transform {
    use Direction::*;
    use Role::*;
    use Transform::*;
    match (role, direction) {
        (Local, ClientToRemote) => Encrypt,
        (Local, RemoteToClient) => Decrypt,
        (Remote, ClientToRemote) => Decrypt,
        (Remote, RemoteToClient) => Encrypt,
    }
}

/// What a pumped direction needs from the event loop afterwards: whether
/// either endpoint has reached EOF, and which readiness interests should
/// remain subscribed.
#[derive(Debug, Clone, Copy, Default)]
pub struct RelayOutcome {
    pub source_closed: bool,
    pub sink_closed: bool,
    pub want_source_read: bool,
    pub want_sink_write: bool,
}

/// Drive one direction as far as it will go without blocking: drain a
/// pending write first, then, once the buffer is empty, refill it from
/// the source and transform it in place. Mirrors the original C
/// `remote_readable_cb`'s rule of refusing to refill while unread data
/// remains (`spec.md` §4.h, Design Notes, rule 5).
pub fn pump(ctx: &mut Context, direction: Direction) -> Result<RelayOutcome> {
    let role = ctx.role;
    let transform = transform_for(role, direction);

    let (source, sink, buf) = match direction {
        Direction::ClientToRemote => (
            ctx.client.as_mut(),
            ctx.remote.as_mut(),
            &mut ctx.req_buf,
        ),
        Direction::RemoteToClient => (
            ctx.remote.as_mut(),
            ctx.client.as_mut(),
            &mut ctx.res_buf,
        ),
    };
    let (Some(source), Some(sink)) = (source, sink) else {
        return Ok(RelayOutcome::default());
    };

    let mut outcome = RelayOutcome::default();

    if buf.data_len() > 0 {
        drain_to_sink(sink, buf, &mut outcome)?;
    }

    if buf.is_empty() && !outcome.sink_closed {
        refill_from_source(source, buf, &mut ctx.crypto, transform, &mut outcome)?;
        if buf.data_len() > 0 {
            drain_to_sink(sink, buf, &mut outcome)?;
        }
    }

    outcome.want_source_read = buf.is_empty() && !outcome.source_closed;
    outcome.want_sink_write = buf.data_len() > 0;

    Ok(outcome)
}

fn refill_from_source(
    source: &mut TcpStream,
    buf: &mut Buffer,
    crypto: &mut CryptoState,
    transform: Transform,
    outcome: &mut RelayOutcome,
) -> Result<()> {
    buf.reset();
    loop {
        if buf.writable_len() == 0 {
            break;
        }
        match source.read(buf.writable_mut()) {
            Ok(0) => {
                outcome.source_closed = true;
                break;
            }
            Ok(n) => {
                buf.advance_write(n);
            }
            Err(e) if is_would_block(&e) => break,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        }
    }

    if buf.data_len() > 0 {
        match transform {
            Transform::Encrypt => crypto.encrypt(buf),
            Transform::Decrypt => crypto.decrypt(buf),
        }
    }

    Ok(())
}

fn drain_to_sink(sink: &mut TcpStream, buf: &mut Buffer, outcome: &mut RelayOutcome) -> Result<()> {
    while buf.data_len() > 0 {
        match sink.write(buf.readable()) {
            Ok(0) => {
                outcome.sink_closed = true;
                break;
            }
            Ok(n) => buf.advance_read(n),
            Err(e) if is_would_block(&e) => break,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        }
    }
    if buf.is_empty() {
        buf.reset();
    }
    Ok(())
}

/// Collapse a direction's `(want_read, want_write)` pair into the
/// `mio::Interest` its socket should be subscribed with, or `None` if
/// that side needs nothing right now (fully drained and at EOF).
pub fn interest_from(want_read: bool, want_write: bool) -> Option<Interest> {
    match (want_read, want_write) {
        (true, true) => Some(Interest::READABLE | Interest::WRITABLE),
        (true, false) => Some(Interest::READABLE),
        (false, true) => Some(Interest::WRITABLE),
        (false, false) => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transform_mirrors_between_roles() {
        assert_eq!(
            transform_for(Role::Local, Direction::ClientToRemote),
            Transform::Encrypt
        );
        assert_eq!(
            transform_for(Role::Remote, Direction::ClientToRemote),
            Transform::Decrypt
        );
        assert_eq!(
            transform_for(Role::Local, Direction::RemoteToClient),
            Transform::Decrypt
        );
        assert_eq!(
            transform_for(Role::Remote, Direction::RemoteToClient),
            Transform::Encrypt
        );
    }
}
