//! `fakio-local`'s connection state machine (`spec.md` §4.f, §4.g): SOCKS5
//! front end, non-blocking dial to the remote proxy, handshake framing,
//! then handoff into the relay.

use std::collections::HashMap;
use std::net::{Shutdown, SocketAddr, ToSocketAddrs};
use std::time::Duration;

use mio::net::{TcpListener, TcpStream};
use mio::{Interest, Token};
use socket2::{Domain, Socket, Type};
use tracing::{debug, info, warn};

use crate::buffer::HANDSHAKE_REPLY_SIZE;
use crate::config::ClientConfig;
use crate::context::{ContextKey, ContextPool, Role, Side};
use crate::error::{Error, Result};
use crate::handshake;
use crate::reactor::{Reactor, Subject};
use crate::relay::{self, interest_from, Direction};
use crate::socks5::{self, Address};
use crate::wire::{fill_until, write_all_nonblocking, FillOutcome};

/// Bind a non-blocking `mio` listener with `SO_REUSEADDR` set, so a
/// restarted proxy doesn't fail to bind while the previous process's
/// sockets linger in `TIME_WAIT`.
fn bind_reuseaddr(addr: SocketAddr) -> Result<TcpListener> {
    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, None)
        .map_err(|e| Error::startup(format!("can't create listening socket: {e}")))?;
    socket
        .set_reuse_address(true)
        .map_err(|e| Error::startup(format!("can't set SO_REUSEADDR: {e}")))?;
    socket
        .bind(&addr.into())
        .map_err(|e| Error::startup(format!("can't bind {addr}: {e}")))?;
    socket
        .listen(1024)
        .map_err(|e| Error::startup(format!("can't listen on {addr}: {e}")))?;
    socket
        .set_nonblocking(true)
        .map_err(|e| Error::startup(format!("can't set {addr} non-blocking: {e}")))?;
    Ok(TcpListener::from_std(socket.into()))
}

enum LocalPhase {
    Greeting { buf: Vec<u8> },
    GreetingReply { buf: Vec<u8>, pos: usize },
    Request { buf: Vec<u8> },
    Connecting { address: Address },
    SendHandshake { frame: Vec<u8>, pos: usize },
    RecvReply { buf: Vec<u8> },
    SendSocksReply { buf: Vec<u8>, pos: usize },
    /// A non-CONNECT command was requested (`spec.md` §4.f: "Only
    /// CMD=CONNECT (1) is honored; others are rejected with a SOCKS5
    /// command-not-supported reply and the socket is closed"). Stages
    /// the rejection reply the same way `SendSocksReply` stages the
    /// success reply, then closes instead of entering the relay.
    RejectRequest { buf: Vec<u8>, pos: usize },
    Relaying,
}

struct Session {
    client_token: Token,
    remote_token: Option<Token>,
    phase: LocalPhase,
}

pub struct LocalProxy {
    listener: TcpListener,
    reactor: Reactor,
    pool: ContextPool,
    sessions: HashMap<ContextKey, Session>,
    config: ClientConfig,
    handshake_key: [u8; 32],
}

impl LocalProxy {
    pub fn bind(config: ClientConfig) -> Result<Self> {
        let addr: SocketAddr = format!("{}:{}", config.client_host, config.client_port)
            .parse()
            .map_err(|e| Error::startup(format!("invalid client listen address: {e}")))?;
        let mut listener = bind_reuseaddr(addr)?;

        let mut reactor = Reactor::new(256)?;
        reactor.register_listener(&mut listener, Interest::READABLE)?;

        // The handshake frame is encrypted with the user's full 32-byte
        // key, not the 128-bit key used for post-handshake streaming
        // (`fclient.c:175`: `fcrypt_set_key(c->crypto, client.key, 256)`).
        let handshake_key: [u8; 32] = config.key;

        info!(%addr, "fakio-local listening");

        Ok(Self {
            listener,
            reactor,
            pool: ContextPool::new(100),
            sessions: HashMap::new(),
            config,
            handshake_key,
        })
    }

    pub fn run(&mut self) -> Result<()> {
        loop {
            let outcome = self.reactor.poll(Some(Duration::from_secs(1)))?;
            for (subject, _readiness) in outcome.io {
                match subject {
                    Subject::Listener => self.accept_all(),
                    Subject::Conn(key, side) => {
                        if let Err(e) = self.handle_io(key, side) {
                            debug!(?e, "closing session");
                            self.close_session(key);
                        }
                    }
                }
            }
        }
    }

    fn accept_all(&mut self) {
        loop {
            let (mut stream, peer) = match self.listener.accept() {
                Ok(pair) => pair,
                Err(e) if crate::error::is_would_block(&e) => return,
                Err(e) => {
                    warn!(%e, "accept failed");
                    return;
                }
            };

            let key = match self.pool.get(Role::Local) {
                Ok(key) => key,
                Err(_) => {
                    warn!("context pool exhausted, dropping connection from {peer}");
                    continue;
                }
            };

            let client_token = match self
                .reactor
                .register(&mut stream, key, Side::Client, Interest::READABLE)
            {
                Ok(token) => token,
                Err(e) => {
                    warn!(%e, "failed to register accepted socket");
                    self.pool.release(key);
                    continue;
                }
            };

            let ctx = self.pool.lookup_mut(key).expect("just allocated");
            ctx.client = Some(stream);
            ctx.mask |= crate::context::MASK_CLIENT;

            self.sessions.insert(
                key,
                Session {
                    client_token,
                    remote_token: None,
                    phase: LocalPhase::Greeting { buf: Vec::new() },
                },
            );
            debug!(%peer, "accepted SOCKS5 client");
        }
    }

    fn handle_io(&mut self, key: ContextKey, side: Side) -> Result<()> {
        loop {
            let advanced = self.step(key, side)?;
            if !advanced {
                return Ok(());
            }
        }
    }

    /// Drive one phase transition forward. Returns `true` if progress was
    /// made and the caller should immediately try again (since a new
    /// readiness state may let the next phase proceed without waiting for
    /// another poll wakeup).
    fn step(&mut self, key: ContextKey, side: Side) -> Result<bool> {
        let is_relaying = matches!(
            self.sessions.get(&key).map(|s| &s.phase),
            Some(LocalPhase::Relaying)
        );
        if is_relaying {
            self.step_relay(key)?;
            return Ok(false);
        }

        let session = self.sessions.get_mut(&key).ok_or(Error::PeerClosed)?;
        let ctx = self.pool.lookup_mut(key).ok_or(Error::PeerClosed)?;

        match (&mut session.phase, side) {
            (LocalPhase::Greeting { buf }, Side::Client) => {
                let stream = ctx.client.as_mut().ok_or(Error::PeerClosed)?;
                match fill_until(stream, buf, socks5::greeting_len_hint)? {
                    FillOutcome::Pending => Ok(false),
                    FillOutcome::Closed => Err(Error::PeerClosed),
                    FillOutcome::Complete => {
                        if buf[0] != socks5::SOCKS_VERSION {
                            return Err(Error::protocol("unsupported SOCKS version in greeting"));
                        }
                        let reply = vec![socks5::SOCKS_VERSION, socks5::METHOD_NO_AUTH];
                        session.phase = LocalPhase::GreetingReply { buf: reply, pos: 0 };
                        self.reactor
                            .reregister(stream, session.client_token, Interest::WRITABLE)?;
                        Ok(true)
                    }
                }
            }
            (LocalPhase::GreetingReply { buf, pos }, Side::Client) => {
                let stream = ctx.client.as_mut().ok_or(Error::PeerClosed)?;
                if write_all_nonblocking(stream, buf, pos)? {
                    session.phase = LocalPhase::Request { buf: Vec::new() };
                    self.reactor
                        .reregister(stream, session.client_token, Interest::READABLE)?;
                    Ok(true)
                } else {
                    Ok(false)
                }
            }
            (LocalPhase::Request { buf }, Side::Client) => {
                let stream = ctx.client.as_mut().ok_or(Error::PeerClosed)?;
                match fill_until(stream, buf, socks5::request_len_hint)? {
                    FillOutcome::Pending => Ok(false),
                    FillOutcome::Closed => Err(Error::PeerClosed),
                    FillOutcome::Complete => {
                        if buf[1] != socks5::CMD_CONNECT {
                            warn!(cmd = buf[1], "rejecting unsupported SOCKS5 command");
                            let bound = self.listener.local_addr().map_err(Error::Io)?;
                            let reply =
                                socks5::encode_reply(socks5::REP_COMMAND_NOT_SUPPORTED, bound);
                            session.phase = LocalPhase::RejectRequest { buf: reply, pos: 0 };
                            self.reactor
                                .reregister(stream, session.client_token, Interest::WRITABLE)?;
                            return Ok(true);
                        }
                        let (request, _) = socks5::parse_request(buf)?;
                        let remote_addr = (self.config.server_host.as_str(), self.config.server_port)
                            .to_socket_addrs()
                            .map_err(|e| Error::startup(format!("can't resolve remote proxy: {e}")))?
                            .next()
                            .ok_or_else(|| Error::startup("remote proxy address resolved to nothing"))?;

                        let mut remote = TcpStream::connect(remote_addr).map_err(Error::Io)?;
                        let remote_token = self.reactor.register(
                            &mut remote,
                            key,
                            Side::Remote,
                            Interest::WRITABLE,
                        )?;
                        ctx.remote = Some(remote);
                        ctx.mask |= crate::context::MASK_REMOTE;
                        session.remote_token = Some(remote_token);
                        session.phase = LocalPhase::Connecting {
                            address: request.address,
                        };
                        Ok(false)
                    }
                }
            }
            (LocalPhase::Connecting { address }, Side::Remote) => {
                let remote = ctx.remote.as_mut().ok_or(Error::PeerClosed)?;
                if let Some(e) = remote.take_error()? {
                    return Err(e.into());
                }
                let frame = handshake::build_client_frame(
                    self.handshake_key,
                    &self.config.username,
                    address,
                )?;
                session.phase = LocalPhase::SendHandshake {
                    frame: frame.to_vec(),
                    pos: 0,
                };
                Ok(true)
            }
            (LocalPhase::SendHandshake { frame, pos }, Side::Remote) => {
                let remote = ctx.remote.as_mut().ok_or(Error::PeerClosed)?;
                if write_all_nonblocking(remote, frame, pos)? {
                    session.phase = LocalPhase::RecvReply { buf: Vec::new() };
                    self.reactor.reregister(
                        remote,
                        session.remote_token.expect("remote registered"),
                        Interest::READABLE,
                    )?;
                    Ok(true)
                } else {
                    Ok(false)
                }
            }
            (LocalPhase::RecvReply { buf }, Side::Remote) => {
                let remote = ctx.remote.as_mut().ok_or(Error::PeerClosed)?;
                match fill_until(remote, buf, |_| Some(HANDSHAKE_REPLY_SIZE))? {
                    FillOutcome::Pending => Ok(false),
                    FillOutcome::Closed => Err(Error::PeerClosed),
                    FillOutcome::Complete => {
                        let frame: [u8; HANDSHAKE_REPLY_SIZE] =
                            buf[..HANDSHAKE_REPLY_SIZE].try_into().unwrap();
                        let material = handshake::parse_server_reply(self.handshake_key, &frame);
                        // Mirror e_iv/d_iv: the remote proxy generated this
                        // material from its own point of view, so the
                        // local side's encrypt cursor must start from the
                        // remote's decrypt IV and vice versa.
                        let mut mirrored = material;
                        mirrored[0..16].copy_from_slice(&material[16..32]);
                        mirrored[16..32].copy_from_slice(&material[0..16]);
                        ctx.crypto.init_session_keys(&mirrored);

                        let bound = remote.local_addr().map_err(Error::Io)?;
                        let reply = socks5::encode_reply(socks5::REP_SUCCEEDED, bound);
                        session.phase = LocalPhase::SendSocksReply {
                            buf: reply,
                            pos: 0,
                        };
                        Ok(true)
                    }
                }
            }
            (LocalPhase::SendSocksReply { buf, pos }, Side::Client) => {
                let client = ctx.client.as_mut().ok_or(Error::PeerClosed)?;
                if write_all_nonblocking(client, buf, pos)? {
                    session.phase = LocalPhase::Relaying;
                    self.reactor
                        .reregister(client, session.client_token, Interest::READABLE)?;
                    Ok(true)
                } else {
                    Ok(false)
                }
            }
            (LocalPhase::SendSocksReply { .. }, Side::Remote) => Ok(false),
            (LocalPhase::RejectRequest { buf, pos }, Side::Client) => {
                let client = ctx.client.as_mut().ok_or(Error::PeerClosed)?;
                if write_all_nonblocking(client, buf, pos)? {
                    Err(Error::protocol("rejected unsupported SOCKS5 command"))
                } else {
                    Ok(false)
                }
            }
            _ => Ok(false),
        }
    }

    fn step_relay(&mut self, key: ContextKey) -> Result<()> {
        let ctx = self.pool.lookup_mut(key).ok_or(Error::PeerClosed)?;
        let c2r = relay::pump(ctx, Direction::ClientToRemote)?;
        let r2c = relay::pump(ctx, Direction::RemoteToClient)?;

        if c2r.source_closed {
            ctx.set_client_eof();
            if let Some(remote) = ctx.remote.as_ref() {
                let _ = remote.shutdown(Shutdown::Write);
            }
        }
        if r2c.source_closed {
            ctx.set_remote_eof();
            if let Some(client) = ctx.client.as_ref() {
                let _ = client.shutdown(Shutdown::Write);
            }
        }

        if ctx.client_eof() && ctx.remote_eof() {
            self.close_session(key);
            return Ok(());
        }

        let session = self.sessions.get(&key).ok_or(Error::PeerClosed)?;
        let ctx = self.pool.lookup_mut(key).ok_or(Error::PeerClosed)?;

        let client_interest = interest_from(c2r.want_source_read, r2c.want_sink_write);
        if let (Some(client), Some(interest)) = (ctx.client.as_mut(), client_interest) {
            self.reactor
                .reregister(client, session.client_token, interest)?;
        }
        let remote_interest = interest_from(r2c.want_source_read, c2r.want_sink_write);
        if let (Some(remote), Some(interest), Some(token)) =
            (ctx.remote.as_mut(), remote_interest, session.remote_token)
        {
            self.reactor.reregister(remote, token, interest)?;
        }

        Ok(())
    }

    fn close_session(&mut self, key: ContextKey) {
        if let Some(session) = self.sessions.remove(&key) {
            if let Some(ctx) = self.pool.lookup_mut(key) {
                if let Some(client) = ctx.client.as_mut() {
                    let _ = self.reactor.deregister(client, session.client_token);
                }
                if let (Some(remote), Some(token)) = (ctx.remote.as_mut(), session.remote_token) {
                    let _ = self.reactor.deregister(remote, token);
                }
            }
        }
        self.pool.release(key);
    }
}
