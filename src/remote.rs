//! `fakio-server`'s connection state machine (`spec.md` §4.g, §4.i):
//! receive the tunnel handshake frame, authenticate the user, dial the
//! real destination, reply with the session keys, then hand off into
//! the relay. A 10-second timer bounds how long an accepted connection
//! may sit mid-handshake before its context is reclaimed.

use std::collections::HashMap;
use std::net::{Shutdown, SocketAddr, ToSocketAddrs};
use std::rc::Rc;
use std::time::{Duration, Instant};

use mio::net::{TcpListener, TcpStream};
use mio::{Interest, Token};
use rand::RngCore;
use socket2::{Domain, Socket, Type};
use tracing::{debug, info, warn};

use crate::buffer::HANDSHAKE_SIZE;
use crate::config::ServerConfig;
use crate::context::{ContextKey, ContextPool, Role, Side};
use crate::crypto::{CryptoState, SESSION_KEY_MATERIAL_LEN};
use crate::error::{Error, Result};
use crate::handshake;
use crate::reactor::{Reactor, Subject};
use crate::relay::{self, Direction};
use crate::socks5::Address;
use crate::user::UserDirectory;
use crate::wire::{fill_until, write_all_nonblocking, FillOutcome};

const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

enum RemotePhase {
    RecvFrame { buf: Vec<u8> },
    Connecting { handshake_key: [u8; 32] },
    SendReply { buf: Vec<u8>, pos: usize },
    Relaying,
}

struct Session {
    client_token: Token,
    remote_token: Option<Token>,
    phase: RemotePhase,
}

pub struct RemoteProxy {
    listener: TcpListener,
    reactor: Reactor,
    pool: ContextPool,
    sessions: HashMap<ContextKey, Session>,
    users: Rc<UserDirectory>,
}

impl RemoteProxy {
    pub fn bind(config: ServerConfig) -> Result<Self> {
        let addr: SocketAddr = format!("{}:{}", config.host, config.port)
            .parse()
            .map_err(|e| Error::startup(format!("invalid server listen address: {e}")))?;
        let mut listener = bind_reuseaddr(addr)?;

        let mut reactor = Reactor::new(256)?;
        reactor.register_listener(&mut listener, Interest::READABLE)?;

        let users = Rc::new(UserDirectory::from_config(config.users));
        info!(%addr, users = users.len(), "fakio-server listening");

        Ok(Self {
            listener,
            reactor,
            pool: ContextPool::new(100),
            sessions: HashMap::new(),
            users,
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
            for (_token, key) in outcome.timers {
                self.handle_timeout(key);
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

            let key = match self.pool.get(Role::Remote) {
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

            let timer = self
                .reactor
                .schedule_timer(Instant::now(), HANDSHAKE_TIMEOUT, key);

            let ctx = self.pool.lookup_mut(key).expect("just allocated");
            ctx.client = Some(stream);
            ctx.mask |= crate::context::MASK_CLIENT;
            ctx.handshake_timer = Some(timer);

            self.sessions.insert(
                key,
                Session {
                    client_token,
                    remote_token: None,
                    phase: RemotePhase::RecvFrame { buf: Vec::new() },
                },
            );
            debug!(%peer, "accepted tunnel connection, awaiting handshake");
        }
    }

    fn handle_timeout(&mut self, key: ContextKey) {
        if self.sessions.contains_key(&key) {
            warn!("handshake timed out, releasing context");
            self.close_session(key);
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

    fn step(&mut self, key: ContextKey, side: Side) -> Result<bool> {
        let is_relaying = matches!(
            self.sessions.get(&key).map(|s| &s.phase),
            Some(RemotePhase::Relaying)
        );
        if is_relaying {
            self.step_relay(key)?;
            return Ok(false);
        }

        let session = self.sessions.get_mut(&key).ok_or(Error::PeerClosed)?;
        let ctx = self.pool.lookup_mut(key).ok_or(Error::PeerClosed)?;

        match (&mut session.phase, side) {
            (RemotePhase::RecvFrame { buf }, Side::Client) => {
                let stream = ctx.client.as_mut().ok_or(Error::PeerClosed)?;
                match fill_until(stream, buf, |_| Some(HANDSHAKE_SIZE))? {
                    FillOutcome::Pending => Ok(false),
                    FillOutcome::Closed => Err(Error::PeerClosed),
                    FillOutcome::Complete => {
                        let frame = &buf[..HANDSHAKE_SIZE];
                        let username = handshake::peek_username(frame)?;
                        let user = self
                            .users
                            .find(&username)
                            .ok_or_else(|| Error::protocol("unknown user"))?
                            .clone();
                        let handshake_key = user.handshake_key();
                        let (_username, address) = handshake::parse_client_frame(handshake_key, frame)?;

                        if let Some(timer) = ctx.handshake_timer.take() {
                            self.reactor.cancel_timer(timer);
                        }
                        ctx.crypto = CryptoState::new(handshake_key);
                        ctx.user = Some(Rc::new(user));

                        let dest_addr = resolve_address(&address)?;
                        let mut remote = TcpStream::connect(dest_addr).map_err(Error::Io)?;
                        let remote_token = self.reactor.register(
                            &mut remote,
                            key,
                            Side::Remote,
                            Interest::WRITABLE,
                        )?;
                        ctx.remote = Some(remote);
                        ctx.mask |= crate::context::MASK_REMOTE;
                        session.remote_token = Some(remote_token);
                        session.phase = RemotePhase::Connecting { handshake_key };
                        Ok(false)
                    }
                }
            }
            (RemotePhase::Connecting { handshake_key }, Side::Remote) => {
                let remote = ctx.remote.as_mut().ok_or(Error::PeerClosed)?;
                if let Some(e) = remote.take_error()? {
                    return Err(e.into());
                }

                let mut material = [0u8; SESSION_KEY_MATERIAL_LEN];
                rand::thread_rng().fill_bytes(&mut material);
                ctx.crypto.init_session_keys(&material);

                let reply = handshake::build_server_reply(*handshake_key, &material);
                session.phase = RemotePhase::SendReply {
                    buf: reply.to_vec(),
                    pos: 0,
                };
                let client = ctx.client.as_mut().ok_or(Error::PeerClosed)?;
                self.reactor
                    .reregister(client, session.client_token, Interest::WRITABLE)?;
                Ok(false)
            }
            (RemotePhase::SendReply { buf, pos }, Side::Client) => {
                let client = ctx.client.as_mut().ok_or(Error::PeerClosed)?;
                if write_all_nonblocking(client, buf, pos)? {
                    session.phase = RemotePhase::Relaying;
                    self.reactor
                        .reregister(client, session.client_token, Interest::READABLE)?;
                    if let (Some(remote), Some(token)) =
                        (ctx.remote.as_mut(), session.remote_token)
                    {
                        self.reactor.reregister(remote, token, Interest::READABLE)?;
                    }
                    Ok(true)
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

        let client_interest = relay::interest_from(c2r.want_source_read, r2c.want_sink_write);
        if let (Some(client), Some(interest)) = (ctx.client.as_mut(), client_interest) {
            self.reactor
                .reregister(client, session.client_token, interest)?;
        }
        let remote_interest = relay::interest_from(r2c.want_source_read, c2r.want_sink_write);
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
                if let Some(timer) = ctx.handshake_timer.take() {
                    self.reactor.cancel_timer(timer);
                }
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

fn resolve_address(address: &Address) -> Result<SocketAddr> {
    match address {
        Address::Ip(addr) => Ok(*addr),
        Address::Domain(domain, port) => (domain.as_str(), *port)
            .to_socket_addrs()
            .map_err(|e| Error::startup(format!("can't resolve {domain}: {e}")))?
            .next()
            .ok_or_else(|| Error::startup(format!("domain {domain} resolved to nothing"))),
    }
}
