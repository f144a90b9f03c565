//! The event-driven I/O dispatcher (`spec.md` §4.c): a thin `mio` wrapper
//! that maps raw readiness tokens back to `(ContextKey, Side)` pairs and
//! folds the handshake timer wheel into the same poll iteration.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use mio::{Events, Interest, Poll, Token};

use crate::context::{ContextKey, Side};
use crate::error::{Error, Result};
use crate::timer::{TimerToken, TimerWheel};

/// Edge-triggered readiness for one registered source, collapsed from a
/// raw `mio::event::Event` into the four conditions the relay state
/// machine and handshake code actually branch on.
#[derive(Debug, Clone, Copy, Default)]
pub struct Readiness {
    pub readable: bool,
    pub writable: bool,
    /// Peer has shut down its write half (EOF on read).
    pub read_closed: bool,
    /// Peer has shut down its read half, or the socket errored.
    pub write_closed: bool,
}

/// What a registered source represents: either the listening socket (no
/// [`ContextKey`] yet exists for an unaccepted connection) or one side of
/// an in-flight tunnel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Subject {
    Listener,
    Conn(ContextKey, Side),
}

pub struct PollOutcome {
    pub io: Vec<(Subject, Readiness)>,
    pub timers: Vec<(TimerToken, ContextKey)>,
}

/// Wraps a single `mio::Poll` registry plus a one-shot timer wheel,
/// presenting both through one `poll` call the way the original C event
/// loop folds its epoll wait and its timer wheel into one `fev_loop`
/// iteration.
pub struct Reactor {
    poll: Poll,
    events: Events,
    next_token: usize,
    subscriptions: HashMap<Token, Subject>,
    timers: TimerWheel<ContextKey>,
}

impl Reactor {
    pub fn new(max_events_per_poll: usize) -> Result<Self> {
        let poll = Poll::new().map_err(Error::Io)?;
        Ok(Self {
            poll,
            events: Events::with_capacity(max_events_per_poll),
            next_token: 0,
            subscriptions: HashMap::new(),
            timers: TimerWheel::new(),
        })
    }

    fn next_token(&mut self) -> Token {
        let token = Token(self.next_token);
        self.next_token += 1;
        token
    }

    /// Register a socket for readiness events, returning the token to
    /// use for later `reregister`/`deregister` calls.
    pub fn register<S: mio::event::Source + ?Sized>(
        &mut self,
        source: &mut S,
        key: ContextKey,
        side: Side,
        interest: Interest,
    ) -> Result<Token> {
        self.register_subject(source, Subject::Conn(key, side), interest)
    }

    /// Register the listening socket, whose readiness events carry no
    /// `ContextKey` (the accepted connection doesn't have one yet).
    pub fn register_listener<S: mio::event::Source + ?Sized>(
        &mut self,
        source: &mut S,
        interest: Interest,
    ) -> Result<Token> {
        self.register_subject(source, Subject::Listener, interest)
    }

    fn register_subject<S: mio::event::Source + ?Sized>(
        &mut self,
        source: &mut S,
        subject: Subject,
        interest: Interest,
    ) -> Result<Token> {
        let token = self.next_token();
        self.poll
            .registry()
            .register(source, token, interest)
            .map_err(Error::Io)?;
        self.subscriptions.insert(token, subject);
        Ok(token)
    }

    pub fn reregister<S: mio::event::Source + ?Sized>(
        &mut self,
        source: &mut S,
        token: Token,
        interest: Interest,
    ) -> Result<()> {
        self.poll
            .registry()
            .reregister(source, token, interest)
            .map_err(Error::Io)
    }

    /// Deregister a socket. Must be called before the socket is dropped
    /// or handed off to a `ContextPool::release` (`spec.md` §4.d).
    pub fn deregister<S: mio::event::Source + ?Sized>(
        &mut self,
        source: &mut S,
        token: Token,
    ) -> Result<()> {
        self.poll.registry().deregister(source).map_err(Error::Io)?;
        self.subscriptions.remove(&token);
        Ok(())
    }

    pub fn schedule_timer(&mut self, now: Instant, delay: Duration, key: ContextKey) -> TimerToken {
        self.timers.schedule(now, delay, key)
    }

    pub fn cancel_timer(&mut self, token: TimerToken) -> bool {
        self.timers.cancel(token)
    }

    /// Block for at most `timeout` waiting for readiness, then drain any
    /// expired timers against the same `now`. A `None` timeout blocks
    /// indefinitely, matching `mio::Poll::poll`'s own contract.
    pub fn poll(&mut self, timeout: Option<Duration>) -> Result<PollOutcome> {
        self.poll
            .poll(&mut self.events, timeout)
            .map_err(Error::Io)?;

        let mut io = Vec::new();
        for event in self.events.iter() {
            let Some(&subject) = self.subscriptions.get(&event.token()) else {
                continue;
            };
            io.push((
                subject,
                Readiness {
                    readable: event.is_readable(),
                    writable: event.is_writable(),
                    read_closed: event.is_read_closed() || event.is_error(),
                    write_closed: event.is_write_closed() || event.is_error(),
                },
            ));
        }

        let timers = self.timers.drain_expired(Instant::now());

        Ok(PollOutcome { io, timers })
    }
}
