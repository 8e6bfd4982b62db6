use crate::logging::{self, Logger};
use crate::net::connection::Connection;
use crate::net::message::{Message, MessageId};
use crate::net::shared::{lock, ErrorUtils, NetworkError};
use mio::{Events, Poll, PollOpt, Ready, Registration, SetReadiness, Token};
use std::collections::VecDeque;
use std::io;
use std::sync::{Arc, Mutex};

/// Token reserved for the server's acceptor.
pub(crate) const ACCEPT_TOKEN: Token = Token(0);
/// Token reserved for the cross-thread waker.
const WAKE_TOKEN: Token = Token(1);
/// Connection slots start above the reserved tokens.
const SLOT_TOKEN_BASE: usize = 2;

/// Work posted onto the reactor by other threads. All connection mutation
/// funnels through these so it only ever happens on the worker thread.
pub(crate) enum Command<T: MessageId> {
    Send(Arc<Connection<T>>, Message<T>),
    Disconnect(Arc<Connection<T>>),
    Shutdown,
}

/// The cross-thread half of the reactor: a command queue plus the readiness
/// handle that wakes the poll.
pub(crate) struct Pump<T: MessageId> {
    commands: Mutex<VecDeque<Command<T>>>,
    waker: SetReadiness,
}

pub(crate) type PumpHandle<T> = Arc<Pump<T>>;

impl<T: MessageId> Pump<T> {
    pub(crate) fn new(waker: SetReadiness) -> Pump<T> {
        Pump {
            commands: Mutex::new(VecDeque::new()),
            waker,
        }
    }

    pub(crate) fn post(&self, command: Command<T>) {
        lock(&self.commands).push_back(command);
        let _ = self.waker.set_readiness(Ready::readable());
    }
}

/// The single-threaded cooperative I/O driver an endpoint's worker thread
/// runs. Owns the poll, the token-to-connection registry and the command
/// queue; connections are registered edge-triggered for both directions and
/// detached (closed) on the first fatal error.
pub(crate) struct Reactor<T: MessageId> {
    poll: Poll,
    events: Events,
    pump: PumpHandle<T>,
    _waker: Registration,
    slots: Vec<Option<Arc<Connection<T>>>>,
    free: Vec<usize>,
    log: Logger,
}

impl<T: MessageId> Reactor<T> {
    pub(crate) fn new(log: &Logger) -> io::Result<Reactor<T>> {
        let poll = Poll::new()?;
        let (registration, set_readiness) = Registration::new2();

        poll.register(&registration, WAKE_TOKEN, Ready::readable(), PollOpt::edge())?;

        Ok(Reactor {
            poll,
            events: Events::with_capacity(1024),
            pump: Arc::new(Pump::new(set_readiness)),
            _waker: registration,
            slots: Vec::new(),
            free: Vec::new(),
            log: log.new(logging::o!()),
        })
    }

    pub(crate) fn pump(&self) -> PumpHandle<T> {
        Arc::clone(&self.pump)
    }

    pub(crate) fn poll(&self) -> &Poll {
        &self.poll
    }

    /// Registers a connection in a free slot, edge-triggered for both
    /// readiness directions.
    pub(crate) fn attach(&mut self, conn: Arc<Connection<T>>) -> io::Result<()> {
        let slot = match self.free.pop() {
            Some(slot) => slot,
            None => {
                self.slots.push(None);
                self.slots.len() - 1
            }
        };

        if let Err(err) = conn.register(slot, Token(slot + SLOT_TOKEN_BASE), &self.poll) {
            self.free.push(slot);
            return Err(err);
        }

        self.slots[slot] = Some(conn);
        Ok(())
    }

    /// Closes a connection and releases its slot. Safe to call for
    /// connections that were already detached.
    pub(crate) fn detach(&mut self, conn: &Arc<Connection<T>>) {
        let _ = conn.deregister(&self.poll);
        conn.close();

        let slot = conn.slot();
        let occupied = match self.slots.get(slot) {
            Some(Some(resident)) => Arc::ptr_eq(resident, conn),
            _ => false,
        };

        if occupied {
            self.slots[slot] = None;
            self.free.push(slot);
        }
    }

    /// Runs the event loop until a `Shutdown` command arrives. `accept` is
    /// invoked on acceptor readiness (servers register their listener under
    /// `ACCEPT_TOKEN`; clients never see it) and `validated` whenever a
    /// server-side handshake completes.
    pub(crate) fn run<A, V>(mut self, mut accept: A, validated: V)
    where
        A: FnMut(&mut Reactor<T>),
        V: Fn(&Arc<Connection<T>>),
    {
        loop {
            if let Err(err) = self.poll.poll(&mut self.events, None) {
                if err.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                logging::error!(self.log, "poll failed, stopping worker";
                                "context" => "run",
                                "error" => %err);
                break;
            }

            if self.drain_commands() {
                break;
            }

            let ready: Vec<(Token, Ready)> = self
                .events
                .iter()
                .map(|event| (event.token(), event.readiness()))
                .collect();

            for (token, readiness) in ready {
                match token {
                    WAKE_TOKEN => {}
                    ACCEPT_TOKEN => accept(&mut self),
                    token => self.dispatch(token, readiness, &validated),
                }
            }
        }

        self.close_all();
    }

    /// Executes all posted commands. Returns true when a shutdown was
    /// requested. The waker is cleared before the queue is drained so a post
    /// racing with the drain still wakes the next poll.
    fn drain_commands(&mut self) -> bool {
        let _ = self.pump.waker.set_readiness(Ready::empty());

        let commands: Vec<Command<T>> = lock(&self.pump.commands).drain(..).collect();

        for command in commands {
            match command {
                Command::Send(conn, msg) => {
                    if conn.queue(msg).has_failed() {
                        self.detach(&conn);
                    }
                }
                Command::Disconnect(conn) => self.detach(&conn),
                Command::Shutdown => return true,
            }
        }

        false
    }

    fn dispatch<V>(&mut self, token: Token, readiness: Ready, validated: &V)
    where
        V: Fn(&Arc<Connection<T>>),
    {
        let slot = usize::from(token) - SLOT_TOKEN_BASE;

        // Spurious events for recycled slots are ignored.
        let conn = match self.slots.get(slot) {
            Some(Some(conn)) => Arc::clone(conn),
            _ => return,
        };

        match conn.ready(readiness.is_readable(), readiness.is_writable()) {
            Ok(true) => validated(&conn),
            Ok(false) => {}
            Err(NetworkError::Wait) => {}
            Err(NetworkError::Fatal(kind)) => {
                logging::debug!(self.log, "connection failed";
                                "context" => "dispatch",
                                "conn_id" => conn.id(),
                                "error" => ?kind);
                self.detach(&conn);
            }
        }
    }

    fn close_all(&mut self) {
        for slot in &self.slots {
            if let Some(conn) = slot {
                conn.close();
            }
        }
        self.slots.clear();
        self.free.clear();
    }
}
