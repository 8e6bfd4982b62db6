use crate::logging::{self, Logger};
use crate::net::connection::{Connection, Role};
use crate::net::message::{Message, MessageId, OwnedMessage};
use crate::net::queue::BlockingQueue;
use crate::net::reactor::{Command, PumpHandle, Reactor, ACCEPT_TOKEN};
use crate::net::shared::{lock, ErrorType, ErrorUtils, NetworkError, NetworkResult};
use indexmap::IndexMap;
use mio::net::TcpListener;
use mio::{PollOpt, Ready};
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;

/// Client ids are assigned from here, counting up.
const FIRST_CLIENT_ID: u32 = 10000;

/// The application's capability set. The server never acts on a message or a
/// connectivity change itself; it routes everything through these hooks.
///
/// `on_client_connect` and `on_client_validated` run on the endpoint's worker
/// thread; `on_message` and `on_client_disconnect` run on whichever thread
/// drives `update` / `message_client` / `message_all_clients`.
pub trait ServerHandler<T: MessageId>: Send + Sync + 'static {
    /// Offered every freshly accepted connection. Return true to admit it;
    /// the default refuses everyone.
    fn on_client_connect(&self, _client: &Arc<Connection<T>>) -> bool {
        false
    }

    /// A client was found disconnected and removed from the active set.
    fn on_client_disconnect(&self, _client: &Arc<Connection<T>>) {}

    /// A message arrived from a validated client.
    fn on_message(&self, client: Arc<Connection<T>>, msg: Message<T>);

    /// A client passed the handshake.
    fn on_client_validated(&self, _client: &Arc<Connection<T>>) {}
}

struct ServerShared<T: MessageId, H> {
    handler: H,
    connections: Mutex<IndexMap<u32, Arc<Connection<T>>>>,
    next_id: AtomicU32,
    inbox: Arc<BlockingQueue<OwnedMessage<T>>>,
    log: Logger,
}

/// Server endpoint: owns the acceptor, the active-connection set and the
/// inbox, and drives its reactor on a dedicated worker thread.
pub struct Server<T: MessageId, H: ServerHandler<T>> {
    shared: Arc<ServerShared<T, H>>,
    port: u16,
    local_addr: Option<SocketAddr>,
    pump: Option<PumpHandle<T>>,
    worker: Option<thread::JoinHandle<()>>,
}

impl<T: MessageId, H: ServerHandler<T>> Server<T, H> {
    /// Constructs a server that will listen on `port` on the v4 wildcard
    /// address once started.
    pub fn new<'a, L: Into<Option<&'a Logger>>>(port: u16, handler: H, log: L) -> Server<T, H> {
        let log = match log.into() {
            Some(log) => log.new(logging::o!()),
            None => Logger::root(logging::Discard, logging::o!()),
        };

        Server {
            shared: Arc::new(ServerShared {
                handler,
                connections: Mutex::new(IndexMap::new()),
                next_id: AtomicU32::new(FIRST_CLIENT_ID),
                inbox: Arc::new(BlockingQueue::new()),
                log,
            }),
            port,
            local_addr: None,
            pump: None,
            worker: None,
        }
    }

    /// Binds the acceptor and spins up the worker thread. Fails with `Bind`
    /// when the listener cannot be constructed.
    pub fn start(&mut self) -> NetworkResult<()> {
        if self.worker.is_some() {
            return Ok(());
        }

        let addr = SocketAddr::from(([0, 0, 0, 0], self.port));
        let listener = match TcpListener::bind(&addr) {
            Ok(listener) => listener,
            Err(err) => {
                logging::error!(self.shared.log, "failed to bind acceptor";
                                "context" => "start",
                                "port" => self.port,
                                "error" => %err);
                return Err(NetworkError::Fatal(ErrorType::Bind));
            }
        };
        let local_addr = listener
            .local_addr()
            .map_err(|_| NetworkError::Fatal(ErrorType::Bind))?;

        let reactor = Reactor::new(&self.shared.log)?;
        reactor
            .poll()
            .register(&listener, ACCEPT_TOKEN, Ready::readable(), PollOpt::edge())
            .map_err(NetworkError::from)?;

        let pump = reactor.pump();
        let accept_shared = Arc::clone(&self.shared);
        let validated_shared = Arc::clone(&self.shared);

        let worker = thread::Builder::new()
            .name("netframe-server".into())
            .spawn(move || {
                reactor.run(
                    move |reactor| Self::accept_ready(&listener, reactor, &accept_shared),
                    move |conn| validated_shared.handler.on_client_validated(conn),
                )
            })
            .map_err(NetworkError::from)?;

        self.local_addr = Some(local_addr);
        self.pump = Some(pump);
        self.worker = Some(worker);

        logging::info!(self.shared.log, "server started"; "addr" => %local_addr);
        Ok(())
    }

    /// Stops the reactor and joins the worker thread. Idempotent; also run
    /// on drop.
    pub fn stop(&mut self) {
        if let Some(pump) = self.pump.take() {
            pump.post(Command::Shutdown);
        }

        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
            logging::info!(self.shared.log, "server stopped");
        }

        self.local_addr = None;
    }

    /// The address the acceptor is bound to, once started. Useful when
    /// constructed with port 0.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    /// Sends to one client if it is still connected; otherwise reports it
    /// disconnected and drops it from the active set. Dead connections are
    /// only ever discovered at send time.
    pub fn message_client(&self, client: &Arc<Connection<T>>, msg: Message<T>) {
        if client.is_connected() {
            client.send(msg);
        } else {
            lock(&self.shared.connections).shift_remove(&client.id());
            self.shared.handler.on_client_disconnect(client);
        }
    }

    /// Sends to every connected client except `ignore`, reporting and
    /// pruning any that turned out disconnected, in one pass.
    pub fn message_all_clients(&self, msg: &Message<T>, ignore: Option<&Arc<Connection<T>>>) {
        let mut dead = Vec::new();

        {
            let mut connections = lock(&self.shared.connections);
            connections.retain(|_, client| {
                if client.is_connected() {
                    let skip = ignore.map_or(false, |ignored| Arc::ptr_eq(client, ignored));
                    if !skip {
                        client.send(msg.clone());
                    }
                    true
                } else {
                    dead.push(Arc::clone(client));
                    false
                }
            });
        }

        // Invoked after the set lock is released so handlers may call back
        // into the server.
        for client in dead {
            self.shared.handler.on_client_disconnect(&client);
        }
    }

    /// Drains up to `max_messages` inbox entries through the handler. With
    /// `wait` set, blocks until the inbox is non-empty before draining.
    pub fn update(&self, max_messages: usize, wait: bool) {
        if wait {
            self.shared.inbox.wait();
        }

        let mut handled = 0;
        while handled < max_messages {
            let owned = match self.shared.inbox.pop_front() {
                Ok(owned) => owned,
                Err(_) => break,
            };

            if let Some(remote) = owned.remote {
                self.shared.handler.on_message(remote, owned.msg);
            }

            handled += 1;
        }
    }

    /// Accept-readiness handler, run on the worker thread. Accepts until the
    /// listener would block; the listener stays registered, so the server
    /// never stops listening even after accept errors.
    fn accept_ready(
        listener: &TcpListener,
        reactor: &mut Reactor<T>,
        shared: &Arc<ServerShared<T, H>>,
    ) {
        loop {
            match listener.accept() {
                Ok((stream, peer)) => {
                    logging::debug!(shared.log, "incoming connection";
                                    "context" => "accept",
                                    "peer" => %peer);

                    let conn = Connection::create(
                        Role::Server,
                        stream,
                        Arc::clone(&shared.inbox),
                        reactor.pump(),
                        &shared.log,
                    );

                    if !shared.handler.on_client_connect(&conn) {
                        logging::info!(shared.log, "connection denied";
                                       "context" => "accept",
                                       "peer" => %peer);
                        continue;
                    }

                    let id = shared.next_id.fetch_add(1, Ordering::Relaxed);
                    conn.connect_to_client(id);

                    if let Err(err) = reactor.attach(Arc::clone(&conn)) {
                        logging::warn!(shared.log, "connection registration failed";
                                       "context" => "accept",
                                       "conn_id" => id,
                                       "error" => %err);
                        conn.close();
                        continue;
                    }

                    lock(&shared.connections).insert(id, Arc::clone(&conn));

                    if conn.flush_pending().has_failed() {
                        reactor.detach(&conn);
                    }

                    logging::info!(shared.log, "connection approved";
                                   "context" => "accept",
                                   "conn_id" => id);
                }
                Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => break,
                Err(err) => {
                    logging::warn!(shared.log, "accept error";
                                   "context" => "accept",
                                   "error" => %err);
                    break;
                }
            }
        }
    }
}

impl<T: MessageId, H: ServerHandler<T>> Drop for Server<T, H> {
    fn drop(&mut self) {
        self.stop();
    }
}
