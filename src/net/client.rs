use crate::logging::{self, Logger};
use crate::net::connection::{Connection, Role};
use crate::net::message::{Message, MessageId, OwnedMessage};
use crate::net::queue::BlockingQueue;
use crate::net::reactor::{Command, PumpHandle, Reactor};
use crate::net::shared::{ErrorType, NetworkError, NetworkResult};
use mio::net::TcpStream;
use std::net::ToSocketAddrs;
use std::sync::Arc;
use std::thread;

/// Client endpoint: a single connection, its inbox, and the reactor worker
/// driving them. Convenience surface over `Connection`.
pub struct Client<T: MessageId> {
    connection: Option<Arc<Connection<T>>>,
    inbox: Arc<BlockingQueue<OwnedMessage<T>>>,
    pump: Option<PumpHandle<T>>,
    worker: Option<thread::JoinHandle<()>>,
    log: Logger,
}

impl<T: MessageId> Client<T> {
    pub fn new<'a, L: Into<Option<&'a Logger>>>(log: L) -> Client<T> {
        let log = match log.into() {
            Some(log) => log.new(logging::o!()),
            None => Logger::root(logging::Discard, logging::o!()),
        };

        Client {
            connection: None,
            inbox: Arc::new(BlockingQueue::new()),
            pump: None,
            worker: None,
            log,
        }
    }

    /// Resolves `host` and starts a non-blocking connect towards the first
    /// resolved address, spinning up the worker thread. Resolution and
    /// immediate transport failures surface here; a failure discovered after
    /// the connect is in flight shows up as `is_connected()` turning false.
    pub fn connect(&mut self, host: &str, port: u16) -> NetworkResult<()> {
        self.disconnect();

        let addr = (host, port)
            .to_socket_addrs()
            .map_err(|_| NetworkError::Fatal(ErrorType::Resolve))?
            .next()
            .ok_or(NetworkError::Fatal(ErrorType::Resolve))?;

        let stream =
            TcpStream::connect(&addr).map_err(|_| NetworkError::Fatal(ErrorType::ConnectFailed))?;

        let mut reactor = Reactor::new(&self.log)?;
        let pump = reactor.pump();

        let conn = Connection::create(
            Role::Client,
            stream,
            Arc::clone(&self.inbox),
            Arc::clone(&pump),
            &self.log,
        );
        conn.connect_to_server();

        reactor
            .attach(Arc::clone(&conn))
            .map_err(NetworkError::from)?;

        let worker = thread::Builder::new()
            .name("netframe-client".into())
            .spawn(move || reactor.run(|_| {}, |_| {}))
            .map_err(NetworkError::from)?;

        logging::info!(self.log, "client connecting"; "addr" => %addr);

        self.connection = Some(conn);
        self.pump = Some(pump);
        self.worker = Some(worker);

        Ok(())
    }

    /// Disconnects the connection (if any), stops the reactor and joins the
    /// worker. Idempotent; also run on drop.
    pub fn disconnect(&mut self) {
        if let Some(conn) = self.connection.take() {
            conn.disconnect();
        }

        if let Some(pump) = self.pump.take() {
            pump.post(Command::Shutdown);
        }

        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
            logging::info!(self.log, "client disconnected");
        }
    }

    /// Connectivity hint; true iff the underlying socket is open.
    pub fn is_connected(&self) -> bool {
        self.connection
            .as_ref()
            .map_or(false, |conn| conn.is_connected())
    }

    /// Sends a message to the server.
    pub fn send(&self, msg: Message<T>) {
        if let Some(conn) = &self.connection {
            conn.send(msg);
        }
    }

    /// The queue of messages received from the server, for the application
    /// to drain.
    pub fn incoming(&self) -> &BlockingQueue<OwnedMessage<T>> {
        &self.inbox
    }
}

impl<T: MessageId> Drop for Client<T> {
    fn drop(&mut self) {
        self.disconnect();
    }
}
