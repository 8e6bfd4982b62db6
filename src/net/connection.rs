use crate::logging::{self, Logger};
use crate::net::buffer::Buffer;
use crate::net::message::{Message, MessageHeader, MessageId, OwnedMessage};
use crate::net::queue::BlockingQueue;
use crate::net::reactor::{Command, PumpHandle};
use crate::net::shared::{lock, ErrorType, NetworkError, NetworkResult};
use byteorder::{ByteOrder, LittleEndian};
use mio::net::TcpStream;
use mio::{Poll, PollOpt, Ready, Token};
use std::collections::VecDeque;
use std::io;
use std::net::Shutdown;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, Weak};

const READ_BUF_SIZE: usize = 65536;
const WRITE_BUF_SIZE: usize = 8 * 65536;

const HANDSHAKE_WIRE_SIZE: usize = 8;
const SCRAMBLE_XOR_IN: u64 = 0xDEAD_BEEF_C0DE_CAFE;
const SCRAMBLE_XOR_OUT: u64 = 0xC0DE_FACE_1234_5678;

/// The challenge transform both peers must agree on. This is obfuscation, not
/// authentication: it only proves the peer runs the same library build.
///
/// The nibble-swap masks deliberately leave the top byte out, so the high
/// byte of every result comes from the two XOR constants alone. Wire
/// compatibility requires reproducing that bit-for-bit.
#[inline]
pub(crate) fn scramble(input: u64) -> u64 {
    let out = input ^ SCRAMBLE_XOR_IN;
    let out = ((out & 0x00F0_F0F0_F0F0_F0F0) >> 4) | ((out & 0x000F_0F0F_0F0F_0F0F) << 4);
    out ^ SCRAMBLE_XOR_OUT
}

/// Which side of the exchange a connection sits on. Set at construction,
/// immutable afterwards.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Role {
    Server,
    Client,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
enum Phase {
    Unstarted,
    Connecting,
    HandshakeServer,
    HandshakeClient,
    Established,
    Closed,
}

/// The partially-read inbound message currently being assembled.
struct Staging<T: MessageId> {
    msg: Message<T>,
    filled: usize,
}

/// Protocol state. Touched only from the reactor worker thread; the mutex in
/// `Connection` is uncontended and exists to make the handle shareable.
struct Io<T: MessageId> {
    stream: TcpStream,
    phase: Phase,
    slot: usize,

    // Handshake words: the value sent, the value received, and (server side)
    // the expected scrambled reply.
    handshake_out: u64,
    handshake_in: u64,
    handshake_check: u64,

    // Outbound frames. At most the front message is staged into the write
    // buffer at any time; `front_staged` counts its header+body bytes already
    // copied. The queue's emptiness is the writer-idle latch.
    outbound: VecDeque<Message<T>>,
    front_staged: usize,

    rbuf: Buffer,
    wbuf: Buffer,
    staging: Option<Staging<T>>,

    log: Logger,
}

/// Per-peer protocol engine. Owns one stream socket and a per-connection
/// outbound queue, shares the owning endpoint's inbox, and drives the
/// handshake plus message framing in both directions.
///
/// All mutation happens on the endpoint's reactor thread; `send` and
/// `disconnect` only post work onto it and are safe from any thread.
pub struct Connection<T: MessageId> {
    role: Role,
    id: AtomicU32,
    connected: AtomicBool,
    inbox: Arc<BlockingQueue<OwnedMessage<T>>>,
    pump: PumpHandle<T>,
    self_ref: Weak<Connection<T>>,
    io: Mutex<Io<T>>,
}

impl<T: MessageId> Connection<T> {
    pub(crate) fn create(
        role: Role,
        stream: TcpStream,
        inbox: Arc<BlockingQueue<OwnedMessage<T>>>,
        pump: PumpHandle<T>,
        log: &Logger,
    ) -> Arc<Connection<T>> {
        Arc::new_cyclic(|self_ref| Connection {
            role,
            id: AtomicU32::new(0),
            connected: AtomicBool::new(true),
            inbox,
            pump,
            self_ref: self_ref.clone(),
            io: Mutex::new(Io {
                stream,
                phase: Phase::Unstarted,
                slot: 0,
                handshake_out: 0,
                handshake_in: 0,
                handshake_check: 0,
                outbound: VecDeque::new(),
                front_staged: 0,
                rbuf: Buffer::new(READ_BUF_SIZE),
                wbuf: Buffer::new(WRITE_BUF_SIZE),
                staging: None,
                log: log.new(logging::o!()),
            }),
        })
    }

    /// The id assigned by the server, or 0 on the client side.
    #[inline]
    pub fn id(&self) -> u32 {
        self.id.load(Ordering::Relaxed)
    }

    /// Connectivity hint: true iff the socket has not been closed. Permitted
    /// to be racy.
    #[inline]
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    /// Queues a message for transmission. Posts work onto the reactor; no
    /// result is reported back.
    pub fn send(&self, msg: Message<T>) {
        if let Some(conn) = self.self_ref.upgrade() {
            self.pump.post(Command::Send(conn, msg));
        }
    }

    /// Posts a socket close onto the reactor. Idempotent.
    pub fn disconnect(&self) {
        if let Some(conn) = self.self_ref.upgrade() {
            self.pump.post(Command::Disconnect(conn));
        }
    }
}

// Reactor-side operations. Everything below runs on the endpoint's worker
// thread only.
impl<T: MessageId> Connection<T> {
    /// Server side: stores the assigned id and opens the handshake by
    /// writing the challenge. The scrambled reply is awaited via readiness.
    pub(crate) fn connect_to_client(&self, id: u32) {
        let mut guard = lock(&self.io);
        let io = &mut *guard;

        self.id.store(id, Ordering::Relaxed);
        io.log = io.log.new(logging::o!("conn_id" => id));

        io.handshake_out = rand::random::<u64>();
        io.handshake_check = scramble(io.handshake_out);
        io.phase = Phase::HandshakeServer;

        let mut word = [0u8; HANDSHAKE_WIRE_SIZE];
        LittleEndian::write_u64(&mut word, io.handshake_out);
        io.wbuf.extend(&word);

        logging::debug!(io.log, "challenge issued"; "context" => "handshake");
    }

    /// Client side: marks the non-blocking connect as in flight. Completion
    /// is observed on the first writable readiness event.
    pub(crate) fn connect_to_server(&self) {
        let mut guard = lock(&self.io);
        let io = &mut *guard;
        io.phase = Phase::Connecting;
        logging::debug!(io.log, "connecting"; "context" => "connect");
    }

    pub(crate) fn register(&self, slot: usize, token: Token, poll: &Poll) -> io::Result<()> {
        let mut guard = lock(&self.io);
        let io = &mut *guard;
        io.slot = slot;
        poll.register(
            &io.stream,
            token,
            Ready::readable() | Ready::writable(),
            PollOpt::edge(),
        )
    }

    pub(crate) fn deregister(&self, poll: &Poll) -> io::Result<()> {
        let io = lock(&self.io);
        poll.deregister(&io.stream)
    }

    pub(crate) fn slot(&self) -> usize {
        lock(&self.io).slot
    }

    /// Drives the protocol on a readiness event. Returns true when the
    /// server-side handshake has just completed so the endpoint can notify
    /// the application. A fatal error leaves the connection ready to be
    /// closed by the caller.
    pub(crate) fn ready(&self, readable: bool, writable: bool) -> NetworkResult<bool> {
        let mut guard = lock(&self.io);
        let io = &mut *guard;
        let mut validated = false;

        if io.phase == Phase::Closed {
            return Ok(false);
        }

        if io.phase == Phase::Connecting && (readable || writable) {
            self.finish_connect(io)?;
        }

        if readable && io.phase != Phase::Connecting && io.phase != Phase::Unstarted {
            match io.rbuf.ingress(&mut io.stream) {
                Ok(_) => self.drain_read(io, &mut validated)?,
                Err(err) => {
                    // A closed peer may have flushed messages right before
                    // going away; parse what arrived before reporting.
                    if err.kind() == io::ErrorKind::UnexpectedEof {
                        self.drain_read(io, &mut validated)?;
                    }
                    return Err(err.into());
                }
            }
        }

        io.stage_outbound();
        io.flush()?;

        Ok(validated)
    }

    /// Reactor-side half of `send`: push onto the outbound queue and move as
    /// much as possible towards the socket.
    pub(crate) fn queue(&self, msg: Message<T>) -> NetworkResult<()> {
        let mut guard = lock(&self.io);
        let io = &mut *guard;

        if io.phase == Phase::Closed {
            logging::trace!(io.log, "send on closed connection dropped"; "context" => "send");
            return Ok(());
        }

        io.outbound.push_back(msg);
        io.stage_outbound();
        io.flush()
    }

    /// Pushes any staged output towards the socket. Used right after the
    /// handshake challenge is queued, before the first readiness event.
    pub(crate) fn flush_pending(&self) -> NetworkResult<()> {
        let mut guard = lock(&self.io);
        let io = &mut *guard;

        if io.phase == Phase::Closed {
            return Ok(());
        }

        io.stage_outbound();
        io.flush()
    }

    /// Closes the socket and drops all buffered state. Terminal and
    /// idempotent; the endpoint observes the connection as disconnected on
    /// its next touch.
    pub(crate) fn close(&self) {
        let mut guard = lock(&self.io);
        let io = &mut *guard;

        if io.phase == Phase::Closed {
            return;
        }

        logging::debug!(io.log, "closing connection";
                        "context" => "close",
                        "queued" => io.outbound.len(),
                        "read_buffered" => io.rbuf.len(),
                        "write_buffered" => io.wbuf.len());

        io.phase = Phase::Closed;
        self.connected.store(false, Ordering::Release);

        let _ = io.stream.shutdown(Shutdown::Both);

        io.outbound.clear();
        io.front_staged = 0;
        io.staging = None;
        io.rbuf.clear();
        io.wbuf.clear();
    }

    fn finish_connect(&self, io: &mut Io<T>) -> NetworkResult<()> {
        if let Some(err) = io.stream.take_error().map_err(NetworkError::from)? {
            logging::debug!(io.log, "connect failed"; "context" => "connect", "error" => %err);
            return Err(NetworkError::Fatal(ErrorType::ConnectFailed));
        }

        match io.stream.peer_addr() {
            Ok(peer) => {
                io.phase = Phase::HandshakeClient;
                logging::debug!(io.log, "connected, awaiting challenge";
                                "context" => "connect",
                                "peer" => %peer);
                Ok(())
            }
            // The connect is still in flight; stay put until the next event.
            Err(ref err) if err.kind() == io::ErrorKind::NotConnected => Ok(()),
            Err(err) => {
                logging::debug!(io.log, "connect failed"; "context" => "connect", "error" => %err);
                Err(NetworkError::Fatal(ErrorType::ConnectFailed))
            }
        }
    }

    /// Consumes buffered inbound bytes: handshake words first, then framed
    /// messages, which are published to the inbox as they complete.
    fn drain_read(&self, io: &mut Io<T>, validated: &mut bool) -> NetworkResult<()> {
        loop {
            match io.phase {
                Phase::HandshakeServer => {
                    if io.rbuf.len() < HANDSHAKE_WIRE_SIZE {
                        break;
                    }

                    io.handshake_in = LittleEndian::read_u64(io.rbuf.as_slice());
                    io.rbuf.advance(HANDSHAKE_WIRE_SIZE);

                    if io.handshake_in != io.handshake_check {
                        logging::info!(io.log, "handshake reply mismatch, rejecting";
                                       "context" => "handshake");
                        return Err(NetworkError::Fatal(ErrorType::HandshakeFailed));
                    }

                    io.phase = Phase::Established;
                    *validated = true;
                    logging::info!(io.log, "client validated"; "context" => "handshake");
                }
                Phase::HandshakeClient => {
                    if io.rbuf.len() < HANDSHAKE_WIRE_SIZE {
                        break;
                    }

                    io.handshake_in = LittleEndian::read_u64(io.rbuf.as_slice());
                    io.rbuf.advance(HANDSHAKE_WIRE_SIZE);
                    io.handshake_out = scramble(io.handshake_in);

                    let mut word = [0u8; HANDSHAKE_WIRE_SIZE];
                    LittleEndian::write_u64(&mut word, io.handshake_out);
                    io.wbuf.extend(&word);

                    io.phase = Phase::Established;
                    logging::debug!(io.log, "challenge answered"; "context" => "handshake");
                }
                Phase::Established => match io.staging.take() {
                    None => {
                        if io.rbuf.len() < MessageHeader::<T>::WIRE_SIZE {
                            break;
                        }

                        let header = MessageHeader::decode(io.rbuf.as_slice());
                        io.rbuf.advance(MessageHeader::<T>::WIRE_SIZE);

                        let size = header.size as usize;
                        if size == 0 {
                            self.publish(
                                io,
                                Message {
                                    header,
                                    body: Vec::new(),
                                },
                            );
                        } else {
                            io.staging = Some(Staging {
                                msg: Message {
                                    header,
                                    body: vec![0; size],
                                },
                                filled: 0,
                            });
                        }
                    }
                    Some(mut staging) => {
                        if io.rbuf.is_empty() {
                            io.staging = Some(staging);
                            break;
                        }

                        let want = staging.msg.body.len() - staging.filled;
                        let take = want.min(io.rbuf.len());

                        staging.msg.body[staging.filled..staging.filled + take]
                            .copy_from_slice(&io.rbuf.as_slice()[..take]);
                        io.rbuf.advance(take);
                        staging.filled += take;

                        if staging.filled == staging.msg.body.len() {
                            self.publish(io, staging.msg);
                        } else {
                            io.staging = Some(staging);
                            break;
                        }
                    }
                },
                Phase::Unstarted | Phase::Connecting | Phase::Closed => break,
            }
        }

        Ok(())
    }

    fn publish(&self, io: &mut Io<T>, msg: Message<T>) {
        logging::trace!(io.log, "message received";
                        "context" => "read",
                        "msg_id" => msg.header.id.to_wire(),
                        "size" => msg.header.size);

        let remote = match self.role {
            Role::Server => self.self_ref.upgrade(),
            Role::Client => None,
        };

        self.inbox.push_back(OwnedMessage { remote, msg });
    }
}

impl<T: MessageId> Io<T> {
    /// Copies queued messages into the write buffer, front message first and
    /// one at a time, stopping at the buffer's soft capacity. Never runs
    /// before the connection is established so frame bytes cannot interleave
    /// with handshake words.
    fn stage_outbound(&mut self) {
        if self.phase != Phase::Established {
            return;
        }

        loop {
            let front = match self.outbound.front() {
                Some(front) => front,
                None => break,
            };
            let total = MessageHeader::<T>::WIRE_SIZE + front.body.len();

            if self.front_staged == 0 {
                if self.wbuf.len() >= WRITE_BUF_SIZE {
                    break;
                }
                self.wbuf.extend(&front.header.encode());
                self.front_staged = MessageHeader::<T>::WIRE_SIZE;
            }

            let body_at = self.front_staged - MessageHeader::<T>::WIRE_SIZE;
            let room = WRITE_BUF_SIZE.saturating_sub(self.wbuf.len());
            let take = (front.body.len() - body_at).min(room);

            self.wbuf.extend(&front.body[body_at..body_at + take]);
            self.front_staged += take;

            if self.front_staged == total {
                self.outbound.pop_front();
                self.front_staged = 0;
            } else {
                break;
            }
        }
    }

    fn flush(&mut self) -> NetworkResult<()> {
        if self.wbuf.is_empty() {
            return Ok(());
        }

        self.wbuf.egress(&mut self.stream)?;
        Ok(())
    }
}
