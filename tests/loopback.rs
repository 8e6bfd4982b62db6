//! End-to-end exercises over real loopback sockets: handshake, framing,
//! ordering and dead-client reaping, with a real worker thread per endpoint.

use netframe::net::{
    Client, Connection, Message, MessageId, OwnedMessage, Server, ServerHandler,
};
use std::io::{self, Read, Write};
use std::net::TcpStream;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

const DEADLINE: Duration = Duration::from_secs(5);

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
#[repr(u32)]
enum TestMsg {
    Ping = 0,
    Data = 1,
    Broadcast = 2,
}

impl MessageId for TestMsg {
    fn to_wire(self) -> u32 {
        self as u32
    }

    fn from_wire(raw: u32) -> TestMsg {
        match raw {
            0 => TestMsg::Ping,
            1 => TestMsg::Data,
            _ => TestMsg::Broadcast,
        }
    }
}

#[derive(Default)]
struct Recorder {
    connects: AtomicUsize,
    validated: Mutex<Vec<Arc<Connection<TestMsg>>>>,
    disconnects: Mutex<Vec<u32>>,
    messages: Mutex<Vec<(u32, Message<TestMsg>)>>,
}

struct RecordingHandler(Arc<Recorder>);

impl ServerHandler<TestMsg> for RecordingHandler {
    fn on_client_connect(&self, _client: &Arc<Connection<TestMsg>>) -> bool {
        self.0.connects.fetch_add(1, Ordering::SeqCst);
        true
    }

    fn on_client_disconnect(&self, client: &Arc<Connection<TestMsg>>) {
        self.0.disconnects.lock().unwrap().push(client.id());
    }

    fn on_message(&self, client: Arc<Connection<TestMsg>>, msg: Message<TestMsg>) {
        self.0.messages.lock().unwrap().push((client.id(), msg));
    }

    fn on_client_validated(&self, client: &Arc<Connection<TestMsg>>) {
        self.0.validated.lock().unwrap().push(Arc::clone(client));
    }
}

fn start_server() -> (Server<TestMsg, RecordingHandler>, Arc<Recorder>, u16) {
    let recorder = Arc::new(Recorder::default());
    let mut server = Server::new(0, RecordingHandler(Arc::clone(&recorder)), None);

    server.start().expect("server must start on an ephemeral port");
    let port = server.local_addr().expect("started server has an address").port();

    (server, recorder, port)
}

/// Polls `condition` until it holds or the deadline passes.
fn wait_until<F: FnMut() -> bool>(what: &str, mut condition: F) {
    let deadline = Instant::now() + DEADLINE;
    while !condition() {
        assert!(Instant::now() < deadline, "timed out waiting for {}", what);
        thread::sleep(Duration::from_millis(5));
    }
}

fn connect_client(port: u16, recorder: &Recorder, expected: usize) -> Client<TestMsg> {
    let mut client = Client::new(None);
    client
        .connect("127.0.0.1", port)
        .expect("loopback connect must start");
    wait_until("client validation", || {
        recorder.validated.lock().unwrap().len() >= expected
    });
    client
}

#[test]
fn empty_message_round_trip() {
    let (server, recorder, port) = start_server();
    let mut client = Client::new(None);
    client.connect("127.0.0.1", port).unwrap();

    client.send(Message::new(TestMsg::Ping));

    server.update(1, true);

    {
        let messages = recorder.messages.lock().unwrap();
        assert_eq!(messages.len(), 1);

        let (id, msg) = &messages[0];
        assert_eq!(*id, 10000);
        assert_eq!(msg.header.id, TestMsg::Ping);
        assert_eq!(msg.header.size, 0);
        assert!(msg.body.is_empty());
    }

    assert_eq!(recorder.connects.load(Ordering::SeqCst), 1);
    assert_eq!(recorder.validated.lock().unwrap().len(), 1);

    // Reply down the same connection; the client-side delivery carries no
    // remote handle.
    let conn = Arc::clone(&recorder.validated.lock().unwrap()[0]);
    let mut reply = Message::new(TestMsg::Data);
    reply.append(0x55AAu16);
    server.message_client(&conn, reply);

    wait_until("client reply", || !client.incoming().is_empty());

    let owned: OwnedMessage<TestMsg> = client.incoming().pop_front().unwrap();
    assert!(owned.remote.is_none());
    assert_eq!(owned.msg.header.id, TestMsg::Data);

    let mut msg = owned.msg;
    assert_eq!(msg.extract::<u16>().unwrap(), 0x55AA);

    client.disconnect();
}

#[test]
fn handshake_mismatch_closes_connection() {
    let (server, recorder, port) = start_server();

    let mut socket = TcpStream::connect(("127.0.0.1", port)).unwrap();
    socket.set_read_timeout(Some(DEADLINE)).unwrap();

    let mut challenge = [0u8; 8];
    socket.read_exact(&mut challenge).unwrap();

    // Echo the challenge verbatim instead of scrambling it.
    socket.write_all(&challenge).unwrap();

    let mut byte = [0u8; 1];
    match socket.read(&mut byte) {
        Ok(0) => {}
        Err(ref err) if err.kind() == io::ErrorKind::ConnectionReset => {}
        other => panic!("expected the server to close the socket, got {:?}", other),
    }

    assert_eq!(recorder.connects.load(Ordering::SeqCst), 1);
    assert!(recorder.validated.lock().unwrap().is_empty());
    assert!(recorder.messages.lock().unwrap().is_empty());

    drop(server);
}

#[test]
fn messages_arrive_in_send_order() {
    let (server, recorder, port) = start_server();
    let mut client = connect_client(port, &recorder, 1);

    for byte in 1u8..=3 {
        let mut msg = Message::new(TestMsg::Data);
        msg.append(byte);
        client.send(msg);
    }

    wait_until("three messages", || {
        server.update(usize::MAX, false);
        recorder.messages.lock().unwrap().len() >= 3
    });

    let messages = recorder.messages.lock().unwrap();
    let bodies: Vec<&[u8]> = messages.iter().map(|(_, msg)| &msg.body[..]).collect();
    assert_eq!(bodies, vec![&[1u8][..], &[2u8][..], &[3u8][..]]);

    drop(messages);
    client.disconnect();
}

#[test]
fn dead_clients_are_reaped_on_broadcast() {
    let (server, recorder, port) = start_server();

    let mut client_a = connect_client(port, &recorder, 1);
    let client_b = connect_client(port, &recorder, 2);

    let conn_a = Arc::clone(&recorder.validated.lock().unwrap()[0]);
    assert_eq!(conn_a.id(), 10000);

    // Kill A's socket and wait for the server's reactor to notice.
    client_a.disconnect();
    wait_until("server noticing the dead client", || !conn_a.is_connected());

    let mut msg = Message::new(TestMsg::Broadcast);
    msg.append(9u8);
    server.message_all_clients(&msg, None);

    assert_eq!(*recorder.disconnects.lock().unwrap(), vec![10000]);

    wait_until("broadcast delivery to B", || !client_b.incoming().is_empty());
    let owned = client_b.incoming().pop_front().unwrap();
    assert_eq!(owned.msg.header.id, TestMsg::Broadcast);
    assert_eq!(owned.msg.body, vec![9]);

    // A is gone from the active set: a second pass reports nothing new.
    server.message_all_clients(&Message::new(TestMsg::Ping), None);
    assert_eq!(*recorder.disconnects.lock().unwrap(), vec![10000]);

    wait_until("second broadcast delivery to B", || {
        !client_b.incoming().is_empty()
    });
}

#[test]
fn default_handler_denies_connections() {
    struct DenyAll;

    impl ServerHandler<TestMsg> for DenyAll {
        fn on_message(&self, _client: Arc<Connection<TestMsg>>, _msg: Message<TestMsg>) {}
    }

    let mut server = Server::new(0, DenyAll, None);
    server.start().unwrap();
    let port = server.local_addr().unwrap().port();

    let mut socket = TcpStream::connect(("127.0.0.1", port)).unwrap();
    socket.set_read_timeout(Some(DEADLINE)).unwrap();

    // No challenge is ever issued; the socket just closes.
    let mut byte = [0u8; 1];
    match socket.read(&mut byte) {
        Ok(0) => {}
        Err(ref err) if err.kind() == io::ErrorKind::ConnectionReset => {}
        other => panic!("expected denial to close the socket, got {:?}", other),
    }
}

#[test]
fn large_body_streams_through() {
    let (server, recorder, port) = start_server();
    let client = connect_client(port, &recorder, 1);

    // Larger than any single read chunk, so assembly spans many events.
    let payload: Vec<u8> = (0..200_000u32).map(|value| value as u8).collect();
    let mut msg = Message::new(TestMsg::Data);
    msg.body.extend_from_slice(&payload);
    msg.header.size = payload.len() as u32;
    client.send(msg);

    wait_until("large message", || {
        server.update(usize::MAX, false);
        !recorder.messages.lock().unwrap().is_empty()
    });

    let messages = recorder.messages.lock().unwrap();
    assert_eq!(messages[0].1.body, payload);
}
