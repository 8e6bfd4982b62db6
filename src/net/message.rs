use crate::net::connection::Connection;
use crate::net::shared::{ErrorType, NetworkError, NetworkResult};
use bytemuck::Pod;
use byteorder::{ByteOrder, LittleEndian};
use std::fmt;
use std::mem;
use std::sync::Arc;

/// Application-chosen message discriminant, carried in every frame header.
///
/// The library never interprets ids beyond moving them to and from their
/// 32-bit wire form; the application owns the mapping in both directions
/// (typically a `#[repr(u32)]` enum with a `match`, or a `num_enum`-style
/// derive).
pub trait MessageId: Copy + Eq + fmt::Debug + Send + Sync + 'static {
    fn to_wire(self) -> u32;
    fn from_wire(raw: u32) -> Self;
}

impl MessageId for u32 {
    #[inline]
    fn to_wire(self) -> u32 {
        self
    }

    #[inline]
    fn from_wire(raw: u32) -> u32 {
        raw
    }
}

/// Frame header sent at the start of every message: the id followed by the
/// body byte count. Both fields travel as little-endian 32-bit words.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct MessageHeader<T: MessageId> {
    pub id: T,
    pub size: u32,
}

impl<T: MessageId> MessageHeader<T> {
    pub const WIRE_SIZE: usize = 8;

    #[inline]
    pub fn encode(&self) -> [u8; 8] {
        let mut raw = [0u8; Self::WIRE_SIZE];
        LittleEndian::write_u32(&mut raw[..4], self.id.to_wire());
        LittleEndian::write_u32(&mut raw[4..], self.size);
        raw
    }

    /// Decodes a header from `raw`, which must hold at least `WIRE_SIZE`
    /// bytes.
    #[inline]
    pub fn decode(raw: &[u8]) -> MessageHeader<T> {
        MessageHeader {
            id: T::from_wire(LittleEndian::read_u32(&raw[..4])),
            size: LittleEndian::read_u32(&raw[4..8]),
        }
    }
}

/// A wire message: header plus variable-length byte body. `header.size`
/// always equals `body.len()` when a message is handed to the transport or
/// delivered to an inbox.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct Message<T: MessageId> {
    pub header: MessageHeader<T>,
    pub body: Vec<u8>,
}

impl<T: MessageId> Message<T> {
    #[inline]
    pub fn new(id: T) -> Message<T> {
        Message {
            header: MessageHeader { id, size: 0 },
            body: Vec::new(),
        }
    }

    /// Total byte count of the message as framed on the wire.
    #[inline]
    pub fn size(&self) -> usize {
        MessageHeader::<T>::WIRE_SIZE + self.body.len()
    }

    /// Copies the raw bytes of a fixed-layout value onto the back of the
    /// body. Together with `extract` this forms a stack: values come back
    /// out in the reverse of the order they went in.
    #[inline]
    pub fn append<V: Pod>(&mut self, value: V) -> &mut Message<T> {
        self.body.extend_from_slice(bytemuck::bytes_of(&value));
        self.header.size = self.body.len() as u32;
        self
    }

    /// Copies the trailing `size_of::<V>()` bytes of the body into a value
    /// and shrinks the body. Fails with `Underflow` when the body is too
    /// small.
    #[inline]
    pub fn extract<V: Pod>(&mut self) -> NetworkResult<V> {
        let take = mem::size_of::<V>();

        if self.body.len() < take {
            return Err(NetworkError::Fatal(ErrorType::Underflow));
        }

        let at = self.body.len() - take;
        let value = bytemuck::pod_read_unaligned(&self.body[at..]);

        self.body.truncate(at);
        self.header.size = self.body.len() as u32;

        Ok(value)
    }
}

impl<T: MessageId> fmt::Display for Message<T> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "ID: {} Size: {}",
            self.header.id.to_wire(),
            self.header.size
        )
    }
}

/// An inbox entry: a received message paired with a handle to the connection
/// that delivered it. `remote` is present on the server side so application
/// code can reply down the same connection, and absent on the client side.
/// An entry keeps its connection alive until handled.
#[derive(Clone)]
pub struct OwnedMessage<T: MessageId> {
    pub remote: Option<Arc<Connection<T>>>,
    pub msg: Message<T>,
}

impl<T: MessageId> fmt::Display for OwnedMessage<T> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        fmt::Display::fmt(&self.msg, f)
    }
}
