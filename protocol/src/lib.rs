//! Talk to Huawei FreeBuds earbuds via their proprietary serial protocol.
//!
//! # Overview
//!
//! The `freebuds` crate implements the framed request/response protocol
//! spoken by FreeBuds earbuds over a Bluetooth RFCOMM channel, together with
//! a passive heuristic that recovers battery levels from advertisements.
//! It offers an asynchronous, transport-agnostic API built on
//! [`embedded_io_async`] ports.
//!
//! Depending on your needs, you can:
//!
//! - Drive a [`session::Session`] (or its [`session::Worker`]) to connect,
//!   query battery levels and toggle the low-latency mode.
//! - Feed advertisement observations to a [`broadcast::Scanner`] to decide
//!   whether a broadcaster is the target device and extract battery levels.
//! - Work directly with the low-level packet [`Interface`].
//!
//! # Protocol details
//!
//! Every packet is framed as follows (multi-byte integers are big-endian):
//!
//! | Offset   | Size | Content                                         |
//! |----------|------|-------------------------------------------------|
//! | 0        | 1    | Sync byte `0x5a`                                |
//! | 1        | 2    | Length: `1 + 2 + len(fields)`                   |
//! | 3        | 1    | Reserved, always `0x00`                         |
//! | 4        | 2    | Command ID                                      |
//! | 6        | N    | Fields: type (1), length (1), value (length)    |
//! | 6 + N    | 2    | CRC-16/XMODEM over all preceding bytes          |
//!
//! The earbuds answer a request with a packet carrying the same command ID.
//! There is no other request correlation, so only one request may be in
//! flight at any time.
//!
//! # Examples
//!
//! Encoding a battery query and decoding it again:
//!
//! ```
//! use freebuds::{ChecksumMode, Interface, Packet};
//! use std::collections::VecDeque;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> freebuds::Result<(), core::convert::Infallible> {
//! let mut deque = VecDeque::new();
//! let mut intf = Interface::new(&mut deque, ChecksumMode::Enforce);
//!
//! intf.send(&Packet::battery_query()).await?;
//!
//! let packet = intf.receive().await?;
//!
//! assert_eq!(packet, Some(Packet::battery_query()));
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![cfg_attr(docsrs, feature(doc_cfg))]

pub mod battery;
pub mod broadcast;
pub mod identity;
pub mod session;

#[cfg(feature = "native-serial")]
#[cfg_attr(docsrs, doc(cfg(feature = "native-serial")))]
pub mod serial;

pub use embedded_io_async;

use core::fmt::{Debug, Display, Formatter};
use crc::{CRC_16_XMODEM, Crc};
use embedded_io_async::{Read, ReadExactError, Write};
use log::{debug, trace, warn};

/// Sync byte marking the start of every packet.
pub const SYNC: u8 = 0x5a;

// Sync byte, length and reserved byte
const HEADER_LEN: usize = 4;
const CHECKSUM_LEN: usize = 2;

// Reserved byte and command ID
const MIN_LENGTH: usize = 3;

const CRC: Crc<u16> = Crc::<u16>::new(&CRC_16_XMODEM);

/// A specialized [`Result`] type for [`Interface`] operations.
///
/// Uses [`Error<E>`] as the error variant, which can include port-specific errors.
pub type Result<T, E> = core::result::Result<T, Error<E>>;

/// Error type for [`Interface`] operations.
///
/// The generic parameter `E` allows the error type to carry a port-specific error.
///
/// This enum is marked `#[non_exhaustive]` to allow for future variants.
#[non_exhaustive]
#[derive(PartialEq, Eq, Debug)]
pub enum Error<E> {
    /// The packet could not be encoded.
    Encode(EncodeError),
    /// The received packet is structurally invalid.
    MalformedPacket,
    /// The received packet has an incorrect checksum.
    IncorrectChecksum,
    /// A port-specific input/output error.
    Io(E),
}

impl<E: core::error::Error> Display for Error<E> {
    fn fmt(&self, f: &mut Formatter) -> core::fmt::Result {
        match self {
            Self::Encode(err) => write!(f, "encoding error: {err}"),
            Self::MalformedPacket => write!(f, "malformed packet"),
            Self::IncorrectChecksum => write!(f, "incorrect checksum"),
            Self::Io(err) => write!(f, "input/output error: {err}"),
        }
    }
}

impl<E: core::error::Error> core::error::Error for Error<E> {}

impl<E> From<E> for Error<E> {
    fn from(err: E) -> Self {
        Self::Io(err)
    }
}

/// Error returned when a packet cannot be encoded.
///
/// Encoding errors are detected before any data is written to the port.
#[derive(PartialEq, Eq, Copy, Clone, Debug)]
pub enum EncodeError {
    /// A field value is longer than 255 bytes.
    FieldTooLarge {
        /// Type of the offending field.
        field_type: u8,
        /// Length of the offending value.
        len: usize,
    },
    /// The packet length does not fit into the 16-bit length field.
    PacketTooLarge(usize),
}

impl Display for EncodeError {
    fn fmt(&self, f: &mut Formatter) -> core::fmt::Result {
        match self {
            Self::FieldTooLarge { field_type, len } => {
                write!(f, "field {field_type} too large ({len} bytes)")
            }
            Self::PacketTooLarge(len) => write!(f, "packet too large ({len} bytes)"),
        }
    }
}

impl core::error::Error for EncodeError {}

/// Computes the CRC-16/XMODEM checksum of the given data.
///
/// Packets carry this checksum big-endian in their last two bytes.
#[must_use]
pub fn checksum(data: &[u8]) -> u16 {
    CRC.checksum(data)
}

/// Two-byte command identifier, consisting of a service and a command byte.
#[derive(PartialEq, Eq, Copy, Clone, Hash)]
pub struct CommandId(pub [u8; 2]);

impl CommandId {
    /// Battery level query and its response.
    pub const BATTERY: Self = Self([0x01, 0x08]);
    /// Low-latency mode toggle.
    pub const LOW_LATENCY: Self = Self([0x2b, 0x6c]);
}

impl From<u16> for CommandId {
    fn from(id: u16) -> Self {
        Self(id.to_be_bytes())
    }
}

impl From<CommandId> for u16 {
    fn from(id: CommandId) -> Self {
        Self::from_be_bytes(id.0)
    }
}

impl Debug for CommandId {
    fn fmt(&self, f: &mut Formatter) -> core::fmt::Result {
        write!(f, "CommandId({self})")
    }
}

impl Display for CommandId {
    fn fmt(&self, f: &mut Formatter) -> core::fmt::Result {
        write!(f, "0x{:02x}{:02x}", self.0[0], self.0[1])
    }
}

/// Type-length-value field carried by a [`Packet`].
///
/// Fields have no identity beyond their type and position.
/// The value must not exceed 255 bytes for the packet to be encodable.
#[derive(PartialEq, Eq, Clone, Debug)]
pub struct Field {
    /// Field type.
    pub ty: u8,
    /// Raw field value.
    pub value: Vec<u8>,
}

impl Field {
    /// Constructs a new field.
    pub fn new(ty: u8, value: impl Into<Vec<u8>>) -> Self {
        Self {
            ty,
            value: value.into(),
        }
    }

    /// Constructs a field without a value.
    #[must_use]
    pub fn empty(ty: u8) -> Self {
        Self::new(ty, Vec::new())
    }
}

/// Checksum verification policy for received packets.
///
/// Some firmware versions are suspected to send packets with invalid checksums,
/// so the policy has to be chosen explicitly.
#[derive(PartialEq, Eq, Copy, Clone, Debug)]
pub enum ChecksumMode {
    /// Log checksum mismatches but accept the packet.
    Lenient,
    /// Reject packets with mismatching checksums.
    Enforce,
}

/// Structured protocol packet.
///
/// The length, reserved byte and checksum are derived when encoding
/// and validated when decoding, so they are not stored.
#[derive(PartialEq, Eq, Clone, Debug)]
pub struct Packet {
    /// Command ID.
    pub command: CommandId,
    /// Ordered list of fields.
    pub fields: Vec<Field>,
}

impl Packet {
    /// Constructs a new packet.
    #[must_use]
    pub fn new(command: CommandId, fields: Vec<Field>) -> Self {
        Self { command, fields }
    }

    /// Constructs a battery query.
    ///
    /// The query carries three empty request flag fields.
    #[must_use]
    pub fn battery_query() -> Self {
        Self::new(
            CommandId::BATTERY,
            vec![Field::empty(1), Field::empty(2), Field::empty(3)],
        )
    }

    /// Constructs a request enabling or disabling the low-latency mode.
    #[must_use]
    pub fn low_latency(enabled: bool) -> Self {
        Self::new(
            CommandId::LOW_LATENCY,
            vec![Field::new(1, [u8::from(enabled)])],
        )
    }

    /// Returns the first field of the given type.
    #[must_use]
    pub fn field(&self, ty: u8) -> Option<&Field> {
        self.fields.iter().find(|field| field.ty == ty)
    }

    /// Encodes the packet into its framed wire representation.
    pub fn encode(&self) -> core::result::Result<Vec<u8>, EncodeError> {
        encode(self.command, &self.fields)
    }

    /// Parses a complete frame, including header and checksum.
    ///
    /// The caller guarantees that the frame length matches the declared length.
    fn from_frame<E>(frame: &[u8], mode: ChecksumMode) -> Result<Self, E> {
        let (data, crc) = frame.split_at(frame.len() - CHECKSUM_LEN);
        let expected = checksum(data);
        let actual = u16::from_be_bytes([crc[0], crc[1]]);

        if expected != actual {
            match mode {
                ChecksumMode::Lenient => {
                    warn!("Checksum mismatch (expected {expected:04x}, got {actual:04x})");
                }
                ChecksumMode::Enforce => return Err(Error::IncorrectChecksum),
            }
        }

        let command = CommandId([data[4], data[5]]);
        let mut fields = Vec::new();
        let mut rest = &data[HEADER_LEN + 2..];

        while !rest.is_empty() {
            let [ty, len, tail @ ..] = rest else {
                return Err(Error::MalformedPacket);
            };
            let len = usize::from(*len);

            if tail.len() < len {
                return Err(Error::MalformedPacket);
            }

            fields.push(Field::new(*ty, &tail[..len]));
            rest = &tail[len..];
        }

        Ok(Self { command, fields })
    }
}

/// Encodes a command and its fields into a framed packet.
///
/// # Errors
///
/// - [`EncodeError::FieldTooLarge`] if a field value exceeds 255 bytes.
/// - [`EncodeError::PacketTooLarge`] if the packet length exceeds the 16-bit length field.
pub fn encode(command: CommandId, fields: &[Field]) -> core::result::Result<Vec<u8>, EncodeError> {
    let mut frame = vec![SYNC, 0x00, 0x00, 0x00, command.0[0], command.0[1]];

    for field in fields {
        let len = u8::try_from(field.value.len()).map_err(|_| EncodeError::FieldTooLarge {
            field_type: field.ty,
            len: field.value.len(),
        })?;

        frame.push(field.ty);
        frame.push(len);
        frame.extend_from_slice(&field.value);
    }

    // Length excludes sync byte and length field
    let len = frame.len() - 3;
    let len = u16::try_from(len).map_err(|_| EncodeError::PacketTooLarge(len))?;

    frame[1..3].copy_from_slice(&len.to_be_bytes());
    frame.extend_from_slice(&checksum(&frame).to_be_bytes());

    Ok(frame)
}

/// Incremental packet decoder.
///
/// Reads one packet at a time from a byte stream.
/// Corrupted or truncated data is discarded rather than treated as fatal,
/// so decoding can continue with the next packet.
#[derive(Debug)]
pub struct Decoder {
    mode: ChecksumMode,
    carry: Vec<u8>,
    closed: bool,
}

impl Decoder {
    /// Constructs a new decoder using the given checksum policy.
    #[must_use]
    pub fn new(mode: ChecksumMode) -> Self {
        Self {
            mode,
            carry: Vec::new(),
            closed: false,
        }
    }

    /// Returns whether the stream ended during a previous decode.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Decodes the next packet from the port.
    ///
    /// Returns `None` if the header does not start with the sync byte or
    /// the stream ends before a complete packet is read.
    /// Sync bytes following an invalid header are retained for the next call,
    /// so leading garbage is eventually skipped.
    ///
    /// # Errors
    ///
    /// - [`Error::MalformedPacket`] if the declared length is too short
    ///   or a field overruns the packet.
    /// - [`Error::IncorrectChecksum`] if the checksum does not match
    ///   and [`ChecksumMode::Enforce`] is in use.
    pub async fn decode<P: Read>(&mut self, port: &mut P) -> Result<Option<Packet>, P::Error> {
        let mut header = [0x00; HEADER_LEN];
        let carried = self.carry.len();

        header[..carried].copy_from_slice(&self.carry);
        self.carry.clear();

        if !self.read(port, &mut header[carried..]).await? {
            return Ok(None);
        }

        if header[0] != SYNC {
            if let Some(pos) = header[1..].iter().position(|&b| b == SYNC) {
                self.carry.extend_from_slice(&header[pos + 1..]);
            }

            debug!("Discarding unsynchronized header: {header:02x?}");

            return Ok(None);
        }

        let len = usize::from(u16::from_be_bytes([header[1], header[2]]));

        if len < MIN_LENGTH {
            return Err(Error::MalformedPacket);
        }

        // Reserved byte was already read as part of the header
        let mut frame = vec![0x00; HEADER_LEN + len - 1 + CHECKSUM_LEN];

        frame[..HEADER_LEN].copy_from_slice(&header);

        if !self.read(port, &mut frame[HEADER_LEN..]).await? {
            debug!("Discarding incomplete packet: {header:02x?}");

            return Ok(None);
        }

        Packet::from_frame(&frame, self.mode).map(Some)
    }

    /// Reads exactly enough data to fill the buffer.
    ///
    /// Returns `false` if the stream ended before the buffer was filled.
    async fn read<P: Read>(&mut self, port: &mut P, buf: &mut [u8]) -> Result<bool, P::Error> {
        match port.read_exact(buf).await {
            Ok(()) => {
                trace!("Read from port: {buf:02x?}");

                Ok(true)
            }
            Err(ReadExactError::UnexpectedEof) => {
                self.closed = true;

                Ok(false)
            }
            Err(ReadExactError::Other(err)) => Err(Error::Io(err)),
        }
    }
}

/// Asynchronous packet interface.
///
/// Requires a port that implements [`Read`] and [`Write`] for communication.
///
/// Most users should use the [`session`] module instead, which adds
/// connection handling, timeouts and response matching on top.
#[derive(Debug)]
pub struct Interface<P> {
    port: P,
    decoder: Decoder,
}

impl<P: Read + Write> Interface<P> {
    /// Constructs a new packet interface.
    pub fn new(port: P, mode: ChecksumMode) -> Self {
        Self {
            port,
            decoder: Decoder::new(mode),
        }
    }

    /// Returns whether the port reached end-of-file.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.decoder.is_closed()
    }

    /// Encodes and sends a packet.
    ///
    /// # Errors
    ///
    /// - [`Error::Encode`] if the packet cannot be encoded. Nothing is sent in that case.
    pub async fn send(&mut self, packet: &Packet) -> Result<(), P::Error> {
        trace!("Sending packet: {packet:x?}");

        let frame = packet.encode().map_err(Error::Encode)?;

        self.write(&frame).await
    }

    /// Receives the next packet.
    ///
    /// See [`Decoder::decode`] for details.
    pub async fn receive(&mut self) -> Result<Option<Packet>, P::Error> {
        self.decoder.decode(&mut self.port).await
    }

    /// Writes the provided buffer to the port.
    async fn write(&mut self, buf: &[u8]) -> Result<(), P::Error> {
        trace!("Write to port: {buf:02x?}");
        self.port.write_all(buf).await?;
        self.port.flush().await?;

        Ok(())
    }
}
