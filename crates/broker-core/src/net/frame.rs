//! TLV opcode-range codec. Every frame starts with a one-byte opcode; the opcode's
//! value range determines what (if anything) follows it on the wire. This generalizes
//! the teacher's four-fixed-category `Category`/`Frame` scheme to the broker's full
//! 256-opcode dispatch table.

use crate::error::{BrokerError, ErrorKind};
use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use std::io;

pub mod opcode {
    pub const NOP: u8 = 0;
    pub const CLEAR: u8 = 1;
    pub const EXECUTE: u8 = 2;
    pub const REQUEST: u8 = 10;
    pub const REPLY: u8 = 11;
    pub const RECEIVED: u8 = 12;
    pub const DELIVERED: u8 = 13;
    pub const BROADCAST: u8 = 14;
    pub const NOREPLY: u8 = 15;
    pub const UNDELIVERED: u8 = 16;
    pub const CONSUME: u8 = 20;
    pub const CANCEL_QUEUE: u8 = 21;
    pub const CLOSING: u8 = 22;
    pub const SERVER_FULL: u8 = 23;
    pub const CONTROLLER: u8 = 24;
    pub const PING: u8 = 25;
    pub const PONG: u8 = 26;
    pub const CONSUMING: u8 = 27;
    pub const EXCLUSIVE: u8 = 28;

    pub const PRIORITY: u8 = 64;

    pub const ID: u8 = 96;
    pub const QUEUEID: u8 = 97;
    pub const TIMEOUT: u8 = 98;
    pub const MAX: u8 = 99;

    pub const QUEUE: u8 = 160;

    pub const PAYLOAD: u8 = 224;
}

/// Which layout a given opcode byte implies, per the range table in the wire spec.
#[derive(Debug, Eq, PartialEq)]
enum Layout {
    Nullary,
    ByteInt,
    ShortInt,
    LongInt,
    ShortString,
    MediumString,
    LongString,
}

fn layout_for(op: u8) -> Layout {
    match op {
        0..=63 => Layout::Nullary,
        64..=95 => Layout::ByteInt,
        96..=127 => Layout::ShortInt,
        128..=159 => Layout::LongInt,
        160..=191 => Layout::ShortString,
        192..=223 => Layout::MediumString,
        224..=255 => Layout::LongString,
    }
}

/// A single decoded command: an opcode plus whatever value its layout carries.
#[derive(Debug, Eq, PartialEq)]
pub enum Command {
    Nullary(u8),
    Int(u8, u64),
    Bytes(u8, Vec<u8>),
}

impl Command {
    pub fn opcode(&self) -> u8 {
        match self {
            Command::Nullary(op) => *op,
            Command::Int(op, _) => *op,
            Command::Bytes(op, _) => *op,
        }
    }
}

/// Decodes as many complete commands as are present in `buffer`, invoking `on_command`
/// for each. Returns the number of bytes consumed; any trailing partial command is left
/// for the next read. A malformed opcode value is impossible (every byte value maps to a
/// layout) but a truncated length-prefixed payload yields `BrokerError::Wait` so the
/// caller knows to wait for more bytes rather than treating it as fatal.
pub fn decode(buffer: &[u8], mut on_command: impl FnMut(Command)) -> Result<usize, BrokerError> {
    let mut cursor = buffer;
    let mut consumed = 0usize;

    loop {
        match try_decode_one(cursor) {
            Ok(Some((command, used))) => {
                on_command(command);
                cursor = &cursor[used..];
                consumed += used;
            }
            Ok(None) => break,
            Err(err) => return Err(err),
        }
    }

    Ok(consumed)
}

/// Tries to decode a single command from the front of `buffer`. Returns `Ok(None)` if
/// the buffer doesn't yet hold a complete command (caller should wait for more bytes).
fn try_decode_one(buffer: &[u8]) -> Result<Option<(Command, usize)>, BrokerError> {
    if buffer.is_empty() {
        return Ok(None);
    }

    let op = buffer[0];
    let rest = &buffer[1..];

    Ok(match layout_for(op) {
        Layout::Nullary => Some((Command::Nullary(op), 1)),
        Layout::ByteInt => read_scalar(rest, 1, |mut r| r.read_u8().map(u64::from))
            .map(|(v, n)| (Command::Int(op, v), 1 + n)),
        Layout::ShortInt => read_scalar(rest, 2, |mut r| r.read_u16::<BigEndian>().map(u64::from))
            .map(|(v, n)| (Command::Int(op, v), 1 + n)),
        Layout::LongInt => read_scalar(rest, 4, |mut r| r.read_u32::<BigEndian>().map(u64::from))
            .map(|(v, n)| (Command::Int(op, v), 1 + n)),
        Layout::ShortString => read_string(rest, 1, |mut r| r.read_u8().map(usize::from))
            .map(|(v, n)| (Command::Bytes(op, v), 1 + n)),
        Layout::MediumString => read_string(rest, 2, |mut r| r.read_u16::<BigEndian>().map(usize::from))
            .map(|(v, n)| (Command::Bytes(op, v), 1 + n)),
        Layout::LongString => {
            read_string(rest, 4, |mut r| r.read_u32::<BigEndian>().map(|v| v as usize))
                .map(|(v, n)| (Command::Bytes(op, v), 1 + n))
        }
    })
}

/// Reads a fixed-width scalar if `rest` holds at least `width` bytes; returns the value
/// together with the number of bytes consumed (always `width`).
fn read_scalar(
    rest: &[u8],
    width: usize,
    read: impl FnOnce(&[u8]) -> io::Result<u64>,
) -> Option<(u64, usize)> {
    if rest.len() < width {
        return None;
    }
    let value = read(&rest[..width]).expect("slice is exactly `width` bytes");
    Some((value, width))
}

/// Reads a length-prefixed byte string if `rest` holds the full length prefix plus
/// payload; returns the payload together with the total bytes consumed (prefix + data).
fn read_string(
    rest: &[u8],
    len_width: usize,
    read_len: impl FnOnce(&[u8]) -> io::Result<usize>,
) -> Option<(Vec<u8>, usize)> {
    if rest.len() < len_width {
        return None;
    }
    let len = read_len(&rest[..len_width]).expect("slice is exactly `len_width` bytes");
    let total = len_width + len;
    if rest.len() < total {
        return None;
    }
    Some((rest[len_width..total].to_vec(), total))
}

/// Encodes a nullary command.
pub fn write_nullary<W: io::Write>(mut writer: W, op: u8) -> io::Result<()> {
    writer.write_u8(op)
}

/// Encodes a scalar-valued command, picking the wire width from the opcode's range.
pub fn write_int<W: io::Write>(mut writer: W, op: u8, value: u64) -> io::Result<()> {
    writer.write_u8(op)?;
    match layout_for(op) {
        Layout::ByteInt => writer.write_u8(value as u8),
        Layout::ShortInt => writer.write_u16::<BigEndian>(value as u16),
        Layout::LongInt => writer.write_u32::<BigEndian>(value as u32),
        other => panic!("opcode {} is not an integer layout ({:?})", op, other),
    }
}

/// Encodes a byte-string-valued command, picking the length-prefix width from the
/// opcode's range. Panics if `data` overflows the opcode's length-prefix width, mirroring
/// the `EmptyPayload`/size-limit assertions this codebase's wire types already carry.
pub fn write_bytes<W: io::Write>(mut writer: W, op: u8, data: &[u8]) -> io::Result<()> {
    writer.write_u8(op)?;
    match layout_for(op) {
        Layout::ShortString => {
            assert!(data.len() <= u8::MAX as usize, "payload too large for short string");
            writer.write_u8(data.len() as u8)?;
        }
        Layout::MediumString => {
            assert!(data.len() <= u16::MAX as usize, "payload too large for medium string");
            writer.write_u16::<BigEndian>(data.len() as u16)?;
        }
        Layout::LongString => {
            writer.write_u32::<BigEndian>(data.len() as u32)?;
        }
        other => panic!("opcode {} is not a string layout ({:?})", op, other),
    }
    writer.write_all(data)
}

/// Maps an opcode to a `QueueNotFound`-style protocol error, used for logging.
pub fn protocol_error() -> BrokerError {
    BrokerError::Fatal(ErrorKind::ProtocolError)
}
