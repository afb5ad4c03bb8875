//! Types and constants that precisely match the Ether Dream wire protocol.
//!
//! All multi-byte fields are little-endian. Every command submitted over the
//! TCP control connection is answered with a fixed-size 22-byte
//! [`StatusFrame`]; the device also pushes one unsolicited status frame
//! immediately after accepting a connection.

use byteorder::{ReadBytesExt, WriteBytesExt, LE};
use std::io;

use crate::error::Error;

/// Communication with the DAC happens over TCP on port 7765.
pub const COMMUNICATION_PORT: u16 = 7765;

/// The DAC broadcasts announcement datagrams over UDP on port 7654.
pub const BROADCAST_PORT: u16 = 7654;

/// The most points a single WriteData command may carry.
pub const MAX_BATCH_POINTS: usize = 80;

/// A trait for writing any of the protocol types to little-endian bytes.
pub trait WriteBytes {
    fn write_bytes<P: WriteToBytes>(&mut self, protocol: P) -> io::Result<()>;
}

/// A trait for reading any of the protocol types from little-endian bytes.
pub trait ReadBytes {
    fn read_bytes<P: ReadFromBytes>(&mut self) -> io::Result<P>;
}

/// Protocol types that may be written to little endian bytes.
pub trait WriteToBytes {
    fn write_to_bytes<W: WriteBytesExt>(&self, writer: W) -> io::Result<()>;
}

/// Protocol types that may be read from little endian bytes.
pub trait ReadFromBytes: Sized {
    fn read_from_bytes<R: ReadBytesExt>(reader: R) -> io::Result<Self>;
}

/// Types that have a constant size when written to or read from bytes.
pub trait SizeBytes {
    const SIZE_BYTES: usize;
}

/// The 20-byte status block the DAC embeds in every response frame.
#[repr(C)]
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash)]
pub struct DacStatus {
    pub protocol: u8,
    pub light_engine_state: u8,
    pub playback_state: u8,
    pub source: u8,
    pub light_engine_flags: u16,
    pub playback_flags: u16,
    pub source_flags: u16,
    pub buffer_fullness: u16,
    pub point_rate: u32,
    pub point_count: u32,
}

/// A complete response frame: response code, echoed command byte, status.
#[repr(C)]
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct StatusFrame {
    pub response: u8,
    pub command: u8,
    pub status: DacStatus,
}

/// A point record as it travels on the wire.
#[repr(C)]
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash)]
pub struct DacPoint {
    pub control: u16,
    pub x: i16,
    pub y: i16,
    pub r: u16,
    pub g: u16,
    pub b: u16,
    pub i: u16,
    pub u1: u16,
    pub u2: u16,
}

impl DacStatus {
    pub const LIGHT_ENGINE_READY: u8 = 0;
    pub const LIGHT_ENGINE_WARMUP: u8 = 1;
    pub const LIGHT_ENGINE_COOLDOWN: u8 = 2;
    pub const LIGHT_ENGINE_EMERGENCY_STOP: u8 = 3;

    pub const PLAYBACK_IDLE: u8 = 0;
    pub const PLAYBACK_PREPARED: u8 = 1;
    pub const PLAYBACK_PLAYING: u8 = 2;
}

impl StatusFrame {
    pub const ACK: u8 = 0x61;
    pub const NAK: u8 = 0x4E;
    pub const NAK_FULL: u8 = 0x46;
    pub const NAK_INVALID: u8 = 0x49;
    pub const NAK_ESTOP: u8 = 0x21;

    /// Decodes one frame from the front of `bytes`.
    ///
    /// Fails with [`Error::MalformedFrame`] if fewer than 22 bytes are
    /// supplied and consumes nothing; the caller buffers until enough bytes
    /// exist. Unexpected response codes are not rejected here - they surface
    /// to the correlator as a non-ACK result.
    pub fn decode(bytes: &[u8]) -> Result<Self, Error> {
        if bytes.len() < Self::SIZE_BYTES {
            return Err(Error::MalformedFrame);
        }
        let mut reader = &bytes[..Self::SIZE_BYTES];
        reader.read_bytes::<StatusFrame>().map_err(|_| Error::MalformedFrame)
    }

    /// Whether the DAC accepted the echoed command.
    pub fn is_ack(&self) -> bool {
        self.response == Self::ACK
    }
}

/// Command opcodes accepted by the DAC.
pub mod command {
    /// Prepare the stream for playback. No payload.
    pub const PREPARE: u8 = 0x70;
    /// Begin playback: 2-byte low water mark + 4-byte point rate.
    pub const BEGIN: u8 = 0x62;
    /// Set the point rate: 4-byte rate.
    pub const SET_RATE: u8 = 0x71;
    /// Write point data: 2-byte count + count x 18-byte points.
    pub const WRITE_DATA: u8 = 0x64;
    /// Stop playback. No payload.
    pub const STOP: u8 = 0x73;
    /// Request a status frame without side effects. No payload. The
    /// unsolicited greeting frame also echoes this byte.
    pub const PING: u8 = 0x3F;
    /// Clear an emergency stop condition. No payload.
    pub const CLEAR_ESTOP: u8 = 0x63;
}

/// Builds the combined SetRate + WriteData packet for one batch of points.
///
/// The output is always `8 + 18 * points.len()` bytes. Callers never pass
/// more than [`MAX_BATCH_POINTS`] points; larger frames are split across
/// multiple calls.
pub fn encode_rate_and_batch(point_rate: u32, points: &[DacPoint]) -> io::Result<Vec<u8>> {
    debug_assert!(points.len() <= MAX_BATCH_POINTS);
    let mut bytes = Vec::with_capacity(8 + DacPoint::SIZE_BYTES * points.len());
    bytes.write_u8(command::SET_RATE)?;
    bytes.write_u32::<LE>(point_rate)?;
    bytes.write_u8(command::WRITE_DATA)?;
    bytes.write_u16::<LE>(points.len() as u16)?;
    for point in points {
        bytes.write_bytes(point)?;
    }
    Ok(bytes)
}

/// Builds the Begin packet. The low water mark is always zero.
pub fn encode_begin(point_rate: u32) -> io::Result<Vec<u8>> {
    let mut bytes = Vec::with_capacity(7);
    bytes.write_u8(command::BEGIN)?;
    bytes.write_u16::<LE>(0)?;
    bytes.write_u32::<LE>(point_rate)?;
    Ok(bytes)
}

/// Builds the single-byte Prepare packet.
pub fn encode_prepare() -> Vec<u8> {
    vec![command::PREPARE]
}

/// Builds the single-byte Stop packet.
pub fn encode_stop() -> Vec<u8> {
    vec![command::STOP]
}

/// Builds the single-byte ClearEStop packet.
pub fn encode_clear_estop() -> Vec<u8> {
    vec![command::CLEAR_ESTOP]
}

/// Builds the single-byte Ping packet.
pub fn encode_ping() -> Vec<u8> {
    vec![command::PING]
}

impl WriteToBytes for DacStatus {
    fn write_to_bytes<W: WriteBytesExt>(&self, mut writer: W) -> io::Result<()> {
        writer.write_u8(self.protocol)?;
        writer.write_u8(self.light_engine_state)?;
        writer.write_u8(self.playback_state)?;
        writer.write_u8(self.source)?;
        writer.write_u16::<LE>(self.light_engine_flags)?;
        writer.write_u16::<LE>(self.playback_flags)?;
        writer.write_u16::<LE>(self.source_flags)?;
        writer.write_u16::<LE>(self.buffer_fullness)?;
        writer.write_u32::<LE>(self.point_rate)?;
        writer.write_u32::<LE>(self.point_count)?;
        Ok(())
    }
}

impl WriteToBytes for StatusFrame {
    fn write_to_bytes<W: WriteBytesExt>(&self, mut writer: W) -> io::Result<()> {
        writer.write_u8(self.response)?;
        writer.write_u8(self.command)?;
        writer.write_bytes(self.status)?;
        Ok(())
    }
}

impl WriteToBytes for DacPoint {
    fn write_to_bytes<W: WriteBytesExt>(&self, mut writer: W) -> io::Result<()> {
        writer.write_u16::<LE>(self.control)?;
        writer.write_i16::<LE>(self.x)?;
        writer.write_i16::<LE>(self.y)?;
        writer.write_u16::<LE>(self.r)?;
        writer.write_u16::<LE>(self.g)?;
        writer.write_u16::<LE>(self.b)?;
        writer.write_u16::<LE>(self.i)?;
        writer.write_u16::<LE>(self.u1)?;
        writer.write_u16::<LE>(self.u2)?;
        Ok(())
    }
}

impl ReadFromBytes for DacStatus {
    fn read_from_bytes<R: ReadBytesExt>(mut reader: R) -> io::Result<Self> {
        Ok(DacStatus {
            protocol: reader.read_u8()?,
            light_engine_state: reader.read_u8()?,
            playback_state: reader.read_u8()?,
            source: reader.read_u8()?,
            light_engine_flags: reader.read_u16::<LE>()?,
            playback_flags: reader.read_u16::<LE>()?,
            source_flags: reader.read_u16::<LE>()?,
            buffer_fullness: reader.read_u16::<LE>()?,
            point_rate: reader.read_u32::<LE>()?,
            point_count: reader.read_u32::<LE>()?,
        })
    }
}

impl ReadFromBytes for StatusFrame {
    fn read_from_bytes<R: ReadBytesExt>(mut reader: R) -> io::Result<Self> {
        Ok(StatusFrame {
            response: reader.read_u8()?,
            command: reader.read_u8()?,
            status: reader.read_bytes::<DacStatus>()?,
        })
    }
}

impl ReadFromBytes for DacPoint {
    fn read_from_bytes<R: ReadBytesExt>(mut reader: R) -> io::Result<Self> {
        Ok(DacPoint {
            control: reader.read_u16::<LE>()?,
            x: reader.read_i16::<LE>()?,
            y: reader.read_i16::<LE>()?,
            r: reader.read_u16::<LE>()?,
            g: reader.read_u16::<LE>()?,
            b: reader.read_u16::<LE>()?,
            i: reader.read_u16::<LE>()?,
            u1: reader.read_u16::<LE>()?,
            u2: reader.read_u16::<LE>()?,
        })
    }
}

impl SizeBytes for DacStatus {
    const SIZE_BYTES: usize = 20;
}

impl SizeBytes for StatusFrame {
    const SIZE_BYTES: usize = DacStatus::SIZE_BYTES + 2;
}

impl SizeBytes for DacPoint {
    const SIZE_BYTES: usize = 18;
}

impl<P> WriteToBytes for &P
where
    P: WriteToBytes,
{
    fn write_to_bytes<W: WriteBytesExt>(&self, writer: W) -> io::Result<()> {
        (*self).write_to_bytes(writer)
    }
}

impl<W> WriteBytes for W
where
    W: WriteBytesExt,
{
    fn write_bytes<P: WriteToBytes>(&mut self, protocol: P) -> io::Result<()> {
        protocol.write_to_bytes(self)
    }
}

impl<R> ReadBytes for R
where
    R: ReadBytesExt,
{
    fn read_bytes<P: ReadFromBytes>(&mut self) -> io::Result<P> {
        P::read_from_bytes(self)
    }
}
