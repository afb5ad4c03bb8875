//! Typed view of the DAC's status block.
//!
//! A [`StatusSnapshot`] is an immutable value decoded from one wire status
//! block; the connection replaces its snapshot wholesale on every inbound
//! frame rather than merging fields.

use bitflags::bitflags;
use std::error::Error as StdError;
use std::fmt;

use crate::protocol::DacStatus;

/// State of the DAC's light engine.
#[derive(Copy, Clone, Debug, Eq, Hash, PartialEq)]
pub enum LightEngineState {
    Ready,
    Warmup,
    Cooldown,
    EmergencyStop,
}

/// State of the DAC's playback engine.
#[derive(Copy, Clone, Debug, Eq, Hash, PartialEq)]
pub enum PlaybackState {
    Idle,
    Prepared,
    Playing,
}

bitflags! {
    #[derive(Copy, Clone, Debug, Eq, Hash, PartialEq)]
    pub struct LightEngineFlags: u16 {
        const EMERGENCY_STOP_PACKET_OR_INVALID_COMMAND = 0b00000001;
        const EMERGENCY_STOP_PROJECTOR_INPUT = 0b00000010;
        const EMERGENCY_STOP_PROJECTOR_INPUT_ACTIVE = 0b00000100;
        const EMERGENCY_STOP_OVER_TEMPERATURE = 0b00001000;
        const EMERGENCY_STOP_OVER_TEMPERATURE_ACTIVE = 0b00010000;
        const EMERGENCY_STOP_LOST_ETHERNET_LINK = 0b00100000;
    }
}

bitflags! {
    #[derive(Copy, Clone, Debug, Eq, Hash, PartialEq)]
    pub struct PlaybackFlags: u16 {
        const SHUTTER_OPEN = 0b00000001;
        const UNDERFLOWED = 0b00000010;
        const EMERGENCY_STOP = 0b00000100;
    }
}

/// An immutable decoded status value.
#[derive(Copy, Clone, Debug, Eq, Hash, PartialEq)]
pub struct StatusSnapshot {
    pub protocol: u8,
    pub light_engine: LightEngineState,
    pub playback: PlaybackState,
    pub source: u8,
    pub light_engine_flags: LightEngineFlags,
    pub playback_flags: PlaybackFlags,
    pub source_flags: u16,
    pub buffer_fullness: u16,
    pub point_rate: u32,
    pub point_count: u32,
}

/// A status block carried a state byte outside the documented set.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum SnapshotError {
    UnknownLightEngineState(u8),
    UnknownPlaybackState(u8),
}

impl StatusSnapshot {
    /// Decodes one wire status block into a typed snapshot.
    pub fn from_wire(status: &DacStatus) -> Result<Self, SnapshotError> {
        let light_engine = LightEngineState::from_protocol(status.light_engine_state)
            .ok_or(SnapshotError::UnknownLightEngineState(status.light_engine_state))?;
        let playback = PlaybackState::from_protocol(status.playback_state)
            .ok_or(SnapshotError::UnknownPlaybackState(status.playback_state))?;
        Ok(StatusSnapshot {
            protocol: status.protocol,
            light_engine,
            playback,
            source: status.source,
            light_engine_flags: LightEngineFlags::from_bits_truncate(status.light_engine_flags),
            playback_flags: PlaybackFlags::from_bits_truncate(status.playback_flags),
            source_flags: status.source_flags,
            buffer_fullness: status.buffer_fullness,
            point_rate: status.point_rate,
            point_count: status.point_count,
        })
    }

    /// Re-encodes the snapshot as a wire status block.
    pub fn to_wire(&self) -> DacStatus {
        DacStatus {
            protocol: self.protocol,
            light_engine_state: self.light_engine.to_protocol(),
            playback_state: self.playback.to_protocol(),
            source: self.source,
            light_engine_flags: self.light_engine_flags.bits(),
            playback_flags: self.playback_flags.bits(),
            source_flags: self.source_flags,
            buffer_fullness: self.buffer_fullness,
            point_rate: self.point_rate,
            point_count: self.point_count,
        }
    }
}

impl LightEngineState {
    pub fn from_protocol(state: u8) -> Option<Self> {
        Some(match state {
            DacStatus::LIGHT_ENGINE_READY => LightEngineState::Ready,
            DacStatus::LIGHT_ENGINE_WARMUP => LightEngineState::Warmup,
            DacStatus::LIGHT_ENGINE_COOLDOWN => LightEngineState::Cooldown,
            DacStatus::LIGHT_ENGINE_EMERGENCY_STOP => LightEngineState::EmergencyStop,
            _ => return None,
        })
    }

    pub fn to_protocol(&self) -> u8 {
        match *self {
            LightEngineState::Ready => DacStatus::LIGHT_ENGINE_READY,
            LightEngineState::Warmup => DacStatus::LIGHT_ENGINE_WARMUP,
            LightEngineState::Cooldown => DacStatus::LIGHT_ENGINE_COOLDOWN,
            LightEngineState::EmergencyStop => DacStatus::LIGHT_ENGINE_EMERGENCY_STOP,
        }
    }
}

impl PlaybackState {
    pub fn from_protocol(state: u8) -> Option<Self> {
        Some(match state {
            DacStatus::PLAYBACK_IDLE => PlaybackState::Idle,
            DacStatus::PLAYBACK_PREPARED => PlaybackState::Prepared,
            DacStatus::PLAYBACK_PLAYING => PlaybackState::Playing,
            _ => return None,
        })
    }

    pub fn to_protocol(&self) -> u8 {
        match *self {
            PlaybackState::Idle => DacStatus::PLAYBACK_IDLE,
            PlaybackState::Prepared => DacStatus::PLAYBACK_PREPARED,
            PlaybackState::Playing => DacStatus::PLAYBACK_PLAYING,
        }
    }
}

impl fmt::Display for SnapshotError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            SnapshotError::UnknownLightEngineState(b) => {
                write!(f, "unknown light engine state {}", b)
            }
            SnapshotError::UnknownPlaybackState(b) => write!(f, "unknown playback state {}", b),
        }
    }
}

impl StdError for SnapshotError {}
