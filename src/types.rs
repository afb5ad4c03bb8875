//! Caller-facing point and frame types.
//!
//! Callers describe output in a device-independent form: normalized
//! coordinates and 8-bit color. Conversion to the DAC's 16-bit wire format
//! happens when a batch is encoded, never earlier, so queued frames stay
//! cheap to produce and drop.

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};
use std::{fmt, ops};

use crate::protocol::DacPoint;

/// A single point of a vector frame.
///
/// Coordinates are normalized:
/// - x: -1.0 (left) to 1.0 (right)
/// - y: -1.0 (bottom) to 1.0 (top)
///
/// Colors are 8-bit. A `blanking` point is traversed with the beam dark
/// regardless of its color values.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Point {
    pub x: f32,
    pub y: f32,
    pub r: u8,
    pub g: u8,
    pub b: u8,
    pub blanking: bool,
}

impl Point {
    /// Creates a new lit point.
    pub fn new(x: f32, y: f32, r: u8, g: u8, b: u8) -> Self {
        Self {
            x,
            y,
            r,
            g,
            b,
            blanking: false,
        }
    }

    /// Creates a blanked point (laser off) at the given position.
    pub fn blanked(x: f32, y: f32) -> Self {
        Self {
            x,
            y,
            blanking: true,
            ..Default::default()
        }
    }
}

/// An ordered sequence of points making up one drawable frame.
#[derive(Debug, Clone, Default, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Frame {
    pub points: Vec<Point>,
}

impl Frame {
    pub fn new(points: Vec<Point>) -> Self {
        Self { points }
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }
}

impl From<Vec<Point>> for Frame {
    fn from(points: Vec<Point>) -> Self {
        Frame { points }
    }
}

impl FromIterator<Point> for Frame {
    fn from_iter<I: IntoIterator<Item = Point>>(iter: I) -> Self {
        Frame {
            points: iter.into_iter().collect(),
        }
    }
}

/// The fixed-size array used to represent the MAC address of a DAC.
#[derive(Copy, Clone, Debug, Eq, Hash, PartialEq, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct MacAddress(pub [u8; 6]);

impl From<[u8; 6]> for MacAddress {
    fn from(bytes: [u8; 6]) -> Self {
        MacAddress(bytes)
    }
}

impl ops::Deref for MacAddress {
    type Target = [u8; 6];
    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl fmt::Display for MacAddress {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let a = &self.0;
        write!(
            f,
            "{:02X}:{:02X}:{:02X}:{:02X}:{:02X}:{:02X}",
            a[0], a[1], a[2], a[3], a[4], a[5]
        )
    }
}

impl From<&Point> for DacPoint {
    /// Quantize a normalized point to the DAC's wire format.
    ///
    /// Coordinates scale by 32767 with rounding and clamp to the i16 range.
    /// Colors scale 8-bit to 16-bit (x257). Blanking forces color and
    /// intensity to zero; otherwise intensity is full.
    fn from(p: &Point) -> Self {
        let x = (p.x * 32767.0).round().clamp(-32768.0, 32767.0) as i16;
        let y = (p.y * 32767.0).round().clamp(-32768.0, 32767.0) as i16;

        let (r, g, b, i) = if p.blanking {
            (0, 0, 0, 0)
        } else {
            (
                u16::from(p.r) * 257,
                u16::from(p.g) * 257,
                u16::from(p.b) * 257,
                u16::MAX,
            )
        };

        DacPoint {
            control: 0,
            x,
            y,
            r,
            g,
            b,
            i,
            u1: 0,
            u2: 0,
        }
    }
}
