//! Network client for Ether Dream laser DACs.
//!
//! Ether Dream is a network laser DAC: frames are streamed over a TCP control
//! connection on port 7765, and devices announce themselves over UDP
//! broadcasts on port 7654.
//!
//! The crate is layered bottom-up:
//!
//! - [`protocol`] - wire-exact types and packet encoders
//! - [`status`] - the typed view of the device's 20-byte status block
//! - [`connection`] - one streaming session per device, driven by a 1 ms loop
//! - [`registry`] - address-keyed reuse of connections for multi-projector use
//! - [`discovery`] - UDP collection of device announcements
//!
//! # Coordinate System
//!
//! Points use normalized coordinates:
//! - X: -1.0 (left) to 1.0 (right)
//! - Y: -1.0 (bottom) to 1.0 (top)
//! - Colors: 8-bit R, G, B; blanked points travel with the beam dark
//!
//! # Example
//!
//! ```no_run
//! use etherdream_net::{discovery, ConnectionRegistry, Frame, Point};
//! use std::time::Duration;
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let registry = ConnectionRegistry::new();
//!
//!     for dac in discovery::discover(Duration::from_secs(2))? {
//!         println!("found DAC {} at {}", dac.mac, dac.source);
//!         let frame: Frame = (0..50)
//!             .map(|i| Point::new(i as f32 / 50.0, 0.0, 255, 0, 0))
//!             .collect();
//!         registry.send_frame(dac.control_addr(), frame);
//!     }
//!
//!     Ok(())
//! }
//! ```

pub mod connection;
mod correlator;
pub mod discovery;
mod error;
pub mod protocol;
pub mod registry;
pub mod status;
pub mod types;

pub use connection::{ConnectionState, DeviceConnection};
pub use discovery::{discover, DacDescriptor};
pub use error::{Error, Nak, Result};
pub use registry::ConnectionRegistry;
pub use status::{LightEngineState, PlaybackState, StatusSnapshot};
pub use types::{Frame, MacAddress, Point};
