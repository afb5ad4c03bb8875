//! Passive UDP discovery of DACs on the local network.
//!
//! Each powered-on device broadcasts an announcement datagram roughly once a
//! second on UDP port 7654. Discovery binds that port, collects datagrams for
//! a fixed window and reports each distinct device once, keyed by source IP
//! address.

use log::{debug, warn};
use socket2::{Domain, Protocol, SockAddr, Socket, Type};
use std::collections::HashSet;
use std::net::{IpAddr, Ipv4Addr, SocketAddr, SocketAddrV4, UdpSocket};
use std::time::{Duration, Instant};

use crate::error::Result;
use crate::protocol::{BROADCAST_PORT, COMMUNICATION_PORT};
use crate::types::MacAddress;

/// Announcement datagrams shorter than this are not broadcasts from a DAC.
const MIN_BROADCAST_LEN: usize = 36;

/// How long [`discover`] listens when the caller does not pick a window.
pub const DEFAULT_DISCOVERY_WINDOW: Duration = Duration::from_secs(2);

/// One DAC heard during a discovery window.
#[derive(Copy, Clone, Debug, Eq, Hash, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct DacDescriptor {
    /// Hardware address carried in the announcement payload.
    pub mac: MacAddress,
    /// Address the announcement arrived from.
    pub source: SocketAddr,
}

impl DacDescriptor {
    /// The TCP address to stream to this device on.
    pub fn control_addr(&self) -> SocketAddr {
        SocketAddr::new(self.source.ip(), COMMUNICATION_PORT)
    }
}

/// Listens on the standard announcement port for `window` and returns every
/// distinct DAC heard, in first-heard order.
pub fn discover(window: Duration) -> Result<Vec<DacDescriptor>> {
    discover_on(BROADCAST_PORT, window)
}

/// Like [`discover`] but on an explicit port.
pub fn discover_on(port: u16, window: Duration) -> Result<Vec<DacDescriptor>> {
    let socket = bind_broadcast_socket(port)?;
    collect_announcements(&socket, window)
}

/// Binds the announcement port with address reuse, so discovery can run next
/// to other listeners on the same host.
fn bind_broadcast_socket(port: u16) -> Result<UdpSocket> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_broadcast(true)?;
    socket.set_reuse_address(true)?;
    let bind_addr = SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, port);
    socket.bind(&SockAddr::from(bind_addr))?;
    Ok(socket.into())
}

fn collect_announcements(socket: &UdpSocket, window: Duration) -> Result<Vec<DacDescriptor>> {
    let deadline = Instant::now() + window;
    let mut seen_ips: HashSet<IpAddr> = HashSet::new();
    let mut found = Vec::new();
    let mut buf = [0u8; 512];

    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            break;
        }
        if let Err(err) = socket.set_read_timeout(Some(remaining)) {
            warn!("discovery deadline not applied: {}", err);
            break;
        }

        // A socket error ends the window early; whatever was heard so far
        // is still returned.
        let (len, source) = match socket.recv_from(&mut buf) {
            Ok(received) => received,
            Err(err) if is_timeout(&err) => break,
            Err(err) => {
                warn!("discovery socket error: {}", err);
                break;
            }
        };

        if len < MIN_BROADCAST_LEN {
            warn!(
                "ignoring runt datagram from {} ({} bytes, expected at least {})",
                source, len, MIN_BROADCAST_LEN
            );
            continue;
        }
        // One device may announce several times within the window.
        if !seen_ips.insert(source.ip()) {
            continue;
        }

        let mut mac = [0u8; 6];
        mac.copy_from_slice(&buf[..6]);
        let descriptor = DacDescriptor {
            mac: MacAddress(mac),
            source,
        };
        debug!("discovered DAC {} at {}", descriptor.mac, source);
        found.push(descriptor);
    }

    Ok(found)
}

fn is_timeout(err: &std::io::Error) -> bool {
    matches!(
        err.kind(),
        std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut
    )
}
