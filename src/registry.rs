//! Tracks one [`DeviceConnection`] per DAC address.
//!
//! The registry is the multi-projector entry point: callers address devices
//! by socket address and the registry lazily opens and reuses the underlying
//! connections. All methods take `&self`, so a single registry can be shared
//! across threads behind an `Arc`.

use log::warn;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::thread;

use crate::connection::{ConnectionState, DeviceConnection};
use crate::error::Result;
use crate::types::Frame;

#[derive(Default)]
pub struct ConnectionRegistry {
    connections: Mutex<HashMap<SocketAddr, Arc<DeviceConnection>>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the connection for `addr`, creating a disconnected one first
    /// if none exists yet.
    pub fn get_or_create(&self, addr: SocketAddr) -> Arc<DeviceConnection> {
        let mut connections = self.connections.lock().unwrap();
        connections
            .entry(addr)
            .or_insert_with(|| Arc::new(DeviceConnection::new(addr)))
            .clone()
    }

    /// Returns the connection for `addr` if one has been created.
    pub fn get(&self, addr: SocketAddr) -> Option<Arc<DeviceConnection>> {
        self.connections.lock().unwrap().get(&addr).cloned()
    }

    /// Queues a frame for the DAC at `addr`, kicking off a connect in the
    /// background if none is underway.
    ///
    /// Never blocks on the handshake: the frame is queued immediately and
    /// streaming picks it up once the device reports ready. A failed connect
    /// is logged, not surfaced; the next `send_frame` retries.
    pub fn send_frame(&self, addr: SocketAddr, frame: Frame) {
        let connection = self.get_or_create(addr);
        connection.enqueue_frame(frame);
        if connection.state() == ConnectionState::Disconnected {
            let connection = Arc::clone(&connection);
            thread::spawn(move || {
                if let Err(err) = connection.connect() {
                    warn!("[{}] connect failed: {}", connection.addr(), err);
                }
            });
        }
    }

    /// Stops output on the DAC at `addr`. A no-op for unknown addresses.
    pub fn stop(&self, addr: SocketAddr) -> Result<()> {
        match self.get(addr) {
            Some(connection) => connection.stop(),
            None => Ok(()),
        }
    }

    /// Tears down every connection and empties the registry.
    pub fn close_all(&self) {
        let connections: Vec<_> = {
            let mut map = self.connections.lock().unwrap();
            map.drain().collect()
        };
        for (addr, connection) in connections {
            if let Err(err) = connection.stop() {
                warn!("[{}] stop on shutdown failed: {}", addr, err);
            }
            connection.destroy();
        }
    }

    /// Number of tracked connections, connected or not.
    pub fn len(&self) -> usize {
        self.connections.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.lock().unwrap().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Point;
    use std::net::TcpListener;

    fn addr(port: u16) -> SocketAddr {
        format!("127.0.0.1:{}", port).parse().unwrap()
    }

    fn one_point_frame() -> Frame {
        Frame::new(vec![Point::blanked(0.0, 0.0)])
    }

    #[test]
    fn get_or_create_reuses_the_same_connection() {
        let registry = ConnectionRegistry::new();
        let first = registry.get_or_create(addr(7765));
        let second = registry.get_or_create(addr(7765));
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn distinct_addresses_get_distinct_connections() {
        let registry = ConnectionRegistry::new();
        let a = registry.get_or_create(addr(7765));
        let b = registry.get_or_create(addr(7766));
        assert!(!Arc::ptr_eq(&a, &b));
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn get_does_not_create() {
        let registry = ConnectionRegistry::new();
        assert!(registry.get(addr(7765)).is_none());
        assert!(registry.is_empty());
    }

    #[test]
    fn send_frame_enqueues_before_the_handshake_completes() {
        // A listener that accepts but never speaks keeps the session in
        // limbo: the frame must already be queued when send_frame returns.
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let target = listener.local_addr().unwrap();

        let registry = ConnectionRegistry::new();
        registry.send_frame(target, one_point_frame());

        let connection = registry.get(target).expect("connection created");
        assert_eq!(connection.queued_frames(), 1);
        assert!(connection.laser_active());

        connection.destroy();
    }

    #[test]
    fn send_frame_does_not_surface_connect_failure() {
        let registry = ConnectionRegistry::new();
        // Port 1 on loopback refuses; the call must neither block on the
        // 5 second deadline nor report the failure to the sender.
        registry.send_frame(addr(1), one_point_frame());
        assert!(registry.get(addr(1)).is_some());
    }

    #[test]
    fn stop_on_unknown_address_is_a_no_op() {
        let registry = ConnectionRegistry::new();
        registry.stop(addr(7765)).unwrap();
        assert!(registry.is_empty());
    }

    #[test]
    fn close_all_destroys_and_forgets_connections() {
        let registry = ConnectionRegistry::new();
        let connection = registry.get_or_create(addr(7765));
        registry.get_or_create(addr(7766));

        registry.close_all();
        assert!(registry.is_empty());
        assert_eq!(connection.state(), ConnectionState::Disconnected);
    }
}
