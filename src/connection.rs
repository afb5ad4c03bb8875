//! One TCP session to one DAC: lifecycle, inbound demultiplexing, playback
//! state tracking, and the periodic streaming loop.
//!
//! A connected `DeviceConnection` runs two background threads. The reader
//! thread slices inbound bytes into 22-byte status frames and dispatches
//! them; the streaming thread ticks on a fixed 1 ms period and decides what
//! to send next based on the caller's intent and the device's last reported
//! state. Both threads are tied to the connection through a per-session stop
//! flag, so `destroy` never leaves a timer or socket behind.

use log::{debug, warn};
use std::collections::VecDeque;
use std::io::{self, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use crate::correlator::ResponseCorrelator;
use crate::error::{Error, Nak, Result};
use crate::protocol::{self, command, DacPoint, SizeBytes, StatusFrame, MAX_BATCH_POINTS};
use crate::status::{LightEngineState, PlaybackState, StatusSnapshot};
use crate::types::Frame;

/// Point rate used when the caller does not pick one.
pub const DEFAULT_POINT_RATE: u32 = 12_000;

/// Device buffer high-water mark; no data is sent while the last reported
/// fullness is at or above this.
pub const MAX_BUFFER_LEVEL: u16 = 1700;

/// Most frames that may wait in the queue; the oldest is dropped beyond this.
pub const FRAME_QUEUE_CAP: usize = 30;

/// Blanked points synthesized per tick when the queue runs dry, keeping the
/// device buffer from underflowing without illuminating anything.
const KEEPALIVE_POINTS: usize = 20;

const TICK_PERIOD: Duration = Duration::from_millis(1);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const COMMAND_TIMEOUT: Duration = Duration::from_millis(1000);
const DATA_TIMEOUT: Duration = Duration::from_millis(500);

/// Connection lifecycle state. Exactly one at a time; the only path is
/// Disconnected -> Connecting -> Connected -> Disconnected.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

/// A streaming session with a single DAC.
pub struct DeviceConnection {
    addr: SocketAddr,
    point_rate: u32,
    max_buffer_level: u16,
    inner: Mutex<Inner>,
    correlator: ResponseCorrelator,
    /// Serializes command exchanges so no two requests with the same
    /// command byte are ever in flight at once.
    command_lock: Mutex<()>,
}

struct Inner {
    state: ConnectionState,
    laser_active: bool,
    queue: VecDeque<Frame>,
    snapshot: Option<StatusSnapshot>,
    /// Write half of the session socket; `None` unless connected.
    socket: Option<TcpStream>,
    /// Stop flag shared with the current session's threads.
    session_stop: Option<Arc<AtomicBool>>,
}

impl DeviceConnection {
    /// Creates a disconnected connection for the DAC at `addr` using the
    /// default point rate.
    pub fn new(addr: SocketAddr) -> Self {
        Self::with_point_rate(addr, DEFAULT_POINT_RATE)
    }

    /// Creates a disconnected connection with a fixed point rate.
    pub fn with_point_rate(addr: SocketAddr, point_rate: u32) -> Self {
        Self {
            addr,
            point_rate,
            max_buffer_level: MAX_BUFFER_LEVEL,
            inner: Mutex::new(Inner {
                state: ConnectionState::Disconnected,
                laser_active: false,
                queue: VecDeque::new(),
                snapshot: None,
                socket: None,
                session_stop: None,
            }),
            correlator: ResponseCorrelator::new(),
            command_lock: Mutex::new(()),
        }
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn point_rate(&self) -> u32 {
        self.point_rate
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.lock().unwrap().state
    }

    /// The device's last reported status, if any frame has arrived yet.
    pub fn status(&self) -> Option<StatusSnapshot> {
        self.inner.lock().unwrap().snapshot
    }

    /// Number of frames currently waiting in the queue.
    pub fn queued_frames(&self) -> usize {
        self.inner.lock().unwrap().queue.len()
    }

    /// Whether the caller currently wants light output.
    pub fn laser_active(&self) -> bool {
        self.inner.lock().unwrap().laser_active
    }

    /// Opens the TCP session and starts the reader and streaming threads.
    ///
    /// A no-op when already connecting or connected. Blocks for at most the
    /// 5 second connect deadline; on failure the connection is torn back
    /// down and the error reported to this caller only.
    pub fn connect(self: &Arc<Self>) -> Result<()> {
        {
            let mut inner = self.inner.lock().unwrap();
            match inner.state {
                ConnectionState::Connecting | ConnectionState::Connected => return Ok(()),
                ConnectionState::Disconnected => inner.state = ConnectionState::Connecting,
            }
        }

        debug!("[{}] connecting", self.addr);
        let stream = match TcpStream::connect_timeout(&self.addr, CONNECT_TIMEOUT) {
            Ok(stream) => stream,
            Err(err) => {
                self.destroy();
                return Err(if err.kind() == io::ErrorKind::TimedOut {
                    Error::ConnectTimeout
                } else {
                    Error::Socket(err)
                });
            }
        };

        // Favor latency over throughput on the control stream.
        let setup = stream.set_nodelay(true).and_then(|()| stream.try_clone());
        let reader = match setup {
            Ok(reader) => reader,
            Err(err) => {
                self.destroy();
                return Err(Error::Socket(err));
            }
        };

        let stop = Arc::new(AtomicBool::new(false));
        {
            let mut inner = self.inner.lock().unwrap();
            // Destroyed while the handshake was in flight.
            if inner.state != ConnectionState::Connecting {
                drop(inner);
                let _ = stream.shutdown(Shutdown::Both);
                return Err(Error::ConnectionClosed);
            }
            inner.socket = Some(stream);
            inner.session_stop = Some(stop.clone());
            inner.state = ConnectionState::Connected;
        }
        debug!("[{}] connected", self.addr);

        let conn = Arc::clone(self);
        let read_stop = stop.clone();
        thread::spawn(move || conn.read_loop(reader, read_stop));

        let conn = Arc::clone(self);
        thread::spawn(move || conn.stream_loop(stop));

        Ok(())
    }

    /// Queues one frame for output and switches the laser on.
    ///
    /// The queue is an explicit lossy buffer: beyond 30 entries the oldest
    /// frame is dropped, never the newest.
    pub fn enqueue_frame(&self, frame: Frame) {
        let mut inner = self.inner.lock().unwrap();
        inner.laser_active = true;
        inner.queue.push_back(frame);
        if inner.queue.len() > FRAME_QUEUE_CAP {
            inner.queue.pop_front();
        }
    }

    /// Switches the laser off, clears pending frames and, when connected,
    /// sends Stop and awaits its result.
    pub fn stop(&self) -> Result<()> {
        let connected = {
            let mut inner = self.inner.lock().unwrap();
            inner.laser_active = false;
            inner.queue.clear();
            inner.state == ConnectionState::Connected
        };
        if connected {
            self.transact(command::STOP, &protocol::encode_stop(), COMMAND_TIMEOUT)?;
        }
        Ok(())
    }

    /// Tears the session down: stops both threads, closes the socket,
    /// resolves every pending request as closed and clears the queue.
    ///
    /// Idempotent and safe to call from any thread, including the session's
    /// own reader thread on a socket error.
    pub fn destroy(&self) {
        let (socket, stop) = {
            let mut inner = self.inner.lock().unwrap();
            inner.state = ConnectionState::Disconnected;
            inner.laser_active = false;
            inner.queue.clear();
            inner.snapshot = None;
            (inner.socket.take(), inner.session_stop.take())
        };
        if let Some(stop) = stop {
            stop.store(true, Ordering::Relaxed);
        }
        if let Some(socket) = socket {
            let _ = socket.shutdown(Shutdown::Both);
            debug!("[{}] destroyed", self.addr);
        }
        self.correlator.fail_all();
    }

    /// Reads the session socket, slicing complete 22-byte frames off the
    /// front of the accumulator and dispatching each in arrival order.
    fn read_loop(self: Arc<Self>, mut socket: TcpStream, stop: Arc<AtomicBool>) {
        let mut accumulator: Vec<u8> = Vec::new();
        let mut buf = [0u8; 512];
        while !stop.load(Ordering::Relaxed) {
            match socket.read(&mut buf) {
                Ok(0) => {
                    debug!("[{}] peer closed the connection", self.addr);
                    break;
                }
                Ok(n) => {
                    accumulator.extend_from_slice(&buf[..n]);
                    while accumulator.len() >= StatusFrame::SIZE_BYTES {
                        // Length was just checked, so decode cannot fail.
                        let Ok(frame) = StatusFrame::decode(&accumulator) else {
                            break;
                        };
                        accumulator.drain(..StatusFrame::SIZE_BYTES);
                        self.dispatch(frame);
                    }
                }
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => {
                    if !stop.load(Ordering::Relaxed) {
                        warn!("[{}] socket error: {}", self.addr, err);
                    }
                    break;
                }
            }
        }
        // Socket error or peer close forces full teardown; a deliberate
        // destroy already ran it.
        if !stop.load(Ordering::Relaxed) {
            self.destroy();
        }
    }

    /// Applies one inbound frame: live status first, then the correlator.
    ///
    /// The snapshot is replaced even when no request is waiting - that is
    /// how passive status tracking works. A frame whose status block fails
    /// typed decoding still completes its waiter so the sender can inspect
    /// the raw response.
    fn dispatch(&self, frame: StatusFrame) {
        match StatusSnapshot::from_wire(&frame.status) {
            Ok(snapshot) => {
                self.inner.lock().unwrap().snapshot = Some(snapshot);
            }
            Err(err) => warn!("[{}] undecodable status: {}", self.addr, err),
        }
        self.correlator.complete(frame);
    }

    /// The fixed-period streaming loop.
    fn stream_loop(self: Arc<Self>, stop: Arc<AtomicBool>) {
        while !stop.load(Ordering::Relaxed) {
            thread::sleep(TICK_PERIOD);
            if stop.load(Ordering::Relaxed) {
                break;
            }
            match self.tick() {
                Ok(()) => {}
                Err(Error::ConnectionClosed) => break,
                // NAKs and timeouts are local to this tick; state is
                // unchanged and the next tick retries from scratch.
                Err(err) => debug!("[{}] tick aborted: {}", self.addr, err),
            }
        }
    }

    /// One tick of the streaming loop, evaluated in strict priority order:
    /// laser-off, e-stop, playback initialization, data send.
    fn tick(&self) -> Result<()> {
        let (laser_active, snapshot) = {
            let inner = self.inner.lock().unwrap();
            if inner.state != ConnectionState::Connected {
                return Err(Error::ConnectionClosed);
            }
            (inner.laser_active, inner.snapshot)
        };

        // Nothing is known about the device until its first status frame
        // (it pushes one unsolicited right after accepting the connection).
        let Some(snapshot) = snapshot else {
            return Ok(());
        };

        if !laser_active {
            if snapshot.playback != PlaybackState::Idle {
                self.transact(command::STOP, &protocol::encode_stop(), COMMAND_TIMEOUT)?;
            }
            return Ok(());
        }

        if snapshot.light_engine == LightEngineState::EmergencyStop {
            self.transact(
                command::CLEAR_ESTOP,
                &protocol::encode_clear_estop(),
                COMMAND_TIMEOUT,
            )?;
            return Ok(());
        }

        if snapshot.playback == PlaybackState::Idle {
            // Prepare then Begin, each requiring an ACK. The tracked state
            // only moves once the next inbound status frame says so; a
            // failure here leaves it Idle and the next tick retries.
            self.transact(command::PREPARE, &protocol::encode_prepare(), COMMAND_TIMEOUT)?;
            let begin = protocol::encode_begin(self.point_rate)?;
            self.transact(command::BEGIN, &begin, COMMAND_TIMEOUT)?;
            return Ok(());
        }

        // Prepared or Playing: top the device buffer up. A gated tick pings
        // instead, since fullness only refreshes when a response arrives.
        if snapshot.buffer_fullness >= self.max_buffer_level {
            self.transact(command::PING, &protocol::encode_ping(), COMMAND_TIMEOUT)?;
            return Ok(());
        }
        let batch = self.next_batch();
        self.send_batch(&batch)
    }

    /// Takes the next batch to send: up to 80 points from the head frame
    /// (longer frames drain across several ticks), or a synthesized run of
    /// blanked origin points when the queue is empty.
    fn next_batch(&self) -> Vec<DacPoint> {
        let mut inner = self.inner.lock().unwrap();
        match inner.queue.front_mut() {
            Some(frame) => {
                let n = frame.points.len().min(MAX_BATCH_POINTS);
                let batch: Vec<DacPoint> =
                    frame.points.drain(..n).map(|p| DacPoint::from(&p)).collect();
                if frame.points.is_empty() {
                    inner.queue.pop_front();
                }
                batch
            }
            None => vec![DacPoint::default(); KEEPALIVE_POINTS],
        }
    }

    /// Writes one combined rate+data packet and awaits both ACKs.
    ///
    /// Both waiters are registered before the write so neither response can
    /// slip past, and both waits share one 500 ms deadline measured from the
    /// write (a completed response buffers in its channel, so waiting on the
    /// rate first costs the data wait nothing). Any NAK or timeout ends the
    /// tick - the device status is still whatever dispatch applied.
    fn send_batch(&self, points: &[DacPoint]) -> Result<()> {
        let _exchange = self.command_lock.lock().unwrap();
        let pending_rate = self.correlator.register(command::SET_RATE);
        let pending_data = self.correlator.register(command::WRITE_DATA);

        let packet = protocol::encode_rate_and_batch(self.point_rate, points)?;
        self.write_packet(&packet)?;

        let deadline = Instant::now() + DATA_TIMEOUT;
        let rate_response = pending_rate.wait_until(deadline)?;
        let data_response = pending_data.wait_until(deadline)?;
        for response in [&rate_response, &data_response] {
            if let Some(nak) = Nak::from_response(response.response) {
                return Err(Error::Nak(nak));
            }
        }
        Ok(())
    }

    /// Sends one command packet and awaits its ACK.
    fn transact(&self, cmd: u8, packet: &[u8], timeout: Duration) -> Result<StatusFrame> {
        let _exchange = self.command_lock.lock().unwrap();
        let pending = self.correlator.register(cmd);
        self.write_packet(packet)?;
        let frame = pending.wait(timeout)?;
        match Nak::from_response(frame.response) {
            Some(nak) => Err(Error::Nak(nak)),
            None => Ok(frame),
        }
    }

    /// Writes outside the state lock so a stalled send never blocks
    /// dispatch or the state accessors.
    fn write_packet(&self, packet: &[u8]) -> Result<()> {
        let socket = {
            let inner = self.inner.lock().unwrap();
            match inner.socket.as_ref() {
                Some(socket) => socket.try_clone(),
                None => return Err(Error::ConnectionClosed),
            }
        };
        let result = socket.and_then(|mut socket| socket.write_all(packet));
        if let Err(err) = result {
            // A dead socket takes the whole session with it.
            warn!("[{}] write failed: {}", self.addr, err);
            self.destroy();
            return Err(Error::Socket(err));
        }
        Ok(())
    }
}

impl Drop for DeviceConnection {
    fn drop(&mut self) {
        self.destroy();
    }
}
