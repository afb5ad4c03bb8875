//! End-to-end streaming tests against a mock DAC.
//!
//! The mock speaks just enough of the TCP control protocol to exercise the
//! full lifecycle: unsolicited status on accept, command parsing, ACK/NAK
//! responses and playback state transitions.

use std::io::{Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use etherdream_net::protocol::{
    command, DacStatus, SizeBytes, StatusFrame, WriteBytes, MAX_BATCH_POINTS,
};
use etherdream_net::{
    ConnectionState, DeviceConnection, Frame, LightEngineState, PlaybackState, Point,
};

#[derive(Clone)]
struct MockState {
    light_engine_state: u8,
    playback_state: u8,
    buffer_fullness: u16,
    /// Sizes of the WriteData batches received, in order.
    batches: Vec<usize>,
    /// When set, WriteData commands are answered with NAK-Full.
    nak_data: bool,
    prepares: usize,
    begins: usize,
    stops: usize,
    estop_clears: usize,
}

impl MockState {
    fn new() -> Self {
        Self {
            light_engine_state: DacStatus::LIGHT_ENGINE_READY,
            playback_state: DacStatus::PLAYBACK_IDLE,
            buffer_fullness: 0,
            batches: Vec::new(),
            nak_data: false,
            prepares: 0,
            begins: 0,
            stops: 0,
            estop_clears: 0,
        }
    }

    fn points_received(&self) -> usize {
        self.batches.iter().sum()
    }
}

struct MockDac {
    addr: SocketAddr,
    state: Arc<Mutex<MockState>>,
}

impl MockDac {
    fn spawn() -> Self {
        Self::spawn_with(MockState::new())
    }

    fn spawn_with(initial: MockState) -> Self {
        let _ = env_logger::builder().is_test(true).try_init();
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind mock listener");
        let addr = listener.local_addr().expect("mock local addr");
        let state = Arc::new(Mutex::new(initial));

        let server_state = state.clone();
        thread::spawn(move || {
            if let Ok((socket, _)) = listener.accept() {
                serve(socket, server_state);
            }
        });

        MockDac { addr, state }
    }

    fn state(&self) -> MockState {
        self.state.lock().unwrap().clone()
    }

    fn set_buffer_fullness(&self, fullness: u16) {
        self.state.lock().unwrap().buffer_fullness = fullness;
    }
}

fn serve(mut socket: TcpStream, state: Arc<Mutex<MockState>>) {
    // The device greets every new connection with one status frame.
    let greeting = respond(&state, StatusFrame::ACK, command::PING);
    if socket.write_all(&greeting).is_err() {
        return;
    }

    let mut pending: Vec<u8> = Vec::new();
    let mut buf = [0u8; 4096];
    loop {
        let n = match socket.read(&mut buf) {
            Ok(0) | Err(_) => return,
            Ok(n) => n,
        };
        pending.extend_from_slice(&buf[..n]);

        while let Some((consumed, response)) = parse_command(&pending, &state) {
            pending.drain(..consumed);
            if socket.write_all(&response).is_err() {
                return;
            }
        }
    }
}

/// Parses one command off the front of `pending`, applies it to the mock
/// state and returns (bytes consumed, response frame bytes).
fn parse_command(pending: &[u8], state: &Mutex<MockState>) -> Option<(usize, Vec<u8>)> {
    let cmd = *pending.first()?;
    let mut state = state.lock().unwrap();
    match cmd {
        command::PREPARE => {
            state.prepares += 1;
            state.playback_state = DacStatus::PLAYBACK_PREPARED;
            Some((1, encode_response(&state, StatusFrame::ACK, cmd)))
        }
        command::BEGIN => {
            if pending.len() < 7 {
                return None;
            }
            state.begins += 1;
            state.playback_state = DacStatus::PLAYBACK_PLAYING;
            Some((7, encode_response(&state, StatusFrame::ACK, cmd)))
        }
        command::SET_RATE => {
            if pending.len() < 5 {
                return None;
            }
            Some((5, encode_response(&state, StatusFrame::ACK, cmd)))
        }
        command::WRITE_DATA => {
            if pending.len() < 3 {
                return None;
            }
            let count = u16::from_le_bytes([pending[1], pending[2]]) as usize;
            let len = 3 + count * 18;
            if pending.len() < len {
                return None;
            }
            let response = if state.nak_data {
                StatusFrame::NAK_FULL
            } else {
                state.batches.push(count);
                StatusFrame::ACK
            };
            Some((len, encode_response(&state, response, cmd)))
        }
        command::PING => Some((1, encode_response(&state, StatusFrame::ACK, cmd))),
        command::STOP => {
            state.stops += 1;
            state.playback_state = DacStatus::PLAYBACK_IDLE;
            Some((1, encode_response(&state, StatusFrame::ACK, cmd)))
        }
        command::CLEAR_ESTOP => {
            state.estop_clears += 1;
            state.light_engine_state = DacStatus::LIGHT_ENGINE_READY;
            Some((1, encode_response(&state, StatusFrame::ACK, cmd)))
        }
        other => Some((1, encode_response(&state, StatusFrame::NAK_INVALID, other))),
    }
}

fn respond(state: &Mutex<MockState>, response: u8, cmd: u8) -> Vec<u8> {
    encode_response(&state.lock().unwrap(), response, cmd)
}

fn encode_response(state: &MockState, response: u8, cmd: u8) -> Vec<u8> {
    let frame = StatusFrame {
        response,
        command: cmd,
        status: DacStatus {
            protocol: 1,
            light_engine_state: state.light_engine_state,
            playback_state: state.playback_state,
            buffer_fullness: state.buffer_fullness,
            point_rate: 12_000,
            ..Default::default()
        },
    };
    let mut bytes = Vec::with_capacity(StatusFrame::SIZE_BYTES);
    bytes.write_bytes(frame).expect("encode mock frame");
    bytes
}

fn wait_until(deadline: Duration, mut check: impl FnMut() -> bool) -> bool {
    let end = Instant::now() + deadline;
    while Instant::now() < end {
        if check() {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    check()
}

fn lit_frame(points: usize) -> Frame {
    (0..points)
        .map(|i| Point::new(i as f32 / points as f32, 0.0, 255, 128, 0))
        .collect()
}

#[test]
fn connect_applies_the_greeting_status() {
    let mock = MockDac::spawn();
    let conn = Arc::new(DeviceConnection::new(mock.addr));
    conn.connect().expect("connect");

    assert!(wait_until(Duration::from_secs(1), || conn.status().is_some()));
    let status = conn.status().expect("status after greeting");
    assert_eq!(status.light_engine, LightEngineState::Ready);
    assert_eq!(status.playback, PlaybackState::Idle);
    assert_eq!(conn.state(), ConnectionState::Connected);

    conn.destroy();
}

#[test]
fn streaming_prepares_begins_and_delivers_points() {
    let mock = MockDac::spawn();
    let conn = Arc::new(DeviceConnection::new(mock.addr));
    conn.connect().expect("connect");

    conn.enqueue_frame(lit_frame(50));

    assert!(wait_until(Duration::from_secs(2), || {
        mock.state().points_received() >= 50
    }));
    let state = mock.state();
    assert_eq!(state.prepares, 1);
    assert_eq!(state.begins, 1);
    // The 50-point frame fits a single batch.
    assert!(state.batches.contains(&50));
    assert_eq!(conn.queued_frames(), 0);

    conn.destroy();
}

#[test]
fn long_frames_split_into_batches_of_at_most_eighty() {
    let mock = MockDac::spawn();
    let conn = Arc::new(DeviceConnection::new(mock.addr));
    conn.connect().expect("connect");

    conn.enqueue_frame(lit_frame(200));

    assert!(wait_until(Duration::from_secs(2), || {
        mock.state().points_received() >= 200
    }));
    let state = mock.state();
    // 200 points arrive as 80 + 80 + 40, possibly followed by keepalives.
    assert_eq!(&state.batches[..3], &[MAX_BATCH_POINTS, MAX_BATCH_POINTS, 40]);
    assert!(state.batches.iter().all(|&n| n <= MAX_BATCH_POINTS));

    conn.destroy();
}

#[test]
fn empty_queue_keeps_streaming_blanked_points() {
    let mock = MockDac::spawn();
    let conn = Arc::new(DeviceConnection::new(mock.addr));
    conn.connect().expect("connect");

    conn.enqueue_frame(lit_frame(10));
    assert!(wait_until(Duration::from_secs(2), || {
        // Keepalive batches are exactly 20 points.
        mock.state().batches.iter().any(|&n| n == 20)
    }));

    conn.destroy();
}

#[test]
fn stop_halts_playback_on_the_device() {
    let mock = MockDac::spawn();
    let conn = Arc::new(DeviceConnection::new(mock.addr));
    conn.connect().expect("connect");

    conn.enqueue_frame(lit_frame(10));
    assert!(wait_until(Duration::from_secs(2), || {
        mock.state().points_received() >= 10
    }));

    conn.stop().expect("stop");
    assert!(!conn.laser_active());
    assert!(wait_until(Duration::from_secs(1), || mock.state().stops >= 1));
    assert_eq!(conn.state(), ConnectionState::Connected);

    conn.destroy();
}

#[test]
fn emergency_stop_is_cleared_before_streaming() {
    let mut initial = MockState::new();
    initial.light_engine_state = DacStatus::LIGHT_ENGINE_EMERGENCY_STOP;
    let mock = MockDac::spawn_with(initial);

    let conn = Arc::new(DeviceConnection::new(mock.addr));
    conn.connect().expect("connect");
    conn.enqueue_frame(lit_frame(10));

    assert!(wait_until(Duration::from_secs(2), || {
        mock.state().points_received() >= 10
    }));
    let state = mock.state();
    assert_eq!(state.estop_clears, 1);
    // The clear happened before playback was brought up.
    assert_eq!(state.prepares, 1);

    conn.destroy();
}

#[test]
fn full_device_buffer_gates_data() {
    let mock = MockDac::spawn();
    mock.set_buffer_fullness(1800);

    let conn = Arc::new(DeviceConnection::new(mock.addr));
    conn.connect().expect("connect");
    conn.enqueue_frame(lit_frame(10));

    // Playback comes up, but no data flows while fullness reads >= 1700.
    assert!(wait_until(Duration::from_secs(1), || mock.state().begins >= 1));
    thread::sleep(Duration::from_millis(200));
    assert_eq!(mock.state().points_received(), 0);
    assert_eq!(conn.queued_frames(), 1);

    // Draining the device buffer resumes the stream.
    mock.set_buffer_fullness(0);
    assert!(wait_until(Duration::from_secs(2), || {
        mock.state().points_received() >= 10
    }));

    conn.destroy();
}

#[test]
fn data_nak_does_not_kill_the_connection() {
    let mut initial = MockState::new();
    initial.nak_data = true;
    let mock = MockDac::spawn_with(initial);

    let conn = Arc::new(DeviceConnection::new(mock.addr));
    conn.connect().expect("connect");
    conn.enqueue_frame(lit_frame(10));

    assert!(wait_until(Duration::from_secs(1), || mock.state().begins >= 1));
    thread::sleep(Duration::from_millis(100));
    assert_eq!(conn.state(), ConnectionState::Connected);

    // Accepting data again lets the loop recover on its own.
    mock.state.lock().unwrap().nak_data = false;
    assert!(wait_until(Duration::from_secs(2), || {
        mock.state().points_received() > 0
    }));

    conn.destroy();
}

#[test]
fn peer_close_tears_the_session_down() {
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
    let addr = listener.local_addr().expect("addr");
    thread::spawn(move || {
        // Greet, then hang up.
        if let Ok((mut socket, _)) = listener.accept() {
            let state = Mutex::new(MockState::new());
            let greeting = respond(&state, StatusFrame::ACK, command::PING);
            let _ = socket.write_all(&greeting);
        }
    });

    let conn = Arc::new(DeviceConnection::new(addr));
    conn.connect().expect("connect");

    assert!(wait_until(Duration::from_secs(2), || {
        conn.state() == ConnectionState::Disconnected
    }));
    assert_eq!(conn.status(), None);
}

#[test]
fn reconnect_after_destroy() {
    let mock = MockDac::spawn();
    let conn = Arc::new(DeviceConnection::new(mock.addr));
    conn.connect().expect("connect");
    assert!(wait_until(Duration::from_secs(1), || conn.status().is_some()));

    conn.destroy();
    assert_eq!(conn.state(), ConnectionState::Disconnected);

    // A fresh mock stands in for the device coming back.
    let mock = MockDac::spawn();
    let conn = Arc::new(DeviceConnection::new(mock.addr));
    conn.connect().expect("reconnect");
    assert!(wait_until(Duration::from_secs(1), || conn.status().is_some()));

    conn.destroy();
}
