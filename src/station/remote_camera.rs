//! Station-side session: one per subscribed camera.
//!
//! [`SessionCore`] holds the protocol logic — stream parsing, the session
//! state machine, shadow-state command generation — with no sockets, so
//! every transition is unit-testable by feeding it bytes and timestamps.
//! [`RemoteCamera`] wraps a core in a dedicated thread owning the TCP
//! stream and the command UDP socket.
//!
//! # Shadow state
//!
//! For each commandable value the session keeps a pair: `new` is what the
//! station wants, `old` is what the camera last reported. Command packets
//! always carry the `new` values and are sent every 500 ms even when
//! nothing is pending (the datagram doubles as a keep-alive), so command
//! loss costs one cadence interval, nothing more.
//!
//! # State machine
//!
//! ```text
//! Connecting --(first valid packet)----> Connected
//! Connecting --(timeout 10 s)----------> Failed -> Closed
//! Connected  --(watchdog expired)------> Disconnected
//! Connected  --(peer FIN/socket error)-> Closed
//! Disconnected --(next valid packet)---> Connected
//! ```
//!
//! `connected(id)` fires only entering Connected; `disconnected(id)` only
//! on Connected -> Disconnected. Closed is terminal: discovery destroys
//! the session and builds a new one if the camera reappears.

use crate::codec::ImageDecoder;
use crate::frame::Frame;
use crate::saver::{FsMediaSink, ImageSaver};
use crate::types::{clamp_fps, CameraStatus, LightStatus, Resolution};
use crate::watchdog::{expected_interval, Watchdog};
use crate::wire::{CommandPacket, StreamParser};
use crossbeam_channel::{unbounded, Receiver, Sender};
use std::collections::VecDeque;
use std::io::{ErrorKind, Read};
use std::net::{IpAddr, SocketAddr, TcpStream, UdpSocket};
use std::path::PathBuf;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant, SystemTime};

/// Command datagram cadence
pub const COMMAND_INTERVAL: Duration = Duration::from_millis(500);

/// Time allowed to reach Connected before the session fails
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Decoded frames retained for motion detection / recording
const IMAGE_FIFO_LIMIT: usize = 16;

/// Resync events per second that mark a peer as corrupt
const RESYNC_RATE_LIMIT: usize = 10;

/// Focus pulse clears after this many command transmissions
const FOCUS_PACKET_LIMIT: u32 = 4;

/// ...or after this long, whichever comes first
const FOCUS_TIMEOUT: Duration = Duration::from_millis(2000);

/// Change notifications emitted by sessions and discovery
#[derive(Debug, Clone, PartialEq)]
pub enum StationEvent {
    CameraAdded { id: usize, name: String, address: IpAddr },
    CameraRemoved { id: usize },
    Connected { id: usize },
    Disconnected { id: usize },
    NewImage { id: usize },
    NewCameraStatus { id: usize, status: CameraStatus },
    NewCameraName { id: usize, name: String },
    NewCameraGroup { id: usize, group: String },
    FpsChanged { id: usize, fps: u8 },
    ResolutionChanged { id: usize, resolution: Resolution },
    LightStatusChanged { id: usize, status: LightStatus },
    AutoRegulateChanged { id: usize, enabled: bool },
}

/// Session lifecycle states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

/// `new` is what the station wants, `old` what the camera last reported
#[derive(Debug, Clone, Copy)]
struct Shadow<T: Copy + PartialEq> {
    old: T,
    new: T,
}

impl<T: Copy + PartialEq> Shadow<T> {
    fn new(value: T) -> Self {
        Self {
            old: value,
            new: value,
        }
    }

    /// Record a user request
    fn request(&mut self, value: T) {
        self.new = value;
    }

    /// Record the camera-reported value. While no request is pending both
    /// sides track the camera, so commands never fight the camera's own
    /// settings.
    fn observe(&mut self, value: T) {
        if self.old == self.new {
            self.new = value;
        }
        self.old = value;
    }
}

#[derive(Debug)]
struct FocusPulse {
    active: bool,
    sent: u32,
    since: Instant,
}

impl FocusPulse {
    fn idle(now: Instant) -> Self {
        Self {
            active: false,
            sent: 0,
            since: now,
        }
    }

    fn request(&mut self, now: Instant) {
        self.active = true;
        self.sent = 0;
        self.since = now;
    }

    /// Focus byte for the next command packet; counts the transmission
    fn sample(&mut self, now: Instant) -> bool {
        if self.active && now.duration_since(self.since) >= FOCUS_TIMEOUT {
            self.active = false;
        }
        if !self.active {
            return false;
        }
        self.sent += 1;
        if self.sent >= FOCUS_PACKET_LIMIT {
            self.active = false;
        }
        true
    }
}

/// Result of feeding received bytes into a session
#[derive(Debug, Default)]
pub struct Ingest {
    /// At least one valid packet arrived (feed the watchdog)
    pub fed: bool,
    /// The peer is corrupt; close the session
    pub close: bool,
    /// JPEG payloads to hand to the recorder
    pub jpegs: Vec<Vec<u8>>,
}

/// Protocol state of one camera session, free of any I/O
pub struct SessionCore {
    id: usize,
    name: String,
    group: String,
    fps: Shadow<u8>,
    resolution: Shadow<Resolution>,
    light: Shadow<LightStatus>,
    auto_regulate: Shadow<bool>,
    status: CameraStatus,
    state: SessionState,
    focus: FocusPulse,
    photo_pending: bool,
    image_quality: u8,
    save_incoming: bool,
    parser: StreamParser,
    seen_resyncs: u64,
    resync_times: VecDeque<Instant>,
    images: VecDeque<Frame>,
    current_image: Option<Frame>,
    decode_errors: u64,
    events: Sender<StationEvent>,
}

impl SessionCore {
    pub fn new(id: usize, events: Sender<StationEvent>, now: Instant) -> Self {
        let mut status = CameraStatus::OK;
        status.insert(CameraStatus::DISCONNECTED);
        Self {
            id,
            name: "Unknown Camera".into(),
            group: "default".into(),
            fps: Shadow::new(24),
            resolution: Shadow::new(Resolution::Vga),
            light: Shadow::new(LightStatus::Off),
            auto_regulate: Shadow::new(true),
            status,
            state: SessionState::Connecting,
            focus: FocusPulse::idle(now),
            photo_pending: false,
            image_quality: 75,
            save_incoming: false,
            parser: StreamParser::new(),
            seen_resyncs: 0,
            resync_times: VecDeque::new(),
            images: VecDeque::new(),
            current_image: None,
            decode_errors: 0,
            events,
        }
    }

    pub fn id(&self) -> usize {
        self.id
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn status(&self) -> CameraStatus {
        self.status
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_connected(&self) -> bool {
        self.state == SessionState::Connected
    }

    pub fn current_image(&self) -> Option<&Frame> {
        self.current_image.as_ref()
    }

    pub fn image_fifo_len(&self) -> usize {
        self.images.len()
    }

    pub fn decode_errors(&self) -> u64 {
        self.decode_errors
    }

    pub fn bad_crc_count(&self) -> u64 {
        self.parser.bad_crc_count()
    }

    /// Watchdog interval derived from the camera-reported frame rate
    pub fn expected_interval(&self) -> Duration {
        expected_interval(self.fps.old)
    }

    // ------------------------------------------------------------------
    // Station requests
    // ------------------------------------------------------------------

    pub fn change_fps(&mut self, fps: i32) {
        self.fps.request(clamp_fps(fps));
    }

    pub fn change_resolution(&mut self, resolution: Resolution) {
        self.resolution.request(resolution);
    }

    pub fn change_flashlight_status(&mut self, status: LightStatus) {
        self.light.request(status);
    }

    pub fn change_auto_regulate(&mut self, enabled: bool) {
        self.auto_regulate.request(enabled);
        let _ = self.events.send(StationEvent::AutoRegulateChanged {
            id: self.id,
            enabled,
        });
    }

    pub fn request_focus(&mut self, now: Instant) {
        self.focus.request(now);
    }

    /// Ask the camera to persist a still photo on its side
    pub fn request_photo(&mut self) {
        self.photo_pending = true;
    }

    pub fn set_image_quality(&mut self, quality: u8) {
        self.image_quality = quality.min(100);
    }

    /// Advertised target encoder quality. Held as session state; the
    /// fixed command datagram does not carry it yet.
    pub fn image_quality(&self) -> u8 {
        self.image_quality
    }

    pub fn set_save_incoming_media(&mut self, save: bool) {
        self.save_incoming = save;
    }

    // ------------------------------------------------------------------
    // Stream ingestion
    // ------------------------------------------------------------------

    /// Feed received stream bytes; parses every complete packet and
    /// tracks the resync rate.
    pub fn ingest(&mut self, bytes: &[u8], now: Instant, decoder: &dyn ImageDecoder) -> Ingest {
        self.parser.push(bytes);
        let mut outcome = Ingest::default();

        while let Some(packet) = self.parser.next_packet() {
            self.apply_packet(packet, decoder, &mut outcome.jpegs);
            outcome.fed = true;
        }

        let total = self.parser.resync_events();
        for _ in self.seen_resyncs..total {
            self.resync_times.push_back(now);
        }
        self.seen_resyncs = total;
        while let Some(&front) = self.resync_times.front() {
            if now.duration_since(front) > Duration::from_secs(1) {
                self.resync_times.pop_front();
            } else {
                break;
            }
        }
        if self.resync_times.len() > RESYNC_RATE_LIMIT {
            log::warn!(
                "Session {}: {} resync events within a second, peer is corrupt",
                self.id,
                self.resync_times.len()
            );
            outcome.close = true;
        }

        outcome
    }

    fn apply_packet(
        &mut self,
        packet: crate::wire::StreamPacket,
        decoder: &dyn ImageDecoder,
        jpegs: &mut Vec<Vec<u8>>,
    ) {
        self.set_state(SessionState::Connected);

        let name = if packet.name.is_empty() {
            "Unknown Camera".to_string()
        } else {
            packet.name
        };
        if name != self.name {
            self.name = name.clone();
            let _ = self
                .events
                .send(StationEvent::NewCameraName { id: self.id, name });
        }

        let group = if packet.group.is_empty() {
            "default".to_string()
        } else {
            packet.group
        };
        if group != self.group {
            self.group = group.clone();
            let _ = self
                .events
                .send(StationEvent::NewCameraGroup { id: self.id, group });
        }

        let fps = clamp_fps(packet.fps as i32);
        if fps != self.fps.old {
            let _ = self.events.send(StationEvent::FpsChanged { id: self.id, fps });
        }
        self.fps.observe(fps);

        if packet.resolution != self.resolution.old {
            let _ = self.events.send(StationEvent::ResolutionChanged {
                id: self.id,
                resolution: packet.resolution,
            });
        }
        self.resolution.observe(packet.resolution);

        if packet.light != self.light.old {
            let _ = self.events.send(StationEvent::LightStatusChanged {
                id: self.id,
                status: packet.light,
            });
        }
        self.light.observe(packet.light);

        // The reported status never carries DISCONNECTED, so assigning it
        // clears the sticky flag set by a watchdog expiry
        if packet.status != self.status {
            self.status = packet.status;
            let _ = self.events.send(StationEvent::NewCameraStatus {
                id: self.id,
                status: self.status,
            });
        }

        match decoder.decode(&packet.image) {
            Ok(frame) => {
                if self.images.len() >= IMAGE_FIFO_LIMIT {
                    self.images.pop_front();
                }
                self.images.push_back(frame.clone());
                self.current_image = Some(frame);
                let _ = self.events.send(StationEvent::NewImage { id: self.id });
                if self.save_incoming {
                    jpegs.push(packet.image);
                }
            }
            Err(e) => {
                self.decode_errors += 1;
                log::debug!(
                    "Session {}: frame decode failed ({} total): {}",
                    self.id,
                    self.decode_errors,
                    e
                );
            }
        }
    }

    // ------------------------------------------------------------------
    // Command generation
    // ------------------------------------------------------------------

    /// Build the next command datagram. Sent every 500 ms regardless of
    /// pending changes; an unchanged packet is the keep-alive.
    pub fn command_tick(&mut self, now: Instant) -> CommandPacket {
        let focus = self.focus.sample(now);
        let save_photo = std::mem::take(&mut self.photo_pending);
        CommandPacket {
            fps: self.fps.new,
            resolution: self.resolution.new,
            light: self.light.new,
            focus,
            auto_regulate: self.auto_regulate.new,
            save_photo,
        }
    }

    // ------------------------------------------------------------------
    // State machine
    // ------------------------------------------------------------------

    pub fn on_watchdog_expired(&mut self) {
        if self.state != SessionState::Connected {
            return;
        }
        log::warn!("Session {} ({}): stream watchdog expired", self.id, self.name);
        self.set_state(SessionState::Disconnected);
        if !self.status.is_disconnected() {
            self.status.insert(CameraStatus::DISCONNECTED);
            let _ = self.events.send(StationEvent::NewCameraStatus {
                id: self.id,
                status: self.status,
            });
        }
    }

    pub fn on_socket_closed(&mut self) {
        if self.state != SessionState::Closed {
            log::info!("Session {} ({}): connection closed", self.id, self.name);
            self.set_state(SessionState::Closed);
        }
    }

    pub fn on_connect_timeout(&mut self) {
        if self.state == SessionState::Connecting {
            log::warn!("Session {}: no valid packet within {:?}", self.id, CONNECT_TIMEOUT);
            self.set_state(SessionState::Failed);
            self.set_state(SessionState::Closed);
        }
    }

    fn set_state(&mut self, next: SessionState) {
        if next == self.state {
            return;
        }
        let prev = self.state;
        self.state = next;
        log::debug!("Session {}: {:?} -> {:?}", self.id, prev, next);

        match (prev, next) {
            (SessionState::Connecting, SessionState::Connected)
            | (SessionState::Disconnected, SessionState::Connected) => {
                let _ = self.events.send(StationEvent::Connected { id: self.id });
            }
            (SessionState::Connected, SessionState::Disconnected) => {
                let _ = self.events.send(StationEvent::Disconnected { id: self.id });
            }
            _ => {}
        }
    }
}

// ============================================================================
// Session thread
// ============================================================================

enum SessionControl {
    ChangeFps(i32),
    ChangeResolution(Resolution),
    ChangeAutoRegulate(bool),
    ChangeFlashlight(LightStatus),
    RequestFocus,
    RequestPhoto,
    SetImageQuality(u8),
    SetSaveIncomingMedia(bool),
    SetRecordingsPath(PathBuf),
    Stop,
}

/// Per-session connection settings
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub stream_port: u16,
    pub command_port: u16,
    pub save_incoming_media: bool,
    pub image_quality: u8,
}

/// A running station-side session, one per camera
pub struct RemoteCamera {
    id: usize,
    address: IpAddr,
    control: Sender<SessionControl>,
    handle: Option<JoinHandle<()>>,
}

impl RemoteCamera {
    /// Connect to a camera and run the session on its own thread.
    ///
    /// The subscription request datagram must already have been sent;
    /// the camera holds its accept slot open for five seconds.
    pub fn start(
        id: usize,
        address: IpAddr,
        config: SessionConfig,
        events: Sender<StationEvent>,
        decoder: Arc<dyn ImageDecoder>,
        saver: Arc<ImageSaver>,
    ) -> crate::Result<Self> {
        let (control_tx, control_rx) = unbounded();

        let handle = thread::Builder::new()
            .name(format!("session-{}", id))
            .spawn(move || {
                session_loop(id, address, config, events, decoder, saver, control_rx);
            })?;

        Ok(Self {
            id,
            address,
            control: control_tx,
            handle: Some(handle),
        })
    }

    pub fn id(&self) -> usize {
        self.id
    }

    pub fn address(&self) -> IpAddr {
        self.address
    }

    /// True once the session thread has terminated (state Closed)
    pub fn is_finished(&self) -> bool {
        self.handle.as_ref().is_none_or(|h| h.is_finished())
    }

    pub fn change_fps(&self, fps: i32) {
        let _ = self.control.send(SessionControl::ChangeFps(fps));
    }

    pub fn change_resolution(&self, resolution: Resolution) {
        let _ = self.control.send(SessionControl::ChangeResolution(resolution));
    }

    pub fn change_auto_regulate(&self, enabled: bool) {
        let _ = self.control.send(SessionControl::ChangeAutoRegulate(enabled));
    }

    pub fn change_flashlight_status(&self, status: LightStatus) {
        let _ = self.control.send(SessionControl::ChangeFlashlight(status));
    }

    pub fn request_focus(&self) {
        let _ = self.control.send(SessionControl::RequestFocus);
    }

    pub fn request_photo(&self) {
        let _ = self.control.send(SessionControl::RequestPhoto);
    }

    pub fn set_image_quality(&self, quality: u8) {
        let _ = self.control.send(SessionControl::SetImageQuality(quality));
    }

    pub fn set_save_incoming_media(&self, save: bool) {
        let _ = self.control.send(SessionControl::SetSaveIncomingMedia(save));
    }

    pub fn set_recordings_path(&self, path: impl Into<PathBuf>) {
        let _ = self
            .control
            .send(SessionControl::SetRecordingsPath(path.into()));
    }

    pub fn stop(&self) {
        let _ = self.control.send(SessionControl::Stop);
    }
}

impl Drop for RemoteCamera {
    fn drop(&mut self) {
        self.stop();
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

#[allow(clippy::too_many_arguments)]
fn session_loop(
    id: usize,
    address: IpAddr,
    config: SessionConfig,
    events: Sender<StationEvent>,
    decoder: Arc<dyn ImageDecoder>,
    mut saver: Arc<ImageSaver>,
    control: Receiver<SessionControl>,
) {
    let started = Instant::now();
    let mut core = SessionCore::new(id, events, started);
    core.set_save_incoming_media(config.save_incoming_media);
    core.set_image_quality(config.image_quality);

    let target = SocketAddr::new(address, config.stream_port);
    let mut stream = match TcpStream::connect_timeout(&target, CONNECT_TIMEOUT) {
        Ok(stream) => stream,
        Err(e) => {
            log::warn!("Session {}: connect to {} failed: {}", id, target, e);
            core.on_connect_timeout();
            return;
        }
    };
    if let Err(e) = stream.set_nonblocking(true) {
        log::error!("Session {}: set_nonblocking failed: {}", id, e);
        core.on_socket_closed();
        return;
    }

    let cmd_sock = match UdpSocket::bind(("0.0.0.0", 0)) {
        Ok(sock) => sock,
        Err(e) => {
            log::error!("Session {}: command socket bind failed: {}", id, e);
            core.on_socket_closed();
            return;
        }
    };
    let cmd_target = SocketAddr::new(address, config.command_port);

    let connect_deadline = started + CONNECT_TIMEOUT;
    let mut watchdog = Watchdog::new(core.expected_interval(), Instant::now());
    let mut next_command_at = Instant::now();
    let mut read_buf = vec![0u8; 64 * 1024];

    log::info!("Session {}: streaming from {}", id, target);

    'session: loop {
        let now = Instant::now();

        while let Ok(msg) = control.try_recv() {
            match msg {
                SessionControl::ChangeFps(fps) => core.change_fps(fps),
                SessionControl::ChangeResolution(res) => core.change_resolution(res),
                SessionControl::ChangeAutoRegulate(enabled) => core.change_auto_regulate(enabled),
                SessionControl::ChangeFlashlight(status) => core.change_flashlight_status(status),
                SessionControl::RequestFocus => core.request_focus(now),
                SessionControl::RequestPhoto => core.request_photo(),
                SessionControl::SetImageQuality(q) => core.set_image_quality(q),
                SessionControl::SetSaveIncomingMedia(save) => core.set_save_incoming_media(save),
                SessionControl::SetRecordingsPath(path) => {
                    match ImageSaver::start(Arc::new(FsMediaSink::new(&path))) {
                        Ok(replacement) => saver = Arc::new(replacement),
                        Err(e) => log::error!("Session {}: recordings path change failed: {}", id, e),
                    }
                }
                SessionControl::Stop => {
                    core.on_socket_closed();
                    break 'session;
                }
            }
        }

        // Drain the stream
        loop {
            match stream.read(&mut read_buf) {
                Ok(0) => {
                    core.on_socket_closed();
                    break 'session;
                }
                Ok(n) => {
                    let outcome = core.ingest(&read_buf[..n], now, decoder.as_ref());
                    if outcome.fed {
                        let interval = core.expected_interval();
                        if interval != watchdog.interval() {
                            watchdog.set_expected_interval(interval, now);
                        } else {
                            watchdog.feed(now);
                        }
                    }
                    for jpeg in outcome.jpegs {
                        saver.save(core.name(), SystemTime::now(), &jpeg);
                    }
                    if outcome.close {
                        core.on_socket_closed();
                        break 'session;
                    }
                }
                Err(ref e) if e.kind() == ErrorKind::WouldBlock => break,
                Err(ref e) if e.kind() == ErrorKind::Interrupted => {}
                Err(e) => {
                    log::warn!("Session {}: read error: {}", id, e);
                    core.on_socket_closed();
                    break 'session;
                }
            }
        }

        match core.state() {
            SessionState::Connecting => {
                if now >= connect_deadline {
                    core.on_connect_timeout();
                    break 'session;
                }
            }
            SessionState::Connected => {
                if watchdog.poll(now) {
                    core.on_watchdog_expired();
                }
            }
            SessionState::Disconnected => {}
            SessionState::Failed | SessionState::Closed => break 'session,
        }

        // Command datagrams start only after the first stream packet:
        // until then the shadows hold defaults, not the camera's state,
        // and must not overwrite it
        if now >= next_command_at
            && matches!(
                core.state(),
                SessionState::Connected | SessionState::Disconnected
            )
        {
            next_command_at = now + COMMAND_INTERVAL;
            let packet = core.command_tick(now);
            if let Err(e) = cmd_sock.send_to(&packet.encode(), cmd_target) {
                log::debug!("Session {}: command send failed: {}", id, e);
            }
        }

        thread::sleep(Duration::from_millis(2));
    }

    log::info!("Session {} finished", id);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::JpegCodec;
    use crate::error::Error;
    use crate::frame::PixelFormat;
    use crate::wire::StreamPacket;

    /// Decoder that fabricates a 1x1 frame from any payload; keeps the
    /// protocol tests independent of real JPEG data
    struct StubDecoder;

    impl ImageDecoder for StubDecoder {
        fn decode(&self, bytes: &[u8]) -> crate::Result<Frame> {
            if bytes.is_empty() {
                return Err(Error::Codec("empty".into()));
            }
            Ok(Frame::new(1, 1, PixelFormat::Gray8, vec![bytes[0]]))
        }
    }

    fn packet(fps: u8) -> StreamPacket {
        StreamPacket {
            name: "cam1".into(),
            group: "default".into(),
            fps,
            resolution: Resolution::Vga,
            light: LightStatus::Off,
            status: CameraStatus::OK,
            image: vec![42u8; 32],
        }
    }

    fn session() -> (SessionCore, Receiver<StationEvent>, Instant) {
        let (tx, rx) = unbounded();
        let now = Instant::now();
        (SessionCore::new(0, tx, now), rx, now)
    }

    fn events_of(rx: &Receiver<StationEvent>) -> Vec<StationEvent> {
        rx.try_iter().collect()
    }

    #[test]
    fn test_first_packet_connects() {
        let (mut core, rx, t0) = session();
        assert_eq!(core.state(), SessionState::Connecting);
        assert!(core.status().is_disconnected());

        let outcome = core.ingest(&packet(24).encode_frame(), t0, &StubDecoder);
        assert!(outcome.fed);
        assert!(!outcome.close);
        assert_eq!(core.state(), SessionState::Connected);
        assert!(!core.status().is_disconnected());

        let events = events_of(&rx);
        let connects = events
            .iter()
            .filter(|e| matches!(e, StationEvent::Connected { .. }))
            .count();
        assert_eq!(connects, 1);
        assert!(events.iter().any(|e| matches!(e, StationEvent::NewImage { .. })));
    }

    #[test]
    fn test_corrupt_packet_neither_feeds_nor_fires() {
        let (mut core, rx, t0) = session();
        let mut frame = packet(24).encode_frame();
        let last = frame.len() - 1;
        frame[last] ^= 0x01;

        let outcome = core.ingest(&frame, t0, &StubDecoder);
        assert!(!outcome.fed);
        assert_eq!(core.bad_crc_count(), 1);
        assert_eq!(core.state(), SessionState::Connecting);
        assert!(!events_of(&rx)
            .iter()
            .any(|e| matches!(e, StationEvent::NewImage { .. })));
    }

    #[test]
    fn test_watchdog_disconnect_then_reconnect() {
        let (mut core, rx, t0) = session();
        core.ingest(&packet(10).encode_frame(), t0, &StubDecoder);
        assert_eq!(core.state(), SessionState::Connected);
        // fps 10 -> expected interval 1700 ms
        assert_eq!(core.expected_interval(), Duration::from_millis(1700));
        events_of(&rx);

        core.on_watchdog_expired();
        assert_eq!(core.state(), SessionState::Disconnected);
        assert!(core.status().is_disconnected());
        let events = events_of(&rx);
        assert_eq!(
            events
                .iter()
                .filter(|e| matches!(e, StationEvent::Disconnected { .. }))
                .count(),
            1
        );

        // The next valid packet reconnects and clears the sticky flag
        core.ingest(&packet(10).encode_frame(), t0 + Duration::from_secs(3), &StubDecoder);
        assert_eq!(core.state(), SessionState::Connected);
        assert!(!core.status().is_disconnected());
        let events = events_of(&rx);
        assert_eq!(
            events
                .iter()
                .filter(|e| matches!(e, StationEvent::Connected { .. }))
                .count(),
            1
        );
    }

    #[test]
    fn test_focus_pulse_schedule() {
        let (mut core, _rx, t0) = session();
        core.request_focus(t0);

        // Four transmissions carry the focus byte
        for i in 0..4u64 {
            let now = t0 + Duration::from_millis(i * 500);
            assert!(core.command_tick(now).focus, "packet {} should focus", i);
        }
        // The fifth (t = 2000 ms) does not
        assert!(!core.command_tick(t0 + Duration::from_millis(2000)).focus);
    }

    #[test]
    fn test_focus_pulse_time_limit() {
        let (mut core, _rx, t0) = session();
        core.request_focus(t0);
        assert!(core.command_tick(t0).focus);
        // Ticks stalled; by 2 s the pulse is gone even though only one
        // packet carried it
        assert!(!core.command_tick(t0 + Duration::from_millis(2100)).focus);
    }

    #[test]
    fn test_shadow_tracks_camera_until_requested() {
        let (mut core, _rx, t0) = session();
        // Camera reports 30 fps; with no pending request the command
        // echoes it back
        core.ingest(&packet(30).encode_frame(), t0, &StubDecoder);
        assert_eq!(core.command_tick(t0).fps, 30);

        // A request sticks until the camera confirms it
        core.change_fps(15);
        assert_eq!(core.command_tick(t0).fps, 15);
        core.ingest(&packet(30).encode_frame(), t0, &StubDecoder);
        assert_eq!(core.command_tick(t0).fps, 15);
        core.ingest(&packet(15).encode_frame(), t0, &StubDecoder);
        assert_eq!(core.command_tick(t0).fps, 15);

        // Once confirmed, the shadow follows the camera again
        core.ingest(&packet(40).encode_frame(), t0, &StubDecoder);
        assert_eq!(core.command_tick(t0).fps, 40);
    }

    #[test]
    fn test_fps_change_requests_are_clamped() {
        let (mut core, _rx, t0) = session();
        core.change_fps(300);
        assert_eq!(core.command_tick(t0).fps, 60);
        core.change_fps(1);
        assert_eq!(core.command_tick(t0).fps, 10);
    }

    #[test]
    fn test_image_fifo_is_bounded() {
        let (mut core, _rx, t0) = session();
        for _ in 0..40 {
            core.ingest(&packet(24).encode_frame(), t0, &StubDecoder);
        }
        assert_eq!(core.image_fifo_len(), 16);
        assert!(core.current_image().is_some());
    }

    #[test]
    fn test_resync_storm_closes_session() {
        let (mut core, _rx, t0) = session();
        core.ingest(&packet(24).encode_frame(), t0, &StubDecoder);

        // A flood of garbage forces per-byte resyncs
        let garbage = vec![0xA5u8; 64];
        let outcome = core.ingest(&garbage, t0 + Duration::from_millis(100), &StubDecoder);
        assert!(outcome.close);
    }

    #[test]
    fn test_decode_failure_counts_without_image_event() {
        let (mut core, rx, t0) = session();
        let mut bad = packet(24);
        bad.image.clear();
        core.ingest(&bad.encode_frame(), t0, &StubDecoder);

        assert_eq!(core.decode_errors(), 1);
        // Connected fires (valid packet), but no image event
        let events = events_of(&rx);
        assert!(events.iter().any(|e| matches!(e, StationEvent::Connected { .. })));
        assert!(!events.iter().any(|e| matches!(e, StationEvent::NewImage { .. })));
    }

    #[test]
    fn test_save_incoming_hands_jpegs_over() {
        let (mut core, _rx, t0) = session();
        core.set_save_incoming_media(true);
        let outcome = core.ingest(&packet(24).encode_frame(), t0, &StubDecoder);
        assert_eq!(outcome.jpegs.len(), 1);
        assert_eq!(outcome.jpegs[0], packet(24).image);
    }

    #[test]
    fn test_real_decoder_integration() {
        // One pass with the real JPEG codec to keep the stub honest
        let codec = JpegCodec;
        let frame = Frame::new(
            176,
            144,
            PixelFormat::Rgb888,
            vec![100u8; 176 * 144 * 3],
        );
        let jpeg = crate::codec::ImageEncoder::encode(&codec, &frame, 80).unwrap();

        let (mut core, rx, t0) = session();
        let mut pkt = packet(24);
        pkt.image = jpeg;
        core.ingest(&pkt.encode_frame(), t0, &codec);

        assert!(events_of(&rx)
            .iter()
            .any(|e| matches!(e, StationEvent::NewImage { .. })));
        let image = core.current_image().unwrap();
        assert_eq!((image.width, image.height), (176, 144));
    }
}
