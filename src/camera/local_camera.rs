//! Camera-side server: session acceptance, stream generation, command
//! handling and discovery announcements.
//!
//! One networking thread owns every socket and every peer; nothing else
//! touches session state. The rest of the process talks to it through a
//! control inbox (crossbeam channel) and reads results from an event
//! channel and a shared snapshot. Encoded frames cross over from the
//! encoder worker through an atomic-swap cell.
//!
//! # Handshake
//!
//! A request datagram on the request port whose bytes equal this camera's
//! group opens a 5-second invite for the sender's address; the first TCP
//! connection from that address while the invite is open becomes a peer.
//! Connections that race ahead of their request datagram are parked
//! briefly and promoted when the invite arrives.
//!
//! # Liveness
//!
//! Each peer carries two signals:
//! - a *transmit watchdog* fed by completed frame writes; expiry means the
//!   peer cannot drain our stream. The queue is cleared, the regulator
//!   notified, and the session kept.
//! - *command silence*: stations send a command datagram every 500 ms as a
//!   keep-alive. A peer silent for two watchdog intervals (or gone via
//!   FIN/socket error) is destroyed.

use crate::camera::encoder::EncoderWorker;
use crate::camera::grabber::FrameGrabber;
use crate::camera::regulator::ResolutionRegulator;
use crate::codec::ImageEncoder;
use crate::error::{Error, Result};
use crate::frame::RawFrame;
use crate::saver::MediaSink;
use crate::types::{clamp_fps, CameraStatus, LightStatus, Resolution};
use crate::watchdog::{expected_interval, TimerWheel};
use crate::wire::discovery::{encode_announcement, request_matches};
use crate::wire::{CommandPacket, StreamPacket};
use crossbeam_channel::{unbounded, Receiver, Sender};
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::io::{ErrorKind, Read, Write};
use std::net::{IpAddr, SocketAddr, TcpListener, TcpStream, UdpSocket};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant, SystemTime};

/// Per-peer unsent frame queue bound
const SEND_QUEUE_LIMIT: usize = 3;

/// Uninvited connections held while waiting for their request datagram
const PARKED_LIMIT: usize = 8;

/// How long a request datagram keeps an accept slot open
const INVITE_WINDOW: Duration = Duration::from_secs(5);

/// Discovery announcement cadence
const BROADCAST_INTERVAL: Duration = Duration::from_secs(3);

/// Change notifications emitted by a camera; a presenter drains these
#[derive(Debug, Clone, PartialEq)]
pub enum CameraEvent {
    ImageChanged,
    FpsChanged(u8),
    ResolutionChanged(Resolution),
    StatusChanged(CameraStatus),
    LightChanged(LightStatus),
    HostCountChanged(usize),
}

/// Control surface of the OS camera driver the core depends on.
///
/// Frame delivery is separate: drivers push decoded buffers into
/// [`LocalCamera::push_frame`] from their capture callback.
pub trait CameraDriver: Send {
    fn has_flashlight(&self) -> bool;
    fn set_flashlight(&mut self, enabled: bool) -> Result<()>;
    fn focus(&mut self) -> Result<()>;
}

/// Driver stub for hardware without flashlight or focus support
pub struct NullDriver;

impl CameraDriver for NullDriver {
    fn has_flashlight(&self) -> bool {
        false
    }

    fn set_flashlight(&mut self, _enabled: bool) -> Result<()> {
        Err(Error::Driver("no flashlight present".into()))
    }

    fn focus(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Runtime settings for a camera, usually built from [`crate::Config`]
#[derive(Debug, Clone)]
pub struct CameraSettings {
    pub name: String,
    pub group: String,
    pub fps: u8,
    pub resolution: Resolution,
    /// Administrative ceiling for the adaptive regulator
    pub resolution_ceiling: Resolution,
    pub auto_regulate: bool,
    pub jpeg_quality: u8,
    pub stream_port: u16,
    pub command_port: u16,
    pub request_port: u16,
    pub broadcast_port: u16,
    /// Where announcements are sent; the LAN broadcast address in
    /// production, a unicast address in tests
    pub broadcast_address: String,
}

impl Default for CameraSettings {
    fn default() -> Self {
        Self {
            name: "QCCTV Camera".into(),
            group: "default".into(),
            fps: 24,
            resolution: Resolution::Vga,
            resolution_ceiling: Resolution::Hd1080,
            auto_regulate: true,
            jpeg_quality: 75,
            stream_port: crate::types::STREAM_PORT,
            command_port: crate::types::COMMAND_PORT,
            request_port: crate::types::REQUEST_PORT,
            broadcast_port: crate::types::BROADCAST_PORT,
            broadcast_address: "255.255.255.255".into(),
        }
    }
}

enum Control {
    SetFps(u8),
    SetName(String),
    SetGroup(String),
    SetResolution(Resolution),
    SetAutoRegulate(bool),
    SetFlashlight(bool),
    TakePhoto,
    Focus,
    Shutdown,
}

/// Snapshot of camera state readable from any thread
#[derive(Debug, Clone)]
struct Snapshot {
    name: String,
    group: String,
    fps: u8,
    resolution: Resolution,
    light: LightStatus,
    status: CameraStatus,
    host_count: usize,
}

/// A camera node: grabber -> encoder -> networking thread
pub struct LocalCamera {
    control: Sender<Control>,
    events: Receiver<CameraEvent>,
    grabber: Mutex<FrameGrabber>,
    encoder: Arc<EncoderWorker>,
    snapshot: Arc<Mutex<Snapshot>>,
    stream_port: u16,
    command_port: u16,
    request_port: u16,
    shutdown: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl LocalCamera {
    /// Bind the camera's sockets, start the encoder worker and the
    /// networking thread.
    pub fn start(
        settings: CameraSettings,
        driver: Box<dyn CameraDriver>,
        codec: Arc<dyn ImageEncoder>,
        sink: Arc<dyn MediaSink>,
    ) -> Result<Self> {
        let listener = TcpListener::bind(("0.0.0.0", settings.stream_port))?;
        listener.set_nonblocking(true)?;
        let cmd_sock = UdpSocket::bind(("0.0.0.0", settings.command_port))?;
        cmd_sock.set_nonblocking(true)?;
        let req_sock = UdpSocket::bind(("0.0.0.0", settings.request_port))?;
        req_sock.set_nonblocking(true)?;
        let bcast_sock = UdpSocket::bind(("0.0.0.0", 0))?;
        bcast_sock.set_broadcast(true)?;

        let stream_port = listener.local_addr()?.port();
        let command_port = cmd_sock.local_addr()?.port();
        let request_port = req_sock.local_addr()?.port();

        let broadcast_ip: IpAddr = settings
            .broadcast_address
            .parse()
            .map_err(|_| Error::Config(format!("bad broadcast address: {}", settings.broadcast_address)))?;
        let broadcast_target = SocketAddr::new(broadcast_ip, settings.broadcast_port);

        let fps = clamp_fps(settings.fps as i32);
        let encoder = Arc::new(EncoderWorker::start(
            codec,
            settings.resolution,
            settings.jpeg_quality,
        )?);

        let snapshot = Arc::new(Mutex::new(Snapshot {
            name: settings.name.clone(),
            group: settings.group.clone(),
            fps,
            resolution: settings.resolution,
            light: LightStatus::Off,
            status: CameraStatus::OK,
            host_count: 0,
        }));

        let (control_tx, control_rx) = unbounded();
        let (event_tx, event_rx) = unbounded();
        let shutdown = Arc::new(AtomicBool::new(false));

        let now = Instant::now();
        let net = NetLoop {
            listener,
            cmd_sock,
            req_sock,
            bcast_sock,
            broadcast_target,
            name: settings.name,
            group: settings.group,
            fps,
            resolution: settings.resolution,
            light: LightStatus::Off,
            status: CameraStatus::OK,
            driver,
            sink,
            encoder: Arc::clone(&encoder),
            peers: Vec::new(),
            next_peer_id: 0,
            invites: HashMap::new(),
            parked: Vec::new(),
            wheel: TimerWheel::new(),
            regulator: ResolutionRegulator::new(
                settings.auto_regulate,
                settings.resolution_ceiling,
                now,
            ),
            auto_regulate: settings.auto_regulate,
            control: control_rx,
            events: event_tx,
            snapshot: Arc::clone(&snapshot),
            shutdown: Arc::clone(&shutdown),
            next_frame_at: now,
            next_broadcast_at: now,
            last_frame_sent: None,
            photo_errors: 0,
            driver_video_failure: false,
        };

        let handle = thread::Builder::new()
            .name("camera-net".to_string())
            .spawn(move || net.run())?;

        let mut grabber = FrameGrabber::new();
        grabber.set_enabled(true);

        log::info!(
            "Camera streaming on tcp/{} (commands udp/{}, requests udp/{})",
            stream_port,
            command_port,
            request_port
        );

        Ok(Self {
            control: control_tx,
            events: event_rx,
            grabber: Mutex::new(grabber),
            encoder,
            snapshot,
            stream_port,
            command_port,
            request_port,
            shutdown,
            handle: Some(handle),
        })
    }

    /// Entry point for the OS camera driver's capture callback. The raw
    /// buffer is copied before this returns; no reference escapes.
    pub fn push_frame(&self, raw: &RawFrame<'_>) {
        let mut grabber = self.grabber.lock();
        let encoder = &self.encoder;
        grabber.process(raw, |frame| encoder.submit(frame.clone()));
    }

    pub fn set_fps(&self, fps: i32) {
        let _ = self.control.send(Control::SetFps(clamp_fps(fps)));
    }

    pub fn set_name(&self, name: impl Into<String>) {
        let _ = self.control.send(Control::SetName(name.into()));
    }

    pub fn set_group(&self, group: impl Into<String>) {
        let _ = self.control.send(Control::SetGroup(group.into()));
    }

    pub fn set_resolution(&self, resolution: Resolution) {
        let _ = self.control.send(Control::SetResolution(resolution));
    }

    pub fn set_auto_regulate(&self, enabled: bool) {
        let _ = self.control.send(Control::SetAutoRegulate(enabled));
    }

    pub fn set_flashlight_enabled(&self, enabled: bool) {
        let _ = self.control.send(Control::SetFlashlight(enabled));
    }

    /// Save the most recent encoded frame to persistent storage
    pub fn take_photo(&self) {
        let _ = self.control.send(Control::TakePhoto);
    }

    pub fn focus_camera(&self) {
        let _ = self.control.send(Control::Focus);
    }

    pub fn set_shrink_ratio(&self, ratio: f32) {
        self.grabber.lock().set_shrink_ratio(ratio);
    }

    pub fn set_grayscale(&self, grayscale: bool) {
        self.grabber.lock().set_grayscale(grayscale);
    }

    /// Change-notification stream; a single presenter should drain this
    pub fn events(&self) -> Receiver<CameraEvent> {
        self.events.clone()
    }

    pub fn stream_port(&self) -> u16 {
        self.stream_port
    }

    pub fn command_port(&self) -> u16 {
        self.command_port
    }

    pub fn request_port(&self) -> u16 {
        self.request_port
    }

    pub fn name(&self) -> String {
        self.snapshot.lock().name.clone()
    }

    pub fn group(&self) -> String {
        self.snapshot.lock().group.clone()
    }

    pub fn fps(&self) -> u8 {
        self.snapshot.lock().fps
    }

    pub fn resolution(&self) -> Resolution {
        self.snapshot.lock().resolution
    }

    pub fn camera_status(&self) -> CameraStatus {
        self.snapshot.lock().status
    }

    pub fn light_status(&self) -> LightStatus {
        self.snapshot.lock().light
    }

    pub fn connected_host_count(&self) -> usize {
        self.snapshot.lock().host_count
    }
}

impl Drop for LocalCamera {
    fn drop(&mut self) {
        self.shutdown.store(true, Ordering::Relaxed);
        let _ = self.control.send(Control::Shutdown);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

// ============================================================================
// Networking thread
// ============================================================================

struct Peer {
    id: u64,
    addr: SocketAddr,
    stream: TcpStream,
    queue: VecDeque<Arc<Vec<u8>>>,
    inflight: Option<Inflight>,
    /// Last command datagram (or connect time); silence destroys the peer
    last_activity: Instant,
    last_cmd_at: Option<Instant>,
    last_applied: Option<CommandPacket>,
    /// EWMA of the gap between command datagrams, for diagnostics
    cmd_gap_ewma_ms: f32,
    dead: bool,
}

struct Inflight {
    frame: Arc<Vec<u8>>,
    offset: usize,
    started: Instant,
}

struct NetLoop {
    listener: TcpListener,
    cmd_sock: UdpSocket,
    req_sock: UdpSocket,
    bcast_sock: UdpSocket,
    broadcast_target: SocketAddr,

    name: String,
    group: String,
    fps: u8,
    resolution: Resolution,
    light: LightStatus,
    status: CameraStatus,
    auto_regulate: bool,

    driver: Box<dyn CameraDriver>,
    sink: Arc<dyn MediaSink>,
    encoder: Arc<EncoderWorker>,

    peers: Vec<Peer>,
    next_peer_id: u64,
    invites: HashMap<IpAddr, Instant>,
    parked: Vec<(TcpStream, SocketAddr, Instant)>,
    wheel: TimerWheel<u64>,
    regulator: ResolutionRegulator,

    control: Receiver<Control>,
    events: Sender<CameraEvent>,
    snapshot: Arc<Mutex<Snapshot>>,
    shutdown: Arc<AtomicBool>,

    next_frame_at: Instant,
    next_broadcast_at: Instant,
    last_frame_sent: Option<Arc<crate::camera::encoder::EncodedFrame>>,
    photo_errors: u64,
    driver_video_failure: bool,
}

impl NetLoop {
    fn run(mut self) {
        log::debug!("Camera networking thread started");
        let mut last_stats = Instant::now();

        while !self.shutdown.load(Ordering::Relaxed) {
            let now = Instant::now();

            if !self.drain_control(now) {
                break;
            }
            self.read_requests(now);
            self.accept_connections(now);
            self.expire_invites(now);
            self.read_commands(now);
            self.tick_frames(now);
            self.service_peers(now);
            self.check_watchdogs(now);
            self.prune_peers(now);
            self.regulate(now);
            self.broadcast(now);
            self.update_video_status();

            if last_stats.elapsed().as_secs() >= 10 {
                log::info!(
                    "Streaming {}x{} @ {} fps to {} host(s), status: {}",
                    self.resolution.dimensions().0,
                    self.resolution.dimensions().1,
                    self.fps,
                    self.peers.len(),
                    self.status
                );
                last_stats = Instant::now();
            }

            thread::sleep(Duration::from_millis(1));
        }

        log::info!("Camera networking thread exiting");
    }

    fn frame_interval(&self) -> Duration {
        Duration::from_millis(1000 / self.fps.max(1) as u64)
    }

    fn liveness_timeout(&self) -> Duration {
        expected_interval(self.fps) * 2
    }

    /// Returns false when a shutdown control arrived
    fn drain_control(&mut self, now: Instant) -> bool {
        while let Ok(msg) = self.control.try_recv() {
            match msg {
                Control::SetFps(fps) => self.set_fps(fps, now),
                Control::SetName(name) => self.set_name(name),
                Control::SetGroup(group) => self.set_group(group),
                Control::SetResolution(res) => self.set_resolution(res),
                Control::SetAutoRegulate(enabled) => self.set_auto_regulate(enabled, now),
                Control::SetFlashlight(enabled) => self.set_flashlight(enabled),
                Control::TakePhoto => self.take_photo(),
                Control::Focus => self.focus(),
                Control::Shutdown => return false,
            }
        }
        true
    }

    fn set_fps(&mut self, fps: u8, now: Instant) {
        let fps = clamp_fps(fps as i32);
        if fps == self.fps {
            return;
        }
        self.fps = fps;
        self.next_frame_at = now + self.frame_interval();
        let interval = expected_interval(fps);
        for peer in &self.peers {
            self.wheel.set_interval(&peer.id, interval, now);
        }
        self.snapshot.lock().fps = fps;
        let _ = self.events.send(CameraEvent::FpsChanged(fps));
        log::info!("Frame rate set to {} fps", fps);
    }

    fn set_name(&mut self, name: String) {
        let name = crate::types::truncate_utf8(&name, crate::types::MAX_NAME_LEN).to_string();
        if name != self.name {
            self.name = name.clone();
            self.snapshot.lock().name = name;
        }
    }

    fn set_group(&mut self, group: String) {
        let group = crate::types::truncate_utf8(&group, crate::types::MAX_NAME_LEN).to_string();
        if group != self.group {
            self.group = group.clone();
            self.snapshot.lock().group = group;
        }
    }

    fn set_resolution(&mut self, resolution: Resolution) {
        if resolution == self.resolution {
            return;
        }
        self.resolution = resolution;
        self.encoder.set_resolution(resolution);
        self.snapshot.lock().resolution = resolution;
        let _ = self.events.send(CameraEvent::ResolutionChanged(resolution));
        log::info!("Resolution set to {}", resolution);
    }

    fn set_auto_regulate(&mut self, enabled: bool, now: Instant) {
        if enabled == self.auto_regulate {
            return;
        }
        self.auto_regulate = enabled;
        self.regulator.set_enabled(enabled, now);
        log::info!(
            "Adaptive resolution regulation {}",
            if enabled { "enabled" } else { "disabled" }
        );
    }

    fn set_flashlight(&mut self, enabled: bool) {
        let wanted: LightStatus = enabled.into();
        if wanted == self.light {
            return;
        }
        if !self.driver.has_flashlight() {
            if enabled {
                log::warn!("Flashlight requested but not available");
                self.set_status_flag(CameraStatus::LIGHT_FAILURE, true);
            }
            return;
        }
        match self.driver.set_flashlight(enabled) {
            Ok(()) => {
                self.light = wanted;
                self.set_status_flag(CameraStatus::LIGHT_FAILURE, false);
                self.snapshot.lock().light = wanted;
                let _ = self.events.send(CameraEvent::LightChanged(wanted));
            }
            Err(e) => {
                log::error!("Flashlight switch failed: {}", e);
                self.set_status_flag(CameraStatus::LIGHT_FAILURE, true);
            }
        }
    }

    fn take_photo(&mut self) {
        let Some(frame) = self.encoder.latest() else {
            log::warn!("No encoded frame available for photo");
            return;
        };
        if let Err(e) = self
            .sink
            .append_jpeg(&self.name, SystemTime::now(), &frame.jpeg)
        {
            self.photo_errors += 1;
            log::warn!("Photo save failed ({} total): {}", self.photo_errors, e);
        } else {
            log::info!("Photo saved ({} bytes)", frame.jpeg.len());
        }
    }

    fn focus(&mut self) {
        match self.driver.focus() {
            Ok(()) => self.driver_video_failure = false,
            Err(e) => {
                log::error!("Focus request failed: {}", e);
                self.driver_video_failure = true;
            }
        }
    }

    fn set_status_flag(&mut self, flag: CameraStatus, on: bool) {
        let before = self.status;
        if on {
            self.status.insert(flag);
        } else {
            self.status.remove(flag);
        }
        if self.status != before {
            self.snapshot.lock().status = self.status;
            let _ = self.events.send(CameraEvent::StatusChanged(self.status));
        }
    }

    // ------------------------------------------------------------------
    // Handshake
    // ------------------------------------------------------------------

    fn read_requests(&mut self, now: Instant) {
        let mut buf = [0u8; 512];
        loop {
            match self.req_sock.recv_from(&mut buf) {
                Ok((len, src)) => {
                    if request_matches(&buf[..len], &self.group) {
                        log::debug!("Subscription request from {}", src);
                        self.invites.insert(src.ip(), now);
                        self.promote_parked(now);
                    } else {
                        log::debug!("Request from {} for another group, ignored", src);
                    }
                }
                Err(ref e) if e.kind() == ErrorKind::WouldBlock => break,
                Err(e) => {
                    log::error!("Request socket error: {}", e);
                    break;
                }
            }
        }
    }

    fn accept_connections(&mut self, now: Instant) {
        loop {
            match self.listener.accept() {
                Ok((stream, addr)) => {
                    if let Err(e) = stream.set_nonblocking(true) {
                        log::warn!("Failed to set non-blocking for {}: {}", addr, e);
                        continue;
                    }
                    if self.invite_open(addr.ip(), now) {
                        self.bind_peer(stream, addr, now);
                    } else {
                        // The TCP SYN can outrun the request datagram; hold
                        // the connection until its invite shows up
                        if self.parked.len() >= PARKED_LIMIT {
                            self.parked.remove(0);
                        }
                        log::debug!("Parking uninvited connection from {}", addr);
                        self.parked.push((stream, addr, now));
                    }
                }
                Err(ref e) if e.kind() == ErrorKind::WouldBlock => break,
                Err(e) => {
                    log::error!("Accept error: {}", e);
                    break;
                }
            }
        }
    }

    fn invite_open(&self, ip: IpAddr, now: Instant) -> bool {
        self.invites
            .get(&ip)
            .is_some_and(|t| now.duration_since(*t) <= INVITE_WINDOW)
    }

    fn promote_parked(&mut self, now: Instant) {
        let mut parked = std::mem::take(&mut self.parked);
        for (stream, addr, parked_at) in parked.drain(..) {
            if self.invite_open(addr.ip(), now) {
                self.bind_peer(stream, addr, now);
            } else {
                self.parked.push((stream, addr, parked_at));
            }
        }
    }

    fn bind_peer(&mut self, stream: TcpStream, addr: SocketAddr, now: Instant) {
        self.invites.remove(&addr.ip());
        let id = self.next_peer_id;
        self.next_peer_id += 1;
        self.wheel.insert(id, expected_interval(self.fps), now);
        self.peers.push(Peer {
            id,
            addr,
            stream,
            queue: VecDeque::with_capacity(SEND_QUEUE_LIMIT),
            inflight: None,
            last_activity: now,
            last_cmd_at: None,
            last_applied: None,
            cmd_gap_ewma_ms: 0.0,
            dead: false,
        });
        log::info!("Station {} connected ({} total)", addr, self.peers.len());
        self.publish_host_count();
    }

    fn publish_host_count(&mut self) {
        let count = self.peers.len();
        self.snapshot.lock().host_count = count;
        let _ = self.events.send(CameraEvent::HostCountChanged(count));
    }

    fn expire_invites(&mut self, now: Instant) {
        self.invites
            .retain(|_, t| now.duration_since(*t) <= INVITE_WINDOW);
        self.parked
            .retain(|(_, addr, t)| {
                let keep = now.duration_since(*t) <= INVITE_WINDOW;
                if !keep {
                    log::debug!("Dropping parked connection from {}", addr);
                }
                keep
            });
    }

    // ------------------------------------------------------------------
    // Commands
    // ------------------------------------------------------------------

    fn read_commands(&mut self, now: Instant) {
        let mut buf = [0u8; 64];
        loop {
            match self.cmd_sock.recv_from(&mut buf) {
                Ok((len, src)) => {
                    if let Some(cmd) = CommandPacket::decode(&buf[..len]) {
                        self.apply_command(cmd, src, now);
                    } else {
                        log::debug!("Short command datagram from {}, ignored", src);
                    }
                }
                Err(ref e) if e.kind() == ErrorKind::WouldBlock => break,
                Err(e) => {
                    log::error!("Command socket error: {}", e);
                    break;
                }
            }
        }
    }

    fn apply_command(&mut self, cmd: CommandPacket, src: SocketAddr, now: Instant) {
        // Keep-alive accounting happens even for duplicate tuples
        let mut duplicate = false;
        for peer in self.peers.iter_mut().filter(|p| p.addr.ip() == src.ip()) {
            peer.last_activity = now;
            if let Some(prev) = peer.last_cmd_at {
                let gap_ms = now.duration_since(prev).as_millis() as f32;
                peer.cmd_gap_ewma_ms += 0.2 * (gap_ms - peer.cmd_gap_ewma_ms);
            }
            peer.last_cmd_at = Some(now);
            if peer.last_applied == Some(cmd) {
                duplicate = true;
            } else {
                peer.last_applied = Some(cmd);
            }
        }
        if duplicate {
            // Identical consecutive tuple: a pure keep-alive
            return;
        }

        log::trace!("Command from {}: {:?}", src, cmd);
        self.set_fps(cmd.fps, now);
        self.set_resolution(cmd.resolution);
        self.set_flashlight(cmd.light.is_on());
        self.set_auto_regulate(cmd.auto_regulate, now);
        if cmd.focus {
            self.focus();
        }
        if cmd.save_photo {
            self.take_photo();
        }
    }

    // ------------------------------------------------------------------
    // Stream generation
    // ------------------------------------------------------------------

    fn tick_frames(&mut self, now: Instant) {
        if now < self.next_frame_at {
            return;
        }
        self.next_frame_at += self.frame_interval();
        if self.next_frame_at < now {
            // Fell behind (encoder stall, clock jump); resynchronize
            self.next_frame_at = now + self.frame_interval();
        }

        // Non-blocking snapshot; skip the tick when nothing is encoded yet
        let Some(encoded) = self.encoder.latest() else {
            return;
        };

        let fresh = !self
            .last_frame_sent
            .as_ref()
            .is_some_and(|prev| Arc::ptr_eq(prev, &encoded));
        if fresh {
            let _ = self.events.send(CameraEvent::ImageChanged);
        }
        self.last_frame_sent = Some(Arc::clone(&encoded));

        if self.peers.is_empty() {
            return;
        }

        let packet = StreamPacket {
            name: self.name.clone(),
            group: self.group.clone(),
            fps: self.fps,
            resolution: self.resolution,
            light: self.light,
            status: self.status,
            image: encoded.jpeg.clone(),
        };
        let wire_frame = Arc::new(packet.encode_frame());

        for peer in &mut self.peers {
            if peer.queue.len() >= SEND_QUEUE_LIMIT {
                // Backpressure: replace the oldest unsent frame
                peer.queue.pop_front();
                log::trace!("Send queue full for {}, dropped oldest frame", peer.addr);
            }
            peer.queue.push_back(Arc::clone(&wire_frame));
        }
    }

    fn service_peers(&mut self, now: Instant) {
        let stall_after = self.frame_interval() * 3;
        let mut fed = Vec::new();

        for peer in &mut self.peers {
            if peer.dead {
                continue;
            }

            // Detect FIN / inbound errors; the camera expects no stream data
            let mut read_buf = [0u8; 512];
            loop {
                match peer.stream.read(&mut read_buf) {
                    Ok(0) => {
                        log::info!("Station {} closed the connection", peer.addr);
                        peer.dead = true;
                        break;
                    }
                    Ok(_) => {}
                    Err(ref e) if e.kind() == ErrorKind::WouldBlock => break,
                    Err(e) => {
                        log::warn!("Read error from {}: {}", peer.addr, e);
                        peer.dead = true;
                        break;
                    }
                }
            }
            if peer.dead {
                continue;
            }

            // Drain the send queue with non-blocking writes
            loop {
                if peer.inflight.is_none() {
                    match peer.queue.pop_front() {
                        Some(frame) => {
                            peer.inflight = Some(Inflight {
                                frame,
                                offset: 0,
                                started: now,
                            });
                        }
                        None => break,
                    }
                }

                let Some(inflight) = peer.inflight.as_mut() else {
                    break;
                };
                match peer.stream.write(&inflight.frame[inflight.offset..]) {
                    Ok(n) => {
                        inflight.offset += n;
                        if inflight.offset >= inflight.frame.len() {
                            peer.inflight = None;
                            fed.push(peer.id);
                        }
                    }
                    Err(ref e) if e.kind() == ErrorKind::WouldBlock => {
                        if now.duration_since(inflight.started) > stall_after {
                            // Peer cannot drain; shed its oldest queued frame
                            if peer.queue.pop_front().is_some() {
                                log::debug!("Shedding stalled frame for {}", peer.addr);
                            }
                            inflight.started = now;
                        }
                        break;
                    }
                    Err(e) => {
                        log::warn!("Write error to {}: {}", peer.addr, e);
                        peer.dead = true;
                        break;
                    }
                }
            }
        }

        for id in fed {
            self.wheel.feed(&id, now);
        }
    }

    fn check_watchdogs(&mut self, now: Instant) {
        for id in self.wheel.poll_expired(now) {
            if let Some(peer) = self.peers.iter_mut().find(|p| p.id == id) {
                log::warn!(
                    "Transmit watchdog expired for {} (cmd gap ewma {:.0} ms)",
                    peer.addr,
                    peer.cmd_gap_ewma_ms
                );
                peer.queue.clear();
                self.regulator.record_timeout(now);
                self.wheel.feed(&id, now);
            }
        }
    }

    fn prune_peers(&mut self, now: Instant) {
        let timeout = self.liveness_timeout();
        let mut removed = false;

        let wheel = &mut self.wheel;
        self.peers.retain(|peer| {
            let silent = now.duration_since(peer.last_activity) > timeout;
            if peer.dead || silent {
                if silent && !peer.dead {
                    log::info!("Station {} silent, dropping session", peer.addr);
                }
                wheel.remove(&peer.id);
                removed = true;
                false
            } else {
                true
            }
        });

        if removed {
            self.publish_host_count();
        }
    }

    fn regulate(&mut self, now: Instant) {
        if !self.peers.is_empty() {
            let total: usize = self.peers.iter().map(|p| p.queue.len()).sum();
            let average = total as f32 / self.peers.len() as f32;
            self.regulator.observe_queue_depth(average, now);
        }
        if let Some(resolution) = self.regulator.evaluate(self.resolution, now) {
            log::info!(
                "Adaptive regulation: {} -> {}",
                self.resolution,
                resolution
            );
            self.set_resolution(resolution);
        }
    }

    fn broadcast(&mut self, now: Instant) {
        if self.broadcast_target.port() == 0 || now < self.next_broadcast_at {
            return;
        }
        self.next_broadcast_at = now + BROADCAST_INTERVAL;
        let datagram = encode_announcement(&self.name, &self.group);
        if let Err(e) = self.bcast_sock.send_to(&datagram, self.broadcast_target) {
            log::debug!("Announcement send failed: {}", e);
        }
    }

    fn update_video_status(&mut self) {
        let failing = self.encoder.sustained_failure() || self.driver_video_failure;
        if failing != self.status.contains(CameraStatus::VIDEO_FAILURE) {
            self.set_status_flag(CameraStatus::VIDEO_FAILURE, failing);
        }
    }
}
