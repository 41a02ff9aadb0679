//! Station discovery: announcement listener and session factory.
//!
//! Listens for camera announcements on the broadcast port. For every
//! camera whose group matches the station's, it sends the subscription
//! request, opens the TCP stream and runs a [`RemoteCamera`] session.
//! Cameras assign no identity of their own; the station hands out dense
//! integer ids at discovery time and keeps them stable for as long as the
//! camera is known.
//!
//! Cameras that stop announcing for 15 seconds are pruned. Sessions that
//! die (connect failure, corrupt peer, FIN) are rebuilt on the camera's
//! next announcement under the same id.

use crate::codec::{ImageDecoder, JpegCodec};
use crate::saver::{FsMediaSink, ImageSaver};
use crate::station::remote_camera::{RemoteCamera, SessionConfig, StationEvent};
use crate::types::{LightStatus, Resolution};
use crate::wire::discovery::{encode_request, parse_announcement};
use crossbeam_channel::{unbounded, Receiver, Sender};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::io::ErrorKind;
use std::net::{IpAddr, SocketAddr, UdpSocket};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// Cameras silent on the announcement channel this long are forgotten
const PRUNE_AFTER: Duration = Duration::from_secs(15);

/// Runtime settings for a station, usually built from [`crate::Config`]
#[derive(Debug, Clone)]
pub struct StationSettings {
    pub group: String,
    pub stream_port: u16,
    pub command_port: u16,
    pub request_port: u16,
    pub broadcast_port: u16,
    pub save_incoming_media: bool,
    pub recordings_path: PathBuf,
    pub image_quality: u8,
}

impl Default for StationSettings {
    fn default() -> Self {
        Self {
            group: "default".into(),
            stream_port: crate::types::STREAM_PORT,
            command_port: crate::types::COMMAND_PORT,
            request_port: crate::types::REQUEST_PORT,
            broadcast_port: crate::types::BROADCAST_PORT,
            save_incoming_media: false,
            recordings_path: PathBuf::from("recordings"),
            image_quality: 75,
        }
    }
}

struct CameraEntry {
    id: usize,
    name: String,
    address: IpAddr,
    last_seen: Instant,
    session: Option<RemoteCamera>,
}

#[derive(Default)]
struct Registry {
    cameras: HashMap<usize, CameraEntry>,
    by_address: HashMap<IpAddr, usize>,
    next_id: usize,
}

/// Basic facts about a known camera
#[derive(Debug, Clone)]
pub struct CameraInfo {
    pub id: usize,
    pub name: String,
    pub address: IpAddr,
}

/// A station node: discovery plus the set of live camera sessions
pub struct Station {
    events: Receiver<StationEvent>,
    registry: Arc<Mutex<Registry>>,
    shutdown: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl Station {
    /// Start discovery with the default JPEG decoder and filesystem
    /// recorder.
    pub fn start(settings: StationSettings) -> crate::Result<Self> {
        let saver = ImageSaver::start(Arc::new(FsMediaSink::new(&settings.recordings_path)))?;
        Self::start_with(settings, Arc::new(JpegCodec), Arc::new(saver))
    }

    /// Start discovery with explicit collaborators
    pub fn start_with(
        settings: StationSettings,
        decoder: Arc<dyn ImageDecoder>,
        saver: Arc<ImageSaver>,
    ) -> crate::Result<Self> {
        let socket = UdpSocket::bind(("0.0.0.0", settings.broadcast_port))?;
        socket.set_nonblocking(true)?;
        let request_socket = UdpSocket::bind(("0.0.0.0", 0))?;

        let (event_tx, event_rx) = unbounded();
        let registry = Arc::new(Mutex::new(Registry::default()));
        let shutdown = Arc::new(AtomicBool::new(false));

        let loop_state = DiscoveryLoop {
            settings,
            socket,
            request_socket,
            decoder,
            saver,
            events: event_tx,
            registry: Arc::clone(&registry),
            shutdown: Arc::clone(&shutdown),
        };

        let handle = thread::Builder::new()
            .name("station-discovery".to_string())
            .spawn(move || loop_state.run())?;

        Ok(Self {
            events: event_rx,
            registry,
            shutdown,
            handle: Some(handle),
        })
    }

    /// Change-notification stream; a single presenter should drain this
    pub fn events(&self) -> Receiver<StationEvent> {
        self.events.clone()
    }

    /// Snapshot of the known cameras
    pub fn cameras(&self) -> Vec<CameraInfo> {
        self.registry
            .lock()
            .cameras
            .values()
            .map(|entry| CameraInfo {
                id: entry.id,
                name: entry.name.clone(),
                address: entry.address,
            })
            .collect()
    }

    pub fn change_fps(&self, id: usize, fps: i32) {
        self.with_session(id, |s| s.change_fps(fps));
    }

    pub fn change_resolution(&self, id: usize, resolution: Resolution) {
        self.with_session(id, |s| s.change_resolution(resolution));
    }

    pub fn change_auto_regulate(&self, id: usize, enabled: bool) {
        self.with_session(id, |s| s.change_auto_regulate(enabled));
    }

    pub fn change_flashlight_status(&self, id: usize, status: LightStatus) {
        self.with_session(id, |s| s.change_flashlight_status(status));
    }

    pub fn request_focus(&self, id: usize) {
        self.with_session(id, |s| s.request_focus());
    }

    pub fn request_photo(&self, id: usize) {
        self.with_session(id, |s| s.request_photo());
    }

    pub fn set_image_quality(&self, id: usize, quality: u8) {
        self.with_session(id, |s| s.set_image_quality(quality));
    }

    pub fn set_save_incoming_media(&self, id: usize, save: bool) {
        self.with_session(id, |s| s.set_save_incoming_media(save));
    }

    pub fn set_recordings_path(&self, id: usize, path: impl Into<PathBuf>) {
        let path = path.into();
        self.with_session(id, move |s| s.set_recordings_path(path));
    }

    fn with_session<F: FnOnce(&RemoteCamera)>(&self, id: usize, f: F) {
        let registry = self.registry.lock();
        match registry.cameras.get(&id).and_then(|e| e.session.as_ref()) {
            Some(session) => f(session),
            None => log::warn!("No live session for camera {}", id),
        }
    }
}

impl Drop for Station {
    fn drop(&mut self) {
        self.shutdown.store(true, Ordering::Relaxed);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
        // Dropping the registry stops every session
        self.registry.lock().cameras.clear();
    }
}

struct DiscoveryLoop {
    settings: StationSettings,
    socket: UdpSocket,
    request_socket: UdpSocket,
    decoder: Arc<dyn ImageDecoder>,
    saver: Arc<ImageSaver>,
    events: Sender<StationEvent>,
    registry: Arc<Mutex<Registry>>,
    shutdown: Arc<AtomicBool>,
}

impl DiscoveryLoop {
    fn run(self) {
        log::info!(
            "Station discovery listening on udp/{} (group \"{}\")",
            self.socket
                .local_addr()
                .map(|a| a.port())
                .unwrap_or(self.settings.broadcast_port),
            self.settings.group
        );

        let mut buf = [0u8; 600];
        while !self.shutdown.load(Ordering::Relaxed) {
            let now = Instant::now();

            loop {
                match self.socket.recv_from(&mut buf) {
                    Ok((len, src)) => {
                        if let Some((name, group)) = parse_announcement(&buf[..len]) {
                            self.handle_announcement(name, group, src.ip(), now);
                        }
                    }
                    Err(ref e) if e.kind() == ErrorKind::WouldBlock => break,
                    Err(e) => {
                        log::error!("Announcement socket error: {}", e);
                        break;
                    }
                }
            }

            self.prune(now);
            thread::sleep(Duration::from_millis(50));
        }

        log::info!("Station discovery exiting");
    }

    fn handle_announcement(&self, name: String, group: String, address: IpAddr, now: Instant) {
        if group != self.settings.group {
            log::trace!(
                "Ignoring \"{}\" at {}: group \"{}\" does not match",
                name,
                address,
                group
            );
            return;
        }

        let mut registry = self.registry.lock();
        if let Some(&id) = registry.by_address.get(&address) {
            let respawn = {
                let entry = registry
                    .cameras
                    .get_mut(&id)
                    .expect("registry maps are consistent");
                entry.last_seen = now;
                entry.name = name;
                entry
                    .session
                    .as_ref()
                    .is_none_or(|session| session.is_finished())
            };
            if respawn {
                log::info!("Camera {} session gone, resubscribing", id);
                let session = self.subscribe(id, address);
                if let Some(entry) = registry.cameras.get_mut(&id) {
                    entry.session = session;
                }
            }
            return;
        }

        let id = registry.next_id;
        registry.next_id += 1;
        log::info!("Discovered camera \"{}\" at {} (id {})", name, address, id);

        let session = self.subscribe(id, address);
        registry.cameras.insert(
            id,
            CameraEntry {
                id,
                name: name.clone(),
                address,
                last_seen: now,
                session,
            },
        );
        registry.by_address.insert(address, id);
        let _ = self.events.send(StationEvent::CameraAdded { id, name, address });
    }

    /// Send the subscription request, then open the stream session
    fn subscribe(&self, id: usize, address: IpAddr) -> Option<RemoteCamera> {
        let request = encode_request(&self.settings.group);
        let target = SocketAddr::new(address, self.settings.request_port);
        if let Err(e) = self.request_socket.send_to(&request, target) {
            log::warn!("Subscription request to {} failed: {}", target, e);
            return None;
        }

        let config = SessionConfig {
            stream_port: self.settings.stream_port,
            command_port: self.settings.command_port,
            save_incoming_media: self.settings.save_incoming_media,
            image_quality: self.settings.image_quality,
        };
        match RemoteCamera::start(
            id,
            address,
            config,
            self.events.clone(),
            Arc::clone(&self.decoder),
            Arc::clone(&self.saver),
        ) {
            Ok(session) => Some(session),
            Err(e) => {
                log::error!("Failed to start session for camera {}: {}", id, e);
                None
            }
        }
    }

    fn prune(&self, now: Instant) {
        let mut removed = Vec::new();
        {
            let mut registry = self.registry.lock();
            let stale: Vec<usize> = registry
                .cameras
                .values()
                .filter(|entry| now.duration_since(entry.last_seen) > PRUNE_AFTER)
                .map(|entry| entry.id)
                .collect();
            for id in stale {
                if let Some(entry) = registry.cameras.remove(&id) {
                    registry.by_address.remove(&entry.address);
                    log::info!("Camera {} (\"{}\") absent, pruned", id, entry.name);
                    // Entry drop stops the session thread
                    removed.push(id);
                }
            }
        }
        for id in removed {
            let _ = self.events.send(StationEvent::CameraRemoved { id });
        }
    }
}
