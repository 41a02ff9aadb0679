//! End-to-end tests over loopback sockets.
//!
//! Every component binds ephemeral ports (port 0) and announcements go to
//! 127.0.0.1 instead of the LAN broadcast address, so the tests are fully
//! self-contained and can run in parallel with other suites.

use crossbeam_channel::Receiver;
use qcctv::camera::{CameraSettings, LocalCamera, NullDriver, TestPatternSource};
use qcctv::codec::JpegCodec;
use qcctv::saver::{FsMediaSink, ImageSaver};
use qcctv::station::remote_camera::{RemoteCamera, SessionConfig};
use qcctv::station::{Station, StationEvent, StationSettings};
use qcctv::types::{CameraStatus, LightStatus, Resolution};
use qcctv::wire::{CommandPacket, StreamPacket};
use std::io::Write;
use std::net::{IpAddr, Ipv4Addr, TcpListener, UdpSocket};
use std::path::PathBuf;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

fn wait_for_event<F>(events: &Receiver<StationEvent>, timeout: Duration, mut pred: F) -> bool
where
    F: FnMut(&StationEvent) -> bool,
{
    let deadline = Instant::now() + timeout;
    while let Some(remaining) = deadline.checked_duration_since(Instant::now()) {
        match events.recv_timeout(remaining) {
            Ok(event) => {
                if pred(&event) {
                    return true;
                }
            }
            Err(_) => return false,
        }
    }
    false
}

fn temp_recordings(tag: &str) -> PathBuf {
    std::env::temp_dir().join(format!("qcctv-{}-{}", tag, std::process::id()))
}

#[test]
fn discovery_and_streaming_happy_path() {
    // Reserve an ephemeral port for the station's announcement listener
    // so the camera can be told where to announce before either starts
    let probe = UdpSocket::bind(("127.0.0.1", 0)).expect("probe socket");
    let broadcast_port = probe.local_addr().unwrap().port();
    drop(probe);

    let settings = CameraSettings {
        name: "cam1".into(),
        group: "default".into(),
        fps: 24,
        resolution: Resolution::Qcif,
        stream_port: 0,
        command_port: 0,
        request_port: 0,
        broadcast_port,
        broadcast_address: "127.0.0.1".into(),
        ..CameraSettings::default()
    };
    let camera = Arc::new(
        LocalCamera::start(
            settings,
            Box::new(NullDriver),
            Arc::new(JpegCodec),
            Arc::new(FsMediaSink::new(temp_recordings("happy"))),
        )
        .expect("camera start"),
    );

    let (width, height) = Resolution::Qcif.dimensions();
    let pusher = Arc::clone(&camera);
    let _source = TestPatternSource::start(width, height, 24, move |raw| {
        pusher.push_frame(raw);
    })
    .expect("pattern source");

    let station = Station::start(StationSettings {
        group: "default".into(),
        stream_port: camera.stream_port(),
        command_port: camera.command_port(),
        request_port: camera.request_port(),
        broadcast_port,
        recordings_path: temp_recordings("happy-station"),
        ..StationSettings::default()
    })
    .expect("station start");
    let events = station.events();

    // Camera announces every 3 s; discovery, handshake and the first
    // stream packet should all land well within one announcement cycle
    assert!(
        wait_for_event(&events, Duration::from_secs(5), |e| matches!(
            e,
            StationEvent::CameraAdded { id: 0, .. }
        )),
        "camera never discovered"
    );
    assert!(
        wait_for_event(&events, Duration::from_secs(5), |e| matches!(
            e,
            StationEvent::Connected { id: 0 }
        )),
        "session never connected"
    );
    assert!(
        wait_for_event(&events, Duration::from_secs(5), |e| matches!(
            e,
            StationEvent::NewImage { id: 0 }
        )),
        "no image arrived"
    );

    // connected(0) must not fire again while the stream is healthy
    let mut extra_connects = 0;
    let deadline = Instant::now() + Duration::from_secs(1);
    while let Some(remaining) = deadline.checked_duration_since(Instant::now()) {
        if let Ok(event) = events.recv_timeout(remaining) {
            if matches!(event, StationEvent::Connected { id: 0 }) {
                extra_connects += 1;
            }
        }
    }
    assert_eq!(extra_connects, 0);

    // A station command steers the camera (last-writer-wins)
    station.change_fps(0, 30);
    assert!(
        wait_for_event(&events, Duration::from_secs(3), |e| matches!(
            e,
            StationEvent::FpsChanged { id: 0, fps: 30 }
        )),
        "fps change never confirmed"
    );
    assert_eq!(camera.fps(), 30);
}

/// Hand-rolled camera endpoint: accepts one TCP stream and sends exactly
/// the frames the test tells it to. Lets us exercise watchdog behavior
/// that a healthy LocalCamera would never exhibit.
struct ScriptedCamera {
    port: u16,
    handle: Option<thread::JoinHandle<()>>,
}

impl ScriptedCamera {
    /// `script` entries are (delay before sending, packet bytes)
    fn start(script: Vec<(Duration, Vec<u8>)>) -> Self {
        let listener = TcpListener::bind(("127.0.0.1", 0)).expect("bind");
        let port = listener.local_addr().unwrap().port();
        let handle = thread::spawn(move || {
            let Ok((mut stream, _)) = listener.accept() else {
                return;
            };
            for (delay, bytes) in script {
                thread::sleep(delay);
                if stream.write_all(&bytes).is_err() {
                    return;
                }
            }
            // Keep the socket open without sending anything further
            thread::sleep(Duration::from_secs(2));
        });
        Self {
            port,
            handle: Some(handle),
        }
    }
}

impl Drop for ScriptedCamera {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

fn stream_frame(fps: u8) -> Vec<u8> {
    let codec = JpegCodec;
    let frame = qcctv::frame::Frame::new(
        16,
        16,
        qcctv::frame::PixelFormat::Rgb888,
        vec![80u8; 16 * 16 * 3],
    );
    let jpeg = qcctv::codec::ImageEncoder::encode(&codec, &frame, 70).unwrap();
    StreamPacket {
        name: "scripted".into(),
        group: "default".into(),
        fps,
        resolution: Resolution::Qcif,
        light: LightStatus::Off,
        status: CameraStatus::OK,
        image: jpeg,
    }
    .encode_frame()
}

#[test]
fn watchdog_disconnect_and_reconnect() {
    // fps 10 -> expected interval 1700 ms. Packets at t=0 and t=0.2 s,
    // then silence until t=3 s: the watchdog must fire in between, and
    // the late packet must reconnect.
    let frame = stream_frame(10);
    let camera = ScriptedCamera::start(vec![
        (Duration::ZERO, frame.clone()),
        (Duration::from_millis(200), frame.clone()),
        (Duration::from_millis(2800), frame.clone()),
    ]);

    let (event_tx, events) = crossbeam_channel::unbounded();
    let saver = Arc::new(
        ImageSaver::start(Arc::new(FsMediaSink::new(temp_recordings("watchdog")))).unwrap(),
    );
    let command_sink = UdpSocket::bind(("127.0.0.1", 0)).expect("command sink");
    let session = RemoteCamera::start(
        7,
        IpAddr::V4(Ipv4Addr::LOCALHOST),
        SessionConfig {
            stream_port: camera.port,
            command_port: command_sink.local_addr().unwrap().port(),
            save_incoming_media: false,
            image_quality: 75,
        },
        event_tx,
        Arc::new(JpegCodec),
        saver,
    )
    .expect("session start");

    assert!(
        wait_for_event(&events, Duration::from_secs(3), |e| matches!(
            e,
            StationEvent::Connected { id: 7 }
        )),
        "never connected"
    );
    assert!(
        wait_for_event(&events, Duration::from_secs(4), |e| matches!(
            e,
            StationEvent::Disconnected { id: 7 }
        )),
        "watchdog never fired"
    );
    assert!(
        wait_for_event(&events, Duration::from_secs(4), |e| matches!(
            e,
            StationEvent::Connected { id: 7 }
        )),
        "never reconnected"
    );

    session.stop();
}

#[test]
fn command_datagrams_steer_camera() {
    let camera = LocalCamera::start(
        CameraSettings {
            name: "cmd-test".into(),
            fps: 24,
            resolution: Resolution::Qcif,
            stream_port: 0,
            command_port: 0,
            request_port: 0,
            broadcast_port: 0,
            broadcast_address: "127.0.0.1".into(),
            ..CameraSettings::default()
        },
        Box::new(NullDriver),
        Arc::new(JpegCodec),
        Arc::new(FsMediaSink::new(temp_recordings("cmd"))),
    )
    .expect("camera start");
    let events = camera.events();

    let sender = UdpSocket::bind(("127.0.0.1", 0)).expect("sender");
    let command = CommandPacket {
        fps: 15,
        resolution: Resolution::Cif,
        light: LightStatus::Off,
        focus: false,
        auto_regulate: true,
        save_photo: false,
    };
    sender
        .send_to(&command.encode(), ("127.0.0.1", camera.command_port()))
        .expect("send");

    let deadline = Instant::now() + Duration::from_secs(3);
    let mut saw_fps = false;
    while Instant::now() < deadline && !saw_fps {
        if let Ok(event) = events.recv_timeout(Duration::from_millis(100)) {
            if event == qcctv::camera::CameraEvent::FpsChanged(15) {
                saw_fps = true;
            }
        }
    }
    assert!(saw_fps, "command never applied");
    assert_eq!(camera.fps(), 15);
    assert_eq!(camera.resolution(), Resolution::Cif);

    // Same tuple again: observable state must not change
    sender
        .send_to(&command.encode(), ("127.0.0.1", camera.command_port()))
        .expect("send");
    thread::sleep(Duration::from_millis(300));
    assert_eq!(camera.fps(), 15);
    assert_eq!(camera.resolution(), Resolution::Cif);
}
