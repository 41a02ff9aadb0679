//! QCCTV camera daemon
//!
//! Streams a synthetic test pattern; on real deployments the OS camera
//! driver pushes frames into [`LocalCamera::push_frame`] instead.

use qcctv::camera::{CameraEvent, LocalCamera, NullDriver, TestPatternSource};
use qcctv::codec::JpegCodec;
use qcctv::saver::FsMediaSink;
use qcctv::{Config, Result};
use std::env;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config_path = env::args().nth(1).unwrap_or_else(|| "qcctv.toml".to_string());
    log::info!("Using config: {}", config_path);
    let config = Config::load(&config_path)?;
    let settings = config.camera_settings()?;
    let camera_config = config
        .camera
        .clone()
        .ok_or_else(|| qcctv::Error::Config("missing [camera] section".into()))?;

    let fps = settings.fps;
    let (width, height) = settings.resolution.dimensions();
    let sink = Arc::new(FsMediaSink::new(&camera_config.recordings_path));

    let camera = Arc::new(LocalCamera::start(
        settings,
        Box::new(NullDriver),
        Arc::new(JpegCodec),
        sink,
    )?);
    camera.set_shrink_ratio(camera_config.shrink_ratio);
    camera.set_grayscale(camera_config.grayscale);

    let frame_target = Arc::clone(&camera);
    let _source = TestPatternSource::start(width, height, fps, move |raw| {
        frame_target.push_frame(raw);
    })?;

    let running = Arc::new(AtomicBool::new(true));
    let r = Arc::clone(&running);
    ctrlc::set_handler(move || {
        log::info!("Received shutdown signal");
        r.store(false, Ordering::Relaxed);
    })
    .map_err(|e| qcctv::Error::Other(format!("Error setting Ctrl-C handler: {}", e)))?;

    log::info!("Camera \"{}\" running. Press Ctrl-C to stop.", camera.name());

    let events = camera.events();
    while running.load(Ordering::Relaxed) {
        while let Ok(event) = events.try_recv() {
            match event {
                CameraEvent::HostCountChanged(count) => {
                    log::info!("Connected stations: {}", count)
                }
                CameraEvent::FpsChanged(fps) => log::info!("Frame rate now {} fps", fps),
                CameraEvent::ResolutionChanged(res) => log::info!("Resolution now {}", res),
                CameraEvent::StatusChanged(status) => log::info!("Status: {}", status),
                CameraEvent::LightChanged(status) => log::info!("Flashlight: {:?}", status),
                CameraEvent::ImageChanged => {}
            }
        }
        std::thread::sleep(Duration::from_millis(100));
    }

    log::info!("Camera stopped");
    Ok(())
}
