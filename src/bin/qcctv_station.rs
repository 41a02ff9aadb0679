//! QCCTV station daemon
//!
//! Discovers cameras in its group, subscribes to their streams and logs
//! session activity. A GUI would drain the same event channel.

use qcctv::station::{Station, StationEvent};
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
    let settings = config.station_settings()?;

    let station = Station::start(settings)?;

    let running = Arc::new(AtomicBool::new(true));
    let r = Arc::clone(&running);
    ctrlc::set_handler(move || {
        log::info!("Received shutdown signal");
        r.store(false, Ordering::Relaxed);
    })
    .map_err(|e| qcctv::Error::Other(format!("Error setting Ctrl-C handler: {}", e)))?;

    log::info!("Station running. Press Ctrl-C to stop.");

    let events = station.events();
    let mut image_counts: std::collections::HashMap<usize, u64> = Default::default();

    while running.load(Ordering::Relaxed) {
        while let Ok(event) = events.try_recv() {
            match event {
                StationEvent::CameraAdded { id, name, address } => {
                    log::info!("Camera {} added: \"{}\" at {}", id, name, address)
                }
                StationEvent::CameraRemoved { id } => log::info!("Camera {} removed", id),
                StationEvent::Connected { id } => log::info!("Camera {} connected", id),
                StationEvent::Disconnected { id } => log::warn!("Camera {} disconnected", id),
                StationEvent::NewCameraStatus { id, status } => {
                    log::info!("Camera {} status: {}", id, status)
                }
                StationEvent::NewCameraName { id, name } => {
                    log::info!("Camera {} renamed to \"{}\"", id, name)
                }
                StationEvent::FpsChanged { id, fps } => {
                    log::info!("Camera {} streaming at {} fps", id, fps)
                }
                StationEvent::ResolutionChanged { id, resolution } => {
                    log::info!("Camera {} resolution: {}", id, resolution)
                }
                StationEvent::NewImage { id } => {
                    let count = image_counts.entry(id).or_insert(0);
                    *count += 1;
                    if *count % 100 == 0 {
                        log::info!("Camera {}: {} frames received", id, count);
                    }
                }
                StationEvent::NewCameraGroup { .. }
                | StationEvent::LightStatusChanged { .. }
                | StationEvent::AutoRegulateChanged { .. } => {}
            }
        }
        std::thread::sleep(Duration::from_millis(100));
    }

    log::info!("Station stopped");
    Ok(())
}
