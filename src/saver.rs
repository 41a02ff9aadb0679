//! Recording sink for incoming media and still photos.
//!
//! The core hands every frame it wants persisted to a [`MediaSink`];
//! the filesystem implementation writes one JPEG file per frame under
//! `<root>/<camera>/`. Stations wrap the sink in an [`ImageSaver`] so disk
//! latency never stalls a session: saves are queued onto a background
//! thread, a full queue drops the frame, and failures only increment a
//! counter (storage errors never affect session state).

use crate::error::{Error, Result};
use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use std::fs;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{SystemTime, UNIX_EPOCH};

/// Persistent storage surface consumed by the core
pub trait MediaSink: Send + Sync {
    /// Append one JPEG captured by `camera` at `timestamp`
    fn append_jpeg(&self, camera: &str, timestamp: SystemTime, jpeg: &[u8]) -> Result<()>;
}

/// Writes recordings as individual JPEG files under a root directory
pub struct FsMediaSink {
    root: PathBuf,
}

impl FsMediaSink {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Directory names must not depend on untrusted camera names
    fn sanitize(name: &str) -> String {
        let cleaned: String = name
            .chars()
            .map(|c| if c.is_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
            .collect();
        if cleaned.is_empty() {
            "unknown-camera".to_string()
        } else {
            cleaned
        }
    }
}

impl MediaSink for FsMediaSink {
    fn append_jpeg(&self, camera: &str, timestamp: SystemTime, jpeg: &[u8]) -> Result<()> {
        let dir = self.root.join(Self::sanitize(camera));
        fs::create_dir_all(&dir).map_err(|e| Error::Storage(e.to_string()))?;

        let millis = timestamp
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis())
            .unwrap_or(0);
        let path = dir.join(format!("{}.jpg", millis));
        fs::write(&path, jpeg).map_err(|e| Error::Storage(e.to_string()))?;
        Ok(())
    }
}

struct SaveJob {
    camera: String,
    timestamp: SystemTime,
    jpeg: Vec<u8>,
}

/// Background writer decoupling sessions from storage latency
pub struct ImageSaver {
    tx: Sender<SaveJob>,
    errors: Arc<AtomicU64>,
    handle: Option<JoinHandle<()>>,
}

impl ImageSaver {
    /// Queue capacity; at 24 fps this is several seconds of backlog
    const QUEUE_CAPACITY: usize = 64;

    pub fn start(sink: Arc<dyn MediaSink>) -> Result<Self> {
        let (tx, rx) = bounded::<SaveJob>(Self::QUEUE_CAPACITY);
        let errors = Arc::new(AtomicU64::new(0));
        let errors_clone = Arc::clone(&errors);

        let handle = thread::Builder::new()
            .name("image-saver".to_string())
            .spawn(move || Self::writer_loop(rx, sink, errors_clone))?;

        Ok(Self {
            tx,
            errors,
            handle: Some(handle),
        })
    }

    fn writer_loop(rx: Receiver<SaveJob>, sink: Arc<dyn MediaSink>, errors: Arc<AtomicU64>) {
        while let Ok(job) = rx.recv() {
            if let Err(e) = sink.append_jpeg(&job.camera, job.timestamp, &job.jpeg) {
                let count = errors.fetch_add(1, Ordering::Relaxed) + 1;
                if count.is_power_of_two() {
                    log::warn!("Recording write failed ({} total): {}", count, e);
                }
            }
        }
        log::debug!("Image saver thread exiting");
    }

    /// Queue a frame for persistence; never blocks. A full queue drops the
    /// frame and counts it as an error.
    pub fn save(&self, camera: &str, timestamp: SystemTime, jpeg: &[u8]) {
        let job = SaveJob {
            camera: camera.to_string(),
            timestamp,
            jpeg: jpeg.to_vec(),
        };
        match self.tx.try_send(job) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) | Err(TrySendError::Disconnected(_)) => {
                self.errors.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    /// Frames lost to storage failures or backlog
    pub fn error_count(&self) -> u64 {
        self.errors.load(Ordering::Relaxed)
    }
}

impl Drop for ImageSaver {
    fn drop(&mut self) {
        // Closing the channel lets the writer drain and exit
        let (replacement, _) = bounded(1);
        drop(std::mem::replace(&mut self.tx, replacement));
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}
