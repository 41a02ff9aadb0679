//! Background JPEG encoder worker.
//!
//! One dedicated thread drains a two-slot ring fed by the grabber, scales
//! each frame to the camera's target resolution and encodes it. The newest
//! result is published through an atomic-swap cell; the networking thread
//! snapshots it without blocking. A full ring drops the oldest frame —
//! encoding always works on recent input.
//!
//! Individual encode failures drop the frame and bump a counter; only a
//! failure lasting longer than [`SUSTAINED_ERROR`] is reported upward as a
//! video failure.

use crate::codec::ImageEncoder;
use crate::frame::{scale_bilinear, Frame};
use crate::types::Resolution;
use crossbeam_queue::ArrayQueue;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// Encoder failure must persist this long before the camera reports
/// a video failure
pub const SUSTAINED_ERROR: Duration = Duration::from_secs(2);

/// One encoded JPEG ready for streaming
pub struct EncodedFrame {
    pub jpeg: Vec<u8>,
    pub width: u32,
    pub height: u32,
    pub encoded_at: Instant,
}

/// Latest-frame cell shared between the encoder worker and the
/// networking thread
#[derive(Default)]
pub struct FrameCell {
    slot: Mutex<Option<Arc<EncodedFrame>>>,
}

impl FrameCell {
    fn store(&self, frame: Arc<EncodedFrame>) {
        *self.slot.lock() = Some(frame);
    }

    /// Snapshot the most recent encoded frame, if any
    pub fn latest(&self) -> Option<Arc<EncodedFrame>> {
        self.slot.lock().clone()
    }
}

struct EncoderShared {
    cell: FrameCell,
    resolution: Mutex<Resolution>,
    quality: Mutex<u8>,
    dropped: AtomicU64,
    failed: AtomicU64,
    // Millis since worker start of the first error in the current streak;
    // u64::MAX when healthy
    error_since_ms: AtomicU64,
    started: Instant,
    shutdown: AtomicBool,
}

/// Handle to the encoder worker thread
pub struct EncoderWorker {
    input: Arc<ArrayQueue<Frame>>,
    shared: Arc<EncoderShared>,
    handle: Option<JoinHandle<()>>,
}

impl EncoderWorker {
    /// Single producer, single consumer; two slots keep latency at one
    /// frame while letting the grabber run ahead of a slow encode
    const RING_SLOTS: usize = 2;

    pub fn start(
        encoder: Arc<dyn ImageEncoder>,
        resolution: Resolution,
        quality: u8,
    ) -> crate::Result<Self> {
        let input = Arc::new(ArrayQueue::new(Self::RING_SLOTS));
        let shared = Arc::new(EncoderShared {
            cell: FrameCell::default(),
            resolution: Mutex::new(resolution),
            quality: Mutex::new(quality.clamp(1, 100)),
            dropped: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            error_since_ms: AtomicU64::new(u64::MAX),
            started: Instant::now(),
            shutdown: AtomicBool::new(false),
        });

        let input_clone = Arc::clone(&input);
        let shared_clone = Arc::clone(&shared);
        let handle = thread::Builder::new()
            .name("jpeg-encoder".to_string())
            .spawn(move || Self::encoder_loop(input_clone, shared_clone, encoder))?;

        Ok(Self {
            input,
            shared,
            handle: Some(handle),
        })
    }

    fn encoder_loop(
        input: Arc<ArrayQueue<Frame>>,
        shared: Arc<EncoderShared>,
        encoder: Arc<dyn ImageEncoder>,
    ) {
        let mut scaled = Vec::new();
        let mut encoded_count = 0u64;

        while !shared.shutdown.load(Ordering::Relaxed) {
            let Some(frame) = input.pop() else {
                thread::sleep(Duration::from_millis(2));
                continue;
            };

            let (target_w, target_h) = shared.resolution.lock().dimensions();
            let quality = *shared.quality.lock();

            let to_encode = if frame.width == target_w && frame.height == target_h {
                frame
            } else {
                scale_bilinear(
                    &frame.pixels,
                    frame.width,
                    frame.height,
                    frame.channels(),
                    target_w,
                    target_h,
                    &mut scaled,
                );
                Frame::new(target_w, target_h, frame.format, scaled.clone())
            };

            match encoder.encode(&to_encode, quality) {
                Ok(jpeg) => {
                    shared.cell.store(Arc::new(EncodedFrame {
                        jpeg,
                        width: to_encode.width,
                        height: to_encode.height,
                        encoded_at: Instant::now(),
                    }));
                    shared.error_since_ms.store(u64::MAX, Ordering::Relaxed);
                    encoded_count += 1;
                    if encoded_count % 1000 == 0 {
                        log::debug!("Encoded {} frames", encoded_count);
                    }
                }
                Err(e) => {
                    let failed = shared.failed.fetch_add(1, Ordering::Relaxed) + 1;
                    let now_ms = shared.started.elapsed().as_millis() as u64;
                    // Mark the start of the streak only if healthy before
                    let _ = shared.error_since_ms.compare_exchange(
                        u64::MAX,
                        now_ms,
                        Ordering::Relaxed,
                        Ordering::Relaxed,
                    );
                    if failed.is_power_of_two() {
                        log::warn!("Frame encode failed ({} total): {}", failed, e);
                    }
                }
            }
        }

        log::debug!("Encoder thread exiting ({} frames)", encoded_count);
    }

    /// Submit a frame for encoding; never blocks. When the ring is full
    /// the oldest queued frame is replaced.
    pub fn submit(&self, frame: Frame) {
        if let Err(frame) = self.input.push(frame) {
            let _ = self.input.pop();
            self.shared.dropped.fetch_add(1, Ordering::Relaxed);
            let _ = self.input.push(frame);
        }
    }

    pub fn set_resolution(&self, resolution: Resolution) {
        *self.shared.resolution.lock() = resolution;
    }

    pub fn set_quality(&self, quality: u8) {
        *self.shared.quality.lock() = quality.clamp(1, 100);
    }

    /// Snapshot the most recent encoded frame
    pub fn latest(&self) -> Option<Arc<EncodedFrame>> {
        self.shared.cell.latest()
    }

    /// True while encode failures have persisted beyond the sustained
    /// threshold with no good frame in between
    pub fn sustained_failure(&self) -> bool {
        let since = self.shared.error_since_ms.load(Ordering::Relaxed);
        if since == u64::MAX {
            return false;
        }
        let now_ms = self.shared.started.elapsed().as_millis() as u64;
        now_ms.saturating_sub(since) >= SUSTAINED_ERROR.as_millis() as u64
    }

    /// Frames replaced in the input ring before encoding
    pub fn dropped_count(&self) -> u64 {
        self.shared.dropped.load(Ordering::Relaxed)
    }
}

impl Drop for EncoderWorker {
    fn drop(&mut self) {
        self.shared.shutdown.store(true, Ordering::Relaxed);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}
