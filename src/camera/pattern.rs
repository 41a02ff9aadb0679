//! Deterministic synthetic frame source.
//!
//! Stands in for the OS camera driver in the demo binary and the
//! integration tests: a moving RGB gradient generated at a fixed rate and
//! handed to a sink exactly the way a real capture callback would, with
//! the buffer owned by the source and only borrowed during the call.

use crate::frame::{PixelFormat, RawFrame};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

pub struct TestPatternSource {
    shutdown: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl TestPatternSource {
    /// Generate `width` x `height` RGB frames at `fps`, calling `sink` for
    /// each one from a dedicated thread.
    pub fn start<F>(width: u32, height: u32, fps: u8, sink: F) -> crate::Result<Self>
    where
        F: Fn(&RawFrame<'_>) + Send + 'static,
    {
        let shutdown = Arc::new(AtomicBool::new(false));
        let shutdown_clone = Arc::clone(&shutdown);
        let interval = Duration::from_millis(1000 / fps.max(1) as u64);

        let handle = thread::Builder::new()
            .name("test-pattern".to_string())
            .spawn(move || {
                let mut pixels = vec![0u8; (width * height * 3) as usize];
                let mut tick = 0u32;

                while !shutdown_clone.load(Ordering::Relaxed) {
                    render(&mut pixels, width, height, tick);
                    let frame = RawFrame {
                        width,
                        height,
                        stride: width as usize * 3,
                        format: PixelFormat::Rgb888,
                        captured_at: Instant::now(),
                        pixels: &pixels,
                    };
                    sink(&frame);
                    tick = tick.wrapping_add(1);
                    thread::sleep(interval);
                }
                log::debug!("Test pattern source exiting after {} frames", tick);
            })?;

        Ok(Self {
            shutdown,
            handle: Some(handle),
        })
    }
}

fn render(pixels: &mut [u8], width: u32, height: u32, tick: u32) {
    let shift = (tick * 3) as u8;
    let mut i = 0;
    for y in 0..height {
        for x in 0..width {
            pixels[i] = ((x * 255 / width.max(1)) as u8).wrapping_add(shift);
            pixels[i + 1] = (y * 255 / height.max(1)) as u8;
            pixels[i + 2] = shift;
            i += 3;
        }
    }
}

impl Drop for TestPatternSource {
    fn drop(&mut self) {
        self.shutdown.store(true, Ordering::Relaxed);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}
