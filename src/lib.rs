//! QCCTV - LAN-local camera surveillance core
//!
//! Camera nodes capture live video, encode it and publish it over TCP;
//! station nodes discover cameras over UDP broadcast, subscribe to their
//! streams and steer them with command datagrams. This crate is the
//! networking core shared by both roles: discovery, wire framing,
//! per-peer session state, watchdog liveness and the camera's adaptive
//! resolution control loop.
//!
//! Everything user-facing (GUI, storage layout, OS camera drivers, the
//! JPEG codec) sits behind the traits in [`camera`], [`codec`] and
//! [`saver`].

pub mod camera;
pub mod codec;
pub mod config;
pub mod error;
pub mod frame;
pub mod saver;
pub mod station;
pub mod types;
pub mod watchdog;
pub mod wire;

// Re-export commonly used types
pub use config::Config;
pub use error::{Error, Result};
