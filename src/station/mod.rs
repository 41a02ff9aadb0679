//! Station-side pipeline: discovery -> sessions -> presenter events

pub mod discovery;
pub mod remote_camera;

pub use discovery::{CameraInfo, Station, StationSettings};
pub use remote_camera::{
    RemoteCamera, SessionConfig, SessionCore, SessionState, StationEvent,
};
