//! Camera-side pipeline: grabber -> encoder -> stream server

pub mod encoder;
pub mod grabber;
pub mod local_camera;
pub mod pattern;
pub mod regulator;

pub use encoder::{EncodedFrame, EncoderWorker};
pub use grabber::FrameGrabber;
pub use local_camera::{CameraDriver, CameraEvent, CameraSettings, LocalCamera, NullDriver};
pub use pattern::TestPatternSource;
pub use regulator::ResolutionRegulator;
