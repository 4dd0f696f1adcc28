//! Camera models: the ground-to-image contract and a reference frame camera.

pub mod frame;
pub mod model;

pub use frame::FrameCamera;
pub use model::{CameraModel, ExteriorOrientation, GeometryError};
