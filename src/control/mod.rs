//! Control network: ground points and their per-image measures.

pub mod measure;
pub mod network;
pub mod point;
pub mod types;

pub use measure::ControlMeasure;
pub use network::ControlNet;
pub use point::{ControlPoint, PointType};
pub use types::{PointId, SerialNumber};
