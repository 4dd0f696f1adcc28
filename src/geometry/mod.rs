//! Geometry utilities: instrument pointing rotations, ground coordinate parameterizations.

pub mod rotation;
pub mod surface;

pub use rotation::{boresight, pointing_matrix, pointing_partials, skew};
pub use surface::CoordinateType;
