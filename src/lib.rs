pub mod bundle;
pub mod camera;
pub mod control;
pub mod geometry;
pub mod io;
pub mod synthetic;
