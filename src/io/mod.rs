//! Problem loading and solution writing.

pub mod problem;

pub use problem::{load_problem, write_solution, ImageEntry, ProblemFile};
