//! Bundle adjustment errors.

use thiserror::Error;

use crate::control::SerialNumber;

/// Who is at fault when a run fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Invalid configuration or input; the run never starts.
    User,
    /// An internal invariant was violated.
    Programmer,
    /// The numerics broke down mid-run; prior iteration results stay intact.
    Numerical,
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum BundleError {
    #[error("Must either solve for camera pointing or spacecraft position")]
    NothingToSolve,

    #[error("invalid bundle settings: {0}")]
    InvalidSettings(String),

    #[error("image [{0}] is measured in the network but has no camera model")]
    MissingImage(SerialNumber),

    #[error("held image [{0}] is not part of the adjustment")]
    UnknownHeldImage(SerialNumber),

    #[error("image [{0}] was supplied more than once")]
    DuplicateImage(SerialNumber),

    #[error("the network has no measures that can be adjusted")]
    EmptyNetwork,

    #[error(
        "degrees of freedom [{0}] is negative: fewer observations and constraints than unknowns"
    )]
    NegativeDegreesOfFreedom(i64),

    #[error("no unknowns exist for {0}")]
    NoUnknowns(String),

    #[error("{entity} ordinal [{ordinal}] is out of range")]
    OrdinalOutOfRange { entity: &'static str, ordinal: usize },

    #[error("unable to solve: system is singular")]
    SingularSystem { pivot: Option<usize> },

    #[error("non-finite correction computed in iteration {iteration}")]
    NonFiniteCorrection { iteration: usize },

    #[error("error propagation failed: {0}")]
    ErrorPropagation(String),
}

impl BundleError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            BundleError::NothingToSolve
            | BundleError::InvalidSettings(_)
            | BundleError::MissingImage(_)
            | BundleError::UnknownHeldImage(_)
            | BundleError::DuplicateImage(_)
            | BundleError::EmptyNetwork
            | BundleError::NegativeDegreesOfFreedom(_) => ErrorKind::User,
            BundleError::NoUnknowns(_) | BundleError::OrdinalOutOfRange { .. } => {
                ErrorKind::Programmer
            }
            BundleError::SingularSystem { .. }
            | BundleError::NonFiniteCorrection { .. }
            | BundleError::ErrorPropagation(_) => ErrorKind::Numerical,
        }
    }
}
