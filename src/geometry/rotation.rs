//! Instrument pointing from right ascension, declination and twist.
//!
//! The rotation from body-fixed coordinates into the instrument frame is the
//! 3-1-3 Euler sequence
//!
//! ```text
//! R = Rz(twist) · Rx(π/2 − dec) · Rz(π/2 + ra)
//! ```
//!
//! where `Rz`, `Rx` are frame (passive) rotations. The third row of `R` is
//! the boresight, which points at (ra, dec).

use std::f64::consts::FRAC_PI_2;

use nalgebra::{Matrix3, Vector3};

/// Constructs the skew-symmetric matrix [v]× such that [v]× u = v × u.
///
/// ```text
/// [v]× = |  0   -v_z   v_y |
///        |  v_z   0   -v_x |
///        | -v_y  v_x    0  |
/// ```
#[inline]
pub fn skew(v: &Vector3<f64>) -> Matrix3<f64> {
    Matrix3::new(
        0.0, -v.z, v.y,
        v.z, 0.0, -v.x,
        -v.y, v.x, 0.0,
    )
}

/// Frame rotation about the x axis.
#[inline]
pub fn frame_rotation_x(angle: f64) -> Matrix3<f64> {
    let (s, c) = angle.sin_cos();
    Matrix3::new(
        1.0, 0.0, 0.0,
        0.0, c, s,
        0.0, -s, c,
    )
}

/// Frame rotation about the z axis.
#[inline]
pub fn frame_rotation_z(angle: f64) -> Matrix3<f64> {
    let (s, c) = angle.sin_cos();
    Matrix3::new(
        c, s, 0.0,
        -s, c, 0.0,
        0.0, 0.0, 1.0,
    )
}

/// Body-fixed to instrument rotation for angles (ra, dec, twist) in radians.
pub fn pointing_matrix(angles: &Vector3<f64>) -> Matrix3<f64> {
    let (a, b, c) = pointing_factors(angles);
    a * b * c
}

/// Partial derivatives of the pointing matrix with respect to ra, dec and twist.
///
/// Uses d/dθ Rk(θ) = −[e_k]× Rk(θ) for frame rotations.
pub fn pointing_partials(angles: &Vector3<f64>) -> [Matrix3<f64>; 3] {
    let (a, b, c) = pointing_factors(angles);
    let ex = skew(&Vector3::x());
    let ez = skew(&Vector3::z());

    let d_ra = a * b * (-ez * c);
    // θ = π/2 − dec, so d/d(dec) flips the sign.
    let d_dec = a * (ex * b) * c;
    let d_twist = -ez * a * b * c;

    [d_ra, d_dec, d_twist]
}

/// Unit boresight direction in body-fixed coordinates.
pub fn boresight(angles: &Vector3<f64>) -> Vector3<f64> {
    let (ra, dec) = (angles.x, angles.y);
    Vector3::new(dec.cos() * ra.cos(), dec.cos() * ra.sin(), dec.sin())
}

/// Angles (ra, dec, twist=0) whose boresight looks along `direction`.
pub fn angles_looking_at(direction: &Vector3<f64>) -> Vector3<f64> {
    let d = direction.normalize();
    Vector3::new(d.y.atan2(d.x), d.z.clamp(-1.0, 1.0).asin(), 0.0)
}

fn pointing_factors(angles: &Vector3<f64>) -> (Matrix3<f64>, Matrix3<f64>, Matrix3<f64>) {
    (
        frame_rotation_z(angles.z),
        frame_rotation_x(FRAC_PI_2 - angles.y),
        frame_rotation_z(FRAC_PI_2 + angles.x),
    )
}
