//! Ground coordinate parameterizations.
//!
//! Points are stored as body-fixed rectangular coordinates in kilometers.
//! The adjustment solves for a coordinate triple that is either the same
//! rectangular coordinates or planetocentric latitude/longitude (radians)
//! and radius (km). A-priori and adjusted sigmas are exchanged in meters.

use nalgebra::{Matrix3, Vector3};
use serde::{Deserialize, Serialize};

/// Parameterization of a point's ground coordinate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum CoordinateType {
    /// Latitude, longitude (radians) and radius (km).
    #[default]
    Latitudinal,
    /// Body-fixed X, Y, Z (km).
    Rectangular,
}

impl CoordinateType {
    /// Names of the three coordinates, for reporting.
    pub fn labels(&self) -> [&'static str; 3] {
        match self {
            CoordinateType::Latitudinal => ["Latitude", "Longitude", "Radius"],
            CoordinateType::Rectangular => ["X", "Y", "Z"],
        }
    }
}

/// Lower bound on cos(latitude) used when converting longitude sigmas.
const MIN_COS_LATITUDE: f64 = 1e-12;

/// Planetocentric (lat, lon, radius) of a rectangular coordinate.
pub fn to_latitudinal(xyz: &Vector3<f64>) -> Vector3<f64> {
    let radius = xyz.norm();
    if radius == 0.0 {
        return Vector3::zeros();
    }
    let lat = (xyz.z / radius).clamp(-1.0, 1.0).asin();
    let lon = xyz.y.atan2(xyz.x);
    Vector3::new(lat, lon, radius)
}

/// Rectangular coordinate of (lat, lon, radius).
pub fn to_rectangular(lat_lon_radius: &Vector3<f64>) -> Vector3<f64> {
    let (lat, lon, r) = (lat_lon_radius.x, lat_lon_radius.y, lat_lon_radius.z);
    Vector3::new(
        r * lat.cos() * lon.cos(),
        r * lat.cos() * lon.sin(),
        r * lat.sin(),
    )
}

/// Coordinate parameters of a rectangular point under `coordinate_type`.
pub fn parameters_from_rectangular(
    coordinate_type: CoordinateType,
    xyz: &Vector3<f64>,
) -> Vector3<f64> {
    match coordinate_type {
        CoordinateType::Latitudinal => to_latitudinal(xyz),
        CoordinateType::Rectangular => *xyz,
    }
}

/// Rectangular point for coordinate parameters under `coordinate_type`.
pub fn rectangular_from_parameters(
    coordinate_type: CoordinateType,
    params: &Vector3<f64>,
) -> Vector3<f64> {
    match coordinate_type {
        CoordinateType::Latitudinal => to_rectangular(params),
        CoordinateType::Rectangular => *params,
    }
}

/// d(x, y, z) / d(params), evaluated at `params`.
pub fn rectangular_jacobian(coordinate_type: CoordinateType, params: &Vector3<f64>) -> Matrix3<f64> {
    match coordinate_type {
        CoordinateType::Rectangular => Matrix3::identity(),
        CoordinateType::Latitudinal => {
            let (lat, lon, r) = (params.x, params.y, params.z);
            let (slat, clat) = lat.sin_cos();
            let (slon, clon) = lon.sin_cos();
            Matrix3::new(
                -r * slat * clon, -r * clat * slon, clat * clon,
                -r * slat * slon, r * clat * clon, clat * slon,
                r * clat, 0.0, slat,
            )
        }
    }
}

/// Per-parameter scale from meters to parameter units at `params`.
///
/// Latitude and longitude sigmas become radians along the local surface,
/// everything else goes from meters to kilometers.
fn meters_per_parameter(coordinate_type: CoordinateType, params: &Vector3<f64>) -> Vector3<f64> {
    match coordinate_type {
        CoordinateType::Rectangular => Vector3::repeat(1000.0),
        CoordinateType::Latitudinal => {
            let radius_m = params.z * 1000.0;
            let cos_lat = params.x.cos().abs().max(MIN_COS_LATITUDE);
            Vector3::new(radius_m, radius_m * cos_lat, 1000.0)
        }
    }
}

/// Convert sigmas in meters to parameter units at `params`.
pub fn sigmas_to_parameters(
    coordinate_type: CoordinateType,
    params: &Vector3<f64>,
    sigmas_m: &Vector3<f64>,
) -> Vector3<f64> {
    sigmas_m.component_div(&meters_per_parameter(coordinate_type, params))
}

/// Convert sigmas in parameter units at `params` to meters.
pub fn sigmas_to_meters(
    coordinate_type: CoordinateType,
    params: &Vector3<f64>,
    sigmas: &Vector3<f64>,
) -> Vector3<f64> {
    sigmas.component_mul(&meters_per_parameter(coordinate_type, params))
}
