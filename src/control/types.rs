//! Identifier types for the control network.

use serde::{Deserialize, Serialize};

/// Identifier of a control point, unique within one network.
///
/// Point ids are free-form strings assigned by whoever built the network
/// (e.g. `"AS15_Tie03"`), so they are only used for lookup and reporting.
/// Inside a run points are addressed by their ordinal in the network.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PointId(pub String);

impl PointId {
    /// Create a new PointId from any string-like value.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for PointId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for PointId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

/// Serial number identifying one image (and therefore one camera model).
///
/// Measures refer back to their image through the serial number; the
/// bundle maps serial numbers to image ordinals once at setup.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SerialNumber(pub String);

impl SerialNumber {
    /// Create a new SerialNumber from any string-like value.
    pub fn new(serial: impl Into<String>) -> Self {
        Self(serial.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for SerialNumber {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for SerialNumber {
    fn from(serial: &str) -> Self {
        Self::new(serial)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_point_id_equality() {
        let id1 = PointId::new("tie_001");
        let id2 = PointId::from("tie_001");
        let id3 = PointId::new("tie_002");

        assert_eq!(id1, id2);
        assert_ne!(id1, id3);
    }

    #[test]
    fn test_serial_number_display() {
        let serial = SerialNumber::new("MGS/561812335:32/MOC-WA/RED");
        assert_eq!(format!("{}", serial), "MGS/561812335:32/MOC-WA/RED");
    }

    #[test]
    fn test_serial_numbers_order_lexically() {
        let mut serials = vec![SerialNumber::new("b"), SerialNumber::new("a")];
        serials.sort();
        assert_eq!(serials[0].as_str(), "a");
    }
}
