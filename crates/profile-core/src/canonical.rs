//! Canonical encoding for signable and hashable records.
//!
//! All hashed/signed objects use postcard serialization:
//! - Field order is Rust struct field order
//! - Floats (only used for GPS fixed-point inputs before conversion) must be
//!   finite and normalized (-0.0 -> +0.0)

use crate::error::{Error, Result};
use serde::Serialize;

/// Serialize a value to canonical bytes using postcard.
///
/// This is the normative encoding for all hashing and signing operations.
pub fn canonical_bytes<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    postcard::to_allocvec(value).map_err(Error::from)
}

/// Normalize a float before it is converted to fixed-point.
/// - NaN and Inf are rejected
/// - -0.0 is converted to +0.0
pub fn normalize_f64(v: f64) -> Result<f64> {
    if v.is_nan() {
        return Err(Error::FloatNormalization("NaN not allowed".into()));
    }
    if v.is_infinite() {
        return Err(Error::FloatNormalization("infinity not allowed".into()));
    }
    if v == 0.0 && v.is_sign_negative() {
        return Ok(0.0);
    }
    Ok(v)
}

/// Convert a degree value to the fixed-point representation used by
/// `Location`, rejecting values that would not round-trip.
pub fn degrees_to_fixed_point(degrees: f64) -> Result<i32> {
    let normalized = normalize_f64(degrees)?;
    let scaled = normalized * crate::types::LOCATION_FIXED_POINT_SCALE as f64;
    if scaled < i32::MIN as f64 || scaled > i32::MAX as f64 {
        return Err(Error::FloatNormalization("degree value out of range".into()));
    }
    Ok(scaled.round() as i32)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Version;

    #[test]
    fn float_normalization() {
        assert_eq!(normalize_f64(1.5).unwrap(), 1.5);
        assert_eq!(normalize_f64(0.0).unwrap(), 0.0);
        assert_eq!(normalize_f64(-0.0).unwrap(), 0.0);
        assert!(normalize_f64(f64::NAN).is_err());
        assert!(normalize_f64(f64::INFINITY).is_err());
        assert!(normalize_f64(f64::NEG_INFINITY).is_err());
    }

    #[test]
    fn canonical_bytes_deterministic() {
        let v = Version::CURRENT;
        let b1 = canonical_bytes(&v).unwrap();
        let b2 = canonical_bytes(&v).unwrap();
        assert_eq!(b1, b2);
    }

    #[test]
    fn fixed_point_round_trip() {
        let fp = degrees_to_fixed_point(51.5074).unwrap();
        assert_eq!(fp, 51_507_400);
    }

    #[test]
    fn fixed_point_rejects_nan() {
        assert!(degrees_to_fixed_point(f64::NAN).is_err());
    }
}
