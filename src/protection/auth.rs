use sha2::{Digest, Sha256};
use thiserror::Error;

const PIN_LENGTH: std::ops::RangeInclusive<usize> = 4..=12;

/// Reasons a parental unlock attempt is refused
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum PinError {
    #[error("Parental unlock is not available (parental mode with a configured PIN is required)")]
    Unavailable,

    #[error("PIN must be 4 to 12 digits")]
    InvalidFormat,

    #[error("Incorrect PIN")]
    Mismatch,
}

/// Parental PIN hashing and verification
pub struct PinVerifier;

impl PinVerifier {
    /// Check that a PIN is 4-12 ASCII digits after trimming
    pub fn validate_format(pin: &str) -> Result<&str, PinError> {
        let pin = pin.trim();
        if PIN_LENGTH.contains(&pin.len()) && pin.bytes().all(|b| b.is_ascii_digit()) {
            Ok(pin)
        } else {
            Err(PinError::InvalidFormat)
        }
    }

    /// Hex SHA-256 of the trimmed PIN
    pub fn hash_pin(pin: &str) -> String {
        let digest = Sha256::digest(pin.trim().as_bytes());
        hex::encode(digest)
    }

    /// Validate and hash a new PIN, for storing as `parentPinHash`
    pub fn hash_new_pin(pin: &str) -> Result<String, PinError> {
        Self::validate_format(pin).map(Self::hash_pin)
    }

    /// Check a candidate PIN against the stored hash.
    ///
    /// Format is checked before anything is hashed, so a malformed PIN is
    /// reported as `InvalidFormat` rather than `Mismatch`.
    pub fn verify(pin: &str, stored_hash: &str) -> Result<(), PinError> {
        let pin = Self::validate_format(pin)?;
        let candidate = Self::hash_pin(pin);

        if constant_shape_eq(candidate.as_bytes(), stored_hash.trim().as_bytes()) {
            Ok(())
        } else {
            Err(PinError::Mismatch)
        }
    }
}

/// Compares every byte regardless of where the first difference is.
/// Empty input never matches.
fn constant_shape_eq(a: &[u8], b: &[u8]) -> bool {
    if a.is_empty() || a.len() != b.len() {
        return false;
    }

    a.iter()
        .zip(b)
        .fold(0u8, |diff, (x, y)| diff | (x ^ y.to_ascii_lowercase()))
        == 0
}
