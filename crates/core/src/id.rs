//! Stable string identifiers used across the domain.
//!
//! Bill and file ids are caller-supplied strings (the HTTP layer may also ask
//! the router to generate one). Generated ids use UUIDv7 so they sort by
//! creation time.

use core::str::FromStr;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{DomainError, RejectionCode};

const MAX_ID_LEN: usize = 128;

/// Identifier of a bill (the aggregate root).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct BillId(String);

/// Identifier of a file, unique within its bill.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct FileId(String);

fn validate_id(name: &str, raw: &str) -> Result<(), DomainError> {
    let trimmed = raw.trim();
    if trimmed.is_empty() || trimmed != raw {
        return Err(DomainError::rejected(
            RejectionCode::InvalidId,
            format!("{name} must be non-empty without surrounding whitespace"),
        ));
    }
    if raw.len() > MAX_ID_LEN {
        return Err(DomainError::rejected(
            RejectionCode::InvalidId,
            format!("{name} exceeds {MAX_ID_LEN} bytes"),
        ));
    }
    if raw.chars().any(|c| c.is_control()) {
        return Err(DomainError::rejected(
            RejectionCode::InvalidId,
            format!("{name} contains control characters"),
        ));
    }
    Ok(())
}

macro_rules! impl_string_id {
    ($t:ty, $name:literal) => {
        impl $t {
            pub fn new(raw: impl Into<String>) -> Result<Self, DomainError> {
                let raw = raw.into();
                validate_id($name, &raw)?;
                Ok(Self(raw))
            }

            /// Generate a fresh time-ordered identifier.
            pub fn generate() -> Self {
                Self(Uuid::now_v7().to_string())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }

            pub fn into_string(self) -> String {
                self.0
            }
        }

        impl core::fmt::Display for $t {
            fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl AsRef<str> for $t {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }

        impl TryFrom<String> for $t {
            type Error = DomainError;

            fn try_from(value: String) -> Result<Self, Self::Error> {
                Self::new(value)
            }
        }

        impl From<$t> for String {
            fn from(value: $t) -> Self {
                value.0
            }
        }

        impl FromStr for $t {
            type Err = DomainError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Self::new(s)
            }
        }
    };
}

impl_string_id!(BillId, "bill id");
impl_string_id!(FileId, "file id");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_plain_ids() {
        assert!(BillId::new("b1").is_ok());
        assert!(FileId::new("f-2024").is_ok());
    }

    #[test]
    fn rejects_empty_and_padded_ids() {
        assert!(BillId::new("").is_err());
        assert!(BillId::new("  b1").is_err());
        assert!(FileId::new("f\n1").is_err());
    }

    #[test]
    fn generated_ids_are_valid_and_unique() {
        let a = BillId::generate();
        let b = BillId::generate();
        assert_ne!(a, b);
        assert!(BillId::new(a.as_str()).is_ok());
    }
}
