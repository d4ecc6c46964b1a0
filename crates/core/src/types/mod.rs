//! Identifier newtypes shared by every layer

use crate::errors::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident, $label:literal) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(try_from = "String", into = "String")]
        pub struct $name(String);

        impl $name {
            /// Validate and wrap a raw id (rejects empty or whitespace-only ids)
            pub fn new(raw: impl Into<String>) -> Result<Self> {
                let raw = raw.into();
                let trimmed = raw.trim();
                if trimmed.is_empty() {
                    return Err(Error::InvalidArgument(format!("{} must not be empty", $label)));
                }
                if trimmed.chars().any(|c| c.is_control() || c == ',' || c == '&') {
                    return Err(Error::InvalidArgument(format!("{} is malformed: {:?}", $label, raw)));
                }
                Ok(Self(trimmed.to_string()))
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }

        impl TryFrom<String> for $name {
            type Error = Error;

            fn try_from(raw: String) -> Result<Self> {
                Self::new(raw)
            }
        }

        impl From<$name> for String {
            fn from(id: $name) -> String {
                id.0
            }
        }
    };
}

string_id!(
    /// Identifier of a claim (a user's redemption record against a flash offer)
    ClaimId,
    "claim id"
);

string_id!(
    /// Identifier of the signed-in user
    UserId,
    "user id"
);

string_id!(
    /// Identifier of a flash offer
    OfferId,
    "offer id"
);
