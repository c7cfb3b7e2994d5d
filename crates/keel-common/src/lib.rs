// Shared ids, clocks and name rules used across the keel crates.
use std::time::{SystemTime, UNIX_EPOCH};

pub type Result<T> = std::result::Result<T, Error>;

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    #[error("invalid id: {0}")]
    InvalidId(String),
    #[error("invalid name {name:?}: {reason}")]
    InvalidName { name: String, reason: &'static str },
}

/// Id of the first message ever written to a topic.
pub const FIRST_MESSAGE_ID: i64 = 1;

/// High-water mark of a topic that has never stored a message.
pub const NO_MESSAGE_ID: i64 = FIRST_MESSAGE_ID - 1;

const MAX_NAME_LEN: usize = 200;

pub mod ids {
    // Strongly typed IDs so subscription ids never mix with anything else.
    use super::{Error, Result};
    use serde::{Deserialize, Serialize};
    use std::fmt;
    use std::str::FromStr;
    use uuid::Uuid;

    macro_rules! id_type {
        ($name:ident) => {
            #[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
            #[serde(transparent)]
            pub struct $name(Uuid);

            impl $name {
                pub fn new() -> Self {
                    Self(Uuid::new_v4())
                }

                pub fn from_uuid(uuid: Uuid) -> Self {
                    Self(uuid)
                }

                pub fn as_uuid(&self) -> Uuid {
                    self.0
                }

                /// Fixed 16-byte form used by binary record files.
                pub fn to_bytes(&self) -> [u8; 16] {
                    *self.0.as_bytes()
                }

                pub fn from_bytes(bytes: [u8; 16]) -> Self {
                    Self(Uuid::from_bytes(bytes))
                }
            }

            impl Default for $name {
                fn default() -> Self {
                    Self::new()
                }
            }

            impl fmt::Display for $name {
                fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                    write!(f, "{}", self.0)
                }
            }

            impl FromStr for $name {
                type Err = Error;

                fn from_str(input: &str) -> Result<Self> {
                    let uuid =
                        Uuid::parse_str(input).map_err(|_| Error::InvalidId(input.into()))?;
                    Ok(Self(uuid))
                }
            }
        };
    }

    id_type!(SubscriptionId);
}

/// Wall clock in microseconds since the unix epoch.
pub fn now_micros() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_micros() as i64)
        .unwrap_or(0)
}

/// Topic and subscription names end up as directory names and JSON keys,
/// so they are restricted to a portable character set.
pub fn validate_name(name: &str) -> Result<()> {
    let reason = if name.is_empty() {
        Some("must not be empty")
    } else if name.len() > MAX_NAME_LEN {
        Some("is too long")
    } else if name.starts_with('.') {
        Some("must not start with '.'")
    } else if !name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
    {
        Some("may only contain ASCII letters, digits, '-', '_' and '.'")
    } else {
        None
    };
    match reason {
        Some(reason) => Err(Error::InvalidName {
            name: name.to_string(),
            reason,
        }),
        None => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::{Error, ids::SubscriptionId, validate_name};
    use std::str::FromStr;

    #[test]
    fn subscription_id_round_trip() {
        let id = SubscriptionId::new();
        let parsed = SubscriptionId::from_str(&id.to_string()).expect("parse");
        assert_eq!(id, parsed);
        assert_eq!(SubscriptionId::from_bytes(id.to_bytes()), id);
    }

    #[test]
    fn subscription_id_rejects_invalid_input() {
        let err = SubscriptionId::from_str("not-a-uuid").expect_err("invalid");
        assert!(matches!(err, Error::InvalidId(s) if s == "not-a-uuid"));
    }

    #[test]
    fn names_are_restricted_to_portable_characters() {
        assert!(validate_name("orders").is_ok());
        assert!(validate_name("orders.v2-eu_1").is_ok());
        assert!(validate_name("").is_err());
        assert!(validate_name("..").is_err());
        assert!(validate_name("a/b").is_err());
        assert!(validate_name(&"x".repeat(201)).is_err());
    }
}
