//! Macros for defining typed ID types.

/// Maximum accepted length of any identifier.
pub const MAX_ID_LEN: usize = 253;

/// Defines an opaque string identifier newtype.
///
/// The generated type has:
/// - a `KIND` constant used in error messages
/// - `new()` which validates the input
/// - `as_str()`, `Display`, `FromStr` and `AsRef<str>`
/// - `Serialize`/`Deserialize` as a plain string, validated on the way in
///
/// # Example
///
/// ```ignore
/// define_id!(QueueId, "queue id");
///
/// let id = QueueId::new("q-1")?;
/// let parsed: QueueId = "q-1".parse()?;
/// ```
#[macro_export]
macro_rules! define_id {
    ($name:ident, $kind:literal) => {
        #[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
        pub struct $name(String);

        impl $name {
            /// Human readable name of this identifier kind.
            pub const KIND: &'static str = $kind;

            /// Validates and wraps an identifier.
            pub fn new(value: impl Into<String>) -> Result<Self, $crate::IdError> {
                let value = value.into();
                $crate::validate(Self::KIND, &value)?;
                Ok(Self(value))
            }

            /// Returns the identifier as a string slice.
            #[must_use]
            pub fn as_str(&self) -> &str {
                &self.0
            }

            /// Consumes the identifier, returning the inner string.
            #[must_use]
            pub fn into_inner(self) -> String {
                self.0
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl std::str::FromStr for $name {
            type Err = $crate::IdError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Self::new(s)
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }

        impl serde::Serialize for $name {
            fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
            where
                S: serde::Serializer,
            {
                serializer.serialize_str(&self.0)
            }
        }

        impl<'de> serde::Deserialize<'de> for $name {
            fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
            where
                D: serde::Deserializer<'de>,
            {
                let s = String::deserialize(deserializer)?;
                Self::new(s).map_err(serde::de::Error::custom)
            }
        }
    };
}

/// Shared validation for every identifier kind.
#[doc(hidden)]
pub fn validate(kind: &'static str, value: &str) -> Result<(), crate::IdError> {
    if value.is_empty() {
        return Err(crate::IdError::Empty { kind });
    }
    if value.len() > MAX_ID_LEN {
        return Err(crate::IdError::TooLong {
            kind,
            len: value.len(),
            max: MAX_ID_LEN,
        });
    }
    if let Some(ch) = value
        .chars()
        .find(|c| c.is_whitespace() || c.is_control() || *c == '/')
    {
        return Err(crate::IdError::InvalidCharacter { kind, ch });
    }
    Ok(())
}
