use thiserror::Error;

/// A desired-state record that cannot be turned into a [`crate::ContainerSpec`]
/// or an [`crate::Event`].
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("record has an empty name")]
    EmptyName,
    #[error("invalid container name: {0}")]
    InvalidName(String),
    #[error("image reference is empty")]
    EmptyImage,
    #[error("record is not an object")]
    NotAnObject,
    #[error("malformed record: {0}")]
    Json(String),
    #[error("delete sentinel must be spelled `deleteme`, got `{0}`")]
    NonCanonicalSentinel(String),
    #[error("delete sentinel must be a boolean, got {0}")]
    InvalidSentinel(String),
    #[error("record names {name:?} but is stored as {stored:?}")]
    NameMismatch { name: String, stored: String },
    #[error("invalid value for {field}: {value}")]
    InvalidField { field: &'static str, value: String },
}

impl From<serde_json::Error> for ValidationError {
    fn from(e: serde_json::Error) -> Self {
        ValidationError::Json(e.to_string())
    }
}
