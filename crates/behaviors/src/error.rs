//! Error types for the behavior engine
//!
//! Configuration problems are raised while extension metadata is read, so a
//! misconfigured class fails before anything reaches storage. Mutation errors
//! are raised by listeners during a flush and abort it.

use thiserror::Error;

/// Result type alias for behavior operations
pub type BehaviorResult<T> = Result<T, BehaviorError>;

/// Top-level error for metadata reads, dispatch and flushes
#[derive(Debug, Error)]
pub enum BehaviorError {
    #[error("Configuration error: {0}")]
    Configuration(#[from] ConfigurationError),

    #[error("Class '{class}' is not a mapped entity")]
    UnmappedClass { class: String },

    #[error("Mutation error: {0}")]
    Mutation(#[from] MutationError),

    #[error("Metadata cache error: {0}")]
    Cache(String),
}

impl BehaviorError {
    /// Create an unmapped class error
    pub fn unmapped(class: impl Into<String>) -> Self {
        Self::UnmappedClass {
            class: class.into(),
        }
    }

    /// Whether this error comes from declarative metadata
    pub fn is_configuration(&self) -> bool {
        matches!(self, Self::Configuration(_))
    }
}

impl From<std::io::Error> for BehaviorError {
    fn from(err: std::io::Error) -> Self {
        Self::Cache(err.to_string())
    }
}

impl From<serde_json::Error> for BehaviorError {
    fn from(err: serde_json::Error) -> Self {
        Self::Cache(err.to_string())
    }
}

/// Invalid declarative metadata on a mapped class
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ConfigurationError {
    #[error("{class}: {extension} role '{role}' references unknown field '{field}'")]
    MissingField {
        class: String,
        extension: String,
        role: String,
        field: String,
    },

    #[error("{class}: field '{field}' carries conflicting {extension} roles '{first}' and '{second}'")]
    ConflictingRoles {
        class: String,
        extension: String,
        field: String,
        first: String,
        second: String,
    },

    #[error("{class}: field '{field}' is of type '{actual}' but {extension} expects {expected}")]
    InvalidFieldType {
        class: String,
        extension: String,
        field: String,
        actual: String,
        expected: String,
    },

    #[error("{class}: invalid {extension} option '{option}': {message}")]
    InvalidOption {
        class: String,
        extension: String,
        option: String,
        message: String,
    },

    #[error("{class}: {extension} does not recognize role '{role}'")]
    UnknownRole {
        class: String,
        extension: String,
        role: String,
    },

    #[error("Metadata document error: {message}")]
    Document { message: String },
}

impl ConfigurationError {
    /// Create a missing field error
    pub fn missing_field(
        class: impl Into<String>,
        extension: impl Into<String>,
        role: impl Into<String>,
        field: impl Into<String>,
    ) -> Self {
        Self::MissingField {
            class: class.into(),
            extension: extension.into(),
            role: role.into(),
            field: field.into(),
        }
    }

    /// Create an invalid field type error
    pub fn invalid_field_type(
        class: impl Into<String>,
        extension: impl Into<String>,
        field: impl Into<String>,
        actual: impl Into<String>,
        expected: impl Into<String>,
    ) -> Self {
        Self::InvalidFieldType {
            class: class.into(),
            extension: extension.into(),
            field: field.into(),
            actual: actual.into(),
            expected: expected.into(),
        }
    }

    /// Create an invalid option error
    pub fn invalid_option(
        class: impl Into<String>,
        extension: impl Into<String>,
        option: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self::InvalidOption {
            class: class.into(),
            extension: extension.into(),
            option: option.into(),
            message: message.into(),
        }
    }

    /// Create an unknown role error
    pub fn unknown_role(
        class: impl Into<String>,
        extension: impl Into<String>,
        role: impl Into<String>,
    ) -> Self {
        Self::UnknownRole {
            class: class.into(),
            extension: extension.into(),
            role: role.into(),
        }
    }

    /// Create a metadata document error
    pub fn document(message: impl Into<String>) -> Self {
        Self::Document {
            message: message.into(),
        }
    }
}

/// A listener failed while applying its behavior
#[derive(Debug, Clone, PartialEq, Error)]
pub enum MutationError {
    #[error("{class} has no field '{field}'")]
    UnknownField { class: String, field: String },

    #[error("value for {class}.{field} rejected: {message}")]
    InvalidValue {
        class: String,
        field: String,
        message: String,
    },

    #[error("{phase} event carries no {subject}")]
    MissingSubject { phase: String, subject: String },

    #[error("object {0} is not managed by this unit of work")]
    UnknownObject(u64),

    #[error("{class}: {message}")]
    Rejected { class: String, message: String },
}

impl MutationError {
    /// Create an unknown field error
    pub fn unknown_field(class: impl Into<String>, field: impl Into<String>) -> Self {
        Self::UnknownField {
            class: class.into(),
            field: field.into(),
        }
    }

    /// Create an invalid value error
    pub fn invalid_value(
        class: impl Into<String>,
        field: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self::InvalidValue {
            class: class.into(),
            field: field.into(),
            message: message.into(),
        }
    }

    /// Create a rejected operation error
    pub fn rejected(class: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Rejected {
            class: class.into(),
            message: message.into(),
        }
    }
}
