use thiserror::Error;

/// Errors raised by the object model: schema lookup, validation, and
/// canonical encoding.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ObjectError {
    /// The object names a recipe that was never registered.
    #[error("unknown recipe: {0}")]
    UnknownRecipe(String),

    /// A field failed recipe validation.
    #[error("validation failed for field `{field}`: {reason}")]
    Validation { field: String, reason: String },

    /// The object cannot be canonically encoded, or stored bytes cannot be
    /// decoded back into an object.
    #[error("invalid encoding: {0}")]
    InvalidEncoding(String),
}

impl ObjectError {
    pub fn validation(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Validation {
            field: field.into(),
            reason: reason.into(),
        }
    }
}
