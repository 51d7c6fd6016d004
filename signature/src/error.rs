use thiserror::Error;

/// Contract violations detected while building a [`crate::Signature`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SignatureError {
    /// A field name is not a valid identifier.
    #[error("Invalid field name '{name}': must start with a letter and contain only letters, digits or '_'")]
    InvalidName {
        /// The rejected name.
        name: String,
    },

    /// Two fields on the same side share a name.
    #[error("Duplicate {side} field name '{name}'")]
    DuplicateField {
        /// `input` or `output`.
        side: &'static str,
        /// The duplicated name.
        name: String,
    },

    /// Two fields on the same side derive the same label.
    #[error("{side} fields '{first}' and '{second}' share the title '{title}'")]
    DuplicateTitle {
        /// `input` or `output`.
        side: &'static str,
        /// The shared title.
        title: String,
        /// The field declared first.
        first: String,
        /// The field declared second.
        second: String,
    },

    /// A name is used both as an input and as an output.
    #[error("Field '{name}' appears in both inputs and outputs")]
    InputOutputOverlap {
        /// The shared name.
        name: String,
    },

    /// Inputs cannot be internal.
    #[error("Input field '{name}' cannot be marked internal")]
    InternalInput {
        /// The offending input.
        name: String,
    },

    /// Inputs cannot be class typed.
    #[error("Input field '{name}' cannot use the class type")]
    ClassInput {
        /// The offending input.
        name: String,
    },

    /// A class field has no usable options.
    #[error("Class field '{name}' requires at least one option")]
    EmptyClassOptions {
        /// The offending field.
        name: String,
    },

    /// A string pattern constraint does not compile.
    #[error("Field '{name}' has an invalid pattern: {message}")]
    InvalidPattern {
        /// The offending field.
        name: String,
        /// Regex compiler message.
        message: String,
    },

    /// The signature declares no outputs.
    #[error("Signature must declare at least one output field")]
    NoOutputs,
}

/// Failures raised while mapping model text onto output fields.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ExtractionError {
    /// One or more required output labels never appeared.
    #[error("Required field not found: {}", fields.join(", "))]
    RequiredFieldNotFound {
        /// Names of the missing fields.
        fields: Vec<String>,
        /// Text that was searched.
        content: String,
    },

    /// A required field's label appeared but no value followed it.
    #[error("Required field is missing a value: {field}")]
    MissingValue {
        /// The field name.
        field: String,
    },

    /// An array field was neither a JSON array nor a markdown list.
    #[error("Invalid Array: {message}")]
    InvalidArray {
        /// The field name.
        field: String,
        /// Why the parse failed.
        message: String,
        /// The raw span.
        raw: String,
    },

    /// A json field did not parse.
    #[error("Invalid JSON for field '{field}': {message}")]
    InvalidJson {
        /// The field name.
        field: String,
        /// Parser message.
        message: String,
        /// The raw span.
        raw: String,
    },

    /// A scalar could not be converted to its declared kind.
    #[error("Invalid {expected} for field '{field}': '{raw}'")]
    InvalidValue {
        /// The field name.
        field: String,
        /// Description of the expected kind.
        expected: String,
        /// The raw span.
        raw: String,
    },

    /// A class value is not one of the declared options.
    #[error("Invalid class for field '{field}': '{raw}' is not one of {}", options.join(", "))]
    InvalidClass {
        /// The field name.
        field: String,
        /// The raw span.
        raw: String,
        /// Accepted options.
        options: Vec<String>,
    },

    /// A converted value violates a declared constraint.
    #[error("Field '{field}' {message}")]
    ConstraintViolation {
        /// The field name.
        field: String,
        /// Which bound failed.
        message: String,
    },

    /// Strict mode saw a label that belongs to no output field.
    #[error("Unexpected field label '{label}' in strict mode")]
    UnexpectedLabel {
        /// The unknown label text, without the colon.
        label: String,
    },
}

impl ExtractionError {
    /// Names of the fields this error concerns, used to build corrective feedback.
    #[must_use]
    pub fn fields(&self) -> Vec<&str> {
        match self {
            Self::RequiredFieldNotFound { fields, .. } => fields.iter().map(String::as_str).collect(),
            Self::MissingValue { field }
            | Self::InvalidArray { field, .. }
            | Self::InvalidJson { field, .. }
            | Self::InvalidValue { field, .. }
            | Self::InvalidClass { field, .. }
            | Self::ConstraintViolation { field, .. } => vec![field.as_str()],
            Self::UnexpectedLabel { .. } => Vec::new(),
        }
    }
}
