//! # sigloop-signature
//!
//! Declarative input/output contracts ("signatures") and the extraction engine
//! that turns label-delimited model text into typed field values.
//!
//! A signature lists ordered input and output [`Field`]s. The model is asked to
//! answer with one `<Title>: <value>` section per output field; the extraction
//! engine locates those labels and converts each span according to the field's
//! declared [`FieldKind`].
//!
//! ## Example
//!
//! ```
//! use sigloop_signature::{extract_values, Field, FieldKind, Signature, Values};
//!
//! let signature = Signature::builder()
//!     .input(Field::new("userQuestion"))
//!     .output(Field::new("modelAnswer").kind(FieldKind::Number))
//!     .build()?;
//!
//! let mut values = Values::new();
//! extract_values(&signature, &mut values, "Model Answer: 42")?;
//! assert_eq!(values["modelAnswer"], 42);
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

#![deny(missing_docs)]

/// Error types for signature construction and extraction.
pub mod error;

/// Batch and streaming extraction of output fields from model text.
pub mod extract;

/// Field and type model.
pub mod field;

/// Signature construction and validation.
pub mod signature;

pub use error::{ExtractionError, SignatureError};
pub use extract::{
    extract_values, extract_values_with, pending_deltas, streaming_extract_final_value, streaming_extract_values,
    ExtractionCursor, StreamOptions,
};
pub use field::{Constraints, Field, FieldKind, FieldType};
pub use signature::{Signature, SignatureBuilder};

/// Field values keyed by field name.
pub type Values = serde_json::Map<String, serde_json::Value>;
