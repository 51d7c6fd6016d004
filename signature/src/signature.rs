//! The [`Signature`] type: ordered inputs, ordered outputs and an instruction.

use std::collections::{HashMap, HashSet};

use regex::Regex;
use serde::Serialize;

use crate::error::SignatureError;
use crate::field::{Field, FieldKind};

/// A validated input/output contract for one generation program.
///
/// Field definitions are fixed once built; only the instruction text can be
/// replaced afterwards.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Signature {
    description: Option<String>,
    inputs: Vec<Field>,
    outputs: Vec<Field>,
}

impl Signature {
    /// Starts a new builder.
    #[must_use]
    pub fn builder() -> SignatureBuilder {
        SignatureBuilder::default()
    }

    /// Builds and validates a signature from field lists.
    pub fn new(
        description: Option<String>,
        inputs: Vec<Field>,
        outputs: Vec<Field>,
    ) -> Result<Self, SignatureError> {
        validate(&inputs, &outputs)?;
        Ok(Self {
            description,
            inputs,
            outputs,
        })
    }

    /// Instruction text, if any.
    #[must_use]
    pub fn description(&self) -> Option<&str> {
        self.description.as_deref()
    }

    /// Replaces the instruction text without touching field definitions.
    pub fn set_description(&mut self, description: impl Into<String>) {
        self.description = Some(description.into());
    }

    /// Input fields in declaration order.
    #[must_use]
    pub fn inputs(&self) -> &[Field] {
        &self.inputs
    }

    /// Output fields in declaration order.
    #[must_use]
    pub fn outputs(&self) -> &[Field] {
        &self.outputs
    }

    /// Looks up an output field by name.
    #[must_use]
    pub fn output(&self, name: &str) -> Option<&Field> {
        self.outputs.iter().find(|f| f.name == name)
    }

    /// Whether any output is marked internal.
    #[must_use]
    pub fn has_internal_outputs(&self) -> bool {
        self.outputs.iter().any(|f| f.is_internal)
    }
}

/// Fluent builder for [`Signature`].
#[derive(Debug, Default, Clone)]
pub struct SignatureBuilder {
    description: Option<String>,
    inputs: Vec<Field>,
    outputs: Vec<Field>,
}

impl SignatureBuilder {
    /// Sets the instruction text.
    #[must_use]
    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    /// Appends an input field.
    #[must_use]
    pub fn input(mut self, field: Field) -> Self {
        self.inputs.push(field);
        self
    }

    /// Appends an output field.
    #[must_use]
    pub fn output(mut self, field: Field) -> Self {
        self.outputs.push(field);
        self
    }

    /// Validates and builds the signature.
    pub fn build(self) -> Result<Signature, SignatureError> {
        Signature::new(self.description, self.inputs, self.outputs)
    }
}

fn is_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    chars.next().is_some_and(|c| c.is_ascii_alphabetic())
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

fn check_side(fields: &[Field], side: &'static str) -> Result<(), SignatureError> {
    let mut seen = HashSet::new();
    let mut titles: HashMap<&str, &str> = HashMap::new();
    for field in fields {
        if !is_identifier(&field.name) {
            return Err(SignatureError::InvalidName {
                name: field.name.clone(),
            });
        }
        if !seen.insert(field.name.as_str()) {
            return Err(SignatureError::DuplicateField {
                side,
                name: field.name.clone(),
            });
        }
        if let Some(first) = titles.insert(field.title.as_str(), field.name.as_str()) {
            return Err(SignatureError::DuplicateTitle {
                side,
                title: field.title.clone(),
                first: first.to_string(),
                second: field.name.clone(),
            });
        }
        let constraints = &field.field_type.constraints;
        if field.field_type.kind == FieldKind::Class
            && constraints.options.iter().all(|o| o.trim().is_empty())
        {
            return Err(SignatureError::EmptyClassOptions {
                name: field.name.clone(),
            });
        }
        if let Some(pattern) = &constraints.pattern {
            Regex::new(pattern).map_err(|e| SignatureError::InvalidPattern {
                name: field.name.clone(),
                message: e.to_string(),
            })?;
        }
    }
    Ok(())
}

fn validate(inputs: &[Field], outputs: &[Field]) -> Result<(), SignatureError> {
    if outputs.is_empty() {
        return Err(SignatureError::NoOutputs);
    }

    for field in inputs {
        if field.is_internal {
            return Err(SignatureError::InternalInput {
                name: field.name.clone(),
            });
        }
        if field.field_type.kind == FieldKind::Class {
            return Err(SignatureError::ClassInput {
                name: field.name.clone(),
            });
        }
    }

    check_side(inputs, "input")?;
    check_side(outputs, "output")?;

    let input_names: HashSet<&str> = inputs.iter().map(|f| f.name.as_str()).collect();
    if let Some(field) = outputs.iter().find(|f| input_names.contains(f.name.as_str())) {
        return Err(SignatureError::InputOutputOverlap {
            name: field.name.clone(),
        });
    }

    Ok(())
}
