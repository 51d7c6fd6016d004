//! Prompt rendering and input validation.

use serde_json::Value;
use sigloop_signature::{Field, FieldKind, Signature, Values};

use crate::errors::GenerateError;

fn describe_field(field: &Field) -> String {
    let mut line = format!("- {}: ({}", field.title, field.field_type.describe());
    if field.is_optional {
        line.push_str(", optional");
    }
    line.push(')');

    let constraints = &field.field_type.constraints;
    if let Some(format) = &constraints.format {
        line.push_str(&format!(" format: {format}."));
    }
    if field.field_type.kind == FieldKind::Class {
        line.push_str(&format!(" Options: {}.", constraints.options.join(", ")));
    }
    if let Some(description) = &field.description {
        line.push(' ');
        line.push_str(description);
    }
    line
}

/// Renders the system turn: instruction, field listings and output format.
#[must_use]
pub fn render_system_prompt(signature: &Signature) -> String {
    let mut prompt = String::new();
    if let Some(description) = signature.description() {
        prompt.push_str(description.trim());
        prompt.push_str("\n\n");
    }

    if !signature.inputs().is_empty() {
        prompt.push_str("Input Fields:\n");
        for field in signature.inputs() {
            prompt.push_str(&describe_field(field));
            prompt.push('\n');
        }
        prompt.push('\n');
    }

    prompt.push_str("Output Fields:\n");
    for field in signature.outputs() {
        prompt.push_str(&describe_field(field));
        prompt.push('\n');
    }

    prompt.push_str(
        "\nRespond with each output field in this order, starting each one on a new line with its label. \
         Omit optional fields you have no value for.\n",
    );
    for field in signature.outputs() {
        prompt.push_str(&format!("{} <{}>\n", field.label(), field.field_type.describe()));
    }
    prompt.trim_end().to_string()
}

fn render_value(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Renders the user turn listing each provided input as `<Title>: <value>`.
#[must_use]
pub fn render_user_prompt(signature: &Signature, inputs: &Values) -> String {
    signature
        .inputs()
        .iter()
        .filter_map(|field| {
            let value = inputs.get(&field.name).filter(|v| !v.is_null())?;
            Some(format!("{} {}", field.label(), render_value(value)))
        })
        .collect::<Vec<_>>()
        .join("\n")
}

fn kind_matches(kind: FieldKind, value: &Value) -> bool {
    match kind {
        FieldKind::Number => value.is_number(),
        FieldKind::Boolean => value.is_boolean(),
        FieldKind::Json => true,
        FieldKind::String
        | FieldKind::Code
        | FieldKind::Url
        | FieldKind::Date
        | FieldKind::DateTime
        | FieldKind::Class => value.is_string(),
    }
}

/// Checks that required inputs are present and match their declared types.
pub fn validate_inputs(signature: &Signature, inputs: &Values) -> Result<(), GenerateError> {
    for field in signature.inputs() {
        let Some(value) = inputs.get(&field.name).filter(|v| !v.is_null()) else {
            if field.is_optional {
                continue;
            }
            return Err(GenerateError::InvalidInput(format!(
                "missing required input field '{}'",
                field.name
            )));
        };

        let kind = field.field_type.kind;
        let valid = if field.field_type.is_array {
            value
                .as_array()
                .is_some_and(|items| items.iter().all(|item| kind_matches(kind, item)))
        } else {
            kind_matches(kind, value)
        };
        if !valid {
            return Err(GenerateError::InvalidInput(format!(
                "input field '{}' must be a {}, got {}",
                field.name,
                field.field_type.describe(),
                value
            )));
        }
    }
    Ok(())
}
