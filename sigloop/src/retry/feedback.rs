//! Corrective feedback for the validation retry layer.

use sigloop_signature::{Field, Signature};

use crate::errors::GenerateError;

/// Output fields an error concerns, falling back to every output field.
#[must_use]
pub fn expected_fields_for<'s>(signature: &'s Signature, error: &GenerateError) -> Vec<&'s Field> {
    let named: Vec<&str> = match error {
        GenerateError::Extraction { source, .. } => source.fields(),
        GenerateError::Assertion {
            field: Some(field), ..
        } => vec![field.as_str()],
        _ => Vec::new(),
    };

    let fields: Vec<&Field> = signature
        .outputs()
        .iter()
        .filter(|f| named.contains(&f.name.as_str()))
        .collect();
    if fields.is_empty() {
        signature.outputs().iter().collect()
    } else {
        fields
    }
}

/// Builds the user turn sent after a failed attempt.
///
/// Includes the attempt counter, the error, the expected format of the
/// affected fields, and an instruction to answer again in full.
///
/// # Examples
///
/// ```
/// use sigloop::errors::GenerateError;
/// use sigloop::retry::build_correction_feedback;
/// use sigloop_signature::{Field, Signature};
///
/// let sig = Signature::builder().output(Field::new("answer")).build()?;
/// let err = GenerateError::Assertion { index: 0, field: None, message: "Too short".into() };
/// let feedback = build_correction_feedback(&sig, &err, 1, 3);
/// assert!(feedback.starts_with("Attempt 1/3"));
/// assert!(feedback.contains("Answer: (string)"));
/// # Ok::<(), Box<dyn std::error::Error>>(())
/// ```
#[must_use]
pub fn build_correction_feedback(
    signature: &Signature,
    error: &GenerateError,
    attempt: usize,
    max_attempts: usize,
) -> String {
    let message = match error {
        GenerateError::Extraction { source, .. } => source.to_string(),
        GenerateError::Assertion { message, .. } => message.clone(),
        other => other.to_string(),
    };

    let mut feedback = format!(
        "Attempt {attempt}/{max_attempts}: The previous response did not satisfy the required output.\n\n"
    );
    feedback.push_str("Error:\n  - ");
    feedback.push_str(&message);
    feedback.push('\n');

    feedback.push_str("\nExpected fields:\n");
    for field in expected_fields_for(signature, error) {
        feedback.push_str(&format!(
            "  - {}: ({}{})\n",
            field.title,
            field.field_type.describe(),
            if field.is_optional { ", optional" } else { "" }
        ));
    }

    feedback.push_str(
        "\nPlease fix the error and respond again with every output field, each on its own line prefixed by its label.",
    );
    feedback
}

#[cfg(test)]
mod tests {
    use super::*;
    use sigloop_signature::{ExtractionError, FieldKind};

    fn signature() -> Signature {
        Signature::builder()
            .output(Field::new("reasoning"))
            .output(Field::new("score").kind(FieldKind::Number).optional())
            .build()
            .unwrap()
    }

    #[test]
    fn test_feedback_names_failing_field() {
        let err = GenerateError::Extraction {
            index: 0,
            source: ExtractionError::InvalidValue {
                field: "score".into(),
                expected: "number".into(),
                raw: "high".into(),
            },
            content: "Score: high".into(),
        };
        let feedback = build_correction_feedback(&signature(), &err, 2, 10);
        assert!(feedback.starts_with("Attempt 2/10"));
        assert!(feedback.contains("Invalid number for field 'score': 'high'"));
        assert!(feedback.contains("Score: (number, optional)"));
        assert!(!feedback.contains("Reasoning: (string)"));
    }

    #[test]
    fn test_feedback_lists_all_fields_without_hint() {
        let err = GenerateError::Assertion {
            index: 0,
            field: None,
            message: "Be concise".into(),
        };
        let sig = signature();
        let fields = expected_fields_for(&sig, &err);
        assert_eq!(fields.len(), 2);
    }
}
