//! Label-delimited extraction.
//!
//! The model writes one `<Title>: <value>` section per output field. The
//! streaming entry point is called with the whole buffer received so far and
//! advances an [`ExtractionCursor`]; the batch entry point is simply one
//! streaming pass over the complete text followed by finalization, so both
//! paths produce identical values for the same text.
//!
//! Scalar fields are committed as soon as the next label closes their span,
//! and string fields additionally expose their growing prefix through
//! [`pending_deltas`]. Arrays, `json` and `code` fields are held back until
//! [`streaming_extract_final_value`] because a partial span is not parseable.

mod convert;
mod markdown;

use std::collections::{BTreeSet, HashMap};
use std::sync::LazyLock;

use regex::Regex;
use serde_json::Value;
use tracing::debug;

use crate::error::ExtractionError;
use crate::field::{Field, FieldKind};
use crate::signature::Signature;
use crate::Values;

static LABEL_LINE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?m)^[ \t]*([A-Z][A-Za-z0-9 ]{0,40}):").expect("valid regex"));

/// Flags for streaming extraction.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StreamOptions {
    /// Raise on label-like lines that name no output field.
    pub strict_mode: bool,
    /// Defer "required field not found" for skipped fields until finalization.
    pub skip_early_fail: bool,
}

/// A span whose parse waits for finalization.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct DeferredSpan {
    field: usize,
    start: usize,
    end: usize,
}

/// Incremental extraction state for one candidate's turn.
///
/// Create a fresh cursor per turn; `values` may persist across turns.
#[derive(Debug, Clone, Default)]
pub struct ExtractionCursor {
    current_field: Option<usize>,
    value_start: usize,
    committed_fields: BTreeSet<String>,
    emitted_len: HashMap<String, usize>,
    deferred: Vec<DeferredSpan>,
    strict_checked: usize,
    finalized: bool,
}

impl ExtractionCursor {
    /// Creates an empty cursor.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Name of the field whose value is currently being read.
    #[must_use]
    pub fn current_field<'s>(&self, signature: &'s Signature) -> Option<&'s Field> {
        self.current_field.and_then(|i| signature.outputs().get(i))
    }

    /// Fields committed by this cursor, in name order.
    #[must_use]
    pub const fn committed_fields(&self) -> &BTreeSet<String> {
        &self.committed_fields
    }

    /// Bytes of a streamed string field already delivered through [`pending_deltas`].
    #[must_use]
    pub fn emitted_length(&self, field: &str) -> usize {
        self.emitted_len.get(field).copied().unwrap_or_default()
    }

    /// Byte offset in the buffer where scanning for the next label resumes.
    #[must_use]
    pub const fn scan_position(&self) -> usize {
        self.value_start
    }

    /// Whether the turn has been finalized.
    #[must_use]
    pub const fn is_finalized(&self) -> bool {
        self.finalized
    }

    /// The trimmed text of the open field read so far, if a field is open.
    #[must_use]
    pub fn current_partial<'s, 'c>(
        &self,
        signature: &'s Signature,
        content: &'c str,
    ) -> Option<(&'s Field, &'c str)> {
        let field = self.current_field(signature)?;
        let text = content.get(self.value_start..)?.trim();
        Some((field, text))
    }
}

/// Extracts every output field from a complete text into `values`.
///
/// Keys already present in `values` are kept as they are.
///
/// ```
/// use sigloop_signature::{extract_values, Field, Signature, Values};
///
/// let sig = Signature::builder()
///     .input(Field::new("question"))
///     .output(Field::new("answer"))
///     .output(Field::new("confidence").optional())
///     .build()?;
/// let mut values = Values::new();
/// extract_values(&sig, &mut values, "Answer: Paris")?;
/// assert_eq!(values["answer"], "Paris");
/// assert!(!values.contains_key("confidence"));
/// # Ok::<(), Box<dyn std::error::Error>>(())
/// ```
pub fn extract_values(
    signature: &Signature,
    values: &mut Values,
    content: &str,
) -> Result<(), ExtractionError> {
    extract_values_with(signature, values, content, StreamOptions::default())
}

/// [`extract_values`] with explicit extraction flags.
pub fn extract_values_with(
    signature: &Signature,
    values: &mut Values,
    content: &str,
    options: StreamOptions,
) -> Result<(), ExtractionError> {
    let mut cursor = ExtractionCursor::new();
    streaming_extract_values(signature, values, &mut cursor, content, options)?;
    streaming_extract_final_value(signature, values, &mut cursor, content, options)
}

/// Advances extraction over the buffer received so far.
///
/// `content` must be the full buffer, growing monotonically between calls.
/// Scalar fields whose span has been closed by a later label are committed to
/// `values`; structured fields are recorded for finalization.
pub fn streaming_extract_values(
    signature: &Signature,
    values: &mut Values,
    cursor: &mut ExtractionCursor,
    content: &str,
    options: StreamOptions,
) -> Result<(), ExtractionError> {
    let outputs = signature.outputs();
    let labels: Vec<String> = outputs.iter().map(Field::label).collect();

    if options.strict_mode {
        check_strict(outputs, cursor, content)?;
    }

    loop {
        let first_candidate = cursor.current_field.map_or(0, |i| i + 1);
        let Some((next, pos)) = find_next_label(content, cursor.value_start, &labels, first_candidate)
        else {
            break;
        };

        if let Some(open) = cursor.current_field {
            close_span(outputs, values, cursor, content, open, pos)?;
        }

        if !options.skip_early_fail {
            let skipped: Vec<String> = outputs[first_candidate..next]
                .iter()
                .filter(|f| !f.is_optional && !values.contains_key(&f.name))
                .map(|f| f.name.clone())
                .collect();
            if !skipped.is_empty() {
                return Err(ExtractionError::RequiredFieldNotFound {
                    fields: skipped,
                    content: content.to_string(),
                });
            }
        }

        cursor.current_field = Some(next);
        cursor.value_start = pos + labels[next].len();
    }

    Ok(())
}

/// Finishes a turn: closes the open field, parses deferred fields and checks
/// that every required output is present.
pub fn streaming_extract_final_value(
    signature: &Signature,
    values: &mut Values,
    cursor: &mut ExtractionCursor,
    content: &str,
    options: StreamOptions,
) -> Result<(), ExtractionError> {
    let outputs = signature.outputs();

    if !cursor.finalized {
        let scan = StreamOptions {
            skip_early_fail: true,
            ..options
        };
        streaming_extract_values(signature, values, cursor, content, scan)?;

        if let Some(open) = cursor.current_field {
            close_span(outputs, values, cursor, content, open, content.len())?;
        }

        for span in std::mem::take(&mut cursor.deferred) {
            let raw = content.get(span.start..span.end).unwrap_or_default();
            commit(&outputs[span.field], raw, values, cursor)?;
        }
        cursor.finalized = true;
    }

    let missing: Vec<String> = outputs
        .iter()
        .filter(|f| !f.is_optional && !values.contains_key(&f.name))
        .map(|f| f.name.clone())
        .collect();
    if !missing.is_empty() {
        return Err(ExtractionError::RequiredFieldNotFound {
            fields: missing,
            content: content.to_string(),
        });
    }

    debug!(
        event = "stream_finalized",
        committed = cursor.committed_fields.len(),
        "Extraction finalized"
    );
    Ok(())
}

/// Returns values not yet delivered to the consumer and marks them delivered.
///
/// String fields yield appended text chunks: the chunks for one field
/// concatenate to its final trimmed value. All other fields yield their
/// complete value once committed.
pub fn pending_deltas(
    signature: &Signature,
    values: &Values,
    cursor: &mut ExtractionCursor,
    content: &str,
) -> Values {
    let mut deltas = Values::new();
    let labels: Vec<String> = signature.outputs().iter().map(Field::label).collect();

    for (index, field) in signature.outputs().iter().enumerate() {
        let streams_text = field.field_type.kind == FieldKind::String && !field.field_type.is_array;

        if cursor.committed_fields.contains(&field.name) {
            let Some(value) = values.get(&field.name) else {
                continue;
            };
            match value {
                Value::String(s) if streams_text => {
                    let sent = cursor.emitted_length(&field.name);
                    if let Some(rest) = s.get(sent..).filter(|r| !r.is_empty()) {
                        deltas.insert(field.name.clone(), Value::String(rest.to_string()));
                    }
                    cursor.emitted_len.insert(field.name.clone(), s.len());
                }
                _ => {
                    if !cursor.emitted_len.contains_key(&field.name) {
                        deltas.insert(field.name.clone(), value.clone());
                        cursor.emitted_len.insert(field.name.clone(), 0);
                    }
                }
            }
        } else if streams_text
            && cursor.current_field == Some(index)
            && !values.contains_key(&field.name)
        {
            let partial = stable_partial(content, cursor.value_start, &labels[index + 1..]);
            let sent = cursor.emitted_length(&field.name);
            if partial.len() > sent {
                if let Some(rest) = partial.get(sent..) {
                    deltas.insert(field.name.clone(), Value::String(rest.to_string()));
                    cursor.emitted_len.insert(field.name.clone(), partial.len());
                }
            }
        }
    }

    deltas
}

fn close_span(
    outputs: &[Field],
    values: &mut Values,
    cursor: &mut ExtractionCursor,
    content: &str,
    open: usize,
    end: usize,
) -> Result<(), ExtractionError> {
    let field = &outputs[open];
    let start = cursor.value_start.min(end);
    if field.field_type.is_structured() {
        cursor.deferred.push(DeferredSpan {
            field: open,
            start,
            end,
        });
        cursor.current_field = None;
        return Ok(());
    }
    let raw = content.get(start..end).unwrap_or_default();
    commit(field, raw, values, cursor)?;
    cursor.current_field = None;
    Ok(())
}

fn commit(
    field: &Field,
    raw: &str,
    values: &mut Values,
    cursor: &mut ExtractionCursor,
) -> Result<(), ExtractionError> {
    if values.contains_key(&field.name) {
        return Ok(());
    }
    if let Some(value) = convert::parse_field_value(field, raw)? {
        values.insert(field.name.clone(), value);
    }
    cursor.committed_fields.insert(field.name.clone());
    debug!(event = "field_committed", field = %field.name, "Field committed");
    Ok(())
}

/// Finds the earliest label among outputs `first..` at or after `from`.
fn find_next_label(
    content: &str,
    from: usize,
    labels: &[String],
    first: usize,
) -> Option<(usize, usize)> {
    let mut best: Option<(usize, usize)> = None;
    for (index, label) in labels.iter().enumerate().skip(first) {
        if let Some(pos) = find_label(content, from, label) {
            if best.is_none_or(|(_, p)| pos < p) {
                best = Some((index, pos));
            }
        }
    }
    best
}

fn find_label(content: &str, from: usize, label: &str) -> Option<usize> {
    let step = label.chars().next()?.len_utf8();
    let mut start = from;
    while let Some(rel) = content.get(start..)?.find(label) {
        let pos = start + rel;
        let bounded = content[..pos]
            .chars()
            .next_back()
            .is_none_or(|c| !c.is_alphanumeric());
        if bounded {
            return Some(pos);
        }
        start = pos + step;
    }
    None
}

/// The part of an open string span that can no longer change.
///
/// Trailing whitespace and any suffix that might still grow into one of
/// `labels` are held back, as is text that may still become an absent literal.
fn stable_partial<'c>(content: &'c str, start: usize, labels: &[String]) -> &'c str {
    let Some(span) = content.get(start..) else {
        return "";
    };
    let longest = labels.iter().map(String::len).max().unwrap_or_default();
    let window = span.len().saturating_sub(longest);

    let end = span
        .char_indices()
        .filter(|(i, _)| *i >= window)
        .map(|(i, _)| i)
        .find(|&i| {
            let tail = &span[i..];
            labels
                .iter()
                .any(|l| l.len() > tail.len() && l.starts_with(tail))
        })
        .unwrap_or(span.len());

    let stable = span[..end].trim();
    if convert::may_become_absent(stable) {
        ""
    } else {
        stable
    }
}

/// Rejects label-like lines that are not output labels.
///
/// Only complete lines past `cursor.strict_checked` are examined.
fn check_strict(
    outputs: &[Field],
    cursor: &mut ExtractionCursor,
    content: &str,
) -> Result<(), ExtractionError> {
    let Some(unchecked) = content.get(cursor.strict_checked..) else {
        return Ok(());
    };
    for caps in LABEL_LINE.captures_iter(unchecked) {
        let Some(title) = caps.get(1).map(|m| m.as_str().trim_end()) else {
            continue;
        };
        if !outputs.iter().any(|f| f.title == title) {
            return Err(ExtractionError::UnexpectedLabel {
                label: title.to_string(),
            });
        }
    }
    if let Some(last_newline) = unchecked.rfind('\n') {
        cursor.strict_checked += last_newline + 1;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::field::FieldKind;
    use serde_json::json;

    fn qa() -> Signature {
        Signature::builder()
            .input(Field::new("userQuestion"))
            .output(Field::new("modelAnswer1"))
            .output(Field::new("modelAnswer2").kind(FieldKind::Number))
            .build()
            .unwrap()
    }

    #[test]
    fn test_batch_extracts_in_order() {
        let mut values = Values::new();
        extract_values(&qa(), &mut values, "Model Answer 1: hello\nModel Answer 2: 7").unwrap();
        assert_eq!(values["modelAnswer1"], json!("hello"));
        assert_eq!(values["modelAnswer2"], json!(7));
    }

    #[test]
    fn test_preserves_existing_values() {
        let mut values = Values::new();
        values.insert("modelAnswer1".into(), json!("kept"));
        extract_values(&qa(), &mut values, "Model Answer 1: new\nModel Answer 2: 1").unwrap();
        assert_eq!(values["modelAnswer1"], json!("kept"));
    }

    #[test]
    fn test_skipped_required_field_fails_early() {
        let mut values = Values::new();
        let mut cursor = ExtractionCursor::new();
        let err = streaming_extract_values(
            &qa(),
            &mut values,
            &mut cursor,
            "Model Answer 2: 3",
            StreamOptions::default(),
        )
        .unwrap_err();
        assert!(matches!(err, ExtractionError::RequiredFieldNotFound { .. }));

        let mut cursor = ExtractionCursor::new();
        let lenient = StreamOptions {
            skip_early_fail: true,
            ..StreamOptions::default()
        };
        streaming_extract_values(&qa(), &mut values, &mut cursor, "Model Answer 2: 3", lenient)
            .unwrap();
    }

    #[test]
    fn test_label_requires_word_boundary() {
        let sig = Signature::builder()
            .output(Field::new("reason"))
            .output(Field::new("answer"))
            .build()
            .unwrap();
        let mut values = Values::new();
        extract_values(&sig, &mut values, "Reason: unlike SubAnswer: 3\nAnswer: 4").unwrap();
        assert_eq!(values["reason"], json!("unlike SubAnswer: 3"));
        assert_eq!(values["answer"], json!("4"));
    }

    #[test]
    fn test_string_partials_hold_back_label_prefix() {
        let sig = qa();
        let mut values = Values::new();
        let mut cursor = ExtractionCursor::new();
        let opts = StreamOptions::default();

        let mut streamed = String::new();
        for buffer in [
            "Model Answer 1: Hel",
            "Model Answer 1: Hello wor",
            "Model Answer 1: Hello world\nModel Ans",
            "Model Answer 1: Hello world\nModel Answer 2: 4",
        ] {
            streaming_extract_values(&sig, &mut values, &mut cursor, buffer, opts).unwrap();
            let deltas = pending_deltas(&sig, &values, &mut cursor, buffer);
            if let Some(Value::String(chunk)) = deltas.get("modelAnswer1") {
                assert!(!chunk.contains("Model"));
                streamed.push_str(chunk);
            }
            assert!(!deltas.contains_key("modelAnswer2"));
        }
        assert_eq!(streamed, "Hello world");

        let full = "Model Answer 1: Hello world\nModel Answer 2: 4";
        streaming_extract_final_value(&sig, &mut values, &mut cursor, full, opts).unwrap();
        let deltas = pending_deltas(&sig, &values, &mut cursor, full);
        assert_eq!(deltas.get("modelAnswer2"), Some(&json!(4)));
        assert!(!deltas.contains_key("modelAnswer1"));
    }

    #[test]
    fn test_structured_fields_wait_for_finalization() {
        let sig = Signature::builder()
            .output(Field::new("items").array())
            .output(Field::new("note"))
            .build()
            .unwrap();
        let mut values = Values::new();
        let mut cursor = ExtractionCursor::new();
        let opts = StreamOptions::default();
        let text = "Items: [\"a\", \"b\"]\nNote: done";

        streaming_extract_values(&sig, &mut values, &mut cursor, text, opts).unwrap();
        assert!(!values.contains_key("items"));
        assert!(pending_deltas(&sig, &values, &mut cursor, text).get("items").is_none());

        streaming_extract_final_value(&sig, &mut values, &mut cursor, text, opts).unwrap();
        assert_eq!(values["items"], json!(["a", "b"]));
        assert_eq!(values["note"], json!("done"));
    }

    #[test]
    fn test_strict_mode_rejects_unknown_labels() {
        let sig = qa();
        let strict = StreamOptions {
            strict_mode: true,
            ..StreamOptions::default()
        };
        let mut values = Values::new();
        let mut cursor = ExtractionCursor::new();
        let err = streaming_extract_values(
            &sig,
            &mut values,
            &mut cursor,
            "Model Answer 1: a\nReasoning: b\n",
            strict,
        )
        .unwrap_err();
        assert_eq!(
            err,
            ExtractionError::UnexpectedLabel {
                label: "Reasoning".into()
            }
        );

        let mut values = Values::new();
        let mut cursor = ExtractionCursor::new();
        streaming_extract_values(
            &sig,
            &mut values,
            &mut cursor,
            "Model Answer 1: a\nModel Answer 2: 2\n",
            strict,
        )
        .unwrap();
    }

    #[test]
    fn test_null_literal_is_not_streamed() {
        let sig = Signature::builder()
            .output(Field::new("answer").optional())
            .build()
            .unwrap();
        let mut values = Values::new();
        let mut cursor = ExtractionCursor::new();
        let text = "Answer: null";
        streaming_extract_values(&sig, &mut values, &mut cursor, text, StreamOptions::default())
            .unwrap();
        assert!(pending_deltas(&sig, &values, &mut cursor, text).is_empty());
        streaming_extract_final_value(&sig, &mut values, &mut cursor, text, StreamOptions::default())
            .unwrap();
        assert!(values.is_empty());
    }
}
