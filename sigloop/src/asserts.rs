//! Caller-registered checks and post-processors over extracted values.

use std::fmt;
use std::sync::Arc;

use serde_json::Value;
use sigloop_signature::Values;

type AssertFn = dyn Fn(&Values) -> Option<String> + Send + Sync;
type StreamingAssertFn = dyn Fn(&str, bool) -> Option<String> + Send + Sync;
type ProcessFn = dyn Fn(&Value, &ProcessorContext<'_>) -> Option<Value> + Send + Sync;

/// A predicate over a candidate's values.
///
/// Returning `Some(message)` fails the turn; the message becomes corrective
/// feedback for the next attempt.
#[derive(Clone)]
pub struct Assertion {
    check: Arc<AssertFn>,
}

impl Assertion {
    /// Wraps a predicate.
    pub fn new(check: impl Fn(&Values) -> Option<String> + Send + Sync + 'static) -> Self {
        Self {
            check: Arc::new(check),
        }
    }

    pub(crate) fn check(&self, values: &Values) -> Option<String> {
        (self.check)(values)
    }
}

impl fmt::Debug for Assertion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Assertion(..)")
    }
}

/// A predicate over one string field's text while it streams.
///
/// Called with the text so far and `done == false` while the field is open,
/// then once with the final text and `done == true`.
#[derive(Clone)]
pub struct StreamingAssertion {
    /// Field the assertion watches.
    pub field: String,
    check: Arc<StreamingAssertFn>,
}

impl StreamingAssertion {
    /// Wraps a predicate for `field`.
    pub fn new(
        field: impl Into<String>,
        check: impl Fn(&str, bool) -> Option<String> + Send + Sync + 'static,
    ) -> Self {
        Self {
            field: field.into(),
            check: Arc::new(check),
        }
    }

    pub(crate) fn check(&self, text: &str, done: bool) -> Option<String> {
        (self.check)(text, done)
    }
}

impl fmt::Debug for StreamingAssertion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamingAssertion")
            .field("field", &self.field)
            .finish_non_exhaustive()
    }
}

/// What a field processor's output is used for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ProcessorMode {
    /// The output replaces the field's value.
    #[default]
    Transform,
    /// The output is recorded as a user turn tagged `processor`, which keeps
    /// the loop going for another step.
    Feedback,
}

/// Inputs available to a field processor.
#[derive(Debug, Clone, Copy)]
pub struct ProcessorContext<'a> {
    /// All values of the candidate.
    pub values: &'a Values,
    /// Whether the field is complete.
    pub done: bool,
    /// Candidate index.
    pub index: usize,
}

/// A post-processor attached to one output field.
#[derive(Clone)]
pub struct FieldProcessor {
    /// Field the processor runs on.
    pub field: String,
    /// How the output is used.
    pub mode: ProcessorMode,
    /// Also run on partial string text while streaming.
    pub streaming: bool,
    process: Arc<ProcessFn>,
}

impl FieldProcessor {
    /// A processor that rewrites `field` once it is complete.
    pub fn transform(
        field: impl Into<String>,
        process: impl Fn(&Value, &ProcessorContext<'_>) -> Option<Value> + Send + Sync + 'static,
    ) -> Self {
        Self {
            field: field.into(),
            mode: ProcessorMode::Transform,
            streaming: false,
            process: Arc::new(process),
        }
    }

    /// A processor whose output is fed back to the model.
    pub fn feedback(
        field: impl Into<String>,
        process: impl Fn(&Value, &ProcessorContext<'_>) -> Option<Value> + Send + Sync + 'static,
    ) -> Self {
        Self {
            field: field.into(),
            mode: ProcessorMode::Feedback,
            streaming: false,
            process: Arc::new(process),
        }
    }

    /// Also invoke the processor on partial text while streaming.
    ///
    /// Partial invocations never change values or record feedback.
    #[must_use]
    pub const fn streaming(mut self) -> Self {
        self.streaming = true;
        self
    }

    pub(crate) fn process(&self, value: &Value, ctx: &ProcessorContext<'_>) -> Option<Value> {
        (self.process)(value, ctx)
    }
}

impl fmt::Debug for FieldProcessor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FieldProcessor")
            .field("field", &self.field)
            .field("mode", &self.mode)
            .field("streaming", &self.streaming)
            .finish_non_exhaustive()
    }
}

/// Outcome of running processors in final mode.
#[derive(Debug, Default, Clone, PartialEq)]
pub(crate) struct ProcessorOutput {
    /// Feedback lines to record, as `(field, text)`.
    pub feedback: Vec<(String, String)>,
}

/// Runs every processor whose field is present, in registration order.
pub(crate) fn run_processors(
    processors: &[FieldProcessor],
    values: &mut Values,
    index: usize,
) -> ProcessorOutput {
    let mut output = ProcessorOutput::default();
    for processor in processors {
        let Some(value) = values.get(&processor.field).cloned() else {
            continue;
        };
        let ctx = ProcessorContext {
            values: &*values,
            done: true,
            index,
        };
        let Some(result) = processor.process(&value, &ctx) else {
            continue;
        };
        match processor.mode {
            ProcessorMode::Transform => {
                values.insert(processor.field.clone(), result);
            }
            ProcessorMode::Feedback => {
                if let Some(text) = feedback_text(result) {
                    output.feedback.push((processor.field.clone(), text));
                }
            }
        }
    }
    output
}

/// Text of a feedback result, or `None` when the processor had nothing to say.
pub(crate) fn feedback_text(result: Value) -> Option<String> {
    let text = match result {
        Value::Null => return None,
        Value::String(s) => s,
        other => other.to_string(),
    };
    let trimmed = text.trim();
    let empty = trimmed.is_empty()
        || trimmed.eq_ignore_ascii_case("null")
        || trimmed.eq_ignore_ascii_case("undefined");
    (!empty).then_some(text)
}

/// Runs every assertion, returning the first failure.
pub(crate) fn run_assertions(asserts: &[Assertion], values: &Values) -> Option<String> {
    asserts.iter().find_map(|a| a.check(values))
}
