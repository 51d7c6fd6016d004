//! Per-turn response processing.
//!
//! A [`ResponseProcessor`] consumes one AI-service turn, either a complete
//! [`ChatResponse`](crate::ai::ChatResponse) or a stream of fragments, and
//! drives tool dispatch, extraction, assertions and field processors for
//! every candidate. Each candidate owns a [`GenerationState`]; a failure in
//! one candidate stops work on that candidate only and is reported once the
//! turn ends.

mod response;
mod streaming;

use std::collections::BTreeSet;

use serde_json::Value;
use sigloop_signature::{ExtractionCursor, FieldKind, Signature, StreamOptions, Values};
use tokio_util::sync::CancellationToken;

use crate::ai::{ChatMessage, FunctionCall};
use crate::asserts::{run_assertions, run_processors, Assertion, FieldProcessor, StreamingAssertion};
use crate::errors::GenerateError;
use crate::functions::{execute_function_calls, FunctionDef};
use crate::memory::{Memory, TAG_PROCESSOR};
use crate::step::StepContext;

/// Mutable state of one candidate across the turns of a forward call.
///
/// `values` persists across turns; everything else is reset per turn.
#[derive(Debug, Default)]
pub struct GenerationState {
    /// Candidate index.
    pub index: usize,
    /// Raw text of the active turn.
    pub content: String,
    /// Reasoning text of the active turn.
    pub thought: String,
    /// Extracted values, including internal fields.
    pub values: Values,
    /// Streaming extraction progress for the active turn.
    pub cursor: ExtractionCursor,
    /// Tool calls of the active turn, merged by id.
    pub function_calls: Vec<FunctionCall>,
    /// Names of tools executed in the active turn.
    pub functions_executed: BTreeSet<String>,
    turn_start_values: Values,
    stream_feedback: Vec<(String, String)>,
    failure: Option<GenerateError>,
}

impl GenerationState {
    /// Fresh state for candidate `index`.
    #[must_use]
    pub fn new(index: usize) -> Self {
        Self {
            index,
            ..Self::default()
        }
    }

    /// Clears per-turn data and remembers the values the turn starts from.
    pub fn begin_turn(&mut self) {
        self.content.clear();
        self.thought.clear();
        self.cursor = ExtractionCursor::new();
        self.function_calls.clear();
        self.functions_executed.clear();
        self.stream_feedback.clear();
        self.failure = None;
        self.turn_start_values.clone_from(&self.values);
    }

    /// Discards values written since [`GenerationState::begin_turn`].
    pub fn rollback_turn(&mut self) {
        self.values.clone_from(&self.turn_start_values);
    }

    fn fail(&mut self, error: GenerateError) {
        if self.failure.is_none() {
            self.failure = Some(error);
        }
    }
}

/// Values emitted for one candidate.
#[derive(Debug, Clone, PartialEq)]
pub struct Delta {
    /// Candidate index.
    pub index: usize,
    /// Field values; string chunks append unless `snapshot` is set.
    pub values: Values,
    /// Whether `values` replaces everything known about the candidate.
    pub snapshot: bool,
}

/// Removes internal output fields.
#[must_use]
pub fn strip_internal(signature: &Signature, values: &Values) -> Values {
    let mut stripped = values.clone();
    for field in signature.outputs().iter().filter(|f| f.is_internal) {
        stripped.remove(&field.name);
    }
    stripped
}

/// Every non-internal output field, `null` where absent.
#[must_use]
pub fn output_snapshot(signature: &Signature, values: &Values) -> Values {
    signature
        .outputs()
        .iter()
        .filter(|f| !f.is_internal)
        .map(|f| (f.name.clone(), values.get(&f.name).cloned().unwrap_or(Value::Null)))
        .collect()
}

/// Drives one turn for all candidates.
pub struct ResponseProcessor<'a> {
    signature: &'a Signature,
    memory: &'a mut dyn Memory,
    step: &'a StepContext,
    functions: &'a [FunctionDef],
    asserts: &'a [Assertion],
    streaming_asserts: &'a [StreamingAssertion],
    processors: &'a [FieldProcessor],
    cancel: CancellationToken,
    options: StreamOptions,
    thought_field: &'a str,
}

impl<'a> ResponseProcessor<'a> {
    /// A processor with no tools, checks or processors.
    pub fn new(signature: &'a Signature, memory: &'a mut dyn Memory, step: &'a StepContext) -> Self {
        Self {
            signature,
            memory,
            step,
            functions: &[],
            asserts: &[],
            streaming_asserts: &[],
            processors: &[],
            cancel: CancellationToken::new(),
            options: StreamOptions::default(),
            thought_field: "thought",
        }
    }

    /// Tools the model may call.
    #[must_use]
    pub const fn with_functions(mut self, functions: &'a [FunctionDef]) -> Self {
        self.functions = functions;
        self
    }

    /// Assertions over complete values.
    #[must_use]
    pub const fn with_asserts(mut self, asserts: &'a [Assertion]) -> Self {
        self.asserts = asserts;
        self
    }

    /// Assertions over streamed field text.
    #[must_use]
    pub const fn with_streaming_asserts(mut self, asserts: &'a [StreamingAssertion]) -> Self {
        self.streaming_asserts = asserts;
        self
    }

    /// Field post-processors.
    #[must_use]
    pub const fn with_processors(mut self, processors: &'a [FieldProcessor]) -> Self {
        self.processors = processors;
        self
    }

    /// Cancellation observed while tools run.
    #[must_use]
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Extraction flags.
    #[must_use]
    pub const fn with_options(mut self, options: StreamOptions) -> Self {
        self.options = options;
        self
    }

    /// Field name reasoning deltas are emitted under.
    #[must_use]
    pub const fn with_thought_field(mut self, name: &'a str) -> Self {
        self.thought_field = name;
        self
    }

    fn check_index(states: &[GenerationState], index: usize) -> Result<(), GenerateError> {
        if index < states.len() {
            Ok(())
        } else {
            Err(GenerateError::UnknownCandidate {
                index,
                count: states.len(),
            })
        }
    }

    /// Executes the candidate's merged tool calls and records the results.
    async fn dispatch_functions(&mut self, state: &mut GenerationState) -> Result<(), GenerateError> {
        let calls = state.function_calls.clone();
        let results = tokio::select! {
            () = self.cancel.cancelled() => return Err(GenerateError::Cancelled),
            results = execute_function_calls(self.functions, &calls, self.step, state.index) => results?,
        };

        self.step.record_calls(&calls);
        state
            .functions_executed
            .extend(results.iter().map(|r| r.name.clone()));
        self.memory.add_function_results(results);
        Ok(())
    }

    /// Runs assertions and processors on a candidate whose text is fully extracted.
    fn finish_content(&mut self, state: &mut GenerationState) -> Result<(), GenerateError> {
        if let Some(message) = run_assertions(self.asserts, &state.values) {
            return Err(GenerateError::Assertion {
                index: state.index,
                field: None,
                message,
            });
        }

        for assertion in self.streaming_asserts {
            let Some(Value::String(text)) = state.values.get(&assertion.field) else {
                continue;
            };
            if let Some(message) = assertion.check(text, true) {
                return Err(GenerateError::Assertion {
                    index: state.index,
                    field: Some(assertion.field.clone()),
                    message,
                });
            }
        }

        let output = run_processors(self.processors, &mut state.values, state.index);
        // Final feedback for a field supersedes what its streaming run said.
        let mut feedback = std::mem::take(&mut state.stream_feedback);
        feedback.retain(|(field, _)| output.feedback.iter().all(|(f, _)| f != field));
        feedback.extend(output.feedback);

        if !feedback.is_empty() {
            let text = feedback
                .iter()
                .map(|(field, text)| self.processing_message(field, text))
                .collect::<Vec<_>>()
                .join("\n");
            self.memory.add_request(vec![ChatMessage::user(text)]);
            self.memory.add_tag(TAG_PROCESSOR);
        }
        Ok(())
    }

    fn processing_message(&self, field: &str, text: &str) -> String {
        let output = self.signature.output(field);
        let title = output.map_or(field, |f| f.title.as_str());
        if output.is_some_and(|f| f.field_type.kind == FieldKind::Code) {
            format!(
                "Code in the field \"{title}\" was executed. The code execution produced the following output: {text}"
            )
        } else {
            format!(
                "The field \"{title}\" was processed. The field contents were transformed into the following output: {text}"
            )
        }
    }

    fn with_thought(&self, mut values: Values, state: &GenerationState) -> Values {
        if !state.thought.is_empty() {
            values.insert(self.thought_field.to_string(), Value::String(state.thought.clone()));
        }
        values
    }
}
