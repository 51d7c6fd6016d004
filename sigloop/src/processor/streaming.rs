use serde_json::Value;
use sigloop_signature::{
    pending_deltas, streaming_extract_final_value, streaming_extract_values, StreamOptions, Values,
};
use tracing::debug;

use super::{output_snapshot, Delta, GenerationState, ResponseProcessor};
use crate::ai::{ChatResponse, ChatResult, FinishReason};
use crate::asserts::{feedback_text, ProcessorContext, ProcessorMode};
use crate::errors::GenerateError;
use crate::functions::merge_function_calls;

impl ResponseProcessor<'_> {
    /// Applies one stream fragment.
    ///
    /// Returns the values that became available with this fragment. A
    /// candidate that fails stops receiving updates; its error is reported by
    /// [`ResponseProcessor::finalize`].
    pub fn process_fragment(
        &mut self,
        states: &mut [GenerationState],
        fragment: ChatResponse,
    ) -> Result<Vec<Delta>, GenerateError> {
        for result in &fragment.results {
            Self::check_index(states, result.index)?;
        }

        let mut deltas = Vec::new();
        for result in fragment.results {
            let state = &mut states[result.index];
            if state.failure.is_some() {
                continue;
            }
            let values = self.apply_chunk(state, result);
            if !values.is_empty() {
                deltas.push(Delta {
                    index: state.index,
                    values,
                    snapshot: false,
                });
            }
        }
        Ok(deltas)
    }

    fn apply_chunk(&mut self, state: &mut GenerationState, result: ChatResult) -> Values {
        let mut values = Values::new();
        if let Some(thought) = result.thought.filter(|t| !t.is_empty()) {
            state.thought.push_str(&thought);
            values.insert(self.thought_field.to_string(), Value::String(thought));
        }
        if !result.function_calls.is_empty() {
            merge_function_calls(&mut state.function_calls, &result.function_calls);
        }
        if let Some(content) = result.content {
            state.content.push_str(&content);
        }
        self.memory
            .update_result(state.index, &state.content, &state.function_calls);

        if result.finish_reason == Some(FinishReason::Length) {
            state.fail(GenerateError::Truncated {
                index: state.index,
                partial_content: state.content.clone(),
            });
            return values;
        }

        match self.extract_partial(state) {
            Ok(()) => values.extend(self.visible_deltas(state)),
            Err(err) => {
                debug!(event = "candidate_failed", index = state.index, error = %err, "Candidate failed mid-stream");
                state.fail(err);
            }
        }
        values
    }

    fn extract_partial(&self, state: &mut GenerationState) -> Result<(), GenerateError> {
        let options = StreamOptions {
            skip_early_fail: self.options.skip_early_fail || !state.function_calls.is_empty(),
            ..self.options
        };
        streaming_extract_values(
            self.signature,
            &mut state.values,
            &mut state.cursor,
            &state.content,
            options,
        )
        .map_err(|source| GenerateError::Extraction {
            index: state.index,
            source,
            content: state.content.clone(),
        })?;

        let Some((field, partial)) = state.cursor.current_partial(self.signature, &state.content)
        else {
            return Ok(());
        };

        for assertion in self.streaming_asserts.iter().filter(|a| a.field == field.name) {
            if let Some(message) = assertion.check(partial, false) {
                return Err(GenerateError::Assertion {
                    index: state.index,
                    field: Some(field.name.clone()),
                    message,
                });
            }
        }

        let ctx = ProcessorContext {
            values: &state.values,
            done: false,
            index: state.index,
        };
        let partial = Value::String(partial.to_string());
        for processor in self
            .processors
            .iter()
            .filter(|p| p.streaming && p.field == field.name)
        {
            // Transforms apply to final values only.
            if processor.mode != ProcessorMode::Feedback {
                continue;
            }
            let Some(text) = processor.process(&partial, &ctx).and_then(feedback_text) else {
                continue;
            };
            // Latest feedback per field, recorded when the turn ends.
            match state.stream_feedback.iter_mut().find(|(f, _)| *f == field.name) {
                Some(entry) => entry.1 = text,
                None => state.stream_feedback.push((field.name.clone(), text)),
            }
        }
        Ok(())
    }

    fn visible_deltas(&self, state: &mut GenerationState) -> Values {
        let mut values = pending_deltas(self.signature, &state.values, &mut state.cursor, &state.content);
        values.retain(|name, _| {
            self.signature
                .output(name)
                .is_none_or(|field| !field.is_internal)
        });
        values
    }

    /// Ends a streamed turn.
    ///
    /// Candidates that called tools have their tools executed and any values
    /// extracted from their accompanying text discarded. All others are
    /// finalized, checked and post-processed. When a transform processor
    /// rewrote a value, a snapshot delta follows the incremental one.
    pub async fn finalize(
        &mut self,
        states: &mut [GenerationState],
    ) -> Result<Vec<Delta>, GenerateError> {
        let mut deltas = Vec::new();
        for state in states.iter_mut() {
            if state.failure.is_some() {
                continue;
            }
            match self.finalize_state(state, &mut deltas).await {
                Ok(()) => {}
                Err(GenerateError::Cancelled) => return Err(GenerateError::Cancelled),
                Err(err) => state.fail(err),
            }
        }

        match states.iter_mut().find_map(|s| s.failure.take()) {
            Some(err) => Err(err),
            None => Ok(deltas),
        }
    }

    async fn finalize_state(
        &mut self,
        state: &mut GenerationState,
        deltas: &mut Vec<Delta>,
    ) -> Result<(), GenerateError> {
        if !state.function_calls.is_empty() {
            state.rollback_turn();
            return self.dispatch_functions(state).await;
        }

        streaming_extract_final_value(
            self.signature,
            &mut state.values,
            &mut state.cursor,
            &state.content,
            self.options,
        )
        .map_err(|source| GenerateError::Extraction {
            index: state.index,
            source,
            content: state.content.clone(),
        })?;

        let values = self.visible_deltas(state);
        if !values.is_empty() {
            deltas.push(Delta {
                index: state.index,
                values,
                snapshot: false,
            });
        }

        let before = state.values.clone();
        self.finish_content(state)?;
        if state.values != before {
            deltas.push(Delta {
                index: state.index,
                values: self.with_thought(output_snapshot(self.signature, &state.values), state),
                snapshot: true,
            });
        }
        Ok(())
    }
}
