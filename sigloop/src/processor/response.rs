use sigloop_signature::extract_values_with;
use tracing::debug;

use super::{output_snapshot, Delta, GenerationState, ResponseProcessor};
use crate::ai::{ChatResponse, ChatResult, FinishReason};
use crate::errors::GenerateError;
use crate::functions::merge_function_calls;

impl ResponseProcessor<'_> {
    /// Processes a complete response.
    ///
    /// Every candidate is processed even when another one fails; the first
    /// failure (by candidate order in the response) is returned afterwards.
    /// On success one snapshot delta per candidate is returned, each holding
    /// the same set of non-internal output fields.
    pub async fn process_response(
        &mut self,
        states: &mut [GenerationState],
        response: ChatResponse,
    ) -> Result<Vec<Delta>, GenerateError> {
        for result in &response.results {
            Self::check_index(states, result.index)?;
        }
        self.memory.add_results(&response.results);

        let mut first_error = None;
        for result in response.results {
            let index = result.index;
            if let Err(err) = self.process_result(&mut states[index], result).await {
                debug!(event = "candidate_failed", index, error = %err, "Candidate failed");
                first_error.get_or_insert(err);
            }
        }
        if let Some(err) = first_error {
            return Err(err);
        }

        Ok(states
            .iter()
            .map(|state| Delta {
                index: state.index,
                values: self.with_thought(output_snapshot(self.signature, &state.values), state),
                snapshot: true,
            })
            .collect())
    }

    async fn process_result(
        &mut self,
        state: &mut GenerationState,
        result: ChatResult,
    ) -> Result<(), GenerateError> {
        state.content = result.content.unwrap_or_default();
        if let Some(thought) = result.thought {
            state.thought = thought;
        }

        if result.finish_reason == Some(FinishReason::Length) {
            return Err(GenerateError::Truncated {
                index: state.index,
                partial_content: state.content.clone(),
            });
        }

        if !result.function_calls.is_empty() {
            merge_function_calls(&mut state.function_calls, &result.function_calls);
            return self.dispatch_functions(state).await;
        }

        extract_values_with(self.signature, &mut state.values, &state.content, self.options)
            .map_err(|source| GenerateError::Extraction {
                index: state.index,
                source,
                content: state.content.clone(),
            })?;
        self.finish_content(state)
    }
}
