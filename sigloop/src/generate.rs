//! The agentic generation loop.
//!
//! A [`Generator`] owns a signature plus everything registered against it
//! (tools, assertions, field processors, hooks). Each forward call renders
//! the prompt, then runs steps until the model produces a final answer, a
//! tool or hook calls [`StepContext::stop`], or the step limit is reached.
//! Every step wraps its AI-service call in the infrastructure retry layer and
//! re-prompts with corrective feedback when extraction or an assertion fails.

use std::collections::BTreeMap;
use std::sync::Arc;

use futures::StreamExt;
use serde::de::DeserializeOwned;
use serde_json::Value;
use sigloop_signature::{Signature, StreamOptions, Values};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::ai::{
    AiService, ChatMessage, ChatOutput, ChatRequest, FunctionSpec, ModelConfig, Role, ThinkingBudget,
    TokenUsage,
};
use crate::asserts::{Assertion, FieldProcessor, StreamingAssertion};
use crate::errors::GenerateError;
use crate::functions::FunctionDef;
use crate::memory::{ConversationMemory, Memory, TAG_CORRECTION, TAG_ERROR, TAG_PROCESSOR};
use crate::processor::{output_snapshot, strip_internal, Delta, GenerationState, ResponseProcessor};
use crate::prompt::{render_system_prompt, render_user_prompt, validate_inputs};
use crate::retry::{build_correction_feedback, call_with_retry, RetryConfig};
use crate::step::{self_tuning_function, PendingOptions, SelfTuningConfig, StepContext, StepHooks};

const DELTA_CHANNEL_CAPACITY: usize = 100;

type DeltaSender = mpsc::Sender<Result<GenDelta, GenerateError>>;

/// Per-generator settings.
#[derive(Debug, Clone, PartialEq)]
pub struct GenerateConfig {
    /// Maximum number of steps per forward call (default: 10).
    pub max_steps: usize,
    /// Attempts per step for the validation layer (default: 10).
    pub max_retries: usize,
    /// Infrastructure retry settings.
    pub retry: RetryConfig,
    /// Reject label-like lines that name no output field (default: false).
    pub strict_mode: bool,
    /// Key reasoning text is reported under (default: `thought`).
    pub thought_field_name: String,
    /// Tools whose execution ends the loop.
    pub stop_functions: Vec<String>,
    /// Offer the `adjustGeneration` tool to the model.
    pub self_tuning: Option<SelfTuningConfig>,
    /// Keep correction turns in memory after a successful call (default: false).
    pub disable_memory_cleanup: bool,
}

impl Default for GenerateConfig {
    fn default() -> Self {
        Self {
            max_steps: 10,
            max_retries: 10,
            retry: RetryConfig::default(),
            strict_mode: false,
            thought_field_name: "thought".to_string(),
            stop_functions: Vec::new(),
            self_tuning: None,
            disable_memory_cleanup: false,
        }
    }
}

impl GenerateConfig {
    /// Sets the step limit.
    #[must_use]
    pub const fn with_max_steps(mut self, max_steps: usize) -> Self {
        self.max_steps = max_steps;
        self
    }

    /// Sets the validation attempt limit.
    #[must_use]
    pub const fn with_max_retries(mut self, max_retries: usize) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Sets the infrastructure retry settings.
    #[must_use]
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Enables strict label checking.
    #[must_use]
    pub const fn with_strict_mode(mut self, strict: bool) -> Self {
        self.strict_mode = strict;
        self
    }

    /// Sets the key reasoning text is reported under.
    #[must_use]
    pub fn with_thought_field_name(mut self, name: impl Into<String>) -> Self {
        self.thought_field_name = name.into();
        self
    }

    /// Adds a tool whose execution ends the loop.
    #[must_use]
    pub fn with_stop_function(mut self, name: impl Into<String>) -> Self {
        self.stop_functions.push(name.into());
        self
    }

    /// Enables the self-tuning tool.
    #[must_use]
    pub const fn with_self_tuning(mut self, config: SelfTuningConfig) -> Self {
        self.self_tuning = Some(config);
        self
    }

    /// Keeps correction turns in memory.
    #[must_use]
    pub const fn with_disable_memory_cleanup(mut self, disable: bool) -> Self {
        self.disable_memory_cleanup = disable;
        self
    }
}

/// Per-call settings.
#[derive(Debug, Clone)]
pub struct ForwardOptions {
    /// Model name or key.
    pub model: Option<String>,
    /// Sampling temperature.
    pub temperature: Option<f32>,
    /// Output token limit.
    pub max_tokens: Option<u32>,
    /// Reasoning effort.
    pub thinking_budget: Option<ThinkingBudget>,
    /// Number of candidates to sample (default: 1).
    pub sample_count: usize,
    /// Request streamed responses when the service supports them.
    pub stream: bool,
    /// External cancellation signal.
    pub cancellation: Option<CancellationToken>,
}

impl Default for ForwardOptions {
    fn default() -> Self {
        Self {
            model: None,
            temperature: None,
            max_tokens: None,
            thinking_budget: None,
            sample_count: 1,
            stream: false,
            cancellation: None,
        }
    }
}

impl ForwardOptions {
    /// Sets the model.
    #[must_use]
    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    /// Sets the temperature.
    #[must_use]
    pub const fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = Some(temperature);
        self
    }

    /// Sets the output token limit.
    #[must_use]
    pub const fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = Some(max_tokens);
        self
    }

    /// Sets the reasoning effort.
    #[must_use]
    pub const fn with_thinking_budget(mut self, budget: ThinkingBudget) -> Self {
        self.thinking_budget = Some(budget);
        self
    }

    /// Sets the number of candidates.
    #[must_use]
    pub const fn with_sample_count(mut self, count: usize) -> Self {
        self.sample_count = count;
        self
    }

    /// Requests streamed responses.
    #[must_use]
    pub const fn with_stream(mut self, stream: bool) -> Self {
        self.stream = stream;
        self
    }

    /// Attaches a cancellation token.
    #[must_use]
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancellation = Some(token);
        self
    }
}

/// Result of a forward call.
#[derive(Debug, Clone, PartialEq)]
pub struct GenerateOutput {
    /// Non-internal values per candidate, in index order.
    pub candidates: Vec<Values>,
    /// Token usage summed over every call.
    pub usage: TokenUsage,
    /// Number of steps run.
    pub steps: usize,
}

impl GenerateOutput {
    /// Values of the first candidate.
    #[must_use]
    pub fn values(&self) -> Option<&Values> {
        self.candidates.first()
    }
}

/// One update from [`Generator::streaming_forward`].
#[derive(Debug, Clone, PartialEq)]
pub struct GenDelta {
    /// Bumped whenever earlier deltas became stale.
    pub version: u32,
    /// Candidate index.
    pub index: usize,
    /// Field updates; strings append unless `snapshot` is set.
    pub delta: Values,
    /// Whether `delta` replaces everything known about the candidate.
    pub snapshot: bool,
}

/// Folds [`GenDelta`]s into per-candidate values.
///
/// A newer version discards everything merged so far and older versions are
/// ignored. String updates append to the current text, other values replace
/// it, and snapshots replace the candidate's values (dropping nulls).
#[derive(Debug, Clone, Default)]
pub struct DeltaMerger {
    version: Option<u32>,
    candidates: BTreeMap<usize, Values>,
}

impl DeltaMerger {
    /// An empty merger.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Applies one delta.
    pub fn push(&mut self, delta: &GenDelta) {
        match self.version {
            Some(current) if delta.version < current => return,
            Some(current) if delta.version > current => self.candidates.clear(),
            _ => {}
        }
        self.version = Some(delta.version);

        let values = self.candidates.entry(delta.index).or_default();
        if delta.snapshot {
            *values = delta
                .delta
                .iter()
                .filter(|(_, v)| !v.is_null())
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect();
            return;
        }
        for (key, value) in &delta.delta {
            match (values.get_mut(key), value) {
                (Some(Value::String(current)), Value::String(more)) => current.push_str(more),
                _ => {
                    values.insert(key.clone(), value.clone());
                }
            }
        }
    }

    /// Merged values of candidate `index`.
    #[must_use]
    pub fn values(&self, index: usize) -> Option<&Values> {
        self.candidates.get(&index)
    }

    /// Merged values of every candidate seen, in index order.
    #[must_use]
    pub fn into_candidates(self) -> Vec<Values> {
        self.candidates.into_values().collect()
    }
}

/// Folds a sequence of deltas; see [`DeltaMerger`].
#[must_use]
pub fn merge_deltas<'d>(deltas: impl IntoIterator<Item = &'d GenDelta>) -> Vec<Values> {
    let mut merger = DeltaMerger::new();
    for delta in deltas {
        merger.push(delta);
    }
    merger.into_candidates()
}

/// Whether the loop needs another step.
///
/// The first step always runs. Afterwards every candidate must be
/// continuable: the latest memory entry holds tool results or processor
/// feedback. A candidate that executed a stop function in a tool turn halts
/// the loop.
#[must_use]
pub fn should_continue_steps(
    memory: &dyn Memory,
    stop_functions: &[String],
    states: &[GenerationState],
) -> bool {
    let Some(last) = memory.get_last() else {
        return true;
    };
    let function_turn = last.role == Role::Function;

    states.iter().all(|state| {
        let stop_hit = state
            .functions_executed
            .iter()
            .any(|name| stop_functions.iter().any(|s| s.eq_ignore_ascii_case(name)));
        if function_turn && stop_hit {
            return false;
        }
        function_turn || last.has_tag(TAG_PROCESSOR)
    })
}

/// A signature-driven generation program.
///
/// Cloning is cheap; registered callbacks are shared.
#[derive(Debug, Clone)]
pub struct Generator {
    signature: Arc<Signature>,
    config: GenerateConfig,
    functions: Vec<FunctionDef>,
    asserts: Vec<Assertion>,
    streaming_asserts: Vec<StreamingAssertion>,
    processors: Vec<FieldProcessor>,
    hooks: StepHooks,
}

impl Generator {
    /// A generator with default settings.
    #[must_use]
    pub fn new(signature: Signature) -> Self {
        Self {
            signature: Arc::new(signature),
            config: GenerateConfig::default(),
            functions: Vec::new(),
            asserts: Vec::new(),
            streaming_asserts: Vec::new(),
            processors: Vec::new(),
            hooks: StepHooks::default(),
        }
    }

    /// Replaces the settings.
    #[must_use]
    pub fn with_config(mut self, config: GenerateConfig) -> Self {
        self.config = config;
        self
    }

    /// Registers a tool.
    #[must_use]
    pub fn with_function(mut self, function: FunctionDef) -> Self {
        self.functions.push(function);
        self
    }

    /// Registers an assertion over complete values.
    #[must_use]
    pub fn with_assert(mut self, assertion: Assertion) -> Self {
        self.asserts.push(assertion);
        self
    }

    /// Registers an assertion over streamed field text.
    #[must_use]
    pub fn with_streaming_assert(mut self, assertion: StreamingAssertion) -> Self {
        self.streaming_asserts.push(assertion);
        self
    }

    /// Registers a field processor.
    #[must_use]
    pub fn with_processor(mut self, processor: FieldProcessor) -> Self {
        self.processors.push(processor);
        self
    }

    /// Replaces the step hooks.
    #[must_use]
    pub fn with_hooks(mut self, hooks: StepHooks) -> Self {
        self.hooks = hooks;
        self
    }

    /// The signature.
    #[must_use]
    pub fn signature(&self) -> &Signature {
        &self.signature
    }

    /// The settings.
    #[must_use]
    pub const fn config(&self) -> &GenerateConfig {
        &self.config
    }

    /// Replaces the instruction text; field definitions are untouched.
    pub fn set_instruction(&mut self, instruction: impl Into<String>) {
        Arc::make_mut(&mut self.signature).set_description(instruction);
    }

    /// Runs the loop with a fresh conversation memory.
    pub async fn forward(
        &self,
        ai: &dyn AiService,
        inputs: &Values,
        options: &ForwardOptions,
    ) -> Result<GenerateOutput, GenerateError> {
        let mut memory = ConversationMemory::new();
        self.forward_in(ai, &mut memory, inputs, options).await
    }

    /// Runs the loop against a caller-owned memory.
    pub async fn forward_in(
        &self,
        ai: &dyn AiService,
        memory: &mut dyn Memory,
        inputs: &Values,
        options: &ForwardOptions,
    ) -> Result<GenerateOutput, GenerateError> {
        self.run(ai, memory, inputs, options, None).await
    }

    /// Runs the loop and decodes the first candidate into `T`.
    pub async fn forward_typed<T: DeserializeOwned>(
        &self,
        ai: &dyn AiService,
        inputs: &Values,
        options: &ForwardOptions,
    ) -> Result<T, GenerateError> {
        let output = self.forward(ai, inputs, options).await?;
        let values = output.candidates.into_iter().next().unwrap_or_default();
        Ok(serde_json::from_value(Value::Object(values))?)
    }

    /// Runs the loop on a background task, yielding value deltas as they
    /// become available.
    ///
    /// Streamed responses are requested. A terminal error is delivered as
    /// the last item. Dropping the stream stops the loop at its next delta.
    pub fn streaming_forward(
        &self,
        ai: Arc<dyn AiService>,
        inputs: Values,
        options: ForwardOptions,
    ) -> ReceiverStream<Result<GenDelta, GenerateError>> {
        let (tx, rx) = mpsc::channel(DELTA_CHANNEL_CAPACITY);
        let generator = self.clone();
        let options = ForwardOptions {
            stream: true,
            ..options
        };

        tokio::spawn(async move {
            let mut memory = ConversationMemory::new();
            let result = generator
                .run(ai.as_ref(), &mut memory, &inputs, &options, Some(&tx))
                .await;
            if let Err(err) = result {
                if tx.send(Err(err)).await.is_err() {
                    debug!(event = "consumer_dropped", "Delta consumer dropped before the error was delivered");
                }
            }
        });

        ReceiverStream::new(rx)
    }

    fn offered_functions(&self, ai: &dyn AiService) -> Vec<FunctionDef> {
        let mut functions = self.functions.clone();
        if let Some(config) = self.config.self_tuning {
            functions.push(self_tuning_function(config, &ai.models()));
        }
        functions
    }

    fn candidate_values(&self, states: &[GenerationState]) -> Vec<Values> {
        states
            .iter()
            .map(|state| {
                let mut values = strip_internal(&self.signature, &state.values);
                if !state.thought.is_empty() {
                    values.insert(
                        self.config.thought_field_name.clone(),
                        Value::String(state.thought.clone()),
                    );
                }
                values
            })
            .collect()
    }

    async fn run(
        &self,
        ai: &dyn AiService,
        memory: &mut dyn Memory,
        inputs: &Values,
        options: &ForwardOptions,
        sink: Option<&DeltaSender>,
    ) -> Result<GenerateOutput, GenerateError> {
        validate_inputs(&self.signature, inputs)?;

        let functions = self.offered_functions(ai);
        // Reasoning text may precede tool calls and skip output labels.
        let skip_early_fail = ai.features().function_cot && !functions.is_empty();
        let mut run = LoopRun {
            generator: self,
            ai,
            memory,
            ctx: StepContext::new(self.config.max_steps),
            cancel: options.cancellation.clone().unwrap_or_default(),
            specs: functions.iter().map(FunctionDef::spec).collect(),
            functions,
            sink,
            version: 0,
            stream: options.stream && ai.features().streaming,
            extract_options: StreamOptions {
                strict_mode: self.config.strict_mode,
                skip_early_fail,
            },
        };

        let result = run.execute(inputs, options).await;
        if let Err(GenerateError::Cancelled) = &result {
            info!(event = "generation_cancelled", step = run.ctx.step_index(), "Generation cancelled");
        }
        result
    }
}

/// State of one forward call.
struct LoopRun<'a> {
    generator: &'a Generator,
    ai: &'a dyn AiService,
    memory: &'a mut dyn Memory,
    ctx: StepContext,
    cancel: CancellationToken,
    functions: Vec<FunctionDef>,
    specs: Vec<FunctionSpec>,
    sink: Option<&'a DeltaSender>,
    version: u32,
    stream: bool,
    extract_options: StreamOptions,
}

impl LoopRun<'_> {
    async fn execute(
        &mut self,
        inputs: &Values,
        options: &ForwardOptions,
    ) -> Result<GenerateOutput, GenerateError> {
        let generator = self.generator;
        let signature = generator.signature.as_ref();
        let config = &generator.config;

        self.memory.add_request(vec![
            ChatMessage::system(render_system_prompt(signature)),
            ChatMessage::user(render_user_prompt(signature, inputs)),
        ]);

        let mut states: Vec<GenerationState> =
            (0..options.sample_count.max(1)).map(GenerationState::new).collect();

        for step in 0..config.max_steps {
            if self.cancel.is_cancelled() {
                return Err(GenerateError::Cancelled);
            }
            self.ctx.begin_step(step);
            info!(event = "step_started", step, "Starting step");

            StepHooks::fire(generator.hooks.before_step.as_ref(), &self.ctx);
            if let Some(values) = self.ctx.take_stop() {
                info!(event = "loop_halted", step, reason = "stop", "Loop stopped before the call");
                return self.finish_stopped(&states, values, step).await;
            }
            let pending = self.ctx.take_pending();

            let emitted = self.run_step(step, &mut states, options, &pending).await?;

            let tools_ran = states.iter().any(|s| !s.functions_executed.is_empty());
            if tools_ran {
                StepHooks::fire(generator.hooks.after_function_execution.as_ref(), &self.ctx);
            }
            StepHooks::fire(generator.hooks.after_step.as_ref(), &self.ctx);
            info!(
                event = "step_finished",
                step,
                tools_ran,
                total_tokens = self.ctx.usage().total_tokens,
                "Step finished"
            );

            if let Some(values) = self.ctx.take_stop() {
                info!(event = "loop_halted", step, reason = "stop", "Loop stopped");
                return self.finish_stopped(&states, values, step + 1).await;
            }

            if !should_continue_steps(&*self.memory, &config.stop_functions, &states) {
                info!(event = "loop_halted", step, reason = "complete", "Loop finished");
                self.cleanup();
                return Ok(self.output(&states, step + 1));
            }

            // Processor feedback asks for a fresh answer.
            let reanswer = self
                .memory
                .get_last()
                .is_some_and(|entry| entry.has_tag(TAG_PROCESSOR));
            if reanswer {
                for state in &mut states {
                    state.values.clear();
                }
            }
            if (tools_ran && emitted) || reanswer {
                self.version += 1;
                self.emit_snapshots(&states).await?;
            }
        }

        Err(GenerateError::MaxStepsReached {
            max_steps: config.max_steps,
        })
    }

    /// Runs one step with validation retries. Returns whether any delta was
    /// emitted by the successful attempt.
    async fn run_step(
        &mut self,
        step: usize,
        states: &mut [GenerationState],
        options: &ForwardOptions,
        pending: &PendingOptions,
    ) -> Result<bool, GenerateError> {
        let max_attempts = self.generator.config.max_retries.max(1);
        let mut attempt = 0;

        loop {
            attempt += 1;
            for state in states.iter_mut() {
                if attempt > 1 {
                    state.rollback_turn();
                }
                state.begin_turn();
            }
            if attempt > 1 {
                self.emit_snapshots(states).await?;
            }

            let request = self.build_request(options, pending, states.len());
            let mut usage = None;
            let outcome = match call_with_retry(
                self.ai,
                &request,
                &self.generator.config.retry,
                &self.cancel,
            )
            .await
            {
                Ok(output) => self.consume(output, states, &mut usage).await,
                Err(err) => Err(err),
            };
            if let Some(usage) = usage {
                self.ctx.add_usage(usage);
            }

            let err = match outcome {
                Ok(emitted) => return Ok(emitted),
                Err(err) => err,
            };
            if !err.is_correctable() {
                return Err(err);
            }
            if attempt >= max_attempts {
                warn!(event = "validation_retries_exhausted", step, attempts = attempt, error = %err, "Validation retries exhausted");
                return Err(GenerateError::ValidationRetriesExhausted {
                    attempts: attempt,
                    last: Box::new(err),
                });
            }

            warn!(
                event = "validation_retry",
                step,
                attempt,
                max_attempts,
                error = %err,
                "Re-prompting after invalid output"
            );
            if self
                .memory
                .get_last()
                .is_some_and(|entry| entry.role == Role::Assistant)
            {
                self.memory.add_tag(TAG_ERROR);
            }
            if !matches!(err, GenerateError::Service { .. }) {
                let feedback =
                    build_correction_feedback(&self.generator.signature, &err, attempt, max_attempts);
                self.memory.add_request(vec![ChatMessage::user(feedback)]);
                self.memory.add_tag(TAG_CORRECTION);
            }
            self.version += 1;
        }
    }

    fn build_request(
        &self,
        options: &ForwardOptions,
        pending: &PendingOptions,
        sample_count: usize,
    ) -> ChatRequest {
        ChatRequest {
            messages: self.memory.history(0),
            functions: self.specs.clone(),
            model: pending.model.clone().or_else(|| options.model.clone()),
            model_config: ModelConfig {
                temperature: pending.temperature.or(options.temperature),
                max_tokens: pending.max_tokens.or(options.max_tokens),
                thinking_budget: pending.thinking_budget.or(options.thinking_budget),
                n: (sample_count > 1).then_some(sample_count),
            },
            stream: self.stream,
        }
    }

    /// Processes one service output. Returns whether any delta was emitted.
    async fn consume(
        &mut self,
        output: ChatOutput,
        states: &mut [GenerationState],
        usage: &mut Option<TokenUsage>,
    ) -> Result<bool, GenerateError> {
        let generator = self.generator;
        let sink = self.sink;
        let version = self.version;
        let mut processor = ResponseProcessor::new(&generator.signature, &mut *self.memory, &self.ctx)
            .with_functions(&self.functions)
            .with_asserts(&generator.asserts)
            .with_streaming_asserts(&generator.streaming_asserts)
            .with_processors(&generator.processors)
            .with_cancellation(self.cancel.clone())
            .with_options(self.extract_options)
            .with_thought_field(&generator.config.thought_field_name);

        let mut emitted = false;
        match output {
            ChatOutput::Response(response) => {
                *usage = response.usage;
                let deltas = processor.process_response(states, response).await?;
                emitted |= emit(sink, version, deltas).await?;
            }
            ChatOutput::Stream(mut stream) => {
                loop {
                    let next = tokio::select! {
                        () = self.cancel.cancelled() => return Err(GenerateError::Cancelled),
                        next = stream.next() => next,
                    };
                    let Some(fragment) = next else {
                        break;
                    };
                    let fragment = fragment.map_err(|source| GenerateError::Service { source, retries: 0 })?;
                    if fragment.usage.is_some() {
                        *usage = fragment.usage;
                    }
                    let deltas = processor.process_fragment(states, fragment)?;
                    emitted |= emit(sink, version, deltas).await?;
                }
                let deltas = processor.finalize(states).await?;
                emitted |= emit(sink, version, deltas).await?;
            }
        }
        Ok(emitted)
    }

    async fn emit_snapshots(&self, states: &[GenerationState]) -> Result<(), GenerateError> {
        if self.sink.is_none() {
            return Ok(());
        }
        let deltas = states
            .iter()
            .map(|state| Delta {
                index: state.index,
                values: output_snapshot(&self.generator.signature, &state.values),
                snapshot: true,
            })
            .collect();
        emit(self.sink, self.version, deltas).await.map(|_| ())
    }

    async fn finish_stopped(
        &mut self,
        states: &[GenerationState],
        values: Values,
        steps: usize,
    ) -> Result<GenerateOutput, GenerateError> {
        self.cleanup();
        let mut output = self.output(states, steps);
        for candidate in &mut output.candidates {
            candidate.extend(values.clone());
        }

        let deltas = output
            .candidates
            .iter()
            .enumerate()
            .map(|(index, values)| Delta {
                index,
                values: values.clone(),
                snapshot: true,
            })
            .collect();
        emit(self.sink, self.version, deltas).await?;
        Ok(output)
    }

    fn cleanup(&mut self) {
        if self.generator.config.disable_memory_cleanup {
            return;
        }
        self.memory.remove_by_tag(TAG_CORRECTION);
        self.memory.remove_by_tag(TAG_ERROR);
    }

    fn output(&self, states: &[GenerationState], steps: usize) -> GenerateOutput {
        GenerateOutput {
            candidates: self.generator.candidate_values(states),
            usage: self.ctx.usage(),
            steps,
        }
    }
}

/// Sends deltas to the consumer, if any. Returns whether anything was sent.
async fn emit(sink: Option<&DeltaSender>, version: u32, deltas: Vec<Delta>) -> Result<bool, GenerateError> {
    let Some(tx) = sink else {
        return Ok(false);
    };
    let mut sent = false;
    for delta in deltas {
        let update = GenDelta {
            version,
            index: delta.index,
            delta: delta.values,
            snapshot: delta.snapshot,
        };
        if tx.send(Ok(update)).await.is_err() {
            debug!(event = "consumer_dropped", "Delta consumer dropped");
            return Err(GenerateError::Cancelled);
        }
        sent = true;
    }
    Ok(sent)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ai::{ChatResult, FunctionCall};
    use crate::memory::FunctionResult;
    use serde_json::json;

    fn delta(version: u32, index: usize, values: Value, snapshot: bool) -> GenDelta {
        GenDelta {
            version,
            index,
            delta: values.as_object().cloned().unwrap_or_default(),
            snapshot,
        }
    }

    #[test]
    fn test_merge_appends_strings_and_replaces_scalars() {
        let deltas = vec![
            delta(0, 0, json!({"answer": "Par"}), false),
            delta(0, 0, json!({"answer": "is", "score": 1}), false),
            delta(0, 0, json!({"score": 2}), false),
            delta(0, 1, json!({"answer": "Rome"}), false),
        ];
        let merged = merge_deltas(&deltas);
        assert_eq!(json!(merged[0]), json!({"answer": "Paris", "score": 2}));
        assert_eq!(json!(merged[1]), json!({"answer": "Rome"}));
    }

    #[test]
    fn test_merge_new_version_resets() {
        let deltas = vec![
            delta(0, 0, json!({"answer": "wrong"}), false),
            delta(1, 0, json!({"answer": null, "score": null}), true),
            delta(1, 0, json!({"answer": "right"}), false),
            delta(0, 0, json!({"answer": " stale"}), false),
        ];
        assert_eq!(json!(merge_deltas(&deltas)[0]), json!({"answer": "right"}));
    }

    fn function_memory() -> ConversationMemory {
        let mut memory = ConversationMemory::new();
        memory.add_request(vec![ChatMessage::user("q")]);
        memory.add_results(&[ChatResult {
            index: 0,
            function_calls: vec![FunctionCall::new("c1", "finish", json!({}))],
            ..ChatResult::default()
        }]);
        memory.add_function_results(vec![FunctionResult {
            index: 0,
            function_id: "c1".into(),
            name: "finish".into(),
            result: "done".into(),
        }]);
        memory
    }

    #[test]
    fn test_continue_on_first_step() {
        let memory = ConversationMemory::new();
        assert!(should_continue_steps(&memory, &[], &[GenerationState::new(0)]));
    }

    #[test]
    fn test_stop_function_halts_after_tool_turn() {
        let memory = function_memory();
        let mut state = GenerationState::new(0);
        state.functions_executed.insert("finish".into());

        let stop = vec!["Finish".to_string()];
        assert!(!should_continue_steps(&memory, &stop, std::slice::from_ref(&state)));
        assert!(should_continue_steps(&memory, &[], std::slice::from_ref(&state)));
    }

    #[test]
    fn test_text_answer_ends_loop() {
        let mut memory = ConversationMemory::new();
        memory.add_request(vec![ChatMessage::user("q")]);
        memory.add_results(&[ChatResult::content(0, "Answer: 1")]);
        assert!(!should_continue_steps(&memory, &[], &[GenerationState::new(0)]));

        memory.add_request(vec![ChatMessage::user("Answer: try again")]);
        memory.add_tag(TAG_PROCESSOR);
        assert!(should_continue_steps(&memory, &[], &[GenerationState::new(0)]));
    }

    #[test]
    fn test_candidates_advance_in_lockstep() {
        let memory = function_memory();
        let mut stopped = GenerationState::new(1);
        stopped.functions_executed.insert("finish".into());
        let states = [GenerationState::new(0), stopped];
        assert!(!should_continue_steps(&memory, &["finish".to_string()], &states));
    }

    #[test]
    fn test_config_builders() {
        let config = GenerateConfig::default()
            .with_max_steps(3)
            .with_stop_function("done")
            .with_thought_field_name("reasoning");
        assert_eq!(config.max_steps, 3);
        assert_eq!(config.max_retries, 10);
        assert_eq!(config.stop_functions, vec!["done".to_string()]);
        assert_eq!(ForwardOptions::default().sample_count, 1);
    }
}
