//! Per-step context handed to hooks and tool functions, the hook set, and
//! the self-tuning tool.

use std::collections::BTreeSet;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde_json::{json, Map, Value};
use tracing::info;

use crate::ai::{FunctionCall, ModelInfo, ThinkingBudget, TokenUsage};
use crate::functions::FunctionDef;
use sigloop_signature::Values;

/// Name of the synthetic self-tuning tool.
pub const ADJUST_GENERATION: &str = "adjustGeneration";

/// Overrides queued for the next AI-service call.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PendingOptions {
    /// Model name or key.
    pub model: Option<String>,
    /// Reasoning effort.
    pub thinking_budget: Option<ThinkingBudget>,
    /// Sampling temperature.
    pub temperature: Option<f32>,
    /// Output token limit.
    pub max_tokens: Option<u32>,
}

impl PendingOptions {
    /// Whether nothing is queued.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.model.is_none()
            && self.thinking_budget.is_none()
            && self.temperature.is_none()
            && self.max_tokens.is_none()
    }
}

#[derive(Debug, Default)]
struct StepState {
    step_index: usize,
    pending: PendingOptions,
    usage: TokenUsage,
    stop: Option<Values>,
    functions_executed: BTreeSet<String>,
    last_function_calls: Vec<FunctionCall>,
}

/// Narrow, shared view of the running loop.
///
/// Hooks and tools receive `&StepContext`; they can read progress and queue
/// changes for the next call but never touch loop state directly.
#[derive(Debug, Default)]
pub struct StepContext {
    max_steps: usize,
    state: Mutex<StepState>,
}

impl StepContext {
    /// Creates a context for a loop of at most `max_steps` steps.
    #[must_use]
    pub fn new(max_steps: usize) -> Self {
        Self {
            max_steps,
            state: Mutex::default(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, StepState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Zero-based index of the current step.
    #[must_use]
    pub fn step_index(&self) -> usize {
        self.lock().step_index
    }

    /// Whether this is the first step.
    #[must_use]
    pub fn is_first_step(&self) -> bool {
        self.step_index() == 0
    }

    /// Configured step limit.
    #[must_use]
    pub const fn max_steps(&self) -> usize {
        self.max_steps
    }

    /// Token usage summed over all calls so far.
    #[must_use]
    pub fn usage(&self) -> TokenUsage {
        self.lock().usage
    }

    /// Uses `model` for the next call only.
    pub fn set_model(&self, model: impl Into<String>) {
        self.lock().pending.model = Some(model.into());
    }

    /// Uses `budget` for the next call only.
    pub fn set_thinking_budget(&self, budget: ThinkingBudget) {
        self.lock().pending.thinking_budget = Some(budget);
    }

    /// Uses `temperature` for the next call only.
    pub fn set_temperature(&self, temperature: f32) {
        self.lock().pending.temperature = Some(temperature);
    }

    /// Uses `max_tokens` for the next call only.
    pub fn set_max_tokens(&self, max_tokens: u32) {
        self.lock().pending.max_tokens = Some(max_tokens);
    }

    /// Ends the loop after the current step, returning `values` merged over
    /// whatever has been extracted so far.
    pub fn stop(&self, values: Values) {
        info!(
            event = "stop_requested",
            fields = values.len(),
            "Loop stop requested"
        );
        let mut state = self.lock();
        match &mut state.stop {
            Some(existing) => existing.extend(values),
            None => state.stop = Some(values),
        }
    }

    /// Whether [`StepContext::stop`] has been called.
    #[must_use]
    pub fn is_stopped(&self) -> bool {
        self.lock().stop.is_some()
    }

    /// Names of tools executed during the current step.
    #[must_use]
    pub fn functions_executed(&self) -> BTreeSet<String> {
        self.lock().functions_executed.clone()
    }

    /// Tool calls dispatched during the current step.
    #[must_use]
    pub fn last_function_calls(&self) -> Vec<FunctionCall> {
        self.lock().last_function_calls.clone()
    }

    /// Queued overrides, without consuming them.
    #[must_use]
    pub fn pending(&self) -> PendingOptions {
        self.lock().pending.clone()
    }

    pub(crate) fn begin_step(&self, step_index: usize) {
        let mut state = self.lock();
        state.step_index = step_index;
        state.functions_executed.clear();
        state.last_function_calls.clear();
    }

    pub(crate) fn take_pending(&self) -> PendingOptions {
        std::mem::take(&mut self.lock().pending)
    }

    pub(crate) fn add_usage(&self, usage: TokenUsage) {
        self.lock().usage += usage;
    }

    pub(crate) fn record_calls(&self, calls: &[FunctionCall]) {
        let mut state = self.lock();
        state
            .functions_executed
            .extend(calls.iter().map(|c| c.name.clone()));
        state.last_function_calls.extend_from_slice(calls);
    }

    pub(crate) fn take_stop(&self) -> Option<Values> {
        self.lock().stop.take()
    }
}

/// A hook invoked at a fixed point of the loop.
pub type StepHook = Arc<dyn Fn(&StepContext) + Send + Sync>;

/// Hooks fired around each step.
#[derive(Clone, Default)]
pub struct StepHooks {
    /// Before the step's AI-service call; overrides set here apply to it.
    pub before_step: Option<StepHook>,
    /// After the step completes.
    pub after_step: Option<StepHook>,
    /// After a step that executed at least one tool.
    pub after_function_execution: Option<StepHook>,
}

impl fmt::Debug for StepHooks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StepHooks")
            .field("before_step", &self.before_step.is_some())
            .field("after_step", &self.after_step.is_some())
            .field(
                "after_function_execution",
                &self.after_function_execution.is_some(),
            )
            .finish()
    }
}

impl StepHooks {
    /// Sets the before-step hook.
    #[must_use]
    pub fn with_before_step(mut self, hook: impl Fn(&StepContext) + Send + Sync + 'static) -> Self {
        self.before_step = Some(Arc::new(hook));
        self
    }

    /// Sets the after-step hook.
    #[must_use]
    pub fn with_after_step(mut self, hook: impl Fn(&StepContext) + Send + Sync + 'static) -> Self {
        self.after_step = Some(Arc::new(hook));
        self
    }

    /// Sets the after-function-execution hook.
    #[must_use]
    pub fn with_after_function_execution(
        mut self,
        hook: impl Fn(&StepContext) + Send + Sync + 'static,
    ) -> Self {
        self.after_function_execution = Some(Arc::new(hook));
        self
    }

    pub(crate) fn fire(hook: Option<&StepHook>, ctx: &StepContext) {
        if let Some(hook) = hook {
            hook(ctx);
        }
    }
}

/// Which knobs the self-tuning tool exposes to the model.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SelfTuningConfig {
    /// Allow switching between the service's models.
    pub model: bool,
    /// Allow changing the thinking budget.
    pub thinking_budget: bool,
    /// Allow changing the temperature.
    pub temperature: bool,
}

impl Default for SelfTuningConfig {
    fn default() -> Self {
        Self {
            model: true,
            thinking_budget: true,
            temperature: false,
        }
    }
}

impl SelfTuningConfig {
    /// Enables or disables temperature tuning.
    #[must_use]
    pub const fn with_temperature(mut self, enabled: bool) -> Self {
        self.temperature = enabled;
        self
    }

    /// Enables or disables model switching.
    #[must_use]
    pub const fn with_model(mut self, enabled: bool) -> Self {
        self.model = enabled;
        self
    }

    /// Enables or disables thinking budget tuning.
    #[must_use]
    pub const fn with_thinking_budget(mut self, enabled: bool) -> Self {
        self.thinking_budget = enabled;
        self
    }
}

/// Builds the `adjustGeneration` tool.
///
/// Calling it queues the requested settings on the [`StepContext`], so they
/// take effect on the next step's call exactly like a hook calling the setters.
#[must_use]
pub fn self_tuning_function(config: SelfTuningConfig, models: &[ModelInfo]) -> FunctionDef {
    let mut properties = Map::new();
    let mut description = String::from("Adjust generation settings for the next step.");

    if config.model && !models.is_empty() {
        let keys: Vec<&str> = models.iter().map(|m| m.key.as_str()).collect();
        properties.insert("model".into(), json!({"type": "string", "enum": keys}));
        description.push_str(" Available models:");
        for model in models {
            description.push_str(&format!("\n- {}: {}", model.key, model.description));
        }
    }
    if config.thinking_budget {
        let levels: Vec<&str> = ThinkingBudget::ALL.iter().map(|l| l.as_str()).collect();
        properties.insert(
            "thinkingBudget".into(),
            json!({"type": "string", "enum": levels, "description": "Reasoning effort for the next step"}),
        );
    }
    if config.temperature {
        properties.insert(
            "temperature".into(),
            json!({"type": "number", "minimum": 0, "maximum": 2, "description": "Sampling temperature"}),
        );
    }

    let parameters = json!({
        "type": "object",
        "properties": Value::Object(properties),
        "additionalProperties": false,
    });

    FunctionDef::from_fn(ADJUST_GENERATION, description, parameters, |args, ctx| {
        let mut applied = Vec::new();
        if let Some(model) = args.get("model").and_then(Value::as_str) {
            ctx.set_model(model);
            applied.push(format!("model={model}"));
        }
        if let Some(level) = args.get("thinkingBudget").and_then(Value::as_str) {
            let budget: ThinkingBudget = level.parse().map_err(anyhow::Error::msg)?;
            ctx.set_thinking_budget(budget);
            applied.push(format!("thinkingBudget={budget}"));
        }
        if let Some(temperature) = args.get("temperature").and_then(Value::as_f64) {
            #[allow(clippy::cast_possible_truncation)]
            let narrowed = temperature as f32;
            ctx.set_temperature(narrowed);
            applied.push(format!("temperature={temperature}"));
        }
        if applied.is_empty() {
            return Ok(Value::String("No changes requested".into()));
        }
        Ok(Value::String(format!(
            "Applied for the next step: {}",
            applied.join(", ")
        )))
    })
}
