//! Tool functions: definitions, fragment merging, argument validation and
//! concurrent dispatch.

use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::join_all;
use jsonschema::Validator;
use schemars::{schema_for, JsonSchema};
use serde::de::DeserializeOwned;
use serde_json::{json, Value};
use tracing::{debug, info};
use uuid::Uuid;

use crate::ai::{FunctionCall, FunctionParams, FunctionSpec};
use crate::errors::FunctionError;
use crate::memory::FunctionResult;
use crate::step::StepContext;

/// A callable tool.
///
/// Implementations receive the decoded, schema-checked arguments and the
/// active [`StepContext`], through which they may stop the loop or queue
/// overrides for the next step.
#[async_trait]
pub trait ToolFunction: Send + Sync {
    /// Runs the tool.
    async fn call(&self, args: Value, ctx: &StepContext) -> anyhow::Result<Value>;
}

struct SyncTool<F>(F);

#[async_trait]
impl<F> ToolFunction for SyncTool<F>
where
    F: Fn(Value, &StepContext) -> anyhow::Result<Value> + Send + Sync,
{
    async fn call(&self, args: Value, ctx: &StepContext) -> anyhow::Result<Value> {
        (self.0)(args, ctx)
    }
}

struct TypedTool<A, F> {
    handler: F,
    _args: PhantomData<fn() -> A>,
}

#[async_trait]
impl<A, F> ToolFunction for TypedTool<A, F>
where
    A: DeserializeOwned + Send,
    F: Fn(A, &StepContext) -> anyhow::Result<Value> + Send + Sync,
{
    async fn call(&self, args: Value, ctx: &StepContext) -> anyhow::Result<Value> {
        let decoded: A = serde_json::from_value(args)?;
        (self.handler)(decoded, ctx)
    }
}

/// A registered tool: name, description, argument schema and handler.
#[derive(Clone)]
pub struct FunctionDef {
    /// Name the model calls.
    pub name: String,
    /// What the tool does.
    pub description: String,
    /// JSON schema of the arguments.
    pub parameters: Value,
    handler: Arc<dyn ToolFunction>,
}

impl fmt::Debug for FunctionDef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FunctionDef")
            .field("name", &self.name)
            .field("description", &self.description)
            .field("parameters", &self.parameters)
            .finish_non_exhaustive()
    }
}

impl FunctionDef {
    /// Wraps a [`ToolFunction`] implementation.
    #[must_use]
    pub fn new(
        name: impl Into<String>,
        description: impl Into<String>,
        parameters: Value,
        handler: impl ToolFunction + 'static,
    ) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            parameters,
            handler: Arc::new(handler),
        }
    }

    /// Wraps a synchronous closure.
    #[must_use]
    pub fn from_fn<F>(
        name: impl Into<String>,
        description: impl Into<String>,
        parameters: Value,
        handler: F,
    ) -> Self
    where
        F: Fn(Value, &StepContext) -> anyhow::Result<Value> + Send + Sync + 'static,
    {
        Self::new(name, description, parameters, SyncTool(handler))
    }

    /// Wraps a closure over typed arguments; the schema is derived from `A`.
    ///
    /// ```
    /// use schemars::JsonSchema;
    /// use serde::Deserialize;
    /// use serde_json::json;
    /// use sigloop::functions::FunctionDef;
    ///
    /// #[derive(Deserialize, JsonSchema)]
    /// struct Lookup {
    ///     city: String,
    /// }
    ///
    /// let def = FunctionDef::typed("weather", "Current weather", |args: Lookup, _ctx| {
    ///     Ok(json!(format!("Sunny in {}", args.city)))
    /// });
    /// assert_eq!(def.parameters["properties"]["city"]["type"], "string");
    /// ```
    #[must_use]
    pub fn typed<A, F>(name: impl Into<String>, description: impl Into<String>, handler: F) -> Self
    where
        A: JsonSchema + DeserializeOwned + Send + 'static,
        F: Fn(A, &StepContext) -> anyhow::Result<Value> + Send + Sync + 'static,
    {
        let parameters = json!(schema_for!(A));
        Self::new(
            name,
            description,
            parameters,
            TypedTool {
                handler,
                _args: PhantomData,
            },
        )
    }

    /// The definition offered to the model.
    #[must_use]
    pub fn spec(&self) -> FunctionSpec {
        FunctionSpec {
            name: self.name.clone(),
            description: self.description.clone(),
            parameters: self.parameters.clone(),
        }
    }
}

/// Merges streamed tool-call fragments into `acc`.
///
/// Fragments with a known id extend that call; fragments without an id
/// continue the most recent call. Text arguments are concatenated, object
/// arguments replace what was there.
pub fn merge_function_calls(acc: &mut Vec<FunctionCall>, fragments: &[FunctionCall]) {
    for fragment in fragments {
        let existing = if fragment.id.is_empty() {
            acc.last_mut()
        } else {
            acc.iter_mut().find(|c| c.id == fragment.id)
        };

        let Some(call) = existing else {
            acc.push(fragment.clone());
            continue;
        };

        if !fragment.name.is_empty() && call.name.is_empty() {
            call.name.clone_from(&fragment.name);
        }
        match (&mut call.params, &fragment.params) {
            (FunctionParams::Text(current), FunctionParams::Text(more)) => current.push_str(more),
            (params, FunctionParams::Object(object)) => {
                *params = FunctionParams::Object(object.clone());
            }
            (params @ FunctionParams::Object(_), FunctionParams::Text(text)) => {
                if !text.is_empty() {
                    *params = FunctionParams::Text(text.clone());
                }
            }
        }
    }
}

/// Collects all schema violations of `instance`, one line per error.
fn collect_validation_errors(schema: &Value, instance: &Value) -> Vec<String> {
    match Validator::new(schema) {
        Ok(validator) => validator
            .iter_errors(instance)
            .map(|error| format!("At path '{}': {}", error.instance_path, error))
            .collect(),
        Err(e) => vec![format!("Schema compilation error: {e}")],
    }
}

struct ParsedCall<'a> {
    id: String,
    def: &'a FunctionDef,
    args: Value,
}

fn parse_call<'a>(
    functions: &'a [FunctionDef],
    call: &FunctionCall,
) -> Result<ParsedCall<'a>, FunctionError> {
    let def = functions
        .iter()
        .find(|f| f.name == call.name)
        .ok_or_else(|| FunctionError::NotFound {
            name: call.name.clone(),
        })?;

    let (args, raw) = match &call.params {
        FunctionParams::Object(value) => (value.clone(), value.to_string()),
        FunctionParams::Text(text) if text.trim().is_empty() => (json!({}), text.clone()),
        FunctionParams::Text(text) => {
            let value = serde_json::from_str(text).map_err(|e| FunctionError::InvalidArguments {
                name: call.name.clone(),
                errors: vec![format!("Arguments are not valid JSON: {e}")],
                arguments: text.clone(),
            })?;
            (value, text.clone())
        }
    };

    if !def.parameters.is_null() {
        let errors = collect_validation_errors(&def.parameters, &args);
        if !errors.is_empty() {
            return Err(FunctionError::InvalidArguments {
                name: call.name.clone(),
                errors,
                arguments: raw,
            });
        }
    }

    let id = if call.id.is_empty() {
        Uuid::new_v4().to_string()
    } else {
        call.id.clone()
    };
    Ok(ParsedCall { id, def, args })
}

fn render_result(value: Value) -> String {
    match value {
        Value::String(s) => s,
        other => serde_json::to_string_pretty(&other).unwrap_or_else(|_| other.to_string()),
    }
}

/// Executes the calls of candidate `index` concurrently.
///
/// All calls are checked before any runs. Results come back in the order the
/// calls were issued, regardless of completion order.
pub async fn execute_function_calls(
    functions: &[FunctionDef],
    calls: &[FunctionCall],
    ctx: &StepContext,
    index: usize,
) -> Result<Vec<FunctionResult>, FunctionError> {
    let parsed = calls
        .iter()
        .map(|call| parse_call(functions, call))
        .collect::<Result<Vec<_>, _>>()?;

    let outcomes = join_all(parsed.iter().map(|call| async move {
        debug!(event = "function_started", function = %call.def.name, id = %call.id, "Calling function");
        call.def.handler.call(call.args.clone(), ctx).await
    }))
    .await;

    let mut results = Vec::with_capacity(parsed.len());
    for (call, outcome) in parsed.into_iter().zip(outcomes) {
        let value = outcome.map_err(|e| FunctionError::Execution {
            name: call.def.name.clone(),
            source: e.into(),
        })?;
        info!(event = "function_executed", function = %call.def.name, id = %call.id, index, "Function executed");
        results.push(FunctionResult {
            index,
            function_id: call.id,
            name: call.def.name.clone(),
            result: render_result(value),
        });
    }
    Ok(results)
}
