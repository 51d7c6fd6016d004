//! # sigloop
//!
//! Agentic generation over typed signatures.
//!
//! A [`Generator`] asks an [`AiService`] for label-delimited answers, extracts
//! typed values from them (batch or streaming), executes tool calls, runs
//! assertions and field processors, and keeps stepping until the model
//! produces a final answer. Service failures are retried with backoff;
//! invalid output is re-prompted with corrective feedback.
//!
//! ## Example
//!
//! ```no_run
//! # use sigloop::prelude::*;
//! # use serde_json::json;
//! # async fn example(ai: &dyn AiService) -> Result<(), Box<dyn std::error::Error>> {
//! let signature = Signature::builder()
//!     .input(Field::new("question"))
//!     .output(Field::new("answer"))
//!     .build()?;
//!
//! let generator = Generator::new(signature).with_function(FunctionDef::from_fn(
//!     "lookup",
//!     "Look up a fact",
//!     json!({"type": "object", "properties": {"topic": {"type": "string"}}}),
//!     |args, _ctx| Ok(json!(format!("Nothing known about {}", args["topic"]))),
//! ));
//!
//! let mut inputs = Values::new();
//! inputs.insert("question".into(), json!("What is the capital of France?"));
//! let output = generator.forward(ai, &inputs, &ForwardOptions::default()).await?;
//! println!("{:?}", output.values());
//! # Ok(())
//! # }
//! ```

#![deny(missing_docs)]

/// AI-service seam: requests, responses and the service trait.
pub mod ai;

/// Caller-registered assertions and field processors.
pub mod asserts;

/// Public error types.
pub mod errors;

/// Tool definitions and dispatch.
pub mod functions;

/// The generation loop.
pub mod generate;

/// Conversation memory.
pub mod memory;

/// Per-turn response processing.
pub mod processor;

/// Prompt rendering and input validation.
pub mod prompt;

/// Infrastructure and validation retries.
pub mod retry;

/// Step context, hooks and self-tuning.
pub mod step;

/// Logging bootstrap.
pub mod telemetry;

/// Commonly used types and traits.
pub mod prelude;

pub use ai::{AiService, ChatMessage, ChatOutput, ChatRequest, ChatResponse, ChatResult, Role};
pub use errors::{FunctionError, GenerateError, ServiceError};
pub use generate::{
    merge_deltas, should_continue_steps, DeltaMerger, ForwardOptions, GenDelta, GenerateConfig,
    GenerateOutput, Generator,
};
pub use sigloop_signature as signature;
