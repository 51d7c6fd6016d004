//! Common imports for sigloop usage.
//!
//! ```
//! use sigloop::prelude::*;
//! ```

// Signature model
pub use sigloop_signature::{Field, FieldKind, Signature, Values};

// Generation loop
pub use crate::generate::{
    merge_deltas, DeltaMerger, ForwardOptions, GenDelta, GenerateConfig, GenerateOutput, Generator,
};

// Extension points
pub use crate::asserts::{Assertion, FieldProcessor, StreamingAssertion};
pub use crate::functions::{FunctionDef, ToolFunction};
pub use crate::step::{SelfTuningConfig, StepContext, StepHooks};

// Service seam
pub use crate::ai::{AiService, ChatOutput, ChatRequest, ChatResponse, ChatResult, ThinkingBudget};
pub use crate::errors::{GenerateError, ServiceError};
pub use crate::retry::RetryConfig;
