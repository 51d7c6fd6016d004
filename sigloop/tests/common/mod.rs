//! Scripted AI service shared by the integration tests.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::Mutex;

use async_trait::async_trait;
use futures::{future, stream};
use serde_json::{json, Value};
use sigloop::ai::{
    AiService, ChatOutput, ChatRequest, ChatResponse, ChatResult, FunctionCall, ModelInfo,
    ServiceFeatures,
};
use sigloop::errors::ServiceError;
use sigloop::signature::{Field, FieldKind, Signature, Values};

/// One scripted reply.
pub enum Reply {
    /// A complete response.
    Response(ChatResponse),
    /// A stream made of these fragments.
    Stream(Vec<Result<ChatResponse, ServiceError>>),
    /// A failed call.
    Fail(ServiceError),
    /// A call that never completes.
    Hang,
}

impl Reply {
    pub fn text(content: &str) -> Self {
        Self::Response(ChatResponse::new(vec![ChatResult::content(0, content)]))
    }

    pub fn call(id: &str, name: &str, params: Value) -> Self {
        Self::Response(ChatResponse::new(vec![ChatResult {
            index: 0,
            function_calls: vec![FunctionCall::new(id, name, params)],
            ..ChatResult::default()
        }]))
    }

    pub fn chunks(chunks: &[&str]) -> Self {
        Self::Stream(
            chunks
                .iter()
                .map(|c| Ok(ChatResponse::new(vec![ChatResult::content(0, *c)])))
                .collect(),
        )
    }
}

/// Replays scripted replies in order and records every request.
pub struct MockAi {
    replies: Mutex<VecDeque<Reply>>,
    requests: Mutex<Vec<ChatRequest>>,
    models: Vec<ModelInfo>,
    features: ServiceFeatures,
}

impl MockAi {
    pub fn new(replies: Vec<Reply>) -> Self {
        Self {
            replies: Mutex::new(replies.into()),
            requests: Mutex::new(Vec::new()),
            models: Vec::new(),
            features: ServiceFeatures::default(),
        }
    }

    pub fn with_models(mut self, models: Vec<ModelInfo>) -> Self {
        self.models = models;
        self
    }

    pub fn with_features(mut self, features: ServiceFeatures) -> Self {
        self.features = features;
        self
    }

    pub fn calls(&self) -> usize {
        self.requests.lock().unwrap().len()
    }

    pub fn requests(&self) -> Vec<ChatRequest> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl AiService for MockAi {
    fn name(&self) -> &str {
        "mock"
    }

    fn features(&self) -> ServiceFeatures {
        self.features
    }

    fn models(&self) -> Vec<ModelInfo> {
        self.models.clone()
    }

    async fn chat(&self, request: ChatRequest) -> Result<ChatOutput, ServiceError> {
        self.requests.lock().unwrap().push(request);
        let reply = self
            .replies
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Reply::Fail(ServiceError::Other("script exhausted".into())));
        match reply {
            Reply::Response(response) => Ok(ChatOutput::Response(response)),
            Reply::Stream(fragments) => Ok(ChatOutput::Stream(Box::pin(stream::iter(fragments)))),
            Reply::Fail(err) => Err(err),
            Reply::Hang => future::pending().await,
        }
    }
}

/// `question -> answer` with an internal reasoning field.
pub fn qa_signature() -> Signature {
    Signature::builder()
        .description("Answer the question.")
        .input(Field::new("question"))
        .output(Field::new("reasoning").internal().optional())
        .output(Field::new("answer"))
        .build()
        .unwrap()
}

/// `question -> answer, score:number`.
pub fn scored_signature() -> Signature {
    Signature::builder()
        .input(Field::new("question"))
        .output(Field::new("answer"))
        .output(Field::new("score").kind(FieldKind::Number))
        .build()
        .unwrap()
}

pub fn question(text: &str) -> Values {
    let mut inputs = Values::new();
    inputs.insert("question".into(), json!(text));
    inputs
}
