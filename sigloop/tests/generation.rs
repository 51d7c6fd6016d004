mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use common::{qa_signature, question, scored_signature, MockAi, Reply};
use serde::Deserialize;
use serde_json::json;
use sigloop::ai::{
    ChatMessage, ChatResponse, ChatResult, FunctionCall, ModelInfo, Role, ServiceFeatures,
};
use sigloop::asserts::{Assertion, FieldProcessor};
use sigloop::errors::{GenerateError, ServiceError};
use sigloop::functions::FunctionDef;
use sigloop::memory::{ConversationMemory, Memory, TAG_CORRECTION, TAG_ERROR};
use sigloop::retry::RetryConfig;
use sigloop::signature::Values;
use sigloop::step::{SelfTuningConfig, StepHooks};
use sigloop::{ForwardOptions, GenerateConfig, Generator};
use tokio_util::sync::CancellationToken;

fn options() -> ForwardOptions {
    ForwardOptions::default()
}

#[tokio::test]
async fn test_single_step_answer() {
    let ai = MockAi::new(vec![Reply::text("Reasoning: capital city\nAnswer: Paris")]);
    let output = Generator::new(qa_signature())
        .forward(&ai, &question("Capital of France?"), &options())
        .await
        .unwrap();

    assert_eq!(json!(output.candidates[0]), json!({"answer": "Paris"}));
    assert_eq!(output.steps, 1);
    assert_eq!(ai.calls(), 1);

    let request = &ai.requests()[0];
    assert!(matches!(&request.messages[0], ChatMessage::System { content } if content.contains("Answer: <string>")));
    assert!(matches!(&request.messages[1], ChatMessage::User { content } if content == "Question: Capital of France?"));
}

#[tokio::test(start_paused = true)]
async fn test_transient_status_is_retried() {
    let ai = MockAi::new(vec![
        Reply::Fail(ServiceError::status(500, "https://api.test", "boom")),
        Reply::Fail(ServiceError::status(500, "https://api.test", "boom")),
        Reply::text("Answer: ok"),
    ]);
    let generator = Generator::new(qa_signature())
        .with_config(GenerateConfig::default().with_retry(RetryConfig::default().with_max_retries(3)));

    let output = generator.forward(&ai, &question("q"), &options()).await.unwrap();
    assert_eq!(ai.calls(), 3);
    assert_eq!(output.candidates[0]["answer"], json!("ok"));
}

#[tokio::test(start_paused = true)]
async fn test_authentication_failure_is_not_retried() {
    let rejected = ServiceError::status(401, "https://api.test", "bad key");
    let ai = MockAi::new(vec![Reply::Fail(rejected.clone()), Reply::text("Answer: ok")]);

    let err = Generator::new(qa_signature())
        .forward(&ai, &question("q"), &options())
        .await
        .unwrap_err();

    assert_eq!(ai.calls(), 1);
    match err {
        GenerateError::Service { source, retries } => {
            assert_eq!(source, rejected);
            assert_eq!(retries, 0);
        }
        other => panic!("unexpected error: {other}"),
    }
}

#[tokio::test]
async fn test_tool_can_stop_the_loop() {
    let ai = MockAi::new(vec![
        Reply::call("c1", "finish", json!({})),
        Reply::text("Answer: never requested"),
    ]);
    let generator = Generator::new(qa_signature()).with_function(FunctionDef::from_fn(
        "finish",
        "End the conversation",
        json!({"type": "object"}),
        |_args, ctx| {
            let mut values = Values::new();
            values.insert("answer".into(), json!("early exit"));
            ctx.stop(values);
            Ok(json!("stopping"))
        },
    ));

    let output = generator.forward(&ai, &question("q"), &options()).await.unwrap();
    assert_eq!(ai.calls(), 1);
    assert_eq!(output.candidates[0]["answer"], json!("early exit"));
}

#[tokio::test]
async fn test_tool_results_feed_the_next_step() {
    let ai = MockAi::new(vec![
        Reply::call("c1", "lookup", json!({"topic": "france"})),
        Reply::text("Answer: Paris"),
    ]);
    let generator = Generator::new(qa_signature()).with_function(FunctionDef::from_fn(
        "lookup",
        "Look up a topic",
        json!({"type": "object", "properties": {"topic": {"type": "string"}}, "required": ["topic"]}),
        |args, _ctx| Ok(json!(format!("{} -> Paris", args["topic"].as_str().unwrap_or_default()))),
    ));

    let output = generator.forward(&ai, &question("q"), &options()).await.unwrap();
    assert_eq!(output.steps, 2);
    assert_eq!(output.candidates[0]["answer"], json!("Paris"));

    let second = &ai.requests()[1];
    assert_eq!(second.functions.len(), 1);
    assert!(matches!(
        second.messages.last(),
        Some(ChatMessage::Function { function_id, result }) if function_id == "c1" && result == "france -> Paris"
    ));
}

#[tokio::test]
async fn test_stop_function_halts_after_tool_turn() {
    let ai = MockAi::new(vec![Reply::call("c1", "done", json!({}))]);
    let generator = Generator::new(qa_signature())
        .with_config(GenerateConfig::default().with_stop_function("done"))
        .with_function(FunctionDef::from_fn("done", "Finish", json!({"type": "object"}), |_, _| {
            Ok(json!("ok"))
        }));

    let output = generator.forward(&ai, &question("q"), &options()).await.unwrap();
    assert_eq!(ai.calls(), 1);
    assert!(output.candidates[0].is_empty());
}

#[tokio::test]
async fn test_unknown_tool_is_surfaced() {
    let ai = MockAi::new(vec![Reply::call("c1", "missing", json!({}))]);
    let err = Generator::new(qa_signature())
        .forward(&ai, &question("q"), &options())
        .await
        .unwrap_err();
    assert!(matches!(err, GenerateError::Function(_)));
}

#[tokio::test]
async fn test_self_tuning_applies_on_next_step() {
    let models = vec![
        ModelInfo {
            key: "fast".into(),
            model: "small-model".into(),
            description: "Quick answers".into(),
        },
        ModelInfo {
            key: "smart".into(),
            model: "large-model".into(),
            description: "Hard problems".into(),
        },
    ];
    let ai = MockAi::new(vec![
        Reply::call("c1", "adjustGeneration", json!({"model": "smart", "thinkingBudget": "high"})),
        Reply::text("Answer: 42"),
    ])
    .with_models(models);
    let generator = Generator::new(qa_signature())
        .with_config(GenerateConfig::default().with_self_tuning(SelfTuningConfig::default()));

    let output = generator.forward(&ai, &question("q"), &options()).await.unwrap();
    assert_eq!(output.candidates[0]["answer"], json!("42"));

    let requests = ai.requests();
    assert!(requests[0].functions.iter().any(|f| f.name == "adjustGeneration"));
    assert_eq!(requests[0].model, None);
    assert_eq!(requests[1].model.as_deref(), Some("smart"));
    assert_eq!(
        requests[1].model_config.thinking_budget.map(|b| b.to_string()).as_deref(),
        Some("high")
    );
}

#[tokio::test]
async fn test_hooks_fire_around_steps() {
    let after_step = Arc::new(AtomicUsize::new(0));
    let after_tools = Arc::new(AtomicUsize::new(0));
    let hooks = StepHooks::default()
        .with_before_step(|ctx| {
            if ctx.is_first_step() {
                ctx.set_model("warmup");
            }
        })
        .with_after_step({
            let counter = Arc::clone(&after_step);
            move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
            }
        })
        .with_after_function_execution({
            let counter = Arc::clone(&after_tools);
            move |ctx| {
                assert!(ctx.functions_executed().contains("lookup"));
                counter.fetch_add(1, Ordering::SeqCst);
            }
        });

    let ai = MockAi::new(vec![
        Reply::call("c1", "lookup", json!({})),
        Reply::text("Answer: done"),
    ]);
    let generator = Generator::new(qa_signature())
        .with_hooks(hooks)
        .with_function(FunctionDef::from_fn("lookup", "Look up", json!({"type": "object"}), |_, _| {
            Ok(json!("nothing"))
        }));

    generator
        .forward(&ai, &question("q"), &options().with_model("default"))
        .await
        .unwrap();

    let requests = ai.requests();
    assert_eq!(requests[0].model.as_deref(), Some("warmup"));
    assert_eq!(requests[1].model.as_deref(), Some("default"));
    assert_eq!(after_step.load(Ordering::SeqCst), 2);
    assert_eq!(after_tools.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_usage_is_summed() {
    let mut first = ChatResponse::new(vec![ChatResult {
        index: 0,
        function_calls: vec![sigloop::ai::FunctionCall::new("c1", "noop", json!({}))],
        ..ChatResult::default()
    }]);
    first.usage = Some(sigloop::ai::TokenUsage {
        prompt_tokens: 10,
        completion_tokens: 5,
        thoughts_tokens: 0,
        total_tokens: 15,
    });
    let mut second = ChatResponse::new(vec![ChatResult::content(0, "Answer: x")]);
    second.usage = first.usage;

    let ai = MockAi::new(vec![Reply::Response(first), Reply::Response(second)]);
    let generator = Generator::new(qa_signature()).with_function(FunctionDef::from_fn(
        "noop",
        "Nothing",
        json!({"type": "object"}),
        |_, _| Ok(json!(null)),
    ));

    let output = generator.forward(&ai, &question("q"), &options()).await.unwrap();
    assert_eq!(output.usage.total_tokens, 30);
}

#[tokio::test]
async fn test_invalid_output_is_corrected() {
    let ai = MockAi::new(vec![
        Reply::text("I think it is Paris."),
        Reply::text("Answer: Paris"),
    ]);
    let mut memory = ConversationMemory::new();

    let output = Generator::new(qa_signature())
        .forward_in(&ai, &mut memory, &question("q"), &options())
        .await
        .unwrap();
    assert_eq!(output.candidates[0]["answer"], json!("Paris"));

    let retry = &ai.requests()[1];
    assert!(matches!(
        retry.messages.last(),
        Some(ChatMessage::User { content })
            if content.starts_with("Attempt 1/10") && content.contains("Required field not found: answer")
    ));

    assert!(memory
        .entries()
        .iter()
        .all(|e| !e.has_tag(TAG_CORRECTION) && !e.has_tag(TAG_ERROR)));
    assert_eq!(memory.entries().len(), 3);
}

#[tokio::test]
async fn test_memory_cleanup_can_be_disabled() {
    let ai = MockAi::new(vec![Reply::text("nothing useful"), Reply::text("Answer: ok")]);
    let mut memory = ConversationMemory::new();
    Generator::new(qa_signature())
        .with_config(GenerateConfig::default().with_disable_memory_cleanup(true))
        .forward_in(&ai, &mut memory, &question("q"), &options())
        .await
        .unwrap();

    assert!(memory.entries().iter().any(|e| e.has_tag(TAG_CORRECTION)));
    assert!(memory
        .entries()
        .iter()
        .any(|e| e.has_tag(TAG_ERROR) && e.role == Role::Assistant));
}

#[tokio::test]
async fn test_assertion_retries_are_bounded() {
    let ai = MockAi::new(vec![Reply::text("Answer: no"), Reply::text("Answer: still no")]);
    let generator = Generator::new(qa_signature())
        .with_config(GenerateConfig::default().with_max_retries(2))
        .with_assert(Assertion::new(|values| {
            (values["answer"] != json!("yes")).then(|| "Answer must be yes".to_string())
        }));

    let err = generator.forward(&ai, &question("q"), &options()).await.unwrap_err();
    assert_eq!(ai.calls(), 2);
    match err {
        GenerateError::ValidationRetriesExhausted { attempts, last } => {
            assert_eq!(attempts, 2);
            assert!(matches!(*last, GenerateError::Assertion { ref message, .. } if message == "Answer must be yes"));
        }
        other => panic!("unexpected error: {other}"),
    }
}

#[tokio::test]
async fn test_feedback_processor_continues_loop() {
    let ai = MockAi::new(vec![
        Reply::text("Answer: 12\nScore: 12"),
        Reply::text("Answer: 12\nScore: 3"),
    ]);
    let generator = Generator::new(scored_signature()).with_processor(FieldProcessor::feedback(
        "score",
        |value, _| (value.as_i64() > Some(10)).then(|| json!("Score must be at most 10")),
    ));

    let output = generator.forward(&ai, &question("q"), &options()).await.unwrap();
    assert_eq!(ai.calls(), 2);
    assert!(matches!(
        ai.requests()[1].messages.last(),
        Some(ChatMessage::User { content }) if content
            == "The field \"Score\" was processed. The field contents were transformed into the following output: Score must be at most 10"
    ));
    assert_eq!(output.candidates[0]["score"], json!(3));
}

#[tokio::test]
async fn test_max_steps_reached() {
    let ai = MockAi::new(vec![
        Reply::call("c1", "noop", json!({})),
        Reply::call("c2", "noop", json!({})),
    ]);
    let generator = Generator::new(qa_signature())
        .with_config(GenerateConfig::default().with_max_steps(2))
        .with_function(FunctionDef::from_fn("noop", "Nothing", json!({"type": "object"}), |_, _| {
            Ok(json!("ok"))
        }));

    let err = generator.forward(&ai, &question("q"), &options()).await.unwrap_err();
    assert!(matches!(err, GenerateError::MaxStepsReached { max_steps: 2 }));
    assert_eq!(ai.calls(), 2);
}

#[tokio::test]
async fn test_cancelled_before_start() {
    let ai = MockAi::new(vec![Reply::text("Answer: x")]);
    let token = CancellationToken::new();
    token.cancel();

    let err = Generator::new(qa_signature())
        .forward(&ai, &question("q"), &options().with_cancellation(token))
        .await
        .unwrap_err();
    assert!(matches!(err, GenerateError::Cancelled));
    assert_eq!(ai.calls(), 0);
}

fn cancel_after(token: &CancellationToken, delay: Duration) {
    let token = token.clone();
    tokio::spawn(async move {
        tokio::time::sleep(delay).await;
        token.cancel();
    });
}

#[tokio::test(start_paused = true)]
async fn test_cancelled_while_call_in_flight() {
    let ai = MockAi::new(vec![Reply::Hang]);
    let token = CancellationToken::new();
    cancel_after(&token, Duration::from_millis(50));

    let err = Generator::new(qa_signature())
        .forward(&ai, &question("q"), &options().with_cancellation(token))
        .await
        .unwrap_err();
    assert!(matches!(err, GenerateError::Cancelled));
    assert_eq!(ai.calls(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_cancelled_during_backoff() {
    let ai = MockAi::new(vec![
        Reply::Fail(ServiceError::status(503, "https://api.test", "busy")),
        Reply::text("Answer: too late"),
    ]);
    let token = CancellationToken::new();
    cancel_after(&token, Duration::from_millis(100));

    let err = Generator::new(qa_signature())
        .forward(&ai, &question("q"), &options().with_cancellation(token))
        .await
        .unwrap_err();
    assert!(matches!(err, GenerateError::Cancelled));
    assert_eq!(ai.calls(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_service_failure_inside_correction_attempt() {
    let ai = MockAi::new(vec![
        Reply::text("Answer: Paris"),
        Reply::Fail(ServiceError::status(500, "https://api.test", "boom")),
        Reply::text("Answer: Paris\nScore: 2"),
    ]);
    let generator =
        Generator::new(scored_signature()).with_config(GenerateConfig::default().with_max_retries(2));

    let output = generator.forward(&ai, &question("q"), &options()).await.unwrap();
    assert_eq!(ai.calls(), 3);
    assert_eq!(json!(output.candidates[0]), json!({"answer": "Paris", "score": 2}));

    let requests = ai.requests();
    assert_eq!(requests[1].messages, requests[2].messages);
    assert!(matches!(
        requests[2].messages.last(),
        Some(ChatMessage::User { content }) if content.starts_with("Attempt 1/2")
    ));
}

#[tokio::test]
async fn test_strict_mode_rejects_unknown_labels() {
    let ai = MockAi::new(vec![
        Reply::text("Answer: Paris\nNote: from memory\nScore: 3"),
        Reply::text("Answer: Paris\nScore: 3"),
    ]);
    let generator =
        Generator::new(scored_signature()).with_config(GenerateConfig::default().with_strict_mode(true));

    let output = generator.forward(&ai, &question("q"), &options()).await.unwrap();
    assert_eq!(ai.calls(), 2);
    assert_eq!(json!(output.candidates[0]), json!({"answer": "Paris", "score": 3}));
    assert!(matches!(
        ai.requests()[1].messages.last(),
        Some(ChatMessage::User { content }) if content.contains("Unexpected field label 'Note'")
    ));
}

#[tokio::test]
async fn test_reasoning_before_tool_call_is_not_an_error() {
    let reasoning_then_call = Reply::Stream(vec![
        Ok(ChatResponse::new(vec![ChatResult::content(0, "Score: 5\n")])),
        Ok(ChatResponse::new(vec![ChatResult {
            index: 0,
            function_calls: vec![FunctionCall::new("c1", "lookup", json!({"topic": "france"}))],
            ..ChatResult::default()
        }])),
    ]);
    let ai = MockAi::new(vec![reasoning_then_call, Reply::chunks(&["Answer: Paris\n", "Score: 5"])])
        .with_features(ServiceFeatures {
            function_cot: true,
            ..ServiceFeatures::default()
        });

    let runs = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&runs);
    let generator = Generator::new(scored_signature()).with_function(FunctionDef::from_fn(
        "lookup",
        "Look up a topic",
        json!({"type": "object", "properties": {"topic": {"type": "string"}}}),
        move |_args, _ctx| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(json!("Paris"))
        },
    ));

    let output = generator
        .forward(&ai, &question("q"), &options().with_stream(true))
        .await
        .unwrap();
    assert_eq!(runs.load(Ordering::SeqCst), 1);
    assert_eq!(ai.calls(), 2);
    assert_eq!(json!(output.candidates[0]), json!({"answer": "Paris", "score": 5}));
    assert!(matches!(
        ai.requests()[1].messages.last(),
        Some(ChatMessage::Function { function_id, .. }) if function_id == "c1"
    ));
}

#[tokio::test]
async fn test_missing_input_is_rejected() {
    let ai = MockAi::new(vec![]);
    let err = Generator::new(qa_signature())
        .forward(&ai, &Values::new(), &options())
        .await
        .unwrap_err();
    assert!(matches!(err, GenerateError::InvalidInput(_)));
    assert_eq!(ai.calls(), 0);
}

#[tokio::test]
async fn test_multiple_candidates() {
    let ai = MockAi::new(vec![Reply::Response(ChatResponse::new(vec![
        ChatResult::content(0, "Answer: a"),
        ChatResult::content(1, "Answer: b"),
    ]))]);
    let output = Generator::new(qa_signature())
        .forward(&ai, &question("q"), &options().with_sample_count(2))
        .await
        .unwrap();

    assert_eq!(output.candidates.len(), 2);
    assert_eq!(output.candidates[1]["answer"], json!("b"));
    assert_eq!(ai.requests()[0].model_config.n, Some(2));
}

#[derive(Debug, Deserialize)]
struct Scored {
    answer: String,
    score: f64,
}

#[tokio::test]
async fn test_forward_typed() {
    let ai = MockAi::new(vec![Reply::text("Answer: fine\nScore: 0.5")]);
    let scored: Scored = Generator::new(scored_signature())
        .forward_typed(&ai, &question("q"), &options())
        .await
        .unwrap();
    assert_eq!(scored.answer, "fine");
    assert!((scored.score - 0.5).abs() < f64::EPSILON);
}
