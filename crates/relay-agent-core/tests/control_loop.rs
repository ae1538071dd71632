mod support;

use relay_agent_core::{
    CancelHandle, ControlLoop, LoopError, LoopEvent, LoopStatus, MemoryCheckpointer, Phase,
    RunOptions,
};
use relay_ai::{RelayError, RelayErrorCode, Role, Turn};
use serde_json::json;
use std::sync::Arc;

use support::{
    call, calls, coolest_cities_tool, recording_sink, sleepy_echo_tool, tool_result_texts,
    weather_tool, ScriptedModel,
};

#[tokio::test]
async fn weather_question_runs_tool_then_answers() {
    let model = ScriptedModel::new(vec![
        calls(vec![call("call-1", "get_weather", json!({"location": "San Francisco"}))]),
        Turn::assistant("It's 60 degrees and foggy in San Francisco."),
    ]);
    let control = ControlLoop::builder(model.clone())
        .tools([weather_tool(), coolest_cities_tool()])
        .build()
        .expect("loop should build");

    let outcome = control
        .run(vec![Turn::user("what is the weather in sf?")], RunOptions::default())
        .await
        .expect("run should succeed");

    assert_eq!(outcome.status, LoopStatus::Completed);
    let roles: Vec<Role> = outcome.state.turns().iter().map(Turn::role).collect();
    assert_eq!(
        roles,
        vec![Role::User, Role::Assistant, Role::ToolResult, Role::Assistant]
    );
    assert_eq!(
        tool_result_texts(outcome.state.turns()),
        vec![(
            "call-1".to_string(),
            "It's 60 degrees and foggy.".to_string(),
            false
        )]
    );
    assert_eq!(
        outcome.final_text(),
        Some("It's 60 degrees and foggy in San Francisco.")
    );
    assert_eq!(outcome.metrics.model_request_count, 2);
    assert_eq!(outcome.metrics.tool_execution_count, 1);

    let requests = model.requests();
    assert_eq!(requests[0].tools.len(), 2);
    assert_eq!(requests[1].turns.len(), 3);
}

#[tokio::test]
async fn plain_answer_terminates_without_executing() {
    let model = ScriptedModel::new(vec![Turn::assistant("hello there")]);
    let control = ControlLoop::builder(model)
        .tool(weather_tool())
        .build()
        .expect("loop should build");

    let outcome = control
        .run(vec![Turn::user("hi")], RunOptions::default())
        .await
        .expect("run should succeed");

    assert_eq!(outcome.state.len(), 2);
    assert_eq!(outcome.metrics.tool_execution_count, 0);
    assert_eq!(outcome.metrics.step_count, 1);
}

#[tokio::test]
async fn concurrent_results_keep_request_order() {
    let model = ScriptedModel::new(vec![
        calls(vec![
            call("slow", "sleepy_echo", json!({"text": "first", "delay_ms": 80})),
            call("fast", "sleepy_echo", json!({"text": "second", "delay_ms": 0})),
            call("mid", "sleepy_echo", json!({"text": "third", "delay_ms": 30})),
        ]),
        Turn::assistant("done"),
    ]);
    let control = ControlLoop::builder(model)
        .tool(sleepy_echo_tool())
        .build()
        .expect("loop should build");

    let outcome = control
        .run(vec![Turn::user("echo three")], RunOptions::default())
        .await
        .expect("run should succeed");

    let ids: Vec<String> = tool_result_texts(outcome.state.turns())
        .into_iter()
        .map(|(id, _, _)| id)
        .collect();
    assert_eq!(ids, vec!["slow", "fast", "mid"]);
    assert_eq!(outcome.metrics.tool_execution_count, 3);
}

#[tokio::test]
async fn unknown_tool_is_reported_back_to_the_model() {
    let model = ScriptedModel::new(vec![
        calls(vec![
            call("a", "get_unicorn_forecast", json!({})),
            call("b", "get_weather", json!({"location": "nyc"})),
        ]),
        Turn::assistant("Sorry, I can only report nyc: 90 and sunny."),
    ]);
    let control = ControlLoop::builder(model.clone())
        .tool(weather_tool())
        .build()
        .expect("loop should build");

    let outcome = control
        .run(vec![Turn::user("forecast?")], RunOptions::default())
        .await
        .expect("unknown tools are not fatal");

    let results = tool_result_texts(outcome.state.turns());
    assert_eq!(results.len(), 2);
    assert_eq!(results[0].0, "a");
    assert!(results[0].2);
    assert!(results[0].1.contains("get_unicorn_forecast"));
    assert_eq!(results[1].1, "It's 90 degrees and sunny.");
    assert!(!results[1].2);

    let second_request = &model.requests()[1];
    assert!(second_request
        .turns
        .iter()
        .any(|turn| matches!(turn, Turn::ToolResult { is_error: true, .. })));
}

#[tokio::test]
async fn invalid_arguments_become_error_result() {
    let model = ScriptedModel::new(vec![
        calls(vec![call("a", "get_weather", json!({"city": "sf"}))]),
        Turn::assistant("let me retry"),
    ]);
    let control = ControlLoop::builder(model)
        .tool(weather_tool())
        .build()
        .expect("loop should build");

    let outcome = control
        .run(vec![Turn::user("weather?")], RunOptions::default())
        .await
        .expect("invalid arguments are not fatal");

    let Some(Turn::ToolResult {
        is_error, details, ..
    }) = outcome.state.turns().get(2)
    else {
        panic!("expected tool result at index 2");
    };
    assert!(*is_error);
    assert_eq!(
        details.as_ref().expect("error details")["error"]["code"],
        json!("tool_arguments_invalid")
    );
}

#[tokio::test]
async fn recursion_limit_stops_endless_tool_requests() {
    let replies = (0..10)
        .map(|index| {
            calls(vec![call(
                &format!("c{index}"),
                "get_coolest_cities",
                json!({}),
            )])
        })
        .collect();
    let model = ScriptedModel::new(replies);
    let control = ControlLoop::builder(model)
        .tool(coolest_cities_tool())
        .recursion_limit(4)
        .build()
        .expect("loop should build");

    let error = control
        .run(vec![Turn::user("loop forever")], RunOptions::default())
        .await
        .expect_err("limit should be hit");
    assert!(matches!(error, LoopError::RecursionLimit { limit: 4 }));
}

#[tokio::test]
async fn upstream_failure_is_fatal_and_retryable() {
    let model = ScriptedModel::with_results(vec![Err(RelayError::new(
        RelayErrorCode::RateLimited,
        "OpenAI HTTP 429: slow down",
    ))]);
    let control = ControlLoop::builder(model)
        .build()
        .expect("loop should build");

    let error = control
        .run(vec![Turn::user("hi")], RunOptions::default())
        .await
        .expect_err("rate limit should surface");
    assert!(error.is_retryable());
    assert!(matches!(error, LoopError::Collaborator(ref inner) if inner.code == RelayErrorCode::RateLimited));
}

#[tokio::test]
async fn model_answering_with_user_turn_is_protocol_violation() {
    let model = ScriptedModel::new(vec![Turn::user("I am not an assistant")]);
    let control = ControlLoop::builder(model)
        .build()
        .expect("loop should build");

    let error = control
        .run(vec![Turn::user("hi")], RunOptions::default())
        .await
        .expect_err("user turn from model is a wiring bug");
    assert!(matches!(error, LoopError::ProtocolViolation(_)));
    assert!(!error.is_retryable());
}

#[tokio::test]
async fn cancellation_stops_at_step_boundary() {
    let model = ScriptedModel::new(vec![
        calls(vec![call("a", "get_weather", json!({"location": "sf"}))]),
        Turn::assistant("never requested"),
    ]);
    let handle = CancelHandle::new();
    let signal = handle.signal();
    let cancel_after_first_turn = Arc::new(move |event: LoopEvent| {
        if matches!(event, LoopEvent::TurnAppended { turn: Turn::Assistant { .. } }) {
            handle.cancel();
        }
    });
    let control = ControlLoop::builder(model.clone())
        .tool(weather_tool())
        .events(cancel_after_first_turn)
        .build()
        .expect("loop should build");

    let outcome = control
        .run(
            vec![Turn::user("weather?")],
            RunOptions::default().with_cancel(signal),
        )
        .await
        .expect("cancellation is not an error");

    assert_eq!(
        outcome.status,
        LoopStatus::Cancelled {
            next: Phase::Execute
        }
    );
    assert_eq!(outcome.state.len(), 2);
    assert_eq!(model.remaining(), 1);
}

#[tokio::test]
async fn events_trace_steps_and_tool_executions() {
    let model = ScriptedModel::new(vec![
        calls(vec![call("a", "get_weather", json!({"location": "sf"}))]),
        Turn::assistant("foggy"),
    ]);
    let (sink, events) = recording_sink();
    let control = ControlLoop::builder(model)
        .tool(weather_tool())
        .events(sink)
        .build()
        .expect("loop should build");

    control
        .run(vec![Turn::user("weather?")], RunOptions::default())
        .await
        .expect("run should succeed");

    let events = events.lock().expect("events lock");
    let steps: Vec<Phase> = events
        .iter()
        .filter_map(|event| match event {
            LoopEvent::StepStart { phase, .. } => Some(*phase),
            _ => None,
        })
        .collect();
    assert_eq!(steps, vec![Phase::Consult, Phase::Execute, Phase::Consult]);
    assert!(matches!(events.first(), Some(LoopEvent::LoopStart { resumed: false, .. })));
    assert!(matches!(
        events.last(),
        Some(LoopEvent::LoopEnd {
            status: LoopStatus::Completed,
            ..
        })
    ));
    assert!(events.iter().any(|event| matches!(
        event,
        LoopEvent::ToolExecutionEnd { tool_name, is_error: false, .. } if tool_name == "get_weather"
    )));
}

#[tokio::test]
async fn builder_rejects_inconsistent_configuration() {
    let duplicate = ControlLoop::builder(ScriptedModel::new(vec![]))
        .tools([weather_tool(), weather_tool()])
        .build();
    assert!(matches!(duplicate, Err(LoopError::InvalidConfig(_))));

    let interrupt_without_store = ControlLoop::builder(ScriptedModel::new(vec![]))
        .interrupt_before(Phase::Execute)
        .build();
    assert!(matches!(
        interrupt_without_store,
        Err(LoopError::InvalidConfig(_))
    ));

    let grade_in_tool_loop = ControlLoop::builder(ScriptedModel::new(vec![]))
        .checkpointer(Arc::new(MemoryCheckpointer::new()))
        .interrupt_before(Phase::Grade)
        .build();
    assert!(matches!(grade_in_tool_loop, Err(LoopError::InvalidConfig(_))));
}

#[tokio::test]
async fn thread_ids_need_a_checkpointer_and_input() {
    let control = ControlLoop::builder(ScriptedModel::new(vec![]))
        .build()
        .expect("loop should build");
    let error = control
        .run(vec![Turn::user("hi")], RunOptions::thread("t-1"))
        .await
        .expect_err("no checkpointer configured");
    assert!(matches!(error, LoopError::InvalidConfig(_)));

    let error = control
        .run(vec![], RunOptions::default())
        .await
        .expect_err("nothing to run");
    assert!(matches!(error, LoopError::EmptyConversation));
}
