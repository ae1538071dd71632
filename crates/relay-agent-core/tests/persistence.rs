mod support;

use std::sync::Arc;

use relay_agent_core::{
    Checkpointer, ControlLoop, FileCheckpointer, LoopError, LoopStatus, MemoryCheckpointer, Phase,
    RunOptions, ToolDefinition, ToolFuture, ToolOutput,
};
use relay_ai::{ModelRef, Role, Turn};
use serde_json::{json, Value};

use support::{call, calls, tool_result_texts, ScriptedModel};

const SUNNY_WARNING: &str =
    "It's sunny in San Francisco, but you better look out if you're a Gemini 😈.";

fn search_tool(answer: &'static str) -> ToolDefinition {
    ToolDefinition::new(
        "search",
        "Call to surf the web.",
        json!({
            "type": "object",
            "properties": {"query": {"type": "string", "description": "The query to use in your search."}},
            "required": ["query"]
        }),
        Arc::new(move |_id: String, _args: Value| -> ToolFuture {
            Box::pin(async move { Ok(ToolOutput::text(answer)) })
        }),
    )
}

fn search_script() -> Vec<Turn> {
    vec![
        calls(vec![call("s1", "search", json!({"query": "weather in sf"}))]),
        Turn::assistant("It's sunny in San Francisco."),
    ]
}

fn shape(turns: &[Turn]) -> Vec<(Role, String)> {
    turns
        .iter()
        .map(|turn| (turn.role(), turn.text().to_string()))
        .collect()
}

#[tokio::test]
async fn thread_remembers_earlier_runs() {
    let model = ScriptedModel::new(vec![
        Turn::assistant("Hi Bob! How can I help?"),
        Turn::assistant("Yes, your name is Bob."),
    ]);
    let store = Arc::new(MemoryCheckpointer::new());
    let control = ControlLoop::builder(model.clone())
        .tool(search_tool("Cold, with a low of 13 ℃"))
        .checkpointer(store.clone())
        .build()
        .expect("loop should build");

    control
        .run(
            vec![Turn::user("Hi I'm Bob.")],
            RunOptions::thread("conversation-num-1"),
        )
        .await
        .expect("first run");
    let outcome = control
        .run(
            vec![Turn::user("Remember my name?")],
            RunOptions::thread("conversation-num-1"),
        )
        .await
        .expect("second run");

    assert_eq!(outcome.state.len(), 4);
    assert_eq!(outcome.final_text(), Some("Yes, your name is Bob."));
    let second_request = &model.requests()[1];
    assert_eq!(second_request.turns[0].text(), "Hi I'm Bob.");
    assert_eq!(second_request.turns[2].text(), "Remember my name?");

    let history = store
        .history("conversation-num-1")
        .await
        .expect("history should load");
    let steps: Vec<u64> = history.iter().map(|checkpoint| checkpoint.step).collect();
    assert_eq!(steps, vec![0, 1, 1, 2]);
    assert!(history
        .windows(2)
        .all(|pair| pair[0].step <= pair[1].step));

    let other_thread = control
        .run(vec![Turn::user("Remember my name?")], RunOptions::thread("other"))
        .await
        .expect("fresh thread");
    assert_eq!(other_thread.state.len(), 2);
}

#[tokio::test]
async fn interrupt_before_execute_pauses_until_resume() {
    let model = ScriptedModel::new(search_script());
    let control = ControlLoop::builder(model.clone())
        .tool(search_tool(SUNNY_WARNING))
        .checkpointer(Arc::new(MemoryCheckpointer::new()))
        .interrupt_before(Phase::Execute)
        .build()
        .expect("loop should build");

    let paused = control
        .run(
            vec![Turn::user("what is the weather in sf currently")],
            RunOptions::thread("3"),
        )
        .await
        .expect("run should pause");
    assert_eq!(
        paused.status,
        LoopStatus::Interrupted {
            before: Phase::Execute
        }
    );
    assert_eq!(paused.last_turn().map(Turn::role), Some(Role::Assistant));
    assert_eq!(paused.metrics.tool_execution_count, 0);

    let resumed = control.resume("3", None).await.expect("resume should finish");
    assert_eq!(resumed.status, LoopStatus::Completed);
    assert_eq!(
        tool_result_texts(resumed.state.turns()),
        vec![("s1".to_string(), SUNNY_WARNING.to_string(), false)]
    );
    assert_eq!(resumed.final_text(), Some("It's sunny in San Francisco."));
    assert_eq!(model.remaining(), 0);
}

#[tokio::test]
async fn interrupted_then_resumed_matches_uninterrupted_run() {
    let straight = ControlLoop::builder(ScriptedModel::new(search_script()))
        .tool(search_tool(SUNNY_WARNING))
        .build()
        .expect("loop should build")
        .run(vec![Turn::user("weather in sf?")], RunOptions::default())
        .await
        .expect("straight run");

    let control = ControlLoop::builder(ScriptedModel::new(search_script()))
        .tool(search_tool(SUNNY_WARNING))
        .checkpointer(Arc::new(MemoryCheckpointer::new()))
        .interrupt_before(Phase::Execute)
        .build()
        .expect("loop should build");
    control
        .run(vec![Turn::user("weather in sf?")], RunOptions::thread("t"))
        .await
        .expect("paused run");
    let resumed = control.resume("t", None).await.expect("resumed run");

    assert_eq!(shape(resumed.state.turns()), shape(straight.state.turns()));
}

#[tokio::test]
async fn resuming_unknown_thread_is_not_found() {
    let control = ControlLoop::builder(ScriptedModel::new(vec![Turn::assistant("hello")]))
        .checkpointer(Arc::new(MemoryCheckpointer::new()))
        .build()
        .expect("loop should build");

    let error = control
        .resume("missing", None)
        .await
        .expect_err("nothing to resume");
    assert!(matches!(error, LoopError::CheckpointNotFound { ref thread_id } if thread_id == "missing"));

    let started = control
        .resume_or_start("missing", vec![Turn::user("hi")], None)
        .await
        .expect("fresh start");
    assert_eq!(started.status, LoopStatus::Completed);
    assert_eq!(started.thread_id.as_deref(), Some("missing"));
}

#[tokio::test]
async fn new_input_on_paused_thread_is_rejected() {
    let control = ControlLoop::builder(ScriptedModel::new(search_script()))
        .tool(search_tool(SUNNY_WARNING))
        .checkpointer(Arc::new(MemoryCheckpointer::new()))
        .interrupt_before(Phase::Execute)
        .build()
        .expect("loop should build");
    control
        .run(vec![Turn::user("weather?")], RunOptions::thread("busy"))
        .await
        .expect("paused run");

    let error = control
        .run(vec![Turn::user("hello?")], RunOptions::thread("busy"))
        .await
        .expect_err("pending tool calls block new input");
    assert!(matches!(
        error,
        LoopError::ThreadPaused {
            next: Phase::Execute,
            ..
        }
    ));
}

#[tokio::test]
async fn interrupting_loop_requires_a_thread_id() {
    let model = ScriptedModel::new(search_script());
    let store = Arc::new(MemoryCheckpointer::new());
    let control = ControlLoop::builder(model.clone())
        .tool(search_tool(SUNNY_WARNING))
        .checkpointer(store.clone())
        .interrupt_before(Phase::Execute)
        .build()
        .expect("loop should build");

    let error = control
        .run(vec![Turn::user("weather in sf?")], RunOptions::default())
        .await
        .expect_err("a pause without a thread could never be resumed");
    assert!(matches!(error, LoopError::InvalidConfig(message) if message.contains("thread id")));
    assert!(model.requests().is_empty());
}

#[tokio::test]
async fn file_checkpoints_survive_a_new_store_instance() {
    let dir = tempfile::tempdir().expect("tempdir");
    let build = |model: ModelRef| {
        ControlLoop::builder(model)
            .tool(search_tool(SUNNY_WARNING))
            .checkpointer(Arc::new(FileCheckpointer::new(dir.path())))
            .interrupt_before(Phase::Execute)
            .build()
            .expect("loop should build")
    };

    let model: ModelRef = ScriptedModel::new(search_script());
    build(model.clone())
        .run(vec![Turn::user("weather in sf?")], RunOptions::thread("3"))
        .await
        .expect("paused run");
    assert!(dir.path().join("3.jsonl").exists());

    let resumed = build(model.clone())
        .resume("3", None)
        .await
        .expect("resume from disk");
    assert_eq!(resumed.status, LoopStatus::Completed);
    assert_eq!(resumed.state.len(), 4);

    let history = FileCheckpointer::new(dir.path())
        .history("3")
        .await
        .expect("history should load");
    let next: Vec<Phase> = history.iter().map(|checkpoint| checkpoint.next).collect();
    assert_eq!(
        next,
        vec![Phase::Consult, Phase::Execute, Phase::Consult, Phase::Terminate]
    );
}

#[tokio::test]
async fn cancelled_run_resumes_from_latest_checkpoint() {
    let handle = relay_agent_core::CancelHandle::new();
    let signal = handle.signal();
    let cancel_after_first_save = Arc::new(move |event: relay_agent_core::LoopEvent| {
        if matches!(
            event,
            relay_agent_core::LoopEvent::CheckpointSaved {
                next: Phase::Execute,
                ..
            }
        ) {
            handle.cancel();
        }
    });
    let control = ControlLoop::builder(ScriptedModel::new(search_script()))
        .tool(search_tool(SUNNY_WARNING))
        .checkpointer(Arc::new(MemoryCheckpointer::new()))
        .events(cancel_after_first_save)
        .build()
        .expect("loop should build");

    let cancelled = control
        .run(
            vec![Turn::user("weather in sf?")],
            RunOptions::thread("cancel-me").with_cancel(signal),
        )
        .await
        .expect("cancellation is not an error");
    assert_eq!(
        cancelled.status,
        LoopStatus::Cancelled {
            next: Phase::Execute
        }
    );

    let resumed = control
        .resume("cancel-me", None)
        .await
        .expect("cancelled thread stays resumable");
    assert_eq!(resumed.status, LoopStatus::Completed);
    assert_eq!(resumed.state.len(), 4);
}
