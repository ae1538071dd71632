use std::future::Future;
use std::io::{self, BufRead, Write};
use std::path::Path;
use std::sync::Arc;

use relay_agent_core::{
    CancelHandle, ControlLoop, ControlLoopBuilder, FileCheckpointer, HandoffConfig, LoopError,
    LoopEvent, LoopEventSink, LoopOutcome, LoopStatus, MemoryCheckpointer, ModelGrader, Phase,
    RunOptions, ToolDefinition, DEFAULT_RECURSION_LIMIT,
};
use relay_ai::{ModelRef, OpenAiChatModel, Turn};
use tracing::info;

use crate::config::RelayConfig;
use crate::retriever::DocumentIndex;
use crate::tools::{
    create_bar_chart_tool, create_coolest_cities_tool, create_retriever_tool, create_search_tool,
    create_tavily_tool, create_weather_tool, APPROVAL_SEARCH_RESULT, CHAT_SEARCH_RESULT,
};

const AGENT_RECURSION_LIMIT: usize = 100;
const TEAM_RECURSION_LIMIT: usize = 10;
const AGENT_THREAD_ID: &str = "42";
const AGENT_FOLLOW_UP: &str = "what about ny";

/// Everything one sub-command needs: the parsed file config and the shared model client.
pub struct CommandContext {
    pub config: RelayConfig,
    pub model: ModelRef,
    pub show_tool_results: bool,
}

impl CommandContext {
    pub fn new(config: RelayConfig, show_tool_results: bool) -> Result<Self, String> {
        let model = OpenAiChatModel::new(config.model_config())
            .map_err(|error| format!("create model client failed: {error}"))?;
        Ok(Self {
            config,
            model: Arc::new(model),
            show_tool_results,
        })
    }

    fn builder(&self, tools: Vec<ToolDefinition>, default_limit: usize) -> ControlLoopBuilder {
        let timeout = self.config.tool_timeout();
        let tools = tools.into_iter().map(|tool| match timeout {
            Some(timeout) => tool.with_timeout(timeout),
            None => tool,
        });
        ControlLoop::builder(self.model.clone())
            .config(self.config.loop_config(default_limit))
            .tools(tools)
            .events(console_sink(self.show_tool_results))
    }

    fn file_checkpointer(&self) -> Arc<FileCheckpointer> {
        Arc::new(FileCheckpointer::new(self.config.checkpoint_dir()))
    }
}

/// Web-search agent: answers `query`, then the follow-up, on one in-memory thread.
pub async fn run_agent(context: &CommandContext, query: &str) -> Result<(), String> {
    let search = create_tavily_tool(&context.config.search)?;
    let control = context
        .builder(vec![search], AGENT_RECURSION_LIMIT)
        .checkpointer(Arc::new(MemoryCheckpointer::new()))
        .build()
        .map_err(|error| error.to_string())?;

    for message in [query, AGENT_FOLLOW_UP] {
        print_user(message);
        let outcome = run_with_ctrl_c(&control, message, RunOptions::thread(AGENT_THREAD_ID)).await?;
        report_outcome(&outcome);
    }
    Ok(())
}

pub async fn run_tools(context: &CommandContext, query: &str) -> Result<(), String> {
    let control = context
        .builder(
            vec![create_weather_tool(), create_coolest_cities_tool()],
            DEFAULT_RECURSION_LIMIT,
        )
        .build()
        .map_err(|error| error.to_string())?;
    print_user(query);
    let outcome = run_with_ctrl_c(&control, query, RunOptions::default()).await?;
    report_outcome(&outcome);
    Ok(())
}

/// Retrieval loop over the configured document directory.
pub async fn run_rag(
    context: &CommandContext,
    question: &str,
    docs_dir: Option<&Path>,
) -> Result<(), String> {
    let retrieval = &context.config.retrieval;
    let docs_dir = docs_dir.unwrap_or(&retrieval.docs_dir);
    let index = DocumentIndex::load_dir(docs_dir, retrieval.chunk_size, retrieval.chunk_overlap)?;
    if index.is_empty() {
        return Err(format!("no documents found under {}", docs_dir.display()));
    }
    info!(
        docs_dir = %docs_dir.display(),
        chunks = index.len(),
        "document index loaded"
    );

    let retriever = create_retriever_tool(Arc::new(index), retrieval.top_k);
    let control = context
        .builder(vec![retriever], DEFAULT_RECURSION_LIMIT)
        .retrieval(Arc::new(ModelGrader::new(context.model.clone())))
        .build()
        .map_err(|error| error.to_string())?;
    print_user(question);
    let outcome = run_with_ctrl_c(&control, question, RunOptions::default()).await?;
    report_outcome(&outcome);
    Ok(())
}

/// Researcher and ChartGenerator trading turns until one of them says the sentinel.
pub async fn run_team(context: &CommandContext, task: &str) -> Result<(), String> {
    let search = create_tavily_tool(&context.config.search)?;
    let control = context
        .builder(vec![search, create_bar_chart_tool()], TEAM_RECURSION_LIMIT)
        .handoff(research_team())
        .build()
        .map_err(|error| error.to_string())?;
    print_user(task);
    let outcome = run_with_ctrl_c(&control, task, RunOptions::default()).await?;
    report_outcome(&outcome);
    Ok(())
}

pub fn research_team() -> HandoffConfig {
    let mut team = HandoffConfig::new();
    team.add_participant(
        "Researcher",
        "You should provide accurate data for the ChartGenerator to use.",
        vec!["tavily_search".to_string()],
    );
    team.add_participant(
        "ChartGenerator",
        "Any charts you display will be visible by the user.",
        vec!["generate_bar_chart".to_string()],
    );
    team
}

/// One message on a file-persisted thread; earlier turns come from the checkpoint directory.
pub async fn run_chat(context: &CommandContext, thread_id: &str, message: &str) -> Result<(), String> {
    let control = context
        .builder(
            vec![create_search_tool(CHAT_SEARCH_RESULT)],
            DEFAULT_RECURSION_LIMIT,
        )
        .checkpointer(context.file_checkpointer())
        .build()
        .map_err(|error| error.to_string())?;
    print_user(message);
    let outcome = run_with_ctrl_c(&control, message, RunOptions::thread(thread_id)).await?;
    report_outcome(&outcome);
    Ok(())
}

fn approval_loop(context: &CommandContext) -> Result<ControlLoop, String> {
    context
        .builder(
            vec![create_search_tool(APPROVAL_SEARCH_RESULT)],
            DEFAULT_RECURSION_LIMIT,
        )
        .checkpointer(context.file_checkpointer())
        .interrupt_before(Phase::Execute)
        .build()
        .map_err(|error| error.to_string())
}

/// Starts a run that pauses before any tool executes.
pub async fn run_approve(context: &CommandContext, thread_id: &str, message: &str) -> Result<(), String> {
    let control = approval_loop(context)?;
    print_user(message);
    let outcome = run_with_ctrl_c(&control, message, RunOptions::thread(thread_id)).await?;
    report_outcome(&outcome);
    if matches!(outcome.status, LoopStatus::Interrupted { .. }) {
        println!("resume with: relay resume --thread {thread_id}");
    }
    Ok(())
}

/// Resumes a paused thread, asking before each tool execution unless `approve_all` is set.
pub async fn run_resume(context: &CommandContext, thread_id: &str, approve_all: bool) -> Result<(), String> {
    let control = approval_loop(context)?;
    loop {
        let history = control
            .history(thread_id)
            .await
            .map_err(|error| error.to_string())?;
        let Some(latest) = history.last() else {
            return Err(format!("thread '{thread_id}' has no checkpoints"));
        };
        if latest.next == Phase::Terminate {
            println!("thread '{thread_id}' is already complete");
            return Ok(());
        }

        let pending = latest.state.unresolved_calls();
        for call in &pending {
            println!("pending tool call: {} {}", call.name, call.arguments);
        }
        if !pending.is_empty() && !approve_all && !confirm("approve?")? {
            println!("left paused");
            return Ok(());
        }

        let cancel = CancelHandle::new();
        let outcome = with_ctrl_c(&cancel, control.resume(thread_id, Some(cancel.signal()))).await?;
        report_outcome(&outcome);
        if !matches!(outcome.status, LoopStatus::Interrupted { .. }) {
            return Ok(());
        }
    }
}

async fn run_with_ctrl_c(
    control: &ControlLoop,
    message: &str,
    options: RunOptions,
) -> Result<LoopOutcome, String> {
    let cancel = CancelHandle::new();
    let options = options.with_cancel(cancel.signal());
    with_ctrl_c(&cancel, control.run(vec![Turn::user(message)], options)).await
}

/// Cancels between steps on the first Ctrl-C; a second one abandons the in-flight step.
async fn with_ctrl_c<F>(cancel: &CancelHandle, run: F) -> Result<LoopOutcome, String>
where
    F: Future<Output = Result<LoopOutcome, LoopError>>,
{
    with_interrupts(cancel, run, || async {
        let _ = tokio::signal::ctrl_c().await;
    })
    .await
}

async fn with_interrupts<F, I, S>(
    cancel: &CancelHandle,
    run: F,
    mut interrupt: I,
) -> Result<LoopOutcome, String>
where
    F: Future<Output = Result<LoopOutcome, LoopError>>,
    I: FnMut() -> S,
    S: Future<Output = ()>,
{
    tokio::pin!(run);
    tokio::select! {
        result = &mut run => return result.map_err(|error| error.to_string()),
        _ = interrupt() => {
            eprintln!("cancelling after the current step (Ctrl-C again to abort)...");
            cancel.cancel();
        }
    }
    tokio::select! {
        result = &mut run => result.map_err(|error| error.to_string()),
        _ = interrupt() => {
            Err("aborted; the thread resumes from its latest checkpoint".to_string())
        }
    }
}

fn confirm(question: &str) -> Result<bool, String> {
    print!("{question} [y/N] ");
    io::stdout()
        .flush()
        .map_err(|error| format!("flush stdout failed: {error}"))?;
    let mut answer = String::new();
    io::stdin()
        .lock()
        .read_line(&mut answer)
        .map_err(|error| format!("read stdin failed: {error}"))?;
    Ok(matches!(
        answer.trim().to_ascii_lowercase().as_str(),
        "y" | "yes"
    ))
}

fn print_user(message: &str) {
    println!("> {message}");
}

fn report_outcome(outcome: &LoopOutcome) {
    match &outcome.status {
        LoopStatus::Completed => {}
        LoopStatus::Interrupted { before } => println!("[paused before {before}]"),
        LoopStatus::Cancelled { next } => println!("[cancelled; next phase {next}]"),
    }
    info!(
        thread_id = outcome.thread_id.as_deref().unwrap_or("-"),
        steps = outcome.metrics.step_count,
        model_requests = outcome.metrics.model_request_count,
        model_ms = outcome.metrics.model_request_total_ms,
        tool_executions = outcome.metrics.tool_execution_count,
        tool_ms = outcome.metrics.tool_execution_total_ms,
        "loop finished"
    );
}

pub fn console_sink(show_tool_results: bool) -> LoopEventSink {
    Arc::new(move |event| {
        if let Some(line) = render_event(&event, show_tool_results) {
            println!("{line}");
        }
    })
}

/// Console line for `event`, if it is worth showing.
pub fn render_event(event: &LoopEvent, show_tool_results: bool) -> Option<String> {
    match event {
        LoopEvent::TurnAppended { turn } => render_turn(turn, show_tool_results),
        LoopEvent::Interrupted { before } => Some(format!("[interrupt before {before}]")),
        _ => None,
    }
}

pub fn render_turn(turn: &Turn, show_tool_results: bool) -> Option<String> {
    match turn {
        Turn::Assistant {
            content,
            tool_calls,
            sender,
            ..
        } => {
            let speaker = sender.as_deref().unwrap_or("assistant");
            let mut lines = Vec::new();
            if !content.trim().is_empty() {
                lines.push(format!("{speaker}: {}", content.trim()));
            }
            for call in tool_calls {
                lines.push(format!("{speaker} -> {}({})", call.name, call.arguments));
            }
            (!lines.is_empty()).then(|| lines.join("\n"))
        }
        Turn::ToolResult {
            tool_name,
            content,
            is_error,
            ..
        } if show_tool_results || *is_error => {
            let marker = if *is_error { "error" } else { "result" };
            Some(format!("{tool_name} {marker}: {content}"))
        }
        Turn::ToolResult { .. } => None,
        Turn::User { content, .. } => Some(format!("rewritten question: {content}")),
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use relay_agent_core::{
        CancelHandle, ConversationState, LoopError, LoopEvent, LoopMetrics, LoopOutcome,
        LoopStatus, Phase,
    };
    use relay_ai::{ToolCall, Turn};
    use serde_json::json;

    use super::{render_event, render_turn, research_team, with_interrupts};

    #[test]
    fn assistant_turns_show_sender_and_calls() {
        let turn = Turn::assistant_with_calls(
            "",
            vec![ToolCall::new("c1", "get_weather", json!({"location": "sf"}))],
        )
        .with_sender("Researcher");
        assert_eq!(
            render_turn(&turn, true).as_deref(),
            Some(r#"Researcher -> get_weather({"location":"sf"})"#)
        );
    }

    fn tool_result(content: &str, is_error: bool) -> Turn {
        Turn::ToolResult {
            tool_call_id: "c1".to_string(),
            tool_name: "search".to_string(),
            content: content.to_string(),
            details: None,
            is_error,
            timestamp: 0,
        }
    }

    #[test]
    fn tool_results_hidden_unless_requested_or_failed() {
        let ok = tool_result("sunny", false);
        assert_eq!(render_turn(&ok, false), None);
        assert_eq!(render_turn(&ok, true).as_deref(), Some("search result: sunny"));

        let failed = tool_result("Tool 'nope' not found", true);
        assert_eq!(
            render_turn(&failed, false).as_deref(),
            Some("search error: Tool 'nope' not found")
        );
    }

    #[test]
    fn interrupts_are_announced() {
        let line = render_event(
            &LoopEvent::Interrupted {
                before: Phase::Execute,
            },
            false,
        );
        assert_eq!(line.as_deref(), Some("[interrupt before execute]"));
    }

    #[test]
    fn research_team_starts_with_the_researcher() {
        let team = research_team();
        let entry = team.entry().expect("entry participant");
        assert_eq!(team.label(entry), Some("Researcher"));
        assert_eq!(team.participants().len(), 2);
    }

    #[tokio::test]
    async fn second_interrupt_abandons_a_stuck_step() {
        let cancel = CancelHandle::new();
        let signal = cancel.signal();
        let presses = Arc::new(AtomicUsize::new(0));
        let counter = presses.clone();
        let stuck = std::future::pending::<Result<LoopOutcome, LoopError>>();

        let result = with_interrupts(&cancel, stuck, move || {
            counter.fetch_add(1, Ordering::SeqCst);
            async {}
        })
        .await;

        assert!(result.expect_err("stuck step is abandoned").contains("aborted"));
        assert!(signal.is_cancelled());
        assert_eq!(presses.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn finished_run_wins_over_a_pending_interrupt() {
        let cancel = CancelHandle::new();
        let run = async {
            Ok(LoopOutcome {
                status: LoopStatus::Completed,
                thread_id: None,
                state: ConversationState::new(),
                metrics: LoopMetrics::default(),
            })
        };

        let outcome = with_interrupts(&cancel, run, std::future::pending::<()>)
            .await
            .expect("run finishes");
        assert_eq!(outcome.status, LoopStatus::Completed);
        assert!(!cancel.signal().is_cancelled());
    }
}
