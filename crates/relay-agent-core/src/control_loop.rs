use std::collections::HashSet;
use std::time::Instant;

use relay_ai::{ConsultRequest, ModelRef, RelayError, Turn};
use tracing::{debug, info};

use crate::checkpoint::{Checkpoint, CheckpointError, CheckpointerRef};
use crate::handoff::{HandoffConfig, ParticipantId};
use crate::retrieval::{
    generate_request, is_grading_turn, rewrite_request, verdict_turn, GraderRef, RelevanceVerdict,
};
use crate::routing::{
    check_relevance, latest_tool_calls, route_after_tools, route_handoff, route_tool_calls, Route,
};
use crate::state::{ConversationState, ProtocolViolation};
use crate::tool_exec::execute_tool_calls;
use crate::types::{
    CancelSignal, LoopEvent, LoopEventSink, LoopMetrics, LoopOutcome, LoopStatus, Phase,
    RunOptions, ToolDefinition,
};

pub const DEFAULT_RECURSION_LIMIT: usize = 25;

#[derive(Debug, thiserror::Error)]
pub enum LoopError {
    #[error("protocol violation: {0}")]
    ProtocolViolation(#[from] ProtocolViolation),
    #[error("collaborator failed: {0}")]
    Collaborator(#[from] RelayError),
    #[error("{0}")]
    Checkpoint(#[from] CheckpointError),
    #[error("no checkpoint for thread '{thread_id}'")]
    CheckpointNotFound { thread_id: String },
    #[error("thread '{thread_id}' is paused before {next}; resume it before adding input")]
    ThreadPaused { thread_id: String, next: Phase },
    #[error("recursion limit of {limit} steps reached without terminating")]
    RecursionLimit { limit: usize },
    #[error("cannot run: no turns in the conversation")]
    EmptyConversation,
    #[error("invalid loop configuration: {0}")]
    InvalidConfig(String),
}

impl LoopError {
    /// Upstream model failures a caller may retry; the loop never retries on its own.
    pub fn is_retryable(&self) -> bool {
        matches!(self, LoopError::Collaborator(error) if error.code.is_retryable())
    }
}

#[derive(Clone, Debug)]
pub struct LoopConfig {
    pub system_prompt: Option<String>,
    /// Maximum steps per run or resume.
    pub recursion_limit: usize,
    /// Execute the tool requests of one turn concurrently.
    pub parallel_tool_calls: bool,
    pub interrupt_before: Vec<Phase>,
}

impl Default for LoopConfig {
    fn default() -> Self {
        Self {
            system_prompt: None,
            recursion_limit: DEFAULT_RECURSION_LIMIT,
            parallel_tool_calls: true,
            interrupt_before: vec![],
        }
    }
}

#[derive(Clone)]
pub enum LoopMode {
    Tools,
    Retrieval { grader: GraderRef },
    Handoff(HandoffConfig),
}

pub struct ControlLoopBuilder {
    model: ModelRef,
    tools: Vec<ToolDefinition>,
    config: LoopConfig,
    mode: LoopMode,
    checkpointer: Option<CheckpointerRef>,
    events: Option<LoopEventSink>,
}

impl ControlLoopBuilder {
    pub fn tool(mut self, tool: ToolDefinition) -> Self {
        self.tools.push(tool);
        self
    }

    pub fn tools(mut self, tools: impl IntoIterator<Item = ToolDefinition>) -> Self {
        self.tools.extend(tools);
        self
    }

    pub fn config(mut self, config: LoopConfig) -> Self {
        self.config = config;
        self
    }

    pub fn system_prompt(mut self, system_prompt: impl Into<String>) -> Self {
        self.config.system_prompt = Some(system_prompt.into());
        self
    }

    pub fn recursion_limit(mut self, limit: usize) -> Self {
        self.config.recursion_limit = limit;
        self
    }

    pub fn parallel_tool_calls(mut self, enabled: bool) -> Self {
        self.config.parallel_tool_calls = enabled;
        self
    }

    pub fn interrupt_before(mut self, phase: Phase) -> Self {
        if !self.config.interrupt_before.contains(&phase) {
            self.config.interrupt_before.push(phase);
        }
        self
    }

    pub fn retrieval(mut self, grader: GraderRef) -> Self {
        self.mode = LoopMode::Retrieval { grader };
        self
    }

    pub fn handoff(mut self, handoff: HandoffConfig) -> Self {
        self.mode = LoopMode::Handoff(handoff);
        self
    }

    pub fn checkpointer(mut self, checkpointer: CheckpointerRef) -> Self {
        self.checkpointer = Some(checkpointer);
        self
    }

    pub fn events(mut self, events: LoopEventSink) -> Self {
        self.events = Some(events);
        self
    }

    pub fn build(self) -> Result<ControlLoop, LoopError> {
        let invalid = |message: String| Err(LoopError::InvalidConfig(message));

        let mut names = HashSet::new();
        for tool in &self.tools {
            if !names.insert(tool.name.as_str()) {
                return invalid(format!("duplicate tool name '{}'", tool.name));
            }
        }
        if self.config.recursion_limit == 0 {
            return invalid("recursion limit must be at least 1".to_string());
        }
        if !self.config.interrupt_before.is_empty() && self.checkpointer.is_none() {
            return invalid("interrupts require a checkpointer".to_string());
        }
        let retrieval = matches!(self.mode, LoopMode::Retrieval { .. });
        for phase in &self.config.interrupt_before {
            if *phase == Phase::Terminate || (phase.is_retrieval_only() && !retrieval) {
                return invalid(format!("cannot interrupt before {phase} in this loop"));
            }
        }
        if let LoopMode::Handoff(handoff) = &self.mode {
            handoff.validate(&names).map_err(LoopError::InvalidConfig)?;
        }

        Ok(ControlLoop {
            model: self.model,
            tools: self.tools,
            config: self.config,
            mode: self.mode,
            checkpointer: self.checkpointer,
            events: self.events,
        })
    }
}

/// Drives consult/execute cycles over a conversation until a route terminates it.
pub struct ControlLoop {
    model: ModelRef,
    tools: Vec<ToolDefinition>,
    config: LoopConfig,
    mode: LoopMode,
    checkpointer: Option<CheckpointerRef>,
    events: Option<LoopEventSink>,
}

impl ControlLoop {
    pub fn builder(model: ModelRef) -> ControlLoopBuilder {
        ControlLoopBuilder {
            model,
            tools: vec![],
            config: LoopConfig::default(),
            mode: LoopMode::Tools,
            checkpointer: None,
            events: None,
        }
    }

    pub fn config(&self) -> &LoopConfig {
        &self.config
    }

    pub fn tools(&self) -> &[ToolDefinition] {
        &self.tools
    }

    /// Appends `input` to the thread's stored history (if any) and runs from CONSULT.
    pub async fn run(&self, input: Vec<Turn>, options: RunOptions) -> Result<LoopOutcome, LoopError> {
        let mut state = ConversationState::new();
        let mut step = 0;
        match options.thread_id.as_deref() {
            None if !self.config.interrupt_before.is_empty() => {
                return Err(LoopError::InvalidConfig(
                    "interrupts need a thread id to persist the pause".to_string(),
                ));
            }
            None => {}
            Some(thread_id) => {
                if let Some(checkpoint) = self.load_latest(thread_id).await? {
                    // Only a thread waiting for input may take new turns.
                    if !matches!(checkpoint.next, Phase::Consult | Phase::Terminate) {
                        return Err(LoopError::ThreadPaused {
                            thread_id: thread_id.to_string(),
                            next: checkpoint.next,
                        });
                    }
                    state = checkpoint.state;
                    step = checkpoint.step;
                }
            }
        }
        state.extend(input)?;
        if state.is_empty() {
            return Err(LoopError::EmptyConversation);
        }

        let participant = self.handoff().and_then(HandoffConfig::entry);
        let runner = LoopRunner::new(self, options, state, participant, step);
        runner.save_checkpoint(Phase::Consult).await?;
        runner.drive(Phase::Consult, false).await
    }

    /// Continues a thread from its latest checkpoint, skipping the interrupt that paused it.
    pub async fn resume(
        &self,
        thread_id: &str,
        cancel: Option<CancelSignal>,
    ) -> Result<LoopOutcome, LoopError> {
        let checkpoint =
            self.load_latest(thread_id)
                .await?
                .ok_or_else(|| LoopError::CheckpointNotFound {
                    thread_id: thread_id.to_string(),
                })?;
        let participant = match (self.handoff(), checkpoint.participant.as_deref()) {
            (Some(handoff), Some(label)) => Some(handoff.find(label).ok_or_else(|| {
                ProtocolViolation::new(format!("checkpoint participant '{label}' is not on the roster"))
            })?),
            (Some(handoff), None) => handoff.entry(),
            (None, _) => None,
        };

        let options = RunOptions {
            thread_id: Some(thread_id.to_string()),
            cancel,
        };
        let runner = LoopRunner::new(self, options, checkpoint.state, participant, checkpoint.step);
        runner.drive(checkpoint.next, true).await
    }

    /// `resume`, or a fresh `run` with `input` when the thread has no checkpoint yet.
    pub async fn resume_or_start(
        &self,
        thread_id: &str,
        input: Vec<Turn>,
        cancel: Option<CancelSignal>,
    ) -> Result<LoopOutcome, LoopError> {
        match self.resume(thread_id, cancel.clone()).await {
            Err(LoopError::CheckpointNotFound { .. }) => {
                let mut options = RunOptions::thread(thread_id);
                options.cancel = cancel;
                self.run(input, options).await
            }
            other => other,
        }
    }

    pub async fn history(&self, thread_id: &str) -> Result<Vec<Checkpoint>, LoopError> {
        let checkpointer = self.require_checkpointer()?;
        Ok(checkpointer.history(thread_id).await?)
    }

    async fn load_latest(&self, thread_id: &str) -> Result<Option<Checkpoint>, LoopError> {
        let checkpointer = self.require_checkpointer()?;
        Ok(checkpointer.load_latest(thread_id).await?)
    }

    fn require_checkpointer(&self) -> Result<&CheckpointerRef, LoopError> {
        self.checkpointer.as_ref().ok_or_else(|| {
            LoopError::InvalidConfig("thread ids require a checkpointer".to_string())
        })
    }

    fn handoff(&self) -> Option<&HandoffConfig> {
        match &self.mode {
            LoopMode::Handoff(handoff) => Some(handoff),
            _ => None,
        }
    }
}

struct LoopRunner<'a> {
    owner: &'a ControlLoop,
    thread_id: Option<String>,
    cancel: Option<CancelSignal>,
    state: ConversationState,
    /// Participant owning the next step in a handoff loop.
    participant: Option<ParticipantId>,
    step: u64,
    steps_this_run: usize,
    metrics: LoopMetrics,
}

impl<'a> LoopRunner<'a> {
    fn new(
        owner: &'a ControlLoop,
        options: RunOptions,
        state: ConversationState,
        participant: Option<ParticipantId>,
        step: u64,
    ) -> Self {
        Self {
            owner,
            thread_id: options.thread_id,
            cancel: options.cancel,
            state,
            participant,
            step,
            steps_this_run: 0,
            metrics: LoopMetrics::default(),
        }
    }

    async fn drive(mut self, mut phase: Phase, resumed: bool) -> Result<LoopOutcome, LoopError> {
        self.emit(LoopEvent::LoopStart {
            thread_id: self.thread_id.clone(),
            phase,
            resumed,
        });
        let mut skip_interrupt = resumed;

        loop {
            if phase == Phase::Terminate {
                return Ok(self.finish(LoopStatus::Completed));
            }
            if !skip_interrupt && self.owner.config.interrupt_before.contains(&phase) {
                info!(
                    thread_id = self.thread_id.as_deref().unwrap_or_default(),
                    phase = phase.as_str(),
                    "loop interrupted"
                );
                self.emit(LoopEvent::Interrupted { before: phase });
                return Ok(self.finish(LoopStatus::Interrupted { before: phase }));
            }
            skip_interrupt = false;
            if self.cancel.as_ref().is_some_and(CancelSignal::is_cancelled) {
                return Ok(self.finish(LoopStatus::Cancelled { next: phase }));
            }
            if self.steps_this_run >= self.owner.config.recursion_limit {
                return Err(LoopError::RecursionLimit {
                    limit: self.owner.config.recursion_limit,
                });
            }

            self.steps_this_run += 1;
            self.step += 1;
            self.metrics.step_count += 1;
            let participant = self.participant_label();
            debug!(
                step = self.step,
                phase = phase.as_str(),
                participant = participant.as_deref().unwrap_or_default(),
                "loop step started"
            );
            self.emit(LoopEvent::StepStart {
                step: self.step,
                phase,
                participant,
            });

            phase = match phase {
                Phase::Consult => self.consult().await?,
                Phase::Execute => self.execute().await?,
                Phase::Grade => self.grade().await?,
                Phase::Rewrite => self.rewrite().await?,
                Phase::Generate => self.generate().await?,
                Phase::Terminate => Phase::Terminate,
            };
            self.save_checkpoint(phase).await?;
        }
    }

    async fn consult(&mut self) -> Result<Phase, LoopError> {
        let owner = self.owner;
        let tools = owner.tools.iter().map(ToolDefinition::to_llm_tool);
        match &owner.mode {
            LoopMode::Tools => {
                let request = self
                    .base_request(self.state.turns().to_vec())
                    .with_tools(tools.collect());
                let turn = self.request_model(request).await?;
                self.append(turn)?;
                Ok(phase_for(route_tool_calls(&self.state)?))
            }
            LoopMode::Retrieval { .. } => {
                let visible = self
                    .state
                    .turns()
                    .iter()
                    .filter(|turn| !is_grading_turn(turn))
                    .cloned()
                    .collect();
                let request = self.base_request(visible).with_tools(tools.collect());
                let turn = self.request_model(request).await?;
                self.append(turn)?;
                Ok(phase_for(route_tool_calls(&self.state)?))
            }
            LoopMode::Handoff(handoff) => {
                let current = self.participant.ok_or_else(|| {
                    ProtocolViolation::new("handoff consult without an active participant")
                })?;
                let member = handoff.participant(current).ok_or_else(|| {
                    ProtocolViolation::new("active participant is not on the roster")
                })?;
                let request = ConsultRequest::new(handoff.participant_view(current, self.state.turns()))
                    .with_system_prompt(handoff.system_prompt(current))
                    .with_tools(
                        tools
                            .filter(|tool| member.tool_names.contains(&tool.name))
                            .collect(),
                    );
                let turn = self.request_model(request).await?;
                self.append(turn.with_sender(member.label.clone()))?;

                let route = route_handoff(&self.state, handoff, current)?;
                if let Route::Consult(next) = route {
                    self.participant = Some(next);
                }
                Ok(phase_for(route))
            }
        }
    }

    async fn execute(&mut self) -> Result<Phase, LoopError> {
        latest_tool_calls(&self.state)?;
        let calls: Vec<_> = self.state.unresolved_calls().into_iter().cloned().collect();
        if calls.is_empty() {
            return Err(ProtocolViolation::new("execute step without tool requests").into());
        }

        let owner = self.owner;
        let outcome = execute_tool_calls(
            &owner.tools,
            &calls,
            owner.config.parallel_tool_calls,
            owner.events.as_ref(),
        )
        .await;
        self.metrics.tool_execution_count += outcome.executed_count;
        self.metrics.tool_execution_total_ms = self
            .metrics
            .tool_execution_total_ms
            .saturating_add(outcome.executed_total_duration_ms);
        for result in outcome.results {
            self.append(result)?;
        }

        match &owner.mode {
            LoopMode::Tools => Ok(Phase::Consult),
            LoopMode::Retrieval { .. } => Ok(Phase::Grade),
            LoopMode::Handoff(handoff) => {
                self.participant = Some(route_after_tools(&self.state, handoff)?);
                Ok(Phase::Consult)
            }
        }
    }

    async fn grade(&mut self) -> Result<Phase, LoopError> {
        let owner = self.owner;
        let LoopMode::Retrieval { grader } = &owner.mode else {
            return Err(ProtocolViolation::new("grade step outside a retrieval loop").into());
        };
        let question = self.question()?;
        let context = match self.state.last() {
            Some(Turn::ToolResult { content, .. }) => content.clone(),
            _ => {
                return Err(
                    ProtocolViolation::new("grade step expects the latest turn to be a tool result")
                        .into(),
                )
            }
        };

        let verdict = grader.grade(&question, &context).await?;
        self.append(verdict_turn(verdict))?;
        Ok(match check_relevance(&self.state)? {
            RelevanceVerdict::Relevant => Phase::Generate,
            RelevanceVerdict::NotRelevant => Phase::Rewrite,
        })
    }

    async fn rewrite(&mut self) -> Result<Phase, LoopError> {
        let question = self.question()?;
        let response = self.request_model(rewrite_request(&question)).await?;
        self.append(Turn::user(response.text()))?;
        Ok(Phase::Consult)
    }

    async fn generate(&mut self) -> Result<Phase, LoopError> {
        let question = self.question()?;
        let context = self
            .state
            .last_tool_result()
            .map(|turn| turn.text().to_string())
            .ok_or_else(|| ProtocolViolation::new("generate step without retrieved content"))?;
        let response = self
            .request_model(generate_request(&question, &context))
            .await?;
        self.append(response)?;
        Ok(Phase::Terminate)
    }

    fn base_request(&self, turns: Vec<Turn>) -> ConsultRequest {
        let request = ConsultRequest::new(turns);
        match &self.owner.config.system_prompt {
            Some(prompt) => request.with_system_prompt(prompt.clone()),
            None => request,
        }
    }

    async fn request_model(&mut self, request: ConsultRequest) -> Result<Turn, LoopError> {
        let started = Instant::now();
        let result = self.owner.model.consult(request).await;
        let duration_ms = started.elapsed().as_millis() as u64;
        self.metrics.model_request_count += 1;
        self.metrics.model_request_total_ms =
            self.metrics.model_request_total_ms.saturating_add(duration_ms);
        debug!(duration_ms, ok = result.is_ok(), "model consulted");

        let turn = result?;
        if !matches!(turn, Turn::Assistant { .. }) {
            return Err(ProtocolViolation::new(format!(
                "model answered with a {} turn",
                turn.role()
            ))
            .into());
        }
        Ok(turn)
    }

    fn question(&self) -> Result<String, ProtocolViolation> {
        self.state
            .first_user_text()
            .map(str::to_string)
            .ok_or_else(|| ProtocolViolation::new("conversation has no user question"))
    }

    fn append(&mut self, turn: Turn) -> Result<(), ProtocolViolation> {
        self.state.append(turn.clone())?;
        self.emit(LoopEvent::TurnAppended { turn });
        Ok(())
    }

    async fn save_checkpoint(&self, next: Phase) -> Result<(), LoopError> {
        let (Some(thread_id), Some(checkpointer)) =
            (self.thread_id.as_deref(), self.owner.checkpointer.as_ref())
        else {
            return Ok(());
        };
        let checkpoint = Checkpoint::new(
            thread_id,
            self.step,
            next,
            self.participant_label(),
            self.state.clone(),
        );
        checkpointer.append(&checkpoint).await?;
        self.emit(LoopEvent::CheckpointSaved {
            thread_id: thread_id.to_string(),
            step: self.step,
            next,
        });
        Ok(())
    }

    fn participant_label(&self) -> Option<String> {
        let handoff = self.owner.handoff()?;
        handoff.label(self.participant?).map(str::to_string)
    }

    fn finish(self, status: LoopStatus) -> LoopOutcome {
        debug!(
            status = ?status,
            steps = self.metrics.step_count,
            model_request_count = self.metrics.model_request_count,
            model_request_total_ms = self.metrics.model_request_total_ms,
            tool_execution_count = self.metrics.tool_execution_count,
            tool_execution_total_ms = self.metrics.tool_execution_total_ms,
            "loop finished"
        );
        self.emit(LoopEvent::LoopEnd {
            status: status.clone(),
            metrics: self.metrics.clone(),
        });
        LoopOutcome {
            status,
            thread_id: self.thread_id,
            state: self.state,
            metrics: self.metrics,
        }
    }

    fn emit(&self, event: LoopEvent) {
        if let Some(events) = self.owner.events.as_ref() {
            events(event);
        }
    }
}

fn phase_for(route: Route) -> Phase {
    match route {
        Route::Execute => Phase::Execute,
        Route::Terminate => Phase::Terminate,
        Route::Consult(_) => Phase::Consult,
    }
}
