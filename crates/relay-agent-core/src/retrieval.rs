use std::sync::Arc;

use async_trait::async_trait;
use relay_ai::{
    now_millis, ConsultRequest, ModelRef, RelayError, RelayErrorCode, Tool, ToolCall, Turn,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::debug;

pub const RELEVANCE_TOOL_NAME: &str = "give_relevance_score";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RelevanceVerdict {
    Relevant,
    NotRelevant,
}

impl RelevanceVerdict {
    pub fn binary_score(self) -> &'static str {
        match self {
            RelevanceVerdict::Relevant => "yes",
            RelevanceVerdict::NotRelevant => "no",
        }
    }

    /// Anything other than a case-insensitive "yes" counts as not relevant.
    pub fn from_binary_score(score: &str) -> Self {
        if score.trim().eq_ignore_ascii_case("yes") {
            RelevanceVerdict::Relevant
        } else {
            RelevanceVerdict::NotRelevant
        }
    }
}

#[async_trait]
pub trait Grader: Send + Sync {
    async fn grade(&self, question: &str, context: &str) -> Result<RelevanceVerdict, RelayError>;
}

pub type GraderRef = Arc<dyn Grader>;

/// Grades by forcing the model to call the relevance scoring tool.
pub struct ModelGrader {
    model: ModelRef,
}

impl ModelGrader {
    pub fn new(model: ModelRef) -> Self {
        Self { model }
    }
}

#[async_trait]
impl Grader for ModelGrader {
    async fn grade(&self, question: &str, context: &str) -> Result<RelevanceVerdict, RelayError> {
        let prompt = format!(
            "You are a grader assessing relevance of retrieved docs to a user question.\n\
             Here are the retrieved docs:\n\
             \n -------\n\n\
             {context}\n\
             \n -------\n\n\
             Here is the user question: {question}\n\
             If the content of the docs are relevant to the users question, score them as relevant.\n\
             Give a binary score 'yes' or 'no' score to indicate whether the docs are relevant to the question.\n\
             Yes: The docs are relevant to the question.\n\
             No: The docs are not relevant to the question."
        );
        let request = ConsultRequest::new(vec![Turn::user(prompt)])
            .with_tools(vec![relevance_tool()])
            .with_tool_choice(RELEVANCE_TOOL_NAME);
        let response = self.model.consult(request).await?;

        let score = match &response {
            Turn::Assistant { tool_calls, .. } => tool_calls
                .iter()
                .find(|call| call.name == RELEVANCE_TOOL_NAME)
                .and_then(|call| call.arguments.get("binaryScore"))
                .and_then(Value::as_str),
            _ => None,
        }
        .ok_or_else(|| {
            RelayError::new(
                RelayErrorCode::ProviderProtocol,
                format!("grader response did not call {RELEVANCE_TOOL_NAME} with a binaryScore"),
            )
        })?;
        debug!(score, "relevance graded");
        Ok(RelevanceVerdict::from_binary_score(score))
    }
}

pub fn relevance_tool() -> Tool {
    Tool {
        name: RELEVANCE_TOOL_NAME.to_string(),
        description: "Give the relevance score to the retrieved documents.".to_string(),
        parameters: json!({
            "type": "object",
            "properties": {
                "binaryScore": {
                    "type": "string",
                    "description": "Relevance score 'yes' or 'no'"
                }
            },
            "required": ["binaryScore"]
        }),
    }
}

/// Records a verdict in history as an assistant turn calling the scoring tool.
pub fn verdict_turn(verdict: RelevanceVerdict) -> Turn {
    Turn::assistant_with_calls(
        "",
        vec![ToolCall::new(
            format!("relevance-{}", now_millis()),
            RELEVANCE_TOOL_NAME,
            json!({ "binaryScore": verdict.binary_score() }),
        )],
    )
}

pub fn verdict_of(turn: &Turn) -> Option<RelevanceVerdict> {
    let Turn::Assistant { tool_calls, .. } = turn else {
        return None;
    };
    let call = tool_calls.first()?;
    if call.name != RELEVANCE_TOOL_NAME {
        return None;
    }
    call.arguments
        .get("binaryScore")
        .and_then(Value::as_str)
        .map(RelevanceVerdict::from_binary_score)
}

/// Grading turns are bookkeeping; the consulting model never sees them.
pub(crate) fn is_grading_turn(turn: &Turn) -> bool {
    matches!(
        turn,
        Turn::Assistant { tool_calls, .. }
            if tool_calls.first().is_some_and(|call| call.name == RELEVANCE_TOOL_NAME)
    )
}

pub(crate) fn rewrite_request(question: &str) -> ConsultRequest {
    ConsultRequest::new(vec![Turn::user(format!(
        "Look at the input and try to reason about the underlying semantic intent / meaning.\n\
         Here is the initial question:\n\
         \n -------\n\n\
         {question}\n\
         \n -------\n\n\
         Formulate an improved question:"
    ))])
}

pub(crate) fn generate_request(question: &str, context: &str) -> ConsultRequest {
    ConsultRequest::new(vec![Turn::user(format!(
        "You are an assistant for question-answering tasks. \
         Use the following pieces of retrieved context to answer the question. \
         If you don't know the answer, just say that you don't know. \
         Use three sentences maximum and keep the answer concise.\n\
         Question: {question}\n\
         Context: {context}\n\
         Answer:"
    ))])
}
