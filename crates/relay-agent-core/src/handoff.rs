use std::collections::{HashMap, HashSet};

use relay_ai::Turn;
use serde::{Deserialize, Serialize};

pub const DEFAULT_SENTINEL: &str = "FINAL ANSWER";

/// Typed handle for a roster entry. Only valid for the roster that issued it.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ParticipantId(usize);

#[derive(Clone, Debug, PartialEq)]
pub struct Participant {
    pub label: String,
    pub system_message: String,
    pub tool_names: Vec<String>,
}

/// Roster, routing table and termination sentinel for a multi-participant loop.
#[derive(Clone, Debug)]
pub struct HandoffConfig {
    participants: Vec<Participant>,
    next: HashMap<ParticipantId, ParticipantId>,
    entry: Option<ParticipantId>,
    sentinel: Option<String>,
}

impl Default for HandoffConfig {
    fn default() -> Self {
        Self::new()
    }
}

impl HandoffConfig {
    pub fn new() -> Self {
        Self {
            participants: vec![],
            next: HashMap::new(),
            entry: None,
            sentinel: Some(DEFAULT_SENTINEL.to_string()),
        }
    }

    pub fn add_participant(
        &mut self,
        label: impl Into<String>,
        system_message: impl Into<String>,
        tool_names: Vec<String>,
    ) -> ParticipantId {
        self.participants.push(Participant {
            label: label.into(),
            system_message: system_message.into(),
            tool_names,
        });
        ParticipantId(self.participants.len() - 1)
    }

    /// Hands a plain-text turn from `from` over to `to`.
    pub fn hand_off(&mut self, from: ParticipantId, to: ParticipantId) -> &mut Self {
        self.next.insert(from, to);
        self
    }

    /// First participant consulted on a fresh run. Defaults to the first one added.
    pub fn set_entry(&mut self, entry: ParticipantId) -> &mut Self {
        self.entry = Some(entry);
        self
    }

    /// `None` disables sentinel termination.
    pub fn set_sentinel(&mut self, sentinel: Option<String>) -> &mut Self {
        self.sentinel = sentinel;
        self
    }

    pub fn sentinel(&self) -> Option<&str> {
        self.sentinel.as_deref()
    }

    pub fn participants(&self) -> &[Participant] {
        &self.participants
    }

    pub fn participant(&self, id: ParticipantId) -> Option<&Participant> {
        self.participants.get(id.0)
    }

    pub fn label(&self, id: ParticipantId) -> Option<&str> {
        self.participant(id).map(|participant| participant.label.as_str())
    }

    pub fn find(&self, label: &str) -> Option<ParticipantId> {
        self.participants
            .iter()
            .position(|participant| participant.label == label)
            .map(ParticipantId)
    }

    pub fn entry(&self) -> Option<ParticipantId> {
        self.entry
            .or_else(|| (!self.participants.is_empty()).then_some(ParticipantId(0)))
    }

    /// Explicit routing entry, or the peer when exactly two participants exist.
    pub fn next_after(&self, current: ParticipantId) -> Option<ParticipantId> {
        if let Some(next) = self.next.get(&current) {
            return Some(*next);
        }
        if self.participants.len() == 2 && current.0 < 2 {
            return Some(ParticipantId(1 - current.0));
        }
        None
    }

    pub(crate) fn validate(&self, known_tools: &HashSet<&str>) -> Result<(), String> {
        if self.participants.is_empty() {
            return Err("handoff loop needs at least one participant".to_string());
        }
        let mut labels = HashSet::new();
        for participant in &self.participants {
            if participant.label.trim().is_empty() {
                return Err("participant labels must not be empty".to_string());
            }
            if !labels.insert(participant.label.as_str()) {
                return Err(format!("duplicate participant label '{}'", participant.label));
            }
            if let Some(unknown) = participant
                .tool_names
                .iter()
                .find(|name| !known_tools.contains(name.as_str()))
            {
                return Err(format!(
                    "participant '{}' references unknown tool '{unknown}'",
                    participant.label
                ));
            }
        }
        let in_roster = |id: &ParticipantId| id.0 < self.participants.len();
        if !self.next.iter().all(|(from, to)| in_roster(from) && in_roster(to)) {
            return Err("routing table references a participant outside the roster".to_string());
        }
        if self.entry.is_some_and(|entry| !in_roster(&entry)) {
            return Err("entry participant is outside the roster".to_string());
        }
        if matches!(self.sentinel.as_deref(), Some(sentinel) if sentinel.is_empty()) {
            return Err("termination sentinel must not be empty".to_string());
        }
        Ok(())
    }

    pub(crate) fn system_prompt(&self, id: ParticipantId) -> String {
        let Some(participant) = self.participant(id) else {
            return String::new();
        };
        let mut prompt = String::from(
            "You are a helpful AI assistant, collaborating with other assistants. \
             Use the provided tools to progress towards answering the question. \
             If you are unable to fully answer, that's OK, another assistant with different tools \
             will help where you left off. Execute what you can to make progress.",
        );
        if let Some(sentinel) = self.sentinel() {
            prompt.push_str(&format!(
                " If you or any of the other assistants have the final answer or deliverable, \
                 prefix your response with {sentinel} so the team knows to stop."
            ));
        }
        prompt.push_str(&format!(
            " You have access to the following tools: {}.\n{}",
            participant.tool_names.join(", "),
            participant.system_message
        ));
        prompt
    }

    /// History as `me` sees it: other participants' plain-text answers arrive as named user turns.
    pub(crate) fn participant_view(&self, me: ParticipantId, turns: &[Turn]) -> Vec<Turn> {
        turns
            .iter()
            .map(|turn| match turn {
                Turn::Assistant {
                    content,
                    tool_calls,
                    sender: Some(label),
                    timestamp,
                    ..
                } if tool_calls.is_empty() && self.find(label) != Some(me) => Turn::User {
                    content: content.clone(),
                    sender: Some(label.clone()),
                    timestamp: *timestamp,
                },
                other => other.clone(),
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use relay_ai::{Role, Turn};

    use super::HandoffConfig;

    fn team() -> (HandoffConfig, super::ParticipantId, super::ParticipantId) {
        let mut config = HandoffConfig::new();
        let researcher = config.add_participant(
            "Researcher",
            "You should provide accurate data for the chart generator to use.",
            vec!["tavily_search".to_string()],
        );
        let charts = config.add_participant(
            "ChartGenerator",
            "Any charts you display will be visible by the user.",
            vec!["generate_bar_chart".to_string()],
        );
        (config, researcher, charts)
    }

    #[test]
    fn two_participants_default_to_their_peer() {
        let (config, researcher, charts) = team();
        assert_eq!(config.next_after(researcher), Some(charts));
        assert_eq!(config.next_after(charts), Some(researcher));
        assert_eq!(config.entry(), Some(researcher));
    }

    #[test]
    fn duplicate_labels_and_unknown_tools_fail_validation() {
        let (mut config, _, _) = team();
        let known: HashSet<&str> = ["tavily_search", "generate_bar_chart"].into_iter().collect();
        assert!(config.validate(&known).is_ok());

        config.add_participant("Researcher", "", vec![]);
        assert!(config
            .validate(&known)
            .expect_err("duplicate label")
            .contains("duplicate"));

        let (mut config, _, _) = team();
        config.add_participant("Critic", "", vec!["shell".to_string()]);
        assert!(config
            .validate(&known)
            .expect_err("unknown tool")
            .contains("shell"));
    }

    #[test]
    fn view_turns_peer_answers_into_named_user_turns() {
        let (config, researcher, charts) = team();
        let turns = vec![
            Turn::user("fetch the UK's GDP"),
            Turn::assistant("Here is the data").with_sender("Researcher"),
        ];

        let chart_view = config.participant_view(charts, &turns);
        assert_eq!(chart_view[1].role(), Role::User);
        assert_eq!(chart_view[1].sender(), Some("Researcher"));

        let own_view = config.participant_view(researcher, &turns);
        assert_eq!(own_view[1].role(), Role::Assistant);
    }

    #[test]
    fn prompt_lists_tools_and_sentinel() {
        let (mut config, researcher, _) = team();
        let prompt = config.system_prompt(researcher);
        assert!(prompt.contains("tavily_search"));
        assert!(prompt.contains("FINAL ANSWER"));

        config.set_sentinel(None);
        assert!(!config.system_prompt(researcher).contains("FINAL ANSWER"));
    }
}
