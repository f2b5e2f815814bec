//! Agent events, session bookkeeping, and driver errors.

use std::fmt;
use std::sync::LazyLock;

use regex::Regex;
use serde::Serialize;
use thiserror::Error;

use super::output::parse_output;

/// Whether a provider failure is worth retrying.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderFailureKind {
    /// Timeouts, rate limits, overload, dropped connections.
    Transient,
    Fatal,
}

impl fmt::Display for ProviderFailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Transient => f.write_str("transient"),
            Self::Fatal => f.write_str("fatal"),
        }
    }
}

/// Errors surfaced by an [`super::AgentDriver`].
#[derive(Debug, Clone, PartialEq, Error)]
pub enum AgentError {
    /// The session used up `max_turns` without producing the artifacts.
    #[error("turn limit exceeded after {turns} turns (max {max_turns})")]
    TurnLimitExceeded { max_turns: u32, turns: u32 },

    /// The underlying agent call failed.
    #[error("{kind} provider failure: {message}")]
    ProviderFailure {
        kind: ProviderFailureKind,
        message: String,
    },

    /// The session finished but its final message held no output object.
    #[error("agent output could not be parsed: {0}")]
    MalformedOutput(String),
}

impl AgentError {
    pub fn transient(message: impl Into<String>) -> Self {
        Self::ProviderFailure {
            kind: ProviderFailureKind::Transient,
            message: message.into(),
        }
    }

    pub fn fatal(message: impl Into<String>) -> Self {
        Self::ProviderFailure {
            kind: ProviderFailureKind::Fatal,
            message: message.into(),
        }
    }

    /// Classify a provider message as transient or fatal.
    pub fn provider(message: impl Into<String>) -> Self {
        let message = message.into();
        if is_transient_message(&message) {
            Self::transient(message)
        } else {
            Self::fatal(message)
        }
    }

    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::ProviderFailure {
                kind: ProviderFailureKind::Transient,
                ..
            }
        )
    }
}

static TRANSIENT_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)rate[ _]limit|overloaded|timeout|timed out|\b(?:429|500|502|503|504|529)\b|connection|econnreset|temporarily unavailable",
    )
    .expect("static regex")
});

/// Heuristic match for retryable provider errors.
///
/// Status codes only count as whole numbers, so "processed 1500 files" is
/// not a 500.
pub fn is_transient_message(message: &str) -> bool {
    TRANSIENT_PATTERN.is_match(message)
}

/// One event observed from the agent process.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AgentEvent {
    /// Start of an assistant message; each one is a turn.
    AssistantTurn,
    /// Text content.
    Message { role: String, content: String },
    /// The agent invoked a tool.
    ToolCall {
        tool: String,
        input: serde_json::Value,
    },
    /// A tool returned.
    ToolResult {
        tool: String,
        output: serde_json::Value,
        is_error: bool,
    },
    TokenUsage {
        input_tokens: u64,
        output_tokens: u64,
    },
    /// Final summary line emitted by the agent CLI.
    Result {
        subtype: String,
        is_error: bool,
        num_turns: Option<u32>,
        text: Option<String>,
        total_cost_usd: Option<f64>,
    },
    Error { message: String },
    /// The event stream ended.
    Completed,
}

/// Why a session stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TerminationReason {
    Completed,
    TurnLimitExceeded,
    Error,
}

/// What a successful session hands back: the raw output object plus how
/// many turns it took.
#[derive(Debug, Clone, PartialEq)]
pub struct AgentOutput {
    pub raw: serde_json::Value,
    pub turns: u32,
    pub cost_usd: Option<f64>,
}

/// Ephemeral per-instance session state.
#[derive(Debug)]
pub struct AgentSession {
    max_turns: u32,
    turns: u32,
    history: Vec<AgentEvent>,
    current_texts: Vec<String>,
    last_assistant_text: Option<String>,
    result: Option<AgentEvent>,
    errors: Vec<String>,
    termination: Option<TerminationReason>,
}

impl AgentSession {
    pub fn new(max_turns: u32) -> Self {
        Self {
            max_turns,
            turns: 0,
            history: Vec::new(),
            current_texts: Vec::new(),
            last_assistant_text: None,
            result: None,
            errors: Vec::new(),
            termination: None,
        }
    }

    pub fn turns(&self) -> u32 {
        self.turns
    }

    pub fn history(&self) -> &[AgentEvent] {
        &self.history
    }

    pub fn termination(&self) -> Option<TerminationReason> {
        self.termination
    }

    pub fn last_assistant_text(&self) -> Option<&str> {
        self.last_assistant_text.as_deref()
    }

    /// Record one event. Fails once the turn budget is exhausted.
    pub fn record(&mut self, event: AgentEvent) -> Result<(), AgentError> {
        match &event {
            AgentEvent::AssistantTurn => {
                self.turns += 1;
                self.current_texts.clear();
                if self.turns > self.max_turns {
                    self.history.push(event);
                    self.termination = Some(TerminationReason::TurnLimitExceeded);
                    return Err(AgentError::TurnLimitExceeded {
                        max_turns: self.max_turns,
                        turns: self.turns,
                    });
                }
            }
            AgentEvent::Message { role, content } if role == "assistant" => {
                self.current_texts.push(content.clone());
                self.last_assistant_text = Some(self.current_texts.join("\n"));
            }
            AgentEvent::Result { .. } => {
                self.result = Some(event.clone());
            }
            AgentEvent::Error { message } => {
                self.errors.push(message.clone());
            }
            _ => {}
        }
        self.history.push(event);
        Ok(())
    }

    /// Settle the session once the event stream has ended.
    ///
    /// `exit_code` is the agent process status, when known.
    pub fn finish(&mut self, exit_code: Option<i32>) -> Result<AgentOutput, AgentError> {
        let outcome = self.settle(exit_code);
        self.termination = Some(match &outcome {
            Ok(_) => TerminationReason::Completed,
            Err(AgentError::TurnLimitExceeded { .. }) => TerminationReason::TurnLimitExceeded,
            Err(_) => TerminationReason::Error,
        });
        outcome
    }

    fn settle(&self, exit_code: Option<i32>) -> Result<AgentOutput, AgentError> {
        let (subtype, is_error, num_turns, result_text, cost) = match &self.result {
            Some(AgentEvent::Result {
                subtype,
                is_error,
                num_turns,
                text,
                total_cost_usd,
            }) => (
                Some(subtype.as_str()),
                *is_error,
                *num_turns,
                text.as_deref(),
                *total_cost_usd,
            ),
            _ => (None, false, None, None, None),
        };

        if subtype == Some("error_max_turns") {
            return Err(AgentError::TurnLimitExceeded {
                max_turns: self.max_turns,
                turns: num_turns.unwrap_or(self.turns),
            });
        }

        if let Some(message) = self.errors.last() {
            return Err(AgentError::provider(message.clone()));
        }

        if is_error {
            let detail = result_text.unwrap_or("no detail");
            return Err(AgentError::provider(format!(
                "agent returned error ({}): {detail}",
                subtype.unwrap_or("unknown")
            )));
        }

        let text = self.last_assistant_text.as_deref().or(result_text);
        let Some(text) = text else {
            return Err(match exit_code {
                Some(code) if code != 0 => {
                    AgentError::fatal(format!("agent exited with status {code} without output"))
                }
                _ => AgentError::MalformedOutput("agent produced no assistant message".to_string()),
            });
        };

        match parse_output(text) {
            Some(raw) => Ok(AgentOutput {
                raw,
                turns: num_turns.unwrap_or(self.turns),
                cost_usd: cost,
            }),
            None => Err(AgentError::MalformedOutput(
                "no JSON object found in final assistant message".to_string(),
            )),
        }
    }
}
