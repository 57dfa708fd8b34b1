use serde::{Deserialize, Serialize};

/// Run lifecycle states.
///
/// `pending → running → {success, error, timeout}`; a `pending` or `running`
/// run can additionally be forced to `interrupted` (cancel, `interrupt`
/// strategy) or `error` (`rollback` strategy). The four right-hand states are
/// terminal sinks: a terminal run is never mutated again.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Pending,
    Running,
    Success,
    Error,
    Timeout,
    Interrupted,
}

impl RunStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Success | Self::Error | Self::Timeout | Self::Interrupted)
    }

    /// A run counts against its thread's single active slot while in
    /// `pending` or `running`.
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Pending | Self::Running)
    }

    /// Whether a transition to `next` is legal. Transitions are monotonic
    /// toward the terminal set; backward and post-terminal moves are rejected.
    pub fn can_transition_to(&self, next: RunStatus) -> bool {
        match self {
            Self::Pending => matches!(
                next,
                Self::Running | Self::Error | Self::Interrupted
            ),
            Self::Running => matches!(
                next,
                Self::Success | Self::Error | Self::Timeout | Self::Interrupted
            ),
            _ => false,
        }
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Running => write!(f, "running"),
            Self::Success => write!(f, "success"),
            Self::Error => write!(f, "error"),
            Self::Timeout => write!(f, "timeout"),
            Self::Interrupted => write!(f, "interrupted"),
        }
    }
}

impl std::str::FromStr for RunStatus {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "running" => Ok(Self::Running),
            "success" => Ok(Self::Success),
            "error" => Ok(Self::Error),
            "timeout" => Ok(Self::Timeout),
            "interrupted" => Ok(Self::Interrupted),
            other => Err(format!("unknown run status: {other}")),
        }
    }
}

/// What to do when a run is requested on a thread that already owns an
/// active run.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MultitaskStrategy {
    /// Conflict error; nothing is created.
    #[default]
    Reject,
    /// Prior run is marked `interrupted`; the new run takes over.
    Interrupt,
    /// Prior run is marked `error` and discarded; the new run takes over.
    Rollback,
    /// New run is queued; execution stays one-at-a-time, earliest first.
    Enqueue,
}

impl std::fmt::Display for MultitaskStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Reject => write!(f, "reject"),
            Self::Interrupt => write!(f, "interrupt"),
            Self::Rollback => write!(f, "rollback"),
            Self::Enqueue => write!(f, "enqueue"),
        }
    }
}

impl std::str::FromStr for MultitaskStrategy {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "reject" => Ok(Self::Reject),
            "interrupt" => Ok(Self::Interrupt),
            "rollback" => Ok(Self::Rollback),
            "enqueue" => Ok(Self::Enqueue),
            other => Err(format!("unknown multitask strategy: {other}")),
        }
    }
}

/// Fate of an ephemeral thread once its stateless run reaches a terminal
/// state.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OnCompletion {
    #[default]
    Delete,
    Keep,
}

impl std::fmt::Display for OnCompletion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Delete => write!(f, "delete"),
            Self::Keep => write!(f, "keep"),
        }
    }
}

impl std::str::FromStr for OnCompletion {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "delete" => Ok(Self::Delete),
            "keep" => Ok(Self::Keep),
            other => Err(format!("unknown on_completion: {other}")),
        }
    }
}

/// Execution arguments carried by a run: the graph input, a config overlay
/// applied on top of the assistant's config, and the requested stream mode.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct RunKwargs {
    #[serde(default)]
    pub input: serde_json::Value,
    #[serde(default)]
    pub config: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stream_mode: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn terminal_states() {
        assert!(!RunStatus::Pending.is_terminal());
        assert!(!RunStatus::Running.is_terminal());
        assert!(RunStatus::Success.is_terminal());
        assert!(RunStatus::Error.is_terminal());
        assert!(RunStatus::Timeout.is_terminal());
        assert!(RunStatus::Interrupted.is_terminal());
    }

    #[test]
    fn active_states() {
        assert!(RunStatus::Pending.is_active());
        assert!(RunStatus::Running.is_active());
        assert!(!RunStatus::Success.is_active());
        assert!(!RunStatus::Interrupted.is_active());
    }

    #[test]
    fn forward_transitions_allowed() {
        assert!(RunStatus::Pending.can_transition_to(RunStatus::Running));
        assert!(RunStatus::Pending.can_transition_to(RunStatus::Interrupted));
        assert!(RunStatus::Pending.can_transition_to(RunStatus::Error));
        assert!(RunStatus::Running.can_transition_to(RunStatus::Success));
        assert!(RunStatus::Running.can_transition_to(RunStatus::Error));
        assert!(RunStatus::Running.can_transition_to(RunStatus::Timeout));
        assert!(RunStatus::Running.can_transition_to(RunStatus::Interrupted));
    }

    #[test]
    fn backward_transitions_rejected() {
        assert!(!RunStatus::Running.can_transition_to(RunStatus::Pending));
        assert!(!RunStatus::Pending.can_transition_to(RunStatus::Pending));
        // Pending cannot skip straight to success or timeout.
        assert!(!RunStatus::Pending.can_transition_to(RunStatus::Success));
        assert!(!RunStatus::Pending.can_transition_to(RunStatus::Timeout));
    }

    #[test]
    fn terminal_states_are_sinks() {
        for from in [
            RunStatus::Success,
            RunStatus::Error,
            RunStatus::Timeout,
            RunStatus::Interrupted,
        ] {
            for to in [
                RunStatus::Pending,
                RunStatus::Running,
                RunStatus::Success,
                RunStatus::Error,
                RunStatus::Timeout,
                RunStatus::Interrupted,
            ] {
                assert!(!from.can_transition_to(to), "{from} -> {to} must be rejected");
            }
        }
    }

    #[test]
    fn status_string_roundtrip() {
        for status in [
            RunStatus::Pending,
            RunStatus::Running,
            RunStatus::Success,
            RunStatus::Error,
            RunStatus::Timeout,
            RunStatus::Interrupted,
        ] {
            let parsed = RunStatus::from_str(&status.to_string()).unwrap();
            assert_eq!(status, parsed);
        }
    }

    #[test]
    fn strategy_string_roundtrip() {
        for strategy in [
            MultitaskStrategy::Reject,
            MultitaskStrategy::Interrupt,
            MultitaskStrategy::Rollback,
            MultitaskStrategy::Enqueue,
        ] {
            let parsed = MultitaskStrategy::from_str(&strategy.to_string()).unwrap();
            assert_eq!(strategy, parsed);
        }
    }

    #[test]
    fn default_strategy_is_reject() {
        assert_eq!(MultitaskStrategy::default(), MultitaskStrategy::Reject);
    }

    #[test]
    fn default_on_completion_is_delete() {
        assert_eq!(OnCompletion::default(), OnCompletion::Delete);
    }

    #[test]
    fn kwargs_default_deserializes_from_empty_object() {
        let kwargs: RunKwargs = serde_json::from_str("{}").unwrap();
        assert!(kwargs.input.is_null());
        assert!(kwargs.config.is_null());
        assert!(kwargs.stream_mode.is_none());
    }
}
