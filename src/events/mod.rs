pub mod translator;

use serde::Serialize;

/// Typed events delivered to UI subscribers, derived from the agent's
/// NDJSON stdout protocol. Serialized form is what goes over the events
/// WebSocket.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AgentEvent {
    SessionStarted {
        session_id: String,
        workspace_path: String,
        model: String,
        tools: Vec<String>,
    },
    TextBlock {
        text: String,
    },
    ThinkingBlock {
        text: String,
    },
    FileWriteStart {
        id: String,
        path: String,
    },
    FileWriteChunk {
        id: String,
        content: String,
    },
    FileWriteEnd {
        id: String,
        success: bool,
    },
    FileEditStart {
        id: String,
        path: String,
    },
    FileEditDiff {
        id: String,
        old_text: String,
        new_text: String,
    },
    FileEditEnd {
        id: String,
        success: bool,
    },
    CommandStart {
        id: String,
        command: String,
    },
    CommandOutput {
        id: String,
        output: String,
        stream: OutputStream,
    },
    CommandEnd {
        id: String,
        exit_code: i32,
    },
    ToolStart {
        id: String,
        name: String,
        input: serde_json::Value,
    },
    ToolEnd {
        id: String,
        output: String,
        is_error: bool,
    },
    ArtifactDetected {
        url: String,
    },
    ArtifactReady {
        url: String,
        artifact_type: ArtifactType,
    },
    Usage {
        input_tokens: u64,
        output_tokens: u64,
        cost_usd: f64,
        duration_ms: u64,
        num_turns: u64,
    },
    MessageEnd,
    SessionEnded {
        reason: EndReason,
    },
    Error {
        message: String,
    },
    RawOutput {
        data: String,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputStream {
    Stdout,
    Stderr,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ArtifactType {
    ReactApp,
    WebApp,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EndReason {
    User,
    Error,
}

/// Coarse session activity shown in admin listings. Driven by the emitted
/// event kinds, never by timers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ActivityState {
    #[default]
    Idle,
    Thinking,
    Writing,
    Editing,
    Executing,
    Artifact,
    Error,
}

impl ActivityState {
    /// The activity implied by an event, if it changes the current one.
    pub fn transition(event: &AgentEvent) -> Option<ActivityState> {
        match event {
            AgentEvent::ThinkingBlock { .. } => Some(ActivityState::Thinking),
            AgentEvent::FileWriteStart { .. } => Some(ActivityState::Writing),
            AgentEvent::FileEditStart { .. } => Some(ActivityState::Editing),
            AgentEvent::CommandStart { .. } | AgentEvent::ToolStart { .. } => {
                Some(ActivityState::Executing)
            }
            AgentEvent::ArtifactReady { .. } => Some(ActivityState::Artifact),
            AgentEvent::Error { .. } => Some(ActivityState::Error),
            AgentEvent::FileWriteEnd { .. }
            | AgentEvent::FileEditEnd { .. }
            | AgentEvent::CommandEnd { .. }
            | AgentEvent::ToolEnd { .. }
            | AgentEvent::MessageEnd
            | AgentEvent::SessionEnded { .. } => Some(ActivityState::Idle),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn events_serialize_with_snake_case_tags() {
        let event = AgentEvent::FileWriteStart {
            id: "t1".into(),
            path: "src/main.rs".into(),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "file_write_start");
        assert_eq!(json["path"], "src/main.rs");
    }

    #[test]
    fn session_ended_reason_serializes_lowercase() {
        let json = serde_json::to_value(AgentEvent::SessionEnded {
            reason: EndReason::User,
        })
        .unwrap();
        assert_eq!(json["reason"], "user");
    }

    #[test]
    fn artifact_type_uses_kebab_case() {
        let json = serde_json::to_value(AgentEvent::ArtifactReady {
            url: "http://localhost:3000".into(),
            artifact_type: ArtifactType::ReactApp,
        })
        .unwrap();
        assert_eq!(json["artifact_type"], "react-app");
    }

    #[test]
    fn activity_follows_specialised_tool_lifecycle() {
        let start = AgentEvent::CommandStart {
            id: "t1".into(),
            command: "ls".into(),
        };
        let end = AgentEvent::CommandEnd {
            id: "t1".into(),
            exit_code: 0,
        };
        assert_eq!(
            ActivityState::transition(&start),
            Some(ActivityState::Executing)
        );
        assert_eq!(ActivityState::transition(&end), Some(ActivityState::Idle));
    }
}
