use std::collections::{HashMap, HashSet};

use regex::Regex;
use serde_json::Value;

use super::{ActivityState, AgentEvent, ArtifactType, EndReason, OutputStream};

/// How a tool name maps onto the specialised event families.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ToolClass {
    Write,
    Edit,
    Exec,
    Other,
}

impl ToolClass {
    /// Case-insensitive substring classification. Todo-list tools look like
    /// write tools by name but get generic events.
    pub fn classify(name: &str) -> ToolClass {
        let lower = name.to_ascii_lowercase();
        if lower.contains("todo") {
            return ToolClass::Other;
        }
        if lower.contains("edit") || lower.contains("replace") {
            return ToolClass::Edit;
        }
        if lower.contains("write") || lower.contains("create") {
            return ToolClass::Write;
        }
        if lower.contains("bash") || lower.contains("shell") || lower.contains("run") {
            return ToolClass::Exec;
        }
        ToolClass::Other
    }
}

#[derive(Debug, Clone)]
struct ActiveTool {
    name: String,
    class: ToolClass,
    input: Value,
}

/// Stateful translator from the agent's NDJSON stdout protocol to the
/// typed UI event stream.
///
/// Fed best-effort byte chunks; maintains a line buffer across chunk
/// boundaries. Non-JSON lines are discarded. All parse errors are local —
/// the translator never terminates itself.
pub struct EventTranslator {
    line_buffer: String,
    active_tools: HashMap<String, ActiveTool>,
    seen_tool_ids: HashSet<String>,
    thinking_buffer: Option<String>,
    text_emitted_this_turn: bool,
    activity: ActivityState,
    session_id: Option<String>,
    model: Option<String>,
    workspace_path: Option<String>,
    tools: Vec<String>,
    url_pattern: Regex,
    port_pattern: Regex,
}

impl Default for EventTranslator {
    fn default() -> Self {
        Self::new()
    }
}

impl EventTranslator {
    pub fn new() -> Self {
        Self {
            line_buffer: String::new(),
            active_tools: HashMap::new(),
            seen_tool_ids: HashSet::new(),
            thinking_buffer: None,
            text_emitted_this_turn: false,
            activity: ActivityState::Idle,
            session_id: None,
            model: None,
            workspace_path: None,
            tools: Vec::new(),
            url_pattern: Regex::new(r"https?://(?:localhost|127\.0\.0\.1)(?::\d+)?[^\s\x1b]*")
                .unwrap(),
            port_pattern: Regex::new(r"(?i)(?:listening|running|serving|started)[^\n]{0,40}?\bport\s+(\d{2,5})")
                .unwrap(),
        }
    }

    pub fn activity(&self) -> ActivityState {
        self.activity
    }

    /// A human message was written to the agent; a new turn begins and the
    /// next tool use without preceding text gets synthetic narration again.
    pub fn note_user_input(&mut self) {
        self.text_emitted_this_turn = false;
    }

    /// Feed a raw output chunk; returns the events it completes.
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<AgentEvent> {
        self.line_buffer.push_str(&String::from_utf8_lossy(chunk));

        let mut events = Vec::new();
        while let Some(newline) = self.line_buffer.find('\n') {
            let line: String = self.line_buffer.drain(..=newline).collect();
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            match serde_json::from_str::<Value>(line) {
                Ok(message) => self.translate(&message, &mut events),
                // Interleaved non-JSON output (TUI noise, stack traces) is
                // expected and dropped here; raw-terminal subscribers still
                // see it verbatim.
                Err(_) => continue,
            }
        }

        for event in &events {
            if let Some(next) = ActivityState::transition(event) {
                self.activity = next;
            }
        }
        events
    }

    fn translate(&mut self, message: &Value, out: &mut Vec<AgentEvent>) {
        let msg_type = message.get("type").and_then(Value::as_str).unwrap_or("");
        match msg_type {
            "system" => self.on_system(message, out),
            "assistant" => self.on_assistant(message, out),
            "user" => self.on_user(message, out),
            "result" => self.on_result(message, out),
            // Echo of the human input line the edge wrote to the PTY.
            "human" => self.note_user_input(),
            _ => {}
        }
    }

    fn on_system(&mut self, message: &Value, out: &mut Vec<AgentEvent>) {
        if message.get("subtype").and_then(Value::as_str) != Some("init") {
            return;
        }
        self.session_id = message
            .get("session_id")
            .and_then(Value::as_str)
            .map(String::from);
        self.model = message.get("model").and_then(Value::as_str).map(String::from);
        self.workspace_path = message.get("cwd").and_then(Value::as_str).map(String::from);
        self.tools = message
            .get("tools")
            .and_then(Value::as_array)
            .map(|a| {
                a.iter()
                    .filter_map(Value::as_str)
                    .map(String::from)
                    .collect()
            })
            .unwrap_or_default();

        out.push(AgentEvent::SessionStarted {
            session_id: self.session_id.clone().unwrap_or_default(),
            workspace_path: self.workspace_path.clone().unwrap_or_default(),
            model: self.model.clone().unwrap_or_default(),
            tools: self.tools.clone(),
        });
    }

    fn on_assistant(&mut self, message: &Value, out: &mut Vec<AgentEvent>) {
        // Two wire shapes: flat `{type, subtype, …fields}` and nested
        // `{type, message: {content: [blocks]}}`.
        if let Some(blocks) = message
            .get("message")
            .and_then(|m| m.get("content"))
            .and_then(Value::as_array)
        {
            for block in blocks.clone() {
                self.on_content_block(&block, out);
            }
            return;
        }

        match message.get("subtype").and_then(Value::as_str) {
            Some("text") => self.on_text(message, out),
            Some("thinking") => self.on_thinking(message),
            Some("tool_use") => self.on_tool_use(message, out),
            _ => {}
        }
    }

    fn on_content_block(&mut self, block: &Value, out: &mut Vec<AgentEvent>) {
        match block.get("type").and_then(Value::as_str) {
            Some("text") => self.on_text(block, out),
            Some("thinking") => self.on_thinking(block),
            Some("tool_use") => self.on_tool_use(block, out),
            Some("tool_result") => self.on_tool_result(block, out),
            _ => {}
        }
    }

    fn on_text(&mut self, message: &Value, out: &mut Vec<AgentEvent>) {
        self.close_thinking(out);
        let text = message
            .get("text")
            .and_then(Value::as_str)
            .unwrap_or_default();
        if text.is_empty() {
            return;
        }
        self.text_emitted_this_turn = true;
        out.push(AgentEvent::TextBlock { text: text.into() });
    }

    fn on_thinking(&mut self, message: &Value) {
        let text = message
            .get("text")
            .or_else(|| message.get("thinking"))
            .and_then(Value::as_str)
            .unwrap_or_default();
        match &mut self.thinking_buffer {
            Some(buffer) => buffer.push_str(text),
            None => self.thinking_buffer = Some(text.to_string()),
        }
    }

    fn close_thinking(&mut self, out: &mut Vec<AgentEvent>) {
        if let Some(text) = self.thinking_buffer.take() {
            if !text.is_empty() {
                out.push(AgentEvent::ThinkingBlock { text });
            }
        }
    }

    fn on_tool_use(&mut self, message: &Value, out: &mut Vec<AgentEvent>) {
        self.close_thinking(out);

        let id = match message.get("id").and_then(Value::as_str) {
            Some(id) => id.to_string(),
            None => return,
        };
        // Each id is processed at most once end-to-end.
        if !self.seen_tool_ids.insert(id.clone()) {
            return;
        }

        let name = message
            .get("name")
            .and_then(Value::as_str)
            .unwrap_or("unknown")
            .to_string();
        let input = message.get("input").cloned().unwrap_or(Value::Null);
        let class = ToolClass::classify(&name);

        if !self.text_emitted_this_turn {
            out.push(AgentEvent::TextBlock {
                text: narration(class, &name, &input),
            });
            self.text_emitted_this_turn = true;
        }

        match class {
            ToolClass::Write => {
                let path = string_field(&input, &["file_path", "path"]);
                out.push(AgentEvent::FileWriteStart {
                    id: id.clone(),
                    path,
                });
                let content = string_field(&input, &["content", "text"]);
                if !content.is_empty() {
                    out.push(AgentEvent::FileWriteChunk {
                        id: id.clone(),
                        content,
                    });
                }
            }
            ToolClass::Edit => {
                let path = string_field(&input, &["file_path", "path"]);
                out.push(AgentEvent::FileEditStart {
                    id: id.clone(),
                    path,
                });
                out.push(AgentEvent::FileEditDiff {
                    id: id.clone(),
                    old_text: string_field(&input, &["old_string", "old_text", "old"]),
                    new_text: string_field(&input, &["new_string", "new_text", "new"]),
                });
            }
            ToolClass::Exec => {
                out.push(AgentEvent::CommandStart {
                    id: id.clone(),
                    command: string_field(&input, &["command", "cmd"]),
                });
            }
            ToolClass::Other => {
                out.push(AgentEvent::ToolStart {
                    id: id.clone(),
                    name: name.clone(),
                    input: input.clone(),
                });
            }
        }

        self.active_tools.insert(id, ActiveTool { name, class, input });
    }

    fn on_user(&mut self, message: &Value, out: &mut Vec<AgentEvent>) {
        if let Some(blocks) = message
            .get("message")
            .and_then(|m| m.get("content"))
            .and_then(Value::as_array)
        {
            for block in blocks.clone() {
                self.on_content_block(&block, out);
            }
            return;
        }
        if message.get("subtype").and_then(Value::as_str) == Some("tool_result")
            || message.get("tool_use_id").is_some()
        {
            self.on_tool_result(message, out);
        }
    }

    fn on_tool_result(&mut self, message: &Value, out: &mut Vec<AgentEvent>) {
        self.close_thinking(out);

        let id = match message.get("tool_use_id").and_then(Value::as_str) {
            Some(id) => id.to_string(),
            None => return,
        };
        // Results are honoured only while their id is active, once.
        let tool = match self.active_tools.remove(&id) {
            Some(tool) => tool,
            None => return,
        };

        let is_error = message
            .get("is_error")
            .and_then(Value::as_bool)
            .unwrap_or(false);
        let content = result_content(message);
        tracing::trace!(tool = %tool.name, id = %id, is_error, "tool result");

        match tool.class {
            ToolClass::Write => out.push(AgentEvent::FileWriteEnd {
                id,
                success: !is_error,
            }),
            ToolClass::Edit => out.push(AgentEvent::FileEditEnd {
                id,
                success: !is_error,
            }),
            ToolClass::Exec => {
                if !content.is_empty() {
                    out.push(AgentEvent::CommandOutput {
                        id: id.clone(),
                        output: content.clone(),
                        stream: if is_error {
                            OutputStream::Stderr
                        } else {
                            OutputStream::Stdout
                        },
                    });
                }
                out.push(AgentEvent::CommandEnd {
                    id,
                    exit_code: if is_error { 1 } else { 0 },
                });
                if !is_error {
                    self.detect_artifact(&tool, &content, out);
                }
            }
            ToolClass::Other => out.push(AgentEvent::ToolEnd {
                id,
                output: content,
                is_error,
            }),
        }
    }

    /// Scan an exec result for a dev-server URL or "listening on port N"
    /// announcement.
    fn detect_artifact(&self, tool: &ActiveTool, output: &str, out: &mut Vec<AgentEvent>) {
        let url = if let Some(m) = self.url_pattern.find(output) {
            Some(m.as_str().trim_end_matches(['.', ',', ')']).to_string())
        } else {
            self.port_pattern
                .captures(output)
                .and_then(|c| c.get(1))
                .map(|port| format!("http://localhost:{}", port.as_str()))
        };

        let Some(url) = url else { return };

        let command = string_field(&tool.input, &["command", "cmd"]).to_ascii_lowercase();
        let artifact_type = if command.contains("react")
            || command.contains("vite")
            || command.contains("next")
            || command.contains("npm start")
        {
            ArtifactType::ReactApp
        } else {
            ArtifactType::WebApp
        };

        out.push(AgentEvent::ArtifactDetected { url: url.clone() });
        out.push(AgentEvent::ArtifactReady { url, artifact_type });
    }

    fn on_result(&mut self, message: &Value, out: &mut Vec<AgentEvent>) {
        self.close_thinking(out);
        out.push(AgentEvent::MessageEnd);

        let is_error = message
            .get("is_error")
            .and_then(Value::as_bool)
            .unwrap_or(false)
            || message.get("subtype").and_then(Value::as_str) == Some("error");

        out.push(AgentEvent::SessionEnded {
            reason: if is_error {
                EndReason::Error
            } else {
                EndReason::User
            },
        });

        let cost_usd = message
            .get("cost_usd")
            .or_else(|| message.get("total_cost_usd"))
            .and_then(Value::as_f64);
        if let Some(cost_usd) = cost_usd {
            let usage = message.get("usage");
            out.push(AgentEvent::Usage {
                input_tokens: usage
                    .and_then(|u| u.get("input_tokens"))
                    .and_then(Value::as_u64)
                    .unwrap_or(0),
                output_tokens: usage
                    .and_then(|u| u.get("output_tokens"))
                    .and_then(Value::as_u64)
                    .unwrap_or(0),
                cost_usd,
                duration_ms: message
                    .get("duration_ms")
                    .and_then(Value::as_u64)
                    .unwrap_or(0),
                num_turns: message.get("num_turns").and_then(Value::as_u64).unwrap_or(0),
            });
        }

        self.text_emitted_this_turn = false;
    }
}

/// One-sentence narrative shown before tool execution when the model
/// produced no text this turn.
fn narration(class: ToolClass, name: &str, input: &Value) -> String {
    match class {
        ToolClass::Write => {
            let path = string_field(input, &["file_path", "path"]);
            if path.is_empty() {
                "I'll create a file.".to_string()
            } else {
                format!("I'll create {path}.")
            }
        }
        ToolClass::Edit => {
            let path = string_field(input, &["file_path", "path"]);
            if path.is_empty() {
                "I'll update a file.".to_string()
            } else {
                format!("I'll update {path}.")
            }
        }
        ToolClass::Exec => {
            let command = string_field(input, &["command", "cmd"]);
            let short: String = command.chars().take(60).collect();
            if short.is_empty() {
                "I'll run a command.".to_string()
            } else {
                format!("I'll run `{short}`.")
            }
        }
        ToolClass::Other => format!("I'll use the {name} tool."),
    }
}

fn string_field(value: &Value, keys: &[&str]) -> String {
    for key in keys {
        if let Some(s) = value.get(key).and_then(Value::as_str) {
            return s.to_string();
        }
    }
    String::new()
}

/// Tool-result content is either a plain string or an array of text blocks.
fn result_content(message: &Value) -> String {
    match message.get("content") {
        Some(Value::String(s)) => s.clone(),
        Some(Value::Array(blocks)) => blocks
            .iter()
            .filter_map(|b| {
                b.get("text")
                    .and_then(Value::as_str)
                    .or_else(|| b.as_str())
            })
            .collect::<Vec<_>>()
            .join(""),
        _ => String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn feed_lines(translator: &mut EventTranslator, lines: &[&str]) -> Vec<AgentEvent> {
        let mut events = Vec::new();
        for line in lines {
            events.extend(translator.feed(format!("{line}\n").as_bytes()));
        }
        events
    }

    #[test]
    fn classification_matches_tool_families() {
        assert_eq!(ToolClass::classify("Write"), ToolClass::Write);
        assert_eq!(ToolClass::classify("create_file"), ToolClass::Write);
        assert_eq!(ToolClass::classify("str_replace_editor"), ToolClass::Edit);
        assert_eq!(ToolClass::classify("Edit"), ToolClass::Edit);
        assert_eq!(ToolClass::classify("bash"), ToolClass::Exec);
        assert_eq!(ToolClass::classify("run_shell_command"), ToolClass::Exec);
        assert_eq!(ToolClass::classify("TodoWrite"), ToolClass::Other);
        assert_eq!(ToolClass::classify("WebSearch"), ToolClass::Other);
    }

    #[test]
    fn exec_round_trip_emits_specialised_events_only() {
        let mut translator = EventTranslator::new();
        let events = feed_lines(
            &mut translator,
            &[
                r#"{"type":"system","subtype":"init","session_id":"S","tools":["bash"],"model":"m","cwd":"/w"}"#,
                r#"{"type":"assistant","subtype":"tool_use","id":"t1","name":"bash","input":{"command":"echo hi"}}"#,
                r#"{"type":"user","subtype":"tool_result","tool_use_id":"t1","content":"hi\n","is_error":false}"#,
                r#"{"type":"result","is_error":false,"cost_usd":0.01,"duration_ms":100,"num_turns":1}"#,
            ],
        );

        assert_eq!(
            events[0],
            AgentEvent::SessionStarted {
                session_id: "S".into(),
                workspace_path: "/w".into(),
                model: "m".into(),
                tools: vec!["bash".into()],
            }
        );
        // Synthetic narration: no text preceded the tool use this turn.
        assert!(matches!(&events[1], AgentEvent::TextBlock { text } if text.contains("echo hi")));
        assert_eq!(
            events[2],
            AgentEvent::CommandStart {
                id: "t1".into(),
                command: "echo hi".into()
            }
        );
        assert_eq!(
            events[3],
            AgentEvent::CommandOutput {
                id: "t1".into(),
                output: "hi\n".into(),
                stream: OutputStream::Stdout,
            }
        );
        assert_eq!(
            events[4],
            AgentEvent::CommandEnd {
                id: "t1".into(),
                exit_code: 0
            }
        );
        assert_eq!(events[5], AgentEvent::MessageEnd);
        assert_eq!(
            events[6],
            AgentEvent::SessionEnded {
                reason: EndReason::User
            }
        );
        assert!(
            !events
                .iter()
                .any(|e| matches!(e, AgentEvent::ToolStart { .. } | AgentEvent::ToolEnd { .. }))
        );
    }

    #[test]
    fn split_chunks_reassemble_into_lines() {
        let mut translator = EventTranslator::new();
        let line = r#"{"type":"assistant","subtype":"text","text":"hello"}"#;
        let (a, b) = line.split_at(20);
        assert!(translator.feed(a.as_bytes()).is_empty());
        let mut events = translator.feed(b.as_bytes());
        assert!(events.is_empty());
        events.extend(translator.feed(b"\n"));
        assert_eq!(
            events,
            vec![AgentEvent::TextBlock {
                text: "hello".into()
            }]
        );
    }

    #[test]
    fn non_json_lines_are_discarded() {
        let mut translator = EventTranslator::new();
        let events = feed_lines(
            &mut translator,
            &[
                "some terminal noise",
                "\u{1b}[2Jclear screen",
                r#"{"type":"assistant","subtype":"text","text":"ok"}"#,
            ],
        );
        assert_eq!(events.len(), 1);
    }

    #[test]
    fn thinking_coalesces_until_non_thinking_event() {
        let mut translator = EventTranslator::new();
        let events = feed_lines(
            &mut translator,
            &[
                r#"{"type":"assistant","subtype":"thinking","text":"part one "}"#,
                r#"{"type":"assistant","subtype":"thinking","text":"part two"}"#,
                r#"{"type":"assistant","subtype":"text","text":"answer"}"#,
            ],
        );
        assert_eq!(
            events,
            vec![
                AgentEvent::ThinkingBlock {
                    text: "part one part two".into()
                },
                AgentEvent::TextBlock {
                    text: "answer".into()
                },
            ]
        );
    }

    #[test]
    fn duplicate_tool_use_ids_are_dropped() {
        let mut translator = EventTranslator::new();
        let line =
            r#"{"type":"assistant","subtype":"tool_use","id":"t1","name":"bash","input":{"command":"ls"}}"#;
        let events = feed_lines(&mut translator, &[line, line]);
        let starts = events
            .iter()
            .filter(|e| matches!(e, AgentEvent::CommandStart { .. }))
            .count();
        assert_eq!(starts, 1);
    }

    #[test]
    fn tool_result_without_active_id_is_ignored() {
        let mut translator = EventTranslator::new();
        let events = feed_lines(
            &mut translator,
            &[r#"{"type":"user","subtype":"tool_result","tool_use_id":"ghost","content":"x"}"#],
        );
        assert!(events.is_empty());
    }

    #[test]
    fn tool_result_is_honoured_at_most_once() {
        let mut translator = EventTranslator::new();
        let result =
            r#"{"type":"user","subtype":"tool_result","tool_use_id":"t1","content":"done"}"#;
        let events = feed_lines(
            &mut translator,
            &[
                r#"{"type":"assistant","subtype":"tool_use","id":"t1","name":"bash","input":{"command":"ls"}}"#,
                result,
                result,
            ],
        );
        let ends = events
            .iter()
            .filter(|e| matches!(e, AgentEvent::CommandEnd { .. }))
            .count();
        assert_eq!(ends, 1);
    }

    #[test]
    fn write_tool_emits_file_events_with_chunk() {
        let mut translator = EventTranslator::new();
        let events = feed_lines(
            &mut translator,
            &[
                r#"{"type":"assistant","subtype":"text","text":"Creating the file now."}"#,
                r#"{"type":"assistant","subtype":"tool_use","id":"w1","name":"write_file","input":{"file_path":"a.txt","content":"hello"}}"#,
                r#"{"type":"user","subtype":"tool_result","tool_use_id":"w1","content":"ok","is_error":false}"#,
            ],
        );
        assert_eq!(
            events,
            vec![
                AgentEvent::TextBlock {
                    text: "Creating the file now.".into()
                },
                AgentEvent::FileWriteStart {
                    id: "w1".into(),
                    path: "a.txt".into()
                },
                AgentEvent::FileWriteChunk {
                    id: "w1".into(),
                    content: "hello".into()
                },
                AgentEvent::FileWriteEnd {
                    id: "w1".into(),
                    success: true
                },
            ]
        );
    }

    #[test]
    fn edit_tool_emits_diff() {
        let mut translator = EventTranslator::new();
        let events = feed_lines(
            &mut translator,
            &[
                r#"{"type":"assistant","subtype":"tool_use","id":"e1","name":"edit","input":{"file_path":"m.rs","old_string":"a","new_string":"b"}}"#,
            ],
        );
        assert!(matches!(&events[0], AgentEvent::TextBlock { .. }));
        assert_eq!(
            events[1],
            AgentEvent::FileEditStart {
                id: "e1".into(),
                path: "m.rs".into()
            }
        );
        assert_eq!(
            events[2],
            AgentEvent::FileEditDiff {
                id: "e1".into(),
                old_text: "a".into(),
                new_text: "b".into()
            }
        );
    }

    #[test]
    fn nested_message_content_blocks_are_walked() {
        let mut translator = EventTranslator::new();
        let events = feed_lines(
            &mut translator,
            &[
                r#"{"type":"assistant","message":{"content":[{"type":"text","text":"hi"},{"type":"tool_use","id":"t1","name":"bash","input":{"command":"pwd"}}]}}"#,
            ],
        );
        assert_eq!(events.len(), 2);
        assert!(matches!(&events[0], AgentEvent::TextBlock { text } if text == "hi"));
        assert!(matches!(&events[1], AgentEvent::CommandStart { .. }));
    }

    #[test]
    fn artifact_detected_from_server_output() {
        let mut translator = EventTranslator::new();
        let events = feed_lines(
            &mut translator,
            &[
                r#"{"type":"assistant","subtype":"tool_use","id":"t1","name":"bash","input":{"command":"npm run vite"}}"#,
                r#"{"type":"user","subtype":"tool_result","tool_use_id":"t1","content":"  Local: http://localhost:5173/","is_error":false}"#,
            ],
        );
        assert!(events.iter().any(|e| matches!(
            e,
            AgentEvent::ArtifactDetected { url } if url.starts_with("http://localhost:5173")
        )));
        assert!(events.iter().any(|e| matches!(
            e,
            AgentEvent::ArtifactReady { artifact_type: ArtifactType::ReactApp, .. }
        )));
    }

    #[test]
    fn artifact_from_port_announcement_without_url() {
        let mut translator = EventTranslator::new();
        let events = feed_lines(
            &mut translator,
            &[
                r#"{"type":"assistant","subtype":"tool_use","id":"t1","name":"bash","input":{"command":"python -m http.server 8000"}}"#,
                r#"{"type":"user","subtype":"tool_result","tool_use_id":"t1","content":"Serving HTTP on 0.0.0.0 port 8000 ...","is_error":false}"#,
            ],
        );
        assert!(events.iter().any(|e| matches!(
            e,
            AgentEvent::ArtifactReady { url, artifact_type: ArtifactType::WebApp }
                if url == "http://localhost:8000"
        )));
    }

    #[test]
    fn error_result_ends_session_with_error_reason() {
        let mut translator = EventTranslator::new();
        let events = feed_lines(
            &mut translator,
            &[r#"{"type":"result","is_error":true,"cost_usd":0.0}"#],
        );
        assert!(events.contains(&AgentEvent::SessionEnded {
            reason: EndReason::Error
        }));
    }

    #[test]
    fn narration_resets_each_turn() {
        let mut translator = EventTranslator::new();
        let tool =
            r#"{"type":"assistant","subtype":"tool_use","id":"ID","name":"bash","input":{"command":"ls"}}"#;
        let events = feed_lines(&mut translator, &[&tool.replace("ID", "t1")]);
        assert!(matches!(&events[0], AgentEvent::TextBlock { .. }));

        // Same turn: no new narration.
        let events = feed_lines(&mut translator, &[&tool.replace("ID", "t2")]);
        assert!(matches!(&events[0], AgentEvent::CommandStart { .. }));

        // New turn after user input: narration returns.
        translator.note_user_input();
        let events = feed_lines(&mut translator, &[&tool.replace("ID", "t3")]);
        assert!(matches!(&events[0], AgentEvent::TextBlock { .. }));
    }

    #[test]
    fn activity_tracks_event_stream() {
        let mut translator = EventTranslator::new();
        assert_eq!(translator.activity(), ActivityState::Idle);
        feed_lines(
            &mut translator,
            &[r#"{"type":"assistant","subtype":"tool_use","id":"t1","name":"bash","input":{"command":"ls"}}"#],
        );
        assert_eq!(translator.activity(), ActivityState::Executing);
        feed_lines(
            &mut translator,
            &[r#"{"type":"user","subtype":"tool_result","tool_use_id":"t1","content":""}"#],
        );
        assert_eq!(translator.activity(), ActivityState::Idle);
    }
}
