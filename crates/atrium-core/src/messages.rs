use serde::{Deserialize, Serialize};

use crate::ids::ToolCallId;
use crate::tokens::TokenUsage;

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(tag = "role")]
pub enum Message {
    #[serde(rename = "user")]
    User(UserMessage),
    #[serde(rename = "assistant")]
    Assistant(AssistantMessage),
    #[serde(rename = "tool_result")]
    ToolResult(ToolResultMessage),
    /// Produced by compaction; stands in for everything it replaced.
    #[serde(rename = "summary")]
    Summary(SummaryMessage),
}

/// Where a user-role input came from. Only `User` is typed by a person.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum InputOrigin {
    #[default]
    User,
    ScheduledTask,
    ResumePreamble,
    TaskCallback,
    /// Reminder injected when a running workflow answered without calling a tool.
    ToolEnforcement,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct UserMessage {
    pub text: String,
    #[serde(default)]
    pub origin: InputOrigin,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct AssistantMessage {
    pub content: Vec<AssistantContent>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub usage: Option<TokenUsage>,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct ToolResultMessage {
    pub tool_call_id: ToolCallId,
    pub content: String,
    #[serde(default)]
    pub is_error: bool,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct SummaryMessage {
    pub text: String,
    pub replaced_messages: usize,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type")]
pub enum AssistantContent {
    #[serde(rename = "text")]
    Text { text: String },
    #[serde(rename = "tool_call")]
    ToolCall(ToolCallBlock),
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct ToolCallBlock {
    pub id: ToolCallId,
    pub name: String,
    pub arguments: serde_json::Value,
}

impl ToolCallBlock {
    pub fn new(name: impl Into<String>, arguments: serde_json::Value) -> Self {
        Self {
            id: ToolCallId::new(),
            name: name.into(),
            arguments,
        }
    }
}

// --- Convenience constructors ---

impl Message {
    pub fn user_text(text: impl Into<String>) -> Self {
        Message::User(UserMessage {
            text: text.into(),
            origin: InputOrigin::User,
        })
    }

    pub fn input(text: impl Into<String>, origin: InputOrigin) -> Self {
        Message::User(UserMessage {
            text: text.into(),
            origin,
        })
    }

    pub fn assistant_text(text: impl Into<String>) -> Self {
        Message::Assistant(AssistantMessage::text(text))
    }

    pub fn tool_result(tool_call_id: ToolCallId, content: impl Into<String>, is_error: bool) -> Self {
        Message::ToolResult(ToolResultMessage {
            tool_call_id,
            content: content.into(),
            is_error,
        })
    }

    pub fn summary(text: impl Into<String>, replaced_messages: usize) -> Self {
        Message::Summary(SummaryMessage {
            text: text.into(),
            replaced_messages,
        })
    }

    /// Plain text carried by the message, regardless of role.
    pub fn text(&self) -> String {
        match self {
            Message::User(m) => m.text.clone(),
            Message::Assistant(m) => m.text_content(),
            Message::ToolResult(m) => m.content.clone(),
            Message::Summary(m) => m.text.clone(),
        }
    }

    pub fn role(&self) -> &'static str {
        match self {
            Message::User(_) => "user",
            Message::Assistant(_) => "assistant",
            Message::ToolResult(_) => "tool_result",
            Message::Summary(_) => "summary",
        }
    }
}

impl AssistantMessage {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            content: vec![AssistantContent::Text { text: text.into() }],
            usage: None,
        }
    }

    pub fn with_tool_calls(text: Option<String>, calls: Vec<ToolCallBlock>) -> Self {
        let mut content = Vec::with_capacity(calls.len() + 1);
        if let Some(text) = text.filter(|t| !t.is_empty()) {
            content.push(AssistantContent::Text { text });
        }
        content.extend(calls.into_iter().map(AssistantContent::ToolCall));
        Self {
            content,
            usage: None,
        }
    }

    pub fn with_usage(mut self, usage: TokenUsage) -> Self {
        self.usage = Some(usage);
        self
    }

    pub fn tool_calls(&self) -> Vec<&ToolCallBlock> {
        self.content
            .iter()
            .filter_map(|c| match c {
                AssistantContent::ToolCall(tc) => Some(tc),
                AssistantContent::Text { .. } => None,
            })
            .collect()
    }

    pub fn text_content(&self) -> String {
        self.content
            .iter()
            .filter_map(|c| match c {
                AssistantContent::Text { text } => Some(text.as_str()),
                AssistantContent::ToolCall(_) => None,
            })
            .collect::<Vec<_>>()
            .join("")
    }

    pub fn has_tool_calls(&self) -> bool {
        self.content
            .iter()
            .any(|c| matches!(c, AssistantContent::ToolCall(_)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn user_text_message() {
        let msg = Message::user_text("hello");
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["role"], "user");
        assert_eq!(json["text"], "hello");
        assert_eq!(json["origin"], "user");
    }

    #[test]
    fn origin_defaults_to_user_when_absent() {
        let msg: Message = serde_json::from_str(r#"{"role":"user","text":"hi"}"#).unwrap();
        match msg {
            Message::User(m) => assert_eq!(m.origin, InputOrigin::User),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn assistant_tool_calls_extracted() {
        let call = ToolCallBlock::new("update_checklist_step", serde_json::json!({"step_id": "a"}));
        let msg = AssistantMessage::with_tool_calls(Some("checking".into()), vec![call]);
        assert!(msg.has_tool_calls());
        assert_eq!(msg.tool_calls().len(), 1);
        assert_eq!(msg.tool_calls()[0].name, "update_checklist_step");
        assert_eq!(msg.text_content(), "checking");
    }

    #[test]
    fn empty_text_is_dropped_from_tool_call_message() {
        let msg = AssistantMessage::with_tool_calls(Some(String::new()), vec![ToolCallBlock::new("x", serde_json::json!({}))]);
        assert_eq!(msg.content.len(), 1);
    }

    #[test]
    fn summary_serializes_with_role() {
        let json = serde_json::to_value(Message::summary("so far", 12)).unwrap();
        assert_eq!(json["role"], "summary");
        assert_eq!(json["replaced_messages"], 12);
    }

    #[test]
    fn text_across_roles() {
        assert_eq!(Message::assistant_text("a").text(), "a");
        assert_eq!(Message::tool_result(ToolCallId::new(), "r", false).text(), "r");
        assert_eq!(Message::input("cb", InputOrigin::TaskCallback).role(), "user");
    }
}
