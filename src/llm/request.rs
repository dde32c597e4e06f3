//! Request builder - assembles the outgoing messages payload
//!
//! Applies the cache-marking policy (at most one tool, one system block, two
//! user-message breakpoints), trims the tail so the request ends on a user
//! turn, and picks per-model token/temperature defaults.

use serde::Serialize;

use super::types::{
    CacheControl, ContentBlock, LLMError, Message, RequestParams, Role, ToolChoice,
    ToolDefinition,
};

pub const SONNET4_MAX_TOKENS: u32 = 10_000;
pub const SONNET4_THINKING_BUDGET: u32 = 5_000;
pub const THINKING_MAX_TOKENS: u32 = 25_000;
pub const THINKING_BUDGET: u32 = 15_000;
pub const DEFAULT_MAX_TOKENS: u32 = 8_000;

const THINKING_TEMPERATURE: f32 = 1.0;
const DEFAULT_TEMPERATURE: f32 = 0.2;

/// System prompt block on the wire
#[derive(Debug, Clone, Serialize)]
pub struct SystemBlock {
    pub r#type: String,
    pub text: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cache_control: Option<CacheControl>,
}

impl SystemBlock {
    pub fn text(body: impl Into<String>) -> Self {
        Self {
            r#type: "text".to_string(),
            text: body.into(),
            cache_control: None,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ApiMessage {
    pub role: Role,
    pub content: Vec<ContentBlock>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ApiTool {
    pub name: String,
    pub description: String,
    pub input_schema: serde_json::Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cache_control: Option<CacheControl>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ThinkingConfig {
    pub r#type: String,
    pub budget_tokens: u32,
}

impl ThinkingConfig {
    pub fn enabled(budget_tokens: u32) -> Self {
        Self {
            r#type: "enabled".to_string(),
            budget_tokens,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ToolChoiceWire {
    Auto,
    Any,
    Tool { name: String },
}

/// Complete outgoing request payload
#[derive(Debug, Clone, Serialize)]
pub struct ApiRequest {
    pub model: String,
    pub max_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub system: Vec<SystemBlock>,
    pub messages: Vec<ApiMessage>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub tools: Vec<ApiTool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_choice: Option<ToolChoiceWire>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub thinking: Option<ThinkingConfig>,
    pub stream: bool,
}

/// Sonnet generation 4 gets its own token budget
fn is_sonnet4(model: &str) -> bool {
    model.contains("sonnet-4")
}

/// (max_tokens, temperature, thinking budget) per model family
fn resolve_tuning(params: &RequestParams) -> (u32, f32, Option<u32>) {
    if is_sonnet4(&params.model) {
        let thinking = params
            .use_thinking
            .then(|| params.thinking_budget.unwrap_or(SONNET4_THINKING_BUDGET));
        let temperature = if thinking.is_some() {
            THINKING_TEMPERATURE
        } else {
            DEFAULT_TEMPERATURE
        };
        (SONNET4_MAX_TOKENS, temperature, thinking)
    } else if params.use_thinking {
        (
            THINKING_MAX_TOKENS,
            THINKING_TEMPERATURE,
            Some(params.thinking_budget.unwrap_or(THINKING_BUDGET)),
        )
    } else {
        (DEFAULT_MAX_TOKENS, DEFAULT_TEMPERATURE, None)
    }
}

/// Builds one request from history, system messages, and tools
pub struct RequestBuilder {
    params: RequestParams,
}

impl RequestBuilder {
    pub fn new(params: RequestParams) -> Self {
        Self { params }
    }

    pub fn params(&self) -> &RequestParams {
        &self.params
    }

    pub fn build(
        &self,
        system: &[String],
        tools: &[ToolDefinition],
        history: &[Message],
    ) -> Result<ApiRequest, LLMError> {
        if self.params.model.is_empty() {
            return Err(LLMError::InvalidRequest {
                message: "model is not configured".to_string(),
            });
        }

        let mut messages: Vec<ApiMessage> = Vec::with_capacity(history.len());
        for msg in history {
            if msg.role == Role::System {
                return Err(LLMError::InvalidRequest {
                    message: "system role is not valid inside the message list".to_string(),
                });
            }
            if msg.content.is_empty() {
                return Err(LLMError::InvalidRequest {
                    message: "message with empty content list".to_string(),
                });
            }
            let mut content = msg.content.clone();
            // A tool block never leads a message; synthesize the marker text
            match content.first() {
                Some(ContentBlock::ToolUse { .. }) => content.insert(
                    0,
                    ContentBlock::text(crate::chat::orchestrator::TOOL_CALLED_MARKER),
                ),
                Some(ContentBlock::ToolResult { .. }) => content.insert(
                    0,
                    ContentBlock::text(crate::chat::orchestrator::TOOL_RESULT_MARKER),
                ),
                _ => {}
            }
            messages.push(ApiMessage {
                role: msg.role,
                content,
            });
        }

        // The request must end on a user turn
        while messages.last().map(|m| m.role) == Some(Role::Assistant) {
            messages.pop();
        }
        if messages.is_empty() {
            return Err(LLMError::InvalidRequest {
                message: "no user message to send".to_string(),
            });
        }

        let mut api_tools: Vec<ApiTool> = tools
            .iter()
            .map(|t| ApiTool {
                name: t.name.clone(),
                description: t.description.clone(),
                input_schema: t.input_schema.clone(),
                cache_control: None,
            })
            .collect();

        let mut system_blocks: Vec<SystemBlock> =
            system.iter().map(SystemBlock::text).collect();

        if self.params.use_cache {
            self.apply_cache_policy(&mut api_tools, &mut system_blocks, &mut messages);
        }

        let (max_tokens, temperature, thinking_budget) = resolve_tuning(&self.params);
        let max_tokens = self.params.max_tokens.unwrap_or(max_tokens);
        let temperature = self.params.temperature.unwrap_or(temperature);

        let tool_choice = match &self.params.tool_choice {
            ToolChoice::Auto => None,
            ToolChoice::Any => Some(ToolChoiceWire::Any),
            ToolChoice::Named(name) => {
                if name.is_empty() {
                    return Err(LLMError::InvalidRequest {
                        message: "named tool choice requires a tool name".to_string(),
                    });
                }
                Some(ToolChoiceWire::Tool { name: name.clone() })
            }
        };

        Ok(ApiRequest {
            model: self.params.model.clone(),
            max_tokens,
            temperature: Some(temperature),
            system: system_blocks,
            messages,
            tools: api_tools,
            tool_choice,
            thinking: thinking_budget.map(ThinkingConfig::enabled),
            stream: self.params.stream,
        })
    }

    fn apply_cache_policy(
        &self,
        tools: &mut [ApiTool],
        system: &mut [SystemBlock],
        messages: &mut [ApiMessage],
    ) {
        if self.params.cache_tools {
            if let Some(last) = tools.last_mut() {
                last.cache_control = Some(CacheControl::ephemeral());
            }
        }
        if self.params.cache_system {
            if let Some(last) = system.last_mut() {
                last.cache_control = Some(CacheControl::ephemeral());
            }
        }
        if self.params.cache_messages {
            let user_indices: Vec<usize> = messages
                .iter()
                .enumerate()
                .filter(|(_, m)| m.role == Role::User)
                .map(|(i, _)| i)
                .collect();
            // At most two breakpoints: the last and second-to-last user turns
            let marked: Vec<usize> = user_indices.iter().rev().take(2).cloned().collect();
            for &i in &user_indices {
                for block in &mut messages[i].content {
                    block.set_cache_control(None);
                }
                if marked.contains(&i) {
                    if let Some(block) = messages[i].content.iter_mut().find(|b| {
                        matches!(
                            b,
                            ContentBlock::Text { .. } | ContentBlock::ToolResult { .. }
                        )
                    }) {
                        block.set_cache_control(Some(CacheControl::ephemeral()));
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(model: &str) -> RequestParams {
        RequestParams {
            model: model.to_string(),
            ..Default::default()
        }
    }

    fn tool(name: &str) -> ToolDefinition {
        ToolDefinition {
            name: name.to_string(),
            description: "a tool".to_string(),
            input_schema: serde_json::json!({"type": "object"}),
        }
    }

    fn count_ephemeral(request: &ApiRequest) -> usize {
        let mut count = 0;
        count += request
            .tools
            .iter()
            .filter(|t| t.cache_control.is_some())
            .count();
        count += request
            .system
            .iter()
            .filter(|s| s.cache_control.is_some())
            .count();
        for msg in &request.messages {
            count += msg
                .content
                .iter()
                .filter(|b| b.cache_control().is_some())
                .count();
        }
        count
    }

    #[test]
    fn test_cache_policy_marks_at_most_four_slots() {
        let builder = RequestBuilder::new(params("claude-sonnet-4-20250514"));
        let history = vec![
            Message::user("one"),
            Message::assistant("reply one"),
            Message::user("two"),
            Message::assistant("reply two"),
            Message::user("three"),
        ];
        let request = builder
            .build(
                &["system prompt".to_string()],
                &[tool("alpha"), tool("beta")],
                &history,
            )
            .unwrap();

        // one tool + one system + two user breakpoints
        assert_eq!(count_ephemeral(&request), 4);
        assert!(request.tools[1].cache_control.is_some());
        assert!(request.tools[0].cache_control.is_none());
        assert!(request.system[0].cache_control.is_some());

        // The two most recent user turns carry the message breakpoints
        assert!(request.messages[4].content[0].cache_control().is_some());
        assert!(request.messages[2].content[0].cache_control().is_some());
        assert!(request.messages[0].content[0].cache_control().is_none());
    }

    #[test]
    fn test_cache_policy_clears_stale_markers() {
        let builder = RequestBuilder::new(params("claude-sonnet-4-20250514"));
        let mut stale = Message::user("old turn");
        stale.content[0].set_cache_control(Some(CacheControl::ephemeral()));
        let history = vec![
            stale,
            Message::assistant("r1"),
            Message::user("newer"),
            Message::assistant("r2"),
            Message::user("newest"),
        ];
        let request = builder.build(&[], &[], &history).unwrap();
        assert!(request.messages[0].content[0].cache_control().is_none());
        assert_eq!(count_ephemeral(&request), 2);
    }

    #[test]
    fn test_cache_breakpoint_prefers_first_text_or_tool_result() {
        let builder = RequestBuilder::new(params("claude-sonnet-4-20250514"));
        let history = vec![
            Message::user("hi"),
            Message::new(
                Role::Assistant,
                vec![
                    ContentBlock::text("calling"),
                    ContentBlock::ToolUse {
                        id: "t1".to_string(),
                        name: "demo".to_string(),
                        input: serde_json::json!({}),
                        cache_control: None,
                    },
                ],
            ),
            Message::new(
                Role::User,
                vec![ContentBlock::tool_result(
                    "t1",
                    vec!["output".to_string()],
                    false,
                )],
            ),
        ];
        let request = builder.build(&[], &[], &history).unwrap();
        assert!(request.messages[2].content[0].cache_control().is_some());
    }

    #[test]
    fn test_cache_disabled_marks_nothing() {
        let mut p = params("claude-sonnet-4-20250514");
        p.use_cache = false;
        let builder = RequestBuilder::new(p);
        let request = builder
            .build(
                &["sys".to_string()],
                &[tool("alpha")],
                &[Message::user("hello")],
            )
            .unwrap();
        assert_eq!(count_ephemeral(&request), 0);
    }

    #[test]
    fn test_tail_trim_removes_trailing_assistant() {
        let builder = RequestBuilder::new(params("claude-sonnet-4-20250514"));
        let history = vec![
            Message::user("question"),
            Message::assistant("answer"),
            Message::assistant("afterthought"),
        ];
        let request = builder.build(&[], &[], &history).unwrap();
        assert_eq!(request.messages.len(), 1);
        assert_eq!(request.messages[0].role, Role::User);
    }

    #[test]
    fn test_empty_history_rejected() {
        let builder = RequestBuilder::new(params("claude-sonnet-4-20250514"));
        assert!(matches!(
            builder.build(&[], &[], &[]),
            Err(LLMError::InvalidRequest { .. })
        ));
        // Only assistant turns trims down to nothing
        assert!(matches!(
            builder.build(&[], &[], &[Message::assistant("hi")]),
            Err(LLMError::InvalidRequest { .. })
        ));
    }

    #[test]
    fn test_system_role_in_history_rejected() {
        let builder = RequestBuilder::new(params("claude-sonnet-4-20250514"));
        let history = vec![Message::new(
            Role::System,
            vec![ContentBlock::text("sneaky")],
        )];
        assert!(matches!(
            builder.build(&[], &[], &history),
            Err(LLMError::InvalidRequest { .. })
        ));
    }

    #[test]
    fn test_sonnet4_tuning() {
        let builder = RequestBuilder::new(params("claude-sonnet-4-20250514"));
        let request = builder.build(&[], &[], &[Message::user("hi")]).unwrap();
        assert_eq!(request.max_tokens, SONNET4_MAX_TOKENS);
        assert_eq!(request.temperature, Some(0.2));
        assert!(request.thinking.is_none());

        let mut p = params("claude-sonnet-4-20250514");
        p.use_thinking = true;
        let request = RequestBuilder::new(p)
            .build(&[], &[], &[Message::user("hi")])
            .unwrap();
        assert_eq!(request.max_tokens, SONNET4_MAX_TOKENS);
        assert_eq!(request.temperature, Some(1.0));
        assert_eq!(
            request.thinking.as_ref().map(|t| t.budget_tokens),
            Some(SONNET4_THINKING_BUDGET)
        );
    }

    #[test]
    fn test_generic_thinking_tuning() {
        let mut p = params("claude-opus-4-20250514");
        p.use_thinking = true;
        let request = RequestBuilder::new(p)
            .build(&[], &[], &[Message::user("hi")])
            .unwrap();
        assert_eq!(request.max_tokens, THINKING_MAX_TOKENS);
        assert_eq!(request.temperature, Some(1.0));
        assert_eq!(
            request.thinking.as_ref().map(|t| t.budget_tokens),
            Some(THINKING_BUDGET)
        );
    }

    #[test]
    fn test_default_tuning() {
        let builder = RequestBuilder::new(params("claude-3-5-haiku-20241022"));
        let request = builder.build(&[], &[], &[Message::user("hi")]).unwrap();
        assert_eq!(request.max_tokens, DEFAULT_MAX_TOKENS);
        assert_eq!(request.temperature, Some(0.2));
    }

    #[test]
    fn test_explicit_params_override_table() {
        let mut p = params("claude-sonnet-4-20250514");
        p.max_tokens = Some(123);
        p.temperature = Some(0.9);
        let request = RequestBuilder::new(p)
            .build(&[], &[], &[Message::user("hi")])
            .unwrap();
        assert_eq!(request.max_tokens, 123);
        assert_eq!(request.temperature, Some(0.9));
    }

    #[test]
    fn test_tool_choice_serialization() {
        let mut p = params("claude-sonnet-4-20250514");
        p.tool_choice = ToolChoice::Any;
        let request = RequestBuilder::new(p)
            .build(&[], &[tool("alpha")], &[Message::user("hi")])
            .unwrap();
        let json = serde_json::to_value(&request).unwrap();
        assert_eq!(json["tool_choice"], serde_json::json!({"type": "any"}));

        let mut p = params("claude-sonnet-4-20250514");
        p.tool_choice = ToolChoice::Named("alpha".to_string());
        let request = RequestBuilder::new(p)
            .build(&[], &[tool("alpha")], &[Message::user("hi")])
            .unwrap();
        let json = serde_json::to_value(&request).unwrap();
        assert_eq!(
            json["tool_choice"],
            serde_json::json!({"type": "tool", "name": "alpha"})
        );
    }

    #[test]
    fn test_named_tool_choice_without_name_is_fatal() {
        let mut p = params("claude-sonnet-4-20250514");
        p.tool_choice = ToolChoice::Named(String::new());
        assert!(matches!(
            RequestBuilder::new(p).build(&[], &[], &[Message::user("hi")]),
            Err(LLMError::InvalidRequest { .. })
        ));
    }

    #[test]
    fn test_auto_tool_choice_omitted() {
        let builder = RequestBuilder::new(params("claude-sonnet-4-20250514"));
        let request = builder
            .build(&[], &[tool("alpha")], &[Message::user("hi")])
            .unwrap();
        let json = serde_json::to_value(&request).unwrap();
        assert!(json.get("tool_choice").is_none());
    }

    #[test]
    fn test_leading_tool_blocks_get_marker_text() {
        let builder = RequestBuilder::new(params("claude-sonnet-4-20250514"));
        let history = vec![
            Message::user("go"),
            Message::new(
                Role::Assistant,
                vec![ContentBlock::ToolUse {
                    id: "t1".to_string(),
                    name: "demo".to_string(),
                    input: serde_json::json!({}),
                    cache_control: None,
                }],
            ),
            Message::new(
                Role::User,
                vec![ContentBlock::tool_result(
                    "t1",
                    vec!["out".to_string()],
                    false,
                )],
            ),
        ];
        let request = builder.build(&[], &[], &history).unwrap();
        assert!(matches!(
            request.messages[1].content[0],
            ContentBlock::Text { .. }
        ));
        assert!(matches!(
            request.messages[1].content[1],
            ContentBlock::ToolUse { .. }
        ));
        assert!(matches!(
            request.messages[2].content[0],
            ContentBlock::Text { .. }
        ));
    }

    #[test]
    fn test_wire_shape() {
        let builder = RequestBuilder::new(params("claude-sonnet-4-20250514"));
        let request = builder
            .build(&["be brief".to_string()], &[], &[Message::user("hi")])
            .unwrap();
        let json = serde_json::to_value(&request).unwrap();
        assert_eq!(json["system"][0]["type"], "text");
        assert_eq!(json["messages"][0]["role"], "user");
        assert_eq!(json["messages"][0]["content"][0]["type"], "text");
        assert_eq!(json["stream"], true);
        assert!(json.get("tools").is_none());
    }
}
