//! Function calling on top of a plain chat reply: an instruction that asks the
//! model to answer with a JSON routing block, and the parser for that block.

use nanoid::nanoid;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::OnceLock;
use tracing::{debug, warn};

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub parameters: Value,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    /// JSON-encoded argument object.
    pub arguments: String,
}

#[derive(Deserialize)]
struct RoutingBlock {
    tool_calls: Vec<RawCall>,
}

#[derive(Deserialize)]
struct RawCall {
    #[serde(default)]
    name: String,
    #[serde(default)]
    arguments: Value,
}

const ID_ALPHABET: [char; 36] = [
    'a', 'b', 'c', 'd', 'e', 'f', 'g', 'h', 'i', 'j', 'k', 'l', 'm', 'n', 'o', 'p', 'q', 'r',
    's', 't', 'u', 'v', 'w', 'x', 'y', 'z', '0', '1', '2', '3', '4', '5', '6', '7', '8', '9',
];

pub fn tool_system_prompt(tools: &[ToolDefinition]) -> String {
    let described: Vec<String> = tools
        .iter()
        .map(|t| {
            let desc = serde_json::json!({
                "name": t.name,
                "description": t.description,
                "parameters": t.parameters,
            });
            serde_json::to_string_pretty(&desc).unwrap_or_else(|_| t.name.clone())
        })
        .collect();

    format!(
        r#"Ignore earlier instructions in this conversation. You are now routing requests to functions.

When a request matches one of the functions below, reply with ONLY a JSON code block in this shape:

```json
{{"tool_calls": [{{"name": "<function_name>", "arguments": {{...}}}}]}}
```

Available functions:
{functions}

Examples:

"What time is it?" -> ```json
{{"tool_calls": [{{"name": "get_current_time", "arguments": {{}}}}]}}```

"Add 5 and 3" -> ```json
{{"tool_calls": [{{"name": "add_numbers", "arguments": {{"a": 5, "b": 3}}}}]}}```

Rules:
- Emit the JSON block for every request that matches a function; do not answer it yourself.
- Several functions may be called in one block.
- When a later message carries function results, summarise them for the user in plain language.
- Never claim the functions are unavailable.
"#,
        functions = described.join("\n---\n"),
    )
}

fn fenced_re() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"```(?:json)?\s*(\{[\s\S]*?\})\s*```").ok()).as_ref()
}

fn raw_re() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r#"(\{\s*"tool_calls"\s*:\s*\[[\s\S]*?\]\s*\})"#).ok())
        .as_ref()
}

fn routing_json(text: &str) -> Option<&str> {
    let capture = |re: Option<&'static Regex>| {
        re.and_then(|re| re.captures(text))
            .and_then(|c| c.get(1))
            .map(|m| m.as_str())
    };
    capture(fenced_re()).or_else(|| capture(raw_re()))
}

/// Tool calls found in `text`, restricted to the declared `tools`. `None`
/// when the reply is an ordinary answer.
pub fn parse_tool_calls(text: &str, tools: &[ToolDefinition]) -> Option<Vec<ToolCall>> {
    let json = routing_json(text)?;
    let block: RoutingBlock = match serde_json::from_str(json) {
        Ok(block) => block,
        Err(e) => {
            debug!(error = %e, "reply has a JSON block but no tool_calls list");
            return None;
        }
    };

    let calls: Vec<ToolCall> = block
        .tool_calls
        .into_iter()
        .filter_map(|call| {
            if !tools.iter().any(|t| t.name == call.name) {
                warn!(name = %call.name, "model called an undeclared tool");
                return None;
            }
            let arguments = match call.arguments {
                Value::Null => "{}".to_string(),
                Value::String(s) => s,
                other => other.to_string(),
            };
            Some(ToolCall { id: format!("call_{}", nanoid!(24, &ID_ALPHABET)), name: call.name, arguments })
        })
        .collect();

    (!calls.is_empty()).then_some(calls)
}
