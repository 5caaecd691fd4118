//! Provider Adapters
//!
//! Translate the common chat contract to each provider family's wire
//! shape and back. All adapters are pure request/response transforms;
//! transport runs through the `HttpCapability`.

use serde_json::{json, Value};

use crate::types::{
    ChatMessage, ChatOptions, ChatResult, ChatRole, ParamStyle, Provider, TokenUsage,
    ToolCallRequest, ToolDefinition,
};

use super::error::InferenceError;
use super::http::HttpRequest;

/// Anthropic API version header value.
pub const ANTHROPIC_VERSION: &str = "2023-06-01";

/// Per-request inference timeout.
pub const INFERENCE_TIMEOUT_SECS: u64 = 30;

/// Endpoint and credentials for one provider family.
#[derive(Clone, Debug)]
pub struct ProviderEndpoint {
    pub provider: Provider,
    pub base_url: String,
    pub api_key: Option<String>,
}

// ─── OpenAI-compatible (conway + openai) ─────────────────────────

pub fn openai_chat_request(
    endpoint: &ProviderEndpoint,
    model: &str,
    messages: &[ChatMessage],
    options: &ChatOptions,
    param_style: ParamStyle,
    max_tokens: u32,
) -> HttpRequest {
    let formatted: Vec<Value> = messages.iter().map(format_openai_message).collect();

    let mut body = json!({
        "model": model,
        "messages": formatted,
        "stream": false,
    });
    body[param_style.as_str()] = json!(max_tokens);

    if let Some(ref tools) = options.tools {
        if !tools.is_empty() {
            body["tools"] = json!(tools.iter().map(format_tool).collect::<Vec<_>>());
            body["tool_choice"] = json!("auto");
        }
    }

    let mut request = HttpRequest::post(
        format!("{}/v1/chat/completions", endpoint.base_url),
        body,
    )
    .header("Content-Type", "application/json")
    .timeout(INFERENCE_TIMEOUT_SECS);

    if let Some(ref key) = endpoint.api_key {
        request = request.header("Authorization", format!("Bearer {key}"));
    }
    request
}

pub fn parse_openai_chat(data: &Value, requested_model: &str) -> Result<ChatResult, InferenceError> {
    let choice = data["choices"]
        .get(0)
        .ok_or_else(|| InferenceError::MalformedResponse("no completion choice".to_string()))?;
    let message = &choice["message"];

    let tool_calls: Option<Vec<ToolCallRequest>> = message["tool_calls"].as_array().map(|tcs| {
        tcs.iter()
            .map(|tc| ToolCallRequest {
                id: tc["id"].as_str().unwrap_or("").to_string(),
                name: tc["function"]["name"].as_str().unwrap_or("").to_string(),
                arguments: tc["function"]["arguments"].as_str().unwrap_or("{}").to_string(),
            })
            .collect()
    });

    Ok(ChatResult {
        message: ChatMessage {
            role: ChatRole::Assistant,
            content: message["content"].as_str().unwrap_or("").to_string(),
            tool_calls,
            tool_call_id: None,
        },
        usage: parse_openai_usage(&data["usage"]),
        model: data["model"].as_str().unwrap_or(requested_model).to_string(),
        finish_reason: choice["finish_reason"].as_str().unwrap_or("stop").to_string(),
    })
}

/// Legacy text-completions request for endpoints that do not serve
/// `/v1/chat/completions`. Messages are flattened to a single prompt.
pub fn openai_legacy_request(
    endpoint: &ProviderEndpoint,
    model: &str,
    messages: &[ChatMessage],
    max_tokens: u32,
) -> HttpRequest {
    let prompt = flatten_messages(messages);
    let body = json!({
        "model": model,
        "prompt": prompt,
        "max_tokens": max_tokens,
    });

    let mut request = HttpRequest::post(format!("{}/v1/completions", endpoint.base_url), body)
        .header("Content-Type", "application/json")
        .timeout(INFERENCE_TIMEOUT_SECS);
    if let Some(ref key) = endpoint.api_key {
        request = request.header("Authorization", format!("Bearer {key}"));
    }
    request
}

pub fn parse_openai_legacy(
    data: &Value,
    requested_model: &str,
) -> Result<ChatResult, InferenceError> {
    let choice = data["choices"]
        .get(0)
        .ok_or_else(|| InferenceError::MalformedResponse("no completion choice".to_string()))?;

    Ok(ChatResult {
        message: ChatMessage::assistant(choice["text"].as_str().unwrap_or("").to_string()),
        usage: parse_openai_usage(&data["usage"]),
        model: data["model"].as_str().unwrap_or(requested_model).to_string(),
        finish_reason: choice["finish_reason"].as_str().unwrap_or("stop").to_string(),
    })
}

// ─── Anthropic ───────────────────────────────────────────────────

pub fn anthropic_chat_request(
    endpoint: &ProviderEndpoint,
    model: &str,
    messages: &[ChatMessage],
    options: &ChatOptions,
    max_tokens: u32,
) -> HttpRequest {
    // Anthropic takes the system prompt as a top-level field.
    let system: Vec<&str> = messages
        .iter()
        .filter(|m| m.role == ChatRole::System)
        .map(|m| m.content.as_str())
        .collect();

    let formatted: Vec<Value> = messages
        .iter()
        .filter(|m| m.role != ChatRole::System)
        .map(|m| {
            json!({
                "role": match m.role {
                    ChatRole::Assistant => "assistant",
                    _ => "user",
                },
                "content": m.content,
            })
        })
        .collect();

    let mut body = json!({
        "model": model,
        "messages": formatted,
        "max_tokens": max_tokens,
    });
    if !system.is_empty() {
        body["system"] = json!(system.join("\n\n"));
    }
    if let Some(ref tools) = options.tools {
        if !tools.is_empty() {
            let defs: Vec<Value> = tools
                .iter()
                .map(|t| {
                    json!({
                        "name": t.name,
                        "description": t.description,
                        "input_schema": t.parameters,
                    })
                })
                .collect();
            body["tools"] = json!(defs);
        }
    }

    let mut request = HttpRequest::post(format!("{}/v1/messages", endpoint.base_url), body)
        .header("Content-Type", "application/json")
        .header("anthropic-version", ANTHROPIC_VERSION)
        .timeout(INFERENCE_TIMEOUT_SECS);
    if let Some(ref key) = endpoint.api_key {
        request = request.header("x-api-key", key.clone());
    }
    request
}

pub fn parse_anthropic_chat(
    data: &Value,
    requested_model: &str,
) -> Result<ChatResult, InferenceError> {
    let blocks = data["content"]
        .as_array()
        .ok_or_else(|| InferenceError::MalformedResponse("no content blocks".to_string()))?;

    let mut content = String::new();
    let mut tool_calls: Vec<ToolCallRequest> = Vec::new();

    for block in blocks {
        match block["type"].as_str().unwrap_or("") {
            "text" => content.push_str(block["text"].as_str().unwrap_or("")),
            "tool_use" => tool_calls.push(ToolCallRequest {
                id: block["id"].as_str().unwrap_or("").to_string(),
                name: block["name"].as_str().unwrap_or("").to_string(),
                arguments: block["input"].to_string(),
            }),
            _ => {}
        }
    }

    let usage = TokenUsage {
        prompt_tokens: data["usage"]["input_tokens"].as_u64().unwrap_or(0),
        completion_tokens: data["usage"]["output_tokens"].as_u64().unwrap_or(0),
        total_tokens: data["usage"]["input_tokens"].as_u64().unwrap_or(0)
            + data["usage"]["output_tokens"].as_u64().unwrap_or(0),
    };

    Ok(ChatResult {
        message: ChatMessage {
            role: ChatRole::Assistant,
            content,
            tool_calls: if tool_calls.is_empty() {
                None
            } else {
                Some(tool_calls)
            },
            tool_call_id: None,
        },
        usage,
        model: data["model"].as_str().unwrap_or(requested_model).to_string(),
        finish_reason: data["stop_reason"].as_str().unwrap_or("end_turn").to_string(),
    })
}

// ─── Ollama ──────────────────────────────────────────────────────

pub fn ollama_chat_request(
    endpoint: &ProviderEndpoint,
    model: &str,
    messages: &[ChatMessage],
) -> HttpRequest {
    let formatted: Vec<Value> = messages
        .iter()
        .map(|m| {
            json!({
                "role": match m.role {
                    ChatRole::System => "system",
                    ChatRole::User => "user",
                    ChatRole::Assistant => "assistant",
                    ChatRole::Tool => "tool",
                },
                "content": m.content,
            })
        })
        .collect();

    let body = json!({
        "model": model,
        "messages": formatted,
        "stream": false,
    });

    HttpRequest::post(format!("{}/api/chat", endpoint.base_url), body)
        .header("Content-Type", "application/json")
        .timeout(INFERENCE_TIMEOUT_SECS)
}

pub fn parse_ollama_chat(data: &Value, requested_model: &str) -> Result<ChatResult, InferenceError> {
    let message = data
        .get("message")
        .ok_or_else(|| InferenceError::MalformedResponse("no message in response".to_string()))?;

    let usage = TokenUsage {
        prompt_tokens: data["prompt_eval_count"].as_u64().unwrap_or(0),
        completion_tokens: data["eval_count"].as_u64().unwrap_or(0),
        total_tokens: data["prompt_eval_count"].as_u64().unwrap_or(0)
            + data["eval_count"].as_u64().unwrap_or(0),
    };

    Ok(ChatResult {
        message: ChatMessage::assistant(message["content"].as_str().unwrap_or("").to_string()),
        usage,
        model: data["model"].as_str().unwrap_or(requested_model).to_string(),
        finish_reason: if data["done"].as_bool().unwrap_or(true) {
            "stop".to_string()
        } else {
            "length".to_string()
        },
    })
}

// ─── Helpers ─────────────────────────────────────────────────────

fn format_openai_message(msg: &ChatMessage) -> Value {
    let mut formatted = json!({
        "role": match msg.role {
            ChatRole::System => "system",
            ChatRole::User => "user",
            ChatRole::Assistant => "assistant",
            ChatRole::Tool => "tool",
        },
        "content": msg.content,
    });

    if let Some(ref tool_calls) = msg.tool_calls {
        let tc_json: Vec<Value> = tool_calls
            .iter()
            .map(|tc| {
                json!({
                    "id": tc.id,
                    "type": "function",
                    "function": { "name": tc.name, "arguments": tc.arguments },
                })
            })
            .collect();
        formatted["tool_calls"] = json!(tc_json);
    }
    if let Some(ref tool_call_id) = msg.tool_call_id {
        formatted["tool_call_id"] = json!(tool_call_id);
    }
    formatted
}

fn format_tool(tool: &ToolDefinition) -> Value {
    json!({
        "type": "function",
        "function": {
            "name": tool.name,
            "description": tool.description,
            "parameters": tool.parameters,
        }
    })
}

fn parse_openai_usage(usage: &Value) -> TokenUsage {
    TokenUsage {
        prompt_tokens: usage["prompt_tokens"].as_u64().unwrap_or(0),
        completion_tokens: usage["completion_tokens"].as_u64().unwrap_or(0),
        total_tokens: usage["total_tokens"].as_u64().unwrap_or(0),
    }
}

/// Flatten a chat transcript to a single prompt for legacy completion
/// endpoints.
pub fn flatten_messages(messages: &[ChatMessage]) -> String {
    let mut parts: Vec<String> = Vec::new();
    for msg in messages {
        let prefix = match msg.role {
            ChatRole::System => "System",
            ChatRole::User => "User",
            ChatRole::Assistant => "Assistant",
            ChatRole::Tool => "Tool",
        };
        parts.push(format!("{}: {}", prefix, msg.content));
    }
    parts.push("Assistant:".to_string());
    parts.join("\n\n")
}
