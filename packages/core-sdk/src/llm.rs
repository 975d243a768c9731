use anyhow::{anyhow, bail, Result};
use async_stream::try_stream;
use futures_util::Stream;
use reqwest::header::{AUTHORIZATION, CONTENT_TYPE};
use serde_json::{json, Value};
use std::{pin::Pin, time::Duration};

use crate::models::{Character, ChatMessage, Message};

// 与原接入层对齐：连接类故障最多额外重试 2 次。
const MAX_REQUEST_RETRIES: usize = 2;

/**
 * \brief 将持久化历史映射为模型对话消息。
 * \details 发送者名称与角色名相同的消息归为 assistant，其余归为 user 并带上
 *          "发送者: 内容" 前缀；系统提示词始终位于首位。
 */
pub fn build_history(character: &Character, history: &[Message]) -> Vec<ChatMessage> {
    let mut messages = Vec::with_capacity(history.len() + 1);
    messages.push(ChatMessage::new("system", character.system_prompt.clone()));
    for msg in history {
        if msg.sender_name == character.name {
            messages.push(ChatMessage::new("assistant", msg.content.clone()));
        } else {
            messages.push(ChatMessage::new(
                "user",
                format!("{}: {}", msg.sender_name, msg.content),
            ));
        }
    }
    messages
}

/**
 * \brief 以流式方式调用角色绑定的 Ollama Chat 接口，返回增量文本流。
 */
pub async fn stream_chat(
    character: &Character,
    messages: &[ChatMessage],
) -> Result<Pin<Box<dyn Stream<Item = Result<String>> + Send>>> {
    let url = format!("{}/api/chat", character.ollama_url.trim_end_matches('/'));
    let client = reqwest::Client::builder().build()?;
    let body = json!({
        "model": character.ollama_model,
        "messages": messages,
        "stream": true,
        "options": { "temperature": 0 }
    });

    let req = apply_auth(
        client.post(url).header(CONTENT_TYPE, "application/json"),
        character.ollama_api_key.as_deref(),
    )
    .json(&body);
    let resp = send_with_retry(req).await?;

    if !resp.status().is_success() {
        let status = resp.status();
        let text = resp.text().await.unwrap_or_default();
        return Err(anyhow!("chat request failed: {} -> {}", status, text));
    }

    let mut stream = resp.bytes_stream();
    let mut buf = Vec::<u8>::new();

    let out = try_stream! {
        use futures_util::StreamExt;
        while let Some(chunk) = stream.next().await {
            let chunk = chunk?;
            buf.extend_from_slice(&chunk);
            while let Some(pos) = find_newline(&buf) {
                let line = buf.drain(..pos + 1).collect::<Vec<u8>>();
                if let Some(delta) = parse_chat_line(&line)? {
                    if !delta.is_empty() {
                        yield delta;
                    }
                }
            }
        }
        if !buf.is_empty() {
            if let Some(delta) = parse_chat_line(&buf)? {
                if !delta.is_empty() {
                    yield delta;
                }
            }
        }
    };

    Ok(Box::pin(out))
}

/**
 * \brief 非流式调用，返回完整回复。
 */
pub async fn chat_once(character: &Character, messages: &[ChatMessage]) -> Result<String> {
    let url = format!("{}/api/chat", character.ollama_url.trim_end_matches('/'));
    let client = reqwest::Client::builder().build()?;
    let body = json!({
        "model": character.ollama_model,
        "messages": messages,
        "stream": false,
        "options": { "temperature": 0 }
    });

    let req = apply_auth(
        client.post(url).header(CONTENT_TYPE, "application/json"),
        character.ollama_api_key.as_deref(),
    )
    .json(&body);
    let resp = send_with_retry(req).await?;

    if !resp.status().is_success() {
        let status = resp.status();
        let text = resp.text().await.unwrap_or_default();
        return Err(anyhow!("chat request failed: {} -> {}", status, text));
    }
    let v: Value = resp.json().await?;
    if let Some(err) = v.get("error").and_then(|e| e.as_str()) {
        bail!("ollama error: {}", err);
    }
    Ok(extract_chat_content(&v))
}

/**
 * \brief 列出指定 Ollama 端点可用模型列表（/api/tags）。
 */
pub async fn list_models(ollama_url: &str, ollama_api_key: Option<&str>) -> Result<Vec<String>> {
    let url = format!("{}/api/tags", ollama_url.trim_end_matches('/'));
    let client = reqwest::Client::new();
    let resp = apply_auth(client.get(url), ollama_api_key).send().await?;
    if !resp.status().is_success() {
        let status = resp.status();
        let text = resp.text().await.unwrap_or_default();
        return Err(anyhow!("list models failed: {} -> {}", status, text));
    }
    parse_tags_payload(resp.json().await?)
}

fn apply_auth(req: reqwest::RequestBuilder, api_key: Option<&str>) -> reqwest::RequestBuilder {
    match api_key {
        Some(key) if !key.is_empty() => req.header(AUTHORIZATION, format!("Bearer {}", key)),
        _ => req,
    }
}

async fn send_with_retry(req: reqwest::RequestBuilder) -> Result<reqwest::Response> {
    for attempt in 0..MAX_REQUEST_RETRIES {
        let Some(cloned) = req.try_clone() else {
            break;
        };
        match cloned.send().await {
            Ok(resp) => return Ok(resp),
            Err(e) if e.is_connect() || e.is_timeout() => {
                let backoff = Duration::from_millis(200 * (attempt as u64 + 1));
                tokio::time::sleep(backoff).await;
            }
            Err(e) => return Err(e.into()),
        }
    }
    Ok(req.send().await?)
}

fn find_newline(buf: &[u8]) -> Option<usize> {
    buf.iter().position(|b| *b == b'\n')
}

/**
 * \brief 解析一行 NDJSON 流式响应，返回其中的增量文本。
 * \details 空行与无法解析的行返回 None；携带 error 字段的行转为错误。
 */
fn parse_chat_line(line: &[u8]) -> Result<Option<String>> {
    let text = String::from_utf8_lossy(line);
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return Ok(None);
    }
    let Ok(v) = serde_json::from_str::<Value>(trimmed) else {
        return Ok(None);
    };
    if let Some(err) = v.get("error").and_then(|e| e.as_str()) {
        bail!("ollama error: {}", err);
    }
    Ok(Some(extract_chat_content(&v)))
}

fn extract_chat_content(v: &Value) -> String {
    v.get("message")
        .and_then(|m| m.get("content"))
        .and_then(|c| c.as_str())
        .unwrap_or("")
        .to_string()
}

fn parse_tags_payload(v: Value) -> Result<Vec<String>> {
    if let Some(arr) = v.get("models").and_then(|x| x.as_array()) {
        Ok(arr
            .iter()
            .filter_map(|item| item.get("name").and_then(|s| s.as_str()))
            .map(|s| s.to_string())
            .collect())
    } else {
        Err(anyhow!("unexpected tags payload: {}", v))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_character() -> Character {
        Character {
            id: 1,
            name: "小助手".to_string(),
            system_prompt: "你是一个聊天机器人".to_string(),
            ollama_url: "http://127.0.0.1:11434".to_string(),
            ollama_api_key: None,
            ollama_model: "llama3".to_string(),
        }
    }

    fn stored(sender: &str, content: &str) -> Message {
        Message {
            id: 0,
            content: content.to_string(),
            sender_name: sender.to_string(),
            created_at: String::new(),
            updated_at: String::new(),
        }
    }

    #[test]
    fn test_build_history_roles_by_sender_name() {
        let character = sample_character();
        let history = vec![
            stored("访客", "你好"),
            stored("小助手", "你好，有什么可以帮你？"),
            stored("路人", "我也来问一句"),
        ];

        let messages = build_history(&character, &history);
        assert_eq!(messages.len(), 4);
        assert_eq!(messages[0].role, "system");
        assert_eq!(messages[0].content, "你是一个聊天机器人");
        assert_eq!(messages[1].role, "user");
        assert_eq!(messages[1].content, "访客: 你好");
        assert_eq!(messages[2].role, "assistant");
        assert_eq!(messages[2].content, "你好，有什么可以帮你？");
        assert_eq!(messages[3].role, "user");
        assert_eq!(messages[3].content, "路人: 我也来问一句");
    }

    #[test]
    fn test_build_history_empty_history_keeps_system_prompt() {
        let character = sample_character();
        let messages = build_history(&character, &[]);
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].role, "system");
    }

    #[test]
    fn test_parse_chat_line_extracts_delta() {
        let line = r#"{"message":{"role":"assistant","content":"你好"},"done":false}"#.as_bytes();
        let delta = parse_chat_line(line).expect("parse ok");
        assert_eq!(delta.as_deref(), Some("你好"));
    }

    #[test]
    fn test_parse_chat_line_done_chunk_has_empty_delta() {
        let line = br#"{"message":{"role":"assistant","content":""},"done":true}"#;
        let delta = parse_chat_line(line).expect("parse ok");
        assert_eq!(delta.as_deref(), Some(""));
    }

    #[test]
    fn test_parse_chat_line_skips_blank_and_garbage() {
        assert!(parse_chat_line(b"  \n").expect("blank ok").is_none());
        assert!(parse_chat_line(b"not json").expect("garbage ok").is_none());
    }

    #[test]
    fn test_parse_chat_line_surfaces_error_payload() {
        let line = br#"{"error":"model not found"}"#;
        let err = parse_chat_line(line).expect_err("should fail");
        assert!(err.to_string().contains("model not found"));
    }

    #[test]
    fn test_parse_tags_payload() {
        let v = serde_json::json!({
            "models": [
                {"name": "llama3:latest", "size": 1},
                {"name": "qwen3:8b"},
                {"size": 2}
            ]
        });
        let models = parse_tags_payload(v).expect("parse tags");
        assert_eq!(models, vec!["llama3:latest", "qwen3:8b"]);
    }

    #[test]
    fn test_parse_tags_payload_rejects_unexpected_shape() {
        assert!(parse_tags_payload(serde_json::json!({"data": []})).is_err());
    }
}
