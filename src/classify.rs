//! Client for the hosted speech-to-text and text-classification endpoints.
//! Each call is one synchronous round-trip; callers decide how failures
//! degrade (the pipeline substitutes field-level error markers).

use crate::config::AppConfig;
use crate::log_debug;
use anyhow::{anyhow, Context, Result};
use regex::Regex;
use reqwest::blocking::multipart;
use serde::{Deserialize, Serialize};
use std::sync::OnceLock;
use std::time::Duration;

/// External collaborator that turns audio into text and text into labels.
/// `classify` doubles as a generic chat call: the summary generator passes an
/// empty taxonomy and its own instruction.
pub trait TranscriptionClassifier: Send + Sync {
    fn transcribe(&self, wav_bytes: &[u8]) -> Result<String>;
    fn classify(&self, text: &str, taxonomy: &[&str], system_instruction: &str) -> Result<String>;
}

#[derive(Debug, Deserialize)]
struct TranscriptionResponse {
    #[serde(default)]
    text: String,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

#[derive(Debug, Deserialize)]
struct ChatMessage {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatRequestMessage<'a>>,
}

#[derive(Debug, Serialize)]
struct ChatRequestMessage<'a> {
    role: &'a str,
    content: &'a str,
}

/// Blocking client for a Groq-compatible API: Whisper-style transcription via
/// multipart WAV upload plus one-word label classification via chat
/// completions.
pub struct GroqClient {
    http: reqwest::blocking::Client,
    api_base: String,
    api_key: String,
    transcription_model: String,
    classification_model: String,
}

impl GroqClient {
    pub fn from_config(config: &AppConfig) -> Result<Self> {
        let api_key = config
            .api_key
            .clone()
            .filter(|key| !key.trim().is_empty())
            .ok_or_else(|| {
                anyhow!("GROQ_API_KEY is not set; export it or pass --api-key")
            })?;
        let http = reqwest::blocking::Client::builder()
            .timeout(Duration::from_secs(config.api_timeout_secs))
            .build()
            .context("failed to build HTTP client")?;
        Ok(Self {
            http,
            api_base: config.api_base.trim_end_matches('/').to_string(),
            api_key,
            transcription_model: config.transcription_model.clone(),
            classification_model: config.classification_model.clone(),
        })
    }
}

impl TranscriptionClassifier for GroqClient {
    fn transcribe(&self, wav_bytes: &[u8]) -> Result<String> {
        let part = multipart::Part::bytes(wav_bytes.to_vec())
            .file_name("capture.wav")
            .mime_str("audio/wav")
            .context("failed to build WAV upload part")?;
        let form = multipart::Form::new()
            .part("file", part)
            .text("model", self.transcription_model.clone());

        let url = format!("{}/audio/transcriptions", self.api_base);
        let response = self
            .http
            .post(&url)
            .bearer_auth(&self.api_key)
            .multipart(form)
            .send()
            .context("transcription request failed")?
            .error_for_status()
            .context("transcription request rejected")?
            .json::<TranscriptionResponse>()
            .context("transcription response was not valid JSON")?;

        log_debug(&format!(
            "transcribe|model={}|chars={}",
            self.transcription_model,
            response.text.len()
        ));
        Ok(response.text.trim().to_string())
    }

    fn classify(&self, text: &str, taxonomy: &[&str], system_instruction: &str) -> Result<String> {
        let system = if system_instruction.is_empty() {
            format!("Reply with only one word: {}.", taxonomy.join(", "))
        } else {
            system_instruction.to_string()
        };
        let body = ChatRequest {
            model: &self.classification_model,
            messages: vec![
                ChatRequestMessage {
                    role: "system",
                    content: &system,
                },
                ChatRequestMessage {
                    role: "user",
                    content: text,
                },
            ],
        };

        let url = format!("{}/chat/completions", self.api_base);
        let response = self
            .http
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .context("classification request failed")?
            .error_for_status()
            .context("classification request rejected")?
            .json::<ChatResponse>()
            .context("classification response was not valid JSON")?;

        Ok(first_choice_content(&response))
    }
}

/// Pull the reply text out of a chat response without trusting its shape; a
/// missing message yields an empty string rather than a fault.
fn first_choice_content(response: &ChatResponse) -> String {
    response
        .choices
        .first()
        .and_then(|choice| choice.message.content.as_deref())
        .unwrap_or_default()
        .trim()
        .to_string()
}

/// Tolerant parse for language-model replies that should be JSON objects:
/// strict parse first, then the first brace-delimited region, then None so
/// the caller can fall back to a fixed payload.
pub fn extract_json_object(content: &str) -> Option<serde_json::Value> {
    let trimmed = content.trim();
    if let Ok(value) = serde_json::from_str::<serde_json::Value>(trimmed) {
        if value.is_object() {
            return Some(value);
        }
    }

    static BRACE_REGION: OnceLock<Regex> = OnceLock::new();
    let re = BRACE_REGION.get_or_init(|| {
        Regex::new(r"(?s)\{.*\}").unwrap_or_else(|_| Regex::new(r"\{\}").unwrap())
    });
    re.find(trimmed)
        .and_then(|m| serde_json::from_str::<serde_json::Value>(m.as_str()).ok())
        .filter(serde_json::Value::is_object)
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    fn chat_response(json: &str) -> ChatResponse {
        serde_json::from_str(json).expect("test fixture should parse")
    }

    #[test]
    fn client_requires_an_api_key() {
        let config = AppConfig::parse_from(["sentivox-tests"]);
        let stripped = AppConfig {
            api_key: None,
            ..config
        };
        assert!(GroqClient::from_config(&stripped).is_err());
    }

    #[test]
    fn client_rejects_blank_api_key() {
        let config = AppConfig::parse_from(["sentivox-tests"]);
        let blank = AppConfig {
            api_key: Some("   ".into()),
            ..config
        };
        assert!(GroqClient::from_config(&blank).is_err());
    }

    #[test]
    fn choice_content_survives_sparse_responses() {
        let full = chat_response(
            r#"{"choices":[{"message":{"content":"  Positive "}}]}"#,
        );
        assert_eq!(first_choice_content(&full), "Positive");

        let missing_content = chat_response(r#"{"choices":[{"message":{}}]}"#);
        assert_eq!(first_choice_content(&missing_content), "");

        let no_choices = chat_response(r#"{"choices":[]}"#);
        assert_eq!(first_choice_content(&no_choices), "");
    }

    #[test]
    fn transcription_response_tolerates_missing_text() {
        let parsed: TranscriptionResponse = serde_json::from_str("{}").unwrap();
        assert_eq!(parsed.text, "");
    }

    #[test]
    fn extract_json_prefers_strict_parse() {
        let value = extract_json_object(r#"{"summary":"fine","action_items":[]}"#).unwrap();
        assert_eq!(value["summary"], "fine");
    }

    #[test]
    fn extract_json_recovers_embedded_objects() {
        let reply = "Sure! Here is the JSON you asked for:\n{\"summary\": \"call went well\", \"action_items\": [\"send quote\"]}\nLet me know if you need more.";
        let value = extract_json_object(reply).unwrap();
        assert_eq!(value["summary"], "call went well");
        assert_eq!(value["action_items"][0], "send quote");
    }

    #[test]
    fn extract_json_returns_none_for_prose() {
        assert!(extract_json_object("no json here at all").is_none());
        assert!(extract_json_object("").is_none());
        assert!(extract_json_object("[1, 2, 3]").is_none());
    }
}
