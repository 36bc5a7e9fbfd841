//! Gemini API client for response phrasing
//!
//! The decision engine and state machine never touch this; the LLM only
//! rewrites already-computed payloads into prose. Uses a long-lived
//! reqwest::Client for connection pooling.

use crate::error::AgentError;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{error, info};

const SYSTEM_PROMPT: &str = r#"You are a payments assistant for a small business.

Guidelines:
- You receive structured JSON describing bills, totals, and a chosen payment strategy
- Present it as short, natural prose for the business owner
- Never change any number, bill code, or date
- Mention the recommended action when one is present
- Be direct and professional; avoid emoji

Format: a short paragraph, at most five lines."#;

/// Reusable Gemini client (connection-pooled)
pub struct GeminiClient {
    client: Client,
    api_key: String,
    base_url: String,
}

impl GeminiClient {
    pub fn new(api_key: String) -> Self {
        let client = Client::builder()
            .pool_idle_timeout(Duration::from_secs(90))
            .pool_max_idle_per_host(8)
            .timeout(Duration::from_secs(30))
            .build()
            .expect("Failed to build HTTP client");

        Self {
            client,
            api_key,
            base_url: "https://generativelanguage.googleapis.com/v1beta/models/gemini-2.0-flash:generateContent".to_string(),
        }
    }

    /// Generate prose from a structured payload
    pub async fn phrase(&self, payload: &str) -> crate::Result<(String, f32)> {
        if self.api_key.is_empty() {
            return Err(AgentError::Llm(
                "Gemini API key not configured; set GEMINI_API_KEY".to_string(),
            ));
        }

        let url = format!("{}?key={}", self.base_url, self.api_key);

        let request = GeminiRequest {
            contents: vec![Content {
                parts: vec![Part {
                    text: payload.to_string(),
                }],
            }],
            generation_config: GenerationConfig {
                temperature: 0.3,
                top_p: 0.9,
                top_k: 40,
                max_output_tokens: 512,
            },
            system_instruction: SystemInstruction {
                parts: vec![Part {
                    text: SYSTEM_PROMPT.to_string(),
                }],
            },
        };

        info!("Calling Gemini API");

        let response = self
            .client
            .post(&url)
            .json(&request)
            .send()
            .await
            .map_err(|e| {
                error!("Gemini API request failed: {}", e);
                AgentError::Llm(format!("Gemini API error: {}", e))
            })?;

        if !response.status().is_success() {
            let error_text = response.text().await.unwrap_or_default();
            error!("Gemini API error response: {}", error_text);
            return Err(AgentError::Llm(format!("Gemini API error: {}", error_text)));
        }

        let gemini_response: GeminiResponse = response.json().await.map_err(|e| {
            error!("Failed to parse Gemini response: {}", e);
            AgentError::Llm(format!("Gemini parse error: {}", e))
        })?;

        let answer = gemini_response
            .candidates
            .first()
            .and_then(|c| c.content.parts.first())
            .map(|p| p.text.clone())
            .ok_or_else(|| AgentError::Llm("Empty response from Gemini".to_string()))?;

        let confidence = calculate_confidence(&gemini_response);

        info!("Gemini response received (confidence: {})", confidence);

        Ok((answer, confidence))
    }
}

#[derive(Debug, Serialize)]
struct GeminiRequest {
    contents: Vec<Content>,
    generation_config: GenerationConfig,
    system_instruction: SystemInstruction,
}

#[derive(Debug, Serialize, Deserialize)]
struct Content {
    parts: Vec<Part>,
}

#[derive(Debug, Serialize, Deserialize)]
struct Part {
    text: String,
}

#[derive(Debug, Serialize)]
struct GenerationConfig {
    temperature: f32,
    top_p: f32,
    top_k: i32,
    max_output_tokens: i32,
}

#[derive(Debug, Serialize)]
struct SystemInstruction {
    parts: Vec<Part>,
}

#[derive(Debug, Deserialize)]
struct GeminiResponse {
    candidates: Vec<Candidate>,
}

#[derive(Debug, Deserialize)]
struct Candidate {
    content: Content,
    finish_reason: Option<String>,
}

/// Calculate response confidence
fn calculate_confidence(response: &GeminiResponse) -> f32 {
    let base_confidence: f32 = 0.85;

    let finish_confidence = match response
        .candidates
        .first()
        .and_then(|c| c.finish_reason.as_deref())
    {
        Some("STOP") => 1.0,
        Some("LENGTH") => 0.8,
        Some("SAFETY") => 0.6,
        _ => 0.7,
    };

    let response_length = response
        .candidates
        .first()
        .and_then(|c| c.content.parts.first())
        .map(|p| p.text.len())
        .unwrap_or(0);

    let length_confidence = if response_length < 30 {
        0.6
    } else if response_length > 2000 {
        0.8
    } else {
        1.0
    };

    (base_confidence * finish_confidence * length_confidence).clamp(0.5, 0.98)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_serialization() {
        let request = GeminiRequest {
            contents: vec![Content {
                parts: vec![Part {
                    text: "{\"type\":\"day_overview\"}".to_string(),
                }],
            }],
            generation_config: GenerationConfig {
                temperature: 0.3,
                top_p: 0.9,
                top_k: 40,
                max_output_tokens: 512,
            },
            system_instruction: SystemInstruction {
                parts: vec![Part {
                    text: SYSTEM_PROMPT.to_string(),
                }],
            },
        };

        let json = serde_json::to_string(&request);
        assert!(json.is_ok());
        assert!(json.unwrap().contains("day_overview"));
    }

    #[test]
    fn test_missing_api_key() {
        let client = GeminiClient::new(String::new());
        let result = tokio_test::block_on(client.phrase("{}"));
        assert!(result.is_err());
        assert!(result.unwrap_err().to_string().to_lowercase().contains("api key"));
    }
}
