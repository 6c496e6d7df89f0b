//! Vision-model adapter for the HTTP explain endpoint
//!
//! Sends a question plus a base64 image to an OpenAI-compatible multimodal
//! chat endpoint and returns the text answer.

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde_json::json;

use super::Vision;
use crate::config::Config;

pub struct OpenAiVision {
    base_url: String,
    api_key: String,
    model: String,
    client: Client,
}

impl OpenAiVision {
    pub fn new(base_url: &str, api_key: &str, model: &str) -> Self {
        let mut base_url = base_url.trim_end_matches('/').to_string();
        if !base_url.ends_with("/v1") {
            base_url.push_str("/v1");
        }
        Self {
            base_url,
            api_key: api_key.to_string(),
            model: model.to_string(),
            client: Client::new(),
        }
    }

    pub fn from_config(config: &Config, provider_name: &str) -> Self {
        let provider = config.provider(provider_name);
        let base_url = if provider.base_url.is_empty() {
            "http://localhost:11434/v1"
        } else {
            &provider.base_url
        };
        Self::new(base_url, &provider.api_key, &provider.model)
    }
}

#[async_trait]
impl Vision for OpenAiVision {
    async fn explain(&self, question: &str, image_base64: &str) -> Result<String> {
        let body = json!({
            "model": self.model,
            "messages": [{
                "role": "user",
                "content": [
                    { "type": "text", "text": question },
                    { "type": "image_url",
                      "image_url": { "url": format!("data:image/jpeg;base64,{image_base64}") } }
                ]
            }]
        });

        let mut builder = self
            .client
            .post(format!("{}/chat/completions", self.base_url));
        if !self.api_key.is_empty() {
            builder = builder.header("Authorization", format!("Bearer {}", self.api_key));
        }
        let response = builder
            .json(&body)
            .send()
            .await
            .context("Failed to reach vision backend")?;

        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            return Err(anyhow!("Vision API error ({}): {}", status, text));
        }

        let parsed: serde_json::Value = response
            .json()
            .await
            .context("Failed to parse vision response")?;
        Ok(parsed["choices"][0]["message"]["content"]
            .as_str()
            .unwrap_or("")
            .to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_base_url_normalization() {
        let vision = OpenAiVision::new("http://localhost:8080/", "", "llava");
        assert_eq!(vision.base_url, "http://localhost:8080/v1");
    }
}
