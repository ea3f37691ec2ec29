// Copyright (c) 2025-2026 Archipel Contributors
// SPDX-License-Identifier: MPL-2.0
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//! Optional text-generation collaborator.
//!
//! The node itself never touches this module: its absence or failure has
//! no effect on transport or transfer correctness.  Errors are reported to
//! the caller only.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatTurn {
    pub role: String,
    pub content: String,
}

#[async_trait]
pub trait TextGenerator: Send + Sync {
    /// Generate a reply to `prompt` given a prior conversation.
    async fn generate(&self, prompt: &str, history: &[ChatTurn]) -> anyhow::Result<String>;
}

#[derive(Debug, Clone)]
pub struct TextGenConfig {
    pub api_endpoint: String,
    pub api_key: String,
    pub model: String,
    pub timeout_secs: u64,
}

/// OpenAI-style chat-completions client.
#[derive(Debug)]
pub struct HttpTextGenerator {
    config: TextGenConfig,
    client: reqwest::Client,
}

impl HttpTextGenerator {
    pub fn new(config: TextGenConfig) -> anyhow::Result<Self> {
        if config.api_key.trim().is_empty() {
            anyhow::bail!("text generation requires an API key");
        }
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;
        Ok(Self { config, client })
    }
}

#[async_trait]
impl TextGenerator for HttpTextGenerator {
    async fn generate(&self, prompt: &str, history: &[ChatTurn]) -> anyhow::Result<String> {
        let mut messages: Vec<serde_json::Value> = history
            .iter()
            .map(|turn| serde_json::json!({ "role": turn.role, "content": turn.content }))
            .collect();
        messages.push(serde_json::json!({ "role": "user", "content": prompt }));

        let response = self
            .client
            .post(format!("{}/chat/completions", self.config.api_endpoint))
            .header("Authorization", format!("Bearer {}", self.config.api_key))
            .json(&serde_json::json!({
                "model": self.config.model,
                "messages": messages,
            }))
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("text generation request failed: {status} - {body}");
        }

        let body: serde_json::Value = response.json().await?;
        let text = body["choices"][0]["message"]["content"]
            .as_str()
            .ok_or_else(|| anyhow::anyhow!("no content in text generation response"))?;
        Ok(text.to_owned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_api_key_is_a_constructor_error() {
        let err = HttpTextGenerator::new(TextGenConfig {
            api_endpoint: "https://example.invalid/v1".to_owned(),
            api_key: "  ".to_owned(),
            model: "test".to_owned(),
            timeout_secs: 5,
        })
        .expect_err("blank key");
        assert!(err.to_string().contains("API key"));
    }
}
