use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde_json::{json, Value};

use crate::config::{self, CONFIG};

use super::TranslationBackend;

/// Chat-completions backend. Works against api.openai.com and any
/// compatible server (local LLM gateways included) via the configured base
/// URL.
#[derive(Debug)]
pub struct OpenAiBackend {
    client: Client,
}

impl OpenAiBackend {
    pub fn new() -> Self {
        let timeout: config::CollaboratorTimeoutSeconds = CONFIG.get_value();
        let client = Client::builder()
            .timeout(Duration::from_secs(timeout.0.max(30)))
            .build()
            .expect("reqwest client with static configuration");
        Self { client }
    }

    fn build_prompt(lines: &[String], source_lang: &str, target_lang: &str) -> String {
        let numbered: Vec<String> = lines
            .iter()
            .enumerate()
            .map(|(i, line)| format!("{}|{}", i + 1, line.replace('\n', "\\n")))
            .collect();
        format!(
            "Translate the following {count} subtitle lines from {source_lang} to {target_lang}.\n\
             Each input line is `index|text`. Reply with exactly {count} lines in the same\n\
             `index|text` format, same order, nothing else. Keep `\\n` markers. Text wrapped\n\
             in ⟦ ⟧ is already translated and must be preserved exactly, including the markers.\n\n{}",
            numbered.join("\n"),
            count = lines.len(),
        )
    }

    fn parse_reply(reply: &str, expected: usize) -> anyhow::Result<Vec<String>> {
        let mut out = vec![String::new(); expected];
        let mut seen = 0usize;
        for line in reply.lines() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let Some((index, text)) = line.split_once('|') else {
                continue;
            };
            let Ok(index) = index.trim().parse::<usize>() else {
                continue;
            };
            if index == 0 || index > expected {
                continue;
            }
            out[index - 1] = text.replace("\\n", "\n");
            seen += 1;
        }
        if seen != expected {
            anyhow::bail!("backend returned {seen} lines, expected {expected}");
        }
        Ok(out)
    }
}

impl Default for OpenAiBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TranslationBackend for OpenAiBackend {
    fn name(&self) -> &str {
        "openai"
    }

    async fn translate(
        &self,
        lines: &[String],
        source_lang: &str,
        target_lang: &str,
    ) -> anyhow::Result<Vec<String>> {
        let base_url: config::OpenAiBaseUrl = CONFIG.get_value();
        let model: config::OpenAiModel = CONFIG.get_value();
        let key: config::OpenAiKey = CONFIG.get_value();
        let Some(api_key) = key.0 else {
            anyhow::bail!("openai_key is not configured");
        };

        let body = json!({
            "model": model.0,
            "temperature": 0.2,
            "messages": [
                {
                    "role": "system",
                    "content": "You are a subtitle translator. You preserve meaning, tone and length constraints of subtitles."
                },
                {
                    "role": "user",
                    "content": Self::build_prompt(lines, source_lang, target_lang)
                }
            ]
        });

        let response = self
            .client
            .post(format!("{}/chat/completions", base_url.0.trim_end_matches('/')))
            .bearer_auth(api_key)
            .json(&body)
            .send()
            .await?;
        let status = response.status();
        let payload: Value = response.json().await?;
        if !status.is_success() {
            let message = payload["error"]["message"]
                .as_str()
                .unwrap_or("unknown error");
            anyhow::bail!("translation request failed ({status}): {message}");
        }
        let content = payload["choices"][0]["message"]["content"]
            .as_str()
            .ok_or_else(|| anyhow::anyhow!("response has no message content"))?;
        Self::parse_reply(content, lines.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prompt_numbers_every_line() {
        let lines = vec!["hello".to_string(), "two\nlines".to_string()];
        let prompt = OpenAiBackend::build_prompt(&lines, "en", "de");
        assert!(prompt.contains("1|hello"));
        assert!(prompt.contains("2|two\\nlines"));
        assert!(prompt.contains("exactly 2 lines"));
    }

    #[test]
    fn reply_parsing_restores_order_and_newlines() {
        let reply = "2|zwei\\nZeilen\n1|hallo\n";
        let parsed = OpenAiBackend::parse_reply(reply, 2).unwrap();
        assert_eq!(parsed[0], "hallo");
        assert_eq!(parsed[1], "zwei\nZeilen");
    }

    #[test]
    fn mismatched_reply_is_an_error() {
        assert!(OpenAiBackend::parse_reply("1|only one", 2).is_err());
        assert!(OpenAiBackend::parse_reply("garbage without pipes", 1).is_err());
    }
}
