pub mod commands;
pub mod updates;

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde_json::json;
use std::time::Duration;
use tracing::{info, warn};

use crate::config::TelegramConfig;

pub use commands::{Command, CommandHandler};
pub use updates::UpdatePoller;

/// Outbound chat transport.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn send(&self, message: &str) -> Result<()>;
}

/// Notifier used when Telegram is disabled; messages only reach the log.
#[derive(Debug, Clone, Default)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn send(&self, message: &str) -> Result<()> {
        info!("[notify] {}", message.replace('\n', " | "));
        Ok(())
    }
}

#[derive(Clone)]
pub struct TelegramNotifier {
    client: Client,
    api_url: String,
    bot_token: String,
    chat_id: String,
}

impl TelegramNotifier {
    pub fn new(bot_token: String, chat_id: String) -> Self {
        Self::with_api_url("https://api.telegram.org".to_string(), bot_token, chat_id)
    }

    pub fn with_api_url(api_url: String, bot_token: String, chat_id: String) -> Self {
        Self {
            client: Client::builder()
                .timeout(Duration::from_secs(15))
                .build()
                .unwrap_or_default(),
            api_url: api_url.trim_end_matches('/').to_string(),
            bot_token,
            chat_id,
        }
    }

    pub fn from_config(config: &TelegramConfig) -> Option<Self> {
        match (&config.bot_token, &config.chat_id) {
            (Some(token), Some(chat_id)) if config.enabled && !token.is_empty() => Some(Self::with_api_url(
                config.api_url.clone(),
                token.clone(),
                chat_id.clone(),
            )),
            _ => None,
        }
    }

    pub fn chat_id(&self) -> &str {
        &self.chat_id
    }

    pub(crate) fn method_url(&self, method: &str) -> String {
        format!("{}/bot{}/{}", self.api_url, self.bot_token, method)
    }

    pub(crate) fn client(&self) -> &Client {
        &self.client
    }

    pub async fn send_message_to(&self, chat_id: &str, message: &str) -> Result<()> {
        self.client
            .post(self.method_url("sendMessage"))
            .json(&json!({
                "chat_id": chat_id,
                "text": message,
                "parse_mode": "HTML"
            }))
            .send()
            .await
            .context("telegram sendMessage request failed")?
            .error_for_status()
            .context("telegram sendMessage rejected")?;

        info!("Message sent successfully: {}...", preview(message));
        Ok(())
    }

    pub async fn send_message(&self, message: &str) -> Result<()> {
        self.send_message_to(&self.chat_id, message).await
    }
}

#[async_trait]
impl Notifier for TelegramNotifier {
    async fn send(&self, message: &str) -> Result<()> {
        let result = self.send_message(message).await;
        if let Err(e) = &result {
            warn!("Telegram error: {:#}", e);
        }
        result
    }
}

pub fn startup_message(symbol: &str, provider: &str, layers: usize) -> String {
    format!(
        "🚀 <b>Alert Bot Started</b>\n\n\
         📊 Symbol: {}\n\
         🌐 Price API: {}\n\
         💼 Positions: {} layers",
        symbol, provider, layers
    )
}

pub fn shutdown_message(symbol: &str) -> String {
    format!(
        "🛑 <b>Alert Bot Stopped</b>\n\n\
         📊 Symbol: {}",
        symbol
    )
}

pub fn paused_message(consecutive_errors: u32) -> String {
    format!(
        "⚠️ <b>Bot paused</b> after {} consecutive API errors. Please check API status.",
        consecutive_errors
    )
}

pub fn error_message(symbol: &str, error: &str) -> String {
    let error: String = error.chars().take(200).collect();
    format!(
        "⚠️ <b>Error</b>\n\n\
         📊 Symbol: {}\n\
         ❌ Error: {}",
        symbol,
        escape_html(&error)
    )
}

/// Escapes text for Telegram's HTML parse mode.
pub(crate) fn escape_html(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            _ => out.push(c),
        }
    }
    out
}

fn preview(message: &str) -> String {
    message.chars().take(50).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_config_requires_credentials() {
        let mut config = TelegramConfig::default();
        assert!(TelegramNotifier::from_config(&config).is_none());

        config.bot_token = Some("123:abc".to_string());
        config.chat_id = Some("42".to_string());
        let notifier = TelegramNotifier::from_config(&config).unwrap();
        assert_eq!(notifier.chat_id(), "42");
        assert_eq!(
            notifier.method_url("sendMessage"),
            "https://api.telegram.org/bot123:abc/sendMessage"
        );

        config.enabled = false;
        assert!(TelegramNotifier::from_config(&config).is_none());
    }

    #[test]
    fn test_error_message_is_truncated() {
        let long = "x".repeat(500);
        let msg = error_message("SHB", &long);
        assert!(msg.len() < 300);
        assert!(msg.contains("SHB"));
    }

    #[test]
    fn test_error_message_escapes_html() {
        let msg = error_message("SHB", "expected <html> & got </body>");
        assert!(msg.contains("expected &lt;html&gt; &amp; got &lt;/body&gt;"));
        assert!(!msg.contains("<html>"));
        // Markup of the notice itself is kept.
        assert!(msg.contains("<b>Error</b>"));
    }

    #[tokio::test]
    async fn test_log_notifier_never_fails() {
        assert!(LogNotifier.send("hello\nworld").await.is_ok());
    }
}
