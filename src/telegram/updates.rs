use anyhow::{Context, Result};
use serde::Deserialize;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use super::{CommandHandler, TelegramNotifier};

const RETRY_DELAY: Duration = Duration::from_secs(5);

#[derive(Debug, Deserialize)]
struct UpdatesResponse {
    ok: bool,
    #[serde(default)]
    result: Vec<Update>,
    description: Option<String>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct Update {
    update_id: i64,
    message: Option<Message>,
}

#[derive(Debug, Deserialize)]
struct Message {
    chat: Chat,
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Chat {
    id: i64,
}

/// Long-polls `getUpdates` and answers commands from the configured chat.
pub struct UpdatePoller {
    notifier: TelegramNotifier,
    handler: CommandHandler,
    poll_timeout_secs: u64,
    offset: i64,
}

impl UpdatePoller {
    pub fn new(notifier: TelegramNotifier, handler: CommandHandler, poll_timeout_secs: u64) -> Self {
        Self {
            notifier,
            handler,
            poll_timeout_secs,
            offset: 0,
        }
    }

    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        info!("Telegram command handler polling for updates");

        // Drop updates queued before startup so a handled /buy is not replayed.
        tokio::select! {
            skipped = self.skip_backlog() => match skipped {
                Ok(0) => {}
                Ok(n) => info!("Skipped {} pending update(s) from before startup", n),
                Err(e) => warn!("Could not skip pending updates: {:#}", e),
            },
            _ = shutdown.changed() => return,
        }

        loop {
            let batch = tokio::select! {
                batch = self.fetch_updates(self.offset, self.poll_timeout_secs) => batch,
                _ = shutdown.changed() => break,
            };

            match batch {
                Ok(updates) => {
                    for update in updates {
                        self.process(update).await;
                    }
                }
                Err(e) => {
                    warn!("getUpdates failed: {:#}", e);
                    tokio::select! {
                        _ = tokio::time::sleep(RETRY_DELAY) => {}
                        _ = shutdown.changed() => break,
                    }
                }
            }
        }

        info!("Telegram command handler stopped");
    }

    async fn skip_backlog(&mut self) -> Result<usize> {
        // A negative offset returns only the newest update and forgets the rest.
        let pending = self.fetch_updates(-1, 0).await?;
        self.acknowledge(&pending);
        Ok(pending.len())
    }

    /// Moves the offset past every update in `updates`.
    fn acknowledge(&mut self, updates: &[Update]) {
        if let Some(last) = updates.iter().map(|u| u.update_id).max() {
            self.offset = self.offset.max(last + 1);
        }
    }

    async fn fetch_updates(&self, offset: i64, timeout_secs: u64) -> Result<Vec<Update>> {
        let response: UpdatesResponse = self
            .notifier
            .client()
            .get(self.notifier.method_url("getUpdates"))
            .query(&[
                ("offset", offset.to_string()),
                ("timeout", timeout_secs.to_string()),
                ("allowed_updates", r#"["message"]"#.to_string()),
            ])
            .timeout(Duration::from_secs(timeout_secs + 10))
            .send()
            .await
            .context("getUpdates request failed")?
            .json()
            .await
            .context("getUpdates returned invalid json")?;

        if !response.ok {
            anyhow::bail!(
                "getUpdates rejected: {}",
                response.description.unwrap_or_else(|| "unknown error".to_string())
            );
        }
        Ok(response.result)
    }

    async fn process(&mut self, update: Update) {
        self.acknowledge(std::slice::from_ref(&update));

        let Some(reply) = self.reply_for(&update) else {
            return;
        };
        let chat_id = update.message.as_ref().map(|m| m.chat.id.to_string()).unwrap_or_default();
        if let Err(e) = self.notifier.send_message_to(&chat_id, &reply).await {
            warn!("Failed to reply to command: {:#}", e);
        }
    }

    pub(crate) fn reply_for(&self, update: &Update) -> Option<String> {
        let message = update.message.as_ref()?;
        let text = message.text.as_deref()?;

        if message.chat.id.to_string() != self.notifier.chat_id() {
            debug!("Ignoring message from unknown chat {}", message.chat.id);
            return None;
        }

        debug!("Command received: {}", text);
        self.handler.handle(text)
    }
}
