use std::sync::Arc;
use tracing::{error, info};

use crate::format::{format_amount, format_price, format_quantity};
use crate::market::Clock;
use crate::position::SharedPosition;
use crate::storage::DataStore;

use super::escape_html;

#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Start,
    Buy(Vec<String>),
    Position,
}

impl Command {
    /// Parses `/start`, `/buy <price> <qty>` and `/position`, with or without
    /// a `@botname` suffix. Anything else is not a command for us.
    pub fn parse(text: &str) -> Option<Self> {
        let mut parts = text.split_whitespace();
        let head = parts.next()?.strip_prefix('/')?;
        let name = head.split('@').next().unwrap_or(head).to_lowercase();
        let args: Vec<String> = parts.map(str::to_string).collect();

        match name.as_str() {
            "start" | "help" => Some(Command::Start),
            "buy" => Some(Command::Buy(args)),
            "position" => Some(Command::Position),
            _ => None,
        }
    }
}

/// Services chat commands against the shared position. The only writer of
/// the position.
pub struct CommandHandler {
    position: SharedPosition,
    store: DataStore,
    clock: Arc<dyn Clock>,
    summary_minutes: i64,
}

impl CommandHandler {
    pub fn new(position: SharedPosition, store: DataStore, clock: Arc<dyn Clock>, summary_minutes: i64) -> Self {
        Self {
            position,
            store,
            clock,
            summary_minutes,
        }
    }

    /// Reply for `text`, or `None` if it is not a recognised command.
    pub fn handle(&self, text: &str) -> Option<String> {
        let reply = match Command::parse(text)? {
            Command::Start => self.start(),
            Command::Buy(args) => self.buy(&args),
            Command::Position => self.show_position(),
        };
        Some(reply)
    }

    fn start(&self) -> String {
        format!(
            "🤖 <b>{} Alert Bot</b>\n\n\
             Commands:\n\
             /buy &lt;price&gt; &lt;qty&gt; - add a buy layer\n\
             \u{20}  Example: /buy 16.5 1000\n\n\
             /position - show the current position\n\n\
             Price updates every {} minutes ⏰",
            self.position.symbol(),
            self.summary_minutes
        )
    }

    fn buy(&self, args: &[String]) -> String {
        if args.len() != 2 {
            return "❌ Usage: /buy &lt;price&gt; &lt;qty&gt;\nExample: /buy 16.5 1000".to_string();
        }

        let (Ok(price), Ok(quantity)) = (args[0].parse::<f64>(), args[1].parse::<i64>()) else {
            return "❌ Price and quantity must be numbers".to_string();
        };

        let layer = match self.position.append(price, quantity, self.clock.as_ref()) {
            Ok(layer) => layer,
            Err(e) => return format!("❌ {}", e),
        };
        info!("Added buy position: {} @ {}", layer.quantity, layer.price);

        if let Err(e) = self.store.save(&self.position.to_document()) {
            error!("Error saving position after /buy: {}", e);
            return format!("❌ Layer added but saving failed: {}", escape_html(&e.to_string()));
        }

        let snap = self.position.snapshot();
        format!(
            "✅ Added buy layer:\n\
             \u{20}  Price: {}\n\
             \u{20}  Qty: {}\n\n\
             💼 Position ({} layers):\n\
             \u{20}  Avg: {}\n\
             \u{20}  Total qty: {}",
            format_price(layer.price),
            format_quantity(layer.quantity),
            snap.layers.len(),
            format_price(snap.average_price),
            format_quantity(snap.total_quantity)
        )
    }

    fn show_position(&self) -> String {
        let snap = self.position.snapshot();
        if snap.is_empty() {
            return "📭 No position yet".to_string();
        }

        let mut msg = format!("💼 <b>{} position</b> ({} layers):\n\n", snap.symbol, snap.layers.len());
        for (i, layer) in snap.layers.iter().enumerate() {
            msg.push_str(&format!(
                "{}. {} @ {}\n   🕐 {}\n\n",
                i + 1,
                format_quantity(layer.quantity),
                format_price(layer.price),
                layer.time.format("%d/%m %H:%M")
            ));
        }
        msg.push_str(&format!(
            "📈 Summary:\n\
             \u{20}  Avg: {}\n\
             \u{20}  Total qty: {}\n\
             \u{20}  Total value: {}",
            format_price(snap.average_price),
            format_quantity(snap.total_quantity),
            format_amount(snap.total_value())
        ));
        msg
    }
}
