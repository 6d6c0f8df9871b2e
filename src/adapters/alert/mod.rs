//! Alert adapter: Telegram delivery with dry-run and transport-side dedupe.

mod telegram;

pub use telegram::{TelegramConfig, TelegramNotifier};
