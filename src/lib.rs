#![deny(missing_docs)]
//! chatpix-bot
//!
//! A Telegram bot that answers text messages with a chat model and turns
//! `/image` prompts into pictures paid for from a prepaid balance.

/// Telegram bot implementation
pub mod bot;
/// Configuration management
pub mod config;
/// LLM providers
pub mod llm;
/// Storage layer (PostgreSQL)
pub mod storage;
/// Text rendering helpers
pub mod utils;
