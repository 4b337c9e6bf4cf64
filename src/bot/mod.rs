/// Allow-list gate
pub mod access;
/// Request orchestration
pub mod dispatcher;
/// Reply chunking and delivery fallbacks
pub mod formatter;
/// Telegram command and message handlers
pub mod handlers;
/// Prepaid image balances
pub mod ledger;
/// Repeating chat action while a request is in flight
pub mod presence;
/// Outbound messaging interface and its Telegram implementation
pub mod transport;

pub use dispatcher::{DispatcherSettings, Outcome, RequestDispatcher};
pub use transport::{ChatTransport, TelegramTransport};
