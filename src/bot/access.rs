//! Allow-list gate in front of every generation request.

use crate::storage::AccountStore;
use std::sync::Arc;
use tracing::{debug, error};

/// Answers whether a user may use the bot
#[derive(Clone)]
pub struct AccessGate {
    store: Arc<dyn AccountStore>,
}

impl AccessGate {
    /// Create a gate over the account store
    #[must_use]
    pub fn new(store: Arc<dyn AccountStore>) -> Self {
        Self { store }
    }

    /// Check the allow-list for `user_id`.
    ///
    /// A store failure denies access.
    pub async fn is_allowed(&self, user_id: i64) -> bool {
        match self.store.is_allowed(user_id).await {
            Ok(allowed) => {
                debug!(user_id, allowed, "Access check");
                allowed
            }
            Err(e) => {
                error!(user_id, error = %e, "Access check failed, denying");
                false
            }
        }
    }
}
