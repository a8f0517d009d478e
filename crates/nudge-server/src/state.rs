use std::sync::Arc;

use nudge_bus::BroadcastHub;
use nudge_core::PassiveChat;
use nudge_memory::{ChatHistoryStore, ProfileStore};
use nudge_scheduler::RunStateStore;

/// Shared application state accessible from all route handlers.
#[derive(Clone)]
pub struct AppState {
    pub hub: BroadcastHub,
    pub profiles: ProfileStore,
    pub chats: Arc<ChatHistoryStore>,
    /// Passive turns posted from the chat UI.
    pub chat: Arc<PassiveChat>,
    pub states: RunStateStore,
    /// Used when a request carries no `user_id`.
    pub default_user_id: String,
}
