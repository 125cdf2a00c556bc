use serde::{Deserialize, Serialize};

#[derive(Clone, Debug)]
pub struct AppState {
    pub rev: u64,
    pub auth: AuthState,
    pub contacts: Vec<Contact>,
    pub previews: Vec<ContactPreview>,
    pub conversation: Option<ConversationView>,
    pub toast: Option<String>,
}

impl AppState {
    pub fn empty() -> Self {
        Self {
            rev: 0,
            auth: AuthState::LoggedOut,
            contacts: vec![],
            previews: vec![],
            conversation: None,
            toast: None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum AuthState {
    LoggedOut,
    LoggedIn { npub: String, pubkey: String },
}

/// Roster entry. The serialized field names are the replicated-record format
/// (kind 10004 payload) and double as the local cache format.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Contact {
    pub pubkey: String,
    pub npub: String,
    pub nickname: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub picture: Option<String>,
    #[serde(rename = "addedAt")]
    pub added_at: u64,
}

/// Per-contact chat-list row: latest message preview plus the unread count
/// derived from the read-state ledger. Present for every roster contact,
/// empty/zero until data arrives.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ContactPreview {
    pub pubkey: String,
    pub npub: String,
    pub nickname: String,
    pub picture: Option<String>,
    pub last_message: Option<String>,
    pub last_message_at: Option<u64>,
    pub unread_count: u32,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ConversationView {
    pub peer_pubkey: String,
    pub peer_npub: String,
    /// True between open and the backfill-complete signal.
    pub loading: bool,
    pub messages: Vec<ChatMessage>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ChatMessage {
    pub id: String,
    pub sender_pubkey: String,
    pub content: String,
    pub timestamp: u64,
    pub is_mine: bool,
    pub content_kind: ContentKind,
    pub decrypt_failed: bool,
    pub delivery: MessageDeliveryState,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ContentKind {
    Text,
    ImageLink,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum MessageDeliveryState {
    Pending,
    Sent,
    Failed { reason: String },
}

pub fn now_seconds() -> u64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
