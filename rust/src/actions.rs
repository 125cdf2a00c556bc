#[derive(Debug, Clone)]
pub enum AppAction {
    // Auth
    Login {
        nsec: String,
    },
    Logout,

    // Conversation
    OpenConversation {
        peer: String,
    },
    CloseConversation,
    SendMessage {
        content: String,
    },
    MarkConversationRead,

    // Roster
    AddContact {
        key: String,
    },
    RemoveContact {
        pubkey: String,
    },

    // UI
    ClearToast,
}

impl AppAction {
    /// Log-safe action tag (never includes secrets like `nsec` or message text).
    pub fn tag(&self) -> &'static str {
        match self {
            // Auth
            AppAction::Login { .. } => "Login",
            AppAction::Logout => "Logout",

            // Conversation
            AppAction::OpenConversation { .. } => "OpenConversation",
            AppAction::CloseConversation => "CloseConversation",
            AppAction::SendMessage { .. } => "SendMessage",
            AppAction::MarkConversationRead => "MarkConversationRead",

            // Roster
            AppAction::AddContact { .. } => "AddContact",
            AppAction::RemoveContact { .. } => "RemoveContact",

            // UI
            AppAction::ClearToast => "ClearToast",
        }
    }
}
