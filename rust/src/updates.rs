use crate::state::{AppState, Contact};
use crate::AppAction;

#[derive(Clone, Debug)]
pub enum AppUpdate {
    FullState(AppState),
}

impl AppUpdate {
    pub fn rev(&self) -> u64 {
        match self {
            AppUpdate::FullState(s) => s.rev,
        }
    }
}

#[derive(Debug)]
pub enum CoreMsg {
    Action(AppAction),
    Internal(Box<InternalEvent>),
}

/// Messages the feed layer (and internal timers) send back to the actor.
/// Kept internal because they carry nostr-sdk types.
#[derive(Debug)]
pub enum InternalEvent {
    // Feed receive path
    FeedEvent {
        subscription: String,
        event: nostr_sdk::prelude::Event,
    },
    /// End of stored results for one subscription. The feed collapses
    /// per-relay signals so this arrives at most once per subscription id.
    FeedBackfillComplete {
        subscription: String,
    },

    // Async results
    FeedQueryResult {
        query: FeedQuery,
        events: Vec<nostr_sdk::prelude::Event>,
    },
    FeedPublishResult {
        intent: PublishIntent,
        ok: bool,
        error: Option<String>,
    },

    // Ledger reconciliation heartbeat (1s cadence while logged in).
    ReconcileTick,
}

#[derive(Clone, Debug)]
pub enum FeedQuery {
    /// Inbound-only backfill that seeds a contact's unread basis.
    /// `generation` ties the result to the preview subscription set that
    /// requested it; stale generations are dropped.
    PreviewSeed {
        generation: u64,
        contact: nostr_sdk::prelude::PublicKey,
    },
    /// Authoritative contact-list record for the local identity.
    Roster,
    /// Kind-0 metadata for a contact being added (nickname/picture).
    ContactProfile {
        pubkey: nostr_sdk::prelude::PublicKey,
    },
}

#[derive(Clone, Debug)]
pub enum PublishIntent {
    DirectMessage {
        peer: nostr_sdk::prelude::PublicKey,
        event_id: nostr_sdk::prelude::EventId,
    },
    /// Contact list waiting for its publish ack; adopted only on success.
    Roster {
        contacts: Vec<Contact>,
    },
}
