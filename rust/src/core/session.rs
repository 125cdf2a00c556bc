use std::collections::HashSet;

use nostr_sdk::prelude::{Filter, Kind, PublicKey};

use crate::state::{ChatMessage, MessageDeliveryState};

use super::ledger::ReadStateLedger;

/// Most messages an open conversation keeps in memory; older ones drop off.
pub(crate) const WINDOW_CAP: usize = 200;
/// Backfill request depth, deliberately above the window cap so the cap, not
/// relay behavior, decides what survives.
pub(crate) const BACKFILL_LIMIT: usize = 400;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum SessionPhase {
    /// Backfill in progress; events buffer unexposed.
    Loading,
    /// Window published; live events merge in as they arrive.
    Subscribed,
}

/// The single active conversation. Opening a new one closes the old one; the
/// epoch embedded in the subscription id keeps late deliveries for a
/// superseded session from ever reaching the new window.
pub(crate) struct ConversationSession {
    pub(crate) peer: PublicKey,
    pub(crate) sub_id: String,
    phase: SessionPhase,
    /// Ids ever admitted this session. Survives cap evictions, so a
    /// capped-out event redelivered by another relay does not reappear.
    seen: HashSet<String>,
    buffer: Vec<ChatMessage>,
    window: Vec<ChatMessage>,
}

impl ConversationSession {
    pub(crate) fn open(peer: PublicKey, epoch: u64) -> Self {
        Self {
            peer,
            sub_id: format!("conv-{epoch}"),
            phase: SessionPhase::Loading,
            seen: HashSet::new(),
            buffer: Vec::new(),
            window: Vec::new(),
        }
    }

    /// Both directions of the conversation, bounded history.
    pub(crate) fn filter(&self, me: &PublicKey) -> Filter {
        Filter::new()
            .authors([*me, self.peer])
            .kind(Kind::EncryptedDirectMessage)
            .pubkeys([*me, self.peer])
            .limit(BACKFILL_LIMIT)
    }

    pub(crate) fn loading(&self) -> bool {
        self.phase == SessionPhase::Loading
    }

    pub(crate) fn messages(&self) -> &[ChatMessage] {
        &self.window
    }

    /// Feed delivery for this session's subscription. Returns true when the
    /// visible window changed.
    pub(crate) fn on_event(&mut self, msg: ChatMessage, ledger: &mut ReadStateLedger) -> bool {
        if !self.seen.insert(msg.id.clone()) {
            return false;
        }
        match self.phase {
            SessionPhase::Loading => {
                self.buffer.push(msg);
                false
            }
            SessionPhase::Subscribed => {
                let ts = msg.timestamp;
                self.window.push(msg);
                sort_and_cap(&mut self.window);
                ledger.mark_read(&self.peer.to_hex(), ts);
                true
            }
        }
    }

    /// End of stored history: publish the buffered backfill as the window
    /// and catch the ledger up to the newest message. Extra completion
    /// signals after the first are ignored.
    pub(crate) fn on_backfill_complete(&mut self, ledger: &mut ReadStateLedger) -> bool {
        if self.phase != SessionPhase::Loading {
            return false;
        }
        self.phase = SessionPhase::Subscribed;
        self.window = std::mem::take(&mut self.buffer);
        sort_and_cap(&mut self.window);
        if let Some(last) = self.window.last() {
            ledger.mark_read(&self.peer.to_hex(), last.timestamp);
        }
        true
    }

    /// Local echo for an outbound send, ahead of any acknowledgment. During
    /// loading it joins the backfill buffer so the flush cannot drop it.
    pub(crate) fn insert_local(&mut self, msg: ChatMessage) {
        if !self.seen.insert(msg.id.clone()) {
            return;
        }
        match self.phase {
            SessionPhase::Loading => self.buffer.push(msg),
            SessionPhase::Subscribed => {
                self.window.push(msg);
                sort_and_cap(&mut self.window);
            }
        }
    }

    /// Publish outcome for one of our optimistic messages.
    pub(crate) fn mark_delivery(&mut self, event_id: &str, delivery: MessageDeliveryState) -> bool {
        for m in self.window.iter_mut().chain(self.buffer.iter_mut()) {
            if m.id == event_id {
                m.delivery = delivery;
                return true;
            }
        }
        false
    }
}

fn sort_and_cap(window: &mut Vec<ChatMessage>) {
    // Stable sort: same-timestamp messages keep their arrival order.
    window.sort_by_key(|m| m.timestamp);
    if window.len() > WINDOW_CAP {
        let excess = window.len() - WINDOW_CAP;
        window.drain(..excess);
    }
}
