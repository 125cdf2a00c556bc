use std::collections::HashMap;

use nostr_sdk::prelude::{Filter, Kind, PublicKey};

use crate::state::{ChatMessage, Contact, ContactPreview};

use super::classify::Direction;
use super::ledger::ReadStateLedger;

/// How far back the one-shot inbound query reaches when previews start up.
pub(crate) const SEED_LIMIT: usize = 400;

#[derive(Clone, Debug, PartialEq, Eq)]
struct LatestMessage {
    text: String,
    at: u64,
}

/// Per-contact unread counters and latest-message snippets, fed by one live
/// subscription per contact plus a one-shot seed query.
///
/// The aggregator is rebuilt (new generation, fresh subscriptions) whenever
/// the roster changes; counters persist across rebuilds so a roster edit does
/// not zero unread badges. The generation number is baked into subscription
/// ids and seed queries so anything still in flight for an old roster shape
/// can be recognized and dropped.
pub(crate) struct PreviewAggregator {
    generation: u64,
    /// contact hex -> event id -> created_at, inbound only.
    inbound: HashMap<String, HashMap<String, u64>>,
    /// contact hex -> newest message either direction.
    latest: HashMap<String, LatestMessage>,
}

impl PreviewAggregator {
    pub(crate) fn new() -> Self {
        Self {
            generation: 0,
            inbound: HashMap::new(),
            latest: HashMap::new(),
        }
    }

    pub(crate) fn generation(&self) -> u64 {
        self.generation
    }

    /// Start a new subscription generation. Counters are kept.
    pub(crate) fn rebuild(&mut self) -> u64 {
        self.generation += 1;
        self.generation
    }

    /// Drops all counters and snippets. Used at logout; the generation keeps
    /// counting up so queued results from the old identity stay stale.
    pub(crate) fn reset(&mut self) {
        self.inbound.clear();
        self.latest.clear();
    }

    /// Records one inbound event. Returns true when this id was new for the
    /// contact, i.e. the unread count may have changed.
    pub(crate) fn record_inbound(&mut self, contact: &str, event_id: &str, ts: u64) -> bool {
        let per_contact = self.inbound.entry(contact.to_string()).or_default();
        per_contact.insert(event_id.to_string(), ts) != Some(ts)
    }

    /// Offers a candidate latest message; newer-or-equal wins so an edit of
    /// the same second still replaces the snippet.
    pub(crate) fn offer_latest(&mut self, contact: &str, text: &str, ts: u64) -> bool {
        match self.latest.get(contact) {
            Some(current) if ts < current.at => false,
            Some(current) if current.at == ts && current.text == text => false,
            _ => {
                self.latest.insert(
                    contact.to_string(),
                    LatestMessage {
                        text: text.to_string(),
                        at: ts,
                    },
                );
                true
            }
        }
    }

    /// Applies one live event for a contact's preview subscription.
    pub(crate) fn on_live_event(
        &mut self,
        contact: &str,
        direction: Direction,
        msg: &ChatMessage,
    ) -> bool {
        let mut changed = false;
        if direction == Direction::Inbound {
            changed |= self.record_inbound(contact, &msg.id, msg.timestamp);
        }
        changed |= self.offer_latest(contact, &msg.content, msg.timestamp);
        changed
    }

    /// Derives the preview list for the given roster: unread counts against
    /// the read ledger, most recent activity first, contacts with no
    /// messages last, nickname breaking ties.
    pub(crate) fn previews(
        &self,
        contacts: &[Contact],
        ledger: &ReadStateLedger,
    ) -> Vec<ContactPreview> {
        let mut out: Vec<ContactPreview> = contacts
            .iter()
            .map(|c| {
                let last_read = ledger.get(&c.pubkey);
                let unread_count = self
                    .inbound
                    .get(&c.pubkey)
                    .map(|m| m.values().filter(|ts| **ts > last_read).count())
                    .unwrap_or(0) as u32;
                let latest = self.latest.get(&c.pubkey);
                ContactPreview {
                    pubkey: c.pubkey.clone(),
                    npub: c.npub.clone(),
                    nickname: c.nickname.clone(),
                    picture: c.picture.clone(),
                    last_message: latest.map(|l| l.text.clone()),
                    last_message_at: latest.map(|l| l.at),
                    unread_count,
                }
            })
            .collect();
        out.sort_by(|a, b| {
            b.last_message_at
                .cmp(&a.last_message_at)
                .then_with(|| a.nickname.cmp(&b.nickname))
        });
        out
    }
}

pub(crate) fn sub_id(generation: u64, contact: &PublicKey) -> String {
    format!("preview-{generation}-{}", contact.to_hex())
}

/// Inverse of [`sub_id`]; `None` for anything that is not a preview
/// subscription id.
pub(crate) fn parse_sub_id(id: &str) -> Option<(u64, &str)> {
    let rest = id.strip_prefix("preview-")?;
    let (generation, contact) = rest.split_once('-')?;
    Some((generation.parse().ok()?, contact))
}

/// Live tail of the conversation with one contact, either direction. One
/// stored event replays on open, which refreshes the snippet after restart.
pub(crate) fn live_filter(me: &PublicKey, contact: &PublicKey) -> Filter {
    Filter::new()
        .authors([*me, *contact])
        .kind(Kind::EncryptedDirectMessage)
        .pubkeys([*me, *contact])
        .limit(1)
}

/// One-shot inbound history used to seed the unread counter.
pub(crate) fn seed_filter(me: &PublicKey, contact: &PublicKey) -> Filter {
    Filter::new()
        .author(*contact)
        .kind(Kind::EncryptedDirectMessage)
        .pubkey(*me)
        .limit(SEED_LIMIT)
}
