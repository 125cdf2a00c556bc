use std::sync::OnceLock;

use nostr_sdk::prelude::{nip04, Event, Keys, PublicKey};
use regex::Regex;

use crate::state::{ChatMessage, ContentKind, MessageDeliveryState};

pub(crate) const DECRYPT_FAILED_PLACEHOLDER: &str = "[Decryption failed]";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Direction {
    Inbound,
    Outbound,
}

/// Does `event` belong to the 1:1 conversation between `me` and `peer`, and
/// in which direction? Events that merely mention one of the two (wrong
/// author, or author right but recipient tag missing) are unrelated.
pub(crate) fn classify(event: &Event, me: &PublicKey, peer: &PublicKey) -> Option<Direction> {
    if event.pubkey == *peer && has_recipient(event, me) {
        return Some(Direction::Inbound);
    }
    if event.pubkey == *me && has_recipient(event, peer) {
        return Some(Direction::Outbound);
    }
    None
}

pub(crate) fn has_recipient(event: &Event, key: &PublicKey) -> bool {
    event.tags.public_keys().any(|pk| pk == key)
}

/// Raw event -> display-ready message. Decrypt failure is per-message and
/// recoverable: the message is kept with a placeholder and the failed flag
/// instead of being dropped.
pub(crate) fn decrypt_event(
    keys: &Keys,
    event: &Event,
    me: &PublicKey,
    peer: &PublicKey,
) -> ChatMessage {
    // The shared secret is with the counterparty: the non-`me` side of
    // {sender, peer}.
    let counterparty = if event.pubkey == *me {
        *peer
    } else {
        event.pubkey
    };
    let (content, decrypt_failed) =
        match nip04::decrypt(keys.secret_key(), &counterparty, event.content.as_str()) {
            Ok(plain) => (plain, false),
            Err(e) => {
                tracing::debug!(id = %event.id, err = %e, "nip04 decrypt failed");
                (DECRYPT_FAILED_PLACEHOLDER.to_string(), true)
            }
        };
    let is_mine = event.pubkey == *me;
    ChatMessage {
        id: event.id.to_hex(),
        sender_pubkey: event.pubkey.to_hex(),
        content_kind: content_kind(&content),
        content,
        timestamp: event.created_at.as_secs(),
        is_mine,
        decrypt_failed,
        delivery: MessageDeliveryState::Sent,
    }
}

fn image_link_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?i)^https?://.+\.(jpg|jpeg|png|gif|webp|svg)(\?.*)?$").expect("static regex")
    })
}

pub(crate) fn content_kind(text: &str) -> ContentKind {
    if image_link_re().is_match(text.trim()) {
        ContentKind::ImageLink
    } else {
        ContentKind::Text
    }
}
