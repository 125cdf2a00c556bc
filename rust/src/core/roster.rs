use anyhow::Result;
use nostr_sdk::prelude::{
    nip04, Event, EventBuilder, Filter, Keys, Kind, Metadata, PublicKey, ToBech32,
};

use crate::state::{now_seconds, Contact};

/// Replaceable-range kind holding the encrypted contact list. The content is
/// the JSON contact array, NIP-04 encrypted to the owner's own key, so the
/// roster roams between devices without being public.
pub(crate) const ROSTER_KIND: Kind = Kind::Custom(10004);

/// Newest roster record for the owner. Relays treat the kind as replaceable,
/// but we still ask with a limit and pick the newest ourselves in case a
/// relay returns several.
pub(crate) fn roster_filter(me: &PublicKey) -> Filter {
    Filter::new().author(*me).kind(ROSTER_KIND).limit(1)
}

pub(crate) fn profile_filter(pubkey: &PublicKey) -> Filter {
    Filter::new().author(*pubkey).kind(Kind::Metadata).limit(1)
}

pub(crate) fn newest_record(events: Vec<Event>) -> Option<Event> {
    events.into_iter().max_by_key(|e| e.created_at)
}

pub(crate) fn encrypt_contacts(keys: &Keys, contacts: &[Contact]) -> Result<String> {
    let json = serde_json::to_string(contacts)?;
    Ok(nip04::encrypt(keys.secret_key(), &keys.public_key(), json)?)
}

pub(crate) fn decrypt_contacts(keys: &Keys, content: &str) -> Result<Vec<Contact>> {
    let json = nip04::decrypt(keys.secret_key(), &keys.public_key(), content)?;
    parse_contacts(&json)
}

/// Tolerant list parse: a malformed entry is dropped, not fatal, so one bad
/// record written by another client cannot wipe the whole roster.
pub(crate) fn parse_contacts(json: &str) -> Result<Vec<Contact>> {
    let entries: Vec<serde_json::Value> = serde_json::from_str(json)?;
    let mut contacts = Vec::with_capacity(entries.len());
    for entry in entries {
        match serde_json::from_value::<Contact>(entry) {
            Ok(mut contact) => {
                contact.pubkey = contact.pubkey.to_lowercase();
                contacts.push(contact);
            }
            Err(e) => tracing::debug!("skipping malformed contact entry: {e}"),
        }
    }
    Ok(contacts)
}

pub(crate) fn build_roster_event(keys: &Keys, contacts: &[Contact]) -> Result<Event> {
    let cipher = encrypt_contacts(keys, contacts)?;
    Ok(EventBuilder::new(ROSTER_KIND, cipher).sign_with_keys(keys)?)
}

/// New roster entry for a resolved key, nickname taken from the profile when
/// one exists and is non-blank.
pub(crate) fn build_contact(pubkey: &PublicKey, metadata: Option<&Metadata>) -> Contact {
    let hex = pubkey.to_hex();
    let nickname = metadata
        .and_then(|m| m.name.as_deref())
        .map(str::trim)
        .filter(|n| !n.is_empty())
        .map(str::to_string)
        .unwrap_or_else(|| format!("Friend {}", &hex[..8]));
    Contact {
        npub: pubkey.to_bech32().unwrap_or_else(|_| hex.clone()),
        pubkey: hex,
        nickname,
        picture: metadata.and_then(|m| m.picture.clone()),
        added_at: now_seconds(),
    }
}
