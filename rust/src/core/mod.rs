mod classify;
mod config;
mod ledger;
mod previews;
mod roster;
mod session;
mod storage;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use flume::Sender;

use crate::actions::AppAction;
use crate::feed::{Feed, FeedContext, SharedFeedFactory};
use crate::state::{
    AppState, AuthState, ChatMessage, Contact, ConversationView, MessageDeliveryState,
};
use crate::updates::{AppUpdate, CoreMsg, FeedQuery, InternalEvent, PublishIntent};

use nostr_sdk::prelude::*;

use classify::{classify, content_kind, decrypt_event, Direction};
use ledger::ReadStateLedger;
use previews::PreviewAggregator;
use session::ConversationSession;
use storage::{LocalStore, FRIENDS_CACHE_KEY};

/// Cadence at which ledger writes from other processes are folded in.
const RECONCILE_INTERVAL: Duration = Duration::from_secs(1);

/// Per-login identity and transport. Dropped wholesale at logout; `alive`
/// stops the reconcile ticker spawned for it.
struct Session {
    keys: Keys,
    feed: Arc<dyn Feed>,
    alive: Arc<AtomicBool>,
}

pub struct AppCore {
    state: AppState,
    rev: u64,

    update_sender: Sender<AppUpdate>,
    core_sender: Sender<CoreMsg>,
    shared_state: Arc<RwLock<AppState>>,

    config: config::AppConfig,
    runtime: tokio::runtime::Runtime,
    feed_factory: SharedFeedFactory,

    store: LocalStore,
    ledger: ReadStateLedger,

    session: Option<Session>,

    conversation: Option<ConversationSession>,
    /// Bumped on every open and close. The value is baked into conversation
    /// subscription ids, so deliveries for a superseded conversation can
    /// never match the current one.
    conversation_epoch: u64,

    previews: PreviewAggregator,
    /// Subscription ids opened for the current preview generation.
    preview_subs: Vec<String>,
}

impl AppCore {
    pub fn new(
        update_sender: Sender<AppUpdate>,
        core_sender: Sender<CoreMsg>,
        data_dir: String,
        shared_state: Arc<RwLock<AppState>>,
        feed_factory: SharedFeedFactory,
    ) -> Self {
        let config = config::load_app_config(&data_dir);
        let state = AppState::empty();

        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .enable_time()
            .enable_io()
            .build()
            .expect("tokio runtime");

        let store = LocalStore::new(&data_dir);
        let ledger = ReadStateLedger::load(store.clone());

        let this = Self {
            state,
            rev: 0,
            update_sender,
            core_sender,
            shared_state,
            config,
            runtime,
            feed_factory,
            store,
            ledger,
            session: None,
            conversation: None,
            conversation_epoch: 0,
            previews: PreviewAggregator::new(),
            preview_subs: Vec::new(),
        };

        // Ensure App::state() has an immediately-available snapshot.
        let snapshot = this.state.clone();
        this.commit_state_snapshot(&snapshot);
        this
    }

    fn next_rev(&mut self) -> u64 {
        self.rev += 1;
        self.state.rev = self.rev;
        self.rev
    }

    fn commit_state_snapshot(&self, snapshot: &AppState) {
        match self.shared_state.write() {
            Ok(mut g) => *g = snapshot.clone(),
            Err(poison) => *poison.into_inner() = snapshot.clone(),
        }
    }

    fn emit_state(&mut self) {
        self.next_rev();
        let snapshot = self.state.clone();
        self.commit_state_snapshot(&snapshot);
        let _ = self.update_sender.send(AppUpdate::FullState(snapshot));
    }

    fn toast(&mut self, msg: impl Into<String>) {
        // Keep toast in state until the host explicitly clears it. This makes
        // the UX robust to rev-gap resyncs (state() snapshot still contains
        // the toast).
        self.state.toast = Some(msg.into());
        self.emit_state();
    }

    fn is_logged_in(&self) -> bool {
        self.session.is_some()
    }

    pub fn handle_message(&mut self, msg: CoreMsg) {
        match msg {
            CoreMsg::Action(ref action) => {
                // Never log `?action` directly: it can contain secrets (e.g. `nsec`).
                tracing::info!(action = action.tag(), "dispatch");
                self.handle_action(action.clone());
            }
            CoreMsg::Internal(internal) => self.handle_internal(*internal),
        }
    }

    fn handle_internal(&mut self, internal: InternalEvent) {
        match internal {
            InternalEvent::FeedEvent {
                subscription,
                event,
            } => self.on_feed_event(&subscription, event),
            InternalEvent::FeedBackfillComplete { subscription } => {
                self.on_backfill_complete(&subscription)
            }
            InternalEvent::FeedQueryResult { query, events } => self.on_query_result(query, events),
            InternalEvent::FeedPublishResult { intent, ok, error } => {
                self.on_publish_result(intent, ok, error)
            }
            InternalEvent::ReconcileTick => {
                if self.ledger.reload_merge() {
                    self.refresh_previews();
                    self.emit_state();
                }
            }
        }
    }

    fn on_feed_event(&mut self, subscription: &str, event: Event) {
        let Some(keys) = self.session.as_ref().map(|s| s.keys.clone()) else {
            return;
        };
        let me = keys.public_key();

        if let Some(conv) = self.conversation.as_mut() {
            if conv.sub_id == subscription {
                let peer = conv.peer;
                if classify(&event, &me, &peer).is_none() {
                    return;
                }
                let msg = decrypt_event(&keys, &event, &me, &peer);
                if conv.on_event(msg, &mut self.ledger) {
                    // The ledger moved too, so unread badges recompute here.
                    self.sync_conversation_view();
                    self.refresh_previews();
                    self.emit_state();
                }
                return;
            }
        }

        if let Some((generation, contact_hex)) = previews::parse_sub_id(subscription) {
            if generation != self.previews.generation() {
                tracing::debug!(sub = subscription, "stale preview delivery dropped");
                return;
            }
            let Ok(contact) = PublicKey::parse(contact_hex) else {
                return;
            };
            let Some(direction) = classify(&event, &me, &contact) else {
                return;
            };
            let msg = decrypt_event(&keys, &event, &me, &contact);
            if self.previews.on_live_event(&contact.to_hex(), direction, &msg) {
                self.refresh_previews();
                self.emit_state();
            }
            return;
        }

        tracing::debug!(sub = subscription, "delivery for inactive subscription dropped");
    }

    fn on_backfill_complete(&mut self, subscription: &str) {
        let Some(conv) = self.conversation.as_mut() else {
            return;
        };
        if conv.sub_id != subscription {
            // Preview subscriptions have no loading phase; their completion
            // signal carries no information.
            return;
        }
        if conv.on_backfill_complete(&mut self.ledger) {
            self.sync_conversation_view();
            self.refresh_previews();
            self.emit_state();
        }
    }

    fn on_query_result(&mut self, query: FeedQuery, events: Vec<Event>) {
        match query {
            FeedQuery::PreviewSeed {
                generation,
                contact,
            } => self.on_preview_seed(generation, contact, events),
            FeedQuery::Roster => self.on_roster_loaded(events),
            FeedQuery::ContactProfile { pubkey } => self.on_contact_profile(pubkey, events),
        }
    }

    /// Seed result for one contact: unread basis only. Events are counted
    /// without being decrypted; snippets come from the live subscription.
    fn on_preview_seed(&mut self, generation: u64, contact: PublicKey, events: Vec<Event>) {
        if generation != self.previews.generation() {
            tracing::debug!(generation, "stale preview seed dropped");
            return;
        }
        let Some(me) = self.session.as_ref().map(|s| s.keys.public_key()) else {
            return;
        };
        let contact_hex = contact.to_hex();
        let mut changed = false;
        for event in &events {
            // The filter is inbound-only already; verify anyway.
            if classify(event, &me, &contact) != Some(Direction::Inbound) {
                continue;
            }
            changed |= self.previews.record_inbound(
                &contact_hex,
                &event.id.to_hex(),
                event.created_at.as_secs(),
            );
        }
        if changed {
            self.refresh_previews();
            self.emit_state();
        }
    }

    fn on_roster_loaded(&mut self, events: Vec<Event>) {
        let Some(keys) = self.session.as_ref().map(|s| s.keys.clone()) else {
            return;
        };
        let Some(record) = roster::newest_record(events) else {
            // Nothing published yet; whatever the cache said stands.
            return;
        };
        match roster::decrypt_contacts(&keys, &record.content) {
            Ok(contacts) => self.adopt_contacts(contacts),
            Err(e) => tracing::warn!(err = %e, "contact list record unreadable"),
        }
    }

    fn on_contact_profile(&mut self, pubkey: PublicKey, events: Vec<Event>) {
        if !self.is_logged_in() {
            return;
        }
        let hex = pubkey.to_hex();
        if self.state.contacts.iter().any(|c| c.pubkey == hex) {
            // A roster load raced us and already has this contact.
            return;
        }
        let metadata = roster::newest_record(events)
            .and_then(|ev| serde_json::from_str::<Metadata>(&ev.content).ok());
        let contact = roster::build_contact(&pubkey, metadata.as_ref());
        let mut next = self.state.contacts.clone();
        next.push(contact);
        self.publish_roster(next);
    }

    fn on_publish_result(&mut self, intent: PublishIntent, ok: bool, error: Option<String>) {
        match intent {
            PublishIntent::DirectMessage { peer, event_id } => {
                tracing::info!(ok, ?error, "dm publish result");
                let delivery = if ok {
                    MessageDeliveryState::Sent
                } else {
                    MessageDeliveryState::Failed {
                        reason: error.unwrap_or_else(|| "publish failed".to_string()),
                    }
                };
                let mut view_changed = false;
                if let Some(conv) = self.conversation.as_mut() {
                    if conv.peer == peer {
                        view_changed = conv.mark_delivery(&event_id.to_hex(), delivery);
                    }
                }
                if view_changed {
                    self.sync_conversation_view();
                }
                if !ok {
                    // The optimistic message stays in the window; only its
                    // delivery state records the failure.
                    self.toast("Failed to send message");
                } else if view_changed {
                    self.emit_state();
                }
            }
            PublishIntent::Roster { contacts } => {
                if ok {
                    self.adopt_contacts(contacts);
                } else {
                    tracing::warn!(?error, "contact list publish failed");
                    self.toast("Failed to update contacts");
                }
            }
        }
    }

    fn handle_action(&mut self, action: AppAction) {
        match action {
            AppAction::Login { nsec } => {
                let nsec = nsec.trim();
                if nsec.is_empty() {
                    self.toast("Enter an nsec");
                    return;
                }
                let keys = match Keys::parse(nsec) {
                    Ok(keys) => keys,
                    Err(e) => {
                        self.toast(format!("Invalid nsec: {e}"));
                        return;
                    }
                };
                if let Err(e) = self.start_session(keys) {
                    self.toast(format!("Login failed: {e:#}"));
                }
            }
            AppAction::Logout => {
                self.stop_session();
                self.emit_state();
            }
            AppAction::OpenConversation { peer } => self.open_conversation(&peer),
            AppAction::CloseConversation => {
                self.close_conversation();
                self.emit_state();
            }
            AppAction::SendMessage { content } => self.send_message(&content),
            AppAction::MarkConversationRead => self.mark_conversation_read(),
            AppAction::AddContact { key } => self.add_contact(&key),
            AppAction::RemoveContact { pubkey } => self.remove_contact(&pubkey),
            AppAction::ClearToast => {
                if self.state.toast.is_some() {
                    self.state.toast = None;
                    self.emit_state();
                }
            }
        }
    }

    fn open_conversation(&mut self, peer: &str) {
        if !self.is_logged_in() {
            self.toast("Not logged in");
            return;
        }
        let peer = match PublicKey::parse(peer.trim()) {
            Ok(pk) => pk,
            Err(e) => {
                self.toast(format!("Invalid pubkey: {e}"));
                return;
            }
        };
        self.close_conversation();
        self.conversation_epoch += 1;

        let Some(sess) = self.session.as_ref() else {
            return;
        };
        let me = sess.keys.public_key();
        let conv = ConversationSession::open(peer, self.conversation_epoch);
        sess.feed
            .open_subscription(conv.sub_id.clone(), conv.filter(&me));

        self.state.conversation = Some(ConversationView {
            peer_pubkey: peer.to_hex(),
            peer_npub: peer.to_bech32().unwrap_or_else(|_| peer.to_hex()),
            loading: true,
            messages: vec![],
        });
        self.conversation = Some(conv);
        self.emit_state();
    }

    /// Cancels the live subscription and advances the epoch so anything
    /// still in flight for the old conversation can no longer match.
    /// Callers emit.
    fn close_conversation(&mut self) {
        if let Some(conv) = self.conversation.take() {
            self.conversation_epoch += 1;
            if let Some(sess) = self.session.as_ref() {
                sess.feed.close_subscription(conv.sub_id);
            }
        }
        self.state.conversation = None;
    }

    fn send_message(&mut self, content: &str) {
        let text = content.trim();
        if text.is_empty() {
            return;
        }
        let Some(keys) = self.session.as_ref().map(|s| s.keys.clone()) else {
            self.toast("Not logged in");
            return;
        };
        let Some(peer) = self.conversation.as_ref().map(|c| c.peer) else {
            return;
        };

        let signed = nip04::encrypt(keys.secret_key(), &peer, text)
            .map_err(anyhow::Error::from)
            .and_then(|ciphertext| {
                EventBuilder::new(Kind::EncryptedDirectMessage, ciphertext)
                    .tag(Tag::public_key(peer))
                    .sign_with_keys(&keys)
                    .map_err(anyhow::Error::from)
            });
        let event = match signed {
            Ok(ev) => ev,
            Err(e) => {
                tracing::warn!(err = %e, "dm encrypt/sign failed");
                self.toast("Failed to send message");
                return;
            }
        };

        // Local echo ahead of any relay acknowledgment.
        let message = ChatMessage {
            id: event.id.to_hex(),
            sender_pubkey: keys.public_key().to_hex(),
            content: text.to_string(),
            timestamp: event.created_at.as_secs(),
            is_mine: true,
            content_kind: content_kind(text),
            decrypt_failed: false,
            delivery: MessageDeliveryState::Pending,
        };
        let sent_at = message.timestamp;
        if let Some(conv) = self.conversation.as_mut() {
            conv.insert_local(message);
        }
        // Sending implies having read everything up to this point.
        self.ledger.mark_read(&peer.to_hex(), sent_at);

        if let Some(sess) = self.session.as_ref() {
            sess.feed.publish(
                PublishIntent::DirectMessage {
                    peer,
                    event_id: event.id,
                },
                event,
            );
        }

        self.sync_conversation_view();
        self.refresh_previews();
        self.emit_state();
    }

    fn mark_conversation_read(&mut self) {
        let Some((peer_hex, newest)) = self
            .conversation
            .as_ref()
            .and_then(|c| c.messages().last().map(|m| (c.peer.to_hex(), m.timestamp)))
        else {
            return;
        };
        if self.ledger.mark_read(&peer_hex, newest) {
            self.refresh_previews();
            self.emit_state();
        }
    }

    fn add_contact(&mut self, key: &str) {
        let Some(me) = self.session.as_ref().map(|s| s.keys.public_key()) else {
            self.toast("Not logged in");
            return;
        };
        let normalized = crate::normalize_public_key(key);
        let Ok(pubkey) = PublicKey::parse(&normalized) else {
            self.toast("Please enter a valid npub or public key");
            return;
        };
        if pubkey == me {
            self.toast("You cannot add yourself");
            return;
        }
        let hex = pubkey.to_hex();
        if self.state.contacts.iter().any(|c| c.pubkey == hex) {
            self.toast("Friend already added");
            return;
        }
        // Nickname and picture come from the peer's profile; the new list is
        // published once that query answers.
        if let Some(sess) = self.session.as_ref() {
            sess.feed.query(
                FeedQuery::ContactProfile { pubkey },
                roster::profile_filter(&pubkey),
            );
        }
    }

    fn remove_contact(&mut self, pubkey: &str) {
        if !self.is_logged_in() {
            return;
        }
        let target = pubkey.trim().to_lowercase();
        let next: Vec<Contact> = self
            .state
            .contacts
            .iter()
            .filter(|c| c.pubkey != target)
            .cloned()
            .collect();
        if next.len() == self.state.contacts.len() {
            return;
        }
        self.publish_roster(next);
    }

    /// Publish-then-adopt: the new list becomes visible state only after at
    /// least one feed endpoint acknowledges the record.
    fn publish_roster(&mut self, contacts: Vec<Contact>) {
        let Some(sess) = self.session.as_ref() else {
            return;
        };
        let event = match roster::build_roster_event(&sess.keys, &contacts) {
            Ok(ev) => ev,
            Err(e) => {
                tracing::warn!(err = %e, "contact list encrypt/sign failed");
                self.toast("Failed to update contacts");
                return;
            }
        };
        sess.feed.publish(PublishIntent::Roster { contacts }, event);
    }

    /// Makes `contacts` the authoritative roster: state, cache, and a fresh
    /// preview subscription set.
    fn adopt_contacts(&mut self, contacts: Vec<Contact>) {
        if let Ok(json) = serde_json::to_string(&contacts) {
            self.store.set(FRIENDS_CACHE_KEY, &json);
        }
        self.state.contacts = contacts;
        self.rebuild_previews();
        self.emit_state();
    }

    fn start_session(&mut self, keys: Keys) -> anyhow::Result<()> {
        // Login over an existing session replaces it.
        self.stop_session();

        let pubkey = keys.public_key();
        let pubkey_hex = pubkey.to_hex();
        tracing::info!(pubkey = %pubkey_hex, "start_session");

        let factory = match self.feed_factory.read() {
            Ok(slot) => slot.clone(),
            Err(poison) => poison.into_inner().clone(),
        };
        let feed = factory.build(FeedContext {
            keys: keys.clone(),
            relays: self.default_relays(),
            network_enabled: self.network_enabled(),
            core_tx: self.core_sender.clone(),
            runtime: self.runtime.handle().clone(),
        })?;

        let alive = Arc::new(AtomicBool::new(true));
        self.session = Some(Session {
            keys,
            feed,
            alive: alive.clone(),
        });
        self.state.auth = AuthState::LoggedIn {
            npub: pubkey.to_bech32().unwrap_or_else(|_| pubkey_hex.clone()),
            pubkey: pubkey_hex,
        };

        // Cache first for an immediate roster; the authoritative record
        // replaces it when the query answers.
        self.state.contacts = self.load_cached_contacts();
        self.rebuild_previews();
        self.emit_state();

        if let Some(sess) = self.session.as_ref() {
            sess.feed
                .query(FeedQuery::Roster, roster::roster_filter(&pubkey));
        }

        let tick_tx = self.core_sender.clone();
        self.runtime.spawn(async move {
            loop {
                tokio::time::sleep(RECONCILE_INTERVAL).await;
                if !alive.load(Ordering::SeqCst) {
                    break;
                }
                if tick_tx
                    .send(CoreMsg::Internal(Box::new(InternalEvent::ReconcileTick)))
                    .is_err()
                {
                    break;
                }
            }
        });

        Ok(())
    }

    /// Tears down the feed session and clears everything that belongs to the
    /// logged-in identity. The read ledger survives: it is device-local, not
    /// identity-local. Callers emit.
    fn stop_session(&mut self) {
        self.close_conversation();
        if let Some(sess) = self.session.take() {
            sess.alive.store(false, Ordering::SeqCst);
            for id in self.preview_subs.drain(..) {
                sess.feed.close_subscription(id);
            }
            sess.feed.shutdown();
        }
        self.preview_subs.clear();
        self.previews.reset();
        self.state.auth = AuthState::LoggedOut;
        self.state.contacts.clear();
        self.state.previews.clear();
        self.state.conversation = None;
    }

    fn load_cached_contacts(&self) -> Vec<Contact> {
        self.store
            .get(FRIENDS_CACHE_KEY)
            .and_then(|raw| roster::parse_contacts(&raw).ok())
            .unwrap_or_default()
    }

    /// Tears down and reopens the per-contact live subscriptions and seed
    /// queries for the current roster. Unread counters survive; only the
    /// subscription set is rebuilt.
    fn rebuild_previews(&mut self) {
        let Some(sess) = self.session.as_ref() else {
            return;
        };
        let me = sess.keys.public_key();
        let generation = self.previews.rebuild();

        for id in self.preview_subs.drain(..) {
            sess.feed.close_subscription(id);
        }
        for contact in &self.state.contacts {
            let Ok(pk) = PublicKey::parse(&contact.pubkey) else {
                tracing::debug!(pubkey = %contact.pubkey, "unparseable contact skipped");
                continue;
            };
            let id = previews::sub_id(generation, &pk);
            sess.feed
                .open_subscription(id.clone(), previews::live_filter(&me, &pk));
            self.preview_subs.push(id);
            sess.feed.query(
                FeedQuery::PreviewSeed {
                    generation,
                    contact: pk,
                },
                previews::seed_filter(&me, &pk),
            );
        }
        self.refresh_previews();
    }

    /// Recomputes the derived preview list from roster, counters, and read
    /// ledger. Pure; never touches the feed.
    fn refresh_previews(&mut self) {
        self.state.previews = self.previews.previews(&self.state.contacts, &self.ledger);
    }

    fn sync_conversation_view(&mut self) {
        let Some(conv) = self.conversation.as_ref() else {
            return;
        };
        if let Some(view) = self.state.conversation.as_mut() {
            view.loading = conv.loading();
            view.messages = conv.messages().to_vec();
        }
    }
}
