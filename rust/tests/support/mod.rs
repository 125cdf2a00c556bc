#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use flume::Sender;
use nostr_sdk::prelude::{
    nip04, Event, EventBuilder, Filter, Keys, Kind, MatchEventOptions, PublicKey, Tag, Timestamp,
};

use naier_core::{
    App, AppAction, AppReconciler, AppUpdate, AuthState, Contact, CoreMsg, Feed, FeedContext,
    FeedFactory, FeedQuery, InternalEvent, PublishIntent,
};

pub fn wait_until(what: &str, timeout: Duration, mut f: impl FnMut() -> bool) {
    let start = Instant::now();
    while start.elapsed() < timeout {
        if f() {
            return;
        }
        std::thread::sleep(Duration::from_millis(20));
    }
    panic!("{what}: condition not met within {timeout:?}");
}

pub fn write_config(data_dir: &str, disable_network: bool) {
    let path = std::path::Path::new(data_dir).join("naier_config.json");
    let v = serde_json::json!({
        "disable_network": disable_network,
    });
    std::fs::write(path, serde_json::to_vec(&v).unwrap()).unwrap();
}

pub fn write_config_with_relay(data_dir: &str, relay_url: &str) {
    let path = std::path::Path::new(data_dir).join("naier_config.json");
    let v = serde_json::json!({
        "disable_network": false,
        "relay_urls": [relay_url],
    });
    std::fs::write(path, serde_json::to_vec(&v).unwrap()).unwrap();
}

pub fn login(app: &App, keys: &Keys) {
    use nostr_sdk::prelude::ToBech32;
    app.dispatch(AppAction::Login {
        nsec: keys.secret_key().to_bech32().unwrap(),
    });
    wait_until("logged in", Duration::from_secs(2), || {
        matches!(app.state().auth, AuthState::LoggedIn { .. })
    });
}

#[derive(Clone)]
pub struct Collector(pub Arc<Mutex<Vec<AppUpdate>>>);

impl Collector {
    pub fn new() -> Self {
        Self(Arc::new(Mutex::new(Vec::new())))
    }

    pub fn last_toast(&self) -> Option<String> {
        self.0.lock().unwrap().iter().rev().find_map(|u| match u {
            AppUpdate::FullState(s) => s.toast.clone(),
        })
    }

    /// Revs must be strictly increasing by 1 across the whole stream.
    pub fn assert_revs_contiguous(&self) {
        let up = self.0.lock().unwrap();
        for w in up.windows(2) {
            assert_eq!(w[0].rev() + 1, w[1].rev(), "rev gap in update stream");
        }
    }
}

impl AppReconciler for Collector {
    fn reconcile(&self, update: AppUpdate) {
        self.0.lock().unwrap().push(update);
    }
}

/// NIP-04 direct message from `from` to `to` with a pinned timestamp.
pub fn dm_event(from: &Keys, to: &PublicKey, text: &str, ts: u64) -> Event {
    let ciphertext = nip04::encrypt(from.secret_key(), to, text).unwrap();
    raw_dm_event(from, to, &ciphertext, ts)
}

/// Kind-4 event with the content taken verbatim. With a non-ciphertext
/// content this produces a message that cannot be decrypted.
pub fn raw_dm_event(from: &Keys, to: &PublicKey, content: &str, ts: u64) -> Event {
    EventBuilder::new(Kind::EncryptedDirectMessage, content)
        .tag(Tag::public_key(*to))
        .custom_created_at(Timestamp::from_secs(ts))
        .sign_with_keys(from)
        .unwrap()
}

/// Encrypted-to-self contact list record (kind 10004).
pub fn roster_event(me: &Keys, contacts: &[Contact], ts: u64) -> Event {
    let json = serde_json::to_string(contacts).unwrap();
    let ciphertext = nip04::encrypt(me.secret_key(), &me.public_key(), &json).unwrap();
    EventBuilder::new(Kind::Custom(10004), ciphertext)
        .custom_created_at(Timestamp::from_secs(ts))
        .sign_with_keys(me)
        .unwrap()
}

/// Kind-0 profile for `who` carrying just a name.
pub fn profile_event(who: &Keys, name: &str, ts: u64) -> Event {
    EventBuilder::new(
        Kind::Metadata,
        serde_json::json!({ "name": name }).to_string(),
    )
    .custom_created_at(Timestamp::from_secs(ts))
    .sign_with_keys(who)
    .unwrap()
}

pub fn contact_entry(pk: &PublicKey, nickname: &str) -> Contact {
    use nostr_sdk::prelude::ToBech32;
    Contact {
        pubkey: pk.to_hex(),
        npub: pk.to_bech32().unwrap(),
        nickname: nickname.to_string(),
        picture: None,
        added_at: 1,
    }
}

#[derive(Default)]
struct MockFeedInner {
    core_tx: Option<Sender<CoreMsg>>,
    /// What "the relay" has stored. Survives shutdown, like a real relay.
    stored: Vec<Event>,
    subs: HashMap<String, Filter>,
    hold_backfill: bool,
    held_completions: Vec<String>,
    hold_queries: bool,
    held_queries: Vec<(FeedQuery, Vec<Event>)>,
    queries: Vec<FeedQuery>,
    published: Vec<(PublishIntent, Event)>,
    /// `Some((ok, error))` acks publishes inline; `None` parks them until
    /// `release_acks`.
    auto_ack: Option<(bool, Option<String>)>,
    pending_acks: Vec<(PublishIntent, Event)>,
    shutdowns: usize,
}

/// Scripted in-process feed. Behaves like a single relay: stored events
/// replay on subscribe followed by the end-of-stored signal, published
/// events are stored and broadcast back to matching subscriptions, and
/// everything is observable and steerable from the test thread.
#[derive(Clone)]
pub struct MockFeed {
    inner: Arc<Mutex<MockFeedInner>>,
}

impl MockFeed {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(MockFeedInner {
                auto_ack: Some((true, None)),
                ..MockFeedInner::default()
            })),
        }
    }

    fn send(&self, tx: &Sender<CoreMsg>, internal: InternalEvent) {
        let _ = tx.send(CoreMsg::Internal(Box::new(internal)));
    }

    /// Seed relay storage without notifying anyone.
    pub fn stash(&self, event: Event) {
        self.inner.lock().unwrap().stored.push(event);
    }

    /// Store and broadcast to every matching open subscription, like a relay
    /// accepting an EVENT from elsewhere.
    pub fn deliver(&self, event: &Event) {
        let (tx, targets) = {
            let mut inner = self.inner.lock().unwrap();
            inner.stored.push(event.clone());
            let targets: Vec<String> = inner
                .subs
                .iter()
                .filter(|(_, f)| f.match_event(event, MatchEventOptions::new()))
                .map(|(id, _)| id.clone())
                .collect();
            (inner.core_tx.clone(), targets)
        };
        let Some(tx) = tx else { return };
        for subscription in targets {
            self.send(
                &tx,
                InternalEvent::FeedEvent {
                    subscription,
                    event: event.clone(),
                },
            );
        }
    }

    /// Force a delivery under an arbitrary subscription id, bypassing filter
    /// matching. Lets tests replay traffic for ids that are no longer open.
    pub fn inject(&self, subscription: &str, event: Event) {
        let tx = self.inner.lock().unwrap().core_tx.clone();
        let Some(tx) = tx else { return };
        self.send(
            &tx,
            InternalEvent::FeedEvent {
                subscription: subscription.to_string(),
                event,
            },
        );
    }

    /// While held, subscriptions replay stored events but the end-of-stored
    /// signal is parked until `release_backfill`.
    pub fn hold_backfill(&self, hold: bool) {
        self.inner.lock().unwrap().hold_backfill = hold;
    }

    pub fn release_backfill(&self) {
        let (tx, held) = {
            let mut inner = self.inner.lock().unwrap();
            (
                inner.core_tx.clone(),
                std::mem::take(&mut inner.held_completions),
            )
        };
        let Some(tx) = tx else { return };
        for subscription in held {
            self.send(&tx, InternalEvent::FeedBackfillComplete { subscription });
        }
    }

    pub fn hold_queries(&self, hold: bool) {
        self.inner.lock().unwrap().hold_queries = hold;
    }

    pub fn release_queries(&self) {
        let (tx, held) = {
            let mut inner = self.inner.lock().unwrap();
            (
                inner.core_tx.clone(),
                std::mem::take(&mut inner.held_queries),
            )
        };
        let Some(tx) = tx else { return };
        for (query, events) in held {
            self.send(&tx, InternalEvent::FeedQueryResult { query, events });
        }
    }

    /// `None` parks publish acks until `release_acks`.
    pub fn set_auto_ack(&self, ack: Option<(bool, Option<String>)>) {
        self.inner.lock().unwrap().auto_ack = ack;
    }

    pub fn release_acks(&self, ok: bool, error: Option<&str>) {
        let (tx, pending) = {
            let mut inner = self.inner.lock().unwrap();
            let pending = std::mem::take(&mut inner.pending_acks);
            if ok {
                for (_, event) in &pending {
                    inner.stored.push(event.clone());
                }
            }
            (inner.core_tx.clone(), pending)
        };
        let Some(tx) = tx else { return };
        for (intent, _) in pending {
            self.send(
                &tx,
                InternalEvent::FeedPublishResult {
                    intent,
                    ok,
                    error: error.map(str::to_string),
                },
            );
        }
    }

    pub fn published(&self) -> Vec<(PublishIntent, Event)> {
        self.inner.lock().unwrap().published.clone()
    }

    pub fn queries(&self) -> Vec<FeedQuery> {
        self.inner.lock().unwrap().queries.clone()
    }

    pub fn open_subs(&self) -> Vec<String> {
        self.inner.lock().unwrap().subs.keys().cloned().collect()
    }

    pub fn shutdown_count(&self) -> usize {
        self.inner.lock().unwrap().shutdowns
    }

    /// Echo an already-stored event to matching subscriptions.
    fn echo(&self, event: &Event) {
        let (tx, targets) = {
            let inner = self.inner.lock().unwrap();
            let targets: Vec<String> = inner
                .subs
                .iter()
                .filter(|(_, f)| f.match_event(event, MatchEventOptions::new()))
                .map(|(id, _)| id.clone())
                .collect();
            (inner.core_tx.clone(), targets)
        };
        let Some(tx) = tx else { return };
        for subscription in targets {
            self.send(
                &tx,
                InternalEvent::FeedEvent {
                    subscription,
                    event: event.clone(),
                },
            );
        }
    }
}

impl Feed for MockFeed {
    fn open_subscription(&self, id: String, filter: Filter) {
        let (tx, matching, held) = {
            let mut inner = self.inner.lock().unwrap();
            let matching: Vec<Event> = inner
                .stored
                .iter()
                .filter(|ev| filter.match_event(ev, MatchEventOptions::new()))
                .cloned()
                .collect();
            inner.subs.insert(id.clone(), filter);
            let held = inner.hold_backfill;
            if held {
                inner.held_completions.push(id.clone());
            }
            (inner.core_tx.clone(), matching, held)
        };
        let Some(tx) = tx else { return };
        for event in matching {
            self.send(
                &tx,
                InternalEvent::FeedEvent {
                    subscription: id.clone(),
                    event,
                },
            );
        }
        if !held {
            self.send(
                &tx,
                InternalEvent::FeedBackfillComplete { subscription: id },
            );
        }
    }

    fn close_subscription(&self, id: String) {
        let mut inner = self.inner.lock().unwrap();
        inner.subs.remove(&id);
        inner.held_completions.retain(|held| held != &id);
    }

    fn query(&self, query: FeedQuery, filter: Filter) {
        let (tx, response) = {
            let mut inner = self.inner.lock().unwrap();
            inner.queries.push(query.clone());
            let events: Vec<Event> = inner
                .stored
                .iter()
                .filter(|ev| filter.match_event(ev, MatchEventOptions::new()))
                .cloned()
                .collect();
            if inner.hold_queries {
                inner.held_queries.push((query, events));
                (inner.core_tx.clone(), None)
            } else {
                (inner.core_tx.clone(), Some((query, events)))
            }
        };
        let (Some(tx), Some((query, events))) = (tx, response) else {
            return;
        };
        self.send(&tx, InternalEvent::FeedQueryResult { query, events });
    }

    fn publish(&self, intent: PublishIntent, event: Event) {
        let (tx, ack) = {
            let mut inner = self.inner.lock().unwrap();
            inner.published.push((intent.clone(), event.clone()));
            match inner.auto_ack.clone() {
                Some((ok, error)) => {
                    if ok {
                        inner.stored.push(event.clone());
                    }
                    (inner.core_tx.clone(), Some((ok, error)))
                }
                None => {
                    inner.pending_acks.push((intent.clone(), event.clone()));
                    (inner.core_tx.clone(), None)
                }
            }
        };
        let Some(tx) = tx else { return };
        if let Some((ok, error)) = ack {
            self.send(&tx, InternalEvent::FeedPublishResult { intent, ok, error });
            if ok {
                // Relay echo back to the publisher's own subscriptions.
                self.echo(&event);
            }
        }
    }

    fn shutdown(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.shutdowns += 1;
        inner.subs.clear();
        inner.held_completions.clear();
    }
}

pub struct MockFeedFactory {
    feed: MockFeed,
}

impl MockFeedFactory {
    pub fn new() -> (Arc<Self>, MockFeed) {
        let feed = MockFeed::new();
        (Arc::new(Self { feed: feed.clone() }), feed)
    }
}

impl FeedFactory for MockFeedFactory {
    fn build(&self, ctx: FeedContext) -> anyhow::Result<Arc<dyn Feed>> {
        self.feed.inner.lock().unwrap().core_tx = Some(ctx.core_tx);
        Ok(Arc::new(self.feed.clone()))
    }
}
