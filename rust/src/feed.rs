use std::collections::HashSet;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use flume::Sender;
use nostr_sdk::prelude::{
    Client, ClientMessage, Event, EventBuilder, Filter, Keys, RelayMessage,
    RelayPoolNotification, RelayUrl, SubscriptionId,
};

use crate::updates::{CoreMsg, FeedQuery, InternalEvent, PublishIntent};

const QUERY_TIMEOUT: Duration = Duration::from_secs(10);
/// A feed with no reachable relay never signals end-of-stored; unstick the
/// session after a bounded wait. Harmless when the real signal arrives first.
const BACKFILL_FALLBACK: Duration = Duration::from_secs(5);

/// Transport seam. All methods are fire-and-forget: deliveries, completion
/// signals, query results, and publish outcomes come back to the actor as
/// `InternalEvent`s tagged with the subscription id / query / intent that
/// produced them.
pub trait Feed: Send + Sync {
    fn open_subscription(&self, id: String, filter: Filter);
    /// Idempotent; closing an unknown id is a no-op.
    fn close_subscription(&self, id: String);
    /// One-shot finite fetch, no live updates.
    fn query(&self, query: FeedQuery, filter: Filter);
    /// Success iff at least one endpoint accepts the event.
    fn publish(&self, intent: PublishIntent, event: Event);
    fn shutdown(&self);
}

/// Everything a factory needs to build a feed for one login session.
pub struct FeedContext {
    pub keys: Keys,
    pub relays: Vec<RelayUrl>,
    pub network_enabled: bool,
    pub core_tx: Sender<CoreMsg>,
    pub runtime: tokio::runtime::Handle,
}

pub trait FeedFactory: Send + Sync + 'static {
    fn build(&self, ctx: FeedContext) -> anyhow::Result<Arc<dyn Feed>>;
}

pub type SharedFeedFactory = Arc<RwLock<Arc<dyn FeedFactory>>>;

/// Default factory: real relay pool when networking is on, inert feed when it
/// is off (keeps offline runs and tests deterministic).
#[derive(Default)]
pub struct DefaultFeedFactory;

impl FeedFactory for DefaultFeedFactory {
    fn build(&self, ctx: FeedContext) -> anyhow::Result<Arc<dyn Feed>> {
        if ctx.network_enabled {
            Ok(Arc::new(NostrFeed::start(ctx)))
        } else {
            Ok(Arc::new(NullFeed {
                core_tx: ctx.core_tx,
            }))
        }
    }
}

/// Relay-pool backed feed. One instance per login session; `shutdown` tears
/// down the pool and with it the notifications loop.
pub struct NostrFeed {
    client: Client,
    runtime: tokio::runtime::Handle,
    core_tx: Sender<CoreMsg>,
    /// Subscription ids whose backfill-complete has already been forwarded.
    /// Relays signal end-of-stored once each; the actor gets only the first.
    completed: Arc<Mutex<HashSet<String>>>,
}

impl NostrFeed {
    pub fn start(ctx: FeedContext) -> Self {
        let client = Client::new(ctx.keys.clone());

        {
            let c = client.clone();
            let relays = ctx.relays.clone();
            ctx.runtime.spawn(async move {
                for r in relays {
                    let _ = c.add_relay(r).await;
                }
                c.connect().await;
            });
        }

        let feed = Self {
            client,
            runtime: ctx.runtime.clone(),
            core_tx: ctx.core_tx.clone(),
            completed: Arc::new(Mutex::new(HashSet::new())),
        };
        feed.start_notifications_loop(ctx.keys);
        feed
    }

    fn start_notifications_loop(&self, keys: Keys) {
        let mut rx = self.client.notifications();
        let client = self.client.clone();
        let tx = self.core_tx.clone();
        let completed = self.completed.clone();
        self.runtime.spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(RelayPoolNotification::Message { relay_url, message }) => match message {
                        RelayMessage::EndOfStoredEvents(sub_id) => {
                            let id = sub_id.to_string();
                            if mark_completed(&completed, &id) {
                                let _ = tx.send(CoreMsg::Internal(Box::new(
                                    InternalEvent::FeedBackfillComplete { subscription: id },
                                )));
                            }
                        }
                        RelayMessage::Auth { challenge } => {
                            // NIP-42: some relays gate DM history behind auth.
                            // nostr-sdk 0.44 doesn't expose a `Client::auth`
                            // helper; build/sign/send.
                            if let Ok(event) = EventBuilder::auth(challenge, relay_url.clone())
                                .sign_with_keys(&keys)
                            {
                                let _ = client
                                    .send_msg_to([relay_url], ClientMessage::auth(event))
                                    .await;
                            }
                        }
                        _ => {}
                    },
                    Ok(RelayPoolNotification::Event {
                        subscription_id,
                        event,
                        ..
                    }) => {
                        // No event-id dedup here: the same physical event may
                        // legitimately reach two subscriptions (conversation +
                        // preview); per-component dedup is the actor's job.
                        let ev: Event = (*event).clone();
                        let _ = tx.send(CoreMsg::Internal(Box::new(InternalEvent::FeedEvent {
                            subscription: subscription_id.to_string(),
                            event: ev,
                        })));
                    }
                    Ok(_) => {}
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                }
            }
        });
    }
}

impl Feed for NostrFeed {
    fn open_subscription(&self, id: String, filter: Filter) {
        let client = self.client.clone();
        let tx = self.core_tx.clone();
        let completed = self.completed.clone();
        self.runtime.spawn(async move {
            let sid = SubscriptionId::new(id.clone());
            if let Err(e) = client.subscribe_with_id(sid, filter, None).await {
                tracing::debug!(sub = %id, err = %e, "subscribe failed");
            }
            tokio::time::sleep(BACKFILL_FALLBACK).await;
            if mark_completed(&completed, &id) {
                let _ = tx.send(CoreMsg::Internal(Box::new(
                    InternalEvent::FeedBackfillComplete { subscription: id },
                )));
            }
        });
    }

    fn close_subscription(&self, id: String) {
        let client = self.client.clone();
        self.runtime.spawn(async move {
            let _ = client.unsubscribe(&SubscriptionId::new(id)).await;
        });
    }

    fn query(&self, query: FeedQuery, filter: Filter) {
        let client = self.client.clone();
        let tx = self.core_tx.clone();
        self.runtime.spawn(async move {
            let events: Vec<Event> = match client.fetch_events(filter, QUERY_TIMEOUT).await {
                Ok(events) => events.into_iter().collect(),
                Err(e) => {
                    tracing::debug!(err = %e, "fetch_events failed");
                    Vec::new()
                }
            };
            let _ = tx.send(CoreMsg::Internal(Box::new(InternalEvent::FeedQueryResult {
                query,
                events,
            })));
        });
    }

    fn publish(&self, intent: PublishIntent, event: Event) {
        let client = self.client.clone();
        let tx = self.core_tx.clone();
        self.runtime.spawn(async move {
            let (ok, error) = match client.send_event(&event).await {
                Ok(output) => {
                    if output.success.is_empty() {
                        let reason = output
                            .failed
                            .values()
                            .next()
                            .cloned()
                            .unwrap_or_else(|| "no relay accepted the event".to_string());
                        (false, Some(reason))
                    } else {
                        (true, None)
                    }
                }
                Err(e) => (false, Some(e.to_string())),
            };
            let _ = tx.send(CoreMsg::Internal(Box::new(
                InternalEvent::FeedPublishResult { intent, ok, error },
            )));
        });
    }

    fn shutdown(&self) {
        let client = self.client.clone();
        self.runtime.spawn(async move {
            client.unsubscribe_all().await;
            client.shutdown().await;
        });
    }
}

/// Inert feed used when networking is disabled: backfills complete
/// immediately, queries come back empty, publishes fail with a stable reason.
pub struct NullFeed {
    core_tx: Sender<CoreMsg>,
}

impl Feed for NullFeed {
    fn open_subscription(&self, id: String, _filter: Filter) {
        let _ = self.core_tx.send(CoreMsg::Internal(Box::new(
            InternalEvent::FeedBackfillComplete { subscription: id },
        )));
    }

    fn close_subscription(&self, _id: String) {}

    fn query(&self, query: FeedQuery, _filter: Filter) {
        let _ = self
            .core_tx
            .send(CoreMsg::Internal(Box::new(InternalEvent::FeedQueryResult {
                query,
                events: Vec::new(),
            })));
    }

    fn publish(&self, intent: PublishIntent, _event: Event) {
        let _ = self.core_tx.send(CoreMsg::Internal(Box::new(
            InternalEvent::FeedPublishResult {
                intent,
                ok: false,
                error: Some("network disabled".to_string()),
            },
        )));
    }

    fn shutdown(&self) {}
}

fn mark_completed(completed: &Arc<Mutex<HashSet<String>>>, id: &str) -> bool {
    match completed.lock() {
        Ok(mut g) => g.insert(id.to_string()),
        Err(poison) => poison.into_inner().insert(id.to_string()),
    }
}
