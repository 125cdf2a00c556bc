mod actions;
mod core;
mod feed;
mod logging;
mod state;
mod updates;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::thread;

use flume::{Receiver, Sender};

pub use actions::AppAction;
pub use feed::{DefaultFeedFactory, Feed, FeedContext, FeedFactory, NostrFeed, NullFeed};
pub use state::*;
pub use updates::*;

use feed::SharedFeedFactory;

/// Canonical form for user-entered public keys: trimmed, lowercased, the
/// `nostr:` URI prefix stripped.
pub fn normalize_public_key(input: &str) -> String {
    let mut normalized = input.trim().to_ascii_lowercase();
    if let Some(stripped) = normalized.strip_prefix("nostr:") {
        normalized = stripped.to_string();
    }
    normalized
}

/// Accepts 64-char hex or bech32 `npub`. Cheap enough for per-keystroke
/// validation in a host UI.
pub fn is_valid_public_key(input: &str) -> bool {
    let normalized = normalize_public_key(input);
    if normalized.len() == 64 && hex::decode(&normalized).is_ok() {
        return true;
    }
    if !normalized.starts_with("npub1") {
        return false;
    }
    nostr_sdk::prelude::PublicKey::parse(&normalized).is_ok()
}

pub trait AppReconciler: Send + Sync + 'static {
    fn reconcile(&self, update: AppUpdate);
}

pub struct App {
    core_tx: Sender<CoreMsg>,
    update_rx: Receiver<AppUpdate>,
    listening: AtomicBool,
    shared_state: Arc<RwLock<AppState>>,
    feed_factory: SharedFeedFactory,
}

impl App {
    pub fn new(data_dir: String) -> Arc<Self> {
        logging::init_logging();
        tracing::info!(data_dir = %data_dir, "App::new() starting");

        let (update_tx, update_rx) = flume::unbounded();
        let (core_tx, core_rx) = flume::unbounded::<CoreMsg>();
        let shared_state = Arc::new(RwLock::new(AppState::empty()));
        let feed_factory: SharedFeedFactory =
            Arc::new(RwLock::new(Arc::new(DefaultFeedFactory)));

        // Actor loop thread (single threaded "app actor").
        let core_tx_for_core = core_tx.clone();
        let shared_for_core = shared_state.clone();
        let factory_for_core = feed_factory.clone();
        thread::spawn(move || {
            let mut core = crate::core::AppCore::new(
                update_tx,
                core_tx_for_core,
                data_dir,
                shared_for_core,
                factory_for_core,
            );
            while let Ok(msg) = core_rx.recv() {
                core.handle_message(msg);
            }
        });

        Arc::new(Self {
            core_tx,
            update_rx,
            listening: AtomicBool::new(false),
            shared_state,
            feed_factory,
        })
    }

    pub fn state(&self) -> AppState {
        match self.shared_state.read() {
            Ok(g) => g.clone(),
            Err(poison) => poison.into_inner().clone(),
        }
    }

    pub fn dispatch(&self, action: AppAction) {
        // Contract: never block caller.
        let _ = self.core_tx.send(CoreMsg::Action(action));
    }

    pub fn listen_for_updates(&self, reconciler: Box<dyn AppReconciler>) {
        if self
            .listening
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            // Avoid multiple listeners that would split messages.
            return;
        }

        let rx = self.update_rx.clone();
        thread::spawn(move || {
            while let Ok(update) = rx.recv() {
                reconciler.reconcile(update);
            }
        });
    }
}

impl App {
    /// Swap the feed implementation before the first `Login` dispatch. Tests
    /// use this to stand in a scripted feed.
    pub fn set_feed_factory_for_tests(&self, factory: Arc<dyn FeedFactory>) {
        match self.feed_factory.write() {
            Ok(mut slot) => {
                *slot = factory;
            }
            Err(poison) => {
                *poison.into_inner() = factory;
            }
        }
    }
}
