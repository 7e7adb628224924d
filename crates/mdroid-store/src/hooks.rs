//! [`HookRegistry`] – per-key subscriptions with cooldown windows.
//!
//! Interested parties register a [`Hook`] against a state key.  Every write
//! to that key calls [`HookRegistry::fire`], which checks each subscription's
//! [`Cooldown`] and hands the ready ones to a supervised dispatcher task.
//!
//! # Dispatch model
//!
//! Each invocation runs as its own Tokio task inside a [`JoinSet`] owned by
//! the dispatcher.  The dispatcher reaps finished tasks, logging callbacks
//! that return an error or panic.  A failing callback never stops its
//! siblings and never reaches the caller of `fire`.
//!
//! # Cooldown
//!
//! A subscription with `Cooldown::Every(w)` is invoked at most once per `w`.
//! Triggers inside the window are coalesced (dropped), not queued.
//! [`Cooldown::Always`] fires on every write.
//!
//! Group hooks registered with [`HookRegistry::register_group`] get one
//! subscription per member key, so the cooldown is tracked per member key.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use mdroid_types::{HookError, StateChange, canonical_key};
use tokio::sync::mpsc;
use tokio::task::{JoinError, JoinHandle, JoinSet};
use tracing::{debug, error};

// ────────────────────────────────────────────────────────────────────────────
// Public types
// ────────────────────────────────────────────────────────────────────────────

/// A callback invoked when a subscribed key is written.
#[async_trait]
pub trait Hook: Send + Sync {
    async fn on_change(&self, change: StateChange) -> Result<(), HookError>;
}

/// Adapter that lets a closure returning a future act as a [`Hook`].
pub struct FnHook<F>(F);

#[async_trait]
impl<F, Fut> Hook for FnHook<F>
where
    F: Fn(StateChange) -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), HookError>> + Send + 'static,
{
    async fn on_change(&self, change: StateChange) -> Result<(), HookError> {
        (self.0)(change).await
    }
}

/// Wrap a closure as a shareable [`Hook`].
pub fn hook_fn<F, Fut>(f: F) -> Arc<dyn Hook>
where
    F: Fn(StateChange) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), HookError>> + Send + 'static,
{
    Arc::new(FnHook(f))
}

/// Minimum spacing between two invocations of one subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cooldown {
    /// Fire on every write.
    Always,
    /// Fire at most once per window.
    Every(Duration),
}

impl Cooldown {
    fn ready(&self, last_fired: Option<Instant>, now: Instant) -> bool {
        match (self, last_fired) {
            (Cooldown::Always, _) | (_, None) => true,
            (Cooldown::Every(window), Some(last)) => now.duration_since(last) >= *window,
        }
    }
}

impl From<Duration> for Cooldown {
    fn from(window: Duration) -> Self {
        Cooldown::Every(window)
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Internal entries
// ────────────────────────────────────────────────────────────────────────────

struct Subscription {
    hook: Arc<dyn Hook>,
    cooldown: Cooldown,
    last_fired: Option<Instant>,
}

struct Invocation {
    key: String,
    hook: Arc<dyn Hook>,
    change: StateChange,
}

// ────────────────────────────────────────────────────────────────────────────
// HookRegistry
// ────────────────────────────────────────────────────────────────────────────

/// Per-key subscription table plus the dispatcher that runs callbacks.
///
/// Must be created inside a Tokio runtime: construction spawns the
/// dispatcher task.  Call [`HookRegistry::shutdown`] on teardown to wait for
/// in-flight callbacks.
///
/// # Example
///
/// ```
/// use std::time::Duration;
/// use mdroid_store::hooks::{hook_fn, Cooldown, HookRegistry};
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() {
/// let hooks = HookRegistry::new();
/// hooks.register("ACC_POWER", Cooldown::Always, hook_fn(|change| async move {
///     println!("{} is now {}", change.key, change.entry.value);
///     Ok(())
/// }));
/// assert_eq!(hooks.subscriber_count("acc_power"), 1);
/// hooks.shutdown().await;
/// # }
/// ```
pub struct HookRegistry {
    subscriptions: Mutex<HashMap<String, Vec<Subscription>>>,
    dispatch_tx: Mutex<Option<mpsc::UnboundedSender<Invocation>>>,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
}

impl HookRegistry {
    /// Create an empty registry and start its dispatcher task.
    ///
    /// # Panics
    ///
    /// Panics when called outside a Tokio runtime.
    pub fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let dispatcher = tokio::spawn(supervise(rx));
        Self {
            subscriptions: Mutex::new(HashMap::new()),
            dispatch_tx: Mutex::new(Some(tx)),
            dispatcher: Mutex::new(Some(dispatcher)),
        }
    }

    /// Append a subscription for `key`.  No deduplication: registering the
    /// same hook twice yields two independent subscriptions.
    pub fn register(&self, key: &str, cooldown: impl Into<Cooldown>, hook: Arc<dyn Hook>) {
        let cooldown = cooldown.into();
        self.lock_subscriptions()
            .entry(canonical_key(key))
            .or_default()
            .push(Subscription {
                hook,
                cooldown,
                last_fired: None,
            });
    }

    /// Register `hook` under every key in `keys`.  Each member key keeps its
    /// own cooldown clock.
    pub fn register_group(&self, keys: &[&str], cooldown: impl Into<Cooldown>, hook: Arc<dyn Hook>) {
        let cooldown = cooldown.into();
        for key in keys {
            self.register(key, cooldown, Arc::clone(&hook));
        }
    }

    /// Number of subscriptions registered for `key`.
    pub fn subscriber_count(&self, key: &str) -> usize {
        self.lock_subscriptions()
            .get(&canonical_key(key))
            .map_or(0, Vec::len)
    }

    /// Dispatch `change` to every ready subscription on `change.key`.
    ///
    /// Returns the number of callbacks handed to the dispatcher.  Never
    /// blocks on callback execution.
    pub fn fire(&self, change: &StateChange) -> usize {
        let now = Instant::now();
        let ready: Vec<Arc<dyn Hook>> = {
            let mut subscriptions = self.lock_subscriptions();
            let Some(subs) = subscriptions.get_mut(&change.key) else {
                return 0;
            };
            subs.iter_mut()
                .filter(|sub| sub.cooldown.ready(sub.last_fired, now))
                .map(|sub| {
                    sub.last_fired = Some(now);
                    Arc::clone(&sub.hook)
                })
                .collect()
        };

        let tx = self.dispatch_tx.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(tx) = tx.as_ref() else {
            debug!(key = %change.key, "hook registry is shut down; dropping trigger");
            return 0;
        };

        let mut dispatched = 0;
        for hook in ready {
            let invocation = Invocation {
                key: change.key.clone(),
                hook,
                change: change.clone(),
            };
            if tx.send(invocation).is_ok() {
                dispatched += 1;
            }
        }
        dispatched
    }

    /// Stop accepting triggers and wait for in-flight callbacks to finish.
    pub async fn shutdown(&self) {
        self.dispatch_tx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let handle = self
            .dispatcher
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle
            && let Err(e) = handle.await
        {
            error!(error = %e, "hook dispatcher terminated abnormally");
        }
    }

    fn lock_subscriptions(&self) -> std::sync::MutexGuard<'_, HashMap<String, Vec<Subscription>>> {
        self.subscriptions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Dispatcher
// ────────────────────────────────────────────────────────────────────────────

async fn supervise(mut rx: mpsc::UnboundedReceiver<Invocation>) {
    let mut running = JoinSet::new();
    loop {
        tokio::select! {
            next = rx.recv() => match next {
                Some(invocation) => {
                    running.spawn(invoke(invocation));
                }
                None => break,
            },
            Some(joined) = running.join_next(), if !running.is_empty() => reap(joined),
        }
    }
    while let Some(joined) = running.join_next().await {
        reap(joined);
    }
    debug!("hook dispatcher stopped");
}

async fn invoke(invocation: Invocation) {
    let Invocation { key, hook, change } = invocation;
    if let Err(e) = hook.on_change(change).await {
        error!(key = %key, error = %e, "hook callback failed");
    }
}

fn reap(joined: Result<(), JoinError>) {
    if let Err(e) = joined
        && e.is_panic()
    {
        error!(error = %e, "hook callback panicked");
    }
}
