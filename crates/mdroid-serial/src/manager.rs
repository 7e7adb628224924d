//! [`LinkManager`] – owns every [`SerialLink`], the writer role, and the
//! reconnect loops.
//!
//! # Writer role
//!
//! Exactly one open link is the writer; only its queue receives routed
//! commands.  The role lives in the manager's fleet table and is claimed,
//! revoked and handed over only while that table's lock is held, so two
//! links can never both believe they are the writer.
//!
//! # Supervision
//!
//! [`LinkManager::open`] spawns one supervisor task per device.  The
//! supervisor opens the port, registers the link (claiming the writer role if
//! it is vacant), runs the blocking read loop, and on failure retires the
//! link, promotes another open link, waits out the backoff and starts over.
//! It retries forever until [`LinkManager::shutdown`].

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use mdroid_store::StateStore;
use mdroid_types::{AckCondition, Entry, Message};
use tokio::sync::{broadcast, watch};
use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::{error, info, instrument, warn};

use crate::error::LinkError;
use crate::link::{LinkState, SerialLink};
use crate::transport::Connector;

/// Timing knobs for link supervision.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LinkConfig {
    /// A read that sees no data for this long simply starts the next cycle.
    pub read_timeout: Duration,
    /// Wait between a link failure and the next open attempt.
    pub reconnect_backoff: Duration,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            read_timeout: Duration::from_secs(10),
            reconnect_backoff: Duration::from_secs(10),
        }
    }
}

#[derive(Default)]
struct Fleet {
    /// Links currently reading, by device.
    links: BTreeMap<String, Arc<SerialLink>>,
    /// Device of the link holding the writer role.
    writer: Option<String>,
    /// Devices with a live supervisor, open or backing off.
    supervised: BTreeSet<String>,
}

/// Supervisor of all serial links.
pub struct LinkManager {
    store: Arc<StateStore>,
    connector: Arc<dyn Connector>,
    config: LinkConfig,
    fleet: Mutex<Fleet>,
    stop: watch::Sender<bool>,
    supervisors: Mutex<JoinSet<()>>,
}

impl LinkManager {
    pub fn new(store: Arc<StateStore>, connector: Arc<dyn Connector>, config: LinkConfig) -> Arc<Self> {
        let (stop, _) = watch::channel(false);
        Arc::new(Self {
            store,
            connector,
            config,
            fleet: Mutex::new(Fleet::default()),
            stop,
            supervisors: Mutex::new(JoinSet::new()),
        })
    }

    pub fn store(&self) -> &Arc<StateStore> {
        &self.store
    }

    // -----------------------------------------------------------------------
    // Lifecycle
    // -----------------------------------------------------------------------

    /// Start supervising `device`.
    ///
    /// Returns once the supervisor is spawned; the port itself is opened in
    /// the background and retried after the backoff if it is not there yet.
    pub fn open(self: &Arc<Self>, device: &str, baud_rate: u32) -> Result<(), LinkError> {
        if *self.stop.borrow() {
            return Err(LinkError::Closed);
        }
        if !self.lock_fleet().supervised.insert(device.to_string()) {
            return Err(LinkError::AlreadyOpen(device.to_string()));
        }
        let manager = Arc::clone(self);
        let device = device.to_string();
        self.supervisors
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .spawn(async move { manager.supervise(device, baud_rate).await });
        Ok(())
    }

    /// Stop every link and wait for the supervisors to exit.
    ///
    /// Read loops notice the stop flag at the end of their current read, so
    /// this takes at most one read timeout.
    pub async fn shutdown(&self) {
        self.stop.send_replace(true);
        let mut supervisors = std::mem::take(
            &mut *self.supervisors.lock().unwrap_or_else(PoisonError::into_inner),
        );
        while let Some(joined) = supervisors.join_next().await {
            if let Err(e) = joined {
                error!(error = %e, "link supervisor terminated abnormally");
            }
        }
        info!("link manager stopped");
    }

    #[instrument(name = "link", skip(self), fields(device = %device))]
    async fn supervise(self: Arc<Self>, device: String, baud_rate: u32) {
        let mut stop = self.stop.subscribe();
        loop {
            match self.connect_and_read(&device, baud_rate).await {
                Ok(()) => break,
                Err(e) => warn!(
                    error = %e,
                    backoff = ?self.config.reconnect_backoff,
                    "link down; reopening after backoff"
                ),
            }
            tokio::select! {
                _ = tokio::time::sleep(self.config.reconnect_backoff) => {}
                _ = stop.changed() => break,
            }
        }
        self.lock_fleet().supervised.remove(&device);
    }

    /// One pass of `Opening → Reading → Closed`.  `Ok` means the link was
    /// stopped on purpose.
    async fn connect_and_read(self: &Arc<Self>, device: &str, baud_rate: u32) -> Result<(), LinkError> {
        let stop = self.stop.subscribe();
        if *stop.borrow() {
            return Ok(());
        }

        let link = Arc::new(SerialLink::new(device, baud_rate));
        link.set_state(LinkState::Opening);

        let connector = Arc::clone(&self.connector);
        let path = device.to_string();
        let read_timeout = self.config.read_timeout;
        let opened = tokio::task::spawn_blocking(move || connector.open(&path, baud_rate, read_timeout))
            .await
            .map_err(|e| LinkError::Io(std::io::Error::other(e)))
            .and_then(|opened| opened);
        let mut transport = match opened {
            Ok(transport) => transport,
            Err(e) => {
                link.set_state(LinkState::Closed);
                return Err(e);
            }
        };

        self.attach(&link);

        let manager = Arc::clone(self);
        let reader = Arc::clone(&link);
        let result = tokio::task::spawn_blocking(move || {
            let device = reader.device().to_string();
            let is_writer = || manager.is_writer(&device);
            reader.run(transport.as_mut(), &manager.store, &is_writer, &stop)
        })
        .await
        .map_err(|e| LinkError::Io(std::io::Error::other(e)))
        .and_then(|result| result);

        self.detach(&link);
        result
    }

    /// Register a freshly opened link; it becomes the writer if the role is
    /// vacant.
    fn attach(&self, link: &Arc<SerialLink>) {
        let device = link.device().to_string();
        let mut fleet = self.lock_fleet();
        fleet.links.insert(device.clone(), Arc::clone(link));
        if fleet.writer.is_none() {
            info!(device = %device, "link promoted to writer");
            fleet.writer = Some(device);
        }
    }

    /// Retire a link: revoke its writer role, hand the role to another open
    /// link, and discard whatever it had not sent.
    fn detach(&self, link: &Arc<SerialLink>) {
        let device = link.device();
        {
            let mut fleet = self.lock_fleet();
            if fleet
                .links
                .get(device)
                .is_some_and(|current| Arc::ptr_eq(current, link))
            {
                fleet.links.remove(device);
            }
            if fleet.writer.as_deref() == Some(device) {
                fleet.writer = fleet.links.keys().next().cloned();
                match &fleet.writer {
                    Some(next) => info!(from = %device, to = %next, "writer role handed over"),
                    None => warn!(device = %device, "writer role vacant; no other link open"),
                }
            }
        }
        link.set_state(LinkState::Closed);
        for message in link.drain() {
            warn!(device = %device, command = %message.text, id = %message.id, "command discarded with closed link");
        }
    }

    // -----------------------------------------------------------------------
    // Commands
    // -----------------------------------------------------------------------

    /// Queue `message` on the writer link.
    pub fn route(&self, message: Message) -> Result<(), LinkError> {
        if *self.stop.borrow() {
            return Err(LinkError::Closed);
        }
        let fleet = self.lock_fleet();
        let link = fleet
            .writer
            .as_ref()
            .and_then(|device| fleet.links.get(device))
            .ok_or(LinkError::NoWriter)?;
        link.enqueue(message);
        Ok(())
    }

    /// Route `message`, then wait until the store sees `ack` or `timeout`
    /// elapses.  Only updates that arrive after the call count.
    ///
    /// The message expires with the wait: if it is still queued when the
    /// timeout fires it is dropped, never sent late.
    pub async fn await_ack(
        &self,
        mut message: Message,
        ack: AckCondition,
        timeout: Duration,
    ) -> Result<Entry, LinkError> {
        let deadline = Instant::now() + timeout;
        let sent_at = chrono::Utc::now();
        // Subscribe before routing so a fast acknowledgment cannot slip past.
        let mut feed = self.store.subscribe();
        message.awaiting_ack = true;
        let expires = deadline.into_std();
        message.deadline = Some(message.deadline.map_or(expires, |d| d.min(expires)));
        self.route(message)?;

        let watched = async {
            loop {
                match feed.recv().await {
                    Ok(change) if ack.matches(&change.entry) => return Ok(change.entry),
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, key = %ack.key, "acknowledgment watcher lagged; checking store");
                        if let Ok(entry) = self.store.get(&ack.key)
                            && entry.last_update >= sent_at
                            && ack.matches(&entry)
                        {
                            return Ok(entry);
                        }
                    }
                    Err(broadcast::error::RecvError::Closed) => return Err(LinkError::Closed),
                }
            }
        };
        match tokio::time::timeout_at(deadline, watched).await {
            Ok(outcome) => outcome,
            Err(_) => Err(LinkError::AckTimeout {
                key: ack.key.clone(),
                timeout,
            }),
        }
    }

    // -----------------------------------------------------------------------
    // Introspection
    // -----------------------------------------------------------------------

    /// Device holding the writer role.
    pub fn writer(&self) -> Option<String> {
        self.lock_fleet().writer.clone()
    }

    pub fn is_writer(&self, device: &str) -> bool {
        self.lock_fleet().writer.as_deref() == Some(device)
    }

    /// Devices whose links are currently reading.
    pub fn open_links(&self) -> Vec<String> {
        self.lock_fleet().links.keys().cloned().collect()
    }

    pub fn link(&self, device: &str) -> Option<Arc<SerialLink>> {
        self.lock_fleet().links.get(device).cloned()
    }

    fn lock_fleet(&self) -> MutexGuard<'_, Fleet> {
        self.fleet.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
