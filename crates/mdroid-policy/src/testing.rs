//! Test fixtures: a [`CommandSink`] that records what it is asked to send.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use mdroid_serial::{CommandSink, LinkError};
use mdroid_store::{HookRegistry, SettingsStore, StateStore};
use mdroid_types::{AckCondition, Entry, Message};

use crate::{Policies, PolicyConfig};

/// How [`RecordingSink`] answers an acknowledged command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SinkMode {
    /// Write the acknowledged value into the store, as the vehicle would.
    Confirm,
    /// Never confirm.
    Timeout,
    /// Behave as if no link holds the writer role.
    NoWriter,
}

pub(crate) struct RecordingSink {
    store: Arc<StateStore>,
    mode: SinkMode,
    sent: Mutex<Vec<String>>,
    awaited: Mutex<Vec<AckCondition>>,
}

impl RecordingSink {
    pub(crate) fn sent(&self) -> Vec<String> {
        self.sent.lock().unwrap().clone()
    }

    pub(crate) fn awaited(&self) -> Vec<AckCondition> {
        self.awaited.lock().unwrap().clone()
    }
}

#[async_trait]
impl CommandSink for RecordingSink {
    fn route(&self, message: Message) -> Result<(), LinkError> {
        if self.mode == SinkMode::NoWriter {
            return Err(LinkError::NoWriter);
        }
        self.sent.lock().unwrap().push(message.text);
        Ok(())
    }

    async fn await_ack(
        &self,
        message: Message,
        ack: AckCondition,
        timeout: Duration,
    ) -> Result<Entry, LinkError> {
        self.route(message)?;
        self.awaited.lock().unwrap().push(ack.clone());
        match self.mode {
            SinkMode::Confirm => {
                self.store.set(&ack.key, ack.value.clone());
                Ok(self.store.get(&ack.key).unwrap())
            }
            _ => Err(LinkError::AckTimeout { key: ack.key, timeout }),
        }
    }
}

/// Policies wired to in-memory stores and a [`RecordingSink`].
pub(crate) struct Fixture {
    pub store: Arc<StateStore>,
    pub settings: Arc<SettingsStore>,
    pub sink: Arc<RecordingSink>,
    pub policies: Arc<Policies>,
}

impl Fixture {
    pub(crate) fn new(mode: SinkMode) -> Self {
        let store = Arc::new(StateStore::new(Arc::new(HookRegistry::new())));
        let settings = Arc::new(SettingsStore::in_memory(Arc::new(HookRegistry::new())));
        let sink = Arc::new(RecordingSink {
            store: Arc::clone(&store),
            mode,
            sent: Mutex::new(Vec::new()),
            awaited: Mutex::new(Vec::new()),
        });
        let policies = Policies::new(
            Arc::clone(&store),
            Arc::clone(&settings),
            sink.clone(),
            PolicyConfig {
                ack_timeout: Duration::from_millis(50),
                ..PolicyConfig::default()
            },
        );
        Self {
            store,
            settings,
            sink,
            policies,
        }
    }
}
