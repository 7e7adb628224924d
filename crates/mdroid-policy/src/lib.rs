//! `mdroid-policy` – what the hub does when the vehicle state changes.
//!
//! [`Policies::install`] registers every subscriber on the state and
//! settings hook registries:
//!
//! | Trigger | Reaction |
//! |---|---|
//! | `ACC_POWER` | re-evaluate `WIRELESS`, `SOUND`, `TABLET`, `ANGEL_EYES` power |
//! | `KEY_STATE` | re-evaluate `ANGEL_EYES` and `BOARD` power |
//! | `LIGHT_SENSOR_ON` | re-evaluate `ANGEL_EYES` power |
//! | setting `ANGEL_EYES` / `WIRELESS` | re-evaluate that component |
//! | `MAIN_VOLTAGE_RAW`, `AUX_VOLTAGE_RAW` | publish volts |
//! | `AUX_CURRENT_RAW` | publish milliamps |
//! | `WIRELESS_POWER = FALSE` | `LTE_ON = FALSE` |
//! | `DOORS_LOCKED`, `ACC_POWER`, `KEY_STATE`, `BLE_CENTRAL_CONNECTED` | auto-lock check |
//!
//! Commands leave through a [`CommandSink`], so every policy can be driven
//! in tests without a serial port.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use mdroid_serial::CommandSink;
use mdroid_store::{Cooldown, Hook, SettingsStore, StateStore, hook_fn};
use mdroid_types::{HookError, StateChange};
use tracing::info;

pub mod conversions;
pub mod lock;
pub mod power;

#[cfg(test)]
mod testing;

pub use lock::LockOutcome;
pub use power::{PowerAction, PowerTarget};

/// Timing knobs for the policy subscribers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PolicyConfig {
    /// How long a power or lock command waits for the vehicle to confirm it.
    pub ack_timeout: Duration,
    /// Cooldown applied to the power evaluators.
    pub power_cooldown: Cooldown,
    /// Minimum spacing between two auto-lock evaluations per trigger key.
    pub autolock_cooldown: Duration,
    /// Doors toggled more recently than this are left alone.
    pub unlock_grace: Duration,
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            ack_timeout: Duration::from_secs(3),
            power_cooldown: Cooldown::Always,
            autolock_cooldown: Duration::from_secs(10),
            unlock_grace: Duration::from_secs(5 * 60),
        }
    }
}

/// Shared context for every policy subscriber.
pub struct Policies {
    store: Arc<StateStore>,
    settings: Arc<SettingsStore>,
    sink: Arc<dyn CommandSink>,
    config: PolicyConfig,
}

impl Policies {
    pub fn new(
        store: Arc<StateStore>,
        settings: Arc<SettingsStore>,
        sink: Arc<dyn CommandSink>,
        config: PolicyConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            store,
            settings,
            sink,
            config,
        })
    }

    pub fn config(&self) -> &PolicyConfig {
        &self.config
    }

    /// Register every policy hook.  Call once, before initial state is
    /// applied, so boot values reach the subscribers.
    pub fn install(self: &Arc<Self>) {
        let state = self.store.hooks();
        let power = self.config.power_cooldown;

        state.register(
            "ACC_POWER",
            power,
            self.hook(|p, change| async move { p.on_acc_power(&change).await }),
        );
        state.register(
            "KEY_STATE",
            power,
            self.hook(|p, _| async move { p.on_key_state().await }),
        );
        state.register(
            "LIGHT_SENSOR_ON",
            power,
            self.hook(|p, _| async move { p.eval_angel_eyes().await.map(drop) }),
        );

        state.register_group(
            &["MAIN_VOLTAGE_RAW", "AUX_VOLTAGE_RAW"],
            Cooldown::Always,
            self.hook(|p, change| async move { p.on_voltage(&change) }),
        );
        state.register(
            "AUX_CURRENT_RAW",
            Cooldown::Always,
            self.hook(|p, change| async move { p.on_aux_current(&change) }),
        );
        state.register(
            "WIRELESS_POWER",
            Cooldown::Always,
            self.hook(|p, change| async move {
                p.on_wireless_power(&change);
                Ok(())
            }),
        );

        state.register_group(
            &["DOORS_LOCKED", "ACC_POWER", "KEY_STATE", "BLE_CENTRAL_CONNECTED"],
            self.config.autolock_cooldown,
            self.hook(|p, _| async move { p.eval_auto_lock().await.map(drop) }),
        );

        let settings = self.settings.hooks();
        settings.register(
            "ANGEL_EYES",
            Cooldown::Always,
            self.hook(|p, _| async move { p.eval_angel_eyes().await.map(drop) }),
        );
        settings.register(
            "WIRELESS",
            Cooldown::Always,
            self.hook(|p, _| async move {
                let acc = p.store.get_bool_or("ACC_POWER", false);
                let wifi = p.store.get_bool_or("WIFI_CONNECTED", false);
                p.eval_wireless(acc, wifi).await.map(drop)
            }),
        );

        info!("policy hooks installed");
    }

    fn hook<F, Fut>(self: &Arc<Self>, f: F) -> Arc<dyn Hook>
    where
        F: Fn(Arc<Self>, StateChange) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), HookError>> + Send + 'static,
    {
        let policies = Arc::clone(self);
        hook_fn(move |change| f(Arc::clone(&policies), change))
    }

    /// `KEY_STATE` other than `FALSE` (or not reported yet) means the key is
    /// in the ignition.
    fn key_in(&self) -> bool {
        self.store.get_string_or("KEY_STATE", "") != "FALSE"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mdroid_serial::transport::mock::MockConnector;
    use mdroid_serial::{LinkConfig, LinkManager, apply_frame};
    use mdroid_store::HookRegistry;
    use mdroid_types::Entry;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    const DEV0: &str = "/dev/ttyMOCK0";
    const DEV1: &str = "/dev/ttyMOCK1";

    struct Hub {
        hooks: Arc<HookRegistry>,
        settings_hooks: Arc<HookRegistry>,
        store: Arc<StateStore>,
        links: Arc<LinkManager>,
        connector: MockConnector,
    }

    impl Hub {
        fn boot(seed: &[(&str, &str)], targets: &[(&str, &str)]) -> Self {
            let hooks = Arc::new(HookRegistry::new());
            let settings_hooks = Arc::new(HookRegistry::new());
            let store = Arc::new(StateStore::new(Arc::clone(&hooks)));
            let settings = Arc::new(SettingsStore::in_memory(Arc::clone(&settings_hooks)));
            store.restore(seed.iter().map(|(k, v)| Entry::now(*k, *v)));
            for (component, target) in targets {
                settings.set(component, "POWER", target).unwrap();
            }

            let connector = MockConnector::new();
            let links = LinkManager::new(
                Arc::clone(&store),
                Arc::new(connector.clone()),
                LinkConfig {
                    read_timeout: Duration::from_millis(10),
                    reconnect_backoff: Duration::from_millis(50),
                },
            );
            let config = PolicyConfig {
                ack_timeout: Duration::from_millis(300),
                ..PolicyConfig::default()
            };
            let sink: Arc<dyn CommandSink> = links.clone();
            Policies::new(Arc::clone(&store), settings, sink, config).install();

            Self {
                hooks,
                settings_hooks,
                store,
                links,
                connector,
            }
        }

        async fn shutdown(self) {
            self.links.shutdown().await;
            self.hooks.shutdown().await;
            self.settings_hooks.shutdown().await;
        }
    }

    async fn eventually(mut check: impl FnMut() -> bool) -> bool {
        for _ in 0..300 {
            if check() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        check()
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn acc_frame_powers_angel_eyes_through_writer() {
        let hub = Hub::boot(&[("ACC_POWER", "FALSE")], &[]);
        let count = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&count);
        hub.hooks.register(
            "ACC_POWER",
            Cooldown::Always,
            hook_fn(move |_| {
                let seen = Arc::clone(&seen);
                async move {
                    seen.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            }),
        );

        let device = hub.connector.device(DEV0);
        hub.links.open(DEV0, 115_200).unwrap();
        assert!(eventually(|| hub.links.is_writer(DEV0)).await);

        device.inject(br#"{"acc_power": true}"#);
        assert!(eventually(|| hub.store.get_string_or("ACC_POWER", "") == "TRUE").await);
        assert!(
            eventually(|| device.written_lines().iter().any(|l| l == "powerOn:ANGEL_EYES")).await,
            "written: {:?}",
            device.written_lines()
        );
        assert_eq!(count.load(Ordering::SeqCst), 1);
        hub.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn commands_follow_writer_failover() {
        let hub = Hub::boot(
            &[("ACC_POWER", "FALSE"), ("KEY_STATE", "FALSE")],
            &[("BOARD", "AUTO"), ("ANGEL_EYES", "AUTO")],
        );
        let first = hub.connector.device(DEV0);
        let second = hub.connector.device(DEV1);
        hub.links.open(DEV0, 115_200).unwrap();
        assert!(eventually(|| hub.links.is_writer(DEV0)).await);
        hub.links.open(DEV1, 115_200).unwrap();
        assert!(eventually(|| hub.links.open_links().len() == 2).await);

        first.unplug();
        assert!(eventually(|| hub.links.is_writer(DEV1)).await);

        // Key in: board and angel eyes both want power.
        second.inject(br#"{"key_state": "run"}"#);
        assert!(
            eventually(|| {
                let lines = second.written_lines();
                lines.iter().any(|l| l == "powerOn:BOARD") && lines.iter().any(|l| l == "powerOn:ANGEL_EYES")
            })
            .await,
            "written: {:?}",
            second.written_lines()
        );
        assert!(first.written_lines().is_empty());
        hub.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn raw_frames_are_converted() {
        let hub = Hub::boot(&[], &[]);
        let applied = apply_frame(
            &hub.store,
            &json!({"main_voltage_raw": 530, "aux_voltage_raw": 512, "aux_current_raw": 2048}),
            "test",
        );
        assert_eq!(applied, 3);
        assert!(eventually(|| hub.store.is_set("MAIN_VOLTAGE") && hub.store.is_set("AUX_CURRENT")).await);
        assert!(eventually(|| hub.store.is_set("AUX_VOLTAGE")).await);
        assert_eq!(hub.store.get_string_or("MAIN_VOLTAGE", ""), "12.629");
        assert_eq!(hub.store.get_string_or("AUX_VOLTAGE", ""), "12.200");
        assert_eq!(hub.store.get_string_or("AUX_CURRENT", ""), "0.813");
        hub.shutdown().await;
    }
}
