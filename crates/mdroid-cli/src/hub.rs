//! Boot and teardown of the running hub.

use std::path::PathBuf;
use std::sync::Arc;

use mdroid_policy::Policies;
use mdroid_serial::{CommandSink, Connector, LinkManager};
use mdroid_store::{HookRegistry, PersistError, SettingsStore, StateStore};
use thiserror::Error;
use tokio::sync::watch;
use tracing::{error, info, warn};

use crate::config::Config;

#[derive(Error, Debug)]
pub enum HubError {
    #[error("Cannot create directory {path}: {source}")]
    Directory {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Settings(#[from] PersistError),
}

/// Run the hub until `shutdown` turns `true` (or its sender is dropped).
///
/// Failures to restore or save the session, or to open a configured port,
/// are logged and do not stop the hub; unreadable settings do.
pub async fn run(
    cfg: Config,
    mut shutdown: watch::Receiver<bool>,
    connector: Arc<dyn Connector>,
) -> Result<(), HubError> {
    if let Some(dir) = cfg.settings_file.parent()
        && !dir.as_os_str().is_empty()
    {
        std::fs::create_dir_all(dir).map_err(|source| HubError::Directory {
            path: dir.to_path_buf(),
            source,
        })?;
    }

    let hooks = Arc::new(HookRegistry::new());
    let store = Arc::new(StateStore::new(Arc::clone(&hooks)));
    let settings_hooks = Arc::new(HookRegistry::new());
    let settings = Arc::new(SettingsStore::open(&cfg.settings_file, Arc::clone(&settings_hooks))?);

    if let Some(path) = &cfg.session_file
        && let Err(e) = store.load_session(path)
    {
        warn!(error = %e, "session not restored; starting empty");
    }

    let links = LinkManager::new(Arc::clone(&store), connector, cfg.link_config());
    let sink: Arc<dyn CommandSink> = links.clone();
    Policies::new(Arc::clone(&store), settings, sink, cfg.policy_config()).install();

    for (key, value) in cfg.initial_state() {
        store.set(&key, value);
    }

    for port in &cfg.serial {
        if let Err(e) = links.open(&port.device, port.baud) {
            error!(device = %port.device, error = %e, "cannot supervise serial port");
        }
    }
    info!(ports = cfg.serial.len(), "hub running");

    // An Err here means every sender is gone, which is a shutdown as well.
    let _ = shutdown.wait_for(|stop| *stop).await;

    info!("shutting down");
    links.shutdown().await;
    hooks.shutdown().await;
    settings_hooks.shutdown().await;

    if let Some(path) = &cfg.session_file {
        match store.save_session(path) {
            Ok(()) => info!(path = %path.display(), entries = store.len(), "session saved"),
            Err(e) => error!(error = %e, "session not saved"),
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SerialDevice;
    use mdroid_serial::transport::mock::MockConnector;
    use std::collections::BTreeMap;
    use std::time::Duration;

    fn test_config(dir: &std::path::Path) -> Config {
        let mut initial_state = BTreeMap::new();
        initial_state.insert("acc_power".to_string(), toml::Value::Boolean(false));
        Config {
            settings_file: dir.join("state").join("settings.json"),
            session_file: Some(dir.join("session.json")),
            reconnect_backoff_secs: 1,
            read_timeout_secs: 1,
            ack_timeout_ms: 100,
            initial_state,
            serial: vec![SerialDevice {
                device: "/dev/mock0".into(),
                baud: 115_200,
            }],
            ..Config::default()
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn frames_reach_the_saved_session() {
        let dir = tempfile::tempdir().expect("tmp dir");
        let cfg = test_config(dir.path());
        let session = cfg.session_file.clone().unwrap();
        let connector = MockConnector::new();
        let device = connector.device("/dev/mock0");
        let (stop_tx, stop_rx) = watch::channel(false);

        let hub = tokio::spawn(run(cfg, stop_rx, Arc::new(connector.clone())));

        for _ in 0..100 {
            if device.opens() > 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(device.opens(), 1);
        device.inject(br#"{"main_voltage_raw": 512}"#);
        tokio::time::sleep(Duration::from_millis(300)).await;

        stop_tx.send(true).unwrap();
        hub.await.unwrap().unwrap();

        let saved: serde_json::Value =
            serde_json::from_slice(&std::fs::read(&session).unwrap()).unwrap();
        assert_eq!(saved["MAIN_VOLTAGE_RAW"]["value"], "512");
        assert_eq!(saved["MAIN_VOLTAGE"]["value"], "12.200");
        assert_eq!(saved["ACC_POWER"]["value"], "FALSE");
        assert!(dir.path().join("state").is_dir());
    }

    #[tokio::test]
    async fn dropped_sender_stops_the_hub() {
        let dir = tempfile::tempdir().expect("tmp dir");
        let mut cfg = test_config(dir.path());
        cfg.serial.clear();
        let (stop_tx, stop_rx) = watch::channel(false);
        drop(stop_tx);

        run(cfg, stop_rx, Arc::new(MockConnector::new())).await.unwrap();
        assert!(dir.path().join("session.json").is_file());
    }

    #[tokio::test]
    async fn corrupt_settings_refuse_to_boot() {
        let dir = tempfile::tempdir().expect("tmp dir");
        let cfg = test_config(dir.path());
        std::fs::create_dir_all(dir.path().join("state")).unwrap();
        std::fs::write(&cfg.settings_file, "{ not json").unwrap();
        let (_stop_tx, stop_rx) = watch::channel(false);

        let err = run(cfg, stop_rx, Arc::new(MockConnector::new())).await.unwrap_err();
        assert!(matches!(err, HubError::Settings(PersistError::Json { .. })));
    }
}
