//! Component power policy.
//!
//! Each switchable component `C` has a session flag `C_POWER` reported by the
//! vehicle and a user setting `C.POWER` that is one of `AUTO`, `ON` or `OFF`.
//! An evaluator works out whether `C` should be on right now and hands that
//! to [`Policies::trigger_power`], which compares it with the setting and the
//! current state and, when they disagree, sends `powerOn:C` or `powerOff:C`
//! and waits for `C_POWER` to confirm.

use std::fmt;
use std::str::FromStr;

use mdroid_types::{AckCondition, HookError, Message, StateChange, canonical_key};
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::Policies;

/// User setting for one component.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PowerTarget {
    /// Follow the vehicle state.
    Auto,
    On,
    Off,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Unknown power target {0:?}")]
pub struct UnknownTarget(pub String);

impl FromStr for PowerTarget {
    type Err = UnknownTarget;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_uppercase().as_str() {
            "AUTO" => Ok(PowerTarget::Auto),
            "ON" => Ok(PowerTarget::On),
            "OFF" => Ok(PowerTarget::Off),
            _ => Err(UnknownTarget(s.to_string())),
        }
    }
}

impl fmt::Display for PowerTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            PowerTarget::Auto => "AUTO",
            PowerTarget::On => "ON",
            PowerTarget::Off => "OFF",
        })
    }
}

/// A power command to send.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PowerAction {
    On,
    Off,
}

impl PowerAction {
    /// Wire text for `component`, e.g. `powerOn:BOARD`.
    pub fn command(self, component: &str) -> String {
        match self {
            PowerAction::On => format!("powerOn:{component}"),
            PowerAction::Off => format!("powerOff:{component}"),
        }
    }

    fn confirmed_by(self) -> &'static str {
        match self {
            PowerAction::On => "TRUE",
            PowerAction::Off => "FALSE",
        }
    }
}

/// Whether a component must be switched.
///
/// `AUTO` follows `should_be_on`; `ON`/`OFF` force the state regardless.
/// Returns `None` when the component is already where it should be.
pub fn decide(target: PowerTarget, is_on: bool, should_be_on: bool) -> Option<PowerAction> {
    match target {
        PowerTarget::Auto if !is_on && should_be_on => Some(PowerAction::On),
        PowerTarget::Auto if is_on && !should_be_on => Some(PowerAction::Off),
        PowerTarget::On if !is_on => Some(PowerAction::On),
        PowerTarget::Off if is_on => Some(PowerAction::Off),
        _ => None,
    }
}

impl Policies {
    /// Switch `component` if its setting and state call for it.
    ///
    /// An unreadable setting is reset to `AUTO` and nothing is sent this
    /// round; components with a settings hook re-evaluate from the reset.
    pub async fn trigger_power(
        &self,
        component: &str,
        should_be_on: bool,
        reason: &str,
    ) -> Result<Option<PowerAction>, HookError> {
        let component = canonical_key(component);
        let target = self
            .settings
            .get(&component, "POWER")
            .map_err(|e| e.to_string())
            .and_then(|raw| raw.parse::<PowerTarget>().map_err(|e| e.to_string()));
        let target = match target {
            Ok(target) => target,
            Err(problem) => {
                warn!(component = %component, problem = %problem, "power target unreadable; resetting to AUTO");
                if let Err(e) = self.settings.set(&component, "POWER", "AUTO") {
                    error!(component = %component, error = %e, "could not persist reset power target");
                }
                return Ok(None);
            }
        };

        let state_key = format!("{component}_POWER");
        let is_on = self.store.get_bool_or(&state_key, false);
        let Some(action) = decide(target, is_on, should_be_on) else {
            debug!(component = %component, %target, is_on, should_be_on, "power unchanged");
            return Ok(None);
        };

        let reason = match target {
            PowerTarget::Auto => reason.to_string(),
            forced => format!("target is {forced}"),
        };
        info!(component = %component, ?action, reason = %reason, "switching power");

        self.sink
            .await_ack(
                Message::new(action.command(&component)),
                AckCondition::new(&state_key, action.confirmed_by()),
                self.config.ack_timeout,
            )
            .await?;
        Ok(Some(action))
    }

    /// `ACC_POWER` changed: wireless, sound, tablet and angel eyes all
    /// depend on it.
    pub(crate) async fn on_acc_power(&self, change: &StateChange) -> Result<(), HookError> {
        let acc = match change.entry.value.as_str() {
            "TRUE" => true,
            "FALSE" => false,
            other => {
                return Err(HookError::Failed(format!("unexpected ACC_POWER value {other:?}")));
            }
        };
        let wifi = self.store.get_bool_or("WIFI_CONNECTED", false);
        let tablet_reason = format!("accOn: {acc}");

        let (wireless, sound, tablet, angel_eyes) = tokio::join!(
            self.eval_wireless(acc, wifi),
            self.eval_sound(acc, wifi),
            self.trigger_power("TABLET", acc, &tablet_reason),
            self.eval_angel_eyes(),
        );
        wireless?;
        sound?;
        tablet?;
        angel_eyes?;
        Ok(())
    }

    pub(crate) async fn on_key_state(&self) -> Result<(), HookError> {
        let (angel_eyes, board) = tokio::join!(self.eval_angel_eyes(), self.eval_board());
        angel_eyes?;
        board?;
        Ok(())
    }

    /// Angel eyes run with the key in and the light sensor off.
    pub async fn eval_angel_eyes(&self) -> Result<Option<PowerAction>, HookError> {
        let key_in = self.key_in();
        let light_sensor = self.store.get_bool_or("LIGHT_SENSOR_ON", false);
        let reason = format!("lightSensor: {light_sensor}, keyIsIn: {key_in}");
        self.trigger_power("ANGEL_EYES", key_in && !light_sensor, &reason)
            .await
    }

    /// The video board runs while the key is in.
    pub async fn eval_board(&self) -> Result<Option<PowerAction>, HookError> {
        let key_in = self.key_in();
        self.trigger_power("BOARD", key_in, &format!("keyIsIn: {key_in}"))
            .await
    }

    /// Wireless stays on except when parked on a known wifi network.
    pub async fn eval_wireless(&self, acc: bool, wifi: bool) -> Result<Option<PowerAction>, HookError> {
        let should_be_on = acc || !wifi;
        let reason = format!("accOn: {acc}, wifiOn: {wifi}");
        self.trigger_power("WIRELESS", should_be_on, &reason).await
    }

    pub async fn eval_sound(&self, acc: bool, wifi: bool) -> Result<Option<PowerAction>, HookError> {
        let key_in = self.key_in();
        let should_be_on = (acc && !wifi) || (wifi && key_in);
        let reason = format!("accOn: {acc}, wifiOn: {wifi}, keyIsIn: {key_in}");
        self.trigger_power("SOUND", should_be_on, &reason).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{Fixture, SinkMode};
    use mdroid_serial::LinkError;
    use mdroid_types::Entry;

    #[test]
    fn decide_truth_table() {
        use PowerAction::{Off, On};
        use PowerTarget::{Auto, Off as ForceOff, On as ForceOn};

        assert_eq!(decide(Auto, false, true), Some(On));
        assert_eq!(decide(Auto, true, false), Some(Off));
        assert_eq!(decide(Auto, true, true), None);
        assert_eq!(decide(Auto, false, false), None);
        assert_eq!(decide(ForceOn, false, false), Some(On));
        assert_eq!(decide(ForceOn, true, false), None);
        assert_eq!(decide(ForceOff, true, true), Some(Off));
        assert_eq!(decide(ForceOff, false, true), None);
    }

    #[test]
    fn targets_parse_case_insensitively() {
        assert_eq!("auto".parse::<PowerTarget>(), Ok(PowerTarget::Auto));
        assert_eq!(" On ".parse::<PowerTarget>(), Ok(PowerTarget::On));
        assert_eq!("OFF".parse::<PowerTarget>(), Ok(PowerTarget::Off));
        assert_eq!("sometimes".parse::<PowerTarget>(), Err(UnknownTarget("sometimes".into())));
    }

    #[tokio::test]
    async fn auto_target_powers_on_and_waits_for_confirmation() {
        let fx = Fixture::new(SinkMode::Confirm);
        fx.settings.set("BOARD", "POWER", "AUTO").unwrap();

        let action = fx.policies.trigger_power("board", true, "test").await.unwrap();
        assert_eq!(action, Some(PowerAction::On));
        assert_eq!(fx.sink.sent(), vec!["powerOn:BOARD"]);
        assert_eq!(fx.sink.awaited(), vec![AckCondition::new("BOARD_POWER", "TRUE")]);
        assert_eq!(fx.store.get_string_or("BOARD_POWER", ""), "TRUE");
    }

    #[tokio::test]
    async fn forced_off_overrides_should_be_on() {
        let fx = Fixture::new(SinkMode::Confirm);
        fx.settings.set("SOUND", "POWER", "OFF").unwrap();
        fx.store.restore([Entry::now("SOUND_POWER", "TRUE")]);

        let action = fx.policies.trigger_power("SOUND", true, "test").await.unwrap();
        assert_eq!(action, Some(PowerAction::Off));
        assert_eq!(fx.sink.sent(), vec!["powerOff:SOUND"]);
    }

    #[tokio::test]
    async fn missing_target_is_reset_to_auto_without_command() {
        let fx = Fixture::new(SinkMode::Confirm);
        let action = fx.policies.trigger_power("TABLET", true, "test").await.unwrap();
        assert_eq!(action, None);
        assert!(fx.sink.sent().is_empty());
        assert_eq!(fx.settings.get("TABLET", "POWER").unwrap(), "AUTO");
    }

    #[tokio::test]
    async fn garbage_target_is_reset_to_auto() {
        let fx = Fixture::new(SinkMode::Confirm);
        fx.settings.set("WIRELESS", "POWER", "MAYBE").unwrap();
        assert_eq!(fx.policies.eval_wireless(true, false).await.unwrap(), None);
        assert_eq!(fx.settings.get("WIRELESS", "POWER").unwrap(), "AUTO");
    }

    #[tokio::test]
    async fn unconfirmed_command_surfaces_timeout() {
        let fx = Fixture::new(SinkMode::Timeout);
        fx.settings.set("ANGEL_EYES", "POWER", "ON").unwrap();
        let err = fx.policies.eval_angel_eyes().await.unwrap_err();
        assert!(err.to_string().contains("ANGEL_EYES_POWER"), "{err}");
        assert_eq!(fx.sink.sent(), vec!["powerOn:ANGEL_EYES"]);
    }

    #[tokio::test]
    async fn no_writer_is_reported_as_hook_failure() {
        let fx = Fixture::new(SinkMode::NoWriter);
        fx.settings.set("BOARD", "POWER", "ON").unwrap();
        let err = fx.policies.eval_board().await.unwrap_err();
        assert_eq!(err.to_string(), HookError::from(LinkError::NoWriter).to_string());
    }

    #[tokio::test]
    async fn angel_eyes_follow_key_and_light_sensor() {
        let fx = Fixture::new(SinkMode::Confirm);
        fx.settings.set("ANGEL_EYES", "POWER", "AUTO").unwrap();

        fx.store.restore([Entry::now("KEY_STATE", "FALSE")]);
        assert_eq!(fx.policies.eval_angel_eyes().await.unwrap(), None);

        fx.store.restore([Entry::now("KEY_STATE", "RUN"), Entry::now("LIGHT_SENSOR_ON", "TRUE")]);
        assert_eq!(fx.policies.eval_angel_eyes().await.unwrap(), None);

        fx.store.restore([Entry::now("LIGHT_SENSOR_ON", "FALSE")]);
        assert_eq!(fx.policies.eval_angel_eyes().await.unwrap(), Some(PowerAction::On));
    }

    #[tokio::test]
    async fn wireless_only_sleeps_on_wifi_with_acc_off() {
        let fx = Fixture::new(SinkMode::Confirm);
        fx.settings.set("WIRELESS", "POWER", "AUTO").unwrap();
        fx.store.restore([Entry::now("WIRELESS_POWER", "TRUE")]);

        assert_eq!(fx.policies.eval_wireless(true, true).await.unwrap(), None);
        assert_eq!(fx.policies.eval_wireless(false, false).await.unwrap(), None);
        assert_eq!(
            fx.policies.eval_wireless(false, true).await.unwrap(),
            Some(PowerAction::Off)
        );
        assert_eq!(fx.sink.sent(), vec!["powerOff:WIRELESS"]);
    }

    #[tokio::test]
    async fn sound_truth_table() {
        let fx = Fixture::new(SinkMode::Confirm);
        fx.settings.set("SOUND", "POWER", "AUTO").unwrap();
        fx.store.restore([Entry::now("KEY_STATE", "FALSE")]);

        assert_eq!(fx.policies.eval_sound(false, false).await.unwrap(), None);
        assert_eq!(fx.policies.eval_sound(false, true).await.unwrap(), None);
        assert_eq!(fx.policies.eval_sound(true, false).await.unwrap(), Some(PowerAction::On));
    }

    #[tokio::test]
    async fn acc_power_rejects_unexpected_value() {
        let fx = Fixture::new(SinkMode::Confirm);
        let change = StateChange {
            key: "ACC_POWER".into(),
            entry: Entry::now("ACC_POWER", "MAYBE"),
            previous: None,
        };
        assert!(fx.policies.on_acc_power(&change).await.is_err());
        assert!(fx.sink.sent().is_empty());
    }

    #[tokio::test]
    async fn acc_on_switches_every_dependent_component() {
        let fx = Fixture::new(SinkMode::Confirm);
        for component in ["WIRELESS", "SOUND", "TABLET", "ANGEL_EYES"] {
            fx.settings.set(component, "POWER", "AUTO").unwrap();
        }
        let change = StateChange {
            key: "ACC_POWER".into(),
            entry: Entry::now("ACC_POWER", "TRUE"),
            previous: None,
        };
        fx.policies.on_acc_power(&change).await.unwrap();

        let mut sent = fx.sink.sent();
        sent.sort();
        assert_eq!(
            sent,
            vec!["powerOn:ANGEL_EYES", "powerOn:SOUND", "powerOn:TABLET", "powerOn:WIRELESS"]
        );
    }
}
