//! Auto-lock: lock the doors once the car is left unlocked and unattended.

use mdroid_types::{AckCondition, HookError, Message};
use tracing::{debug, info};

use crate::Policies;

/// Command that flips the central locking.
pub const TOGGLE_DOOR_LOCKS: &str = "toggleDoorLocks";

/// What an auto-lock evaluation did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockOutcome {
    /// `toggleDoorLocks` was sent and confirmed.
    Locked,
    /// `DOORS_LOCKED` has not been reported yet.
    DoorsUnknown,
    /// `MDROID.AUTOLOCK` is not `AUTO`.
    Disabled,
    /// Doors already locked, or the car is in use or at home.
    NotNeeded,
    /// The doors were toggled within the grace period, e.g. someone is
    /// getting back in.
    RecentlyToggled,
}

impl Policies {
    /// Lock the doors if auto-lock is enabled, they are unlocked, ACC is off,
    /// the car is away from home, the key is out, and nobody touched the
    /// locks during the grace period.
    pub async fn eval_auto_lock(&self) -> Result<LockOutcome, HookError> {
        let Ok(doors) = self.store.get("DOORS_LOCKED") else {
            return Ok(LockOutcome::DoorsUnknown);
        };

        let target = self.settings.get_or("MDROID", "AUTOLOCK", "AUTO");
        if !target.eq_ignore_ascii_case("AUTO") {
            return Ok(LockOutcome::Disabled);
        }

        let acc_on = self.store.get_string_or("ACC_POWER", "FALSE") == "TRUE";
        let home = self.store.get_string_or("BLE_CENTRAL_CONNECTED", "FALSE") == "TRUE";
        let key_in = self.key_in();
        if doors.value != "FALSE" || acc_on || home || key_in {
            debug!(doors = %doors.value, acc_on, home, key_in, "auto-lock not needed");
            return Ok(LockOutcome::NotNeeded);
        }

        let since_toggle = doors.age();
        if since_toggle < self.config.unlock_grace {
            debug!(?since_toggle, "doors toggled recently; not locking");
            return Ok(LockOutcome::RecentlyToggled);
        }

        info!(?since_toggle, "car left unlocked; locking doors");
        self.sink
            .await_ack(
                Message::new(TOGGLE_DOOR_LOCKS),
                AckCondition::new("DOORS_LOCKED", "TRUE"),
                self.config.ack_timeout,
            )
            .await?;
        Ok(LockOutcome::Locked)
    }
}
