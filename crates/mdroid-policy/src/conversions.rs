//! Raw sensor conversions and simple inferences.
//!
//! The microcontroller reports ADC counts; these subscribers publish the
//! physical values next to them.

use mdroid_types::{HookError, StateChange};
use tracing::debug;

use crate::Policies;

/// Volts for a 10-bit reading of the 24.4 V divider.
pub fn volts_from_raw(raw: f64) -> f64 {
    raw / 1024.0 * 24.4
}

/// Milliamps through the hall sensor for a 12-bit reading centred on 1.5 V at
/// 185 mV/A.
pub fn milliamps_from_raw(raw: f64) -> f64 {
    (1000.0 * ((raw * 3.3 / 4095.0 - 1.5) / 185.0)).abs()
}

impl Policies {
    /// `MAIN_VOLTAGE_RAW` → `MAIN_VOLTAGE`, `AUX_VOLTAGE_RAW` → `AUX_VOLTAGE`.
    pub(crate) fn on_voltage(&self, change: &StateChange) -> Result<(), HookError> {
        let raw: f64 = change.entry.parse()?;
        let target = change.key.strip_suffix("_RAW").unwrap_or(&change.key);
        self.store.set(target, format!("{:.3}", volts_from_raw(raw)));
        Ok(())
    }

    pub(crate) fn on_aux_current(&self, change: &StateChange) -> Result<(), HookError> {
        let raw: f64 = change.entry.parse()?;
        self.store
            .set("AUX_CURRENT", format!("{:.3}", milliamps_from_raw(raw)));
        Ok(())
    }

    /// With the wireless board off the LTE modem cannot report, so mark it
    /// down ourselves.
    pub(crate) fn on_wireless_power(&self, change: &StateChange) {
        if change.entry.value == "FALSE" {
            debug!("wireless off; LTE assumed down");
            self.store.set("LTE_ON", "FALSE");
        }
    }
}
