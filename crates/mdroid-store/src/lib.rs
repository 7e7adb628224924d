//! `mdroid-store` – the shared vehicle state and everything that reacts to it.
//!
//! # Modules
//!
//! - [`state`] – [`StateStore`][state::StateStore]: the concurrent, typed
//!   key/value map with change timestamps, a broadcast change feed, and
//!   session save/restore.
//! - [`hooks`] – [`HookRegistry`][hooks::HookRegistry]: per-key
//!   subscriptions with cooldown windows, run by a supervised dispatcher so a
//!   failing callback stays isolated.
//! - [`settings`] – [`SettingsStore`][settings::SettingsStore]: persisted
//!   `component → name → value` settings, rewritten whole on every change.

pub mod error;
pub mod hooks;
pub mod settings;
pub mod state;

pub use error::PersistError;
pub use hooks::{Cooldown, FnHook, Hook, HookRegistry, hook_fn};
pub use settings::SettingsStore;
pub use state::StateStore;
