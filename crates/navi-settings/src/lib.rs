//! # navi-settings
//!
//! Settings are loaded from three layers, lowest priority first:
//! 1. compiled defaults ([`NaviSettings::default()`])
//! 2. `~/.navisound/settings.json`, deep-merged over the defaults
//! 3. `NAVI_*` environment variables

#![deny(unsafe_code)]

pub mod errors;
pub mod loader;
pub mod types;

pub use errors::{Result, SettingsError};
pub use loader::{deep_merge, expand_home, load_settings, load_settings_from_path, settings_path};
pub use types::*;
