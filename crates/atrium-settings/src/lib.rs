//! # atrium-settings
//!
//! Settings are loaded from three layers (in priority order):
//! 1. **Compiled defaults**: [`AtriumSettings::default()`]
//! 2. **Settings file**: `~/.atrium/settings.json` or `$ATRIUM_SETTINGS`
//!    (deep-merged over defaults)
//! 3. **Environment variables**: `ATRIUM_*` overrides (highest priority)

#![deny(unsafe_code)]

pub mod errors;
pub mod loader;
pub mod types;

pub use errors::{Result, SettingsError};
pub use loader::{apply_env_overrides, apply_overrides_from, deep_merge, load_settings, load_settings_from_path, settings_path};
pub use types::*;
