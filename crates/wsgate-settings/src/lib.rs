//! # wsgate-settings
//!
//! Configuration with layered sources for the wsgate gateway.
//!
//! Settings are loaded from three layers (in priority order):
//! 1. **Compiled defaults**: [`GatewaySettings::default()`]
//! 2. **Settings file**: a JSON file deep-merged over the defaults
//! 3. **Environment variables**: `WSGATE_*` overrides (highest priority)
//!
//! The loaded value is passed explicitly to the server; there is no global
//! settings singleton.

#![deny(unsafe_code)]

pub mod errors;
pub mod loader;
pub mod types;

pub use errors::{Result, SettingsError};
pub use loader::{apply_env_overrides, deep_merge, load_settings, load_settings_from_path};
pub use types::*;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_settings_are_valid() {
        let settings = GatewaySettings::default();
        assert_eq!(settings.server.port, 3000);
        assert_eq!(settings.server.path, "/");
        assert_eq!(settings.keep_alive.max_simultaneous_pings, 2000);
        assert!(settings.routes.is_empty());
        assert!(settings.middlewares.is_empty());
        assert!(settings.validate().is_ok());
    }
}
