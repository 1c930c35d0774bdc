/*
 * Created on Thu Mar 07 2024
 *
 * This file is a part of uptimed
 * uptimed is a free and open-source uptime monitoring daemon that probes
 * user-defined services, records the downtime intervals between healthy
 * and failed states and consolidates them into per-service SLA figures.
 *
 * Copyright (c) 2024, The uptimed authors
 *
 * This program is free software: you can redistribute it and/or modify
 * it under the terms of the GNU Affero General Public License as published by
 * the Free Software Foundation, either version 3 of the License, or
 * (at your option) any later version.
 *
 * This program is distributed in the hope that it will be useful,
 * but WITHOUT ANY WARRANTY; without even the implied warranty of
 * MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
 * GNU Affero General Public License for more details.
 *
 * You should have received a copy of the GNU Affero General Public License
 * along with this program. If not, see <https://www.gnu.org/licenses/>.
 *
*/

//! # Configuration
//!
//! The configuration is one YAML file holding an `env:` mapping; the
//! `UPTIME_ENV` environment variable selects the active section (default
//! `local`). The file path is the first CLI argument, defaulting to
//! `uptime.yaml`; when that default file does not exist the built-in
//! `local` settings are used so a bare `uptimed` starts against a local
//! backend.

// internal modules
mod definitions;
mod feedback;
#[cfg(test)]
mod tests;
// internal imports
pub use self::definitions::*;
pub use self::feedback::ConfigError;
// std imports
use std::{env, fs, io, path::Path};

/// The environment variable selecting the configuration section
pub const ENV_SELECTOR: &str = "UPTIME_ENV";
/// The section used when `UPTIME_ENV` is not set
pub const DEFAULT_ENV: &str = "local";
const DEFAULT_CONFIG_PATH: &str = "uptime.yaml";

#[derive(Debug)]
/// Whether we started from a supplied configuration or the built-in one
pub enum ConfigType {
    /// Settings from the configuration file, with the selected env name
    Custom(EnvConfig, String),
    /// The built-in `local` settings
    Def(EnvConfig),
}

/// Assemble the startup configuration from the CLI argument and
/// `UPTIME_ENV`
pub fn get_config() -> Result<ConfigType, ConfigError> {
    let path = env::args()
        .nth(1)
        .unwrap_or_else(|| DEFAULT_CONFIG_PATH.to_owned());
    let selected_env = env::var(ENV_SELECTOR).unwrap_or_else(|_| DEFAULT_ENV.to_owned());
    if !Path::new(&path).exists() {
        if selected_env == DEFAULT_ENV {
            return Ok(ConfigType::Def(EnvConfig::local_default()));
        }
        // a non-default environment without a file is a mistake, not a
        // request for defaults
        return Err(ConfigError::OSError(io::Error::new(
            io::ErrorKind::NotFound,
            format!("configuration file `{path}` not found"),
        )));
    }
    let raw = fs::read_to_string(&path)?;
    let cfg = parse_config(&raw, &selected_env)?;
    Ok(ConfigType::Custom(cfg, selected_env))
}

/// Parse the file contents and pick the section for `selected_env`
pub fn parse_config(raw: &str, selected_env: &str) -> Result<EnvConfig, ConfigError> {
    let mut file: ConfigFile = serde_yaml::from_str(raw)?;
    file.env
        .remove(selected_env)
        .ok_or_else(|| ConfigError::UnknownEnvironment(selected_env.to_owned()))
}
