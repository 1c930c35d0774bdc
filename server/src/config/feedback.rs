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

use std::{fmt, io::Error as IoError};

#[derive(Debug)]
/// Anything that can go wrong while assembling the startup configuration.
/// All of these are fatal: the daemon refuses to start on a bad config
pub enum ConfigError {
    OSError(IoError),
    ParseError(serde_yaml::Error),
    /// The selected `UPTIME_ENV` has no section in the file
    UnknownEnvironment(String),
    /// `storage.backend` names a backend this build does not provide
    UnknownBackend(String),
    /// `consolidations.status.filter` is not a mapping
    BadStatusFilter(String),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::OSError(ioe) => write!(f, "OS error while reading the configuration: {}", ioe),
            Self::ParseError(perr) => write!(f, "failed to parse the configuration file: {}", perr),
            Self::UnknownEnvironment(env) => {
                write!(f, "environment `{}` is not defined in the configuration", env)
            }
            Self::UnknownBackend(backend) => {
                write!(f, "unknown storage backend `{}`", backend)
            }
            Self::BadStatusFilter(why) => {
                write!(f, "consolidations.status.filter is not a valid query: {}", why)
            }
        }
    }
}

impl From<IoError> for ConfigError {
    fn from(ioe: IoError) -> Self {
        Self::OSError(ioe)
    }
}

impl From<serde_yaml::Error> for ConfigError {
    fn from(perr: serde_yaml::Error) -> Self {
        Self::ParseError(perr)
    }
}
