/*
 * Created on Wed Feb 14 2024
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

use crate::{config::ConfigError, storage::StorageError};
use std::fmt;

pub type UptimeResult<T> = Result<T, Error>;

#[derive(Debug)]
pub enum Error {
    /// A configuration error. Always fatal at startup
    Config(ConfigError),
    /// A storage backend error that bubbled past the retry loops
    Storage(StorageError),
    /// The instance heartbeat was lost to another instance
    HeartbeatLost,
    OtherError(String),
}

impl Error {
    pub fn other(msg: impl ToString) -> Self {
        Self::OtherError(msg.to_string())
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Config(cerr) => write!(f, "Configuration error: {}", cerr),
            Self::Storage(serr) => write!(f, "Storage error: {}", serr),
            Self::HeartbeatLost => write!(
                f,
                "Instance heartbeat lost: another instance owns the backend"
            ),
            Self::OtherError(oerr) => write!(f, "Error: {}", oerr),
        }
    }
}

impl From<ConfigError> for Error {
    fn from(cerr: ConfigError) -> Self {
        Self::Config(cerr)
    }
}

impl From<StorageError> for Error {
    fn from(serr: StorageError) -> Self {
        Self::Storage(serr)
    }
}
