/*
 * Created on Tue Feb 13 2024
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

//! # uptimed
//!
//! The `uptimed` crate is the uptime monitoring daemon: it probes a
//! dynamic set of services, persists the transitions between healthy and
//! failed states as downtime intervals, and periodically consolidates the
//! log into per-service SLA figures. See the modules for their respective
//! documentation.

mod arbiter;
mod config;
mod consolidation;
mod instance;
mod monitor;
mod providers;
mod service;
mod storage;
mod util;

use crate::config::ConfigType;
use env_logger::Builder;
use libuptime::{util::terminal, URL, VERSION};
use std::env;

fn main() {
    Builder::new()
        .parse_filters(&env::var("UPTIME_LOG").unwrap_or_else(|_| "info".to_owned()))
        .init();
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .thread_name("uptimed")
        .enable_all()
        .build()
        .unwrap();
    let result = runtime.block_on(async {
        println!("uptimed v{} | {}", VERSION, URL);
        let cfg = match config::get_config() {
            Ok(ConfigType::Custom(cfg, active_env)) => {
                log::info!("using the `{active_env}` section of the supplied configuration");
                cfg
            }
            Ok(ConfigType::Def(cfg)) => {
                log::warn!("no configuration file supplied. Using the built-in local settings");
                cfg
            }
            Err(e) => {
                log::error!("{e}");
                util::exit_error()
            }
        };
        arbiter::run(cfg).await
    });
    // dropping the runtime waits for the spawned workers to terminate
    drop(runtime);
    match result {
        Ok(()) => {
            let _ = terminal::write_info("Goodbye :)\n");
        }
        Err(e) => {
            log::error!("{e}");
            util::exit_error()
        }
    }
}
