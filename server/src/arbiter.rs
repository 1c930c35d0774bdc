/*
 * Created on Mon Mar 11 2024
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

//! The composition layer: build the storage backend, the monitor, the
//! consolidation workers and (optionally) the instance lock from the
//! configuration, run until a termination signal arrives or the heartbeat
//! is lost, then stop everything in order and wait for each worker to
//! wind down. There is no forced exit: every worker is joined

use crate::{
    config::{ConfigError, EnvConfig},
    consolidation::{sla::ConsolidationSla, status::ConsolidationStatus},
    instance::{InstanceLock, WatchOutcome},
    monitor::{Provider, ServicesMonitor, TaskConfig},
    providers::StaticProvider,
    storage::{mongo::MongoStorage, Storage, StorageSink},
    util::error::{Error, UptimeResult},
};
use std::sync::Arc;

/// The provider name for services defined in the configuration file
const STATIC_PROVIDER: &str = "static";

/// Start the daemon and block until it has fully shut down
pub async fn run(cfg: EnvConfig) -> UptimeResult<()> {
    // storage backend first; nothing works without it
    let storage: Arc<dyn Storage> = match cfg.storage.backend.as_str() {
        "MongoStorage" => {
            Arc::new(MongoStorage::connect(&cfg.storage.uri, &cfg.storage.db).await?)
        }
        other => return Err(ConfigError::UnknownBackend(other.to_owned()).into()),
    };
    if !storage.ready().await {
        return Err(Error::other("storage backend is not ready"));
    }
    log::info!("storage backend ready ({})", cfg.storage.db);

    // the monitor reports transitions straight to the storage backend
    let monitor = Arc::new(ServicesMonitor::new(
        Arc::new(StorageSink(storage.clone())),
        TaskConfig::from(&cfg.monitoring),
    ));
    let mut providers: Vec<Box<dyn Provider>> = Vec::new();
    if !cfg.services.is_empty() {
        providers.push(Box::new(StaticProvider::new(
            STATIC_PROVIDER,
            cfg.services.build(),
        )));
    }

    let mut sla = None;
    let mut status = None;
    if cfg.server.with_consolidation {
        sla = Some(ConsolidationSla::new(
            storage.clone(),
            cfg.consolidations.sla.waiting_seconds_between_batch,
        ));
        status = Some(ConsolidationStatus::new(
            storage.clone(),
            cfg.consolidations.status.filter_document()?,
            cfg.consolidations.status.down_since,
            cfg.consolidations.status.waiting_seconds_between_batch,
        ));
    } else {
        log::warn!("consolidation is disabled; no SLA figures will be produced");
    }

    // with the instance lock enabled we stay passive until the current
    // active instance stops heartbeating
    let lock = cfg.server.with_instance_lock.then(|| {
        InstanceLock::new(
            storage.clone(),
            cfg.instance.alive,
            cfg.instance.inactive_during,
        )
    });
    if let Some(lock) = &lock {
        let active = tokio::select! {
            active = lock.wait_until_active() => active,
            _ = termination() => false,
        };
        if !active {
            log::info!("shutting down while still passive");
            return Ok(());
        }
    }

    for provider in &providers {
        provider.start(&monitor).await;
    }
    if let Some(sla) = &mut sla {
        sla.start();
    }
    if let Some(status) = &mut status {
        status.start();
    }
    monitor.start();
    log::info!("uptimed is up ({} checking tasks)", monitor.task_count());

    // run until someone tells us to stop
    let heartbeat_lost = match &lock {
        Some(lock) => tokio::select! {
            outcome = lock.watch() => outcome == WatchOutcome::Lost,
            _ = termination() => false,
        },
        None => {
            termination().await;
            false
        }
    };

    log::info!("signalling all workers to shut down");
    if let Some(lock) = &lock {
        lock.signal_stop();
    }
    for provider in &providers {
        provider.stop(&monitor).await;
    }
    if let Some(sla) = &sla {
        sla.signal_stop();
    }
    if let Some(status) = &status {
        status.signal_stop();
    }
    monitor.stop().await;
    debug_assert!(!monitor.is_running());
    if let Some(mut sla) = sla {
        sla.join().await;
    }
    if let Some(mut status) = status {
        status.join().await;
    }

    if heartbeat_lost {
        // the workers are down cleanly; let another instance take over
        Err(Error::HeartbeatLost)
    } else {
        Ok(())
    }
}

#[cfg(unix)]
/// Resolve on SIGINT or SIGTERM, whichever comes first
async fn termination() {
    use tokio::signal::unix::{signal, SignalKind};
    match signal(SignalKind::terminate()) {
        Ok(mut sigterm) => {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = sigterm.recv() => {}
            }
        }
        Err(e) => {
            log::error!("failed to bind to SIGTERM: {e}");
            let _ = tokio::signal::ctrl_c().await;
        }
    }
}

#[cfg(not(unix))]
async fn termination() {
    let _ = tokio::signal::ctrl_c().await;
}
