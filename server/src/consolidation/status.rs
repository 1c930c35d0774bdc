/*
 * Created on Tue Mar 05 2024
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

//! The public-status worker. A service is publicly down only once an open
//! downtime has lasted at least `down_time_duration` seconds; short flaps
//! never surface. The consolidated value is written back to the service
//! row only when it actually changed

use super::WorkerHandle;
use crate::{
    service::Status,
    storage::Storage,
    util,
};
use mongodb::bson::Document;
use std::{
    sync::{atomic::{AtomicBool, Ordering}, Arc},
    time::{Duration, Instant},
};

pub const DEFAULT_DOWN_TIME_DURATION: i64 = 600;
pub const DEFAULT_WAITING_SECONDS: u64 = 60;

pub struct ConsolidationStatus {
    storage: Arc<dyn Storage>,
    /// Which services take part in the public status refresh
    filter: Document,
    down_time_duration: i64,
    waiting_seconds_between_batch: u64,
    worker: WorkerHandle,
}

impl ConsolidationStatus {
    pub fn new(
        storage: Arc<dyn Storage>,
        filter: Document,
        down_time_duration: i64,
        waiting_seconds_between_batch: u64,
    ) -> Self {
        Self {
            storage,
            filter,
            down_time_duration,
            waiting_seconds_between_batch,
            worker: WorkerHandle::new(),
        }
    }
    pub fn start(&mut self) {
        let storage = self.storage.clone();
        let filter = self.filter.clone();
        let down_for = self.down_time_duration;
        let waiting = self.waiting_seconds_between_batch;
        let stop = self.worker.stop_flag();
        self.worker.start(run(storage, filter, down_for, waiting, stop));
    }
    pub fn signal_stop(&self) {
        self.worker.signal_stop();
    }
    pub async fn join(&mut self) {
        self.worker.join().await;
    }
}

async fn run(
    storage: Arc<dyn Storage>,
    filter: Document,
    down_for: i64,
    waiting: u64,
    stop: Arc<AtomicBool>,
) {
    log::info!("starting status consolidation");
    while !stop.load(Ordering::Acquire) {
        let batch_start = Instant::now();
        refresh_public_status(&*storage, &filter, down_for, util::epoch_now()).await;
        let cadence = Duration::from_secs(waiting);
        let left = cadence.saturating_sub(batch_start.elapsed());
        util::sleep_with_stop(left, &stop).await;
    }
    log::info!("status consolidation stopped");
}

/// One refresh pass: decide the public status of every matching service
/// from the downtime log and write it back where it changed
pub(crate) async fn refresh_public_status(
    storage: &dyn Storage,
    filter: &Document,
    down_for: i64,
    now: i64,
) {
    let threshold = now - down_for;
    let services = match storage.all_services(filter.clone()).await {
        Ok(services) => services,
        Err(e) => {
            log::error!("status consolidation: failed to list services: {e}");
            return;
        }
    };
    for row in services {
        let open = match storage.open_downtime_older_than(row.id, threshold).await {
            Ok(open) => open,
            Err(e) => {
                log::error!("status consolidation: downtime lookup failed for {}: {e}", row.description);
                continue;
            }
        };
        let public = if open.is_some() {
            Status::Fail
        } else {
            Status::Ok
        };
        if row.public_status() != Some(public) {
            if let Err(e) = storage.set_public_status(row.id, public).await {
                log::error!("status consolidation: status write failed for {}: {e}", row.description);
            }
        }
    }
}
