/*
 * Created on Mon Mar 04 2024
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

//! The SLA consolidation worker.
//!
//! For each period kind a watermark marks the boundary at which the next
//! consolidation fires: once the wallclock passes it, the period that just
//! ended (`kind.previous(watermark)`) is computed for every service and
//! the watermark advances by one period, durably, so a restarted daemon
//! picks up where it left off. Computation is idempotent (upserts on
//! `(service, period_start)`), which makes retrying after any failure
//! safe.

use super::WorkerHandle;
use crate::{
    storage::{sla_for_window, PeriodKind, Storage, StorageResult},
    util,
};
use mongodb::bson::Document;
use std::{
    sync::{atomic::{AtomicBool, Ordering}, Arc},
    time::Duration,
};

pub const DEFAULT_WAITING_SECONDS: u64 = 300;

pub struct ConsolidationSla {
    storage: Arc<dyn Storage>,
    waiting_seconds_between_batch: u64,
    worker: WorkerHandle,
}

impl ConsolidationSla {
    pub fn new(storage: Arc<dyn Storage>, waiting_seconds_between_batch: u64) -> Self {
        Self {
            storage,
            waiting_seconds_between_batch,
            worker: WorkerHandle::new(),
        }
    }
    pub fn start(&mut self) {
        let storage = self.storage.clone();
        let waiting = self.waiting_seconds_between_batch;
        let stop = self.worker.stop_flag();
        self.worker.start(run(storage, waiting, stop));
    }
    pub fn signal_stop(&self) {
        self.worker.signal_stop();
    }
    pub async fn join(&mut self) {
        self.worker.join().await;
    }
}

async fn run(storage: Arc<dyn Storage>, waiting: u64, stop: Arc<AtomicBool>) {
    log::info!("starting SLA consolidation");
    // the watermarks come from the store; keep retrying while it is down
    let mut marks = loop {
        if stop.load(Ordering::Acquire) {
            log::info!("SLA consolidation stopped");
            return;
        }
        match Watermarks::load(&*storage, util::epoch_now()).await {
            Ok(marks) => break marks,
            Err(e) => {
                log::error!("failed to load consolidation watermarks: {e}");
                util::sleep_with_stop(Duration::from_secs(waiting), &stop).await;
            }
        }
    };
    while !stop.load(Ordering::Acquire) {
        marks.tick(&*storage, util::epoch_now(), &stop).await;

        // wait for the earliest upcoming boundary, but never spin faster
        // than the batch cadence (failed periods retry at that pace)
        let now = util::epoch_now();
        let mut sleep_secs = waiting as i64;
        let next_event = marks.earliest();
        if now < next_event {
            sleep_secs = sleep_secs.max(next_event - now);
        }
        util::sleep_with_stop(Duration::from_secs(sleep_secs.max(0) as u64), &stop).await;
    }
    log::info!("SLA consolidation stopped");
}

/// The three consolidation boundaries, mirrored in `consolidation_state`
pub(crate) struct Watermarks {
    daily: i64,
    weekly: i64,
    monthly: i64,
}

impl Watermarks {
    pub(crate) async fn load(storage: &dyn Storage, now: i64) -> StorageResult<Self> {
        Ok(Self {
            daily: Self::load_one(storage, PeriodKind::Daily, now).await?,
            weekly: Self::load_one(storage, PeriodKind::Weekly, now).await?,
            monthly: Self::load_one(storage, PeriodKind::Monthly, now).await?,
        })
    }
    async fn load_one(storage: &dyn Storage, kind: PeriodKind, now: i64) -> StorageResult<i64> {
        match storage.watermark(kind).await? {
            Some(next) => Ok(next),
            // nothing stored yet: anchor on the period in progress. The
            // already-elapsed part of it is intentionally skipped
            None => Ok(kind.anchor(now)),
        }
    }
    pub(crate) fn get(&self, kind: PeriodKind) -> i64 {
        match kind {
            PeriodKind::Daily => self.daily,
            PeriodKind::Weekly => self.weekly,
            PeriodKind::Monthly => self.monthly,
        }
    }
    fn set(&mut self, kind: PeriodKind, next: i64) {
        match kind {
            PeriodKind::Daily => self.daily = next,
            PeriodKind::Weekly => self.weekly = next,
            PeriodKind::Monthly => self.monthly = next,
        }
    }
    pub(crate) fn earliest(&self) -> i64 {
        self.daily.min(self.weekly).min(self.monthly)
    }
    /// Consolidate every period kind whose boundary has passed
    pub(crate) async fn tick(&mut self, storage: &dyn Storage, now: i64, stop: &AtomicBool) {
        for kind in [PeriodKind::Daily, PeriodKind::Weekly, PeriodKind::Monthly] {
            if stop.load(Ordering::Acquire) {
                return;
            }
            let next = self.get(kind);
            if now >= next {
                if let Some(advanced) = consolidate(storage, kind, next).await {
                    self.set(kind, advanced);
                }
            }
        }
    }
}

/// Compute the period ending at `boundary` and durably advance the
/// watermark. Returns the advanced watermark, or `None` when anything
/// failed; the whole period then retries on the next batch
async fn consolidate(storage: &dyn Storage, kind: PeriodKind, boundary: i64) -> Option<i64> {
    let period_start = kind.previous(boundary);
    log::info!("consolidation: {kind} for {period_start} [computing]");
    if let Err(e) = compute_period(storage, kind, period_start).await {
        log::error!("consolidation: {kind} for {period_start} [failed]: {e}");
        return None;
    }
    let advanced = kind.next(boundary);
    if let Err(e) = storage.set_watermark(kind, advanced).await {
        log::error!("consolidation: {kind} for {period_start}: watermark write failed: {e}");
        return None;
    }
    log::info!("consolidation: {kind} for {period_start} [done]");
    Some(advanced)
}

/// Upsert the SLA of every known service over one period. Idempotent:
/// recomputing a period overwrites the same rows
pub(crate) async fn compute_period(
    storage: &dyn Storage,
    kind: PeriodKind,
    period_start: i64,
) -> StorageResult<()> {
    let duration = kind.length_at(period_start);
    for row in storage.all_services(Document::new()).await? {
        let downtimes = storage.find_downtimes(row.id, period_start, duration).await?;
        let sla = sla_for_window(&downtimes, period_start, duration);
        storage.upsert_sla(kind, row.id, period_start, sla).await?;
    }
    Ok(())
}
