/*
 * Created on Wed Mar 06 2024
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

//! # Single-active-instance election
//!
//! The monitor must have exactly one writer per backend, so the daemon
//! heartbeats a singleton record: a conditional update that only succeeds
//! when the stored date is old enough. A standby instance keeps retrying;
//! it takes over once the active one has not beaten for `inactive_during`
//! seconds. A cleanly stopped daemon simply leaves its record to age out.
//!
//! The conditional update is the whole election: whichever instance gets
//! its write in first renews the record, every other one sees a stale-date
//! mismatch and stays passive.

use crate::{storage::Storage, util};
use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

pub const DEFAULT_ALIVE_SECONDS: u64 = 60;
pub const DEFAULT_INACTIVE_DURING_SECONDS: u64 = 180;

#[derive(Debug, PartialEq, Eq)]
/// Why [`InstanceLock::watch`] returned
pub enum WatchOutcome {
    /// A stop was requested; the heartbeat is simply abandoned
    Stopped,
    /// The heartbeat failed: another instance owns the record (or the
    /// store is gone). The caller must shut the workers down
    Lost,
}

pub struct InstanceLock {
    storage: Arc<dyn Storage>,
    alive: u64,
    inactive_during: u64,
    stop: Arc<AtomicBool>,
}

impl InstanceLock {
    pub fn new(storage: Arc<dyn Storage>, alive: u64, inactive_during: u64) -> Self {
        Self {
            storage,
            alive,
            inactive_during,
            stop: Arc::new(AtomicBool::new(false)),
        }
    }
    pub fn signal_stop(&self) {
        self.stop.store(true, Ordering::Release);
    }
    /// One takeover attempt: make sure the record exists, then try the
    /// heartbeat against the takeover window
    pub(crate) async fn switch_to_active(&self, now: i64) -> bool {
        if let Err(e) = self.storage.ensure_instance_row().await {
            log::error!("instance lock: could not reach the instance record: {e}");
            return false;
        }
        match self
            .storage
            .instance_heartbeat(self.inactive_during as i64, now)
            .await
        {
            Ok(active) => active,
            Err(e) => {
                log::error!("instance lock: takeover heartbeat failed: {e}");
                false
            }
        }
    }
    /// Retry the takeover every `alive` seconds until it succeeds.
    /// Returns `false` if a stop was requested while still passive
    pub async fn wait_until_active(&self) -> bool {
        log::info!("trying to become the active instance");
        loop {
            if self.stop.load(Ordering::Acquire) {
                return false;
            }
            if self.switch_to_active(util::epoch_now()).await {
                log::info!("this instance is now active");
                return true;
            }
            util::sleep_with_stop(Duration::from_secs(self.alive), &self.stop).await;
        }
    }
    /// One steady-state beat against the `alive` window
    pub(crate) async fn beat(&self, now: i64) -> bool {
        match self
            .storage
            .instance_heartbeat(self.alive as i64, now)
            .await
        {
            Ok(beating) => beating,
            Err(e) => {
                log::error!("instance lock: heartbeat write failed: {e}");
                false
            }
        }
    }
    /// Keep the heartbeat alive. Returns on the first failed beat (the
    /// caller shuts everything down) or when a stop is requested
    pub async fn watch(&self) -> WatchOutcome {
        loop {
            util::sleep_with_stop(Duration::from_secs(self.alive + 1), &self.stop).await;
            if self.stop.load(Ordering::Acquire) {
                return WatchOutcome::Stopped;
            }
            if !self.beat(util::epoch_now()).await {
                log::error!("instance heartbeat lost");
                return WatchOutcome::Lost;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::InstanceLock;
    use crate::storage::mem::MemStorage;
    use std::sync::Arc;

    const ALIVE: u64 = 60;
    const INACTIVE: u64 = 180;

    fn lock(storage: &Arc<MemStorage>) -> InstanceLock {
        InstanceLock::new(storage.clone(), ALIVE, INACTIVE)
    }

    #[tokio::test]
    async fn only_one_of_two_racing_instances_becomes_active() {
        let storage = Arc::new(MemStorage::default());
        let first = lock(&storage);
        let second = lock(&storage);
        let now = 1_000_000;
        assert!(first.switch_to_active(now).await);
        assert!(!second.switch_to_active(now).await);
        // still passive shortly after
        assert!(!second.switch_to_active(now + 30).await);
    }

    #[tokio::test]
    async fn a_standby_takes_over_once_the_heartbeat_ages_out() {
        let storage = Arc::new(MemStorage::default());
        let active = lock(&storage);
        let standby = lock(&storage);
        let now = 1_000_000;
        assert!(active.switch_to_active(now).await);
        assert!(!standby.switch_to_active(now + INACTIVE as i64 - 1).await);
        // the active instance stopped beating; after inactive_during the
        // record is up for grabs
        assert!(standby.switch_to_active(now + INACTIVE as i64).await);
    }

    #[tokio::test]
    async fn the_active_instance_keeps_renewing_its_own_beat() {
        let storage = Arc::new(MemStorage::default());
        let active = lock(&storage);
        let mut now = 1_000_000;
        assert!(active.switch_to_active(now).await);
        for _ in 0..5 {
            now += ALIVE as i64 + 1;
            assert!(active.beat(now).await);
        }
    }

    #[tokio::test]
    async fn a_beat_after_takeover_by_someone_else_fails() {
        let storage = Arc::new(MemStorage::default());
        let active = lock(&storage);
        let usurper = lock(&storage);
        let now = 1_000_000;
        assert!(active.switch_to_active(now).await);
        // the active instance stalls long enough to be declared dead
        let later = now + INACTIVE as i64 + 5;
        assert!(usurper.switch_to_active(later).await);
        // its own next beat now loses: the date is fresh again
        assert!(!active.beat(later + 1).await);
    }
}
