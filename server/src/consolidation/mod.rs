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

//! # Consolidation
//!
//! Long-running workers that turn the raw downtime log into derived data:
//! [`sla::ConsolidationSla`] computes daily/weekly/monthly SLA rows behind
//! durable watermarks, [`status::ConsolidationStatus`] refreshes the
//! public status of services that have been down long enough to matter.
//!
//! Both workers swallow transient storage errors and simply retry on their
//! next batch; a period is only ever marked consolidated after every row
//! of it was written.

pub mod sla;
pub mod status;

use std::{
    future::Future,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};
use tokio::task::JoinHandle;

/// Stop switch + join handle shared by the consolidation workers
pub(crate) struct WorkerHandle {
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl WorkerHandle {
    pub(crate) fn new() -> Self {
        Self {
            stop: Arc::new(AtomicBool::new(false)),
            handle: None,
        }
    }
    pub(crate) fn stop_flag(&self) -> Arc<AtomicBool> {
        self.stop.clone()
    }
    pub(crate) fn start(&mut self, worker: impl Future<Output = ()> + Send + 'static) {
        if self.handle.is_some() {
            return;
        }
        self.stop.store(false, Ordering::Release);
        self.handle = Some(tokio::spawn(worker));
    }
    pub(crate) fn signal_stop(&self) {
        self.stop.store(true, Ordering::Release);
    }
    pub(crate) async fn join(&mut self) {
        if let Some(handle) = self.handle.take() {
            let _ = handle.await;
        }
    }
}
