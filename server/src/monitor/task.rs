/*
 * Created on Mon Feb 26 2024
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

use super::StatusSink;
use crate::{
    service::{Service, Status},
    util,
};
use parking_lot::Mutex;
use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};
use tokio::task::JoinHandle;

#[derive(Debug, Clone, Copy)]
/// The knobs of one checking task, shared by all tasks of a monitor
pub struct TaskConfig {
    /// How many services a single task will accept
    pub max_services: usize,
    /// Cadence of the checking rounds
    pub check_every_seconds: u64,
    /// Gap between retries while a failure is still soft
    pub fast_retry_every_seconds: u64,
}

impl Default for TaskConfig {
    fn default() -> Self {
        Self {
            max_services: 10,
            check_every_seconds: 300,
            fast_retry_every_seconds: 3,
        }
    }
}

/// A worker owning a bounded group of services, checking them in rounds.
/// Tasks are created and controlled only by the monitor
pub struct MonitorTask {
    services: Arc<Mutex<Vec<Arc<Service>>>>,
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
    sink: Arc<dyn StatusSink>,
    cfg: TaskConfig,
}

impl MonitorTask {
    pub fn new(sink: Arc<dyn StatusSink>, cfg: TaskConfig) -> Self {
        Self {
            services: Arc::new(Mutex::new(Vec::new())),
            stop: Arc::new(AtomicBool::new(false)),
            handle: None,
            sink,
            cfg,
        }
    }
    /// Append the service if there is room left. Returns whether it was
    /// taken
    pub fn add(&self, service: &Arc<Service>) -> bool {
        let mut services = self.services.lock();
        if services.len() < self.cfg.max_services {
            services.push(service.clone());
            true
        } else {
            false
        }
    }
    /// Remove the service if this task holds it. Returns whether it did
    pub fn remove(&self, service: &Service) -> bool {
        let mut services = self.services.lock();
        match services.iter().position(|s| **s == *service) {
            Some(idx) => {
                services.remove(idx);
                true
            }
            None => false,
        }
    }
    pub fn is_empty(&self) -> bool {
        self.services.lock().is_empty()
    }
    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.services.lock().len()
    }
    /// Start the round loop. A no-op if it is already running
    pub fn start(&mut self) {
        if self.handle.is_some() {
            return;
        }
        self.stop.store(false, Ordering::Release);
        let services = self.services.clone();
        let stop = self.stop.clone();
        let sink = self.sink.clone();
        let cfg = self.cfg;
        self.handle = Some(tokio::spawn(run_rounds(services, stop, sink, cfg)));
    }
    /// Ask the round loop to wind down. It finishes the check in flight
    /// and exits at the next stop check
    pub fn signal_stop(&self) {
        self.stop.store(true, Ordering::Release);
    }
    pub fn take_handle(&mut self) -> Option<JoinHandle<()>> {
        self.handle.take()
    }
}

async fn run_rounds(
    services: Arc<Mutex<Vec<Arc<Service>>>>,
    stop: Arc<AtomicBool>,
    sink: Arc<dyn StatusSink>,
    cfg: TaskConfig,
) {
    log::info!("starting checking task");
    while !stop.load(Ordering::Acquire) {
        let round_start = Instant::now();
        // iterate a snapshot so concurrent add/remove take effect at the
        // next round instead of racing this one
        let snapshot: Vec<Arc<Service>> = services.lock().clone();
        for service in snapshot {
            if stop.load(Ordering::Acquire) {
                break;
            }
            check_service(&service, &*sink, &cfg, &stop).await;
        }
        let elapsed = round_start.elapsed();
        let cadence = Duration::from_secs(cfg.check_every_seconds);
        match cadence.checked_sub(elapsed) {
            Some(left) => util::sleep_with_stop(left, &stop).await,
            None => log::warn!(
                "checking round took {}s, longer than the {}s cadence; lower the number of \
                 services per task or raise check_every_seconds",
                elapsed.as_secs(),
                cfg.check_every_seconds
            ),
        }
    }
    log::info!("checking task stopped");
}

/// Check one service, notifying the backend on OK transitions and hard
/// failures only, and fast-retrying while the failure is soft. The retry
/// loop is bounded: every retry either recovers (counter reset) or moves
/// the counter closer to the hard-failure threshold
pub(crate) async fn check_service(
    service: &Arc<Service>,
    sink: &dyn StatusSink,
    cfg: &TaskConfig,
    stop: &AtomicBool,
) {
    loop {
        let (previous, status, extra) = service.check().await;
        let recovered = status == Status::Ok && previous != Some(Status::Ok);
        let went_down = service.is_hard_failure() && previous != Some(Status::Fail);
        if recovered || went_down {
            if !sink.update_status(service, status, extra).await {
                // the backend could not record the transition; forget the
                // recorded status so the next check reports it again
                service.reset_status();
            }
        }
        if !service.is_soft_failure() || stop.load(Ordering::Acquire) {
            break;
        }
        log::info!(
            "soft failure [{}] for {} ({})",
            service.failure_counter(),
            service.kind().as_str(),
            service
        );
        util::sleep_with_stop(
            Duration::from_secs(cfg.fast_retry_every_seconds),
            stop,
        )
        .await;
    }
}
