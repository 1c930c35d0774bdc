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

//! # Monitoring
//!
//! The [`ServicesMonitor`] owns every monitored service and bin-packs
//! them onto checking tasks. Services arrive from any number of named
//! providers; the same service registered by two providers is checked
//! once. Adding and removing is safe from any thread, whether the
//! monitoring is running or not.
//!
//! Tasks never call back into the monitor: the only thing they are handed
//! is the [`StatusSink`] to report transitions to.

mod task;

pub use self::task::{MonitorTask, TaskConfig};

use crate::service::{Extra, Service, Status};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::{collections::HashMap, sync::Arc};
use tokio::task::JoinHandle;

/// Where the tasks report status transitions. Implemented by the storage
/// layer; tests substitute a recorder
#[async_trait]
pub trait StatusSink: Send + Sync {
    /// Persist a reported state. Returning `false` makes the task retry
    /// the transition on its next round
    async fn update_status(&self, svc: &Service, status: Status, extra: Option<Extra>) -> bool;
}

/// An external source of service definitions (an ingress watcher, a
/// discovery feed, a static list). Providers drive the monitor through
/// `add`/`remove`/`remove_provider`/`remove_delegation` under their own
/// name
#[async_trait]
pub trait Provider: Send + Sync {
    fn name(&self) -> &str;
    async fn start(&self, monitor: &Arc<ServicesMonitor>);
    async fn stop(&self, monitor: &Arc<ServicesMonitor>);
}

#[derive(Default)]
struct MonitorShared {
    providers: HashMap<String, Vec<Arc<Service>>>,
    tasks: Vec<MonitorTask>,
    running: bool,
}

/// The monitoring manager. One global lock protects the provider buckets
/// and the task list; probe execution never holds it
pub struct ServicesMonitor {
    shared: Mutex<MonitorShared>,
    sink: Arc<dyn StatusSink>,
    cfg: TaskConfig,
}

impl ServicesMonitor {
    pub fn new(sink: Arc<dyn StatusSink>, cfg: TaskConfig) -> Self {
        Self {
            shared: Mutex::new(MonitorShared::default()),
            sink,
            cfg,
        }
    }

    /// Add a service under the given provider. A service already present
    /// in any provider's bucket is left alone, so double registration
    /// cannot lead to double checking
    pub fn add(&self, service: Arc<Service>, provider: &str) {
        let mut shared = self.shared.lock();
        shared.providers.entry(provider.to_owned()).or_default();
        let already_monitored = shared
            .providers
            .values()
            .flatten()
            .any(|s| **s == *service);
        if already_monitored {
            return;
        }
        if let Some(bucket) = shared.providers.get_mut(provider) {
            bucket.push(service.clone());
        }
        Self::task_add(&mut shared, &self.sink, self.cfg, service);
    }

    /// Remove a service from the given provider's bucket and from the
    /// task holding it
    pub fn remove(&self, service: &Service, provider: &str) {
        let mut shared = self.shared.lock();
        let Some(bucket) = shared.providers.get_mut(provider) else {
            return;
        };
        if let Some(idx) = bucket.iter().position(|s| **s == *service) {
            bucket.remove(idx);
            Self::task_remove(&mut shared, service);
        }
    }

    /// Remove every service registered by `provider`, along with the
    /// bucket itself
    pub fn remove_provider(&self, provider: &str) {
        let mut shared = self.shared.lock();
        let Some(bucket) = shared.providers.remove(provider) else {
            return;
        };
        for service in bucket {
            Self::task_remove(&mut shared, &service);
        }
    }

    /// Remove the services of `provider` selected by `hook`. This is how
    /// a provider that cannot tell a modification from delete+add drops
    /// its stale entries
    pub fn remove_delegation<F>(&self, hook: F, provider: &str)
    where
        F: Fn(&Service) -> bool,
    {
        let mut shared = self.shared.lock();
        let Some(bucket) = shared.providers.get(provider) else {
            return;
        };
        let selected: Vec<Arc<Service>> = bucket.iter().filter(|s| hook(s)).cloned().collect();
        for service in selected {
            if let Some(bucket) = shared.providers.get_mut(provider) {
                if let Some(idx) = bucket.iter().position(|s| **s == *service) {
                    bucket.remove(idx);
                }
            }
            Self::task_remove(&mut shared, &service);
        }
    }

    /// Place the service on the first task with room, spawning a fresh
    /// task when every one is full
    fn task_add(
        shared: &mut MonitorShared,
        sink: &Arc<dyn StatusSink>,
        cfg: TaskConfig,
        service: Arc<Service>,
    ) {
        for task in &shared.tasks {
            if task.add(&service) {
                return;
            }
        }
        let mut task = MonitorTask::new(sink.clone(), cfg);
        task.add(&service);
        if shared.running {
            task.start();
        }
        shared.tasks.push(task);
    }

    /// Remove the service from whichever task holds it; a task left empty
    /// is signalled to stop and dropped
    fn task_remove(shared: &mut MonitorShared, service: &Service) {
        let mut emptied = None;
        for (idx, task) in shared.tasks.iter().enumerate() {
            if task.remove(service) {
                if task.is_empty() {
                    emptied = Some(idx);
                }
                break;
            }
        }
        if let Some(idx) = emptied {
            let task = shared.tasks.remove(idx);
            task.signal_stop();
            // the loop winds down on its own; nothing left to check
        }
    }

    pub fn start(&self) {
        let mut shared = self.shared.lock();
        if shared.running {
            return;
        }
        log::info!("starting monitoring");
        shared.running = true;
        for task in &mut shared.tasks {
            task.start();
        }
        log::info!("monitoring started ({} tasks)", shared.tasks.len());
    }

    /// Signal every task to stop, then wait for each to finish its
    /// current round
    pub async fn stop(&self) {
        let handles: Vec<JoinHandle<()>> = {
            let mut shared = self.shared.lock();
            if !shared.running {
                return;
            }
            log::info!("stopping monitoring ({} tasks)", shared.tasks.len());
            shared.running = false;
            for task in &shared.tasks {
                task.signal_stop();
            }
            shared
                .tasks
                .iter_mut()
                .filter_map(MonitorTask::take_handle)
                .collect()
        };
        for handle in handles {
            let _ = handle.await;
        }
        log::info!("monitoring stopped");
    }

    pub fn is_running(&self) -> bool {
        self.shared.lock().running
    }

    pub fn task_count(&self) -> usize {
        self.shared.lock().tasks.len()
    }

    #[cfg(test)]
    pub(crate) fn task_sizes(&self) -> Vec<usize> {
        self.shared.lock().tasks.iter().map(MonitorTask::len).collect()
    }
}
