/*
 * Created on Fri Mar 08 2024
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

//! Concrete providers. A provider feeds service definitions into the
//! monitor under its own name; dynamic ones (an ingress watcher, a
//! discovery feed) live outside this crate and only need the
//! [`Provider`](crate::monitor::Provider) trait and the monitor handle.
//! The one provider every deployment has is the static list from the
//! configuration file

use crate::{
    monitor::{Provider, ServicesMonitor},
    service::Service,
};
use async_trait::async_trait;
use std::sync::Arc;

/// Registers a fixed set of services at startup and withdraws them on
/// shutdown
pub struct StaticProvider {
    name: String,
    services: Vec<Arc<Service>>,
}

impl StaticProvider {
    pub fn new(name: &str, services: Vec<Arc<Service>>) -> Self {
        Self {
            name: name.to_owned(),
            services,
        }
    }
}

#[async_trait]
impl Provider for StaticProvider {
    fn name(&self) -> &str {
        &self.name
    }
    async fn start(&self, monitor: &Arc<ServicesMonitor>) {
        for service in &self.services {
            monitor.add(service.clone(), &self.name);
        }
        log::info!(
            "provider {}: registered {} services",
            self.name,
            self.services.len()
        );
    }
    async fn stop(&self, monitor: &Arc<ServicesMonitor>) {
        monitor.remove_provider(&self.name);
        log::info!("provider {}: stopped", self.name);
    }
}

#[cfg(test)]
mod tests {
    use super::StaticProvider;
    use crate::{
        monitor::{Provider, ServicesMonitor, StatusSink, TaskConfig},
        service::{test_support::scripted, Extra, Service, Status},
    };
    use async_trait::async_trait;
    use std::sync::Arc;

    struct NullSink;

    #[async_trait]
    impl StatusSink for NullSink {
        async fn update_status(&self, _: &Service, _: Status, _: Option<Extra>) -> bool {
            true
        }
    }

    #[tokio::test]
    async fn static_provider_registers_and_withdraws_its_services() {
        let monitor = Arc::new(ServicesMonitor::new(
            Arc::new(NullSink),
            TaskConfig::default(),
        ));
        let provider = StaticProvider::new(
            "static",
            vec![scripted("a", vec![]), scripted("b", vec![])],
        );
        provider.start(&monitor).await;
        assert_eq!(monitor.task_count(), 1);
        provider.stop(&monitor).await;
        assert_eq!(monitor.task_count(), 0);
    }
}
