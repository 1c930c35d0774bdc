/*
 * Created on Thu Mar 07 2024
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

use super::feedback::ConfigError;
use crate::{
    consolidation::{sla, status},
    instance,
    monitor::TaskConfig,
    service::{
        Service, ServiceSpec, CATEGORY_INFRA, CATEGORY_NS, DEFAULT_HTTP_TIMEOUT,
        DEFAULT_INFRA_TIMEOUT,
    },
};
use mongodb::bson::{self, Document};
use serde::Deserialize;
use std::{collections::HashMap, sync::Arc, time::Duration};

#[derive(Debug, Deserialize)]
/// The whole configuration file: one section per environment
pub struct ConfigFile {
    pub env: HashMap<String, EnvConfig>,
}

#[derive(Debug, Clone, Deserialize)]
/// The configuration of one environment
pub struct EnvConfig {
    pub storage: StorageConfig,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub consolidations: ConsolidationsConfig,
    #[serde(default)]
    pub monitoring: MonitoringConfig,
    #[serde(default)]
    pub instance: InstanceConfig,
    #[serde(default)]
    pub services: StaticServices,
}

impl EnvConfig {
    /// The built-in `local` environment used when no configuration file is
    /// supplied
    pub fn local_default() -> Self {
        Self {
            storage: StorageConfig {
                backend: "MongoStorage".to_owned(),
                uri: "mongodb://localhost:27017".to_owned(),
                db: "cloud-uptime-local".to_owned(),
            },
            server: ServerConfig::default(),
            consolidations: ConsolidationsConfig::default(),
            // the local environment checks aggressively, unlike the
            // fallback values used for a sparse file section
            monitoring: MonitoringConfig {
                max_services: 15,
                check_every_seconds: 60,
                fast_retry_every_seconds: 5,
            },
            instance: InstanceConfig::default(),
            services: StaticServices::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    pub backend: String,
    pub uri: String,
    pub db: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "yes")]
    pub with_consolidation: bool,
    #[serde(default)]
    pub with_instance_lock: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            with_consolidation: true,
            with_instance_lock: false,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConsolidationsConfig {
    #[serde(default)]
    pub sla: SlaConsolidationConfig,
    #[serde(default)]
    pub status: StatusConsolidationConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SlaConsolidationConfig {
    #[serde(default = "default_sla_waiting")]
    pub waiting_seconds_between_batch: u64,
}

impl Default for SlaConsolidationConfig {
    fn default() -> Self {
        Self {
            waiting_seconds_between_batch: default_sla_waiting(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct StatusConsolidationConfig {
    /// Which services take part in the public status refresh, as a raw
    /// query mapping handed to the storage backend
    #[serde(default)]
    pub filter: serde_yaml::Value,
    /// Minimum continuous outage before a service is publicly down
    #[serde(default = "default_down_since")]
    pub down_since: i64,
    #[serde(default = "default_status_waiting")]
    pub waiting_seconds_between_batch: u64,
}

impl Default for StatusConsolidationConfig {
    fn default() -> Self {
        Self {
            filter: serde_yaml::Value::Null,
            down_since: default_down_since(),
            waiting_seconds_between_batch: default_status_waiting(),
        }
    }
}

impl StatusConsolidationConfig {
    /// The filter as a query document. An absent filter selects everything
    pub fn filter_document(&self) -> Result<Document, ConfigError> {
        match &self.filter {
            serde_yaml::Value::Null => Ok(Document::new()),
            value => bson::to_document(value)
                .map_err(|e| ConfigError::BadStatusFilter(e.to_string())),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct MonitoringConfig {
    #[serde(default = "default_max_services")]
    pub max_services: usize,
    #[serde(default = "default_check_every")]
    pub check_every_seconds: u64,
    #[serde(default = "default_fast_retry")]
    pub fast_retry_every_seconds: u64,
}

impl Default for MonitoringConfig {
    fn default() -> Self {
        Self {
            max_services: default_max_services(),
            check_every_seconds: default_check_every(),
            fast_retry_every_seconds: default_fast_retry(),
        }
    }
}

impl From<&MonitoringConfig> for TaskConfig {
    fn from(cfg: &MonitoringConfig) -> Self {
        Self {
            max_services: cfg.max_services,
            check_every_seconds: cfg.check_every_seconds,
            fast_retry_every_seconds: cfg.fast_retry_every_seconds,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct InstanceConfig {
    #[serde(default = "default_alive")]
    pub alive: u64,
    #[serde(default = "default_inactive_during")]
    pub inactive_during: u64,
}

impl Default for InstanceConfig {
    fn default() -> Self {
        Self {
            alive: default_alive(),
            inactive_during: default_inactive_during(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
/// Services defined directly in the configuration file, registered under
/// the `static` provider at startup
pub struct StaticServices {
    #[serde(default)]
    pub http: Vec<HttpServiceDef>,
    #[serde(default)]
    pub database: Vec<DatabaseServiceDef>,
    #[serde(default)]
    pub cluster: Vec<ClusterServiceDef>,
    #[serde(default)]
    pub search: Vec<SearchServiceDef>,
}

impl StaticServices {
    pub fn is_empty(&self) -> bool {
        self.http.is_empty()
            && self.database.is_empty()
            && self.cluster.is_empty()
            && self.search.is_empty()
    }
    /// Materialize every definition into a service
    pub fn build(&self) -> Vec<Arc<Service>> {
        let mut services = Vec::new();
        for def in &self.http {
            services.push(Arc::new(Service::new(ServiceSpec::HttpIngress {
                ns: def.ns.clone(),
                name: def.name.clone(),
                url: def.url.clone(),
                headers: def.headers.clone().into_iter().collect(),
                timeout: timeout_or(def.timeout, DEFAULT_HTTP_TIMEOUT),
                category: def.category.clone().unwrap_or_else(|| CATEGORY_NS.to_owned()),
            })));
        }
        for def in &self.database {
            services.push(Arc::new(Service::new(ServiceSpec::Database {
                name: def.name.clone(),
                uri: def.uri.clone(),
                timeout: timeout_or(def.timeout, DEFAULT_INFRA_TIMEOUT),
                category: infra_or(def.category.clone()),
            })));
        }
        for def in &self.cluster {
            services.push(Arc::new(Service::new(ServiceSpec::Cluster {
                name: def.name.clone(),
                context: def.context.clone(),
                server: def.server.clone(),
                token: def.token.clone(),
                availability: def.availability,
                timeout: timeout_or(def.timeout, DEFAULT_INFRA_TIMEOUT),
                category: infra_or(def.category.clone()),
            })));
        }
        for def in &self.search {
            let auth = match (&def.username, &def.password) {
                (Some(user), Some(secret)) => Some((user.clone(), secret.clone())),
                _ => None,
            };
            services.push(Arc::new(Service::new(ServiceSpec::Search {
                name: def.name.clone(),
                url: def.url.clone(),
                auth,
                timeout: timeout_or(def.timeout, DEFAULT_INFRA_TIMEOUT),
                category: infra_or(def.category.clone()),
            })));
        }
        services
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct HttpServiceDef {
    pub ns: String,
    pub name: String,
    pub url: String,
    pub category: Option<String>,
    pub timeout: Option<u64>,
    #[serde(default)]
    pub headers: HashMap<String, String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseServiceDef {
    pub name: String,
    pub uri: String,
    pub category: Option<String>,
    pub timeout: Option<u64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ClusterServiceDef {
    pub name: String,
    pub context: String,
    pub server: String,
    pub availability: u32,
    pub token: Option<String>,
    pub category: Option<String>,
    pub timeout: Option<u64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SearchServiceDef {
    pub name: String,
    pub url: String,
    pub username: Option<String>,
    pub password: Option<String>,
    pub category: Option<String>,
    pub timeout: Option<u64>,
}

fn timeout_or(configured: Option<u64>, default: Duration) -> Duration {
    configured.map(Duration::from_secs).unwrap_or(default)
}

fn infra_or(category: Option<String>) -> String {
    category.unwrap_or_else(|| CATEGORY_INFRA.to_owned())
}

fn yes() -> bool {
    true
}
fn default_sla_waiting() -> u64 {
    sla::DEFAULT_WAITING_SECONDS
}
fn default_down_since() -> i64 {
    status::DEFAULT_DOWN_TIME_DURATION
}
fn default_status_waiting() -> u64 {
    status::DEFAULT_WAITING_SECONDS
}
fn default_max_services() -> usize {
    TaskConfig::default().max_services
}
fn default_check_every() -> u64 {
    TaskConfig::default().check_every_seconds
}
fn default_fast_retry() -> u64 {
    TaskConfig::default().fast_retry_every_seconds
}
fn default_alive() -> u64 {
    instance::DEFAULT_ALIVE_SECONDS
}
fn default_inactive_during() -> u64 {
    instance::DEFAULT_INACTIVE_DURING_SECONDS
}
