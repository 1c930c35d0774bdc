/*
 * Created on Thu Feb 15 2024
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

//! # Services
//!
//! A [`Service`] is one monitored endpoint: an immutable identity (which
//! fields identify it depends on its kind) plus probe parameters, and the
//! mutable checking state driven by the monitoring rounds. The per-kind
//! probe implementations live in the `probes` module; everything here is
//! pure bookkeeping.
//!
//! A probe reporting `Fail` does not immediately make the service fail:
//! the failure counter has to reach [`ATTEMPT_BEFORE_STATUS_FAIL`]
//! consecutive failures first (a "hard" failure). Below that threshold the
//! failure is "soft": the recorded status stays `Ok` and the monitoring
//! task schedules a fast retry instead of notifying the backend.

mod probes;

use parking_lot::Mutex;
use std::{fmt, time::Duration};

/// Consecutive probe failures needed before a service is considered to have
/// hard-failed
pub const ATTEMPT_BEFORE_STATUS_FAIL: u32 = 3;
/// Default probe timeout for HTTP checks
pub const DEFAULT_HTTP_TIMEOUT: Duration = Duration::from_secs(2);
/// Default probe timeout for database/cluster/search checks
pub const DEFAULT_INFRA_TIMEOUT: Duration = Duration::from_secs(5);
/// Default category for ingress-discovered services
pub const CATEGORY_NS: &str = "ns";
/// Default category for infrastructure services
pub const CATEGORY_INFRA: &str = "infra";

/// Opaque per-check diagnostic data, persisted alongside downtime records
pub type Extra = serde_json::Map<String, serde_json::Value>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
/// The two states a service can be reported in
pub enum Status {
    Ok,
    Fail,
}

impl Status {
    /// The integer representation used by the storage layer
    pub const fn as_i32(self) -> i32 {
        match self {
            Self::Ok => 0,
            Self::Fail => 1,
        }
    }
    pub const fn from_i32(v: i32) -> Option<Self> {
        match v {
            0 => Some(Self::Ok),
            1 => Some(Self::Fail),
            _ => None,
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ok => write!(f, "OK"),
            Self::Fail => write!(f, "FAIL"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
/// The service kinds the daemon knows how to check and persist
pub enum ServiceKind {
    Ingress,
    Database,
    Cluster,
    Search,
    #[cfg(test)]
    Scripted,
}

impl ServiceKind {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Ingress => "Ingress",
            Self::Database => "Database",
            Self::Cluster => "Cluster",
            Self::Search => "Search",
            #[cfg(test)]
            Self::Scripted => "Scripted",
        }
    }
}

#[derive(Debug)]
/// Identity and probe parameters for one service. Immutable after
/// construction so that a service can be shared between the monitor and the
/// task that owns it
pub enum ServiceSpec {
    /// An HTTPS health endpoint discovered from a cluster ingress.
    /// Identified by `(ns, url)`
    HttpIngress {
        ns: String,
        /// Name of the ingress object this URL came from. Not part of the
        /// identity, but used by providers to drop stale entries
        name: String,
        url: String,
        headers: Vec<(String, String)>,
        timeout: Duration,
        category: String,
    },
    /// A database server reachable through a connection string. Identified
    /// by `(name)`
    Database {
        name: String,
        uri: String,
        timeout: Duration,
        category: String,
    },
    /// A cluster API whose nodes must be sufficiently available.
    /// Identified by `(name, context)`
    Cluster {
        name: String,
        context: String,
        /// Base URL of the cluster API server
        server: String,
        token: Option<String>,
        /// Minimum percentage of nodes that need to be up
        availability: u32,
        timeout: Duration,
        category: String,
    },
    /// A search cluster answering HTTP pings. Identified by `(name)`
    Search {
        name: String,
        url: String,
        auth: Option<(String, String)>,
        timeout: Duration,
        category: String,
    },
    #[cfg(test)]
    /// A probe that replays a queued sequence of results. Only available to
    /// tests; the storage layer treats it as an unsupported kind
    Scripted {
        label: String,
        script: Mutex<std::collections::VecDeque<(Status, Option<Extra>)>>,
    },
}

impl ServiceSpec {
    pub fn kind(&self) -> ServiceKind {
        match self {
            Self::HttpIngress { .. } => ServiceKind::Ingress,
            Self::Database { .. } => ServiceKind::Database,
            Self::Cluster { .. } => ServiceKind::Cluster,
            Self::Search { .. } => ServiceKind::Search,
            #[cfg(test)]
            Self::Scripted { .. } => ServiceKind::Scripted,
        }
    }
    pub fn category(&self) -> &str {
        match self {
            Self::HttpIngress { category, .. }
            | Self::Database { category, .. }
            | Self::Cluster { category, .. }
            | Self::Search { category, .. } => category,
            #[cfg(test)]
            Self::Scripted { .. } => "test",
        }
    }
    /// The human-readable description persisted on the service row
    pub fn description(&self) -> &str {
        match self {
            Self::HttpIngress { url, .. } => url,
            Self::Database { name, .. } => name,
            Self::Cluster { name, .. } => name,
            Self::Search { name, .. } => name,
            #[cfg(test)]
            Self::Scripted { label, .. } => label,
        }
    }
    /// Whether two specs denote the same service. Only the identifying
    /// fields of each kind take part in the comparison
    fn same_service(&self, other: &Self) -> bool {
        match (self, other) {
            (
                Self::HttpIngress {
                    ns: a_ns,
                    url: a_url,
                    category: a_cat,
                    ..
                },
                Self::HttpIngress {
                    ns: b_ns,
                    url: b_url,
                    category: b_cat,
                    ..
                },
            ) => a_ns == b_ns && a_url == b_url && a_cat == b_cat,
            (
                Self::Database {
                    name: a,
                    category: a_cat,
                    ..
                },
                Self::Database {
                    name: b,
                    category: b_cat,
                    ..
                },
            ) => a == b && a_cat == b_cat,
            (
                Self::Cluster {
                    name: a,
                    context: a_ctx,
                    category: a_cat,
                    ..
                },
                Self::Cluster {
                    name: b,
                    context: b_ctx,
                    category: b_cat,
                    ..
                },
            ) => a == b && a_ctx == b_ctx && a_cat == b_cat,
            (
                Self::Search {
                    name: a,
                    category: a_cat,
                    ..
                },
                Self::Search {
                    name: b,
                    category: b_cat,
                    ..
                },
            ) => a == b && a_cat == b_cat,
            #[cfg(test)]
            (Self::Scripted { label: a, .. }, Self::Scripted { label: b, .. }) => a == b,
            _ => false,
        }
    }
}

impl fmt::Display for ServiceSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::HttpIngress { ns, name, url, .. } => {
                write!(f, "ns={ns}, name={name}, url={url}")
            }
            Self::Database { name, .. } => write!(f, "name={name}"),
            Self::Cluster { name, context, .. } => write!(f, "name={name}, context={context}"),
            Self::Search { name, .. } => write!(f, "name={name}"),
            #[cfg(test)]
            Self::Scripted { label, .. } => write!(f, "label={label}"),
        }
    }
}

#[derive(Debug, Default)]
struct CheckState {
    /// Last recorded status. `None` means undetermined: either never
    /// checked, or reset after a failed backend notification
    status: Option<Status>,
    /// The recorded status before the latest check
    previous: Option<Status>,
    /// Consecutive failure count
    failure_counter: u32,
}

/// A monitored service: immutable spec plus the mutable checking state
pub struct Service {
    spec: ServiceSpec,
    state: Mutex<CheckState>,
    attempts_before_fail: u32,
}

impl Service {
    pub fn new(spec: ServiceSpec) -> Self {
        Self::with_attempts(spec, ATTEMPT_BEFORE_STATUS_FAIL)
    }
    pub fn with_attempts(spec: ServiceSpec, attempts_before_fail: u32) -> Self {
        Self {
            spec,
            state: Mutex::new(CheckState::default()),
            attempts_before_fail,
        }
    }
    pub fn spec(&self) -> &ServiceSpec {
        &self.spec
    }
    pub fn kind(&self) -> ServiceKind {
        self.spec.kind()
    }
    /// Run the probe for this service and feed the outcome through the
    /// failure counter. Returns `(previous recorded status, reported
    /// status, diagnostic data)`
    pub async fn check(&self) -> (Option<Status>, Status, Option<Extra>) {
        let (reported, extra) = self.spec.probe().await;
        self.apply_result(reported, extra)
    }
    /// The counter/status bookkeeping behind [`Service::check`]. A failure
    /// bumps the counter, a success resets it; the recorded status stays
    /// `Ok` while the failure is still soft
    fn apply_result(
        &self,
        reported: Status,
        extra: Option<Extra>,
    ) -> (Option<Status>, Status, Option<Extra>) {
        let mut state = self.state.lock();
        if reported == Status::Fail {
            state.failure_counter += 1;
        } else {
            state.failure_counter = 0;
        }
        state.previous = state.status;
        let soft = state.failure_counter > 0 && state.failure_counter < self.attempts_before_fail;
        state.status = if reported == Status::Ok || soft {
            Some(Status::Ok)
        } else {
            Some(Status::Fail)
        };
        (state.previous, reported, extra)
    }
    /// We are in a failure state, but there are still attempts left
    pub fn is_soft_failure(&self) -> bool {
        let state = self.state.lock();
        state.failure_counter > 0 && state.failure_counter < self.attempts_before_fail
    }
    /// Still failing after all attempts
    pub fn is_hard_failure(&self) -> bool {
        self.state.lock().failure_counter >= self.attempts_before_fail
    }
    /// Reset the recorded status to undetermined, so that the next check
    /// re-reports the current state to the backend
    pub fn reset_status(&self) {
        self.state.lock().status = None;
    }
    pub fn failure_counter(&self) -> u32 {
        self.state.lock().failure_counter
    }
}

impl PartialEq for Service {
    fn eq(&self, other: &Self) -> bool {
        self.spec.same_service(&other.spec)
    }
}

impl Eq for Service {}

impl fmt::Display for Service {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.spec)
    }
}

impl fmt::Debug for Service {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Service").field("spec", &self.spec).finish()
    }
}


#[cfg(test)]
mod tests {
    use super::{test_support::scripted, Status};

    #[tokio::test]
    async fn first_ok_reports_undetermined_previous() {
        let svc = scripted("svc", vec![(Status::Ok, None)]);
        let (prev, reported, _) = svc.check().await;
        assert_eq!(prev, None);
        assert_eq!(reported, Status::Ok);
        assert!(!svc.is_soft_failure());
        assert!(!svc.is_hard_failure());
    }

    #[tokio::test]
    async fn failures_stay_soft_below_threshold() {
        let svc = scripted("svc", vec![(Status::Fail, None), (Status::Fail, None)]);
        svc.check().await;
        assert!(svc.is_soft_failure());
        assert_eq!(svc.failure_counter(), 1);
        // the recorded status stays OK during a soft failure
        let (prev, reported, _) = svc.check().await;
        assert_eq!(prev, Some(Status::Ok));
        assert_eq!(reported, Status::Fail);
        assert!(svc.is_soft_failure());
    }

    #[tokio::test]
    async fn third_failure_is_hard() {
        let svc = scripted(
            "svc",
            vec![
                (Status::Fail, None),
                (Status::Fail, None),
                (Status::Fail, None),
            ],
        );
        svc.check().await;
        svc.check().await;
        let (prev, reported, _) = svc.check().await;
        assert_eq!(prev, Some(Status::Ok));
        assert_eq!(reported, Status::Fail);
        assert!(svc.is_hard_failure());
        assert!(!svc.is_soft_failure());
    }

    #[tokio::test]
    async fn success_resets_the_counter() {
        let svc = scripted(
            "svc",
            vec![(Status::Fail, None), (Status::Ok, None), (Status::Fail, None)],
        );
        svc.check().await;
        svc.check().await;
        assert_eq!(svc.failure_counter(), 0);
        svc.check().await;
        assert_eq!(svc.failure_counter(), 1);
    }

    #[tokio::test]
    async fn reset_status_clears_the_recorded_state() {
        let svc = scripted("svc", vec![(Status::Ok, None), (Status::Ok, None)]);
        svc.check().await;
        svc.reset_status();
        let (prev, _, _) = svc.check().await;
        assert_eq!(prev, None);
    }

    #[test]
    fn equality_ignores_probe_parameters() {
        use super::{Service, ServiceSpec};
        use std::time::Duration;
        let a = Service::new(ServiceSpec::Database {
            name: "mongo-prod".into(),
            uri: "mongodb://one".into(),
            timeout: Duration::from_secs(5),
            category: "infra".into(),
        });
        let b = Service::new(ServiceSpec::Database {
            name: "mongo-prod".into(),
            uri: "mongodb://two".into(),
            timeout: Duration::from_secs(9),
            category: "infra".into(),
        });
        assert_eq!(a, b);
    }
}
