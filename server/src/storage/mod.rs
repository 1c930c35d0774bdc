/*
 * Created on Mon Feb 19 2024
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

//! # Storage
//!
//! The storage layer persists services, the downtime log and the
//! consolidation state. The backend is a collection-oriented document store
//! without transactions: the status-transition protocol that keeps the
//! downtime log consistent anyway lives in [`protocol`], the concrete
//! MongoDB backend in [`mongo`].
//!
//! Everything the rest of the daemon needs is behind the [`Storage`] trait
//! so that the monitoring and consolidation engines never see a driver
//! type, and so that tests can run against an in-memory stand-in.

pub mod dates;
pub mod mongo;
pub mod protocol;
#[cfg(test)]
pub(crate) mod mem;

use crate::{
    monitor::StatusSink,
    service::{Extra, Service, Status},
};
use async_trait::async_trait;
use mongodb::bson::{self, oid::ObjectId, Document};
use serde::{Deserialize, Serialize};
use std::{fmt, sync::Arc};

pub use self::dates::PeriodKind;

pub type StorageResult<T> = Result<T, StorageError>;
pub type ServiceId = ObjectId;
pub type DowntimeId = ObjectId;

#[derive(Debug)]
pub enum StorageError {
    /// An error returned by the backend driver. Always treated as
    /// transient: the caller retries later
    Backend(mongodb::error::Error),
    /// A stored document did not have the expected shape
    Malformed(String),
    /// The storage backend has no mapping for this service kind
    UnsupportedKind(&'static str),
}

impl fmt::Display for StorageError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Backend(berr) => write!(f, "backend error: {}", berr),
            Self::Malformed(m) => write!(f, "malformed document: {}", m),
            Self::UnsupportedKind(kind) => write!(f, "unsupported service kind: {}", kind),
        }
    }
}

impl From<mongodb::error::Error> for StorageError {
    fn from(berr: mongodb::error::Error) -> Self {
        Self::Backend(berr)
    }
}

impl From<bson::de::Error> for StorageError {
    fn from(derr: bson::de::Error) -> Self {
        Self::Malformed(derr.to_string())
    }
}

impl From<bson::ser::Error> for StorageError {
    fn from(serr: bson::ser::Error) -> Self {
        Self::Malformed(serr.to_string())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
/// One document of the service collection
pub struct ServiceRow {
    #[serde(rename = "_id")]
    pub id: ServiceId,
    pub category: String,
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ns: Option<String>,
    pub description: String,
    pub status: i32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status_public: Option<i32>,
}

impl ServiceRow {
    pub fn public_status(&self) -> Option<Status> {
        self.status_public.and_then(Status::from_i32)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
/// One document of the downtime log. `down_end_date == 0` means the
/// downtime is still open
pub struct DowntimeRow {
    #[serde(rename = "_id")]
    pub id: DowntimeId,
    #[serde(rename = "_id_uptime")]
    pub service: ServiceId,
    pub down_start_date: i64,
    pub down_end_date: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extra: Option<Document>,
}

impl DowntimeRow {
    pub fn is_open(&self) -> bool {
        self.down_end_date == 0
    }
}

/// Everything the monitoring and consolidation engines need from a
/// persistence backend
#[async_trait]
pub trait Storage: Send + Sync {
    /// Can the backend be reached right now?
    async fn ready(&self) -> bool;
    /// Persist a reported state following the transition protocol.
    /// Returns `false` to have the monitor retry the transition on the
    /// next probe round
    async fn update_status(&self, svc: &Service, status: Status, extra: Option<Extra>) -> bool;
    /// All service rows matching `filter` (an empty filter selects
    /// everything)
    async fn all_services(&self, filter: Document) -> StorageResult<Vec<ServiceRow>>;
    /// All downtimes of `service` overlapping `[start, start + duration)`
    async fn find_downtimes(
        &self,
        service: ServiceId,
        start: i64,
        duration: i64,
    ) -> StorageResult<Vec<DowntimeRow>>;
    /// The persisted consolidation watermark for `kind`, if any
    async fn watermark(&self, kind: PeriodKind) -> StorageResult<Option<i64>>;
    /// Persist an advanced watermark for `kind`
    async fn set_watermark(&self, kind: PeriodKind, next: i64) -> StorageResult<()>;
    /// Upsert the SLA row keyed by `(service, period_start)` into the table
    /// for `kind`
    async fn upsert_sla(
        &self,
        kind: PeriodKind,
        service: ServiceId,
        period_start: i64,
        sla: f64,
    ) -> StorageResult<()>;
    /// The open downtime of `service` that started at or before
    /// `started_not_after`, if any
    async fn open_downtime_older_than(
        &self,
        service: ServiceId,
        started_not_after: i64,
    ) -> StorageResult<Option<DowntimeRow>>;
    /// Set the consolidated public status of `service`
    async fn set_public_status(&self, service: ServiceId, status: Status) -> StorageResult<()>;
    /// Make sure the singleton instance record exists
    async fn ensure_instance_row(&self) -> StorageResult<()>;
    /// Conditionally refresh the instance heartbeat: set the date to `now`
    /// only if the stored date is at least `window` seconds old. Returns
    /// whether the update matched the record
    async fn instance_heartbeat(&self, window: i64, now: i64) -> StorageResult<bool>;
}

/// The notification seam handed to the monitoring tasks. Failures and
/// unsupported kinds collapse to `false`: the task resets the service so
/// the transition is re-reported on the next round
pub struct StorageSink(pub Arc<dyn Storage>);

#[async_trait]
impl StatusSink for StorageSink {
    async fn update_status(&self, svc: &Service, status: Status, extra: Option<Extra>) -> bool {
        log::info!(
            "{} ({}) [{}] reported {}",
            svc.kind().as_str(),
            svc,
            svc.failure_counter(),
            status
        );
        self.0.update_status(svc, status, extra).await
    }
}

/// Compute the SLA percentage for one window from the downtimes
/// overlapping it.
///
/// Each downtime is clipped to `[start, start + duration)` (an open
/// downtime extends to the end of the window) and the clipped lengths are
/// summed. The sum is clamped to the window length to stay sane even if
/// the log is inconsistent
pub fn sla_for_window(downtimes: &[DowntimeRow], start: i64, duration: i64) -> f64 {
    if duration <= 0 {
        return 100.0;
    }
    let window_end = start + duration;
    let mut down: i64 = 0;
    for downtime in downtimes {
        let mut end = downtime.down_end_date;
        if downtime.is_open() || end > window_end {
            end = window_end;
        }
        let begin = downtime.down_start_date.max(start);
        if end > begin {
            down += end - begin;
        }
    }
    if down > duration {
        down = duration;
    }
    100.0 - (down as f64 * 100.0 / duration as f64)
}

#[cfg(test)]
mod tests {
    use super::{sla_for_window, DowntimeRow};
    use mongodb::bson::oid::ObjectId;

    fn downtime(start: i64, end: i64) -> DowntimeRow {
        DowntimeRow {
            id: ObjectId::new(),
            service: ObjectId::new(),
            down_start_date: start,
            down_end_date: end,
            extra: None,
        }
    }

    #[test]
    fn no_downtime_is_full_availability() {
        assert_eq!(sla_for_window(&[], 0, 86_400), 100.0);
    }

    #[test]
    fn closed_and_open_downtimes_are_clipped_and_summed() {
        // 20s closed + open from t=70 against a [0, 100) window
        let downtimes = [downtime(10, 30), downtime(70, 0)];
        assert_eq!(sla_for_window(&downtimes, 0, 100), 50.0);
    }

    #[test]
    fn downtime_straddling_the_window_start_is_clipped() {
        let downtimes = [downtime(-50, 25)];
        assert_eq!(sla_for_window(&downtimes, 0, 100), 75.0);
    }

    #[test]
    fn downtime_beyond_the_window_end_is_clipped() {
        let downtimes = [downtime(90, 500)];
        assert_eq!(sla_for_window(&downtimes, 0, 100), 90.0);
    }

    #[test]
    fn downtime_outside_the_window_does_not_count() {
        // the store query should not return these, but the math must not
        // go negative if it does
        let downtimes = [downtime(200, 300)];
        assert_eq!(sla_for_window(&downtimes, 0, 100), 100.0);
    }

    #[test]
    fn down_is_clamped_to_the_window_length() {
        let downtimes = [downtime(0, 100), downtime(0, 100)];
        assert_eq!(sla_for_window(&downtimes, 0, 100), 0.0);
    }
}
