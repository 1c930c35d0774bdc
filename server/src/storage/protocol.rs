/*
 * Created on Tue Feb 20 2024
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

//! # The status-transition protocol
//!
//! The document store is not transactional: the service row and the
//! downtime log cannot be updated atomically, and a crash (or a lost
//! connection) between the two writes leaves them disagreeing. Instead of
//! pretending otherwise, the protocol re-reads the persisted state on
//! every call and repairs any half-write it finds, so the log converges
//! back to one open downtime per failing service (and none per healthy
//! one) at the next report.
//!
//! The protocol is written once, against the primitive operations of the
//! [`DowntimeLedger`] trait, so the MongoDB backend and the in-memory test
//! ledger share the exact same decision tree.
//!
//! Database identifiers resolved along the way are kept in a side cache
//! keyed by service identity. The cache is only ever an optimization: any
//! failed write drops the entry and the next call re-resolves from the
//! store.

use super::{DowntimeId, ServiceId, StorageError, StorageResult};
use crate::service::{Extra, Service, Status};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;

/// The primitive, non-transactional operations the protocol drives.
///
/// `open_downtime` and `close_downtime` are each two writes on the store
/// (service status first, then the downtime log); the protocol is built to
/// survive losing the second one
#[async_trait]
pub trait DowntimeLedger: Send + Sync {
    /// Look the service up by identity. Returns its id and persisted status
    async fn find_service(&self, svc: &Service) -> StorageResult<Option<(ServiceId, Status)>>;
    /// The persisted status for a known id, `None` if the row vanished
    async fn service_status(&self, id: ServiceId) -> StorageResult<Option<Status>>;
    /// Create the service row with status `Ok`
    async fn insert_service(&self, svc: &Service) -> StorageResult<ServiceId>;
    /// Rewrite just the persisted status
    async fn set_service_status(&self, id: ServiceId, status: Status) -> StorageResult<()>;
    /// The id of the open downtime for this service, if one exists
    async fn find_open_downtime(&self, id: ServiceId) -> StorageResult<Option<DowntimeId>>;
    /// Mark the service failed and append an open downtime starting `now`
    async fn open_downtime(
        &self,
        id: ServiceId,
        extra: Option<&Extra>,
        now: i64,
    ) -> StorageResult<DowntimeId>;
    /// Mark the service healthy and end the open downtime at `now`
    async fn close_downtime(
        &self,
        id: ServiceId,
        downtime: DowntimeId,
        now: i64,
    ) -> StorageResult<()>;
}

#[derive(Debug, Clone, Copy)]
struct CachedIds {
    service: ServiceId,
    downtime: Option<DowntimeId>,
}

/// Cache key: the identifying fields of the service. Collisions are
/// impossible across kinds (the kind tag leads) and harmless within one
/// (two keys for equal services just means one redundant lookup)
pub(crate) fn cache_key(svc: &Service) -> String {
    format!(
        "{}|{}|{}",
        svc.kind().as_str(),
        svc.spec().category(),
        svc
    )
}

/// Drives reported statuses through the transition protocol, remembering
/// the database ids it resolved on the way
pub struct StatusProtocol {
    cache: Mutex<HashMap<String, CachedIds>>,
}

impl StatusProtocol {
    pub fn new() -> Self {
        Self {
            cache: Mutex::new(HashMap::new()),
        }
    }

    /// Persist one reported status. Returns `false` when the transition
    /// could not be recorded and should be retried on the next round
    pub async fn record<L: DowntimeLedger + ?Sized>(
        &self,
        ledger: &L,
        svc: &Service,
        status: Status,
        extra: Option<Extra>,
        now: i64,
    ) -> bool {
        match self.try_record(ledger, svc, status, extra, now).await {
            Ok(()) => true,
            Err(StorageError::UnsupportedKind(kind)) => {
                log::warn!("discarding status report for unsupported service kind {kind}");
                false
            }
            Err(e) => {
                // the cached ids may have been part of the problem
                self.cache.lock().remove(&cache_key(svc));
                log::error!("failed to persist status for service ({svc}): {e}");
                false
            }
        }
    }

    async fn try_record<L: DowntimeLedger + ?Sized>(
        &self,
        ledger: &L,
        svc: &Service,
        status: Status,
        extra: Option<Extra>,
        now: i64,
    ) -> StorageResult<()> {
        let key = cache_key(svc);
        let cached = self.cache.lock().get(&key).copied();

        // resolve the service row, creating it on first observation
        let mut created = false;
        let (id_svc, db_status) = match cached.map(|c| c.service) {
            Some(id) => match ledger.service_status(id).await? {
                Some(st) => (id, Some(st)),
                // the cached id no longer resolves; re-resolve by identity
                None => resolve(ledger, svc, &mut created).await?,
            },
            None => resolve(ledger, svc, &mut created).await?,
        };

        if created {
            // a brand new service has nothing to reconcile
            let downtime = if status == Status::Fail {
                Some(ledger.open_downtime(id_svc, extra.as_ref(), now).await?)
            } else {
                None
            };
            self.cache.lock().insert(
                key,
                CachedIds {
                    service: id_svc,
                    downtime,
                },
            );
            return Ok(());
        }

        let db_status = db_status.ok_or_else(|| {
            StorageError::Malformed(format!("service row for ({svc}) has no readable status"))
        })?;

        // the downtime log is re-read even when nothing seems to have
        // changed: that is what detects and repairs a lost second write
        let mut id_dt = cached.and_then(|c| c.downtime);
        if id_dt.is_none() {
            id_dt = ledger.find_open_downtime(id_svc).await?;
        }

        if db_status == status {
            match status {
                // healthy, yet an open downtime survived a past half-write:
                // end it now. The end date is inaccurate but consistent
                Status::Ok => {
                    if let Some(dt) = id_dt.take() {
                        ledger.close_downtime(id_svc, dt, now).await?;
                    }
                }
                // failing, yet the open downtime is missing: restart one.
                // The start date is inaccurate but consistent
                Status::Fail => {
                    if id_dt.is_none() {
                        id_dt = Some(ledger.open_downtime(id_svc, extra.as_ref(), now).await?);
                    }
                }
            }
        } else {
            match status {
                Status::Fail => match id_dt {
                    None => id_dt = Some(ledger.open_downtime(id_svc, extra.as_ref(), now).await?),
                    // a back-online report was lost earlier; the log already
                    // has the open downtime, only the status is stale
                    Some(_) => ledger.set_service_status(id_svc, Status::Fail).await?,
                },
                Status::Ok => match id_dt.take() {
                    Some(dt) => ledger.close_downtime(id_svc, dt, now).await?,
                    // the downtime record was lost earlier; still record
                    // the recovery
                    None => ledger.set_service_status(id_svc, Status::Ok).await?,
                },
            }
        }

        self.cache.lock().insert(
            key,
            CachedIds {
                service: id_svc,
                downtime: id_dt,
            },
        );
        Ok(())
    }
}

impl Default for StatusProtocol {
    fn default() -> Self {
        Self::new()
    }
}

async fn resolve<L: DowntimeLedger + ?Sized>(
    ledger: &L,
    svc: &Service,
    created: &mut bool,
) -> StorageResult<(ServiceId, Option<Status>)> {
    match ledger.find_service(svc).await? {
        Some((id, status)) => Ok((id, Some(status))),
        None => {
            let id = ledger.insert_service(svc).await?;
            *created = true;
            Ok((id, None))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{cache_key, DowntimeLedger, StatusProtocol};
    use crate::{
        service::{test_support::scripted, Extra, Service, Status},
        storage::{DowntimeId, DowntimeRow, ServiceId, StorageError, StorageResult},
    };
    use async_trait::async_trait;
    use mongodb::bson::{self, oid::ObjectId};
    use parking_lot::Mutex;
    use serde_json::json;
    use std::sync::atomic::{AtomicBool, Ordering};

    #[derive(Debug)]
    struct MemService {
        id: ServiceId,
        key: String,
        status: Status,
    }

    /// An in-memory ledger with switches that lose the second write of an
    /// open/close pair, the way a crash between the two store writes would
    #[derive(Default)]
    struct MemLedger {
        services: Mutex<Vec<MemService>>,
        downtimes: Mutex<Vec<DowntimeRow>>,
        lose_next_open: AtomicBool,
        lose_next_close: AtomicBool,
    }

    impl MemLedger {
        fn open_count(&self, id: ServiceId) -> usize {
            self.downtimes
                .lock()
                .iter()
                .filter(|d| d.service == id && d.is_open())
                .count()
        }
        fn downtime_rows(&self) -> Vec<DowntimeRow> {
            self.downtimes.lock().clone()
        }
        fn status_of(&self, id: ServiceId) -> Option<Status> {
            self.services
                .lock()
                .iter()
                .find(|s| s.id == id)
                .map(|s| s.status)
        }
        fn only_service(&self) -> ServiceId {
            let services = self.services.lock();
            assert_eq!(services.len(), 1);
            services[0].id
        }
    }

    #[async_trait]
    impl DowntimeLedger for MemLedger {
        async fn find_service(&self, svc: &Service) -> StorageResult<Option<(ServiceId, Status)>> {
            let key = cache_key(svc);
            Ok(self
                .services
                .lock()
                .iter()
                .find(|s| s.key == key)
                .map(|s| (s.id, s.status)))
        }
        async fn service_status(&self, id: ServiceId) -> StorageResult<Option<Status>> {
            Ok(self.status_of(id))
        }
        async fn insert_service(&self, svc: &Service) -> StorageResult<ServiceId> {
            let id = ObjectId::new();
            self.services.lock().push(MemService {
                id,
                key: cache_key(svc),
                status: Status::Ok,
            });
            Ok(id)
        }
        async fn set_service_status(&self, id: ServiceId, status: Status) -> StorageResult<()> {
            let mut services = self.services.lock();
            let svc = services
                .iter_mut()
                .find(|s| s.id == id)
                .ok_or_else(|| StorageError::Malformed("no such service".into()))?;
            svc.status = status;
            Ok(())
        }
        async fn find_open_downtime(&self, id: ServiceId) -> StorageResult<Option<DowntimeId>> {
            Ok(self
                .downtimes
                .lock()
                .iter()
                .find(|d| d.service == id && d.is_open())
                .map(|d| d.id))
        }
        async fn open_downtime(
            &self,
            id: ServiceId,
            extra: Option<&Extra>,
            now: i64,
        ) -> StorageResult<DowntimeId> {
            self.set_service_status(id, Status::Fail).await?;
            if self.lose_next_open.swap(false, Ordering::AcqRel) {
                return Err(StorageError::Malformed("injected: downtime insert lost".into()));
            }
            let dt = ObjectId::new();
            self.downtimes.lock().push(DowntimeRow {
                id: dt,
                service: id,
                down_start_date: now,
                down_end_date: 0,
                extra: extra.and_then(|e| bson::to_document(e).ok()),
            });
            Ok(dt)
        }
        async fn close_downtime(
            &self,
            id: ServiceId,
            downtime: DowntimeId,
            now: i64,
        ) -> StorageResult<()> {
            self.set_service_status(id, Status::Ok).await?;
            if self.lose_next_close.swap(false, Ordering::AcqRel) {
                return Err(StorageError::Malformed("injected: downtime close lost".into()));
            }
            let mut downtimes = self.downtimes.lock();
            let row = downtimes
                .iter_mut()
                .find(|d| d.id == downtime)
                .ok_or_else(|| StorageError::Malformed("no such downtime".into()))?;
            row.down_end_date = now;
            Ok(())
        }
    }

    #[tokio::test]
    async fn first_ok_creates_the_service_and_nothing_else() {
        let ledger = MemLedger::default();
        let protocol = StatusProtocol::new();
        let svc = scripted("svc", vec![]);
        assert!(protocol.record(&ledger, &svc, Status::Ok, None, 1000).await);
        let id = ledger.only_service();
        assert_eq!(ledger.status_of(id), Some(Status::Ok));
        assert!(ledger.downtime_rows().is_empty());
    }

    #[tokio::test]
    async fn first_fail_creates_the_service_with_an_open_downtime() {
        let ledger = MemLedger::default();
        let protocol = StatusProtocol::new();
        let svc = scripted("svc", vec![]);
        let mut extra = Extra::new();
        extra.insert("status_code".to_owned(), json!(503));
        assert!(
            protocol
                .record(&ledger, &svc, Status::Fail, Some(extra), 1000)
                .await
        );
        let id = ledger.only_service();
        assert_eq!(ledger.status_of(id), Some(Status::Fail));
        assert_eq!(ledger.open_count(id), 1);
        let rows = ledger.downtime_rows();
        assert_eq!(rows[0].down_start_date, 1000);
        assert!(rows[0].extra.is_some());
    }

    #[tokio::test]
    async fn a_full_outage_produces_one_closed_interval() {
        let ledger = MemLedger::default();
        let protocol = StatusProtocol::new();
        let svc = scripted("svc", vec![]);
        assert!(protocol.record(&ledger, &svc, Status::Fail, None, 100).await);
        assert!(protocol.record(&ledger, &svc, Status::Ok, None, 160).await);
        let id = ledger.only_service();
        assert_eq!(ledger.status_of(id), Some(Status::Ok));
        assert_eq!(ledger.open_count(id), 0);
        let rows = ledger.downtime_rows();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].down_start_date, 100);
        assert_eq!(rows[0].down_end_date, 160);
    }

    #[tokio::test]
    async fn repeated_reports_do_not_duplicate_downtimes() {
        let ledger = MemLedger::default();
        let protocol = StatusProtocol::new();
        let svc = scripted("svc", vec![]);
        for now in [10, 20, 30] {
            assert!(protocol.record(&ledger, &svc, Status::Fail, None, now).await);
            assert_eq!(ledger.open_count(ledger.only_service()), 1);
        }
        assert!(protocol.record(&ledger, &svc, Status::Ok, None, 40).await);
        assert_eq!(ledger.downtime_rows().len(), 1);
    }

    #[tokio::test]
    async fn lost_downtime_insert_heals_on_the_next_report() {
        let ledger = MemLedger::default();
        let protocol = StatusProtocol::new();
        let svc = scripted("svc", vec![]);
        assert!(protocol.record(&ledger, &svc, Status::Ok, None, 10).await);
        // the status write lands but the downtime insert is lost
        ledger.lose_next_open.store(true, Ordering::Release);
        assert!(!protocol.record(&ledger, &svc, Status::Fail, None, 20).await);
        let id = ledger.only_service();
        assert_eq!(ledger.status_of(id), Some(Status::Fail));
        assert_eq!(ledger.open_count(id), 0);
        // the next report finds status==FAIL with no open downtime and
        // repairs the log
        assert!(protocol.record(&ledger, &svc, Status::Fail, None, 30).await);
        assert_eq!(ledger.open_count(id), 1);
        assert_eq!(ledger.downtime_rows()[0].down_start_date, 30);
    }

    #[tokio::test]
    async fn lost_downtime_close_heals_on_the_next_report() {
        let ledger = MemLedger::default();
        let protocol = StatusProtocol::new();
        let svc = scripted("svc", vec![]);
        assert!(protocol.record(&ledger, &svc, Status::Fail, None, 10).await);
        // recovery: the status write lands but the close is lost
        ledger.lose_next_close.store(true, Ordering::Release);
        assert!(!protocol.record(&ledger, &svc, Status::Ok, None, 20).await);
        let id = ledger.only_service();
        assert_eq!(ledger.status_of(id), Some(Status::Ok));
        assert_eq!(ledger.open_count(id), 1);
        // healthy again: the stray open downtime is ended
        assert!(protocol.record(&ledger, &svc, Status::Ok, None, 50).await);
        assert_eq!(ledger.open_count(id), 0);
        assert_eq!(ledger.downtime_rows()[0].down_end_date, 50);
    }

    #[tokio::test]
    async fn at_most_one_open_downtime_throughout_a_flapping_history() {
        let ledger = MemLedger::default();
        let protocol = StatusProtocol::new();
        let svc = scripted("svc", vec![]);
        let history = [
            (Status::Fail, 10),
            (Status::Fail, 20),
            (Status::Ok, 30),
            (Status::Fail, 40),
            (Status::Ok, 50),
            (Status::Ok, 60),
        ];
        for (status, now) in history {
            protocol.record(&ledger, &svc, status, None, now).await;
            let id = ledger.only_service();
            assert!(ledger.open_count(id) <= 1);
        }
        assert_eq!(ledger.downtime_rows().len(), 2);
    }

    #[tokio::test]
    async fn distinct_services_do_not_share_rows() {
        let ledger = MemLedger::default();
        let protocol = StatusProtocol::new();
        let a = scripted("a", vec![]);
        let b = scripted("b", vec![]);
        assert!(protocol.record(&ledger, &a, Status::Fail, None, 10).await);
        assert!(protocol.record(&ledger, &b, Status::Ok, None, 10).await);
        assert_eq!(ledger.services.lock().len(), 2);
        assert_eq!(ledger.downtime_rows().len(), 1);
    }
}
