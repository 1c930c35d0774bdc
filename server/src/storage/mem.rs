/*
 * Created on Thu Feb 22 2024
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

//! An in-memory [`Storage`] stand-in for the consolidation and instance
//! lock tests. It tracks write counts and can be told to fail SLA upserts
//! to exercise the retry paths

use super::{DowntimeRow, PeriodKind, ServiceId, ServiceRow, Storage, StorageError, StorageResult};
use crate::service::{Extra, Service, Status};
use async_trait::async_trait;
use mongodb::bson::{oid::ObjectId, Document};
use parking_lot::Mutex;
use std::{
    collections::HashMap,
    sync::atomic::{AtomicBool, AtomicUsize, Ordering},
};

#[derive(Default)]
pub(crate) struct MemStorage {
    pub services: Mutex<Vec<ServiceRow>>,
    pub downtimes: Mutex<Vec<DowntimeRow>>,
    pub slas: Mutex<HashMap<(PeriodKind, ServiceId, i64), f64>>,
    pub watermarks: Mutex<HashMap<PeriodKind, i64>>,
    pub instance_date: Mutex<Option<i64>>,
    pub sla_writes: AtomicUsize,
    pub public_writes: AtomicUsize,
    pub fail_sla_upserts: AtomicBool,
}

impl MemStorage {
    pub fn add_service(&self, category: &str, status: Status) -> ServiceId {
        let id = ObjectId::new();
        self.services.lock().push(ServiceRow {
            id,
            category: category.to_owned(),
            kind: "Ingress".to_owned(),
            ns: None,
            description: format!("https://svc-{id}/health"),
            status: status.as_i32(),
            status_public: None,
        });
        id
    }
    pub fn add_downtime(&self, service: ServiceId, start: i64, end: i64) {
        self.downtimes.lock().push(DowntimeRow {
            id: ObjectId::new(),
            service,
            down_start_date: start,
            down_end_date: end,
            extra: None,
        });
    }
    pub fn sla(&self, kind: PeriodKind, service: ServiceId, period_start: i64) -> Option<f64> {
        self.slas.lock().get(&(kind, service, period_start)).copied()
    }
    pub fn public_status(&self, service: ServiceId) -> Option<Status> {
        self.services
            .lock()
            .iter()
            .find(|s| s.id == service)
            .and_then(ServiceRow::public_status)
    }
}

#[async_trait]
impl Storage for MemStorage {
    async fn ready(&self) -> bool {
        true
    }
    async fn update_status(&self, _svc: &Service, _status: Status, _extra: Option<Extra>) -> bool {
        // the monitoring path is tested against the protocol ledger, not
        // this stand-in
        false
    }
    async fn all_services(&self, filter: Document) -> StorageResult<Vec<ServiceRow>> {
        let rows = self.services.lock().clone();
        match filter.get_str("category") {
            Ok(category) => Ok(rows
                .into_iter()
                .filter(|row| row.category == category)
                .collect()),
            Err(_) => Ok(rows),
        }
    }
    async fn find_downtimes(
        &self,
        service: ServiceId,
        start: i64,
        duration: i64,
    ) -> StorageResult<Vec<DowntimeRow>> {
        let end = start + duration;
        Ok(self
            .downtimes
            .lock()
            .iter()
            .filter(|d| {
                d.service == service
                    && d.down_start_date < end
                    && (d.down_end_date > start || d.down_end_date == 0)
            })
            .cloned()
            .collect())
    }
    async fn watermark(&self, kind: PeriodKind) -> StorageResult<Option<i64>> {
        Ok(self.watermarks.lock().get(&kind).copied())
    }
    async fn set_watermark(&self, kind: PeriodKind, next: i64) -> StorageResult<()> {
        self.watermarks.lock().insert(kind, next);
        Ok(())
    }
    async fn upsert_sla(
        &self,
        kind: PeriodKind,
        service: ServiceId,
        period_start: i64,
        sla: f64,
    ) -> StorageResult<()> {
        if self.fail_sla_upserts.load(Ordering::Acquire) {
            return Err(StorageError::Malformed("injected: sla upsert failed".into()));
        }
        self.sla_writes.fetch_add(1, Ordering::AcqRel);
        self.slas.lock().insert((kind, service, period_start), sla);
        Ok(())
    }
    async fn open_downtime_older_than(
        &self,
        service: ServiceId,
        started_not_after: i64,
    ) -> StorageResult<Option<DowntimeRow>> {
        Ok(self
            .downtimes
            .lock()
            .iter()
            .find(|d| {
                d.service == service && d.is_open() && d.down_start_date <= started_not_after
            })
            .cloned())
    }
    async fn set_public_status(&self, service: ServiceId, status: Status) -> StorageResult<()> {
        self.public_writes.fetch_add(1, Ordering::AcqRel);
        let mut services = self.services.lock();
        let row = services
            .iter_mut()
            .find(|s| s.id == service)
            .ok_or_else(|| StorageError::Malformed("no such service".into()))?;
        row.status_public = Some(status.as_i32());
        Ok(())
    }
    async fn ensure_instance_row(&self) -> StorageResult<()> {
        let mut date = self.instance_date.lock();
        if date.is_none() {
            *date = Some(0);
        }
        Ok(())
    }
    async fn instance_heartbeat(&self, window: i64, now: i64) -> StorageResult<bool> {
        let mut date = self.instance_date.lock();
        match *date {
            Some(current) if current <= now - window => {
                *date = Some(now);
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}
