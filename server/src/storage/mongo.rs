/*
 * Created on Wed Feb 21 2024
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

//! The MongoDB storage backend.
//!
//! Layout:
//! - `uptime`: one document per service with its last recorded status
//! - `uptime_history`: one document per downtime interval
//! - `daily_uptime`/`weekly_uptime`/`monthly_uptime`: consolidated SLA rows
//! - `consolidation_state`: one watermark document per period kind
//! - `instance_state`: the singleton heartbeat document
//!
//! Only two states are stored per service (OK and FAIL); individual check
//! results are never logged, only the transitions between the two.

use super::{
    protocol::{DowntimeLedger, StatusProtocol},
    DowntimeId, DowntimeRow, PeriodKind, ServiceId, ServiceRow, Storage, StorageResult,
};
use crate::{
    service::{Extra, Service, ServiceSpec, Status},
    storage::StorageError,
    util,
};
use async_trait::async_trait;
use mongodb::{
    bson::{self, doc, Document},
    options::{ClientOptions, UpdateOptions},
    Client, Collection, Database, IndexModel,
};
use std::time::Duration;

const COLL_UPTIME: &str = "uptime";
const COLL_HISTORY: &str = "uptime_history";
const COLL_DAILY: &str = "daily_uptime";
const COLL_WEEKLY: &str = "weekly_uptime";
const COLL_MONTHLY: &str = "monthly_uptime";
const COLL_CONSOLIDATION: &str = "consolidation_state";
const COLL_INSTANCE: &str = "instance_state";
/// `_id` of the singleton instance document. A fixed key lets the unique
/// index on `_id` arbitrate concurrent first-time creation
const INSTANCE_DOC_ID: &str = "instance";

/// How long we wait for the server before a call is considered failed
const SERVER_SELECTION_TIMEOUT: Duration = Duration::from_secs(5);

pub struct MongoStorage {
    db: Database,
    uptime: Collection<Document>,
    uptime_history: Collection<Document>,
    daily_uptime: Collection<Document>,
    weekly_uptime: Collection<Document>,
    monthly_uptime: Collection<Document>,
    consolidation_state: Collection<Document>,
    instance_state: Collection<Document>,
    protocol: StatusProtocol,
}

impl MongoStorage {
    /// Connect and make sure every collection and index exists
    pub async fn connect(uri: &str, db_name: &str) -> StorageResult<Self> {
        let mut options = ClientOptions::parse(uri).await?;
        options.server_selection_timeout = Some(SERVER_SELECTION_TIMEOUT);
        let client = Client::with_options(options)?;
        let db = client.database(db_name);
        let storage = Self {
            uptime: db.collection(COLL_UPTIME),
            uptime_history: db.collection(COLL_HISTORY),
            daily_uptime: db.collection(COLL_DAILY),
            weekly_uptime: db.collection(COLL_WEEKLY),
            monthly_uptime: db.collection(COLL_MONTHLY),
            consolidation_state: db.collection(COLL_CONSOLIDATION),
            instance_state: db.collection(COLL_INSTANCE),
            protocol: StatusProtocol::new(),
            db,
        };
        storage.bootstrap().await?;
        Ok(storage)
    }

    async fn bootstrap(&self) -> StorageResult<()> {
        let existing = self.db.list_collection_names(None).await?;
        let missing = |name: &str| !existing.iter().any(|c| c == name);
        if missing(COLL_UPTIME) {
            self.db.create_collection(COLL_UPTIME, None).await?;
            create_indexes(
                &self.uptime,
                &[doc! { "category": "hashed" }, doc! { "ns": "hashed" }],
            )
            .await?;
        }
        if missing(COLL_HISTORY) {
            self.db.create_collection(COLL_HISTORY, None).await?;
            create_indexes(&self.uptime_history, &[doc! { "_id_uptime": 1 }]).await?;
        }
        for (name, coll) in [
            (COLL_DAILY, &self.daily_uptime),
            (COLL_WEEKLY, &self.weekly_uptime),
            (COLL_MONTHLY, &self.monthly_uptime),
        ] {
            if missing(name) {
                self.db.create_collection(name, None).await?;
                create_indexes(coll, &[doc! { "_id_uptime": 1 }, doc! { "date": 1 }]).await?;
            }
        }
        if missing(COLL_CONSOLIDATION) {
            self.db.create_collection(COLL_CONSOLIDATION, None).await?;
        }
        if missing(COLL_INSTANCE) {
            self.db.create_collection(COLL_INSTANCE, None).await?;
            create_indexes(&self.instance_state, &[doc! { "date": 1 }]).await?;
        }
        Ok(())
    }

    fn sla_collection(&self, kind: PeriodKind) -> &Collection<Document> {
        match kind {
            PeriodKind::Daily => &self.daily_uptime,
            PeriodKind::Weekly => &self.weekly_uptime,
            PeriodKind::Monthly => &self.monthly_uptime,
        }
    }

    /// The identity query for a service row, or `None` when this backend
    /// has no mapping for the kind
    fn service_query(svc: &Service) -> Option<Document> {
        let spec = svc.spec();
        let mut query = doc! {
            "category": spec.category(),
            "kind": svc.kind().as_str(),
            "description": spec.description(),
        };
        match spec {
            ServiceSpec::HttpIngress { ns, .. } => {
                query.insert("ns", ns.as_str());
            }
            ServiceSpec::Cluster { context, .. } => {
                query.insert("context", context.as_str());
            }
            ServiceSpec::Database { .. } | ServiceSpec::Search { .. } => {}
            #[cfg(test)]
            ServiceSpec::Scripted { .. } => return None,
        }
        Some(query)
    }

    fn id_of(doc: &Document) -> StorageResult<ServiceId> {
        doc.get_object_id("_id")
            .map_err(|e| StorageError::Malformed(format!("document without _id: {e}")))
    }

    fn status_of(doc: &Document) -> StorageResult<Status> {
        let raw = doc
            .get_i32("status")
            .map_err(|e| StorageError::Malformed(format!("service row without status: {e}")))?;
        Status::from_i32(raw)
            .ok_or_else(|| StorageError::Malformed(format!("unknown status value {raw}")))
    }
}

async fn create_indexes(coll: &Collection<Document>, keys: &[Document]) -> StorageResult<()> {
    for key in keys {
        coll.create_index(IndexModel::builder().keys(key.clone()).build(), None)
            .await?;
    }
    Ok(())
}

fn upsert() -> UpdateOptions {
    UpdateOptions::builder().upsert(true).build()
}

#[async_trait]
impl DowntimeLedger for MongoStorage {
    async fn find_service(&self, svc: &Service) -> StorageResult<Option<(ServiceId, Status)>> {
        let query = Self::service_query(svc)
            .ok_or(StorageError::UnsupportedKind(svc.kind().as_str()))?;
        match self.uptime.find_one(query, None).await? {
            Some(doc) => Ok(Some((Self::id_of(&doc)?, Self::status_of(&doc)?))),
            None => Ok(None),
        }
    }
    async fn service_status(&self, id: ServiceId) -> StorageResult<Option<Status>> {
        match self.uptime.find_one(doc! { "_id": id }, None).await? {
            Some(doc) => Ok(Some(Self::status_of(&doc)?)),
            None => Ok(None),
        }
    }
    async fn insert_service(&self, svc: &Service) -> StorageResult<ServiceId> {
        let mut row = Self::service_query(svc)
            .ok_or(StorageError::UnsupportedKind(svc.kind().as_str()))?;
        row.insert("status", Status::Ok.as_i32());
        let result = self.uptime.insert_one(row, None).await?;
        result
            .inserted_id
            .as_object_id()
            .ok_or_else(|| StorageError::Malformed("insert did not return an ObjectId".into()))
    }
    async fn set_service_status(&self, id: ServiceId, status: Status) -> StorageResult<()> {
        self.uptime
            .update_one(
                doc! { "_id": id },
                doc! { "$set": { "status": status.as_i32() } },
                None,
            )
            .await?;
        Ok(())
    }
    async fn find_open_downtime(&self, id: ServiceId) -> StorageResult<Option<DowntimeId>> {
        match self
            .uptime_history
            .find_one(doc! { "_id_uptime": id, "down_end_date": 0_i64 }, None)
            .await?
        {
            Some(doc) => Ok(Some(Self::id_of(&doc)?)),
            None => Ok(None),
        }
    }
    async fn open_downtime(
        &self,
        id: ServiceId,
        extra: Option<&Extra>,
        now: i64,
    ) -> StorageResult<DowntimeId> {
        // status first, log second: the protocol repairs a loss in between
        self.set_service_status(id, Status::Fail).await?;
        let mut row = doc! {
            "_id_uptime": id,
            "down_start_date": now,
            "down_end_date": 0_i64,
        };
        if let Some(extra) = extra {
            row.insert("extra", bson::to_document(extra)?);
        }
        let result = self.uptime_history.insert_one(row, None).await?;
        result
            .inserted_id
            .as_object_id()
            .ok_or_else(|| StorageError::Malformed("insert did not return an ObjectId".into()))
    }
    async fn close_downtime(
        &self,
        id: ServiceId,
        downtime: DowntimeId,
        now: i64,
    ) -> StorageResult<()> {
        self.set_service_status(id, Status::Ok).await?;
        self.uptime_history
            .update_one(
                doc! { "_id": downtime },
                doc! { "$set": { "down_end_date": now } },
                None,
            )
            .await?;
        Ok(())
    }
}

#[async_trait]
impl Storage for MongoStorage {
    async fn ready(&self) -> bool {
        self.db.run_command(doc! { "ping": 1 }, None).await.is_ok()
    }
    async fn update_status(&self, svc: &Service, status: Status, extra: Option<Extra>) -> bool {
        self.protocol
            .record(self, svc, status, extra, util::epoch_now())
            .await
    }
    async fn all_services(&self, filter: Document) -> StorageResult<Vec<ServiceRow>> {
        let mut cursor = self.uptime.find(filter, None).await?;
        let mut rows = Vec::new();
        while cursor.advance().await? {
            let raw = cursor.deserialize_current()?;
            rows.push(bson::from_document(raw)?);
        }
        Ok(rows)
    }
    async fn find_downtimes(
        &self,
        service: ServiceId,
        start: i64,
        duration: i64,
    ) -> StorageResult<Vec<DowntimeRow>> {
        let end = start + duration;
        let query = doc! {
            "_id_uptime": service,
            "down_start_date": { "$lt": end },
            "$or": [
                { "down_end_date": { "$gt": start } },
                { "down_end_date": 0_i64 },
            ],
        };
        let mut cursor = self.uptime_history.find(query, None).await?;
        let mut rows = Vec::new();
        while cursor.advance().await? {
            let raw = cursor.deserialize_current()?;
            rows.push(bson::from_document(raw)?);
        }
        Ok(rows)
    }
    async fn watermark(&self, kind: PeriodKind) -> StorageResult<Option<i64>> {
        match self
            .consolidation_state
            .find_one(doc! { "state": kind.as_str() }, None)
            .await?
        {
            Some(doc) => {
                let next = doc.get_i64("next").map_err(|e| {
                    StorageError::Malformed(format!("watermark without next: {e}"))
                })?;
                Ok(Some(next))
            }
            None => Ok(None),
        }
    }
    async fn set_watermark(&self, kind: PeriodKind, next: i64) -> StorageResult<()> {
        self.consolidation_state
            .update_one(
                doc! { "state": kind.as_str() },
                doc! { "$set": { "next": next } },
                upsert(),
            )
            .await?;
        Ok(())
    }
    async fn upsert_sla(
        &self,
        kind: PeriodKind,
        service: ServiceId,
        period_start: i64,
        sla: f64,
    ) -> StorageResult<()> {
        self.sla_collection(kind)
            .update_one(
                doc! { "_id_uptime": service, "date": period_start },
                doc! { "$set": { "sla": sla } },
                upsert(),
            )
            .await?;
        Ok(())
    }
    async fn open_downtime_older_than(
        &self,
        service: ServiceId,
        started_not_after: i64,
    ) -> StorageResult<Option<DowntimeRow>> {
        let query = doc! {
            "_id_uptime": service,
            "down_end_date": 0_i64,
            "down_start_date": { "$lte": started_not_after },
        };
        match self.uptime_history.find_one(query, None).await? {
            Some(doc) => Ok(Some(bson::from_document(doc)?)),
            None => Ok(None),
        }
    }
    async fn set_public_status(&self, service: ServiceId, status: Status) -> StorageResult<()> {
        self.uptime
            .update_one(
                doc! { "_id": service },
                doc! { "$set": { "status_public": status.as_i32() } },
                None,
            )
            .await?;
        Ok(())
    }
    async fn ensure_instance_row(&self) -> StorageResult<()> {
        self.instance_state
            .update_one(
                doc! { "_id": INSTANCE_DOC_ID },
                doc! { "$setOnInsert": { "date": 0_i64 } },
                upsert(),
            )
            .await?;
        Ok(())
    }
    async fn instance_heartbeat(&self, window: i64, now: i64) -> StorageResult<bool> {
        // conditional update: only an aged-out heartbeat may be taken over.
        // No upsert here, the row is created by ensure_instance_row
        let result = self
            .instance_state
            .update_one(
                doc! { "_id": INSTANCE_DOC_ID, "date": { "$lte": now - window } },
                doc! { "$set": { "date": now } },
                None,
            )
            .await?;
        Ok(result.matched_count == 1)
    }
}
