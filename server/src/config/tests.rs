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

use super::{parse_config, ConfigError};
use crate::service::ServiceKind;

const SAMPLE: &str = r#"
env:
  local:
    storage:
      backend: MongoStorage
      uri: mongodb://localhost:27017
      db: cloud-uptime-local
    server:
      with_consolidation: true
      with_instance_lock: true
    consolidations:
      sla:
        waiting_seconds_between_batch: 120
      status:
        filter:
          category: infra
        down_since: 900
    monitoring:
      max_services: 15
      check_every_seconds: 60
      fast_retry_every_seconds: 5
    instance:
      alive: 30
      inactive_during: 90
    services:
      http:
        - ns: shop
          name: storefront
          url: https://shop.example.com/health
          headers:
            apikey: hunter2
      database:
        - name: mongo-prod
          uri: mongodb://db.example.com:27017
      search:
        - name: es-prod
          url: https://es.example.com:443
          username: elastic
          password: changeme
  prod:
    storage:
      backend: MongoStorage
      uri: mongodb://db.prod.example.com
      db: cloud-uptime
"#;

#[test]
fn the_selected_environment_is_parsed() {
    let cfg = parse_config(SAMPLE, "local").unwrap();
    assert_eq!(cfg.storage.backend, "MongoStorage");
    assert_eq!(cfg.storage.db, "cloud-uptime-local");
    assert!(cfg.server.with_consolidation);
    assert!(cfg.server.with_instance_lock);
    assert_eq!(cfg.consolidations.sla.waiting_seconds_between_batch, 120);
    assert_eq!(cfg.consolidations.status.down_since, 900);
    assert_eq!(cfg.monitoring.max_services, 15);
    assert_eq!(cfg.monitoring.check_every_seconds, 60);
    assert_eq!(cfg.instance.alive, 30);
}

#[test]
fn other_environments_are_selectable() {
    let cfg = parse_config(SAMPLE, "prod").unwrap();
    assert_eq!(cfg.storage.uri, "mongodb://db.prod.example.com");
    // the prod section leaves everything else at the defaults
    assert!(cfg.server.with_consolidation);
    assert!(!cfg.server.with_instance_lock);
    assert_eq!(cfg.monitoring.max_services, 10);
    assert_eq!(cfg.consolidations.status.down_since, 600);
    assert!(cfg.services.is_empty());
}

#[test]
fn an_unknown_environment_is_an_error() {
    match parse_config(SAMPLE, "staging") {
        Err(ConfigError::UnknownEnvironment(env)) => assert_eq!(env, "staging"),
        other => panic!("expected UnknownEnvironment, got {other:?}"),
    }
}

#[test]
fn the_status_filter_becomes_a_query_document() {
    let cfg = parse_config(SAMPLE, "local").unwrap();
    let filter = cfg.consolidations.status.filter_document().unwrap();
    assert_eq!(filter.get_str("category").unwrap(), "infra");
    // absent filter selects everything
    let prod = parse_config(SAMPLE, "prod").unwrap();
    assert!(prod.consolidations.status.filter_document().unwrap().is_empty());
}

#[test]
fn static_services_are_materialized() {
    let cfg = parse_config(SAMPLE, "local").unwrap();
    let services = cfg.services.build();
    assert_eq!(services.len(), 3);
    let kinds: Vec<ServiceKind> = services.iter().map(|s| s.kind()).collect();
    assert!(kinds.contains(&ServiceKind::Ingress));
    assert!(kinds.contains(&ServiceKind::Database));
    assert!(kinds.contains(&ServiceKind::Search));
    assert_eq!(
        services[0].to_string(),
        "ns=shop, name=storefront, url=https://shop.example.com/health"
    );
}

#[test]
fn the_builtin_local_config_is_complete() {
    let cfg = super::EnvConfig::local_default();
    assert_eq!(cfg.storage.backend, "MongoStorage");
    assert_eq!(cfg.storage.uri, "mongodb://localhost:27017");
    assert!(cfg.server.with_consolidation);
    assert!(!cfg.server.with_instance_lock);
    assert_eq!(cfg.monitoring.max_services, 15);
    assert_eq!(cfg.monitoring.check_every_seconds, 60);
    assert_eq!(cfg.monitoring.fast_retry_every_seconds, 5);
    assert!(cfg.services.is_empty());
}
