/*
 * Created on Fri Feb 16 2024
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

//! The per-kind probe implementations. Each probe maps whatever happened on
//! the wire to a plain `(Status, Option<Extra>)`: transport errors are not
//! errors of the daemon, they are a failing check with the exception text
//! recorded for diagnostics

use super::{Extra, ServiceSpec, Status};
use mongodb::{bson::doc, options::ClientOptions, Client as MongoClient};
use serde_json::{json, Value};
use std::time::Duration;

impl ServiceSpec {
    /// Run the probe for this spec once
    pub(super) async fn probe(&self) -> (Status, Option<Extra>) {
        match self {
            Self::HttpIngress {
                url,
                headers,
                timeout,
                ..
            } => probe_http(url, headers, *timeout).await,
            Self::Database { uri, timeout, .. } => probe_database(uri, *timeout).await,
            Self::Cluster {
                server,
                token,
                availability,
                timeout,
                ..
            } => probe_cluster(server, token.as_deref(), *availability, *timeout).await,
            Self::Search {
                url, auth, timeout, ..
            } => probe_search(url, auth.as_ref(), *timeout).await,
            #[cfg(test)]
            Self::Scripted { script, .. } => {
                let mut script = script.lock();
                if script.len() > 1 {
                    script.pop_front().unwrap_or((Status::Fail, None))
                } else {
                    script.front().cloned().unwrap_or((Status::Fail, None))
                }
            }
        }
    }
}

fn fail_with_exception(e: impl ToString) -> (Status, Option<Extra>) {
    let mut extra = Extra::new();
    extra.insert("exception".to_owned(), json!(e.to_string()));
    (Status::Fail, Some(extra))
}

/// HTTPS GET against the health URL; only a 200 counts as healthy. The
/// status code and body are recorded for diagnostics
async fn probe_http(
    url: &str,
    headers: &[(String, String)],
    timeout: Duration,
) -> (Status, Option<Extra>) {
    let attempt = async {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        let mut request = client.get(url);
        for (name, value) in headers {
            request = request.header(name.as_str(), value.as_str());
        }
        let response = request.send().await?;
        let code = response.status().as_u16();
        let text = response.text().await.unwrap_or_default();
        Ok::<_, reqwest::Error>((code, text))
    };
    match attempt.await {
        Ok((code, text)) => {
            let mut extra = Extra::new();
            extra.insert("status_code".to_owned(), json!(code));
            extra.insert("text".to_owned(), json!(text));
            let status = if code == 200 { Status::Ok } else { Status::Fail };
            (status, Some(extra))
        }
        Err(e) => fail_with_exception(e),
    }
}

/// Database connectivity check: connect and ping within the timeout
async fn probe_database(uri: &str, timeout: Duration) -> (Status, Option<Extra>) {
    let attempt = async {
        let mut options = ClientOptions::parse(uri).await?;
        options.server_selection_timeout = Some(timeout);
        options.connect_timeout = Some(timeout);
        let client = MongoClient::with_options(options)?;
        client
            .database("admin")
            .run_command(doc! { "ping": 1 }, None)
            .await?;
        Ok::<_, mongodb::error::Error>(())
    };
    match attempt.await {
        Ok(()) => (Status::Ok, None),
        Err(e) => fail_with_exception(e),
    }
}

/// List the cluster nodes and compare the share of nodes in an `Unknown`
/// condition against the required availability percentage
async fn probe_cluster(
    server: &str,
    token: Option<&str>,
    availability: u32,
    timeout: Duration,
) -> (Status, Option<Extra>) {
    let attempt = async {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        let url = format!("{}/api/v1/nodes", server.trim_end_matches('/'));
        let mut request = client.get(&url);
        if let Some(token) = token {
            request = request.bearer_auth(token);
        }
        let response = request.send().await?.error_for_status()?;
        response.json::<Value>().await
    };
    let nodes = match attempt.await {
        Ok(nodes) => nodes,
        Err(e) => return fail_with_exception(e),
    };
    let items = nodes["items"].as_array().map(Vec::as_slice).unwrap_or(&[]);
    let total = items.len() as u32;
    let unknown = items.iter().filter(|node| node_is_unknown(node)).count() as u32;
    if cluster_is_available(total, unknown, availability) {
        (Status::Ok, None)
    } else {
        let mut extra = Extra::new();
        extra.insert("ready".to_owned(), json!(total - unknown));
        extra.insert("unknown".to_owned(), json!(unknown));
        (Status::Fail, Some(extra))
    }
}

/// The availability rule: the share of nodes not in an `Unknown`
/// condition must reach the configured floor. The percentage is a real
/// number; flooring it would pass clusters that sit just under the floor
fn cluster_is_available(total: u32, unknown: u32, availability: u32) -> bool {
    total > 0 && 100.0 - (unknown as f64 * 100.0 / total as f64) >= availability as f64
}

fn node_is_unknown(node: &Value) -> bool {
    node["status"]["conditions"]
        .as_array()
        .map(|conditions| {
            conditions
                .iter()
                .any(|cond| cond["status"].as_str() == Some("Unknown"))
        })
        .unwrap_or(false)
}

/// Search-cluster ping: any successful HTTP response means reachable
async fn probe_search(
    url: &str,
    auth: Option<&(String, String)>,
    timeout: Duration,
) -> (Status, Option<Extra>) {
    let attempt = async {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        let mut request = client.get(url);
        if let Some((user, secret)) = auth {
            request = request.basic_auth(user, Some(secret));
        }
        let response = request.send().await?;
        Ok::<_, reqwest::Error>(response.status())
    };
    match attempt.await {
        Ok(code) if code.is_success() => (Status::Ok, None),
        Ok(code) => {
            let mut extra = Extra::new();
            extra.insert("status_code".to_owned(), json!(code.as_u16()));
            (Status::Fail, Some(extra))
        }
        Err(e) => fail_with_exception(e),
    }
}
