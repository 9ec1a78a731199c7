//! Home Assistant REST client: sensor history, state push, liveness ping.

use anyhow::{Context, Result};
use serde::Deserialize;
use serde_json::json;
use std::time::Duration;
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;
use tracing::debug;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
const PING_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, thiserror::Error)]
pub enum HassError {
    #[error("request to {url} failed: {source}")]
    Transport {
        url: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("{url} returned {status}: {body}")]
    Status {
        url: String,
        status: u16,
        body: String,
    },
    #[error("could not decode response from {url}: {source}")]
    Decode {
        url: String,
        #[source]
        source: reqwest::Error,
    },
}

/// One entry of an entity's state history.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct StateRecord {
    pub state: String,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub last_updated: Option<OffsetDateTime>,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub last_changed: Option<OffsetDateTime>,
}

impl StateRecord {
    pub fn timestamp(&self) -> Option<OffsetDateTime> {
        self.last_updated.or(self.last_changed)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pushed {
    Updated,
    Created,
}

/// The remote monitoring service as seen by the control pass.
pub trait Monitor {
    async fn history(
        &self,
        entity: &str,
        start: OffsetDateTime,
        end: OffsetDateTime,
    ) -> Result<Vec<StateRecord>, HassError>;

    async fn push_state(
        &self,
        entity: &str,
        state: &str,
        unit: Option<&str>,
    ) -> Result<Pushed, HassError>;

    /// Fire-and-forget liveness notification.
    async fn ping(&self);
}

pub struct HassClient {
    http: reqwest::Client,
    base_url: String,
    token: String,
    ping_url: Option<String>,
}

impl HassClient {
    pub fn new(base_url: &str, token: &str, ping_url: Option<String>) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .context("failed to build http client")?;
        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            token: token.to_string(),
            ping_url,
        })
    }

    async fn check(url: &str, resp: reqwest::Response) -> Result<reqwest::Response, HassError> {
        let status = resp.status();
        if status.is_success() {
            return Ok(resp);
        }
        let body = resp.text().await.unwrap_or_default();
        Err(HassError::Status {
            url: url.to_string(),
            status: status.as_u16(),
            body,
        })
    }
}

impl Monitor for HassClient {
    async fn history(
        &self,
        entity: &str,
        start: OffsetDateTime,
        end: OffsetDateTime,
    ) -> Result<Vec<StateRecord>, HassError> {
        let start = start.format(&Rfc3339).unwrap_or_default();
        let end = end.format(&Rfc3339).unwrap_or_default();
        let url = format!("{}/api/history/period/{start}", self.base_url);

        let resp = self
            .http
            .get(&url)
            .bearer_auth(&self.token)
            .query(&[("filter_entity_id", entity), ("end_time", end.as_str())])
            .send()
            .await
            .map_err(|source| HassError::Transport {
                url: url.clone(),
                source,
            })?;
        let resp = Self::check(&url, resp).await?;

        // One inner list per requested entity; we only ever ask for one.
        let mut lists: Vec<Vec<StateRecord>> =
            resp.json().await.map_err(|source| HassError::Decode {
                url: url.clone(),
                source,
            })?;
        debug!(entity, lists = lists.len(), "history fetched");
        Ok(if lists.is_empty() {
            Vec::new()
        } else {
            lists.swap_remove(0)
        })
    }

    async fn push_state(
        &self,
        entity: &str,
        state: &str,
        unit: Option<&str>,
    ) -> Result<Pushed, HassError> {
        let url = format!("{}/api/states/{entity}", self.base_url);
        let body = match unit {
            Some(u) => json!({ "state": state, "attributes": { "unit_of_measurement": u } }),
            None => json!({ "state": state }),
        };

        let resp = self
            .http
            .post(&url)
            .bearer_auth(&self.token)
            .json(&body)
            .send()
            .await
            .map_err(|source| HassError::Transport {
                url: url.clone(),
                source,
            })?;

        match resp.status().as_u16() {
            200 => Ok(Pushed::Updated),
            201 => Ok(Pushed::Created),
            status => Err(HassError::Status {
                url,
                status,
                body: resp.text().await.unwrap_or_default(),
            }),
        }
    }

    async fn ping(&self) {
        let Some(url) = &self.ping_url else {
            return;
        };
        let _ = self.http.get(url).timeout(PING_TIMEOUT).send().await;
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use axum::extract::{Path, Query, State};
    use axum::http::{HeaderMap, StatusCode};
    use axum::routing::{get, post};
    use axum::{Json, Router};
    use serde_json::Value;
    use std::collections::HashMap;
    use std::sync::{Arc, Mutex};
    use time::macros::datetime;
    use tokio::net::TcpListener;

    #[derive(Default)]
    struct Seen {
        auth: Vec<String>,
        queries: Vec<HashMap<String, String>>,
        pushes: Vec<(String, Value)>,
        pings: usize,
    }

    type Shared = Arc<Mutex<Seen>>;

    async fn history(
        State(seen): State<Shared>,
        headers: HeaderMap,
        Path(_start): Path<String>,
        Query(q): Query<HashMap<String, String>>,
    ) -> (StatusCode, Json<Value>) {
        let mut s = seen.lock().unwrap();
        if let Some(a) = headers.get("authorization") {
            s.auth.push(a.to_str().unwrap().to_string());
        }
        let entity = q.get("filter_entity_id").cloned().unwrap_or_default();
        s.queries.push(q);
        match entity.as_str() {
            "sensor.broken" => (StatusCode::INTERNAL_SERVER_ERROR, Json(json!("boom"))),
            "sensor.empty" => (StatusCode::OK, Json(json!([]))),
            _ => (
                StatusCode::OK,
                Json(json!([[
                    {"entity_id": entity, "state": "31", "last_updated": "2024-05-01T10:00:12.5+00:00"},
                    {"entity_id": entity, "state": "unavailable", "last_changed": "2024-05-01T10:05:00+00:00"}
                ]])),
            ),
        }
    }

    async fn push(
        State(seen): State<Shared>,
        Path(entity): Path<String>,
        Json(body): Json<Value>,
    ) -> StatusCode {
        let mut s = seen.lock().unwrap();
        let first = !s.pushes.iter().any(|(e, _)| e == &entity);
        s.pushes.push((entity.clone(), body));
        if entity == "input_number.readonly" {
            StatusCode::FORBIDDEN
        } else if first {
            StatusCode::CREATED
        } else {
            StatusCode::OK
        }
    }

    async fn ping(State(seen): State<Shared>) -> StatusCode {
        seen.lock().unwrap().pings += 1;
        StatusCode::OK
    }

    async fn serve() -> (String, Shared) {
        let seen: Shared = Arc::default();
        let app = Router::new()
            .route("/api/history/period/{start}", get(history))
            .route("/api/states/{entity}", post(push))
            .route("/ping", get(ping))
            .with_state(seen.clone());
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        (format!("http://{addr}"), seen)
    }

    const START: OffsetDateTime = datetime!(2024-04-28 10:00 UTC);
    const END: OffsetDateTime = datetime!(2024-05-01 10:00 UTC);

    #[tokio::test]
    async fn history_returns_first_entity_list() {
        let (url, seen) = serve().await;
        let c = HassClient::new(&url, "tok", None).unwrap();

        let recs = c.history("sensor.fern", START, END).await.unwrap();
        assert_eq!(recs.len(), 2);
        assert_eq!(recs[0].state, "31");
        assert_eq!(
            recs[0].timestamp(),
            Some(datetime!(2024-05-01 10:00:12.5 UTC))
        );
        // Falls back to last_changed when last_updated is absent.
        assert_eq!(recs[1].timestamp(), Some(datetime!(2024-05-01 10:05 UTC)));

        let s = seen.lock().unwrap();
        assert_eq!(s.auth, vec!["Bearer tok".to_string()]);
        assert_eq!(s.queries[0]["filter_entity_id"], "sensor.fern");
        assert_eq!(s.queries[0]["end_time"], "2024-05-01T10:00:00Z");
    }

    #[tokio::test]
    async fn history_empty_outer_list_is_no_data() {
        let (url, _) = serve().await;
        let c = HassClient::new(&url, "tok", None).unwrap();
        assert!(c.history("sensor.empty", START, END).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn history_non_success_is_status_error() {
        let (url, _) = serve().await;
        let c = HassClient::new(&url, "tok", None).unwrap();
        match c.history("sensor.broken", START, END).await {
            Err(HassError::Status { status, .. }) => assert_eq!(status, 500),
            other => panic!("expected status error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn push_distinguishes_created_and_updated() {
        let (url, seen) = serve().await;
        let c = HassClient::new(&format!("{url}/"), "tok", None).unwrap();

        let e = "input_number.fern_pump";
        assert_eq!(c.push_state(e, "12.5", Some("s")).await.unwrap(), Pushed::Created);
        assert_eq!(c.push_state(e, "13", Some("s")).await.unwrap(), Pushed::Updated);

        let s = seen.lock().unwrap();
        assert_eq!(s.pushes[0].1["state"], "12.5");
        assert_eq!(s.pushes[0].1["attributes"]["unit_of_measurement"], "s");
    }

    #[tokio::test]
    async fn push_other_status_is_error() {
        let (url, _) = serve().await;
        let c = HassClient::new(&url, "tok", None).unwrap();
        let err = c.push_state("input_number.readonly", "on", None).await.unwrap_err();
        assert!(matches!(err, HassError::Status { status: 403, .. }));
    }

    #[tokio::test]
    async fn ping_hits_url_and_ignores_failures() {
        let (url, seen) = serve().await;
        HassClient::new(&url, "tok", Some(format!("{url}/ping")))
            .unwrap()
            .ping()
            .await;
        assert_eq!(seen.lock().unwrap().pings, 1);

        // Unreachable ping target must not panic or error.
        HassClient::new(&url, "tok", Some("http://127.0.0.1:9/nope".into()))
            .unwrap()
            .ping()
            .await;
        // No ping url configured is a no-op.
        HassClient::new(&url, "tok", None).unwrap().ping().await;
    }
}
