//! REST remote speaking the JSON tree protocol.
//!
//! `PUT`/`DELETE`/`GET {base}/{path}.json`, optional `auth` query token.
//! Subscriptions poll the collection with `orderBy="updatedAt"&startAt=N`
//! for added/changed children and with `shallow=true` to notice removals.

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{RequestBuilder, Response, StatusCode};
use serde::Deserialize;
use serde_json::{Map, Value};
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;

use super::{
    RangeFilter, RemoteError, RemoteEvent, RemotePath, RemoteResult, RemoteStore, Subscription,
};
use crate::util::{http_base_url, non_blank, snippet};

const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(2);
const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(15);
const SUBSCRIPTION_BUFFER: usize = 256;

/// Connection settings for [`RestRemote`]
#[derive(Clone, PartialEq, Eq)]
pub struct RestRemoteConfig {
    pub base_url: String,
    pub auth: Option<String>,
    pub poll_interval: Duration,
    pub request_timeout: Duration,
}

impl RestRemoteConfig {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            auth: None,
            poll_interval: DEFAULT_POLL_INTERVAL,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
        }
    }

    #[must_use]
    pub fn with_auth(mut self, auth: Option<String>) -> Self {
        self.auth = non_blank(auth);
        self
    }

    #[must_use]
    pub const fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }
}

impl std::fmt::Debug for RestRemoteConfig {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("RestRemoteConfig")
            .field("base_url", &self.base_url)
            .field("auth", &self.auth.as_ref().map(|_| "[REDACTED]"))
            .field("poll_interval", &self.poll_interval)
            .field("request_timeout", &self.request_timeout)
            .finish()
    }
}

/// HTTP client for a JSON tree backend
#[derive(Clone)]
pub struct RestRemote {
    base_url: String,
    auth: Option<String>,
    poll_interval: Duration,
    client: reqwest::Client,
}

impl RestRemote {
    pub fn new(config: RestRemoteConfig) -> RemoteResult<Self> {
        let base_url = normalize_base_url(config.base_url)?;
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()
            .map_err(|error| RemoteError::InvalidConfiguration(error.to_string()))?;

        Ok(Self {
            base_url,
            auth: config.auth,
            poll_interval: config.poll_interval,
            client,
        })
    }

    fn url(&self, path: &RemotePath) -> String {
        format!("{}/{path}.json", self.base_url)
    }

    fn authorize(&self, request: RequestBuilder) -> RequestBuilder {
        match &self.auth {
            Some(auth) => request.query(&[("auth", auth)]),
            None => request,
        }
    }

    async fn send(&self, request: RequestBuilder) -> RemoteResult<Response> {
        let response = self
            .authorize(request)
            .send()
            .await
            .map_err(classify_transport_error)?;

        if response.status().is_success() {
            Ok(response)
        } else {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            Err(classify_status(status, &body))
        }
    }

    async fn read_json(&self, request: RequestBuilder) -> RemoteResult<Value> {
        let body = self
            .send(request)
            .await?
            .text()
            .await
            .map_err(classify_transport_error)?;
        if body.trim().is_empty() {
            return Ok(Value::Null);
        }
        Ok(serde_json::from_str(&body)?)
    }

    /// Children of `collection` passing `filter`
    async fn fetch_since(
        &self,
        collection: &RemotePath,
        filter: &RangeFilter,
    ) -> RemoteResult<Map<String, Value>> {
        let order_by = format!("\"{}\"", filter.field);
        let request = self.client.get(self.url(collection)).query(&[
            ("orderBy", order_by),
            ("startAt", filter.start_at.to_string()),
        ]);

        match self.read_json(request).await? {
            Value::Object(children) => Ok(children),
            Value::Null => Ok(Map::new()),
            other => Err(RemoteError::Api(format!(
                "expected an object under {collection}, got {}",
                snippet(&other.to_string())
            ))),
        }
    }

    async fn shallow_keys(&self, path: &RemotePath) -> RemoteResult<HashSet<String>> {
        let request = self
            .client
            .get(self.url(path))
            .query(&[("shallow", "true")]);

        Ok(match self.read_json(request).await? {
            Value::Object(children) => children.into_iter().map(|(key, _)| key).collect(),
            _ => HashSet::new(),
        })
    }
}

#[async_trait]
impl RemoteStore for RestRemote {
    async fn set(&self, path: &RemotePath, value: &Value) -> RemoteResult<()> {
        self.send(self.client.put(self.url(path)).json(value))
            .await?;
        Ok(())
    }

    async fn remove(&self, path: &RemotePath) -> RemoteResult<()> {
        self.send(self.client.delete(self.url(path))).await?;
        Ok(())
    }

    async fn get(&self, path: &RemotePath) -> RemoteResult<Option<Value>> {
        Ok(match self.read_json(self.client.get(self.url(path))).await? {
            Value::Null => None,
            value => Some(value),
        })
    }

    async fn subscribe(
        &self,
        collection: &str,
        filter: RangeFilter,
    ) -> RemoteResult<Subscription> {
        let path = RemotePath::collection(collection)?;
        let mut poller = Poller::new(self.clone(), path, filter);

        // First poll happens here so an unreachable remote fails the call
        let initial = poller.poll().await?;

        let (tx, rx) = mpsc::channel(SUBSCRIPTION_BUFFER);
        let poll_interval = self.poll_interval;
        let task = tokio::spawn(async move {
            for event in initial {
                if tx.send(event).await.is_err() {
                    return;
                }
            }

            let mut ticker = tokio::time::interval(poll_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker.tick().await;

            loop {
                ticker.tick().await;
                match poller.poll().await {
                    Ok(events) => {
                        for event in events {
                            if tx.send(event).await.is_err() {
                                return;
                            }
                        }
                    }
                    Err(error) if error.is_connectivity() => {
                        tracing::debug!("Polling {} skipped: {error}", poller.path);
                    }
                    Err(error) => {
                        tracing::warn!("Polling {} failed: {error}", poller.path);
                    }
                }
            }
        });

        Ok(Subscription::with_task(rx, task))
    }

    async fn child_keys(&self, path: &RemotePath) -> RemoteResult<HashSet<String>> {
        self.shallow_keys(path).await
    }
}

/// Turns successive polls of one collection into child events
struct Poller {
    remote: RestRemote,
    path: RemotePath,
    filter: RangeFilter,
    seen: HashMap<String, Value>,
    keys: Option<HashSet<String>>,
}

impl Poller {
    fn new(remote: RestRemote, path: RemotePath, filter: RangeFilter) -> Self {
        Self {
            remote,
            path,
            filter,
            seen: HashMap::new(),
            keys: None,
        }
    }

    async fn poll(&mut self) -> RemoteResult<Vec<RemoteEvent>> {
        let keys = self.remote.shallow_keys(&self.path).await?;
        let children = self.remote.fetch_since(&self.path, &self.filter).await?;
        let mut events = Vec::new();

        for (key, value) in self.filter.select(children) {
            if self.seen.get(&key) == Some(&value) {
                continue;
            }

            let known = self.seen.contains_key(&key)
                || self.keys.as_ref().is_some_and(|previous| previous.contains(&key));
            if let Some(updated_at) = value.get(&self.filter.field).and_then(Value::as_i64) {
                self.filter.start_at = self.filter.start_at.max(updated_at);
            }
            self.seen.insert(key.clone(), value.clone());

            events.push(if known {
                RemoteEvent::Changed { key, value }
            } else {
                RemoteEvent::Added { key, value }
            });
        }

        if let Some(previous) = &self.keys {
            let mut removed: Vec<_> = previous.difference(&keys).cloned().collect();
            removed.sort();
            for key in removed {
                self.seen.remove(&key);
                events.push(RemoteEvent::Removed { key });
            }
        }
        self.keys = Some(keys);

        // Only children at the new lower bound can come back unchanged
        let filter = &self.filter;
        self.seen.retain(|_, value| filter.matches(value));

        Ok(events)
    }
}

#[derive(Debug, Deserialize)]
struct ApiErrorBody {
    error: Option<String>,
    message: Option<String>,
}

fn parse_api_error(status: StatusCode, body: &str) -> String {
    if let Ok(payload) = serde_json::from_str::<ApiErrorBody>(body) {
        if let Some(message) = payload.error.or(payload.message) {
            return format!("{} ({})", message.trim(), status.as_u16());
        }
    }

    let trimmed = snippet(body);
    if trimmed.is_empty() {
        format!("HTTP {}", status.as_u16())
    } else {
        format!("{trimmed} ({})", status.as_u16())
    }
}

fn classify_status(status: StatusCode, body: &str) -> RemoteError {
    let message = parse_api_error(status, body);
    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => RemoteError::PermissionDenied(message),
        StatusCode::TOO_MANY_REQUESTS => RemoteError::Throttled(message),
        StatusCode::BAD_GATEWAY | StatusCode::SERVICE_UNAVAILABLE | StatusCode::GATEWAY_TIMEOUT => {
            RemoteError::Connectivity(message)
        }
        _ => RemoteError::Api(message),
    }
}

fn classify_transport_error(error: reqwest::Error) -> RemoteError {
    if error.is_connect() || error.is_timeout() || error.is_request() {
        RemoteError::Connectivity(error.to_string())
    } else {
        RemoteError::Api(error.to_string())
    }
}

fn normalize_base_url(raw: String) -> RemoteResult<String> {
    let base_url = non_blank(Some(raw)).ok_or_else(|| {
        RemoteError::InvalidConfiguration("remote URL must not be empty".to_string())
    })?;
    http_base_url(&base_url).ok_or_else(|| {
        RemoteError::InvalidConfiguration("remote URL must include http:// or https://".to_string())
    })
}
