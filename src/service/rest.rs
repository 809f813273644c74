// SPDX-License-Identifier: MPL-2.0

use crate::runtime;
use crate::service::types::{Post, PostFilter, PostId, RelationshipKind, Table, TableChange, UserId};
use crate::service::{ChangeCallback, DataService, ServiceError, SubscriptionHandle};
use crate::state::ClientSettings;
use chrono::{DateTime, SecondsFormat, Utc};
use reqwest::{Method, RequestBuilder, Response};
use serde::Deserialize;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;
use url::Url;

/// PostgREST-style backend: `/auth/v1` for identity, `/rest/v1/<table>` for rows.
pub struct RestDataService {
    http: reqwest::Client,
    base_url: Url,
    api_key: String,
    access_token: Arc<RwLock<Option<String>>>,
    poll_interval: Duration,
}

impl RestDataService {
    pub fn new(settings: &ClientSettings) -> Result<Self, ServiceError> {
        let base_url = Url::parse(&format!("{}/", settings.service_url.trim_end_matches('/')))
            .map_err(|e| ServiceError::InvalidResponse(format!("invalid service url: {e}")))?;

        Ok(Self {
            http: reqwest::Client::new(),
            base_url,
            api_key: settings.api_key.clone(),
            access_token: Arc::new(RwLock::new(None)),
            poll_interval: Duration::from_secs(settings.poll_interval_secs.max(1)),
        })
    }

    /// Install (or clear) the bearer token obtained by the sign-in flow
    pub fn set_access_token(&self, token: Option<String>) {
        *self
            .access_token
            .write()
            .unwrap_or_else(PoisonError::into_inner) = token;
    }

    fn token(&self) -> Option<String> {
        self.access_token
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn endpoint(&self, path: &str) -> Result<Url, ServiceError> {
        self.base_url
            .join(path)
            .map_err(|e| ServiceError::InvalidResponse(format!("invalid endpoint {path}: {e}")))
    }

    fn table_url(&self, table: Table) -> Result<Url, ServiceError> {
        self.endpoint(&format!("rest/v1/{}", table.name()))
    }

    fn request(&self, method: Method, url: Url) -> RequestBuilder {
        authorize(
            self.http.request(method, url),
            &self.api_key,
            self.token().as_deref(),
        )
    }
}

fn authorize(builder: RequestBuilder, api_key: &str, token: Option<&str>) -> RequestBuilder {
    let bearer = token.unwrap_or(api_key);
    builder
        .header("apikey", api_key)
        .header("Authorization", format!("Bearer {bearer}"))
}

/// Turn non-2xx responses into `ServiceError::Status`
async fn check(response: Response) -> Result<Response, ServiceError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(ServiceError::Status {
        status: status.as_u16(),
        body,
    })
}

fn network(e: reqwest::Error) -> ServiceError {
    ServiceError::Network(e.to_string())
}

impl DataService for RestDataService {
    async fn current_actor(&self) -> Result<Option<UserId>, ServiceError> {
        if self.token().is_none() {
            return Ok(None);
        }

        let url = self.endpoint("auth/v1/user")?;
        let response = self
            .request(Method::GET, url)
            .send()
            .await
            .map_err(network)?;

        if response.status() == reqwest::StatusCode::UNAUTHORIZED {
            tracing::debug!("access token rejected, treating session as anonymous");
            return Ok(None);
        }

        let user: AuthUser = check(response)
            .await?
            .json()
            .await
            .map_err(|e| ServiceError::InvalidResponse(e.to_string()))?;

        user.into_user_id().map(Some)
    }

    async fn insert_relationship(
        &self,
        kind: RelationshipKind,
        actor: &UserId,
        target: &str,
    ) -> Result<(), ServiceError> {
        if self.token().is_none() {
            return Err(ServiceError::NotAuthenticated);
        }

        let url = self.table_url(kind.table())?;
        let row = serde_json::json!({
            kind.actor_column(): actor.as_str(),
            kind.target_column(): target,
        });

        let response = self
            .request(Method::POST, url)
            .header("Prefer", "return=minimal")
            .json(&row)
            .send()
            .await
            .map_err(network)?;
        check(response).await?;

        tracing::debug!(%kind, actor = %actor, target, "relationship inserted");
        Ok(())
    }

    async fn delete_relationship(
        &self,
        kind: RelationshipKind,
        actor: &UserId,
        target: &str,
    ) -> Result<(), ServiceError> {
        if kind == RelationshipKind::Block {
            return Err(ServiceError::Unsupported("blocks cannot be removed".into()));
        }
        if self.token().is_none() {
            return Err(ServiceError::NotAuthenticated);
        }

        let mut url = self.table_url(kind.table())?;
        url.query_pairs_mut()
            .append_pair(kind.actor_column(), &format!("eq.{actor}"))
            .append_pair(kind.target_column(), &format!("eq.{target}"));

        let response = self
            .request(Method::DELETE, url)
            .send()
            .await
            .map_err(network)?;
        check(response).await?;

        tracing::debug!(%kind, actor = %actor, target, "relationship deleted");
        Ok(())
    }

    async fn fetch_posts(&self, filter: PostFilter) -> Result<Vec<Post>, ServiceError> {
        let url = posts_query(self.table_url(Table::Posts)?, filter);
        let response = self
            .request(Method::GET, url)
            .send()
            .await
            .map_err(network)?;
        let body = check(response).await?.text().await.map_err(network)?;

        parse_posts(&body)
    }

    async fn fetch_membership(
        &self,
        actor: &UserId,
        kind: RelationshipKind,
    ) -> Result<HashSet<String>, ServiceError> {
        let mut url = self.table_url(kind.table())?;
        url.query_pairs_mut()
            .append_pair("select", kind.target_column())
            .append_pair(kind.actor_column(), &format!("eq.{actor}"));

        let response = self
            .request(Method::GET, url)
            .send()
            .await
            .map_err(network)?;
        let body = check(response).await?.text().await.map_err(network)?;

        parse_membership(&body, kind.target_column())
    }

    fn subscribe(
        &self,
        table: Table,
        on_change: ChangeCallback,
    ) -> Result<SubscriptionHandle, ServiceError> {
        let mut url = self.table_url(table)?;
        url.query_pairs_mut()
            .append_pair("select", "created_at")
            .append_pair("order", "created_at.desc")
            .append_pair("limit", "1");

        let poller = Poller {
            http: self.http.clone(),
            url,
            api_key: self.api_key.clone(),
            access_token: Arc::clone(&self.access_token),
            interval: self.poll_interval,
        };

        let task = runtime::spawn(poller.run(table, on_change));
        tracing::debug!(table = table.name(), "subscribed");
        Ok(SubscriptionHandle::new(table, move || task.abort()))
    }
}

/// Polls a table fingerprint and reports changes.
struct Poller {
    http: reqwest::Client,
    url: Url,
    api_key: String,
    access_token: Arc<RwLock<Option<String>>>,
    interval: Duration,
}

impl Poller {
    async fn run(self, table: Table, on_change: ChangeCallback) {
        let mut ticker = tokio::time::interval(self.interval);
        let mut last: Option<String> = None;

        loop {
            ticker.tick().await;
            match self.fingerprint().await {
                Ok(current) => {
                    if last.as_ref().is_some_and(|prev| *prev != current) {
                        tracing::debug!(table = table.name(), "table changed");
                        on_change(TableChange::coarse(table));
                    }
                    last = Some(current);
                }
                Err(e) => {
                    tracing::warn!(table = table.name(), error = %e, "realtime poll failed");
                }
            }
        }
    }

    async fn fingerprint(&self) -> Result<String, ServiceError> {
        let token = self
            .access_token
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        let request = authorize(
            self.http.get(self.url.clone()),
            &self.api_key,
            token.as_deref(),
        )
        .header("Prefer", "count=exact");

        let response = check(request.send().await.map_err(network)?).await?;
        let total = response
            .headers()
            .get("content-range")
            .and_then(|v| v.to_str().ok())
            .and_then(parse_content_range_total);
        let body = response.text().await.map_err(network)?;

        Ok(fingerprint_of(total, &body))
    }
}

fn fingerprint_of(total: Option<u64>, newest_body: &str) -> String {
    let total = total.map(|t| t.to_string()).unwrap_or_else(|| "?".into());
    format!("{total}:{}", newest_body.trim())
}

/// `Content-Range: 0-0/42` -> `Some(42)`
fn parse_content_range_total(header: &str) -> Option<u64> {
    header.rsplit_once('/')?.1.parse().ok()
}

fn posts_query(mut url: Url, filter: PostFilter) -> Url {
    {
        let mut query = url.query_pairs_mut();
        query
            .append_pair(
                "select",
                "id,author_id,created_at,likes(count),shares(count),replies(count)",
            )
            .append_pair("order", "created_at.desc");
        if let Some(start) = filter.window_start {
            query.append_pair(
                "created_at",
                &format!("gte.{}", start.to_rfc3339_opts(SecondsFormat::Millis, true)),
            );
        }
    }
    url
}

#[derive(Debug, Deserialize)]
struct AuthUser {
    id: String,
}

impl AuthUser {
    fn into_user_id(self) -> Result<UserId, ServiceError> {
        if self.id.trim().is_empty() {
            return Err(ServiceError::InvalidResponse("user without id".into()));
        }
        Ok(UserId(self.id))
    }
}

/// Aggregate shape returned for embedded `table(count)` selects
#[derive(Debug, Deserialize)]
struct CountRow {
    count: i64,
}

#[derive(Debug, Deserialize)]
struct PostRow {
    id: String,
    author_id: String,
    created_at: String,
    #[serde(default)]
    likes: Vec<CountRow>,
    #[serde(default)]
    shares: Vec<CountRow>,
    #[serde(default)]
    replies: Vec<CountRow>,
}

fn embedded_count(rows: &[CountRow], field: &str, post: &str) -> Result<u32, ServiceError> {
    let raw = rows.first().map(|r| r.count).unwrap_or(0);
    u32::try_from(raw).map_err(|_| {
        ServiceError::InvalidResponse(format!("post {post}: {field} count out of range: {raw}"))
    })
}

impl TryFrom<PostRow> for Post {
    type Error = ServiceError;

    fn try_from(row: PostRow) -> Result<Self, Self::Error> {
        if row.id.trim().is_empty() {
            return Err(ServiceError::InvalidResponse("post without id".into()));
        }
        if row.author_id.trim().is_empty() {
            return Err(ServiceError::InvalidResponse(format!(
                "post {} without author",
                row.id
            )));
        }

        let created_at = DateTime::parse_from_rfc3339(&row.created_at)
            .map_err(|e| {
                ServiceError::InvalidResponse(format!(
                    "post {}: bad created_at {:?}: {e}",
                    row.id, row.created_at
                ))
            })?
            .with_timezone(&Utc);

        Ok(Post {
            likes_count: embedded_count(&row.likes, "likes", &row.id)?,
            shares_count: embedded_count(&row.shares, "shares", &row.id)?,
            replies_count: embedded_count(&row.replies, "replies", &row.id)?,
            id: PostId(row.id),
            author_id: UserId(row.author_id),
            created_at,
        })
    }
}

fn parse_posts(body: &str) -> Result<Vec<Post>, ServiceError> {
    let rows: Vec<PostRow> = serde_json::from_str(body)
        .map_err(|e| ServiceError::InvalidResponse(format!("posts: {e}")))?;
    rows.into_iter().map(Post::try_from).collect()
}

fn parse_membership(body: &str, column: &str) -> Result<HashSet<String>, ServiceError> {
    let rows: Vec<HashMap<String, serde_json::Value>> = serde_json::from_str(body)
        .map_err(|e| ServiceError::InvalidResponse(format!("membership: {e}")))?;

    rows.into_iter()
        .map(|row| match row.get(column) {
            Some(serde_json::Value::String(id)) if !id.trim().is_empty() => Ok(id.clone()),
            other => Err(ServiceError::InvalidResponse(format!(
                "membership row has bad {column}: {other:?}"
            ))),
        })
        .collect()
}
