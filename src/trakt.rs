use std::future::Future;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use log::{debug, info, warn};
#[cfg(test)]
use mockall::automock;
use reqwest::{header::CONTENT_TYPE, Client, RequestBuilder, Response, StatusCode};
use serde::{Deserialize, Serialize};

use crate::backoff::BackoffPolicy;
use crate::config::TraktConfig;
use crate::credential::{CredentialProvider, OAuthEndpoint, TokenGrant};
use crate::dedup::Deletion;
use crate::error::ApiError;
use crate::watch_event::{MediaKind, WatchEvent};

/// 履歴取得時の1ページあたりの件数。
const PAGE_LIMIT: u32 = 100;

/// 視聴履歴を扱うためのtrait。
#[cfg_attr(test, automock)]
#[allow(async_fn_in_trait)]
pub trait HistoryRepository {
    /// `since`以降の視聴履歴を取得する。順序は保証しない。
    async fn list_recent(&self, since: DateTime<Utc>) -> Result<Vec<WatchEvent>, ApiError>;

    /// 視聴履歴を1件削除する。
    async fn delete(&self, id: u64) -> Result<Deletion, ApiError>;
}

/// Trakt APIの履歴レスポンスをデシリアライズするための構造体。
#[derive(Debug, Deserialize)]
struct TraktHistoryItem {
    id: u64,
    watched_at: DateTime<Utc>,
    #[serde(rename = "type")]
    kind: String,
    movie: Option<TraktMovie>,
    show: Option<TraktShow>,
    episode: Option<TraktEpisode>,
}

#[derive(Debug, Deserialize)]
struct TraktMovie {
    title: String,
    year: Option<i32>,
}

#[derive(Debug, Deserialize)]
struct TraktShow {
    title: String,
    year: Option<i32>,
}

#[derive(Debug, Deserialize)]
struct TraktEpisode {
    season: u32,
    number: u32,
    title: Option<String>,
}

impl TraktHistoryItem {
    /// `WatchEvent`に変換する。未対応の種類は`None`を返す。
    fn into_watch_event(self) -> Option<WatchEvent> {
        match (self.kind.as_str(), self.movie, self.show, self.episode) {
            ("movie", Some(movie), _, _) => Some(WatchEvent {
                id: self.id,
                media_kind: MediaKind::Movie,
                title: movie.title,
                episode_label: None,
                year: movie.year,
                watched_at: self.watched_at,
            }),
            ("episode", _, Some(show), Some(episode)) => {
                let code = format!("S{:02}E{:02}", episode.season, episode.number);
                let label = match episode.title {
                    Some(title) if !title.is_empty() => format!("{} - {}", code, title),
                    _ => code,
                };
                Some(WatchEvent {
                    id: self.id,
                    media_kind: MediaKind::Episode,
                    title: show.title,
                    episode_label: Some(label),
                    year: show.year,
                    watched_at: self.watched_at,
                })
            }
            (kind, ..) => {
                debug!("Skip unsupported history item {} of type {}", self.id, kind);
                None
            }
        }
    }
}

#[derive(Debug, Serialize)]
struct RemoveRequest {
    ids: Vec<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct RemoveResponse {
    #[serde(default)]
    not_found: RemoveNotFound,
}

#[derive(Debug, Default, Deserialize)]
struct RemoveNotFound {
    #[serde(default)]
    ids: Vec<u64>,
}

/// Trakt APIのヘッダーを付与する。
fn with_api_headers(request: RequestBuilder, client_id: &str) -> RequestBuilder {
    request
        .header(CONTENT_TYPE, "application/json")
        .header("trakt-api-version", "2")
        .header("trakt-api-key", client_id)
}

fn decode_error(err: reqwest::Error) -> ApiError {
    ApiError::Decode(err.to_string())
}

/// Trakt APIの視聴履歴と通信するためのクライアント。
///
/// # Examples
///
/// ```
/// let client = TraktClient::new(&config.trakt, &store, BackoffPolicy::default(), timeout)?;
/// let events = client.list_recent(since).await?;
/// ```
pub struct TraktClient<'a, C: CredentialProvider> {
    client: Client,
    api_url: String,
    client_id: String,
    credentials: &'a C,
    policy: BackoffPolicy,
}

impl<'a, C: CredentialProvider> TraktClient<'a, C> {
    /// 新しい`TraktClient`を返す。
    ///
    /// # Arguments
    ///
    /// * `config` - Trakt APIの設定
    /// * `credentials` - アクセストークンの提供元
    /// * `policy` - リトライの方針
    /// * `timeout` - 1リクエストあたりのタイムアウト
    pub fn new(
        config: &TraktConfig,
        credentials: &'a C,
        policy: BackoffPolicy,
        timeout: Duration,
    ) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .context("Failed to build Trakt HTTP client")?;

        Ok(Self {
            client,
            api_url: config.api_url.trim_end_matches('/').to_string(),
            client_id: config.client_id.clone(),
            credentials,
            policy,
        })
    }

    /// アクセストークンを付けてリクエストを送信する。
    ///
    /// 401を受け取った場合はトークンを一度だけ強制的に更新して再送信する。
    /// トークンを更新できない場合と、再送信でも401の場合は`ApiError::Auth`を返す。
    async fn send_authorized<F, Fut>(&self, call: F) -> Result<Response, ApiError>
    where
        F: Fn(String) -> Fut,
        Fut: Future<Output = reqwest::Result<Response>>,
    {
        let token = self.credentials.access_token().await?;
        match self.policy.send(|| call(token.clone())).await {
            Err(ApiError::Unauthorized) => {
                warn!("Trakt rejected the access token, forcing a refresh");
                let token = self.credentials.force_refresh().await.map_err(|err| {
                    if err.is_fatal() {
                        err
                    } else {
                        ApiError::Auth(format!("failed to refresh Trakt credential: {}", err))
                    }
                })?;
                self.policy
                    .send(|| call(token.clone()))
                    .await
                    .map_err(|err| match err {
                        ApiError::Unauthorized => ApiError::Auth(
                            "Trakt rejected the refreshed access token".to_string(),
                        ),
                        other => other,
                    })
            }
            other => other,
        }
    }
}

impl<'a, C: CredentialProvider> HistoryRepository for TraktClient<'a, C> {
    async fn list_recent(&self, since: DateTime<Utc>) -> Result<Vec<WatchEvent>, ApiError> {
        let url = format!("{}/sync/history", self.api_url);
        let start_at = since.to_rfc3339_opts(SecondsFormat::Secs, true);
        let mut events = Vec::new();
        let mut page: u32 = 1;

        loop {
            let response = self
                .send_authorized(|token| {
                    with_api_headers(self.client.get(&url), &self.client_id)
                        .bearer_auth(token)
                        .query(&[
                            ("start_at", start_at.clone()),
                            ("page", page.to_string()),
                            ("limit", PAGE_LIMIT.to_string()),
                        ])
                        .send()
                })
                .await?;
            let page_count = response
                .headers()
                .get("X-Pagination-Page-Count")
                .and_then(|value| value.to_str().ok())
                .and_then(|value| value.parse::<u32>().ok());
            let items = response
                .json::<Vec<TraktHistoryItem>>()
                .await
                .map_err(decode_error)?;
            debug!("Fetched {} Trakt history items on page {}", items.len(), page);
            if items.is_empty() {
                break;
            }
            events.extend(items.into_iter().filter_map(TraktHistoryItem::into_watch_event));

            if page_count.map_or(false, |count| page >= count) {
                break;
            }
            page += 1;
        }

        info!("Fetched {} Trakt history entries since {}", events.len(), start_at);
        Ok(events)
    }

    async fn delete(&self, id: u64) -> Result<Deletion, ApiError> {
        let url = format!("{}/sync/history/remove", self.api_url);
        let body = RemoveRequest { ids: vec![id] };
        let response = self
            .send_authorized(|token| {
                with_api_headers(self.client.post(&url), &self.client_id)
                    .bearer_auth(token)
                    .json(&body)
                    .send()
            })
            .await;

        let response = match response {
            Ok(response) => response,
            Err(ApiError::NotFound) => return Ok(Deletion::NotFound),
            Err(err) => return Err(err),
        };
        let removed = response
            .json::<RemoveResponse>()
            .await
            .map_err(decode_error)?;

        if removed.not_found.ids.contains(&id) {
            Ok(Deletion::NotFound)
        } else {
            Ok(Deletion::Deleted)
        }
    }
}

/// デバイス認可のレスポンス。
#[derive(Debug, Deserialize)]
struct DeviceCode {
    device_code: String,
    user_code: String,
    verification_url: String,
    expires_in: u64,
    interval: u64,
}

#[derive(Debug, Serialize)]
struct DeviceTokenRequest<'a> {
    code: &'a str,
    client_id: &'a str,
    client_secret: &'a str,
}

#[derive(Debug, Serialize)]
struct RefreshRequest<'a> {
    refresh_token: &'a str,
    client_id: &'a str,
    client_secret: &'a str,
    redirect_uri: &'a str,
    grant_type: &'a str,
}

/// TraktのOAuthエンドポイント。デバイス認可フローでトークンを取得する。
pub struct TraktOAuth {
    client: Client,
    api_url: String,
    client_id: String,
    client_secret: String,
    policy: BackoffPolicy,
}

impl TraktOAuth {
    /// 新しい`TraktOAuth`を返す。
    pub fn new(config: &TraktConfig, policy: BackoffPolicy, timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .context("Failed to build Trakt OAuth HTTP client")?;

        Ok(Self {
            client,
            api_url: config.api_url.trim_end_matches('/').to_string(),
            client_id: config.client_id.clone(),
            client_secret: config.client_secret.clone(),
            policy,
        })
    }

    async fn request_device_code(&self) -> Result<DeviceCode, ApiError> {
        let url = format!("{}/oauth/device/code", self.api_url);
        let body = serde_json::json!({ "client_id": self.client_id });
        self.policy
            .send(|| {
                with_api_headers(self.client.post(&url), &self.client_id)
                    .json(&body)
                    .send()
            })
            .await?
            .json::<DeviceCode>()
            .await
            .map_err(decode_error)
    }

    /// ユーザーが承認するまでトークンエンドポイントをポーリングする。
    async fn poll_device_token(&self, device: &DeviceCode) -> Result<TokenGrant, ApiError> {
        let url = format!("{}/oauth/device/token", self.api_url);
        let body = DeviceTokenRequest {
            code: &device.device_code,
            client_id: &self.client_id,
            client_secret: &self.client_secret,
        };
        let mut interval = Duration::from_secs(device.interval);
        let deadline = tokio::time::Instant::now() + Duration::from_secs(device.expires_in);

        while tokio::time::Instant::now() < deadline {
            tokio::time::sleep(interval).await;
            let response = with_api_headers(self.client.post(&url), &self.client_id)
                .json(&body)
                .send()
                .await;
            let response = match response {
                Ok(response) => response,
                Err(err) => {
                    warn!("Polling Trakt device token failed: {}", err);
                    continue;
                }
            };

            match response.status() {
                StatusCode::OK => {
                    return response.json::<TokenGrant>().await.map_err(decode_error);
                }
                StatusCode::BAD_REQUEST => debug!("Waiting for user authorization..."),
                StatusCode::TOO_MANY_REQUESTS => interval += Duration::from_secs(1),
                StatusCode::NOT_FOUND => return Err(ApiError::Auth("invalid device code".into())),
                StatusCode::CONFLICT => {
                    return Err(ApiError::Auth("device code already used".into()))
                }
                StatusCode::GONE => return Err(ApiError::Auth("device code expired".into())),
                StatusCode::IM_A_TEAPOT => {
                    return Err(ApiError::Auth("user denied authorization".into()))
                }
                status => {
                    return Err(ApiError::Auth(format!(
                        "device authorization failed with status {}",
                        status
                    )))
                }
            }
        }

        Err(ApiError::Auth("device code expired".into()))
    }
}

impl OAuthEndpoint for TraktOAuth {
    async fn authorize(&self) -> Result<TokenGrant, ApiError> {
        let device = self.request_device_code().await?;
        warn!(
            "Visit {} and enter the code: {}",
            device.verification_url, device.user_code
        );
        let grant = self.poll_device_token(&device).await?;
        info!("Trakt device authorization approved");
        Ok(grant)
    }

    async fn refresh(&self, refresh_token: String) -> Result<TokenGrant, ApiError> {
        let url = format!("{}/oauth/token", self.api_url);
        let body = RefreshRequest {
            refresh_token: &refresh_token,
            client_id: &self.client_id,
            client_secret: &self.client_secret,
            redirect_uri: "urn:ietf:wg:oauth:2.0:oob",
            grant_type: "refresh_token",
        };
        let response = self
            .policy
            .send(|| {
                with_api_headers(self.client.post(&url), &self.client_id)
                    .json(&body)
                    .send()
            })
            .await
            .map_err(|err| match err {
                ApiError::Validation { status: 400, .. } => ApiError::InvalidGrant,
                // クライアントの認証情報の誤り。リフレッシュトークンは破棄しない。
                ApiError::Unauthorized => {
                    ApiError::Auth("Trakt rejected the client credentials".to_string())
                }
                other => other,
            })?;

        response.json::<TokenGrant>().await.map_err(decode_error)
    }
}
