use std::collections::BTreeSet;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use log::info;
#[cfg(test)]
use mockall::automock;
use reqwest::{header::CONTENT_TYPE, Client, RequestBuilder};
use serde::{Deserialize, Serialize};

use crate::backoff::BackoffPolicy;
use crate::config::TogglConfig;
use crate::dedup::Deletion;
use crate::error::ApiError;
use crate::time_entry::{TimeEntry, TimeEntryDraft};

/// 作成元としてTogglに記録する名前。
const CREATED_WITH: &str = "trakt2toggl";

/// time entryを扱うためのtrait。
#[cfg_attr(test, automock)]
#[allow(async_fn_in_trait)]
pub trait LedgerRepository {
    /// 指定された期間のtime entryを取得する。
    async fn list_range(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<TimeEntry>, ApiError>;

    /// time entryを作成する。
    async fn create(&self, draft: TimeEntryDraft) -> Result<TimeEntry, ApiError>;

    /// time entryを削除する。
    async fn delete(&self, id: u64) -> Result<Deletion, ApiError>;
}

/// Toggl APIのレスポンスをデシリアライズするための構造体。
#[derive(Debug, Deserialize)]
struct TogglTimeEntry {
    id: u64,
    description: Option<String>,
    project_id: Option<u64>,
    start: String,
    duration: i64,
    tags: Option<Vec<String>>,
}

impl TogglTimeEntry {
    fn into_time_entry(self) -> Result<TimeEntry, ApiError> {
        let start = DateTime::parse_from_rfc3339(&self.start)
            .map_err(|err| {
                ApiError::Decode(format!("invalid start {} of entry {}: {}", self.start, self.id, err))
            })?
            .to_utc();

        Ok(TimeEntry {
            id: self.id,
            description: self.description.unwrap_or_default(),
            start,
            duration_seconds: self.duration,
            tags: self.tags.unwrap_or_default().into_iter().collect(),
            project_id: self.project_id,
        })
    }
}

/// time entry作成時のリクエストボディ。
#[derive(Debug, Serialize)]
struct NewTogglTimeEntry<'a> {
    description: &'a str,
    start: String,
    duration: i64,
    tags: &'a BTreeSet<String>,
    project_id: u64,
    workspace_id: u64,
    created_with: &'a str,
}

/// Toggl APIと通信するためのクライアント。
///
/// # Examples
///
/// ```
/// let client = TogglClient::new(&config.toggl, BackoffPolicy::default(), timeout).unwrap();
/// let time_entries = client.list_range(start_at, end_at).await.unwrap();
/// ```
pub struct TogglClient {
    client: Client,
    api_url: String,
    api_token: String,
    workspace_id: u64,
    policy: BackoffPolicy,
}

impl TogglClient {
    /// 新しい`TogglClient`を返す。
    ///
    /// # Arguments
    ///
    /// * `config` - Toggl APIの設定
    /// * `policy` - リトライの方針
    /// * `timeout` - 1リクエストあたりのタイムアウト
    pub fn new(config: &TogglConfig, policy: BackoffPolicy, timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .context("Failed to build Toggl HTTP client")?;

        Ok(Self {
            client,
            api_url: config.api_url.trim_end_matches('/').to_string(),
            api_token: config.api_token.clone(),
            workspace_id: config.workspace_id,
            policy,
        })
    }

    /// 認証ヘッダーを付与する。
    fn authorized(&self, request: RequestBuilder) -> RequestBuilder {
        request
            .basic_auth(&self.api_token, Some("api_token"))
            .header(CONTENT_TYPE, "application/json")
    }

    /// リトライの方針に従って送信する。
    ///
    /// APIトークンは更新できないため、401は認証エラーとする。
    async fn send<F>(&self, request: F) -> Result<reqwest::Response, ApiError>
    where
        F: Fn() -> RequestBuilder,
    {
        self.policy
            .send(|| self.authorized(request()).send())
            .await
            .map_err(|err| match err {
                ApiError::Unauthorized => {
                    ApiError::Auth("Toggl rejected the API token".to_string())
                }
                other => other,
            })
    }
}

impl LedgerRepository for TogglClient {
    async fn list_range(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<TimeEntry>, ApiError> {
        let url = format!("{}/me/time_entries", self.api_url);
        let query = [
            ("start_date", start.to_rfc3339_opts(SecondsFormat::Secs, true)),
            ("end_date", end.to_rfc3339_opts(SecondsFormat::Secs, true)),
        ];
        let toggl_time_entries = self
            .send(|| self.client.get(&url).query(&query))
            .await?
            .json::<Vec<TogglTimeEntry>>()
            .await
            .map_err(|err| ApiError::Decode(err.to_string()))?;
        info!("Fetched {} Toggl time entries", toggl_time_entries.len());

        toggl_time_entries
            .into_iter()
            .map(TogglTimeEntry::into_time_entry)
            .collect()
    }

    async fn create(&self, draft: TimeEntryDraft) -> Result<TimeEntry, ApiError> {
        let url = format!(
            "{}/workspaces/{}/time_entries",
            self.api_url, draft.workspace_id
        );
        let body = NewTogglTimeEntry {
            description: &draft.description,
            start: draft.start.to_rfc3339_opts(SecondsFormat::Secs, true),
            duration: draft.duration_seconds,
            tags: &draft.tags,
            project_id: draft.project_id,
            workspace_id: draft.workspace_id,
            created_with: CREATED_WITH,
        };

        self.send(|| self.client.post(&url).json(&body))
            .await?
            .json::<TogglTimeEntry>()
            .await
            .map_err(|err| ApiError::Decode(err.to_string()))?
            .into_time_entry()
    }

    async fn delete(&self, id: u64) -> Result<Deletion, ApiError> {
        let url = format!(
            "{}/workspaces/{}/time_entries/{}",
            self.api_url, self.workspace_id, id
        );

        match self.send(|| self.client.delete(&url)).await {
            Ok(_) => Ok(Deletion::Deleted),
            Err(ApiError::NotFound) => Ok(Deletion::NotFound),
            Err(err) => Err(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;
    use std::time::Duration;

    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use chrono::{TimeZone, Utc};
    use mockito::Matcher;

    use super::{LedgerRepository, TogglClient};
    use crate::backoff::BackoffPolicy;
    use crate::config::TogglConfig;
    use crate::dedup::Deletion;
    use crate::error::ApiError;
    use crate::time_entry::TimeEntryDraft;

    fn client(url: String) -> TogglClient {
        let config = TogglConfig {
            api_token: "secret-token".to_string(),
            workspace_id: 456,
            project_id: 123,
            api_url: url,
        };
        let policy = BackoffPolicy::new(2, Duration::from_millis(1), Duration::from_millis(2));
        TogglClient::new(&config, policy, Duration::from_secs(5)).unwrap()
    }

    fn basic_auth() -> String {
        format!("Basic {}", STANDARD.encode("secret-token:api_token"))
    }

    fn draft() -> TimeEntryDraft {
        TimeEntryDraft {
            description: "🎞️ The Matrix (1999)".to_string(),
            start: Utc.with_ymd_and_hms(2025, 1, 1, 14, 0, 0).unwrap(),
            duration_seconds: 1800,
            tags: BTreeSet::from(["trakt".to_string()]),
            project_id: 123,
            workspace_id: 456,
        }
    }

    #[tokio::test]
    async fn test_list_range() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", "/me/time_entries")
            .match_query(Matcher::AllOf(vec![
                Matcher::UrlEncoded("start_date".into(), "2025-01-01T00:00:00Z".into()),
                Matcher::UrlEncoded("end_date".into(), "2025-01-08T00:00:00Z".into()),
            ]))
            .match_header("authorization", basic_auth().as_str())
            .with_status(200)
            .with_body(
                r#"[
                    {"id": 1, "workspace_id": 456, "project_id": 123, "description": "entry1",
                     "start": "2025-01-02T10:00:00+00:00", "stop": "2025-01-02T10:30:00+00:00",
                     "duration": 1800, "tags": ["trakt"]},
                    {"id": 2, "workspace_id": 456, "project_id": null, "description": null,
                     "start": "2025-01-03T10:00:00Z", "stop": null, "duration": -1, "tags": null}
                ]"#,
            )
            .create_async()
            .await;

        let entries = client(server.url())
            .list_range(
                Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap(),
                Utc.with_ymd_and_hms(2025, 1, 8, 0, 0, 0).unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].description, "entry1");
        assert_eq!(entries[0].project_id, Some(123));
        assert!(entries[0].tags.contains("trakt"));
        assert_eq!(entries[1].description, "");
        assert!(entries[1].tags.is_empty());
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_list_range_payment_required() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", "/me/time_entries")
            .match_query(Matcher::Any)
            .with_status(402)
            .expect(1)
            .create_async()
            .await;

        let result = client(server.url())
            .list_range(Utc::now(), Utc::now())
            .await;

        assert!(matches!(result, Err(ApiError::RateLimited)));
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_create() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/workspaces/456/time_entries")
            .match_header("authorization", basic_auth().as_str())
            .match_body(Matcher::Json(serde_json::json!({
                "description": "🎞️ The Matrix (1999)",
                "start": "2025-01-01T14:00:00Z",
                "duration": 1800,
                "tags": ["trakt"],
                "project_id": 123,
                "workspace_id": 456,
                "created_with": "trakt2toggl",
            })))
            .with_status(200)
            .with_body(
                r#"{"id": 99, "workspace_id": 456, "project_id": 123,
                    "description": "🎞️ The Matrix (1999)", "start": "2025-01-01T14:00:00Z",
                    "stop": "2025-01-01T14:30:00Z", "duration": 1800, "tags": ["trakt"]}"#,
            )
            .create_async()
            .await;

        let entry = client(server.url()).create(draft()).await.unwrap();

        assert_eq!(entry.id, 99);
        assert_eq!(entry.fingerprint(), draft().fingerprint());
        mock.assert_async().await;
    }

    /// バリデーションエラーはリトライせずに返す。
    #[tokio::test]
    async fn test_create_validation_error() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/workspaces/456/time_entries")
            .with_status(400)
            .with_body("\"project not found\"")
            .expect(1)
            .create_async()
            .await;

        let result = client(server.url()).create(draft()).await;

        assert!(matches!(result, Err(ApiError::Validation { status: 400, .. })));
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_delete() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("DELETE", "/workspaces/456/time_entries/1")
            .with_status(200)
            .create_async()
            .await;
        server
            .mock("DELETE", "/workspaces/456/time_entries/2")
            .with_status(404)
            .create_async()
            .await;
        let client = client(server.url());

        assert_eq!(client.delete(1).await.unwrap(), Deletion::Deleted);
        assert_eq!(client.delete(2).await.unwrap(), Deletion::NotFound);
    }

    /// APIトークンが無効な場合は認証エラーとする。
    #[tokio::test]
    async fn test_unauthorized_is_auth_error() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("DELETE", "/workspaces/456/time_entries/1")
            .with_status(401)
            .create_async()
            .await;

        let result = client(server.url()).delete(1).await;

        assert!(matches!(result, Err(ApiError::Auth(_))));
    }
}
