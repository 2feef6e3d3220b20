use std::cell::RefCell;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Duration, Utc};
use log::{info, warn};
#[cfg(test)]
use mockall::automock;
use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;

use crate::datetime;
use crate::error::ApiError;

/// 永続化するOAuthトークン。
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenSet {
    pub access_token: String,
    pub refresh_token: String,
    pub expires_at: DateTime<Utc>,
}

/// トークンエンドポイントのレスポンス。
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
pub struct TokenGrant {
    pub access_token: String,
    pub refresh_token: String,
    /// 有効期間(秒)。
    pub expires_in: i64,
}

impl TokenGrant {
    /// 現在時刻を基準に`TokenSet`へ変換する。
    fn into_token_set(self) -> TokenSet {
        TokenSet {
            access_token: self.access_token,
            refresh_token: self.refresh_token,
            expires_at: datetime::now() + Duration::seconds(self.expires_in),
        }
    }
}

/// OAuthの認可とトークン更新を行うエンドポイント。
#[cfg_attr(test, automock)]
#[allow(async_fn_in_trait)]
pub trait OAuthEndpoint {
    /// ユーザーの操作を伴う認可を行い、トークンを取得する。
    async fn authorize(&self) -> Result<TokenGrant, ApiError>;

    /// リフレッシュトークンを新しいトークンと交換する。
    ///
    /// リフレッシュトークンが無効な場合は`ApiError::InvalidGrant`を返す。
    async fn refresh(&self, refresh_token: String) -> Result<TokenGrant, ApiError>;
}

/// APIクライアントにアクセストークンを提供するためのtrait。
#[cfg_attr(test, automock)]
#[allow(async_fn_in_trait)]
pub trait CredentialProvider {
    /// 有効なアクセストークンを返す。期限が近い場合は更新してから返す。
    async fn access_token(&self) -> Result<String, ApiError>;

    /// 期限に関わらずトークンを更新し、新しいアクセストークンを返す。
    async fn force_refresh(&self) -> Result<String, ApiError>;
}

/// トークンをファイルに保存し、必要に応じて更新する。
///
/// # Examples
///
/// ```
/// let store = CredentialStore::new(path, oauth, Duration::minutes(60));
/// let token = store.get_valid_token().await?;
/// ```
pub struct CredentialStore<E: OAuthEndpoint> {
    path: PathBuf,
    endpoint: E,
    margin: Duration,
    cached: RefCell<Option<TokenSet>>,
}

impl<E: OAuthEndpoint> CredentialStore<E> {
    /// 新しい`CredentialStore`を返す。
    ///
    /// # Arguments
    ///
    /// * `path` - トークンを保存するファイル
    /// * `endpoint` - 認可とトークン更新を行うエンドポイント
    /// * `margin` - 有効期限のどれだけ前から更新対象とするか
    pub fn new(path: PathBuf, endpoint: E, margin: Duration) -> Self {
        Self {
            path,
            endpoint,
            margin,
            cached: RefCell::new(None),
        }
    }

    /// 有効なトークンを返す。
    ///
    /// - 保存されたトークンがない場合は認可を行い、結果を保存する。
    /// - 有効期限まで`margin`以内の場合は更新し、結果を保存する。
    /// - それ以外の場合は保存されたトークンをそのまま返す。
    pub async fn get_valid_token(&self) -> Result<TokenSet, ApiError> {
        let current = match self.current()? {
            Some(token) => token,
            None => {
                info!("No stored Trakt token found, starting authorization");
                return self.authorize().await;
            }
        };

        if datetime::now() >= current.expires_at - self.margin {
            info!(
                "Trakt token expires at {}, refreshing",
                current.expires_at.to_rfc3339()
            );
            return self.refresh(&current).await;
        }

        Ok(current)
    }

    /// 保存されたトークンを破棄して認可をやり直す。
    pub async fn reauthorize(&self) -> Result<TokenSet, ApiError> {
        self.discard()?;
        self.authorize().await
    }

    async fn authorize(&self) -> Result<TokenSet, ApiError> {
        let grant = self.endpoint.authorize().await?;
        let token = grant.into_token_set();
        self.store(&token)?;
        info!("Trakt authorization completed");
        Ok(token)
    }

    async fn refresh(&self, current: &TokenSet) -> Result<TokenSet, ApiError> {
        match self.endpoint.refresh(current.refresh_token.clone()).await {
            Ok(grant) => {
                let token = grant.into_token_set();
                self.store(&token)?;
                info!("Trakt token refreshed successfully");
                Ok(token)
            }
            Err(ApiError::InvalidGrant) => {
                warn!("Trakt refresh token was rejected, discarding stored credential");
                self.discard()?;
                Err(ApiError::Auth(
                    "refresh token rejected; run `trakt2toggl auth` to re-authorize".to_string(),
                ))
            }
            Err(err) => Err(err),
        }
    }

    /// メモリ上のトークンを返す。未読込の場合はファイルから読み込む。
    fn current(&self) -> Result<Option<TokenSet>, ApiError> {
        if let Some(token) = self.cached.borrow().as_ref() {
            return Ok(Some(token.clone()));
        }
        let loaded = load_token_file(&self.path)?;
        *self.cached.borrow_mut() = loaded.clone();
        Ok(loaded)
    }

    fn store(&self, token: &TokenSet) -> Result<(), ApiError> {
        write_token_file(&self.path, token)?;
        *self.cached.borrow_mut() = Some(token.clone());
        Ok(())
    }

    fn discard(&self) -> Result<(), ApiError> {
        *self.cached.borrow_mut() = None;
        match fs::remove_file(&self.path) {
            Err(err) if err.kind() != io::ErrorKind::NotFound => Err(err.into()),
            _ => Ok(()),
        }
    }
}

impl<E: OAuthEndpoint> CredentialProvider for CredentialStore<E> {
    async fn access_token(&self) -> Result<String, ApiError> {
        Ok(self.get_valid_token().await?.access_token)
    }

    async fn force_refresh(&self) -> Result<String, ApiError> {
        let current = self
            .current()?
            .ok_or_else(|| ApiError::Auth("no stored Trakt credential".to_string()))?;
        Ok(self.refresh(&current).await?.access_token)
    }
}

/// トークンファイルを読み込む。
///
/// ファイルが存在しない、空、または不正なJSONの場合は`None`を返す。
fn load_token_file(path: &Path) -> io::Result<Option<TokenSet>> {
    let content = match fs::read_to_string(path) {
        Ok(content) => content,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(err) => return Err(err),
    };
    if content.trim().is_empty() {
        return Ok(None);
    }
    match serde_json::from_str(&content) {
        Ok(token) => Ok(Some(token)),
        Err(err) => {
            warn!(
                "Invalid token file {}, will re-authenticate: {}",
                path.display(),
                err
            );
            Ok(None)
        }
    }
}

/// トークンファイルを書き込む。
///
/// 同じディレクトリの一時ファイルに書き込んでからrenameするため、途中で失敗しても既存のファイルは壊れない。
/// 一時ファイルは所有者のみ読み書きできる権限で作成される。
fn write_token_file(path: &Path, token: &TokenSet) -> io::Result<()> {
    let dir = match path.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => dir,
        _ => Path::new("."),
    };
    fs::create_dir_all(dir)?;

    let mut file = NamedTempFile::new_in(dir)?;
    serde_json::to_writer_pretty(&mut file, token)?;
    file.write_all(b"\n")?;
    file.as_file().sync_all()?;
    file.persist(path).map_err(|err| err.error)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::fs;

    use chrono::{Duration, TimeZone, Utc};
    use mockall::predicate::eq;

    use super::{
        CredentialProvider, CredentialStore, MockOAuthEndpoint, TokenGrant, TokenSet,
    };
    use crate::datetime::mock_datetime;
    use crate::error::ApiError;

    fn now() -> chrono::DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 1, 1, 12, 0, 0).unwrap()
    }

    fn stored_token(expires_in_minutes: i64) -> TokenSet {
        TokenSet {
            access_token: "old-access".to_string(),
            refresh_token: "old-refresh".to_string(),
            expires_at: now() + Duration::minutes(expires_in_minutes),
        }
    }

    fn grant() -> TokenGrant {
        TokenGrant {
            access_token: "new-access".to_string(),
            refresh_token: "new-refresh".to_string(),
            expires_in: 7 * 24 * 3600,
        }
    }

    fn write_token(path: &std::path::Path, token: &TokenSet) {
        fs::write(path, serde_json::to_string(token).unwrap()).unwrap();
    }

    /// 有効期限まで余裕がある場合は更新しない。
    #[tokio::test]
    async fn test_get_valid_token_beyond_margin() {
        mock_datetime::set_mock_time(now());
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tokens.json");
        write_token(&path, &stored_token(61));
        let mut endpoint = MockOAuthEndpoint::new();
        endpoint.expect_refresh().times(0);
        endpoint.expect_authorize().times(0);

        let store = CredentialStore::new(path, endpoint, Duration::minutes(60));
        let token = store.get_valid_token().await.unwrap();

        assert_eq!(token, stored_token(61));
    }

    /// 有効期限まで`margin`以内の場合は1回だけ更新し、保存する。
    #[tokio::test]
    async fn test_get_valid_token_within_margin_refreshes_once() {
        mock_datetime::set_mock_time(now());
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tokens.json");
        write_token(&path, &stored_token(30));
        let mut endpoint = MockOAuthEndpoint::new();
        endpoint
            .expect_refresh()
            .with(eq("old-refresh".to_string()))
            .times(1)
            .returning(|_| Ok(grant()));

        let store = CredentialStore::new(path.clone(), endpoint, Duration::minutes(60));
        let token = store.get_valid_token().await.unwrap();
        let again = store.get_valid_token().await.unwrap();

        assert_eq!(token.access_token, "new-access");
        assert!(token.expires_at > stored_token(30).expires_at);
        assert_eq!(again, token);
        let persisted: TokenSet =
            serde_json::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(persisted, token);
    }

    /// 保存されたトークンがない場合は認可を行い保存する。
    #[tokio::test]
    async fn test_get_valid_token_without_stored_token_authorizes() {
        mock_datetime::set_mock_time(now());
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("tokens.json");
        let mut endpoint = MockOAuthEndpoint::new();
        endpoint
            .expect_authorize()
            .times(1)
            .returning(|| Ok(grant()));

        let store = CredentialStore::new(path.clone(), endpoint, Duration::minutes(60));
        let token = store.get_valid_token().await.unwrap();

        assert_eq!(token.refresh_token, "new-refresh");
        assert_eq!(token.expires_at, now() + Duration::days(7));
        assert!(path.exists());
    }

    /// 不正なトークンファイルは存在しないものとして扱う。
    #[tokio::test]
    async fn test_get_valid_token_with_corrupt_file_authorizes() {
        mock_datetime::set_mock_time(now());
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tokens.json");
        fs::write(&path, "{not json").unwrap();
        let mut endpoint = MockOAuthEndpoint::new();
        endpoint
            .expect_authorize()
            .times(1)
            .returning(|| Ok(grant()));

        let store = CredentialStore::new(path, endpoint, Duration::minutes(60));

        assert!(store.get_valid_token().await.is_ok());
    }

    /// 認可に失敗した場合はエラーを返し、何も保存しない。
    #[tokio::test]
    async fn test_get_valid_token_authorization_failure() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tokens.json");
        let mut endpoint = MockOAuthEndpoint::new();
        endpoint
            .expect_authorize()
            .times(1)
            .returning(|| Err(ApiError::Auth("user denied access".to_string())));

        let store = CredentialStore::new(path.clone(), endpoint, Duration::minutes(60));
        let result = store.get_valid_token().await;

        assert!(matches!(result, Err(ApiError::Auth(_))));
        assert!(!path.exists());
    }

    /// リフレッシュトークンが無効な場合は保存されたトークンを削除する。
    #[tokio::test]
    async fn test_refresh_invalid_grant_discards_token() {
        mock_datetime::set_mock_time(now());
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tokens.json");
        write_token(&path, &stored_token(-5));
        let mut endpoint = MockOAuthEndpoint::new();
        endpoint
            .expect_refresh()
            .times(1)
            .returning(|_| Err(ApiError::InvalidGrant));

        let store = CredentialStore::new(path.clone(), endpoint, Duration::minutes(60));
        let result = store.get_valid_token().await;

        assert!(matches!(result, Err(ApiError::Auth(_))));
        assert!(!path.exists());
    }

    /// 一時的なエラーで更新に失敗した場合は保存されたトークンを残す。
    #[tokio::test]
    async fn test_refresh_transient_failure_keeps_token() {
        mock_datetime::set_mock_time(now());
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tokens.json");
        write_token(&path, &stored_token(10));
        let mut endpoint = MockOAuthEndpoint::new();
        endpoint.expect_refresh().times(1).returning(|_| {
            Err(ApiError::Transient {
                attempts: 5,
                message: "server error 503".to_string(),
            })
        });

        let store = CredentialStore::new(path.clone(), endpoint, Duration::minutes(60));
        let result = store.get_valid_token().await;

        assert!(matches!(result, Err(ApiError::Transient { .. })));
        assert!(path.exists());
    }

    #[tokio::test]
    async fn test_force_refresh_ignores_expiry() {
        mock_datetime::set_mock_time(now());
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tokens.json");
        write_token(&path, &stored_token(600));
        let mut endpoint = MockOAuthEndpoint::new();
        endpoint
            .expect_refresh()
            .times(1)
            .returning(|_| Ok(grant()));

        let store = CredentialStore::new(path, endpoint, Duration::minutes(60));

        assert_eq!(store.force_refresh().await.unwrap(), "new-access");
        assert_eq!(store.access_token().await.unwrap(), "new-access");
    }
}
