use anyhow::{Context, Result};
use log::info;

use crate::credential::{CredentialStore, OAuthEndpoint, TokenSet};

/// Traktの認可をやり直すためのサブコマンド。
#[derive(Debug, clap::Args)]
pub struct AuthArgs {}

pub struct AuthCommand<'a, E: OAuthEndpoint> {
    store: &'a CredentialStore<E>,
}

impl<'a, E: OAuthEndpoint> AuthCommand<'a, E> {
    /// 新しい`AuthCommand`を返す。
    pub fn new(store: &'a CredentialStore<E>) -> Self {
        Self { store }
    }

    /// `auth`サブコマンドの処理を行う。
    ///
    /// 保存されたトークンを破棄し、デバイス認可フローで新しいトークンを取得して保存する。
    pub async fn run(&self, _args: AuthArgs) -> Result<TokenSet> {
        let token = self
            .store
            .reauthorize()
            .await
            .context("Failed to authorize with Trakt")?;
        info!(
            "Trakt token saved, expires at {}",
            token.expires_at.to_rfc3339()
        );

        Ok(token)
    }
}

#[cfg(test)]
mod tests {
    use std::fs;

    use chrono::{Duration, TimeZone, Utc};

    use super::{AuthArgs, AuthCommand};
    use crate::credential::{CredentialStore, MockOAuthEndpoint, TokenGrant, TokenSet};
    use crate::datetime::mock_datetime;
    use crate::error::ApiError;

    /// 有効なトークンが保存されていても認可をやり直す。
    #[tokio::test]
    async fn test_auth_command_replaces_stored_token() {
        let now = Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap();
        mock_datetime::set_mock_time(now);
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tokens.json");
        let stored = TokenSet {
            access_token: "old-access".to_string(),
            refresh_token: "old-refresh".to_string(),
            expires_at: now + Duration::days(30),
        };
        fs::write(&path, serde_json::to_string(&stored).unwrap()).unwrap();
        let mut endpoint = MockOAuthEndpoint::new();
        endpoint.expect_authorize().times(1).returning(|| {
            Ok(TokenGrant {
                access_token: "new-access".to_string(),
                refresh_token: "new-refresh".to_string(),
                expires_in: 3600,
            })
        });
        let store = CredentialStore::new(path.clone(), endpoint, Duration::minutes(60));

        let command = AuthCommand::new(&store);
        let token = command.run(AuthArgs {}).await.unwrap();

        assert_eq!(token.access_token, "new-access");
        assert_eq!(token.expires_at, now + Duration::hours(1));
        let persisted: TokenSet =
            serde_json::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(persisted, token);
    }

    #[tokio::test]
    async fn test_auth_command_denied() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tokens.json");
        let mut endpoint = MockOAuthEndpoint::new();
        endpoint
            .expect_authorize()
            .returning(|| Err(ApiError::Auth("access denied".to_string())));
        let store = CredentialStore::new(path.clone(), endpoint, Duration::minutes(60));

        let command = AuthCommand::new(&store);
        let result = command.run(AuthArgs {}).await;

        assert!(result.is_err());
        assert!(!path.exists());
    }
}
