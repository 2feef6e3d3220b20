use std::future::Future;
use std::time::Duration;

use log::warn;
use reqwest::{header::RETRY_AFTER, Response};

use crate::error::ApiError;

/// 失敗したリクエストの内容。
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Failure {
    /// 接続エラーやタイムアウト。
    Network(String),
    /// 成功以外のステータスコード。
    Status {
        status: u16,
        retry_after: Option<Duration>,
        body: String,
    },
}

impl Failure {
    /// レスポンスから`Failure`を作成する。
    async fn from_response(response: Response) -> Self {
        let status = response.status().as_u16();
        let retry_after = response
            .headers()
            .get(RETRY_AFTER)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.trim().parse::<u64>().ok())
            .map(Duration::from_secs);
        let body = response.text().await.unwrap_or_default();

        Failure::Status {
            status,
            retry_after,
            body,
        }
    }
}

/// 失敗したリクエストをどう扱うかの判定結果。
#[derive(Debug)]
pub enum Decision {
    /// 指定時間待ってから再試行する。
    Retry(Duration),
    /// 認証情報を更新してから一度だけ再試行する。
    RefreshCredential,
    /// 現在のステップをスキップする。
    SkipStep,
    /// 再試行せずに呼び出し元へエラーを返す。
    Fatal(ApiError),
}

/// リトライとバックオフの方針。
#[derive(Debug, Clone)]
pub struct BackoffPolicy {
    max_attempts: u32,
    base_delay: Duration,
    max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self::new(5, Duration::from_secs(1), Duration::from_secs(60))
    }
}

impl BackoffPolicy {
    /// 新しい`BackoffPolicy`を返す。
    ///
    /// # Arguments
    ///
    /// * `max_attempts` - 最初の呼び出しを含めた最大試行回数
    /// * `base_delay` - 1回目のリトライまでの待ち時間。以降は倍々で増える
    /// * `max_delay` - 待ち時間の上限
    pub fn new(max_attempts: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay,
            max_delay,
        }
    }

    /// `attempt`回目の失敗後に待つ時間を返す。
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }

    /// 失敗内容と試行回数から次の動作を決める。
    pub fn decide(&self, attempt: u32, failure: &Failure) -> Decision {
        match failure {
            Failure::Network(message) => self.retry_or_exhaust(attempt, None, message.clone()),
            Failure::Status {
                status,
                retry_after,
                body,
            } => match *status {
                401 => Decision::RefreshCredential,
                402 => Decision::SkipStep,
                404 => Decision::Fatal(ApiError::NotFound),
                429 => self.retry_or_exhaust(
                    attempt,
                    *retry_after,
                    "rate limited (429)".to_string(),
                ),
                s if s >= 500 => self.retry_or_exhaust(attempt, None, format!("server error {}", s)),
                s => Decision::Fatal(ApiError::Validation {
                    status: s,
                    body: body.clone(),
                }),
            },
        }
    }

    fn retry_or_exhaust(&self, attempt: u32, hint: Option<Duration>, message: String) -> Decision {
        if attempt >= self.max_attempts {
            return Decision::Fatal(ApiError::Transient {
                attempts: attempt,
                message,
            });
        }
        let delay = hint
            .map(|hint| hint.min(self.max_delay))
            .unwrap_or_else(|| self.delay_for(attempt));
        Decision::Retry(delay)
    }

    /// リクエストを送信し、方針に従ってリトライする。
    ///
    /// 401は`ApiError::Unauthorized`、402は`ApiError::RateLimited`として即座に返す。
    ///
    /// # Arguments
    ///
    /// * `call` - リクエストを送信するクロージャ。リトライの度に呼び出される
    pub async fn send<F, Fut>(&self, mut call: F) -> Result<Response, ApiError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = reqwest::Result<Response>>,
    {
        let mut attempt = 1;
        loop {
            let failure = match call().await {
                Ok(response) if response.status().is_success() => return Ok(response),
                Ok(response) => Failure::from_response(response).await,
                Err(err) => Failure::Network(err.to_string()),
            };

            match self.decide(attempt, &failure) {
                Decision::Retry(delay) => {
                    warn!(
                        "Request failed (attempt {}/{}): {:?}. Retrying in {:?}",
                        attempt, self.max_attempts, failure, delay
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Decision::RefreshCredential => return Err(ApiError::Unauthorized),
                Decision::SkipStep => return Err(ApiError::RateLimited),
                Decision::Fatal(err) => return Err(err),
            }
        }
    }
}
