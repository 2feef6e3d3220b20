use std::fmt;

use thiserror::Error;

/// 外部APIとの通信で発生するエラー。
#[derive(Debug, Error)]
pub enum ApiError {
    /// 認証に失敗した。実行を継続できない。
    #[error("authentication failed: {0}")]
    Auth(String),

    /// リフレッシュトークンが無効になった。
    #[error("refresh token was rejected (invalid grant)")]
    InvalidGrant,

    /// 401を受け取った。呼び出し元で一度だけトークンを更新して再試行する。
    #[error("request was unauthorized (401)")]
    Unauthorized,

    /// リトライ回数を使い切った。
    #[error("transient failure after {attempts} attempts: {message}")]
    Transient { attempts: u32, message: String },

    /// 402 (quota/payment required)。リトライしない。
    #[error("quota exhausted (402)")]
    RateLimited,

    /// 401/402/429以外の4xx。
    #[error("request rejected with status {status}: {body}")]
    Validation { status: u16, body: String },

    #[error("resource not found (404)")]
    NotFound,

    /// レスポンスを解釈できなかった。
    #[error("unexpected response: {0}")]
    Decode(String),

    /// トークンファイルの読み書きに失敗した。
    #[error("token store error: {0}")]
    TokenStore(#[from] std::io::Error),
}

impl ApiError {
    /// 以降のステップに関わらず実行を中断すべきエラーかどうかを返す。
    pub fn is_fatal(&self) -> bool {
        matches!(self, ApiError::Auth(_) | ApiError::InvalidGrant)
    }
}

/// 同期処理の各ステップ。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SyncStep {
    AcquireCredential,
    DedupeHistory,
    DedupeLedger,
    TranslateAndSync,
}

impl fmt::Display for SyncStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SyncStep::AcquireCredential => "acquire credential",
            SyncStep::DedupeHistory => "dedupe history",
            SyncStep::DedupeLedger => "dedupe ledger",
            SyncStep::TranslateAndSync => "translate and sync",
        };
        f.write_str(name)
    }
}

/// 同期処理を中断したエラー。失敗したステップを保持する。
#[derive(Debug, Error)]
#[error("sync aborted during {step}: {source}")]
pub struct SyncError {
    pub step: SyncStep,
    #[source]
    pub source: ApiError,
}

impl SyncError {
    pub fn new(step: SyncStep, source: ApiError) -> Self {
        Self { step, source }
    }
}
