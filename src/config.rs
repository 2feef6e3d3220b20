use std::collections::HashMap;
use std::env;
use std::fmt::Display;
use std::ops::RangeInclusive;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use log::debug;

const TRAKT_API_URL: &str = "https://api.trakt.tv";
const TOGGL_API_URL: &str = "https://api.track.toggl.com/api/v9";

/// 同期対象とする日数の上限。
pub const MAX_LOOKBACK_DAYS: u32 = 3650;
/// time entryの長さ(分)の範囲。
const ENTRY_MINUTES: RangeInclusive<i64> = 1..=1440;
/// トークン更新の猶予(分)の範囲。最大7日。
const TOKEN_MARGIN_MINUTES: RangeInclusive<i64> = 1..=10080;

const REQUIRED_VARS: [&str; 5] = [
    "TRAKT_CLIENT_ID",
    "TRAKT_CLIENT_SECRET",
    "TOGGL_API_TOKEN",
    "TOGGL_WORKSPACE_ID",
    "TOGGL_PROJECT_ID",
];

/// Trakt APIの設定。
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TraktConfig {
    pub client_id: String,
    pub client_secret: String,
    pub api_url: String,
}

/// Toggl APIの設定。
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TogglConfig {
    pub api_token: String,
    pub workspace_id: u64,
    pub project_id: u64,
    pub api_url: String,
}

/// アプリケーション全体の設定。起動時に一度だけ読み込み、以降は変更しない。
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Config {
    pub trakt: TraktConfig,
    pub toggl: TogglConfig,
    /// 同期対象とする日数。
    pub lookback_days: u32,
    /// 作成するtime entryに付与するタグ。
    pub tags: Vec<String>,
    /// 作成するtime entryの長さ(秒)。
    pub entry_duration_seconds: i64,
    pub token_file: PathBuf,
    /// トークンの有効期限のどれだけ前から更新するか。
    pub token_refresh_margin: chrono::Duration,
    pub request_timeout: Duration,
}

impl Config {
    /// 環境変数と`.env`ファイルから設定を読み込む。
    ///
    /// 同じ変数が両方にある場合は環境変数を優先する。ファイルがない場合は環境変数のみを使う。
    pub fn load(env_file: &Path) -> Result<Self> {
        let file_vars = read_env_file(env_file)?;
        Self::from_lookup(|key| env::var(key).ok().or_else(|| file_vars.get(key).cloned()))
    }

    /// 指定された関数で値を取得して設定を作成する。
    ///
    /// 必須の値が不足している場合は、不足している変数をまとめてエラーにする。
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let get = |key: &str| lookup(key).filter(|value| !value.trim().is_empty());

        let missing: Vec<&str> = REQUIRED_VARS
            .iter()
            .copied()
            .filter(|&key| get(key).is_none())
            .collect();
        if !missing.is_empty() {
            bail!(
                "Missing required environment variables: {}",
                missing.join(", ")
            );
        }
        let required = |key: &str| get(key).ok_or_else(|| anyhow!("{} must be set", key));

        let token_file = match get("TRAKT_TOKEN_FILE") {
            Some(path) => PathBuf::from(path),
            None => default_token_file()?,
        };

        Ok(Self {
            trakt: TraktConfig {
                client_id: required("TRAKT_CLIENT_ID")?,
                client_secret: required("TRAKT_CLIENT_SECRET")?,
                api_url: get("TRAKT_API_URL").unwrap_or_else(|| TRAKT_API_URL.to_string()),
            },
            toggl: TogglConfig {
                api_token: required("TOGGL_API_TOKEN")?,
                workspace_id: parse_value("TOGGL_WORKSPACE_ID", &required("TOGGL_WORKSPACE_ID")?)?,
                project_id: parse_value("TOGGL_PROJECT_ID", &required("TOGGL_PROJECT_ID")?)?,
                api_url: get("TOGGL_API_URL").unwrap_or_else(|| TOGGL_API_URL.to_string()),
            },
            lookback_days: parse_in_range(
                "TRAKT_HISTORY_DAYS",
                get("TRAKT_HISTORY_DAYS"),
                7,
                1..=MAX_LOOKBACK_DAYS,
            )?,
            tags: parse_tags(get("TOGGL_TAGS").as_deref().unwrap_or_default()),
            entry_duration_seconds: parse_in_range(
                "TOGGL_ENTRY_MINUTES",
                get("TOGGL_ENTRY_MINUTES"),
                30,
                ENTRY_MINUTES,
            )? * 60,
            token_file,
            token_refresh_margin: chrono::Duration::try_minutes(parse_in_range(
                "TRAKT_TOKEN_MARGIN_MINUTES",
                get("TRAKT_TOKEN_MARGIN_MINUTES"),
                60,
                TOKEN_MARGIN_MINUTES,
            )?)
            .context("TRAKT_TOKEN_MARGIN_MINUTES is out of range")?,
            request_timeout: Duration::from_secs(30),
        })
    }
}

/// `.env`ファイルの変数を読み込む。
fn read_env_file(path: &Path) -> Result<HashMap<String, String>> {
    let vars = match dotenv::from_path_iter(path) {
        Ok(vars) => vars,
        Err(err) if err.not_found() => return Ok(HashMap::new()),
        Err(err) => {
            return Err(err).with_context(|| format!("Failed to open {}", path.display()))
        }
    };
    let vars = vars
        .collect::<Result<HashMap<_, _>, _>>()
        .with_context(|| format!("Failed to parse {}", path.display()))?;
    debug!("Loaded {} variables from {}", vars.len(), path.display());

    Ok(vars)
}

/// トークンファイルのデフォルトの保存先を返す。
fn default_token_file() -> Result<PathBuf> {
    let dir = dirs::config_dir().context("Failed to find the user config directory")?;
    Ok(dir.join("trakt2toggl").join("trakt_tokens.json"))
}

fn parse_value<T>(key: &str, value: &str) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    value
        .trim()
        .parse::<T>()
        .with_context(|| format!("Failed to parse {}: {}", key, value))
}

fn parse_or<T>(key: &str, value: Option<String>, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match value {
        Some(value) => parse_value(key, &value),
        None => Ok(default),
    }
}

/// 値をパースし、範囲外の場合はエラーにする。値がない場合は`default`を返す。
fn parse_in_range<T>(
    key: &str,
    value: Option<String>,
    default: T,
    range: RangeInclusive<T>,
) -> Result<T>
where
    T: FromStr + PartialOrd + Display,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    let parsed = parse_or(key, value, default)?;
    if !range.contains(&parsed) {
        bail!(
            "{} must be between {} and {}: {}",
            key,
            range.start(),
            range.end(),
            parsed
        );
    }

    Ok(parsed)
}

/// カンマ区切りのタグを分割する。空のタグは除外する。
fn parse_tags(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|tag| !tag.is_empty())
        .map(str::to_string)
        .collect()
}
