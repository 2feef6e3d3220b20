use anyhow::{bail, Context, Result};
use log::info;

use crate::config::MAX_LOOKBACK_DAYS;
use crate::credential::CredentialProvider;
use crate::sync::{SyncEngine, SyncReport, SyncSettings};
use crate::toggl::LedgerRepository;
use crate::trakt::HistoryRepository;

/// Traktの視聴履歴をTogglに同期するためのサブコマンド。
#[derive(Debug, clap::Args)]
pub struct SyncArgs {
    #[clap(
        short = 'd',
        long = "days",
        help = "Number of days to look back (overrides TRAKT_HISTORY_DAYS)",
        parse(try_from_str = parse_days),
    )]
    days: Option<u32>,
}

pub struct SyncCommand<'a, C, H, L>
where
    C: CredentialProvider,
    H: HistoryRepository,
    L: LedgerRepository,
{
    credentials: &'a C,
    history: &'a H,
    ledger: &'a L,
    settings: SyncSettings,
}

impl<'a, C, H, L> SyncCommand<'a, C, H, L>
where
    C: CredentialProvider,
    H: HistoryRepository,
    L: LedgerRepository,
{
    /// 新しい`SyncCommand`を返す。
    ///
    /// # Arguments
    /// * `credentials` - Traktのアクセストークンの提供元
    /// * `history` - Traktの視聴履歴
    /// * `ledger` - Togglのtime entry
    /// * `settings` - 設定ファイルから読み込んだ同期の設定
    pub fn new(credentials: &'a C, history: &'a H, ledger: &'a L, settings: SyncSettings) -> Self {
        Self {
            credentials,
            history,
            ledger,
            settings,
        }
    }

    /// `sync`サブコマンドの処理を行う。
    ///
    /// 日数が指定された場合は設定の日数より優先する。
    pub async fn run(&self, args: SyncArgs) -> Result<SyncReport> {
        let mut settings = self.settings.clone();
        if let Some(days) = args.days {
            settings.lookback_days = days;
        }
        info!("Syncing the last {} days", settings.lookback_days);

        let engine = SyncEngine::new(self.credentials, self.history, self.ledger, settings);
        let report = engine.run().await.context("Failed to sync Trakt history")?;

        Ok(report)
    }
}

/// 日数をパースする。
fn parse_days(s: &str) -> Result<u32> {
    let days: u32 = s
        .parse()
        .with_context(|| format!("Failed to parse days: {}", s))?;
    if days == 0 || days > MAX_LOOKBACK_DAYS {
        bail!("Days must be between 1 and {}: {}", MAX_LOOKBACK_DAYS, days);
    }

    Ok(days)
}
