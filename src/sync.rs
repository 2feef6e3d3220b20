use std::collections::{BTreeSet, HashSet};

use log::{debug, error, info, warn};

use crate::config::Config;
use crate::credential::CredentialProvider;
use crate::datetime::{self, LookbackWindow};
use crate::dedup::{find_duplicates, Deletion};
use crate::error::{ApiError, SyncError, SyncStep};
use crate::time_entry::{EntryFingerprint, TimeEntry, TimeEntryDraft};
use crate::toggl::LedgerRepository;
use crate::trakt::HistoryRepository;
use crate::watch_event::WatchEvent;

/// 同期処理の設定。
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SyncSettings {
    pub lookback_days: u32,
    pub entry_duration_seconds: i64,
    pub tags: BTreeSet<String>,
    pub project_id: u64,
    pub workspace_id: u64,
}

impl SyncSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            lookback_days: config.lookback_days,
            entry_duration_seconds: config.entry_duration_seconds,
            tags: config.tags.iter().cloned().collect(),
            project_id: config.toggl.project_id,
            workspace_id: config.toggl.workspace_id,
        }
    }

    /// 視聴履歴から作成するtime entryを組み立てる。
    pub fn translate(&self, event: &WatchEvent) -> TimeEntryDraft {
        TimeEntryDraft {
            description: event.description(),
            start: event.watched_at,
            duration_seconds: self.entry_duration_seconds,
            tags: self.tags.clone(),
            project_id: self.project_id,
            workspace_id: self.workspace_id,
        }
    }

    /// この同期処理が作成したtime entryかどうか。プロジェクトとタグで判定する。
    fn owns(&self, entry: &TimeEntry) -> bool {
        entry.project_id == Some(self.project_id) && self.tags.is_subset(&entry.tags)
    }
}

/// 1件の視聴履歴に対する処理結果。
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Outcome {
    Created,
    /// 同じtime entryがすでに存在する。
    Exists,
    Failed(String),
    /// レート制限などで今回は処理を見送った。次回の実行で再び対象になる。
    Deferred,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ItemOutcome {
    pub description: String,
    pub outcome: Outcome,
}

/// スキップしたステップとその理由。
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SkippedStep {
    pub step: SyncStep,
    pub reason: String,
}

/// 1回の同期処理の結果。
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SyncReport {
    pub history_duplicates_removed: usize,
    pub history_delete_failures: usize,
    pub ledger_duplicates_removed: usize,
    pub ledger_delete_failures: usize,
    /// 402によりTogglの重複排除をスキップしたかどうか。
    pub ledger_dedup_rate_limited: bool,
    pub items: Vec<ItemOutcome>,
    pub skipped_steps: Vec<SkippedStep>,
}

impl SyncReport {
    pub fn created(&self) -> usize {
        self.count(|outcome| matches!(outcome, Outcome::Created))
    }

    pub fn skipped_exists(&self) -> usize {
        self.count(|outcome| matches!(outcome, Outcome::Exists))
    }

    pub fn failed(&self) -> usize {
        self.count(|outcome| matches!(outcome, Outcome::Failed(_)))
    }

    pub fn deferred(&self) -> usize {
        self.count(|outcome| matches!(outcome, Outcome::Deferred))
    }

    fn count(&self, predicate: impl Fn(&Outcome) -> bool) -> usize {
        self.items
            .iter()
            .filter(|item| predicate(&item.outcome))
            .count()
    }

    fn skip(&mut self, step: SyncStep, reason: impl Into<String>) {
        self.skipped_steps.push(SkippedStep {
            step,
            reason: reason.into(),
        });
    }
}

/// 致命的なエラーは`SyncError`として返し、それ以外は呼び出し元で処理できるよう返す。
fn tolerate(step: SyncStep, err: ApiError) -> Result<ApiError, SyncError> {
    if err.is_fatal() {
        Err(SyncError::new(step, err))
    } else {
        Ok(err)
    }
}

/// Traktの視聴履歴をTogglのtime entryとして同期する。
///
/// 各ステップは順番に1回だけ実行する。
/// 1. 認証情報を取得する
/// 2. Traktの重複した視聴履歴を削除する
/// 3. Togglの重複したtime entryを削除する
/// 4. 視聴履歴からtime entryを作成する。すでに存在する場合はスキップする
pub struct SyncEngine<'a, C, H, L>
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

impl<'a, C, H, L> SyncEngine<'a, C, H, L>
where
    C: CredentialProvider,
    H: HistoryRepository,
    L: LedgerRepository,
{
    /// 新しい`SyncEngine`を返す。
    pub fn new(credentials: &'a C, history: &'a H, ledger: &'a L, settings: SyncSettings) -> Self {
        Self {
            credentials,
            history,
            ledger,
            settings,
        }
    }

    /// 同期処理を実行する。
    ///
    /// 認証に失敗した場合のみエラーを返す。それ以外の失敗は`SyncReport`に記録して処理を続ける。
    pub async fn run(&self) -> Result<SyncReport, SyncError> {
        let window = LookbackWindow::ending_at(datetime::now(), self.settings.lookback_days);
        let mut report = SyncReport::default();
        info!(
            "Sync window: {} ~ {}",
            window.start.to_rfc3339(),
            window.end.to_rfc3339()
        );

        info!("=== Step 1: Acquiring Trakt credential ===");
        self.credentials
            .access_token()
            .await
            .map_err(|err| SyncError::new(SyncStep::AcquireCredential, err))?;

        info!("=== Step 2: Removing Trakt duplicates ===");
        let events = self.dedupe_history(&window, &mut report).await?;

        info!("=== Step 3: Removing Toggl duplicates ===");
        let entries = self.dedupe_ledger(&window, &mut report).await?;

        info!("=== Step 4: Syncing Trakt to Toggl ===");
        self.translate_and_sync(&window, events, entries, &mut report)
            .await?;

        info!(
            "Sync complete: history_duplicates_removed={} ledger_duplicates_removed={} \
             ledger_dedup_rate_limited={} created={} skipped_exists={} failed={} deferred={}",
            report.history_duplicates_removed,
            report.ledger_duplicates_removed,
            report.ledger_dedup_rate_limited,
            report.created(),
            report.skipped_exists(),
            report.failed(),
            report.deferred()
        );
        Ok(report)
    }

    /// 重複した視聴履歴を削除し、残った視聴履歴を返す。
    ///
    /// 視聴履歴を取得できなかった場合は`None`を返す。
    /// 削除に失敗した視聴履歴はそのまま残す。
    async fn dedupe_history(
        &self,
        window: &LookbackWindow,
        report: &mut SyncReport,
    ) -> Result<Option<Vec<WatchEvent>>, SyncError> {
        let step = SyncStep::DedupeHistory;
        let events = match self.history.list_recent(window.start).await {
            Ok(events) => events,
            Err(err) => {
                let err = tolerate(step, err)?;
                warn!("Failed to fetch Trakt history, skipping: {}", err);
                report.skip(step, err.to_string());
                return Ok(None);
            }
        };
        let events: Vec<WatchEvent> = events
            .into_iter()
            .filter(|event| window.contains(event.watched_at))
            .collect();

        let deduplicated = find_duplicates(events, WatchEvent::fingerprint, |event| event.id);
        if deduplicated.removals.is_empty() {
            info!("No Trakt duplicates found");
        }
        for duplicate in &deduplicated.removals {
            match self.history.delete(duplicate.id).await {
                Ok(Deletion::Deleted) => {
                    info!(
                        "Deleted Trakt duplicate: {} (watched: {})",
                        duplicate.description(),
                        duplicate.watched_at.format("%Y-%m-%d %H:%M")
                    );
                    report.history_duplicates_removed += 1;
                }
                Ok(Deletion::NotFound) => {
                    debug!("Trakt history {} was already removed", duplicate.id);
                    report.history_duplicates_removed += 1;
                }
                Err(err) => {
                    let err = tolerate(step, err)?;
                    warn!(
                        "Failed to delete Trakt history {}, keeping it: {}",
                        duplicate.id, err
                    );
                    report.history_delete_failures += 1;
                }
            }
        }

        Ok(Some(deduplicated.survivors))
    }

    /// 重複したtime entryを削除し、Togglに残っているtime entryを返す。
    ///
    /// 402を受け取った場合はこのステップをスキップする。
    async fn dedupe_ledger(
        &self,
        window: &LookbackWindow,
        report: &mut SyncReport,
    ) -> Result<Option<Vec<TimeEntry>>, SyncError> {
        let step = SyncStep::DedupeLedger;
        let entries = match self.fetch_owned_entries(window).await {
            Ok(entries) => entries,
            Err(ApiError::RateLimited) => {
                warn!("Toggl rate limit reached (402), skipping deduplication");
                report.ledger_dedup_rate_limited = true;
                report.skip(step, ApiError::RateLimited.to_string());
                return Ok(None);
            }
            Err(err) => {
                let err = tolerate(step, err)?;
                warn!("Failed to fetch Toggl entries, skipping deduplication: {}", err);
                report.skip(step, err.to_string());
                return Ok(None);
            }
        };

        let deduplicated = find_duplicates(entries, TimeEntry::fingerprint, |entry| entry.id);
        if deduplicated.removals.is_empty() {
            info!("No Toggl duplicates found");
        }
        let mut remaining = deduplicated.survivors;
        let mut removals = deduplicated.removals.into_iter();
        while let Some(duplicate) = removals.next() {
            match self.ledger.delete(duplicate.id).await {
                Ok(_) => {
                    info!(
                        "Deleted Toggl duplicate: {} ({})",
                        duplicate.description,
                        duplicate.start.format("%Y-%m-%d %H:%M")
                    );
                    report.ledger_duplicates_removed += 1;
                }
                Err(ApiError::RateLimited) => {
                    warn!("Toggl rate limit reached (402), keeping remaining duplicates");
                    report.ledger_dedup_rate_limited = true;
                    report.skip(step, ApiError::RateLimited.to_string());
                    remaining.push(duplicate);
                    remaining.extend(removals.by_ref());
                    break;
                }
                Err(err) => {
                    let err = tolerate(step, err)?;
                    warn!(
                        "Failed to delete Toggl entry {}, keeping it: {}",
                        duplicate.id, err
                    );
                    report.ledger_delete_failures += 1;
                    remaining.push(duplicate);
                }
            }
        }

        Ok(Some(remaining))
    }

    /// 視聴履歴からtime entryを作成する。
    ///
    /// 視聴時刻の昇順、同時刻の場合はidの昇順で処理する。
    /// 既存のtime entryと同じキーを持つものは作成しない。
    async fn translate_and_sync(
        &self,
        window: &LookbackWindow,
        events: Option<Vec<WatchEvent>>,
        entries: Option<Vec<TimeEntry>>,
        report: &mut SyncReport,
    ) -> Result<(), SyncError> {
        let step = SyncStep::TranslateAndSync;
        let mut events = match events {
            Some(events) => events,
            None => {
                report.skip(step, "Trakt history unavailable");
                return Ok(());
            }
        };
        events.sort_by(|a, b| a.watched_at.cmp(&b.watched_at).then(a.id.cmp(&b.id)));
        let drafts: Vec<TimeEntryDraft> = events
            .iter()
            .map(|event| self.settings.translate(event))
            .collect();
        info!("Processing {} entries...", drafts.len());

        let entries = match entries {
            Some(entries) => Some(entries),
            None => match self.fetch_owned_entries(window).await {
                Ok(entries) => Some(entries),
                Err(err) => {
                    let err = tolerate(step, err)?;
                    warn!(
                        "Cannot check existing Toggl entries, deferring {} entries: {}",
                        drafts.len(),
                        err
                    );
                    report.skip(step, err.to_string());
                    None
                }
            },
        };
        let mut known: HashSet<EntryFingerprint> = match entries {
            Some(entries) => entries.iter().map(TimeEntry::fingerprint).collect(),
            None => {
                report
                    .items
                    .extend(drafts.into_iter().map(|draft| ItemOutcome {
                        description: draft.description,
                        outcome: Outcome::Deferred,
                    }));
                return Ok(());
            }
        };

        let mut halted = false;
        for draft in drafts {
            let description = draft.description.clone();
            let fingerprint = draft.fingerprint();
            let outcome = if halted {
                Outcome::Deferred
            } else if known.contains(&fingerprint) {
                info!("Skipped (exists): {}", description);
                Outcome::Exists
            } else {
                let start = draft.start;
                match self.ledger.create(draft).await {
                    Ok(entry) => {
                        info!(
                            "Created: {} (at {})",
                            description,
                            start.format("%Y-%m-%d %H:%M")
                        );
                        known.insert(entry.fingerprint());
                        known.insert(fingerprint);
                        Outcome::Created
                    }
                    Err(ApiError::RateLimited) => {
                        warn!("Toggl rate limit reached (402), deferring remaining entries");
                        halted = true;
                        Outcome::Deferred
                    }
                    Err(err) => {
                        let err = tolerate(step, err)?;
                        error!("Failed to create: {} - {}", description, err);
                        Outcome::Failed(err.to_string())
                    }
                }
            };
            report.items.push(ItemOutcome {
                description,
                outcome,
            });
        }

        Ok(())
    }

    /// 同期対象の期間にある、この同期処理が作成したtime entryを取得する。
    async fn fetch_owned_entries(
        &self,
        window: &LookbackWindow,
    ) -> Result<Vec<TimeEntry>, ApiError> {
        let entries = self.ledger.list_range(window.start, window.end).await?;
        let owned: Vec<TimeEntry> = entries
            .into_iter()
            .filter(|entry| self.settings.owns(entry) && window.contains(entry.start))
            .collect();
        info!("Found {} Toggl entries in project", owned.len());
        Ok(owned)
    }
}
