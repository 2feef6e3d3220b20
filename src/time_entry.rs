use std::collections::BTreeSet;

use chrono::{DateTime, Utc};

use crate::datetime::truncate_to_minute;

/// time entryの重複判定キー。
pub type EntryFingerprint = (String, DateTime<Utc>);

/// Togglに登録済みのtime entry。
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TimeEntry {
    pub id: u64,
    pub description: String,
    pub start: DateTime<Utc>,
    pub duration_seconds: i64,
    pub tags: BTreeSet<String>,
    pub project_id: Option<u64>,
}

impl TimeEntry {
    /// 重複判定に利用するキーを返す。開始時刻は分単位で比較する。
    pub fn fingerprint(&self) -> EntryFingerprint {
        (self.description.clone(), truncate_to_minute(self.start))
    }
}

/// これから作成するtime entry。
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TimeEntryDraft {
    pub description: String,
    pub start: DateTime<Utc>,
    pub duration_seconds: i64,
    pub tags: BTreeSet<String>,
    pub project_id: u64,
    pub workspace_id: u64,
}

impl TimeEntryDraft {
    pub fn fingerprint(&self) -> EntryFingerprint {
        (self.description.clone(), truncate_to_minute(self.start))
    }
}
