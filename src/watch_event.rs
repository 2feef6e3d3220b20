use chrono::{DateTime, Utc};

use crate::datetime::truncate_to_minute;

/// 視聴したメディアの種類。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum MediaKind {
    Episode,
    Movie,
}

/// 視聴履歴の重複判定キー。
pub type WatchFingerprint = (MediaKind, String, Option<String>, DateTime<Utc>);

/// 視聴履歴の1件。
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WatchEvent {
    pub id: u64,
    pub media_kind: MediaKind,
    /// 番組名または映画のタイトル。
    pub title: String,
    /// `S01E01 - Pilot`の形式。映画では`None`。
    pub episode_label: Option<String>,
    pub year: Option<i32>,
    pub watched_at: DateTime<Utc>,
}

impl WatchEvent {
    /// 重複判定に利用するキーを返す。視聴時刻は分単位で比較する。
    pub fn fingerprint(&self) -> WatchFingerprint {
        (
            self.media_kind,
            self.title.clone(),
            self.episode_label.clone(),
            truncate_to_minute(self.watched_at),
        )
    }

    /// time entryのdescriptionを作成する。
    pub fn description(&self) -> String {
        match self.media_kind {
            MediaKind::Episode => match &self.episode_label {
                Some(label) => format!("📺 {} - {}", self.title, label),
                None => format!("📺 {}", self.title),
            },
            MediaKind::Movie => {
                let year = self
                    .year
                    .map(|year| year.to_string())
                    .unwrap_or_else(|| "N/A".to_string());
                format!("🎞️ {} ({})", self.title, year)
            }
        }
    }
}
