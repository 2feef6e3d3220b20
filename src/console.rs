use std::io::Write;

use anyhow::{Context, Result};

use crate::sync::{ItemOutcome, Outcome, SyncReport};

/// Consoleに同期結果を表示するためのtrait。
pub trait ConsolePresenter {
    /// 同期結果を表示する。
    ///
    /// # Arguments
    ///
    /// * `report` - 表示する同期結果
    fn show_report(&mut self, report: &SyncReport) -> Result<()>;
}

/// 同期結果をMarkdownのlist形式で表示する。
pub struct ConsoleMarkdownList<'a, W: Write> {
    writer: &'a mut W,
}

impl<'a, W: Write> ConsoleMarkdownList<'a, W> {
    /// 新しい`ConsoleMarkdownList`を返す。
    pub fn new(writer: &'a mut W) -> Self {
        Self { writer }
    }

    fn write_item(&mut self, item: &ItemOutcome) -> Result<()> {
        let label = match &item.outcome {
            Outcome::Created => "created".to_string(),
            Outcome::Exists => "exists".to_string(),
            Outcome::Failed(reason) => format!("failed: {}", reason),
            Outcome::Deferred => "deferred".to_string(),
        };
        writeln!(self.writer, "  - [{}] {}", label, item.description)
            .with_context(|| format!("Failed to write item: {:?}", item))
    }
}

impl<'a, W: Write> ConsolePresenter for ConsoleMarkdownList<'a, W> {
    // 件数の要約と、視聴履歴ごとの結果を表示する。
    fn show_report(&mut self, report: &SyncReport) -> Result<()> {
        let ledger_note = if report.ledger_dedup_rate_limited {
            " (skipped: rate limited)"
        } else {
            ""
        };
        let lines = [
            format!(
                "- Trakt duplicates removed: {}",
                report.history_duplicates_removed
            ),
            format!(
                "- Toggl duplicates removed: {}{}",
                report.ledger_duplicates_removed, ledger_note
            ),
            format!("- Created: {}", report.created()),
            format!("- Skipped (exists): {}", report.skipped_exists()),
            format!("- Failed: {}", report.failed()),
            format!("- Deferred: {}", report.deferred()),
        ];
        for line in lines {
            writeln!(self.writer, "{}", line).context("Failed to write report summary")?;
        }

        if !report.items.is_empty() {
            writeln!(self.writer, "- Items:").context("Failed to write report items")?;
            for item in &report.items {
                self.write_item(item)?;
            }
        }
        for skipped in &report.skipped_steps {
            writeln!(
                self.writer,
                "- Skipped step `{}`: {}",
                skipped.step, skipped.reason
            )
            .context("Failed to write skipped step")?;
        }

        Ok(())
    }
}
