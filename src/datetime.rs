use chrono::{DateTime, Duration, DurationRound, Utc};

#[cfg(not(test))]
/// 現在のUTC時間を取得する。
pub fn now() -> DateTime<Utc> {
    Utc::now()
}


#[cfg(test)]
pub use mock_datetime::now;

/// 分単位に切り捨てた時刻を返す。
///
/// 重複判定のキーに利用するため、秒以下の差異は同一とみなす。
pub fn truncate_to_minute(time: DateTime<Utc>) -> DateTime<Utc> {
    time.duration_trunc(Duration::minutes(1)).unwrap_or(time)
}

/// 同期対象とする期間。
///
/// 両端を含む閉区間`[start, end]`として扱う。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LookbackWindow {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl LookbackWindow {
    /// `end`から`days`日遡った期間を返す。
    ///
    /// 表現できる範囲を超える場合、開始時刻は表現できる最小の時刻になる。
    pub fn ending_at(end: DateTime<Utc>, days: u32) -> Self {
        let start = Duration::try_days(i64::from(days))
            .and_then(|span| end.checked_sub_signed(span))
            .unwrap_or(DateTime::<Utc>::MIN_UTC);
        Self { start, end }
    }

    /// 指定した時刻が期間内かどうかを返す。
    pub fn contains(&self, time: DateTime<Utc>) -> bool {
        self.start <= time && time <= self.end
    }
}

#[cfg(test)]
mod tests {
    use chrono::{DateTime, SecondsFormat, TimeZone, Utc};
    use rstest::rstest;

    use super::mock_datetime;
    use super::{truncate_to_minute, LookbackWindow};

    /// 何も設定しない場合は、現在時間が取得できることを確認する。
    ///
    ///  - 現在時刻での比較を行なっているため、ミリ秒単位まで比較するとテストが失敗する可能性があり、秒単位で比較している。
    #[test]
    fn test_now() {
        mock_datetime::clear_mock_time();
        assert_eq!(
            mock_datetime::now().to_rfc3339_opts(SecondsFormat::Secs, true),
            Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true)
        );
    }

    /// モック時間を設定した時に、その時間が取得できることを確認する。
    #[test]
    fn test_now_specific_datetime() {
        let datetime = String::from("2024-01-01T00:00:00+00:00");
        mock_datetime::set_mock_time(
            DateTime::parse_from_rfc3339(datetime.as_str())
                .unwrap()
                .to_utc(),
        );

        assert_eq!(mock_datetime::now().to_rfc3339(), datetime);
        mock_datetime::clear_mock_time();
    }

    #[rstest]
    #[case::already_truncated(
        Utc.with_ymd_and_hms(2025, 1, 1, 12, 0, 0).unwrap(),
        Utc.with_ymd_and_hms(2025, 1, 1, 12, 0, 0).unwrap(),
    )]
    #[case::drop_seconds(
        Utc.with_ymd_and_hms(2025, 1, 1, 12, 0, 59).unwrap(),
        Utc.with_ymd_and_hms(2025, 1, 1, 12, 0, 0).unwrap(),
    )]
    #[case::drop_millis(
        Utc.timestamp_millis_opt(1_735_732_801_999).unwrap(),
        Utc.with_ymd_and_hms(2025, 1, 1, 12, 0, 0).unwrap(),
    )]
    fn test_truncate_to_minute(#[case] input: DateTime<Utc>, #[case] expected: DateTime<Utc>) {
        assert_eq!(truncate_to_minute(input), expected);
    }

    /// 期間の両端が含まれることを確認する。
    #[rstest]
    #[case::start_edge(Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap(), true)]
    #[case::end_edge(Utc.with_ymd_and_hms(2025, 1, 8, 0, 0, 0).unwrap(), true)]
    #[case::inside(Utc.with_ymd_and_hms(2025, 1, 4, 12, 0, 0).unwrap(), true)]
    #[case::before(Utc.with_ymd_and_hms(2024, 12, 31, 23, 59, 59).unwrap(), false)]
    #[case::after(Utc.with_ymd_and_hms(2025, 1, 8, 0, 0, 1).unwrap(), false)]
    fn test_lookback_window_contains(#[case] time: DateTime<Utc>, #[case] expected: bool) {
        let window =
            LookbackWindow::ending_at(Utc.with_ymd_and_hms(2025, 1, 8, 0, 0, 0).unwrap(), 7);

        assert_eq!(window.contains(time), expected);
    }

    #[test]
    fn test_lookback_window_saturates() {
        let end = Utc.with_ymd_and_hms(2025, 1, 8, 0, 0, 0).unwrap();

        let window = LookbackWindow::ending_at(end, u32::MAX);

        assert_eq!(window.start, DateTime::<Utc>::MIN_UTC);
        assert_eq!(window.end, end);
    }
}
