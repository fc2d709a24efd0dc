pub fn now_seconds() -> i64 {
    chrono::Utc::now().timestamp()
}

/// Render an epoch timestamp for logs, `-` for "never"
pub fn display_ts(ts: i64) -> String {
    if ts <= 0 {
        return "-".to_string();
    }
    use chrono::TimeZone;
    chrono::Utc
        .timestamp_opt(ts, 0)
        .single()
        .map(|dt| dt.format("%Y-%m-%dT%H:%M:%SZ").to_string())
        .unwrap_or_else(|| ts.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_ts_formats_epoch_seconds() {
        assert_eq!(display_ts(0), "-");
        assert_eq!(display_ts(1_500_000_000), "2017-07-14T02:40:00Z");
    }

    #[test]
    fn now_is_after_2020() {
        assert!(now_seconds() > 1_577_836_800);
    }
}
