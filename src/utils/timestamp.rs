// ============================================================================
// 时间戳格式化：备份文件名、归档报告使用本地时间
// ============================================================================

use time::macros::format_description;
use time::OffsetDateTime;

/// 本地时间，无法确定本地时区时退回 UTC
pub fn local_now() -> OffsetDateTime {
    OffsetDateTime::now_local().unwrap_or_else(|_| OffsetDateTime::now_utc())
}

/// `YYYYmmdd_HHMMSS`，用于文件名
pub fn file_stamp(at: OffsetDateTime) -> String {
    let fmt = format_description!("[year][month][day]_[hour][minute][second]");
    at.format(&fmt).unwrap_or_else(|_| at.unix_timestamp().to_string())
}

/// `YYYY-mm-dd HH:MM:SS`，用于报告正文
pub fn display_stamp(at: OffsetDateTime) -> String {
    let fmt = format_description!("[year]-[month]-[day] [hour]:[minute]:[second]");
    at.format(&fmt).unwrap_or_else(|_| at.unix_timestamp().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;

    #[test]
    fn test_stamps() {
        let at = datetime!(2024-03-05 07:08:09 UTC);
        assert_eq!(file_stamp(at), "20240305_070809");
        assert_eq!(display_stamp(at), "2024-03-05 07:08:09");
    }
}
