//! 时间区间模块
//!
//! 日期直方图的分桶规则在两个后端之间共享:
//! - 周及以上单位按日历边界分桶(周一、月初、季初、年初, UTC)
//! - 周以下单位按固定宽度分桶,从 Unix 纪元对齐
//!
//! 同时提供时间值的解析和规范化格式。

use chrono::{DateTime, Datelike, NaiveDate, NaiveDateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::DuoError;

/// 规范化的时间文本格式(毫秒精度, UTC)
pub const CANONICAL_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.3fZ";

/// 时间区间单位,按粒度从小到大排列
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IntervalUnit {
    Second,
    Minute,
    Hour,
    Day,
    Week,
    Month,
    Quarter,
    Year,
}

impl IntervalUnit {
    pub fn as_str(&self) -> &'static str {
        match self {
            IntervalUnit::Second => "second",
            IntervalUnit::Minute => "minute",
            IntervalUnit::Hour => "hour",
            IntervalUnit::Day => "day",
            IntervalUnit::Week => "week",
            IntervalUnit::Month => "month",
            IntervalUnit::Quarter => "quarter",
            IntervalUnit::Year => "year",
        }
    }

    /// 周及以上的单位按日历边界分桶
    pub fn is_calendar(&self) -> bool {
        *self >= IntervalUnit::Week
    }

    /// 固定宽度单位的秒数;日历单位返回 None
    pub fn fixed_seconds(&self) -> Option<i64> {
        match self {
            IntervalUnit::Second => Some(1),
            IntervalUnit::Minute => Some(60),
            IntervalUnit::Hour => Some(3_600),
            IntervalUnit::Day => Some(86_400),
            _ => None,
        }
    }

    /// 搜索引擎区间写法中的单位后缀
    pub fn short_suffix(&self) -> &'static str {
        match self {
            IntervalUnit::Second => "s",
            IntervalUnit::Minute => "m",
            IntervalUnit::Hour => "h",
            IntervalUnit::Day => "d",
            IntervalUnit::Week => "w",
            IntervalUnit::Month => "M",
            IntervalUnit::Quarter => "q",
            IntervalUnit::Year => "y",
        }
    }
}

impl fmt::Display for IntervalUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for IntervalUnit {
    type Err = DuoError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let unit = match s.trim().to_ascii_lowercase().as_str() {
            "s" | "second" | "seconds" => IntervalUnit::Second,
            "m" | "minute" | "minutes" => IntervalUnit::Minute,
            "h" | "hour" | "hours" => IntervalUnit::Hour,
            "d" | "day" | "days" => IntervalUnit::Day,
            "w" | "week" | "weeks" => IntervalUnit::Week,
            "month" | "months" => IntervalUnit::Month,
            "q" | "quarter" | "quarters" => IntervalUnit::Quarter,
            "y" | "year" | "years" => IntervalUnit::Year,
            other => {
                return Err(DuoError::Validation(format!("Unknown interval unit: {}", other)))
            }
        };
        Ok(unit)
    }
}

/// # Brief
/// 把时间截断到所在桶的起点
///
/// 日历单位忽略 `value`(校验层保证其为 1);固定单位按 `value` 倍宽度从纪元对齐。
///
/// # Arguments
/// * `ts` - 待截断的时间
/// * `unit` - 区间单位
/// * `value` - 区间倍数
///
/// # Returns
/// 桶起点;超出可表示范围时返回 None
pub fn truncate(ts: DateTime<Utc>, unit: IntervalUnit, value: u32) -> Option<DateTime<Utc>> {
    match unit.fixed_seconds() {
        Some(seconds) => {
            let width = seconds * 1000 * i64::from(value.max(1));
            let millis = ts.timestamp_millis();
            DateTime::from_timestamp_millis(millis.div_euclid(width) * width)
        }
        None => {
            let date = ts.date_naive();
            let start = match unit {
                IntervalUnit::Week => {
                    let back = i64::from(date.weekday().num_days_from_monday());
                    date.checked_sub_signed(chrono::Duration::days(back))?
                }
                IntervalUnit::Month => NaiveDate::from_ymd_opt(date.year(), date.month(), 1)?,
                IntervalUnit::Quarter => {
                    let month = (date.month0() / 3) * 3 + 1;
                    NaiveDate::from_ymd_opt(date.year(), month, 1)?
                }
                _ => NaiveDate::from_ymd_opt(date.year(), 1, 1)?,
            };
            Some(Utc.from_utc_datetime(&start.and_hms_opt(0, 0, 0)?))
        }
    }
}

/// # Brief
/// 解析搜索引擎写法的区间("1M"、"5m"、"30s"、"1q")
///
/// # Returns
/// (单位, 倍数);无法识别时返回 None
pub fn parse_short_interval(s: &str) -> Option<(IntervalUnit, u32)> {
    let s = s.trim();
    let split = s.find(|c: char| !c.is_ascii_digit())?;
    let (digits, suffix) = s.split_at(split);
    let value: u32 = if digits.is_empty() { 1 } else { digits.parse().ok()? };
    let unit = match suffix {
        "s" => IntervalUnit::Second,
        "m" => IntervalUnit::Minute,
        "h" => IntervalUnit::Hour,
        "d" => IntervalUnit::Day,
        "w" => IntervalUnit::Week,
        "M" => IntervalUnit::Month,
        "q" => IntervalUnit::Quarter,
        "y" => IntervalUnit::Year,
        other => other.parse().ok()?,
    };
    Some((unit, value))
}

/// # Brief
/// 解析时间文本
///
/// 支持 RFC 3339、`YYYY-MM-DD`(UTC 零点)以及整数毫秒时间戳。
pub fn parse_datetime(s: &str) -> Option<DateTime<Utc>> {
    let s = s.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.with_timezone(&Utc));
    }
    if let Ok(date) = NaiveDate::parse_from_str(s, "%Y-%m-%d") {
        return Some(Utc.from_utc_datetime(&date.and_hms_opt(0, 0, 0)?));
    }
    // 四位以外的年份带符号输出,RFC 3339 解析不接受
    if let Ok(naive) = NaiveDateTime::parse_from_str(s, CANONICAL_FORMAT) {
        return Some(naive.and_utc());
    }
    s.parse::<i64>().ok().and_then(DateTime::from_timestamp_millis)
}

/// 以规范化格式输出时间
pub fn format_datetime(ts: &DateTime<Utc>) -> String {
    ts.format(CANONICAL_FORMAT).to_string()
}
