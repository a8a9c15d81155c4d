//! 时间工具
//!
//! 交易日切换与交易时段判断。交易日在每天 22:00 UTC 切换
//! （近似 CME 期货 17:00 美东收盘，刻意忽略夏令时，保证 day key 可确定）。

use chrono::{DateTime, Datelike, Duration, Timelike, Utc, Weekday};

use crate::trading::router::SymbolClass;

/// 交易日切换时间（UTC 小时）
pub const TRADING_DAY_ROLLOVER_HOUR_UTC: u32 = 22;

/// 当前毫秒时间戳
pub fn now_timestamp_mills() -> i64 {
    Utc::now().timestamp_millis()
}

/// 计算指定时刻所属的交易日 key（"YYYY-MM-DD"）
///
/// 22:00 UTC 之后的成交归入下一个交易日
pub fn trading_day_key(now: DateTime<Utc>) -> String {
    let day = if now.hour() >= TRADING_DAY_ROLLOVER_HOUR_UTC {
        now + Duration::days(1)
    } else {
        now
    };
    day.format("%Y-%m-%d").to_string()
}

/// 判断指定品种类别当前是否在交易时段内
///
/// 粗粒度的时段模型（UTC）：
/// - 期货：周日 22:00 开盘至周五 21:00，每日 21:00-22:00 休市
/// - 股票/期权：周一至周五 13:30-20:00（美股常规时段）
/// - 加密货币：全天
pub fn is_market_open(now: DateTime<Utc>, class: SymbolClass) -> bool {
    let weekday = now.weekday();
    let minutes = now.hour() * 60 + now.minute();
    match class {
        SymbolClass::Crypto => true,
        SymbolClass::Futures => match weekday {
            Weekday::Sat => false,
            Weekday::Sun => now.hour() >= TRADING_DAY_ROLLOVER_HOUR_UTC,
            Weekday::Fri => now.hour() < 21,
            // 每日维护时段 21:00-22:00 休市
            _ => !(now.hour() == 21),
        },
        SymbolClass::Equities | SymbolClass::Options => match weekday {
            Weekday::Sat | Weekday::Sun => false,
            _ => (13 * 60 + 30..20 * 60).contains(&minutes),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_trading_day_rolls_over_at_22_utc() {
        let before = Utc.with_ymd_and_hms(2024, 6, 3, 21, 59, 0).unwrap();
        let after = Utc.with_ymd_and_hms(2024, 6, 3, 22, 0, 0).unwrap();
        assert_eq!(trading_day_key(before), "2024-06-03");
        assert_eq!(trading_day_key(after), "2024-06-04");
    }

    #[test]
    fn test_futures_maintenance_window_closed() {
        let maintenance = Utc.with_ymd_and_hms(2024, 6, 4, 21, 30, 0).unwrap();
        assert!(!is_market_open(maintenance, SymbolClass::Futures));
        let open = Utc.with_ymd_and_hms(2024, 6, 4, 22, 30, 0).unwrap();
        assert!(is_market_open(open, SymbolClass::Futures));
    }

    #[test]
    fn test_equities_weekend_closed() {
        let saturday = Utc.with_ymd_and_hms(2024, 6, 8, 15, 0, 0).unwrap();
        assert!(!is_market_open(saturday, SymbolClass::Equities));
        let tuesday = Utc.with_ymd_and_hms(2024, 6, 4, 15, 0, 0).unwrap();
        assert!(is_market_open(tuesday, SymbolClass::Equities));
    }
}
