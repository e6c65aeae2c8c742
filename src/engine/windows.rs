//! Time-window metrics for the best pass, computed purely from its trade
//! list: segment splits, rolling windows, calendar months, yearly breakdown.

use chrono::{Datelike, Days, Months, NaiveDate, NaiveDateTime};

use crate::domain::{BacktestDates, Trade, WindowKind, WindowMetrics};

fn day_start(date: NaiveDate) -> NaiveDateTime {
    date.and_hms_opt(0, 0, 0).unwrap_or_default()
}

fn day_end(date: NaiveDate) -> NaiveDateTime {
    date.and_hms_opt(23, 59, 59).unwrap_or_default()
}

/// Metrics over `[from, to]`, walking trades in close-time order.
///
/// The starting balance carries forward all profit closed before the window,
/// so drawdown percentages are measured against the balance the account
/// actually had entering the window.
fn window_metrics(
    id: &str,
    label: &str,
    kind: WindowKind,
    from: NaiveDate,
    to: NaiveDate,
    trades: &[Trade],
    initial_balance: f64,
) -> WindowMetrics {
    let window_start = day_start(from);
    let window_end = day_end(to);

    let mut balance = initial_balance;
    for trade in trades {
        if trade.close_time < window_start {
            balance += trade.net_profit;
        } else {
            break;
        }
    }

    let mut peak = balance;
    let mut max_dd = 0.0_f64;
    let mut profit = 0.0;
    let mut gross_profit = 0.0;
    let mut gross_loss = 0.0;
    let mut wins = 0u64;
    let mut total = 0u64;

    for trade in trades {
        if trade.close_time < window_start {
            continue;
        }
        if trade.close_time > window_end {
            break;
        }

        let p = trade.net_profit;
        total += 1;
        profit += p;
        if p > 0.0 {
            wins += 1;
            gross_profit += p;
        } else if p < 0.0 {
            gross_loss += p.abs();
        }

        balance += p;
        if balance > peak {
            peak = balance;
        }
        if peak > 0.0 {
            let dd = (peak - balance) / peak;
            if dd > max_dd {
                max_dd = dd;
            }
        }
    }

    let profit_factor = if gross_loss <= 0.0 {
        if gross_profit > 0.0 {
            99.0
        } else {
            0.0
        }
    } else {
        gross_profit / gross_loss
    };
    let win_rate = if total > 0 {
        wins as f64 / total as f64 * 100.0
    } else {
        0.0
    };

    WindowMetrics {
        id: id.to_string(),
        label: label.to_string(),
        kind,
        from,
        to,
        profit,
        profit_factor: round2(profit_factor),
        max_drawdown_pct: round2(max_dd * 100.0),
        total_trades: total,
        win_rate: round1(win_rate),
    }
}

/// Build the full window suite for a trade list. Trades are sorted by close
/// time internally; callers can pass them in any order.
pub fn build_windows(
    trades: &[Trade],
    dates: &BacktestDates,
    rolling_days: &[u32],
    calendar_months_ago: &[u32],
    initial_balance: f64,
) -> Vec<WindowMetrics> {
    let mut sorted: Vec<Trade> = trades.to_vec();
    sorted.sort_by_key(|t| t.close_time);

    let mut windows = Vec::new();

    windows.push(window_metrics(
        "full",
        "Full period",
        WindowKind::Full,
        dates.start,
        dates.end,
        &sorted,
        initial_balance,
    ));
    windows.push(window_metrics(
        "in_sample",
        "In-sample",
        WindowKind::Segment,
        dates.start,
        dates.split.pred_opt().unwrap_or(dates.split),
        &sorted,
        initial_balance,
    ));
    windows.push(window_metrics(
        "forward",
        "Forward",
        WindowKind::Segment,
        dates.split,
        dates.end,
        &sorted,
        initial_balance,
    ));

    for days in rolling_days {
        if *days == 0 {
            continue;
        }
        let from = dates
            .end
            .checked_sub_days(Days::new(u64::from(*days)))
            .unwrap_or(dates.end);
        windows.push(window_metrics(
            &format!("last_{days}d"),
            &format!("Last {days} days"),
            WindowKind::Rolling,
            from,
            dates.end,
            &sorted,
            initial_balance,
        ));
    }

    for months_ago in calendar_months_ago {
        if *months_ago == 0 {
            continue;
        }
        let anchor_month = dates.end.with_day(1).unwrap_or(dates.end);
        let Some(month_start) = anchor_month.checked_sub_months(Months::new(*months_ago)) else {
            continue;
        };
        let Some(next_month) = month_start.checked_add_months(Months::new(1)) else {
            continue;
        };
        let month_end = next_month.pred_opt().unwrap_or(next_month);
        windows.push(window_metrics(
            &format!("month_{}_{:02}", month_start.year(), month_start.month()),
            &month_start.format("%b %Y").to_string(),
            WindowKind::Calendar,
            month_start,
            month_end,
            &sorted,
            initial_balance,
        ));
    }

    for year in dates.start.year()..=dates.end.year() {
        let year_start = NaiveDate::from_ymd_opt(year, 1, 1)
            .unwrap_or(dates.start)
            .max(dates.start);
        let year_end = NaiveDate::from_ymd_opt(year, 12, 31)
            .unwrap_or(dates.end)
            .min(dates.end);
        windows.push(window_metrics(
            &format!("year_{year}"),
            &format!("Year {year}"),
            WindowKind::Year,
            year_start,
            year_end,
            &sorted,
            initial_balance,
        ));
    }

    windows
}

fn round1(value: f64) -> f64 {
    (value * 10.0).round() / 10.0
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::TradeSide;

    fn trade(y: i32, m: u32, d: u32, profit: f64) -> Trade {
        let at = NaiveDate::from_ymd_opt(y, m, d)
            .unwrap()
            .and_hms_opt(12, 0, 0)
            .unwrap();
        Trade {
            ticket: 0,
            symbol: "GBPUSD".into(),
            side: TradeSide::Buy,
            volume: 0.1,
            open_time: at,
            close_time: at,
            open_price: 1.0,
            close_price: 1.0,
            commission: 0.0,
            swap: 0.0,
            gross_profit: profit,
            net_profit: profit,
        }
    }

    fn dates() -> BacktestDates {
        BacktestDates {
            start: NaiveDate::from_ymd_opt(2024, 1, 1).unwrap(),
            split: NaiveDate::from_ymd_opt(2026, 1, 1).unwrap(),
            end: NaiveDate::from_ymd_opt(2026, 6, 30).unwrap(),
        }
    }

    #[test]
    fn segment_windows_partition_the_trades() {
        let trades = vec![
            trade(2024, 3, 1, 100.0),
            trade(2025, 6, 1, -50.0),
            trade(2026, 2, 1, 200.0),
            trade(2026, 6, 1, 75.0),
        ];
        let windows = build_windows(&trades, &dates(), &[], &[], 10_000.0);

        let by_id = |id: &str| windows.iter().find(|w| w.id == id).unwrap();
        assert_eq!(by_id("full").total_trades, 4);
        assert!((by_id("full").profit - 325.0).abs() < 1e-9);
        assert_eq!(by_id("in_sample").total_trades, 2);
        assert!((by_id("in_sample").profit - 50.0).abs() < 1e-9);
        assert_eq!(by_id("forward").total_trades, 2);
        assert!((by_id("forward").profit - 275.0).abs() < 1e-9);
    }

    #[test]
    fn rolling_window_anchored_to_end_date() {
        let trades = vec![trade(2026, 6, 25, 40.0), trade(2026, 4, 1, 999.0)];
        let windows = build_windows(&trades, &dates(), &[30], &[], 10_000.0);
        let last30 = windows.iter().find(|w| w.id == "last_30d").unwrap();
        assert_eq!(last30.total_trades, 1);
        assert!((last30.profit - 40.0).abs() < 1e-9);
    }

    #[test]
    fn calendar_month_window() {
        let trades = vec![trade(2026, 5, 10, 10.0), trade(2026, 4, 10, 20.0)];
        let windows = build_windows(&trades, &dates(), &[], &[1], 10_000.0);
        let month = windows.iter().find(|w| w.id == "month_2026_05").unwrap();
        assert_eq!(month.kind, WindowKind::Calendar);
        assert_eq!(month.total_trades, 1);
        assert!((month.profit - 10.0).abs() < 1e-9);
    }

    #[test]
    fn yearly_windows_clamp_to_range() {
        let windows = build_windows(&[], &dates(), &[], &[], 10_000.0);
        let y2024 = windows.iter().find(|w| w.id == "year_2024").unwrap();
        let y2026 = windows.iter().find(|w| w.id == "year_2026").unwrap();
        assert_eq!(y2024.from, NaiveDate::from_ymd_opt(2024, 1, 1).unwrap());
        assert_eq!(y2026.to, NaiveDate::from_ymd_opt(2026, 6, 30).unwrap());
    }

    #[test]
    fn starting_balance_carries_prior_profit() {
        // A big win before the window inflates the entering balance, which
        // shrinks the drawdown percentage of an in-window loss.
        let trades = vec![trade(2024, 2, 1, 10_000.0), trade(2026, 3, 1, -1000.0)];
        let windows = build_windows(&trades, &dates(), &[], &[], 10_000.0);
        let forward = windows.iter().find(|w| w.id == "forward").unwrap();
        // Entering balance 20k; 1k loss is a 5% drawdown
        assert!((forward.max_drawdown_pct - 5.0).abs() < 1e-9);
    }

    #[test]
    fn profit_factor_caps_without_losses() {
        let trades = vec![trade(2026, 2, 1, 50.0)];
        let windows = build_windows(&trades, &dates(), &[], &[], 10_000.0);
        let forward = windows.iter().find(|w| w.id == "forward").unwrap();
        assert!((forward.profit_factor - 99.0).abs() < 1e-9);
        assert!((forward.win_rate - 100.0).abs() < 1e-9);
    }
}
