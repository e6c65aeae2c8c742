use std::path::Path;
use std::sync::OnceLock;

use chrono::{NaiveDate, NaiveDateTime};
use regex::Regex;

use super::html::{clean_number, decode_report};
use super::ReportError;
use crate::domain::{Trade, TradeSide};

/// Trades recovered from a report's deal table, plus the balance rows around
/// them.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TradeExtraction {
    pub trades: Vec<Trade>,
    pub initial_balance: f64,
    pub final_balance: f64,
}

impl TradeExtraction {
    pub fn total_net_profit(&self) -> f64 {
        self.trades.iter().map(|t| t.net_profit).sum()
    }

    pub fn total_commission(&self) -> f64 {
        self.trades.iter().map(|t| t.commission).sum()
    }

    pub fn total_swap(&self) -> f64 {
        self.trades.iter().map(|t| t.swap).sum()
    }
}

/// An entry deal whose volume and costs are still being consumed by exits.
///
/// Costs are commonly charged on the entry deal while profit is realized on
/// exits, so remaining entry costs must flow into the closed-trade records for
/// totals to reconcile with the report's Total Net Profit.
#[derive(Debug, Clone)]
struct OpenPosition {
    symbol: String,
    side: TradeSide,
    open_volume: f64,
    remaining_volume: f64,
    open_time: NaiveDateTime,
    open_price: f64,
    remaining_commission: f64,
    remaining_swap: f64,
    remaining_profit: f64,
}

fn deal_row_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        // Time, Deal, Symbol, Type, Direction, Volume, Price, Order,
        // Commission, Swap, Profit, Balance
        Regex::new(concat!(
            r"(?is)<tr[^>]*>\s*",
            r"<td[^>]*>([^<]+)</td>\s*",
            r"<td[^>]*>(\d+)</td>\s*",
            r"<td[^>]*>([^<]*)</td>\s*",
            r"<td[^>]*>([^<]+)</td>\s*",
            r"<td[^>]*>([^<]*)</td>\s*",
            r"<td[^>]*>([^<]*)</td>\s*",
            r"<td[^>]*>([^<]*)</td>\s*",
            r"<td[^>]*>([^<]*)</td>\s*",
            r"<td[^>]*>([^<]*)</td>\s*",
            r"<td[^>]*>([^<]*)</td>\s*",
            r"<td[^>]*>([^<]*)</td>\s*",
            r"<td[^>]*>([^<]*)</td>",
        ))
        .unwrap()
    })
}

fn parse_deal_time(raw: &str) -> NaiveDateTime {
    let trimmed = raw.trim();
    const FORMATS: &[&str] = &[
        "%Y.%m.%d %H:%M:%S",
        "%Y.%m.%d %H:%M",
        "%Y-%m-%d %H:%M:%S",
        "%Y-%m-%d %H:%M",
    ];
    for fmt in FORMATS {
        if let Ok(dt) = NaiveDateTime::parse_from_str(trimmed, fmt) {
            return dt;
        }
    }
    NaiveDate::from_ymd_opt(1970, 1, 1)
        .unwrap_or_default()
        .and_hms_opt(0, 0, 0)
        .unwrap_or_default()
}

fn parse_side(raw: &str) -> Option<TradeSide> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "buy" => Some(TradeSide::Buy),
        "sell" => Some(TradeSide::Sell),
        _ => None,
    }
}

pub fn extract_trades(path: &Path) -> Result<TradeExtraction, ReportError> {
    if !path.exists() {
        return Err(ReportError::NotFound(path.to_path_buf()));
    }
    let bytes = std::fs::read(path)?;
    extract_trades_str(&decode_report(&bytes))
}

/// Walk the deal table and rebuild round-trip trades.
///
/// Exits match opens by symbol plus opposite side, FIFO, with a symbol-only
/// fallback. Partial closes take a proportional share of the remaining entry
/// costs; the final close takes whatever is left so nothing is dropped. Exits
/// with no matching open become standalone close records.
pub fn extract_trades_str(content: &str) -> Result<TradeExtraction, ReportError> {
    let mut trades: Vec<Trade> = Vec::new();
    let mut open_positions: Vec<OpenPosition> = Vec::new();
    let mut initial_balance = 0.0_f64;
    let mut final_balance = 0.0_f64;

    for caps in deal_row_pattern().captures_iter(content) {
        let field = |i: usize| caps.get(i).map_or("", |m| m.as_str()).trim();

        let deal_time = parse_deal_time(field(1));
        let ticket: u64 = field(2).parse().unwrap_or(0);
        let symbol = field(3).to_string();
        let deal_type = field(4).to_ascii_lowercase();
        let direction = field(5).to_ascii_lowercase();
        let volume = clean_number(field(6));
        let price = clean_number(field(7));
        let commission = clean_number(field(9));
        let swap = clean_number(field(10));
        let profit = clean_number(field(11));
        let balance = clean_number(field(12));

        if deal_type == "balance" {
            if initial_balance == 0.0 {
                initial_balance = balance;
            }
            final_balance = balance;
            continue;
        }

        let Some(side) = parse_side(&deal_type) else {
            continue;
        };

        match direction.as_str() {
            "inout" => {
                // Complete round trip in a single deal
                trades.push(Trade {
                    ticket,
                    symbol,
                    side,
                    volume,
                    open_time: deal_time,
                    close_time: deal_time,
                    open_price: price,
                    close_price: price,
                    commission,
                    swap,
                    gross_profit: profit,
                    net_profit: profit + commission + swap,
                });
                final_balance = balance;
            }
            "in" => {
                open_positions.push(OpenPosition {
                    symbol,
                    side,
                    open_volume: volume,
                    remaining_volume: volume,
                    open_time: deal_time,
                    open_price: price,
                    remaining_commission: commission,
                    remaining_swap: swap,
                    // Usually zero on entry, carried anyway
                    remaining_profit: profit,
                });
            }
            "out" => {
                // A sell exit closes a buy position and vice versa
                let expected_side = side.opposite();

                let matched = open_positions
                    .iter()
                    .position(|p| p.symbol == symbol && p.side == expected_side)
                    .or_else(|| open_positions.iter().position(|p| p.symbol == symbol));

                let Some(idx) = matched else {
                    // No open found: keep the deal as a standalone close
                    trades.push(Trade {
                        ticket,
                        symbol,
                        side: expected_side,
                        volume,
                        open_time: deal_time,
                        close_time: deal_time,
                        open_price: price,
                        close_price: price,
                        commission,
                        swap,
                        gross_profit: profit,
                        net_profit: profit + commission + swap,
                    });
                    final_balance = balance;
                    continue;
                };

                let pos = &mut open_positions[idx];
                let pos_side = pos.side;
                let open_time = pos.open_time;
                let open_price = pos.open_price;

                let mut remaining_vol = pos.remaining_volume;
                if remaining_vol <= 0.0 {
                    remaining_vol = pos.open_volume;
                }

                // Final close (within float tolerance) flushes everything left
                let is_final = remaining_vol > 0.0 && volume >= remaining_vol - 1e-9;
                let (alloc_comm, alloc_swap, alloc_profit) = if is_final {
                    let alloc = (
                        pos.remaining_commission,
                        pos.remaining_swap,
                        pos.remaining_profit,
                    );
                    open_positions.remove(idx);
                    alloc
                } else {
                    let frac = if remaining_vol > 0.0 && volume > 0.0 {
                        (volume / remaining_vol).clamp(0.0, 1.0)
                    } else {
                        1.0
                    };
                    let alloc = (
                        pos.remaining_commission * frac,
                        pos.remaining_swap * frac,
                        pos.remaining_profit * frac,
                    );
                    pos.remaining_volume = (remaining_vol - volume).max(0.0);
                    pos.remaining_commission -= alloc.0;
                    pos.remaining_swap -= alloc.1;
                    pos.remaining_profit -= alloc.2;
                    alloc
                };

                let gross = profit + alloc_profit;
                let total_comm = commission + alloc_comm;
                let total_swap = swap + alloc_swap;

                trades.push(Trade {
                    ticket,
                    symbol,
                    side: pos_side,
                    volume,
                    open_time,
                    close_time: deal_time,
                    open_price,
                    close_price: price,
                    commission: total_comm,
                    swap: total_swap,
                    gross_profit: gross,
                    net_profit: gross + total_comm + total_swap,
                });
                final_balance = balance;
            }
            _ => {}
        }
    }

    if trades.is_empty() {
        return Err(ReportError::NoTrades);
    }

    Ok(TradeExtraction {
        trades,
        initial_balance,
        final_balance,
    })
}

/// Balance after each trade, ordered by close time.
pub fn equity_curve(trades: &[Trade], initial_balance: f64) -> Vec<f64> {
    let mut sorted: Vec<&Trade> = trades.iter().collect();
    sorted.sort_by_key(|t| t.close_time);

    let mut curve = Vec::with_capacity(trades.len() + 1);
    let mut balance = initial_balance;
    curve.push(balance);
    for trade in sorted {
        balance += trade.net_profit;
        curve.push(balance);
    }
    curve
}

/// Split trades at a date: strictly-before goes left, the rest right.
pub fn split_by_date(trades: &[Trade], split: NaiveDateTime) -> (Vec<Trade>, Vec<Trade>) {
    let mut before = Vec::new();
    let mut after = Vec::new();
    for trade in trades {
        if trade.close_time < split {
            before.push(trade.clone());
        } else {
            after.push(trade.clone());
        }
    }
    (before, after)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[allow(clippy::too_many_arguments)]
    fn deal_row(
        time: &str,
        ticket: u64,
        symbol: &str,
        deal_type: &str,
        direction: &str,
        volume: &str,
        price: &str,
        commission: &str,
        swap: &str,
        profit: &str,
        balance: &str,
    ) -> String {
        format!(
            "<tr><td>{time}</td><td>{ticket}</td><td>{symbol}</td><td>{deal_type}</td>\
<td>{direction}</td><td>{volume}</td><td>{price}</td><td>0</td>\
<td>{commission}</td><td>{swap}</td><td>{profit}</td><td>{balance}</td></tr>\n"
        )
    }

    fn wrap(rows: &str) -> String {
        format!("<html><body><table>\n{rows}</table></body></html>")
    }

    #[test]
    fn matches_entry_and_exit_with_entry_costs_carried() {
        let mut rows = String::new();
        rows.push_str(&deal_row(
            "2025.01.02 00:00:00", 1, "", "balance", "", "", "", "", "", "", "10000.00",
        ));
        rows.push_str(&deal_row(
            "2025.01.03 10:00:00", 2, "GBPUSD", "buy", "in", "1.00", "1.2650", "-7.00", "0.00",
            "0.00", "10000.00",
        ));
        rows.push_str(&deal_row(
            "2025.01.03 15:00:00", 3, "GBPUSD", "sell", "out", "1.00", "1.2700", "0.00", "-1.20",
            "500.00", "10491.80",
        ));
        let result = extract_trades_str(&wrap(&rows)).unwrap();

        assert_eq!(result.trades.len(), 1);
        let t = &result.trades[0];
        assert_eq!(t.side, TradeSide::Buy);
        assert!((t.commission - -7.0).abs() < 1e-9);
        assert!((t.swap - -1.2).abs() < 1e-9);
        assert!((t.gross_profit - 500.0).abs() < 1e-9);
        assert!((t.net_profit - 491.8).abs() < 1e-9);
        assert!((result.initial_balance - 10_000.0).abs() < 1e-9);
        assert!((result.final_balance - 10_491.8).abs() < 1e-9);
        // Net profit reconciles with the balance delta
        assert!((result.total_net_profit() - 491.8).abs() < 1e-9);
    }

    #[test]
    fn partial_close_allocates_costs_proportionally() {
        let mut rows = String::new();
        rows.push_str(&deal_row(
            "2025.01.03 10:00:00", 1, "EURUSD", "buy", "in", "1.00", "1.1000", "-8.00", "0.00",
            "0.00", "10000.00",
        ));
        rows.push_str(&deal_row(
            "2025.01.03 12:00:00", 2, "EURUSD", "sell", "out", "0.50", "1.1050", "0.00", "0.00",
            "250.00", "10246.00",
        ));
        rows.push_str(&deal_row(
            "2025.01.03 16:00:00", 3, "EURUSD", "sell", "out", "0.50", "1.1080", "0.00", "0.00",
            "400.00", "10642.00",
        ));
        let result = extract_trades_str(&wrap(&rows)).unwrap();

        assert_eq!(result.trades.len(), 2);
        // First (partial) close takes half the entry commission
        assert!((result.trades[0].commission - -4.0).abs() < 1e-9);
        // Final close flushes the remainder
        assert!((result.trades[1].commission - -4.0).abs() < 1e-9);
        assert!((result.total_commission() - -8.0).abs() < 1e-9);
        // Totals reconcile: 250 + 400 - 8
        assert!((result.total_net_profit() - 642.0).abs() < 1e-9);
    }

    #[test]
    fn final_close_flushes_rounding_residue() {
        let mut rows = String::new();
        rows.push_str(&deal_row(
            "2025.01.03 10:00:00", 1, "EURUSD", "buy", "in", "0.30", "1.1000", "-3.00", "0.00",
            "0.00", "10000.00",
        ));
        rows.push_str(&deal_row(
            "2025.01.03 12:00:00", 2, "EURUSD", "sell", "out", "0.10", "1.1010", "0.00", "0.00",
            "10.00", "10009.00",
        ));
        rows.push_str(&deal_row(
            "2025.01.03 13:00:00", 3, "EURUSD", "sell", "out", "0.10", "1.1020", "0.00", "0.00",
            "20.00", "10028.00",
        ));
        rows.push_str(&deal_row(
            "2025.01.03 14:00:00", 4, "EURUSD", "sell", "out", "0.10", "1.1030", "0.00", "0.00",
            "30.00", "10057.00",
        ));
        let result = extract_trades_str(&wrap(&rows)).unwrap();
        assert_eq!(result.trades.len(), 3);
        // All entry commission ends up distributed, none lost
        assert!((result.total_commission() - -3.0).abs() < 1e-9);
    }

    #[test]
    fn exit_matches_by_symbol_and_opposite_side_fifo() {
        let mut rows = String::new();
        // Two buys on the same symbol; exit must close the FIRST one (FIFO)
        rows.push_str(&deal_row(
            "2025.01.03 10:00:00", 1, "EURUSD", "buy", "in", "1.00", "1.1000", "0.00", "0.00",
            "0.00", "10000.00",
        ));
        rows.push_str(&deal_row(
            "2025.01.03 11:00:00", 2, "EURUSD", "buy", "in", "1.00", "1.2000", "0.00", "0.00",
            "0.00", "10000.00",
        ));
        rows.push_str(&deal_row(
            "2025.01.03 12:00:00", 3, "EURUSD", "sell", "out", "1.00", "1.1500", "0.00", "0.00",
            "500.00", "10500.00",
        ));
        let result = extract_trades_str(&wrap(&rows)).unwrap();
        assert_eq!(result.trades.len(), 1);
        assert!((result.trades[0].open_price - 1.1).abs() < 1e-9);
    }

    #[test]
    fn unmatched_exit_becomes_standalone_close() {
        let rows = deal_row(
            "2025.01.03 12:00:00", 9, "USDJPY", "buy", "out", "0.50", "151.20", "-2.00", "0.00",
            "-80.00", "9918.00",
        );
        let result = extract_trades_str(&wrap(&rows)).unwrap();
        assert_eq!(result.trades.len(), 1);
        let t = &result.trades[0];
        // A buy exit closes a sell position
        assert_eq!(t.side, TradeSide::Sell);
        assert!((t.net_profit - -82.0).abs() < 1e-9);
    }

    #[test]
    fn inout_row_is_a_complete_trade() {
        let rows = deal_row(
            "2025.01.03 12:00:00", 5, "EURUSD", "sell", "inout", "0.10", "1.1000", "-1.00",
            "0.00", "15.00", "10014.00",
        );
        let result = extract_trades_str(&wrap(&rows)).unwrap();
        assert_eq!(result.trades.len(), 1);
        assert_eq!(result.trades[0].side, TradeSide::Sell);
        assert!((result.trades[0].net_profit - 14.0).abs() < 1e-9);
    }

    #[test]
    fn no_deals_is_an_error() {
        assert!(matches!(
            extract_trades_str("<html><table></table></html>"),
            Err(ReportError::NoTrades)
        ));
    }

    #[test]
    fn equity_curve_orders_by_close_time() {
        let mut rows = String::new();
        rows.push_str(&deal_row(
            "2025.01.03 10:00:00", 1, "EURUSD", "buy", "in", "1.00", "1.1", "0", "0", "0",
            "10000",
        ));
        rows.push_str(&deal_row(
            "2025.01.03 12:00:00", 2, "EURUSD", "sell", "out", "1.00", "1.12", "0", "0", "200.00",
            "10200",
        ));
        rows.push_str(&deal_row(
            "2025.01.04 10:00:00", 3, "EURUSD", "buy", "in", "1.00", "1.1", "0", "0", "0",
            "10200",
        ));
        rows.push_str(&deal_row(
            "2025.01.04 12:00:00", 4, "EURUSD", "sell", "out", "1.00", "1.09", "0", "0",
            "-100.00", "10100",
        ));
        let result = extract_trades_str(&wrap(&rows)).unwrap();
        let curve = equity_curve(&result.trades, result.initial_balance.max(10_000.0));
        assert_eq!(curve, vec![10_000.0, 10_200.0, 10_100.0]);
    }

    #[test]
    fn split_by_date_partitions_on_close_time() {
        let mut rows = String::new();
        rows.push_str(&deal_row(
            "2025.01.03 10:00:00", 1, "EURUSD", "buy", "inout", "1.0", "1.1", "0", "0", "10.0",
            "10010",
        ));
        rows.push_str(&deal_row(
            "2025.02.03 10:00:00", 2, "EURUSD", "buy", "inout", "1.0", "1.1", "0", "0", "20.0",
            "10030",
        ));
        let result = extract_trades_str(&wrap(&rows)).unwrap();
        let split = NaiveDate::from_ymd_opt(2025, 2, 1)
            .unwrap()
            .and_hms_opt(0, 0, 0)
            .unwrap();
        let (before, after) = split_by_date(&result.trades, split);
        assert_eq!(before.len(), 1);
        assert_eq!(after.len(), 1);
        assert!((before[0].net_profit - 10.0).abs() < 1e-9);
    }
}
