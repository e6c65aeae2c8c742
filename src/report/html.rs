use std::collections::HashSet;
use std::path::Path;

use regex::Regex;

use super::ReportError;
use crate::domain::TradeMetrics;

/// Labels that identify a genuine single-run report. Fewer than two matches
/// means the format changed (or the wrong file was read) and parsing fails.
const CORE_LABELS: &[&str] = &[
    "Total Net Profit",
    "Total Trades",
    "Profit Factor",
    "Equity Drawdown Maximal",
    "History Quality",
];

#[derive(Debug, Clone, Default, PartialEq)]
pub struct DrawdownBreakdown {
    pub balance_abs: f64,
    pub balance_max: f64,
    pub balance_rel_pct: f64,
    pub equity_abs: f64,
    pub equity_max: f64,
    pub equity_rel_pct: f64,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Streaks {
    pub max_consecutive_wins: i64,
    pub max_consecutive_wins_amount: f64,
    pub max_consecutive_losses: i64,
    pub max_consecutive_losses_amount: f64,
    pub max_consecutive_profit: f64,
    pub max_consecutive_profit_count: i64,
    pub max_consecutive_loss: f64,
    pub max_consecutive_loss_count: i64,
    pub avg_consecutive_wins: i64,
    pub avg_consecutive_losses: i64,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct TradeSizes {
    pub largest_profit_trade: f64,
    pub largest_loss_trade: f64,
    pub avg_profit_trade: f64,
    pub avg_loss_trade: f64,
    pub profit_trades: i64,
    pub loss_trades: i64,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct HoldingTimes {
    pub min: String,
    pub max: String,
    pub avg: String,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Costs {
    pub total_commission: f64,
    pub total_swap: f64,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct DirectionSplit {
    pub short_trades: i64,
    pub short_win_pct: f64,
    pub long_trades: i64,
    pub long_win_pct: f64,
}

/// Everything recoverable from the labelled-value section of a single-run
/// report.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BacktestReport {
    // Data quality
    pub history_quality_pct: f64,
    pub bars: i64,
    pub ticks: i64,
    pub symbols: i64,
    // Core metrics
    pub profit: f64,
    pub profit_factor: f64,
    pub max_drawdown_pct: f64,
    pub max_drawdown: f64,
    pub total_trades: i64,
    pub win_rate: f64,
    pub sharpe: f64,
    pub expected_payoff: f64,
    pub recovery_factor: f64,
    pub gross_profit: f64,
    pub gross_loss: f64,
    // Extended
    pub z_score: f64,
    pub z_score_confidence_pct: f64,
    pub ahpr: f64,
    pub ghpr: f64,
    pub lr_correlation: f64,
    pub lr_standard_error: f64,
    pub initial_deposit: f64,
    pub drawdown: DrawdownBreakdown,
    pub streaks: Streaks,
    pub trade_sizes: TradeSizes,
    pub holding_times: HoldingTimes,
    pub costs: Costs,
    pub direction: DirectionSplit,
}

impl BacktestReport {
    pub fn to_metrics(&self) -> TradeMetrics {
        TradeMetrics {
            profit: self.profit,
            profit_factor: self.profit_factor,
            max_drawdown_pct: self.max_drawdown_pct,
            total_trades: self.total_trades.max(0) as u64,
            win_rate: self.win_rate,
            sharpe: self.sharpe,
            sortino: 0.0,
            expected_payoff: self.expected_payoff,
            recovery_factor: self.recovery_factor,
            gross_profit: self.gross_profit,
            gross_loss: self.gross_loss.abs(),
        }
    }
}

/// Decode report bytes. The simulator writes UTF-16-LE; stale tooling
/// occasionally leaves UTF-8 or Windows-1252 files behind.
pub fn decode_report(bytes: &[u8]) -> String {
    if bytes.starts_with(&[0xFF, 0xFE]) || looks_utf16le(bytes) {
        let (text, _, _) = encoding_rs::UTF_16LE.decode(bytes);
        return text.into_owned();
    }
    match std::str::from_utf8(bytes) {
        Ok(s) => s.to_owned(),
        Err(_) => {
            let (text, _, _) = encoding_rs::WINDOWS_1252.decode(bytes);
            text.into_owned()
        }
    }
}

/// ASCII-heavy UTF-16-LE shows as every second byte being zero.
fn looks_utf16le(bytes: &[u8]) -> bool {
    let sample = &bytes[..bytes.len().min(256)];
    if sample.len() < 4 {
        return false;
    }
    let zeros = sample.iter().skip(1).step_by(2).filter(|b| **b == 0).count();
    zeros * 2 >= sample.len() / 2
}

/// Parse a numeric string the way the report prints numbers: spaces (and
/// non-breaking spaces) as thousands separators, either decimal convention.
/// When both `,` and `.` appear the comma is a thousands separator.
pub fn clean_number(raw: &str) -> f64 {
    let mut s: String = raw
        .trim()
        .chars()
        .filter(|c| !matches!(c, ' ' | '\u{a0}' | '%' | '\''))
        .collect();
    if s.contains(',') && s.contains('.') {
        s.retain(|c| c != ',');
    } else if s.contains(',') {
        s = s.replace(',', ".");
    }
    s.parse::<f64>().unwrap_or(0.0)
}

struct LabelScanner<'a> {
    content: &'a str,
    found: HashSet<String>,
}

impl<'a> LabelScanner<'a> {
    fn new(content: &'a str) -> Self {
        Self {
            content,
            found: HashSet::new(),
        }
    }

    /// Raw `<b>` text following `>Label:</td>`, with flexible whitespace.
    fn raw(&mut self, label: &str) -> Option<String> {
        let escaped = regex::escape(label).replace(' ', r"\s+");
        let pattern = format!(r"(?is)>{escaped}:?</td>.*?<b>([^<]+)</b>");
        let re = Regex::new(&pattern).ok()?;
        let m = re.captures(self.content)?;
        self.found.insert(label.to_string());
        Some(m.get(1)?.as_str().trim().to_string())
    }

    fn value(&mut self, label: &str) -> f64 {
        match self.raw(label) {
            Some(text) => {
                // "VALUE (PCT%)" keeps just the value part
                let value_part = text.split('(').next().unwrap_or("").trim();
                clean_number(value_part)
            }
            None => 0.0,
        }
    }

    /// `"2 656.13 (82.77%)"` → (value, pct).
    fn value_pct(&mut self, label: &str) -> (f64, f64) {
        let Some(text) = self.raw(label) else {
            return (0.0, 0.0);
        };
        let re = Regex::new(r"([\d\s\u{a0}.,\-]+)\s*\(([\d.,]+)%\)").unwrap();
        match re.captures(&text) {
            Some(caps) => (
                clean_number(caps.get(1).unwrap().as_str()),
                clean_number(caps.get(2).unwrap().as_str()),
            ),
            None => (clean_number(&text), 0.0),
        }
    }

    /// `"543 (48.43%)"` → (count, pct).
    fn count_pct(&mut self, label: &str) -> (i64, f64) {
        let Some(text) = self.raw(label) else {
            return (0, 0.0);
        };
        let re = Regex::new(r"(\d+)\s*\(([\d.,]+)%\)").unwrap();
        match re.captures(&text) {
            Some(caps) => (
                caps.get(1).unwrap().as_str().parse().unwrap_or(0),
                clean_number(caps.get(2).unwrap().as_str()),
            ),
            None => (0, 0.0),
        }
    }

    /// Streak fields come in two spellings: `"10 (112.55)"` (count first, for
    /// wins/losses) and `"275.28 (3)"` (amount first, for profit/loss runs).
    fn streak(&mut self, label: &str, count_first: bool) -> (i64, f64) {
        let Some(text) = self.raw(label) else {
            return (0, 0.0);
        };
        let re = Regex::new(r"([\d\s\u{a0}.,\-]+)\s*\(([\d\s\u{a0}.,\-]+)\)").unwrap();
        match re.captures(&text) {
            Some(caps) => {
                let first = clean_number(caps.get(1).unwrap().as_str());
                let second = clean_number(caps.get(2).unwrap().as_str());
                if count_first {
                    (first as i64, second)
                } else {
                    (second as i64, first)
                }
            }
            None => (0, 0.0),
        }
    }

    fn text(&mut self, label: &str) -> String {
        self.raw(label).unwrap_or_default()
    }
}

pub fn parse_backtest_html(path: &Path) -> Result<BacktestReport, ReportError> {
    if !path.exists() {
        return Err(ReportError::NotFound(path.to_path_buf()));
    }
    let bytes = std::fs::read(path)?;
    parse_backtest_str(&decode_report(&bytes))
}

pub fn parse_backtest_str(content: &str) -> Result<BacktestReport, ReportError> {
    let mut scan = LabelScanner::new(content);

    let history_quality_pct = scan.value("History Quality");
    let bars = scan.value("Bars") as i64;
    let ticks = scan.value("Ticks") as i64;
    let symbols = scan.value("Symbols") as i64;

    let profit = scan.value("Total Net Profit");
    let profit_factor = scan.value("Profit Factor");
    let total_trades = scan.value("Total Trades") as i64;
    let expected_payoff = scan.value("Expected Payoff");
    let sharpe = scan.value("Sharpe Ratio");
    let recovery_factor = scan.value("Recovery Factor");
    let gross_profit = scan.value("Gross Profit");
    let gross_loss = scan.value("Gross Loss");
    let initial_deposit = scan.value("Initial Deposit");

    let (z_score, z_score_confidence_pct) = scan.value_pct("Z-Score");
    let ahpr = scan.value("AHPR");
    let ghpr = scan.value("GHPR");
    let lr_correlation = scan.value("LR Correlation");
    let lr_standard_error = scan.value("LR Standard Error");

    let balance_abs = scan.value("Balance Drawdown Absolute");
    let (balance_max, balance_rel_pct) = scan.value_pct("Balance Drawdown Maximal");
    let equity_abs = scan.value("Equity Drawdown Absolute");
    let (equity_max, equity_rel_pct) = scan.value_pct("Equity Drawdown Maximal");

    // Prefer equity drawdown; some reports only carry balance drawdown
    let max_drawdown_pct = if equity_rel_pct > 0.0 {
        equity_rel_pct
    } else {
        balance_rel_pct
    };
    let max_drawdown = if equity_max > 0.0 { equity_max } else { balance_max };

    let (max_wins, max_wins_amount) = scan.streak("Maximum consecutive wins ($)", true);
    let (max_losses, max_losses_amount) = scan.streak("Maximum consecutive losses ($)", true);
    let (max_profit_count, max_profit) = scan.streak("Maximal consecutive profit (count)", false);
    let (max_loss_count, max_loss) = scan.streak("Maximal consecutive loss (count)", false);
    let avg_wins = scan.value("Average consecutive wins") as i64;
    let avg_losses = scan.value("Average consecutive losses") as i64;

    let largest_profit_trade = scan.value("Largest profit trade");
    let largest_loss_trade = scan.value("Largest loss trade");
    let avg_profit_trade = scan.value("Average profit trade");
    let avg_loss_trade = scan.value("Average loss trade");

    let min_holding = scan.text("Minimal position holding time");
    let max_holding = scan.text("Maximal position holding time");
    let avg_holding = scan.text("Average position holding time");

    let total_commission = scan.value("Total commission");
    let total_swap = scan.value("Total swap");

    let (short_trades, short_win_pct) = scan.count_pct("Short Trades (won %)");
    let (long_trades, long_win_pct) = scan.count_pct("Long Trades (won %)");
    let (profit_trades, _) = scan.count_pct("Profit Trades (% of total)");
    let (loss_trades, _) = scan.count_pct("Loss Trades (% of total)");

    // Overall win rate reconstructed from the direction split
    let win_rate = if short_trades + long_trades > 0 {
        (short_win_pct * short_trades as f64 + long_win_pct * long_trades as f64)
            / (short_trades + long_trades) as f64
    } else {
        0.0
    };

    let matched = CORE_LABELS
        .iter()
        .filter(|label| scan.found.contains(**label))
        .count();
    if matched < 2 {
        return Err(ReportError::MissingCoreFields {
            matched,
            required: CORE_LABELS.len(),
        });
    }

    Ok(BacktestReport {
        history_quality_pct,
        bars,
        ticks,
        symbols,
        profit,
        profit_factor,
        max_drawdown_pct,
        max_drawdown,
        total_trades,
        win_rate,
        sharpe,
        expected_payoff,
        recovery_factor,
        gross_profit,
        gross_loss,
        z_score,
        z_score_confidence_pct,
        ahpr,
        ghpr,
        lr_correlation,
        lr_standard_error,
        initial_deposit,
        drawdown: DrawdownBreakdown {
            balance_abs,
            balance_max,
            balance_rel_pct,
            equity_abs,
            equity_max,
            equity_rel_pct,
        },
        streaks: Streaks {
            max_consecutive_wins: max_wins,
            max_consecutive_wins_amount: max_wins_amount,
            max_consecutive_losses: max_losses,
            max_consecutive_losses_amount: max_losses_amount,
            max_consecutive_profit: max_profit,
            max_consecutive_profit_count: max_profit_count,
            max_consecutive_loss: max_loss,
            max_consecutive_loss_count: max_loss_count,
            avg_consecutive_wins: avg_wins,
            avg_consecutive_losses: avg_losses,
        },
        trade_sizes: TradeSizes {
            largest_profit_trade,
            largest_loss_trade,
            avg_profit_trade,
            avg_loss_trade,
            profit_trades,
            loss_trades,
        },
        holding_times: HoldingTimes {
            min: min_holding,
            max: max_holding,
            avg: avg_holding,
        },
        costs: Costs {
            total_commission,
            total_swap,
        },
        direction: DirectionSplit {
            short_trades,
            short_win_pct,
            long_trades,
            long_win_pct,
        },
    })
}
