//! Tester config (INI) generation: `[Tester]` and `[TesterInputs]` sections
//! the simulator consumes for both single runs and optimization sweeps.

use std::collections::BTreeMap;

use chrono::NaiveDate;

use crate::config::TesterDefaults;
use crate::domain::{BacktestDates, DataModel, OptimizationRange};

/// Prefixes that mark boolean feature toggles by naming convention; when such
/// a parameter is optimized it sweeps 0/1.
pub const BOOL_TOGGLE_PREFIXES: &[&str] = &["Enable_", "Use_", "Avoid_", "Allow_", "Is_", "Has_"];

/// Timeframe string to the tester's period-in-minutes code. Unknown
/// timeframes fall back to H1.
pub fn timeframe_minutes(timeframe: &str) -> u32 {
    match timeframe.to_ascii_uppercase().as_str() {
        "M1" => 1,
        "M5" => 5,
        "M15" => 15,
        "M30" => 30,
        "H4" => 240,
        "D1" => 1440,
        "W1" => 10_080,
        "MN1" => 43_200,
        _ => 60,
    }
}

pub fn format_date(date: NaiveDate) -> String {
    date.format("%Y.%m.%d").to_string()
}

fn is_bool_toggle(name: &str) -> bool {
    BOOL_TOGGLE_PREFIXES.iter().any(|p| name.starts_with(p))
}

fn render_value(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s.clone(),
        serde_json::Value::Bool(b) => b.to_string(),
        other => other.to_string(),
    }
}

fn format_num(value: f64) -> String {
    if (value.fract()).abs() < 1e-12 {
        format!("{}", value as i64)
    } else {
        value.to_string()
    }
}

/// One `[TesterInputs]` line: `name=value||start||step||stop||Y|N`.
fn input_line(range: &OptimizationRange) -> String {
    let name = &range.name;

    // Fixed booleans keep their native spelling and never sweep
    if let Some(fixed) = &range.fixed_value {
        if let serde_json::Value::Bool(b) = fixed {
            return format!("{name}={b}||{b}||0||{b}||N");
        }
    }

    if range.optimize {
        // Toggles recognized by name sweep 0/1 regardless of supplied bounds
        if is_bool_toggle(name) {
            return format!("{name}=0||0||1||1||Y");
        }
        let start = format_num(range.start);
        let stop = format_num(range.stop);
        let step = format_num(range.step.unwrap_or(1.0));
        return format!("{name}={start}||{start}||{step}||{stop}||Y");
    }

    let value = render_value(&range.pinned_value());
    format!("{name}={value}||{value}||0||{value}||N")
}

#[derive(Debug, Clone)]
pub struct TesterSection<'a> {
    pub expert: &'a str,
    pub symbol: &'a str,
    pub timeframe: &'a str,
    pub from: NaiveDate,
    pub to: NaiveDate,
    pub model: DataModel,
    pub latency_ms: u32,
    pub spread_points: Option<i64>,
    pub report_name: &'a str,
    pub defaults: &'a TesterDefaults,
}

fn tester_section(
    section: &TesterSection<'_>,
    optimization_mode: u8,
    forward: Option<(u8, NaiveDate)>,
) -> Vec<String> {
    let mut lines = vec![
        "[Tester]".to_string(),
        format!("Expert={}", section.expert),
        format!("Symbol={}", section.symbol),
        format!("Period={}", timeframe_minutes(section.timeframe)),
        format!("FromDate={}", format_date(section.from)),
        format!("ToDate={}", format_date(section.to)),
        format!("Model={}", section.model.tester_code()),
        format!("ExecutionMode={}", section.latency_ms),
    ];
    if let Some(spread) = section.spread_points {
        lines.push(format!("Spread={spread}"));
    }
    lines.push(format!("Optimization={optimization_mode}"));
    if optimization_mode > 0 {
        lines.push(format!(
            "OptimizationCriterion={}",
            section.defaults.optimization_criterion
        ));
    }
    match forward {
        Some((mode, date)) => {
            lines.push(format!("ForwardMode={mode}"));
            lines.push(format!("ForwardDate={}", format_date(date)));
        }
        None => lines.push("ForwardMode=0".to_string()),
    }
    lines.push(format!("Report={}", section.report_name));
    lines.push("ReplaceReport=1".to_string());
    lines.push("UseLocal=1".to_string());
    lines.push("Visual=0".to_string());
    lines.push("ShutdownTerminal=1".to_string());
    lines.push(format!("Deposit={}", format_num(section.defaults.deposit)));
    lines.push(format!("Currency={}", section.defaults.currency));
    lines.push(format!("Leverage={}", section.defaults.leverage));
    lines
}

/// Render an optimization config: genetic sweep with a forward split.
pub fn optimization_ini(
    section: &TesterSection<'_>,
    dates: &BacktestDates,
    ranges: &[OptimizationRange],
) -> String {
    let mut lines = tester_section(
        section,
        section.defaults.optimization_mode,
        Some((section.defaults.forward_mode, dates.split)),
    );
    lines.push(String::new());
    lines.push("[TesterInputs]".to_string());
    for range in ranges {
        lines.push(input_line(range));
    }
    lines.join("\n")
}

/// Render a single-run config with fixed parameter overrides.
pub fn backtest_ini(
    section: &TesterSection<'_>,
    params: &BTreeMap<String, String>,
) -> String {
    let mut lines = tester_section(section, 0, None);
    if !params.is_empty() {
        lines.push(String::new());
        lines.push("[TesterInputs]".to_string());
        for (name, value) in params {
            lines.push(format!("{name}={value}"));
        }
    }
    lines.join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn defaults() -> TesterDefaults {
        TesterDefaults::default()
    }

    fn section<'a>(defaults: &'a TesterDefaults, report: &'a str) -> TesterSection<'a> {
        TesterSection {
            expert: "Demo_stress_test.ex5",
            symbol: "GBPUSD",
            timeframe: "H1",
            from: NaiveDate::from_ymd_opt(2022, 7, 1).unwrap(),
            to: NaiveDate::from_ymd_opt(2026, 7, 1).unwrap(),
            model: DataModel::OhlcMinute,
            latency_ms: 10,
            spread_points: None,
            report_name: report,
            defaults,
        }
    }

    fn dates() -> BacktestDates {
        BacktestDates {
            start: NaiveDate::from_ymd_opt(2022, 7, 1).unwrap(),
            split: NaiveDate::from_ymd_opt(2025, 7, 1).unwrap(),
            end: NaiveDate::from_ymd_opt(2026, 7, 1).unwrap(),
        }
    }

    #[test]
    fn timeframe_codes() {
        assert_eq!(timeframe_minutes("M1"), 1);
        assert_eq!(timeframe_minutes("m15"), 15);
        assert_eq!(timeframe_minutes("H1"), 60);
        assert_eq!(timeframe_minutes("H4"), 240);
        assert_eq!(timeframe_minutes("D1"), 1440);
        assert_eq!(timeframe_minutes("MN1"), 43_200);
        assert_eq!(timeframe_minutes("???"), 60);
    }

    #[test]
    fn optimization_ini_carries_forward_split_and_criterion() {
        let defaults = defaults();
        let ini = optimization_ini(
            &section(&defaults, "Demo_OPT"),
            &dates(),
            &[OptimizationRange::sweep("Period", 5.0, 1.0, 50.0)],
        );
        assert!(ini.contains("Expert=Demo_stress_test.ex5"));
        assert!(ini.contains("Period=60"));
        assert!(ini.contains("FromDate=2022.07.01"));
        assert!(ini.contains("ToDate=2026.07.01"));
        assert!(ini.contains("Optimization=2"));
        assert!(ini.contains("OptimizationCriterion=6"));
        assert!(ini.contains("ForwardMode=2"));
        assert!(ini.contains("ForwardDate=2025.07.01"));
        assert!(ini.contains("Report=Demo_OPT"));
        assert!(ini.contains("ShutdownTerminal=1"));
        assert!(ini.contains("Period=5||5||1||50||Y"));
    }

    #[test]
    fn swept_range_line_format() {
        let r = OptimizationRange::sweep("StopLossPips", 10.0, 5.0, 100.0);
        assert_eq!(input_line(&r), "StopLossPips=10||10||5||100||Y");
    }

    #[test]
    fn fixed_range_line_format() {
        let r = OptimizationRange::fixed("Lots", 0.1);
        assert_eq!(input_line(&r), "Lots=0.1||0.1||0||0.1||N");
    }

    #[test]
    fn fixed_bool_keeps_native_spelling() {
        let mut r = OptimizationRange::fixed("Use_News_Filter", 1.0);
        r.fixed_value = Some(serde_json::Value::Bool(true));
        assert_eq!(input_line(&r), "Use_News_Filter=true||true||0||true||N");
    }

    #[test]
    fn optimized_bool_toggle_sweeps_zero_one() {
        let r = OptimizationRange::sweep("Enable_Trailing", 0.0, 1.0, 1.0);
        assert_eq!(input_line(&r), "Enable_Trailing=0||0||1||1||Y");
        // The prefix convention applies even with odd bounds
        let odd = OptimizationRange::sweep("Avoid_News", 3.0, 2.0, 9.0);
        assert_eq!(input_line(&odd), "Avoid_News=0||0||1||1||Y");
    }

    #[test]
    fn backtest_ini_disables_optimization_and_forward() {
        let defaults = defaults();
        let mut params = BTreeMap::new();
        params.insert("Period".to_string(), "14".to_string());
        let ini = backtest_ini(&section(&defaults, "Demo_BT"), &params);
        assert!(ini.contains("Optimization=0"));
        assert!(ini.contains("ForwardMode=0"));
        assert!(!ini.contains("OptimizationCriterion"));
        assert!(ini.contains("[TesterInputs]"));
        assert!(ini.contains("Period=14"));
    }

    #[test]
    fn spread_line_only_when_set() {
        let defaults = defaults();
        let mut s = section(&defaults, "Demo_BT");
        let ini = backtest_ini(&s, &BTreeMap::new());
        assert!(!ini.contains("Spread="));

        s.spread_points = Some(20);
        let ini = backtest_ini(&s, &BTreeMap::new());
        assert!(ini.contains("Spread=20"));
    }
}
