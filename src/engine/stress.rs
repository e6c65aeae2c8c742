//! Stress-scenario suite: deterministic enumeration of replay windows and
//! execution variants, tick-data coverage validation, and post-hoc cost
//! overlays computed from the base scenario's trade list without re-running
//! the simulator.

use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{Datelike, Days, Months, NaiveDate};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::config::StressConfig;
use crate::domain::{
    BacktestDates, DataModel, OverlaySettings, Scenario, ScenarioSettings, ScenarioVariant,
    ScenarioWindow, Trade,
};
use crate::sim::{BacktestRequest, ProgressSink, Simulator};

/// Collapse a free-form id into a filesystem- and report-safe token.
pub fn sanitize_id(value: &str, max_len: usize) -> String {
    let mut out = String::with_capacity(value.len());
    let mut last_underscore = false;
    for c in value.trim().chars() {
        if c.is_ascii_alphanumeric() || c == '_' {
            out.push(c);
            last_underscore = c == '_';
        } else if !last_underscore {
            out.push('_');
            last_underscore = true;
        }
    }
    let trimmed = out.trim_matches('_');
    let token = if trimmed.is_empty() { "scenario" } else { trimmed };
    token.chars().take(max_len).collect()
}

/// Deterministic report name for a scenario run. Long ids truncate, so an
/// 8-hex-char digest of `(ea_stem, scenario_id)` keeps names unique.
pub fn scenario_report_name(ea_stem: &str, scenario_id: &str) -> String {
    let ea_short = sanitize_id(ea_stem, 18);
    let sc_short = sanitize_id(scenario_id, 18);
    let digest = Sha256::digest(format!("{ea_stem}:{scenario_id}").as_bytes());
    let suffix = hex::encode(&digest[..4]);
    sanitize_id(&format!("{ea_short}_S12_{sc_short}_{suffix}"), 60)
}

fn month_id(date: NaiveDate) -> String {
    format!("{:04}{:02}", date.year(), date.month())
}

fn months_between(start: NaiveDate, end: NaiveDate) -> Vec<String> {
    let mut months = Vec::new();
    let mut cursor = start.with_day(1).unwrap_or(start);
    let last = end.with_day(1).unwrap_or(end);
    while cursor <= last {
        months.push(month_id(cursor));
        cursor = match cursor.checked_add_months(Months::new(1)) {
            Some(next) => next,
            None => break,
        };
    }
    months
}

/// Enumerate the scenario suite from config, anchored to the workflow end
/// date. Output order and ids are fully determined by the inputs.
pub fn enumerate_scenarios(config: &StressConfig, anchor: NaiveDate) -> Vec<Scenario> {
    let mut scenarios = Vec::new();

    let add_window = |scenarios: &mut Vec<Scenario>, window: &ScenarioWindow| {
        for model in &config.models {
            let base_id = format!("{}_{}", model.short_name(), window.id);
            let model_label = match model {
                DataModel::Tick => "Tick",
                DataModel::OhlcMinute => "OHLC (1m)",
            };
            scenarios.push(Scenario {
                id: base_id.clone(),
                label: format!("{model_label} - {}", window.label),
                period_id: window.id.clone(),
                variant: ScenarioVariant::Base,
                window: window.clone(),
                settings: ScenarioSettings {
                    from: window.from,
                    to: window.to,
                    model: *model,
                    latency_ms: 0,
                    spread_points: None,
                },
                tags: vec!["window".into(), model.short_name().into()],
                overlay_settings: None,
                base_scenario_id: None,
            });

            if *model == DataModel::Tick {
                for latency in &config.tick_latencies_ms {
                    scenarios.push(Scenario {
                        id: format!("{base_id}_latency_{latency}ms"),
                        label: format!("Tick + latency {latency}ms - {}", window.label),
                        period_id: window.id.clone(),
                        variant: ScenarioVariant::Base,
                        window: window.clone(),
                        settings: ScenarioSettings {
                            from: window.from,
                            to: window.to,
                            model: DataModel::Tick,
                            latency_ms: *latency,
                            spread_points: None,
                        },
                        tags: vec!["window".into(), "tick".into(), "latency".into()],
                        overlay_settings: None,
                        base_scenario_id: None,
                    });
                }
            }
        }
    };

    for days in &config.rolling_days {
        if *days == 0 {
            continue;
        }
        let from = anchor.checked_sub_days(Days::new(u64::from(*days))).unwrap_or(anchor);
        let window = ScenarioWindow {
            id: format!("last_{days}d"),
            label: format!("Last {days} days"),
            from,
            to: anchor,
        };
        add_window(&mut scenarios, &window);
    }

    for months_ago in &config.calendar_months_ago {
        if *months_ago == 0 {
            continue;
        }
        let anchor_month = anchor.with_day(1).unwrap_or(anchor);
        let Some(target_start) = anchor_month.checked_sub_months(Months::new(*months_ago)) else {
            continue;
        };
        let Some(next_month) = target_start.checked_add_months(Months::new(1)) else {
            continue;
        };
        let target_end = next_month.pred_opt().unwrap_or(next_month);

        let window = ScenarioWindow {
            id: format!("month_{}_{:02}", target_start.year(), target_start.month()),
            label: target_start.format("%b %Y").to_string(),
            from: target_start,
            to: target_end,
        };
        add_window(&mut scenarios, &window);
    }

    scenarios
}

/// Tick-data coverage for a scenario window.
///
/// The simulator reports "History Quality 100%" even when it synthesized the
/// ticks; real coverage means a per-month tick file exists for every month in
/// the window. The live cache counts only for the current calendar month.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TickCoverage {
    pub server: Option<String>,
    pub tick_dir: Option<PathBuf>,
    pub months_needed: Vec<String>,
    pub months_present: Vec<String>,
    pub months_missing: Vec<String>,
    pub live_cache_used: bool,
    pub coverage_ok: bool,
}

fn canonical_symbol(symbol: &str) -> String {
    symbol
        .chars()
        .filter(char::is_ascii_alphabetic)
        .collect::<String>()
        .to_ascii_uppercase()
}

/// Locate the tick folder for a symbol: `<data>/bases/<server>/ticks/<SYMBOL>/`.
/// When several servers carry it, prefer the one with the most tick data.
fn find_tick_dir(data_path: &Path, symbol: &str) -> Option<(PathBuf, String)> {
    let bases = data_path.join("bases");
    let sym = canonical_symbol(symbol);
    if sym.is_empty() {
        return None;
    }

    let mut candidates: Vec<((usize, u64), PathBuf, String)> = Vec::new();
    let entries = std::fs::read_dir(&bases).ok()?;
    for entry in entries.flatten() {
        let server_dir = entry.path();
        if !server_dir.is_dir() {
            continue;
        }
        let tick_dir = server_dir.join("ticks").join(&sym);
        if !tick_dir.is_dir() {
            continue;
        }
        let mut count = 0usize;
        let mut size = 0u64;
        if let Ok(files) = std::fs::read_dir(&tick_dir) {
            for file in files.flatten() {
                if file.path().extension().is_some_and(|e| e == "tkc") {
                    count += 1;
                    size += file.metadata().map(|m| m.len()).unwrap_or(0);
                }
            }
        }
        let server = entry.file_name().to_string_lossy().into_owned();
        candidates.push(((count, size), tick_dir, server));
    }

    candidates.sort_by(|a, b| b.0.cmp(&a.0));
    candidates.into_iter().next().map(|(_, dir, server)| (dir, server))
}

pub fn tick_file_coverage(
    data_path: &Path,
    symbol: &str,
    from: NaiveDate,
    to: NaiveDate,
    today: NaiveDate,
) -> TickCoverage {
    let Some((tick_dir, server)) = find_tick_dir(data_path, symbol) else {
        return TickCoverage::default();
    };

    let months_needed = months_between(from, to);
    let mut months_present = Vec::new();
    let mut months_missing = Vec::new();
    for month in &months_needed {
        if tick_dir.join(format!("{month}.tkc")).exists() {
            months_present.push(month.clone());
        } else {
            months_missing.push(month.clone());
        }
    }

    // ticks.dat is the running-month cache; it never covers past months
    let mut live_cache_used = false;
    let live_month = month_id(today);
    let end_month = month_id(to);
    if end_month == live_month {
        let cache = tick_dir.join("ticks.dat");
        let has_cache = cache.metadata().map(|m| m.len() > 0).unwrap_or(false);
        if has_cache {
            if let Some(pos) = months_missing.iter().position(|m| *m == end_month) {
                months_missing.remove(pos);
                live_cache_used = true;
            }
        }
    }

    let coverage_ok = months_missing.is_empty();
    TickCoverage {
        server: Some(server),
        tick_dir: Some(tick_dir),
        months_needed,
        months_present,
        months_missing,
        live_cache_used,
        coverage_ok,
    }
}

/// Pip size for a symbol: JPY-quoted pairs use 0.01, everything else 0.0001,
/// with a decimal-count fallback for unrecognized symbols.
pub fn infer_pip_size(symbol: &str, sample_prices: &[f64]) -> f64 {
    let sym = canonical_symbol(symbol);
    if sym.len() >= 6 {
        return if &sym[3..6] == "JPY" { 0.01 } else { 0.0001 };
    }

    let mut digits = 0usize;
    for price in sample_prices {
        let text = format!("{price:.10}");
        let fractional = text.trim_end_matches('0');
        if let Some(dot) = fractional.find('.') {
            digits = digits.max(fractional.len() - dot - 1);
        }
    }
    match digits {
        d if d >= 4 => 0.0001,
        2 | 3 => 0.01,
        _ => 0.0001,
    }
}

/// Estimate the account-currency value of one pip per lot from the sample:
/// median of `|gross_profit| / (|Δprice| / pip_size × volume)` over trades
/// with usable prices. The median resists outliers and conversion-rate drift.
pub fn estimate_pip_value_per_lot(trades: &[Trade], symbol: &str) -> Option<f64> {
    let prices: Vec<f64> = trades
        .iter()
        .filter(|t| t.open_price != 0.0 && t.close_price != 0.0 && t.volume > 0.0)
        .flat_map(|t| [t.open_price, t.close_price])
        .collect();

    let pip_size = infer_pip_size(symbol, &prices);
    if pip_size <= 0.0 {
        return None;
    }

    let mut samples: Vec<f64> = Vec::new();
    for trade in trades {
        if trade.volume <= 0.0 {
            continue;
        }
        let diff = (trade.close_price - trade.open_price).abs();
        if diff <= 0.0 {
            continue;
        }
        let pips = diff / pip_size;
        let gross = if trade.gross_profit != 0.0 {
            trade.gross_profit
        } else {
            trade.net_profit
        };
        if gross == 0.0 {
            continue;
        }
        let value = gross.abs() / (pips * trade.volume);
        if value > 0.0 && value <= 1e6 {
            samples.push(value);
        }
    }

    if samples.is_empty() {
        return None;
    }
    samples.sort_by(f64::total_cmp);
    let mid = samples.len() / 2;
    let median = if samples.len() % 2 == 0 {
        (samples[mid - 1] + samples[mid]) / 2.0
    } else {
        samples[mid]
    };
    Some(median)
}

/// Metrics of a cost overlay recomputed over the close-time-ordered equity
/// curve.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OverlayMetrics {
    pub profit: f64,
    pub profit_factor: f64,
    pub max_drawdown_pct: f64,
    pub total_trades: u64,
    pub extra_pips_per_trade: f64,
    pub pip_value_per_lot: f64,
    pub overlay_cost_total: f64,
}

/// Apply per-trade costs `pip_value × volume × extra_pips` and recompute
/// profit, profit factor, and max drawdown. Pure; same inputs give identical
/// numbers on every run.
pub fn apply_cost_overlay(
    trades: &[Trade],
    initial_balance: f64,
    pip_value_per_lot: f64,
    overlay: &OverlaySettings,
) -> OverlayMetrics {
    let extra_pips = overlay.extra_pips();

    let mut rows: Vec<(chrono::NaiveDateTime, f64, f64)> = trades
        .iter()
        .map(|t| {
            let cost = pip_value_per_lot * t.volume * extra_pips;
            (t.close_time, t.net_profit - cost, cost)
        })
        .collect();
    rows.sort_by_key(|(close_time, _, _)| *close_time);

    let mut profit = 0.0;
    let mut gross_profit = 0.0;
    let mut gross_loss = 0.0;
    let mut overlay_cost_total = 0.0;

    let mut balance = initial_balance;
    let mut peak = if balance != 0.0 { balance } else { 1e-9 };
    let mut max_dd = 0.0_f64;

    for (_, adjusted, cost) in rows {
        overlay_cost_total += cost;
        profit += adjusted;
        if adjusted > 0.0 {
            gross_profit += adjusted;
        } else if adjusted < 0.0 {
            gross_loss += adjusted.abs();
        }

        balance += adjusted;
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

    let profit_factor = if gross_loss <= 1e-12 {
        if gross_profit > 0.0 {
            99.0
        } else {
            0.0
        }
    } else {
        gross_profit / gross_loss
    };

    OverlayMetrics {
        profit,
        profit_factor,
        max_drawdown_pct: max_dd * 100.0,
        total_trades: trades.len() as u64,
        extra_pips_per_trade: extra_pips,
        pip_value_per_lot,
        overlay_cost_total,
    }
}

/// Headline numbers recorded per scenario.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ScenarioMetrics {
    pub profit: f64,
    pub profit_factor: f64,
    pub max_drawdown_pct: f64,
    pub total_trades: u64,
    pub history_quality_pct: f64,
    #[serde(default)]
    pub tick_files_ok: Option<bool>,
    #[serde(default)]
    pub tick_files_missing: Option<Vec<String>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScenarioResult {
    pub scenario: Scenario,
    pub success: bool,
    pub report_name: String,
    pub metrics: ScenarioMetrics,
    #[serde(default)]
    pub report_path: Option<String>,
    #[serde(default)]
    pub tick_coverage: Option<TickCoverage>,
    #[serde(default)]
    pub errors: Vec<String>,
}

/// The best pass's full-period backtest, packaged so it can join overlay
/// generation. The baseline itself is never listed as a scenario row; only
/// its cost-overlay variants appear in the results.
pub fn full_period_baseline(
    dates: &BacktestDates,
    model: DataModel,
    latency_ms: u32,
    metrics: ScenarioMetrics,
    report_path: String,
) -> ScenarioResult {
    let window = ScenarioWindow {
        id: "full".into(),
        label: "Full period".into(),
        from: dates.start,
        to: dates.end,
    };
    ScenarioResult {
        scenario: Scenario {
            id: "baseline_full".into(),
            label: "Baseline (best pass) - full period".into(),
            period_id: "full".into(),
            variant: ScenarioVariant::Base,
            window: window.clone(),
            settings: ScenarioSettings {
                from: window.from,
                to: window.to,
                model,
                latency_ms,
                spread_points: None,
            },
            tags: vec!["baseline".into(), model.short_name().into()],
            overlay_settings: None,
            base_scenario_id: None,
        },
        success: true,
        report_name: String::new(),
        metrics,
        report_path: Some(report_path),
        tick_coverage: None,
        errors: Vec::new(),
    }
}

/// Run the base scenarios through the simulator, then derive the cost-overlay
/// variants from each eligible base's trade list. Latency variants are not
/// overlay bases. An optional full-period `baseline` joins overlay generation
/// without appearing as a scenario row of its own.
#[allow(clippy::too_many_arguments)]
pub fn run_scenarios(
    simulator: &dyn Simulator,
    binary_path: &Path,
    symbol: &str,
    timeframe: &str,
    params: &std::collections::BTreeMap<String, String>,
    config: &StressConfig,
    dates: &BacktestDates,
    today: NaiveDate,
    terminal_data_path: Option<&Path>,
    baseline: Option<&ScenarioResult>,
    progress: &dyn ProgressSink,
) -> Vec<ScenarioResult> {
    let scenarios = enumerate_scenarios(config, dates.end);
    let ea_stem = binary_path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "ea".to_string());

    let mut results: Vec<ScenarioResult> = Vec::new();
    let total = scenarios.len();

    for (index, scenario) in scenarios.into_iter().enumerate() {
        let report_name = scenario_report_name(&ea_stem, &scenario.id);
        progress.update(&format!(
            "stress {}/{}: {} ({} -> {})",
            index + 1,
            total,
            scenario.id,
            scenario.settings.from,
            scenario.settings.to
        ));

        let request = BacktestRequest {
            binary_path: binary_path.to_path_buf(),
            symbol: symbol.to_string(),
            timeframe: timeframe.to_string(),
            params: params.clone(),
            from: Some(scenario.settings.from),
            to: Some(scenario.settings.to),
            model: Some(scenario.settings.model),
            latency_ms: Some(scenario.settings.latency_ms),
            spread_points: scenario.settings.spread_points,
            report_name: Some(report_name.clone()),
            timeout: Duration::from_secs(config.timeout_per_scenario_s),
        };
        let outcome = simulator.backtest(&request);

        let tick_coverage = if scenario.settings.model == DataModel::Tick {
            terminal_data_path.map(|data_path| {
                tick_file_coverage(
                    data_path,
                    symbol,
                    scenario.settings.from,
                    scenario.settings.to,
                    today,
                )
            })
        } else {
            None
        };

        let metrics = ScenarioMetrics {
            profit: outcome.metrics.profit,
            profit_factor: outcome.metrics.profit_factor,
            max_drawdown_pct: outcome.metrics.max_drawdown_pct,
            total_trades: outcome.metrics.total_trades,
            history_quality_pct: outcome.history_quality_pct,
            tick_files_ok: tick_coverage.as_ref().map(|c| c.coverage_ok),
            tick_files_missing: tick_coverage.as_ref().map(|c| c.months_missing.clone()),
        };

        results.push(ScenarioResult {
            scenario,
            success: outcome.success,
            report_name,
            metrics,
            report_path: outcome
                .report_path
                .as_ref()
                .map(|p| p.to_string_lossy().into_owned()),
            tick_coverage,
            errors: outcome.errors,
        });
    }

    if config.include_overlays {
        let overlays = build_overlays(baseline, &results, symbol, config, progress);
        results.extend(overlays);
    }

    results
}

fn build_overlays(
    baseline: Option<&ScenarioResult>,
    bases: &[ScenarioResult],
    symbol: &str,
    config: &StressConfig,
    progress: &dyn ProgressSink,
) -> Vec<ScenarioResult> {
    let mut overlays = Vec::new();

    for base in baseline.into_iter().chain(bases) {
        if !base.success {
            continue;
        }
        if base.scenario.tags.iter().any(|t| t == "latency") {
            continue;
        }
        let Some(report_path) = base.report_path.as_deref() else {
            continue;
        };

        let extraction = match crate::report::deals::extract_trades(Path::new(report_path)) {
            Ok(extraction) => extraction,
            Err(err) => {
                overlays.push(overlay_error(base, format!("trade extraction failed: {err}")));
                continue;
            }
        };
        let Some(pip_value) = estimate_pip_value_per_lot(&extraction.trades, symbol) else {
            overlays.push(overlay_error(
                base,
                "could not estimate pip value for overlay costs".to_string(),
            ));
            continue;
        };

        for spread in &config.overlay_spread_pips {
            for slippage in &config.overlay_slippage_pips {
                if *spread == 0.0 && *slippage == 0.0 {
                    continue;
                }
                let settings = OverlaySettings {
                    spread_pips: *spread,
                    slippage_pips: *slippage,
                    slippage_sides: config.overlay_slippage_sides,
                };
                let metrics = apply_cost_overlay(
                    &extraction.trades,
                    extraction.initial_balance,
                    pip_value,
                    &settings,
                );

                let overlay_id = sanitize_id(
                    &format!("{}_overlay_sp{}_sl{}", base.scenario.id, spread, slippage),
                    60,
                );
                let mut scenario = base.scenario.clone();
                scenario.id = overlay_id;
                scenario.label = format!(
                    "{} + costs (spread {spread}p, slip {slippage}p x{})",
                    base.scenario.label, config.overlay_slippage_sides
                );
                scenario.variant = ScenarioVariant::Overlay;
                scenario.overlay_settings = Some(settings);
                scenario.base_scenario_id = Some(base.scenario.id.clone());
                if !scenario.tags.iter().any(|t| t == "overlay") {
                    scenario.tags.push("overlay".into());
                }

                overlays.push(ScenarioResult {
                    scenario,
                    success: true,
                    report_name: base.report_name.clone(),
                    metrics: ScenarioMetrics {
                        profit: metrics.profit,
                        profit_factor: metrics.profit_factor,
                        max_drawdown_pct: metrics.max_drawdown_pct,
                        total_trades: metrics.total_trades,
                        history_quality_pct: base.metrics.history_quality_pct,
                        tick_files_ok: base.metrics.tick_files_ok,
                        tick_files_missing: base.metrics.tick_files_missing.clone(),
                    },
                    report_path: base.report_path.clone(),
                    tick_coverage: base.tick_coverage.clone(),
                    errors: Vec::new(),
                });
            }
        }
    }

    progress.update(&format!("stress overlays: {} rows", overlays.len()));
    overlays
}

fn overlay_error(base: &ScenarioResult, error: String) -> ScenarioResult {
    let mut scenario = base.scenario.clone();
    scenario.id = sanitize_id(&format!("{}_overlay_error", base.scenario.id), 60);
    scenario.label = format!("{} + costs (overlay unavailable)", base.scenario.label);
    scenario.variant = ScenarioVariant::Overlay;
    scenario.base_scenario_id = Some(base.scenario.id.clone());

    ScenarioResult {
        scenario,
        success: false,
        report_name: base.report_name.clone(),
        metrics: base.metrics.clone(),
        report_path: base.report_path.clone(),
        tick_coverage: base.tick_coverage.clone(),
        errors: vec![error],
    }
}
