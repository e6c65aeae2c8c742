//! Child-process adapter for a real simulator install: config generation,
//! stale-process cleanup, timeout enforcement, heartbeat progress, and strict
//! report-file resolution.

use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};

use sysinfo::System;

use super::ini::{backtest_ini, optimization_ini, TesterSection};
use super::{
    BacktestOutcome, BacktestRequest, CompileOutcome, OptimizationOutcome, OptimizeRequest,
    ProgressSink, Simulator,
};
use crate::config::{TerminalInstall, TesterDefaults};
use crate::domain::BacktestDates;
use crate::report::{html, xml};

/// Allowance for filesystem timestamp skew when matching reports to a run.
const MTIME_SKEW: Duration = Duration::from_secs(2);

/// How long to wait for the simulator to flush report files after exit.
const REPORT_FLUSH_WAIT: Duration = Duration::from_millis(500);
const REPORT_FLUSH_RETRIES: u32 = 10;

const COMPILE_TIMEOUT: Duration = Duration::from_secs(60);

pub struct TerminalSimulator {
    install: TerminalInstall,
    defaults: TesterDefaults,
    dates: BacktestDates,
    progress: Arc<dyn ProgressSink>,
    progress_interval: Duration,
}

impl TerminalSimulator {
    pub fn new(
        install: TerminalInstall,
        defaults: TesterDefaults,
        dates: BacktestDates,
        progress: Arc<dyn ProgressSink>,
        progress_interval: Duration,
    ) -> Self {
        Self {
            install,
            defaults,
            dates,
            progress,
            progress_interval,
        }
    }

    /// Kill residual terminal/metatester processes from this install. The
    /// install is exclusively owned for the duration of a call; leftovers
    /// from a crashed run would otherwise hold the tester lock forever.
    fn kill_stale_processes(&self) {
        let mut targets: Vec<PathBuf> = vec![normalized(&self.install.exe_path)];
        if let Some(parent) = self.install.exe_path.parent() {
            let metatester = parent.join("metatester64.exe");
            if metatester.exists() {
                targets.push(normalized(&metatester));
            }
        }

        let sys = System::new_all();
        let mut killed = 0u32;
        for process in sys.processes().values() {
            let Some(exe) = process.exe() else { continue };
            if targets.iter().any(|t| t == &normalized(exe)) && process.kill() {
                killed += 1;
            }
        }
        if killed > 0 {
            tracing::warn!(killed, "killed stale simulator processes");
            // Give the OS a moment to release the install's locks
            std::thread::sleep(Duration::from_millis(500));
        }
    }

    /// Run the terminal with a config file, enforcing the timeout and emitting
    /// heartbeats while blocked.
    fn run_terminal(&self, ini_path: &Path, timeout: Duration, label: &str) -> Result<(), String> {
        let mut child = Command::new(&self.install.exe_path)
            .arg(format!("/config:{}", ini_path.display()))
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|e| format!("failed to start simulator: {e}"))?;

        let started = Instant::now();
        let mut last_tick = started;
        loop {
            match child.try_wait() {
                Ok(Some(_status)) => return Ok(()),
                Ok(None) => {}
                Err(e) => return Err(format!("failed to poll simulator: {e}")),
            }
            if started.elapsed() > timeout {
                let _ = child.kill();
                let _ = child.wait();
                return Err(format!("simulator timed out after {}s", timeout.as_secs()));
            }
            if last_tick.elapsed() >= self.progress_interval {
                self.progress.update(&format!(
                    "{label} running ({}s elapsed)",
                    started.elapsed().as_secs()
                ));
                last_tick = Instant::now();
            }
            std::thread::sleep(Duration::from_millis(500));
        }
    }

    fn search_dirs(&self) -> Vec<PathBuf> {
        vec![
            self.install.data_path.clone(),
            self.install.data_path.join("Tester"),
            self.install.data_path.join("Tester").join("reports"),
        ]
    }

    fn ini_dir(&self) -> PathBuf {
        self.install.data_path.join("MQL5").join("Files")
    }

    /// Find the report with the exact expected name, tolerating a little
    /// timestamp skew. Never falls back to "most recent file" when a name was
    /// given: picking up a stale report from an earlier run is worse than
    /// failing.
    fn resolve_named(&self, file_name: &str, started: SystemTime) -> Option<PathBuf> {
        let threshold = started.checked_sub(MTIME_SKEW).unwrap_or(started);
        let mut stale: Option<PathBuf> = None;

        for _ in 0..REPORT_FLUSH_RETRIES {
            for dir in self.search_dirs() {
                let candidate = dir.join(file_name);
                if !candidate.exists() {
                    continue;
                }
                match candidate.metadata().and_then(|m| m.modified()) {
                    Ok(mtime) if mtime >= threshold => return Some(candidate),
                    _ => stale = Some(candidate),
                }
            }
            std::thread::sleep(REPORT_FLUSH_WAIT);
        }
        // A correctly-named file with an odd timestamp beats nothing
        stale
    }

    /// Newest file matching `extension` written after the call started; only
    /// used when the caller did not name the report.
    fn resolve_newest(&self, extensions: &[&str], started: SystemTime) -> Option<PathBuf> {
        let mut best: Option<(SystemTime, PathBuf)> = None;
        for dir in self.search_dirs() {
            let Ok(entries) = std::fs::read_dir(&dir) else { continue };
            for entry in entries.flatten() {
                let path = entry.path();
                let matches_ext = path
                    .extension()
                    .and_then(|e| e.to_str())
                    .is_some_and(|e| extensions.iter().any(|x| e.eq_ignore_ascii_case(x)));
                if !matches_ext {
                    continue;
                }
                if path
                    .file_name()
                    .and_then(|n| n.to_str())
                    .is_some_and(|n| n.to_ascii_lowercase().ends_with(".forward.xml"))
                {
                    continue;
                }
                let Ok(mtime) = entry.metadata().and_then(|m| m.modified()) else {
                    continue;
                };
                if mtime <= started {
                    continue;
                }
                if best.as_ref().map_or(true, |(t, _)| mtime > *t) {
                    best = Some((mtime, path));
                }
            }
        }
        best.map(|(_, p)| p)
    }

    fn expert_name(binary_path: &Path) -> String {
        binary_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default()
    }
}

fn normalized(path: &Path) -> PathBuf {
    let canonical = path.canonicalize().unwrap_or_else(|_| path.to_path_buf());
    PathBuf::from(canonical.to_string_lossy().to_ascii_lowercase())
}

fn decode_log(bytes: &[u8]) -> String {
    html::decode_report(bytes)
}

impl Simulator for TerminalSimulator {
    /// Compile through the editor binary that ships next to the terminal.
    /// Errors are read from the compiler log; success additionally requires
    /// the compiled binary to exist.
    fn compile(&self, ea_path: &Path) -> CompileOutcome {
        if !ea_path.exists() {
            return CompileOutcome {
                success: false,
                binary_path: None,
                errors: vec![format!("EA file not found: {}", ea_path.display())],
                warnings: Vec::new(),
            };
        }

        let editor = self
            .install
            .exe_path
            .parent()
            .map(|p| p.join("metaeditor64.exe"))
            .filter(|p| p.exists());
        let Some(editor) = editor else {
            return CompileOutcome {
                success: false,
                binary_path: None,
                errors: vec!["metaeditor64.exe not found next to the terminal".into()],
                warnings: Vec::new(),
            };
        };

        let mut child = match Command::new(&editor)
            .arg(format!("/compile:{}", ea_path.display()))
            .arg("/log")
            .current_dir(ea_path.parent().unwrap_or(Path::new(".")))
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
        {
            Ok(child) => child,
            Err(e) => {
                return CompileOutcome {
                    success: false,
                    binary_path: None,
                    errors: vec![format!("failed to start compiler: {e}")],
                    warnings: Vec::new(),
                }
            }
        };

        let started = Instant::now();
        loop {
            match child.try_wait() {
                Ok(Some(_)) => break,
                Ok(None) if started.elapsed() > COMPILE_TIMEOUT => {
                    let _ = child.kill();
                    let _ = child.wait();
                    return CompileOutcome {
                        success: false,
                        binary_path: None,
                        errors: vec!["compilation timed out after 60s".into()],
                        warnings: Vec::new(),
                    };
                }
                Ok(None) => std::thread::sleep(Duration::from_millis(200)),
                Err(e) => {
                    return CompileOutcome {
                        success: false,
                        binary_path: None,
                        errors: vec![format!("failed to poll compiler: {e}")],
                        warnings: Vec::new(),
                    }
                }
            }
        }

        let log = std::fs::read(ea_path.with_extension("log"))
            .map(|bytes| decode_log(&bytes))
            .unwrap_or_default();

        let mut errors = Vec::new();
        let mut warnings = Vec::new();
        for line in log.lines() {
            let lower = line.to_ascii_lowercase();
            if lower.contains(" : error ") || lower.contains(": error ") {
                errors.push(line.trim().to_string());
            } else if lower.contains(" : warning ") || lower.contains(": warning ") {
                warnings.push(line.trim().to_string());
            }
        }

        let binary = ea_path.with_extension("ex5");
        let success = binary.exists() && errors.is_empty();
        if !success && errors.is_empty() {
            errors.push("compilation failed: no compiled binary was produced".into());
        }

        CompileOutcome {
            success,
            binary_path: success.then_some(binary),
            errors,
            warnings,
        }
    }

    fn backtest(&self, request: &BacktestRequest) -> BacktestOutcome {
        let mut outcome = BacktestOutcome::default();

        if !request.binary_path.exists() {
            outcome
                .errors
                .push(format!("EA binary not found: {}", request.binary_path.display()));
            return outcome;
        }

        let expert = Self::expert_name(&request.binary_path);
        let ea_stem = request
            .binary_path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default();
        let report_name = request
            .report_name
            .clone()
            .unwrap_or_else(|| format!("{ea_stem}_BT"));

        let section = TesterSection {
            expert: &expert,
            symbol: &request.symbol,
            timeframe: &request.timeframe,
            from: request.from.unwrap_or(self.dates.start),
            to: request.to.unwrap_or(self.dates.end),
            model: request.model.unwrap_or(self.defaults.data_model),
            latency_ms: request
                .latency_ms
                .unwrap_or(self.defaults.execution_latency_ms),
            spread_points: request.spread_points,
            report_name: &report_name,
            defaults: &self.defaults,
        };
        let ini = backtest_ini(&section, &request.params);

        let ini_path = self.ini_dir().join("backtest.ini");
        if let Err(e) = write_config(&ini_path, &ini) {
            outcome.errors.push(e);
            return outcome;
        }

        self.kill_stale_processes();
        let started = SystemTime::now();
        let label = format!("backtest {report_name} {} {}", request.symbol, request.timeframe);
        if let Err(e) = self.run_terminal(&ini_path, request.timeout, &label) {
            outcome.errors.push(e);
            return outcome;
        }

        let report_path = if request.report_name.is_some() {
            self.resolve_named(&format!("{report_name}.html"), started)
                .or_else(|| self.resolve_named(&format!("{report_name}.htm"), started))
        } else {
            self.resolve_newest(&["html", "htm"], started)
        };
        outcome.xml_path = self.resolve_named(&format!("{report_name}.xml"), started);

        let Some(report_path) = report_path else {
            outcome
                .errors
                .push(format!("no backtest report found for report name {report_name}"));
            return outcome;
        };

        match html::parse_backtest_html(&report_path) {
            Ok(report) => {
                outcome.success = true;
                outcome.metrics = report.to_metrics();
                outcome.history_quality_pct = report.history_quality_pct;
                // Equity curve from the deal list when it parses
                if let Ok(extraction) = crate::report::deals::extract_trades(&report_path) {
                    outcome.equity_curve =
                        crate::report::deals::equity_curve(&extraction.trades, extraction.initial_balance);
                }
            }
            Err(e) => outcome.errors.push(e.to_string()),
        }
        outcome.report_path = Some(report_path);
        outcome
    }

    fn optimize(&self, request: &OptimizeRequest) -> OptimizationOutcome {
        let mut outcome = OptimizationOutcome::default();

        if !request.binary_path.exists() {
            outcome
                .errors
                .push(format!("EA binary not found: {}", request.binary_path.display()));
            return outcome;
        }

        let expert = Self::expert_name(&request.binary_path);
        let ea_stem = request
            .binary_path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default();
        let report_name = request
            .report_name
            .clone()
            .unwrap_or_else(|| format!("{ea_stem}_OPT"));

        let section = TesterSection {
            expert: &expert,
            symbol: &request.symbol,
            timeframe: &request.timeframe,
            from: self.dates.start,
            to: self.dates.end,
            model: self.defaults.data_model,
            latency_ms: self.defaults.execution_latency_ms,
            spread_points: None,
            report_name: &report_name,
            defaults: &self.defaults,
        };
        let ini = optimization_ini(&section, &self.dates, &request.ranges);

        let ini_path = self.ini_dir().join("optimization.ini");
        if let Err(e) = write_config(&ini_path, &ini) {
            outcome.errors.push(e);
            return outcome;
        }

        self.kill_stale_processes();
        let started = SystemTime::now();
        let label = format!(
            "optimization {report_name} {} {}",
            request.symbol, request.timeframe
        );
        if let Err(e) = self.run_terminal(&ini_path, request.timeout, &label) {
            outcome.errors.push(e);
            return outcome;
        }

        let xml_path = if request.report_name.is_some() {
            self.resolve_named(&format!("{report_name}.xml"), started)
        } else {
            self.resolve_newest(&["xml"], started)
        };
        let forward_path = self.resolve_named(&format!("{report_name}.forward.xml"), started);

        let Some(xml_path) = xml_path else {
            outcome
                .errors
                .push(format!("no optimization report found for report name {report_name}"));
            return outcome;
        };

        match xml::parse_optimization_xml(&xml_path) {
            Ok(mut report) => {
                if let Some(forward_path) = &forward_path {
                    match xml::parse_optimization_xml(forward_path) {
                        Ok(forward) => xml::merge_forward(&mut report.passes, &forward.passes),
                        Err(e) => outcome
                            .errors
                            .push(format!("forward report parse failed: {e}")),
                    }
                }
                outcome.success = true;
                outcome.passes_count = report.passes.len();
                outcome.best_result = report.best().cloned();
                outcome.results = report.passes;
            }
            Err(e) => outcome.errors.push(e.to_string()),
        }
        outcome.xml_path = Some(xml_path);
        outcome.forward_xml_path = forward_path;
        outcome
    }
}

fn write_config(path: &Path, content: &str) -> Result<(), String> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .map_err(|e| format!("failed to create config dir {}: {e}", parent.display()))?;
    }
    std::fs::write(path, content)
        .map_err(|e| format!("failed to write config {}: {e}", path.display()))
}
