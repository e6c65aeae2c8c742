use std::collections::HashMap;
use std::path::Path;

use quick_xml::events::Event;
use quick_xml::Reader;

use super::ReportError;
use crate::domain::passes::{CellValue, ForwardSegment, PassRecord};

/// Known metric columns and their canonical keys. Lookup is case-insensitive
/// so header drift between report versions doesn't silently move metrics into
/// the params map.
const METRIC_ALIASES: &[(&str, &str)] = &[
    ("Pass", "pass"),
    ("Result", "result"),
    ("Profit", "profit"),
    ("Profit Factor", "profit_factor"),
    ("ProfitFactor", "profit_factor"),
    ("Expected Payoff", "expected_payoff"),
    ("ExpectedPayoff", "expected_payoff"),
    ("Equity DD %", "max_drawdown_pct"),
    ("Drawdown %", "max_drawdown_pct"),
    ("Equity Drawdown %", "max_drawdown_pct"),
    ("Trades", "total_trades"),
    ("Total Trades", "total_trades"),
    ("Sharpe Ratio", "sharpe"),
    ("SharpeRatio", "sharpe"),
    ("Sortino Ratio", "sortino"),
    ("Recovery Factor", "recovery_factor"),
    ("RecoveryFactor", "recovery_factor"),
    ("Win %", "win_rate"),
    ("Profit Trades %", "win_rate"),
    ("Back Result", "back_result"),
    ("Forward Result", "forward_result"),
];

fn canonical_metric(header: &str) -> Option<&'static str> {
    METRIC_ALIASES
        .iter()
        .find(|(alias, _)| alias.eq_ignore_ascii_case(header))
        .map(|(_, canonical)| *canonical)
}

/// Parsed optimization report: passes sorted descending by the optimizer's
/// criterion column (with `profit` standing in when the report has none).
#[derive(Debug, Clone, PartialEq)]
pub struct OptimizationReport {
    pub passes: Vec<PassRecord>,
}

impl OptimizationReport {
    pub fn best(&self) -> Option<&PassRecord> {
        self.passes.first()
    }
}

/// Decode report bytes: BOM-sniffed UTF-16, else UTF-8 with lossy fallback.
fn decode_bytes(bytes: &[u8]) -> String {
    if bytes.starts_with(&[0xFF, 0xFE]) {
        let (text, _, _) = encoding_rs::UTF_16LE.decode(bytes);
        return text.into_owned();
    }
    if bytes.starts_with(&[0xFE, 0xFF]) {
        let (text, _, _) = encoding_rs::UTF_16BE.decode(bytes);
        return text.into_owned();
    }
    String::from_utf8_lossy(bytes).into_owned()
}

pub fn parse_optimization_xml(path: &Path) -> Result<OptimizationReport, ReportError> {
    if !path.exists() {
        return Err(ReportError::NotFound(path.to_path_buf()));
    }
    let bytes = std::fs::read(path)?;
    parse_optimization_str(&decode_bytes(&bytes))
}

/// Parse the spreadsheet-ML dialect. Element names are matched by local name,
/// so namespaced (`ss:Row`) and unnamespaced (`Row`) reports parse identically.
pub fn parse_optimization_str(content: &str) -> Result<OptimizationReport, ReportError> {
    let mut reader = Reader::from_str(content);
    reader.config_mut().trim_text(true);

    let mut rows: Vec<Vec<Option<CellValue>>> = Vec::new();
    let mut current_row: Option<Vec<Option<CellValue>>> = None;
    let mut in_cell = false;
    let mut in_data = false;
    let mut pending_cell: Option<CellValue> = None;
    let mut text = String::new();

    loop {
        match reader.read_event()? {
            Event::Start(e) => match e.local_name().as_ref() {
                b"Row" => current_row = Some(Vec::new()),
                b"Cell" => {
                    in_cell = true;
                    pending_cell = None;
                }
                b"Data" if in_cell => {
                    in_data = true;
                    text.clear();
                }
                _ => {}
            },
            Event::Empty(e) => match e.local_name().as_ref() {
                b"Cell" => {
                    if let Some(row) = current_row.as_mut() {
                        row.push(None);
                    }
                }
                b"Data" if in_cell => pending_cell = None,
                _ => {}
            },
            Event::Text(t) => {
                if in_data {
                    match t.unescape() {
                        Ok(unescaped) => text.push_str(&unescaped),
                        Err(_) => text.push_str(&String::from_utf8_lossy(t.as_ref())),
                    }
                }
            }
            Event::End(e) => match e.local_name().as_ref() {
                b"Data" => {
                    in_data = false;
                    if !text.is_empty() {
                        pending_cell = Some(CellValue::parse(&text));
                    }
                }
                b"Cell" => {
                    in_cell = false;
                    if let Some(row) = current_row.as_mut() {
                        row.push(pending_cell.take());
                    }
                }
                b"Row" => {
                    if let Some(row) = current_row.take() {
                        rows.push(row);
                    }
                }
                _ => {}
            },
            Event::Eof => break,
            _ => {}
        }
    }

    let mut rows = rows.into_iter();
    let Some(header_row) = rows.next() else {
        return Err(ReportError::NoPasses);
    };

    let headers: Vec<String> = header_row
        .into_iter()
        .enumerate()
        .map(|(j, cell)| match cell {
            Some(CellValue::Text(s)) => s,
            Some(CellValue::Int(i)) => i.to_string(),
            Some(CellValue::Float(f)) => f.to_string(),
            None => format!("col_{j}"),
        })
        .collect();

    let mut passes: Vec<PassRecord> = rows
        .filter(|cells| cells.iter().any(Option::is_some))
        .map(|cells| normalize_pass(&headers, cells))
        .collect();

    if passes.is_empty() {
        return Err(ReportError::NoPasses);
    }

    passes.sort_by(|a, b| b.result.total_cmp(&a.result));
    Ok(OptimizationReport { passes })
}

fn normalize_pass(headers: &[String], cells: Vec<Option<CellValue>>) -> PassRecord {
    let mut record = PassRecord::default();
    let mut saw_result = false;

    for (header, cell) in headers.iter().zip(cells) {
        let Some(value) = cell else { continue };

        match canonical_metric(header) {
            Some("pass") => record.pass = value.as_i64(),
            Some("result") => {
                record.result = value.as_f64().unwrap_or(0.0);
                saw_result = true;
            }
            Some("profit") => record.profit = value.as_f64().unwrap_or(0.0),
            Some("profit_factor") => record.profit_factor = value.as_f64().unwrap_or(0.0),
            Some("expected_payoff") => record.expected_payoff = value.as_f64().unwrap_or(0.0),
            Some("max_drawdown_pct") => record.max_drawdown_pct = value.as_f64().unwrap_or(0.0),
            Some("total_trades") => {
                record.total_trades = value.as_i64().unwrap_or(0).max(0) as u64;
            }
            Some("sharpe") => record.sharpe = value.as_f64().unwrap_or(0.0),
            Some("sortino") => record.sortino = value.as_f64().unwrap_or(0.0),
            Some("recovery_factor") => record.recovery_factor = value.as_f64().unwrap_or(0.0),
            Some("win_rate") => record.win_rate = value.as_f64().unwrap_or(0.0),
            Some("back_result") => record.back_result = value.as_f64(),
            Some("forward_result") => record.forward_result = value.as_f64(),
            _ => {
                record.params.insert(header.clone(), value);
            }
        }
    }

    // Reports without a criterion column still need a sort key
    if !saw_result {
        record.result = record.profit;
    }
    record
}

/// Merge the companion forward report into the main (back-segment) passes,
/// keyed by pass number. `back_result` is always populated afterwards, and
/// `total_trades` becomes the sum of both segments.
pub fn merge_forward(base: &mut [PassRecord], forward: &[PassRecord]) {
    let by_pass: HashMap<i64, &PassRecord> = forward
        .iter()
        .filter_map(|p| p.pass.map(|n| (n, p)))
        .collect();

    for pass in base.iter_mut() {
        let Some(num) = pass.pass else { continue };

        if pass.back_result.is_none() {
            pass.back_result = Some(pass.result);
        }

        let Some(fwd) = by_pass.get(&num) else {
            continue;
        };

        if fwd.forward_result.is_some() {
            pass.forward_result = fwd.forward_result;
        }
        if fwd.back_result.is_some() {
            pass.back_result = fwd.back_result;
        }

        pass.forward = Some(ForwardSegment {
            profit: fwd.profit,
            expected_payoff: fwd.expected_payoff,
            profit_factor: fwd.profit_factor,
            recovery_factor: fwd.recovery_factor,
            sharpe: fwd.sharpe,
            max_drawdown_pct: fwd.max_drawdown_pct,
            total_trades: fwd.total_trades,
        });
        pass.total_trades += fwd.total_trades;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spreadsheet(rows: &[&[&str]], namespaced: bool) -> String {
        let (row, cell, data) = if namespaced {
            ("ss:Row", "ss:Cell", "ss:Data")
        } else {
            ("Row", "Cell", "Data")
        };
        let mut xml = String::from("<?xml version=\"1.0\"?>\n");
        if namespaced {
            xml.push_str(
                "<Workbook xmlns:ss=\"urn:schemas-microsoft-com:office:spreadsheet\"><ss:Table>\n",
            );
        } else {
            xml.push_str("<Workbook><Table>\n");
        }
        for r in rows {
            xml.push_str(&format!("<{row}>"));
            for value in *r {
                xml.push_str(&format!("<{cell}><{data}>{value}</{data}></{cell}>"));
            }
            xml.push_str(&format!("</{row}>\n"));
        }
        if namespaced {
            xml.push_str("</ss:Table></Workbook>");
        } else {
            xml.push_str("</Table></Workbook>");
        }
        xml
    }

    const HEADER: &[&str] = &[
        "Pass",
        "Result",
        "Profit",
        "Profit Factor",
        "Expected Payoff",
        "Equity DD %",
        "Trades",
        "RsiPeriod",
    ];

    #[test]
    fn parses_unnamespaced_report() {
        let xml = spreadsheet(
            &[
                HEADER,
                &["1", "500.5", "480.0", "1.6", "4.0", "12.5", "120", "14"],
                &["2", "900.0", "850.0", "2.1", "7.1", "9.0", "119", "21"],
                &["3", "100.0", "90.0", "1.1", "0.8", "25.0", "110", "7"],
            ],
            false,
        );
        let report = parse_optimization_str(&xml).unwrap();
        assert_eq!(report.passes.len(), 3);
        // Sorted by result desc
        assert_eq!(report.passes[0].pass, Some(2));
        assert_eq!(report.passes[1].pass, Some(1));
        assert_eq!(report.passes[2].pass, Some(3));
        assert!((report.best().unwrap().profit - 850.0).abs() < 1e-9);
    }

    #[test]
    fn namespace_does_not_change_the_parse() {
        let rows: &[&[&str]] = &[
            HEADER,
            &["1", "500.5", "480.0", "1.6", "4.0", "12.5", "120", "14"],
            &["2", "900.0", "850.0", "2.1", "7.1", "9.0", "119", "21"],
        ];
        let plain = parse_optimization_str(&spreadsheet(rows, false)).unwrap();
        let namespaced = parse_optimization_str(&spreadsheet(rows, true)).unwrap();
        assert_eq!(plain.passes, namespaced.passes);
    }

    #[test]
    fn unknown_columns_become_params() {
        let xml = spreadsheet(
            &[
                HEADER,
                &["1", "500.5", "480.0", "1.6", "4.0", "12.5", "120", "14"],
            ],
            false,
        );
        let report = parse_optimization_str(&xml).unwrap();
        let pass = &report.passes[0];
        assert_eq!(pass.params.get("RsiPeriod"), Some(&CellValue::Int(14)));
        assert!(!pass.params.contains_key("Profit"));
    }

    #[test]
    fn header_aliases_are_case_insensitive() {
        let xml = spreadsheet(
            &[
                &["PASS", "RESULT", "profit", "PROFIT FACTOR", "trades"],
                &["4", "800.0", "750.0", "1.9", "101"],
            ],
            false,
        );
        let report = parse_optimization_str(&xml).unwrap();
        let pass = &report.passes[0];
        assert_eq!(pass.pass, Some(4));
        assert!((pass.profit_factor - 1.9).abs() < 1e-9);
        assert_eq!(pass.total_trades, 101);
        assert!(pass.params.is_empty());
    }

    #[test]
    fn missing_result_column_falls_back_to_profit() {
        let xml = spreadsheet(
            &[
                &["Pass", "Profit", "Trades"],
                &["1", "100.0", "50"],
                &["2", "300.0", "60"],
            ],
            false,
        );
        let report = parse_optimization_str(&xml).unwrap();
        assert_eq!(report.passes[0].pass, Some(2));
        assert!((report.passes[0].result - 300.0).abs() < 1e-9);
    }

    #[test]
    fn integer_cells_parse_as_ints_and_floats_as_floats() {
        let xml = spreadsheet(
            &[&["Pass", "Profit", "Note"], &["1", "100.5", "wide"]],
            false,
        );
        let report = parse_optimization_str(&xml).unwrap();
        let pass = &report.passes[0];
        assert_eq!(pass.params.get("Note"), Some(&CellValue::Text("wide".into())));
        assert!((pass.profit - 100.5).abs() < 1e-9);
    }

    #[test]
    fn empty_report_is_an_error() {
        let xml = spreadsheet(&[HEADER], false);
        assert!(matches!(
            parse_optimization_str(&xml),
            Err(ReportError::NoPasses)
        ));
    }

    #[test]
    fn forward_merge_attaches_segments_and_sums_trades() {
        let main_xml = spreadsheet(
            &[
                &["Pass", "Result", "Profit", "Trades"],
                &["1", "900.0", "850.0", "100"],
                &["2", "500.0", "450.0", "90"],
            ],
            false,
        );
        let forward_xml = spreadsheet(
            &[
                &[
                    "Pass",
                    "Forward Result",
                    "Back Result",
                    "Profit",
                    "Profit Factor",
                    "Trades",
                ],
                &["1", "300.0", "600.0", "280.0", "1.7", "25"],
            ],
            false,
        );

        let mut main = parse_optimization_str(&main_xml).unwrap();
        let forward = parse_optimization_str(&forward_xml).unwrap();
        merge_forward(&mut main.passes, &forward.passes);

        let merged = main.passes.iter().find(|p| p.pass == Some(1)).unwrap();
        assert_eq!(merged.forward_result, Some(300.0));
        assert_eq!(merged.back_result, Some(600.0));
        assert_eq!(merged.total_trades, 125);
        let fwd = merged.forward.as_ref().unwrap();
        assert!((fwd.profit - 280.0).abs() < 1e-9);
        assert_eq!(fwd.total_trades, 25);

        // Pass without a forward row still gets back_result populated
        let unmerged = main.passes.iter().find(|p| p.pass == Some(2)).unwrap();
        assert_eq!(unmerged.back_result, Some(500.0));
        assert_eq!(unmerged.forward, None);
        assert_eq!(unmerged.total_trades, 90);
    }
}
