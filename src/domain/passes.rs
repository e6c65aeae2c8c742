use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::metrics::TradeMetrics;

/// A raw cell from the optimization report: numeric when parseable, int if it
/// carried no decimal point, otherwise the original text.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum CellValue {
    Int(i64),
    Float(f64),
    Text(String),
}

impl CellValue {
    /// Infer the value from cell text the way the report writes numbers.
    pub fn parse(text: &str) -> CellValue {
        let trimmed = text.trim();
        if trimmed.contains('.') {
            if let Ok(f) = trimmed.parse::<f64>() {
                return CellValue::Float(f);
            }
        } else if let Ok(i) = trimmed.parse::<i64>() {
            return CellValue::Int(i);
        }
        CellValue::Text(trimmed.to_string())
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            CellValue::Int(i) => Some(*i as f64),
            CellValue::Float(f) => Some(*f),
            CellValue::Text(_) => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            CellValue::Int(i) => Some(*i),
            CellValue::Float(f) => Some(*f as i64),
            CellValue::Text(_) => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            CellValue::Text(s) => Some(s),
            _ => None,
        }
    }
}

/// Forward-segment metrics merged from the companion forward report.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ForwardSegment {
    pub profit: f64,
    pub expected_payoff: f64,
    pub profit_factor: f64,
    pub recovery_factor: f64,
    pub sharpe: f64,
    pub max_drawdown_pct: f64,
    pub total_trades: u64,
}

/// One normalized optimization pass.
///
/// Known metric columns land in typed fields through the alias table; anything
/// else (the swept inputs) stays in `params`. After a forward merge,
/// `total_trades` is the sum of both segments.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PassRecord {
    /// The report's `Pass` column, when present.
    #[serde(default)]
    pub pass: Option<i64>,
    /// The optimizer's criterion value; falls back to `profit` when the report
    /// has no `Result` column.
    pub result: f64,
    pub profit: f64,
    pub profit_factor: f64,
    pub expected_payoff: f64,
    pub max_drawdown_pct: f64,
    pub total_trades: u64,
    pub sharpe: f64,
    #[serde(default)]
    pub sortino: f64,
    #[serde(default)]
    pub recovery_factor: f64,
    #[serde(default)]
    pub win_rate: f64,
    #[serde(default)]
    pub back_result: Option<f64>,
    #[serde(default)]
    pub forward_result: Option<f64>,
    #[serde(default)]
    pub forward: Option<ForwardSegment>,
    #[serde(default)]
    pub params: BTreeMap<String, CellValue>,
}

impl PassRecord {
    /// Back/forward segment profits used by consistency scoring. The back
    /// segment defaults to the main criterion when no merge happened.
    pub fn segment_results(&self) -> (f64, f64) {
        let back = self.back_result.unwrap_or(self.result);
        let forward = self.forward_result.unwrap_or(0.0);
        (back, forward)
    }

    /// Input parameters only, with result columns stripped, rendered as the
    /// tester-config value strings.
    pub fn input_params(&self) -> BTreeMap<String, String> {
        self.params
            .iter()
            .filter(|(name, _)| !is_result_field(name))
            .map(|(name, value)| {
                let rendered = match value {
                    CellValue::Int(i) => i.to_string(),
                    CellValue::Float(f) => f.to_string(),
                    CellValue::Text(s) => s.clone(),
                };
                (name.clone(), rendered)
            })
            .collect()
    }
}

/// Columns that are optimizer outputs rather than swept inputs.
pub fn is_result_field(name: &str) -> bool {
    const RESULT_FIELDS: &[&str] = &[
        "Pass",
        "Result",
        "Forward Result",
        "Back Result",
        "Custom",
        "Profit",
        "Profit Factor",
        "Expected Payoff",
        "Recovery Factor",
        "Sharpe Ratio",
        "Equity DD %",
        "Trades",
    ];
    RESULT_FIELDS.iter().any(|f| f.eq_ignore_ascii_case(name))
}

/// A detailed replay of one selected pass (stage 9 output).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PassBacktest {
    pub pass_num: i64,
    pub metrics: TradeMetrics,
    pub back_result: f64,
    pub forward_result: f64,
    #[serde(default)]
    pub report_path: Option<String>,
    #[serde(default)]
    pub input_params: BTreeMap<String, String>,
}

/// The stage-9 sidecar: every replayed pass plus the best one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PassBacktestSet {
    pub best: PassBacktest,
    pub all: Vec<PassBacktest>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cell_parse_int_float_text() {
        assert_eq!(CellValue::parse("42"), CellValue::Int(42));
        assert_eq!(CellValue::parse("-7"), CellValue::Int(-7));
        assert_eq!(CellValue::parse("3.25"), CellValue::Float(3.25));
        assert_eq!(CellValue::parse("abc"), CellValue::Text("abc".into()));
        // A decimal point forces the float path even for integral values
        assert_eq!(CellValue::parse("10.0"), CellValue::Float(10.0));
    }

    #[test]
    fn cell_untagged_serde() {
        let v = vec![
            CellValue::Int(5),
            CellValue::Float(1.5),
            CellValue::Text("x".into()),
        ];
        let json = serde_json::to_string(&v).unwrap();
        assert_eq!(json, r#"[5,1.5,"x"]"#);
        let back: Vec<CellValue> = serde_json::from_str(&json).unwrap();
        assert_eq!(v, back);
    }

    #[test]
    fn result_fields_filtered_from_inputs() {
        let mut params = BTreeMap::new();
        params.insert("Pass".to_string(), CellValue::Int(7));
        params.insert("Back Result".to_string(), CellValue::Float(900.0));
        params.insert("RsiPeriod".to_string(), CellValue::Int(14));
        params.insert("Lots".to_string(), CellValue::Float(0.1));

        let pass = PassRecord {
            params,
            ..PassRecord::default()
        };
        let inputs = pass.input_params();
        assert_eq!(inputs.len(), 2);
        assert_eq!(inputs["RsiPeriod"], "14");
        assert_eq!(inputs["Lots"], "0.1");
    }

    #[test]
    fn segment_results_fall_back_to_criterion() {
        let pass = PassRecord {
            result: 1234.0,
            ..PassRecord::default()
        };
        assert_eq!(pass.segment_results(), (1234.0, 0.0));

        let merged = PassRecord {
            result: 1234.0,
            back_result: Some(900.0),
            forward_result: Some(300.0),
            ..PassRecord::default()
        };
        assert_eq!(merged.segment_results(), (900.0, 300.0));
    }

    #[test]
    fn pass_record_round_trips_through_json() {
        let mut params = BTreeMap::new();
        params.insert("RsiPeriod".to_string(), CellValue::Int(14));
        let p = PassRecord {
            pass: Some(3),
            result: 800.0,
            profit: 750.0,
            profit_factor: 1.9,
            expected_payoff: 6.2,
            max_drawdown_pct: 12.0,
            total_trades: 130,
            sharpe: 1.1,
            forward: Some(ForwardSegment {
                profit: 200.0,
                total_trades: 30,
                ..ForwardSegment::default()
            }),
            params,
            ..PassRecord::default()
        };
        let json = serde_json::to_string(&p).unwrap();
        let back: PassRecord = serde_json::from_str(&json).unwrap();
        assert_eq!(p, back);
    }
}
