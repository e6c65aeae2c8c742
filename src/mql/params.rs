use std::path::Path;
use std::sync::OnceLock;

use anyhow::{Context, Result};
use regex::Regex;

use crate::domain::param::{ParamType, Parameter, RESERVED_SAFETY_PREFIX};

/// MQL5 declared types and their normalized forms. Anything starting with
/// `ENUM_` (or fully uppercase) normalizes to `enum`.
const TYPE_MAP: &[(&str, ParamType)] = &[
    ("int", ParamType::Int),
    ("uint", ParamType::Int),
    ("long", ParamType::Int),
    ("ulong", ParamType::Int),
    ("short", ParamType::Int),
    ("ushort", ParamType::Int),
    ("char", ParamType::Int),
    ("uchar", ParamType::Int),
    ("double", ParamType::Double),
    ("float", ParamType::Double),
    ("bool", ParamType::Bool),
    ("string", ParamType::String),
    ("datetime", ParamType::Datetime),
    ("color", ParamType::Color),
];

fn input_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        // input int MyParam = 10; // Comment
        // sinput string Note = "x";
        Regex::new(
            r"^\s*(sinput|input)\s+([\w\s]+?)\s+(\w+)\s*(?:=\s*([^;/]+?))?\s*;(?:\s*//\s*(.*))?$",
        )
        .unwrap()
    })
}

fn normalize_type(declared: &str) -> ParamType {
    let lower = declared.to_ascii_lowercase();
    for (mql, normalized) in TYPE_MAP {
        if *mql == lower {
            return *normalized;
        }
    }
    if declared.starts_with("ENUM_") || declared.chars().all(|c| !c.is_ascii_lowercase()) {
        return ParamType::Enum;
    }
    ParamType::String
}

/// Extract `input`/`sinput` declarations from EA source.
///
/// `optimizable` is true only for numeric non-static inputs outside the
/// reserved safety-prefix namespace.
pub fn extract_params(ea_path: &Path) -> Result<Vec<Parameter>> {
    let content = std::fs::read_to_string(ea_path)
        .with_context(|| format!("reading EA source {}", ea_path.display()))?;
    Ok(extract_params_from_source(&content))
}

pub fn extract_params_from_source(content: &str) -> Vec<Parameter> {
    let pattern = input_pattern();
    let mut params = Vec::new();

    for (idx, line) in content.lines().enumerate() {
        let stripped = line.trim_start();
        if stripped.starts_with("//") || stripped.starts_with("/*") {
            continue;
        }
        let Some(caps) = pattern.captures(line) else {
            continue;
        };

        let keyword = caps.get(1).map_or("input", |m| m.as_str());
        let declared_type = caps.get(2).map_or("", |m| m.as_str()).trim().to_string();
        let name = caps.get(3).map_or("", |m| m.as_str()).trim().to_string();
        let default = caps.get(4).map(|m| m.as_str().trim().to_string());
        let comment = caps.get(5).map(|m| m.as_str().trim().to_string());

        let normalized_type = normalize_type(&declared_type);
        // sinput = static input, never swept
        let mut optimizable = keyword == "input" && normalized_type.is_numeric();
        if name.starts_with(RESERVED_SAFETY_PREFIX) {
            optimizable = false;
        }

        params.push(Parameter {
            name,
            declared_type,
            normalized_type,
            default,
            comment,
            line: idx + 1,
            optimizable,
        });
    }

    params
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"//+------------------------------------------------------------------+
//| Sample EA                                                        |
//+------------------------------------------------------------------+
#property version "1.0"

input int      RsiPeriod = 14;        // RSI lookback
input double   Lots = 0.1;
input bool     Use_Trailing = true;   // Trailing stop toggle
sinput string  TradeComment = "demo"; // Static, not optimizable
input ENUM_TIMEFRAMES SignalTf = PERIOD_H1;
input datetime StartTime = D'2024.01.01';
input color    LineColor = clrRed;
input double   EAStressSafety_MaxSpreadPips = 3.0; // Reserved prefix
// input int DisabledParam = 5;
"#;

    #[test]
    fn extracts_all_declarations() {
        let params = extract_params_from_source(SAMPLE);
        assert_eq!(params.len(), 8);
        let names: Vec<&str> = params.iter().map(|p| p.name.as_str()).collect();
        assert!(names.contains(&"RsiPeriod"));
        assert!(!names.contains(&"DisabledParam"));
    }

    #[test]
    fn normalizes_types() {
        let params = extract_params_from_source(SAMPLE);
        let by_name = |n: &str| params.iter().find(|p| p.name == n).unwrap();
        assert_eq!(by_name("RsiPeriod").normalized_type, ParamType::Int);
        assert_eq!(by_name("Lots").normalized_type, ParamType::Double);
        assert_eq!(by_name("Use_Trailing").normalized_type, ParamType::Bool);
        assert_eq!(by_name("TradeComment").normalized_type, ParamType::String);
        assert_eq!(by_name("SignalTf").normalized_type, ParamType::Enum);
        assert_eq!(by_name("StartTime").normalized_type, ParamType::Datetime);
        assert_eq!(by_name("LineColor").normalized_type, ParamType::Color);
    }

    #[test]
    fn optimizable_only_for_numeric_inputs() {
        let params = extract_params_from_source(SAMPLE);
        let by_name = |n: &str| params.iter().find(|p| p.name == n).unwrap();
        assert!(by_name("RsiPeriod").optimizable);
        assert!(by_name("Lots").optimizable);
        assert!(!by_name("Use_Trailing").optimizable); // bool
        assert!(!by_name("TradeComment").optimizable); // sinput
        assert!(!by_name("SignalTf").optimizable); // enum
    }

    #[test]
    fn reserved_prefix_never_optimizable() {
        let params = extract_params_from_source(SAMPLE);
        let safety = params
            .iter()
            .find(|p| p.name == "EAStressSafety_MaxSpreadPips")
            .unwrap();
        assert_eq!(safety.normalized_type, ParamType::Double);
        assert!(!safety.optimizable);
    }

    #[test]
    fn captures_defaults_comments_and_lines() {
        let params = extract_params_from_source(SAMPLE);
        let rsi = params.iter().find(|p| p.name == "RsiPeriod").unwrap();
        assert_eq!(rsi.default.as_deref(), Some("14"));
        assert_eq!(rsi.comment.as_deref(), Some("RSI lookback"));
        assert_eq!(rsi.line, 6);
    }

    #[test]
    fn empty_source_yields_no_params() {
        assert!(extract_params_from_source("void OnTick() {}\n").is_empty());
    }
}
