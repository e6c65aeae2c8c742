use garde::Validate;
use serde::{Deserialize, Serialize};

/// Input parameters injected by the safety pass carry this prefix and are
/// never eligible for optimization.
pub const RESERVED_SAFETY_PREFIX: &str = "EAStressSafety_";

/// Normalized parameter type, reduced from the zoo of MQL5 declared types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParamType {
    Int,
    Double,
    Bool,
    String,
    Enum,
    Datetime,
    Color,
}

impl ParamType {
    /// Only numeric inputs can be swept by the optimizer.
    pub fn is_numeric(self) -> bool {
        matches!(self, ParamType::Int | ParamType::Double)
    }
}

/// A single `input`/`sinput` declaration extracted from EA source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Parameter {
    pub name: String,
    /// Type exactly as declared (e.g. `ENUM_TIMEFRAMES`).
    pub declared_type: String,
    pub normalized_type: ParamType,
    #[serde(default)]
    pub default: Option<String>,
    #[serde(default)]
    pub comment: Option<String>,
    /// 1-based line number in the source file.
    pub line: usize,
    pub optimizable: bool,
}

fn validate_stop_gte_start(start: &f64, optimize: bool) -> impl FnOnce(&f64, &()) -> garde::Result + '_ {
    move |stop: &f64, (): &()| {
        if optimize && stop < start {
            return Err(garde::Error::new(format!(
                "stop ({stop}) must be >= start ({start}) when optimizing"
            )));
        }
        Ok(())
    }
}

fn validate_step_positive(optimize: bool) -> impl FnOnce(&Option<f64>, &()) -> garde::Result {
    move |step: &Option<f64>, (): &()| {
        if optimize {
            match step {
                Some(s) if *s > 0.0 => Ok(()),
                Some(s) => Err(garde::Error::new(format!(
                    "step ({s}) must be > 0 when optimizing"
                ))),
                None => Err(garde::Error::new("step is required when optimizing")),
            }
        } else {
            Ok(())
        }
    }
}

fn validate_fixed_value<'a>(
    optimize: bool,
    start: &'a f64,
    stop: &'a f64,
) -> impl FnOnce(&Option<serde_json::Value>, &()) -> garde::Result + 'a {
    move |fixed: &Option<serde_json::Value>, (): &()| {
        if !optimize && (start - stop).abs() > f64::EPSILON && fixed.is_none() {
            return Err(garde::Error::new(
                "fixed_value is required when optimize=false and start != stop",
            ));
        }
        Ok(())
    }
}

/// A sweep definition for one parameter, supplied at the param-analysis pause.
///
/// Invariants are enforced through validation rather than construction because
/// ranges arrive as external payloads.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
pub struct OptimizationRange {
    #[garde(length(min = 1))]
    pub name: String,
    #[garde(skip)]
    pub start: f64,
    #[garde(custom(validate_stop_gte_start(&self.start, self.optimize)))]
    pub stop: f64,
    #[serde(default)]
    #[garde(custom(validate_step_positive(self.optimize)))]
    pub step: Option<f64>,
    #[garde(skip)]
    pub optimize: bool,
    /// Pin to this value instead of sweeping. Booleans keep their `true`/`false`
    /// spelling on the wire so the tester config renders them natively.
    #[serde(default)]
    #[garde(custom(validate_fixed_value(self.optimize, &self.start, &self.stop)))]
    pub fixed_value: Option<serde_json::Value>,
    #[serde(default)]
    #[garde(skip)]
    pub skip_reason: Option<String>,
    #[serde(default)]
    #[garde(skip)]
    pub category: Option<String>,
    #[serde(default)]
    #[garde(skip)]
    pub rationale: Option<String>,
}

impl OptimizationRange {
    /// A range pinned to a single numeric value.
    pub fn fixed(name: &str, value: f64) -> Self {
        Self {
            name: name.to_string(),
            start: value,
            stop: value,
            step: None,
            optimize: false,
            fixed_value: None,
            skip_reason: None,
            category: None,
            rationale: None,
        }
    }

    /// A swept numeric range.
    pub fn sweep(name: &str, start: f64, step: f64, stop: f64) -> Self {
        Self {
            name: name.to_string(),
            start,
            stop,
            step: Some(step),
            optimize: true,
            fixed_value: None,
            skip_reason: None,
            category: None,
            rationale: None,
        }
    }

    /// The value used when the range is held fixed.
    pub fn pinned_value(&self) -> serde_json::Value {
        self.fixed_value
            .clone()
            .unwrap_or_else(|| serde_json::json!(self.start))
    }
}
