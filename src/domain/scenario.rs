use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

/// Price-data model the simulator replays with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataModel {
    /// Every real tick (`Model=0` in tester config).
    Tick,
    /// One-minute OHLC bars (`Model=1`).
    OhlcMinute,
}

impl DataModel {
    pub fn tester_code(self) -> u8 {
        match self {
            DataModel::Tick => 0,
            DataModel::OhlcMinute => 1,
        }
    }

    pub fn short_name(self) -> &'static str {
        match self {
            DataModel::Tick => "tick",
            DataModel::OhlcMinute => "ohlc",
        }
    }
}

/// The date window a scenario replays.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScenarioWindow {
    pub id: String,
    pub label: String,
    pub from: NaiveDate,
    pub to: NaiveDate,
}

/// Concrete tester settings for a scenario run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScenarioSettings {
    pub from: NaiveDate,
    pub to: NaiveDate,
    pub model: DataModel,
    pub latency_ms: u32,
    #[serde(default)]
    pub spread_points: Option<i64>,
}

/// Extra per-trade costs applied post-hoc to a base scenario's trade list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OverlaySettings {
    pub spread_pips: f64,
    pub slippage_pips: f64,
    /// How many fills the slippage applies to (usually 2: entry and exit).
    pub slippage_sides: u32,
}

impl OverlaySettings {
    /// Total extra pips charged per trade.
    pub fn extra_pips(&self) -> f64 {
        self.spread_pips.max(0.0) + self.slippage_pips.max(0.0) * f64::from(self.slippage_sides)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScenarioVariant {
    /// Executed through the simulator.
    Base,
    /// Derived from a base scenario's trade list without a simulator run.
    Overlay,
}

/// One stress replay of the best pass.
///
/// Ids are deterministic functions of the enumeration inputs so a re-run of
/// the same workflow produces the same suite.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Scenario {
    pub id: String,
    pub label: String,
    pub period_id: String,
    pub variant: ScenarioVariant,
    pub window: ScenarioWindow,
    pub settings: ScenarioSettings,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub overlay_settings: Option<OverlaySettings>,
    #[serde(default)]
    pub base_scenario_id: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tester_codes() {
        assert_eq!(DataModel::Tick.tester_code(), 0);
        assert_eq!(DataModel::OhlcMinute.tester_code(), 1);
    }

    #[test]
    fn overlay_extra_pips() {
        let o = OverlaySettings {
            spread_pips: 1.0,
            slippage_pips: 1.0,
            slippage_sides: 2,
        };
        assert!((o.extra_pips() - 3.0).abs() < f64::EPSILON);

        let none = OverlaySettings {
            spread_pips: -1.0,
            slippage_pips: 0.0,
            slippage_sides: 2,
        };
        assert!((none.extra_pips() - 0.0).abs() < f64::EPSILON);
    }

    #[test]
    fn scenario_round_trips_through_json() {
        let s = Scenario {
            id: "tick_last_30d_latency_50ms".into(),
            label: "Tick + latency 50ms - Last 30 days".into(),
            period_id: "last_30d".into(),
            variant: ScenarioVariant::Base,
            window: ScenarioWindow {
                id: "last_30d".into(),
                label: "Last 30 days".into(),
                from: NaiveDate::from_ymd_opt(2026, 6, 1).unwrap(),
                to: NaiveDate::from_ymd_opt(2026, 7, 1).unwrap(),
            },
            settings: ScenarioSettings {
                from: NaiveDate::from_ymd_opt(2026, 6, 1).unwrap(),
                to: NaiveDate::from_ymd_opt(2026, 7, 1).unwrap(),
                model: DataModel::Tick,
                latency_ms: 50,
                spread_points: None,
            },
            tags: vec!["window".into(), "tick".into(), "latency".into()],
            overlay_settings: None,
            base_scenario_id: None,
        };
        let json = serde_json::to_string(&s).unwrap();
        let back: Scenario = serde_json::from_str(&json).unwrap();
        assert_eq!(s, back);
    }
}
