use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TradeSide {
    Buy,
    Sell,
}

impl TradeSide {
    /// The side of the entry deal that this exit deal closes.
    pub fn opposite(self) -> TradeSide {
        match self {
            TradeSide::Buy => TradeSide::Sell,
            TradeSide::Sell => TradeSide::Buy,
        }
    }
}

/// A completed round-trip trade recovered from the simulator's deal stream.
///
/// `net_profit = gross_profit + commission + swap`; commission and swap are
/// signed the way the simulator reports them (costs are negative).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trade {
    pub ticket: u64,
    pub symbol: String,
    pub side: TradeSide,
    pub volume: f64,
    pub open_time: NaiveDateTime,
    pub close_time: NaiveDateTime,
    pub open_price: f64,
    pub close_price: f64,
    pub commission: f64,
    pub swap: f64,
    pub gross_profit: f64,
    pub net_profit: f64,
}

impl Trade {
    pub fn holding_seconds(&self) -> i64 {
        (self.close_time - self.open_time).num_seconds().max(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn dt(day: u32, hour: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2025, 3, day)
            .unwrap()
            .and_hms_opt(hour, 0, 0)
            .unwrap()
    }

    #[test]
    fn opposite_sides() {
        assert_eq!(TradeSide::Buy.opposite(), TradeSide::Sell);
        assert_eq!(TradeSide::Sell.opposite(), TradeSide::Buy);
    }

    #[test]
    fn trade_round_trips_through_json() {
        let t = Trade {
            ticket: 42,
            symbol: "GBPUSD".into(),
            side: TradeSide::Buy,
            volume: 0.5,
            open_time: dt(3, 9),
            close_time: dt(3, 15),
            open_price: 1.2650,
            close_price: 1.2710,
            commission: -3.5,
            swap: -0.2,
            gross_profit: 30.0,
            net_profit: 26.3,
        };
        let json = serde_json::to_string(&t).unwrap();
        let back: Trade = serde_json::from_str(&json).unwrap();
        assert_eq!(t, back);
        assert_eq!(t.holding_seconds(), 6 * 3600);
    }

    #[test]
    fn side_serializes_lowercase() {
        assert_eq!(serde_json::to_value(TradeSide::Sell).unwrap(), "sell");
    }
}
