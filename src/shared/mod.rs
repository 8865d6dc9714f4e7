use serde::{Deserialize, Serialize};
use strum::{Display, EnumIter, EnumString, IntoEnumIterator};

pub mod error;

use error::TimeframeSetValidationError;

/// Milliseconds since the Unix epoch.
pub type Millis = i64;

pub const ONE_MINUTE_MS: Millis = 60_000;

/// The fixed candle timeframe vocabulary.
///
/// Durations are expressed in minutes; `1M` uses the 30-day convention of
/// the upstream kline API.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    Serialize,
    Deserialize,
    Display,
    EnumString,
    EnumIter,
)]
pub enum Timeframe {
    #[serde(rename = "1m")]
    #[strum(serialize = "1m")]
    M1,
    #[serde(rename = "3m")]
    #[strum(serialize = "3m")]
    M3,
    #[serde(rename = "5m")]
    #[strum(serialize = "5m")]
    M5,
    #[serde(rename = "15m")]
    #[strum(serialize = "15m")]
    M15,
    #[serde(rename = "30m")]
    #[strum(serialize = "30m")]
    M30,
    #[serde(rename = "1h")]
    #[strum(serialize = "1h")]
    H1,
    #[serde(rename = "2h")]
    #[strum(serialize = "2h")]
    H2,
    #[serde(rename = "4h")]
    #[strum(serialize = "4h")]
    H4,
    #[serde(rename = "8h")]
    #[strum(serialize = "8h")]
    H8,
    #[serde(rename = "1d")]
    #[strum(serialize = "1d")]
    D1,
    #[serde(rename = "1w")]
    #[strum(serialize = "1w")]
    W1,
    #[serde(rename = "1M")]
    #[strum(serialize = "1M")]
    Mo1,
}

impl Timeframe {
    pub fn minutes(self) -> i64 {
        match self {
            Self::M1 => 1,
            Self::M3 => 3,
            Self::M5 => 5,
            Self::M15 => 15,
            Self::M30 => 30,
            Self::H1 => 60,
            Self::H2 => 120,
            Self::H4 => 240,
            Self::H8 => 480,
            Self::D1 => 1_440,
            Self::W1 => 10_080,
            Self::Mo1 => 43_200,
        }
    }

    pub fn duration_ms(self) -> Millis {
        self.minutes() * ONE_MINUTE_MS
    }

    /// The base timeframe of a subscription set: the entry with the smallest
    /// duration. Falls back to `1m` for an empty set.
    ///
    /// This is the single source of truth used by the simulator, the
    /// exchange, and the backtest runner.
    pub fn base_of(timeframes: &[Timeframe]) -> Timeframe {
        timeframes.iter().copied().min().unwrap_or(Timeframe::M1)
    }

    pub fn all() -> Vec<Timeframe> {
        Timeframe::iter().collect()
    }
}

/// A validated set of 2 to 4 distinct timeframes, sorted ascending by
/// duration. Invalid counts are rejected at the boundary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "Vec<Timeframe>", into = "Vec<Timeframe>")]
pub struct TimeframeSet(Vec<Timeframe>);

impl TimeframeSet {
    pub const MIN_LEN: usize = 2;

    pub const MAX_LEN: usize = 4;

    pub fn base(&self) -> Timeframe {
        Timeframe::base_of(&self.0)
    }

    pub fn as_slice(&self) -> &[Timeframe] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<Timeframe> {
        self.0.get(index).copied()
    }

    pub fn higher(&self) -> impl Iterator<Item = Timeframe> + '_ {
        let base = self.base();
        self.0.iter().copied().filter(move |tf| *tf != base)
    }
}

impl TryFrom<Vec<Timeframe>> for TimeframeSet {
    type Error = TimeframeSetValidationError;

    fn try_from(mut value: Vec<Timeframe>) -> Result<Self, Self::Error> {
        value.sort();
        value.dedup();

        if value.len() < Self::MIN_LEN {
            return Err(TimeframeSetValidationError::TooFew { count: value.len() });
        }

        if value.len() > Self::MAX_LEN {
            return Err(TimeframeSetValidationError::TooMany { count: value.len() });
        }

        Ok(Self(value))
    }
}

impl From<TimeframeSet> for Vec<Timeframe> {
    fn from(value: TimeframeSet) -> Self {
        value.0
    }
}

/// RSI classification thresholds `[low, mid, high]`, strictly ascending,
/// each in `[0, 100]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "Vec<i64>", into = "Vec<i64>")]
pub struct RsiLimits([u8; 3]);

impl RsiLimits {
    pub fn low(&self) -> u8 {
        self.0[0]
    }

    pub fn mid(&self) -> u8 {
        self.0[1]
    }

    pub fn high(&self) -> u8 {
        self.0[2]
    }

    pub fn as_array(&self) -> [u8; 3] {
        self.0
    }
}

impl Default for RsiLimits {
    fn default() -> Self {
        Self([15, 50, 85])
    }
}

impl TryFrom<[i64; 3]> for RsiLimits {
    type Error = error::RsiLimitsValidationError;

    fn try_from(value: [i64; 3]) -> Result<Self, Self::Error> {
        for v in value {
            if !(0..=100).contains(&v) {
                return Err(error::RsiLimitsValidationError::OutOfRange { value: v });
            }
        }

        if !(value[0] < value[1] && value[1] < value[2]) {
            return Err(error::RsiLimitsValidationError::NotAscending { values: value });
        }

        Ok(Self([value[0] as u8, value[1] as u8, value[2] as u8]))
    }
}

impl TryFrom<Vec<i64>> for RsiLimits {
    type Error = error::RsiLimitsValidationError;

    fn try_from(value: Vec<i64>) -> Result<Self, Self::Error> {
        let triple: [i64; 3] = value
            .as_slice()
            .try_into()
            .map_err(|_| error::RsiLimitsValidationError::WrongLength { count: value.len() })?;
        Self::try_from(triple)
    }
}

impl From<RsiLimits> for Vec<i64> {
    fn from(value: RsiLimits) -> Self {
        value.0.iter().map(|v| *v as i64).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn base_of_picks_smallest_duration() {
        let tfs = [Timeframe::H1, Timeframe::M15, Timeframe::M1];
        assert_eq!(Timeframe::base_of(&tfs), Timeframe::M1);
        assert_eq!(Timeframe::base_of(&[]), Timeframe::M1);
        assert_eq!(
            Timeframe::base_of(&[Timeframe::H4, Timeframe::D1]),
            Timeframe::H4
        );
    }

    #[test]
    fn timeframe_roundtrips_through_strings() {
        for tf in Timeframe::all() {
            let parsed: Timeframe = tf.to_string().parse().unwrap();
            assert_eq!(parsed, tf);
        }
        assert_eq!("1M".parse::<Timeframe>().unwrap(), Timeframe::Mo1);
        assert!("7m".parse::<Timeframe>().is_err());
    }

    #[test]
    fn timeframe_set_rejects_bad_counts() {
        assert!(TimeframeSet::try_from(vec![Timeframe::M1]).is_err());
        assert!(
            TimeframeSet::try_from(vec![
                Timeframe::M1,
                Timeframe::M3,
                Timeframe::M5,
                Timeframe::M15,
                Timeframe::M30,
            ])
            .is_err()
        );

        let set =
            TimeframeSet::try_from(vec![Timeframe::H1, Timeframe::M1, Timeframe::M15]).unwrap();
        assert_eq!(set.base(), Timeframe::M1);
        assert_eq!(
            set.as_slice(),
            &[Timeframe::M1, Timeframe::M15, Timeframe::H1]
        );
    }

    #[test]
    fn rsi_limits_validation() {
        assert!(RsiLimits::try_from([15, 50, 85]).is_ok());
        assert!(RsiLimits::try_from([50, 50, 85]).is_err());
        assert!(RsiLimits::try_from([85, 50, 15]).is_err());
        assert!(RsiLimits::try_from([-1, 50, 85]).is_err());
        assert!(RsiLimits::try_from([15, 50, 101]).is_err());
        assert!(RsiLimits::try_from(vec![15, 50]).is_err());
        assert_eq!(RsiLimits::default().as_array(), [15, 50, 85]);
    }
}
