use anyhow::bail;
use std::fmt;
use std::ops::{Add, Sub};
use strum_macros::{Display, EnumIter, EnumString};

/// Structural role a flow connects, drawn from a fixed vocabulary.
///
/// Flows always run from a source category to a sink category; only a subset
/// of the category pairs describe a physically meaningful exchange and the
/// constructor rejects the rest.
#[derive(Clone, Copy, Debug, Display, EnumIter, EnumString, Eq, Hash, PartialEq)]
#[strum(serialize_all = "snake_case")]
pub enum FlowCategory {
    Source,
    Primary,
    Secondary,
    Tertiary,
    Storage,
    Consumer,
    Environment,
}

impl FlowCategory {
    fn can_flow_to(self, sink: FlowCategory) -> bool {
        use FlowCategory::*;
        matches!(
            (self, sink),
            (Source, Primary)
                | (Source, Secondary)
                | (Source, Tertiary)
                | (Source, Storage)
                | (Source, Consumer)
                | (Primary, Consumer)
                | (Primary, Tertiary)
                | (Primary, Environment)
                | (Secondary, Primary)
                | (Secondary, Tertiary)
                | (Secondary, Environment)
                | (Tertiary, Environment)
                | (Storage, Primary)
                | (Storage, Consumer)
                | (Environment, Primary)
                | (Environment, Secondary)
                | (Environment, Tertiary)
        )
    }
}

/// An hourly time series of energy exchanged between two structural
/// categories, tagged with the energy carrier it is made of.
///
/// Profiles hold either a full annual series or a single value (the result of
/// [`EnergyFlow::isolate_peak`]). Values are in kWh per timestep and must be
/// non-negative unless the flow was constructed for diagnostics via
/// [`EnergyFlow::new_allow_negative`]. Flows are immutable once constructed;
/// arithmetic produces new flows.
#[derive(Clone, Debug, PartialEq)]
pub struct EnergyFlow {
    source: FlowCategory,
    sink: FlowCategory,
    carrier: String,
    profile: Vec<f64>,
    allow_negative: bool,
}

impl EnergyFlow {
    pub fn new(
        source: FlowCategory,
        sink: FlowCategory,
        carrier: impl Into<String>,
        profile: Vec<f64>,
    ) -> anyhow::Result<Self> {
        Self::build(source, sink, carrier.into(), profile, false)
    }

    /// Construct a flow that tolerates negative profile values. Only intended
    /// for diagnostic flows (e.g. net balances); dispatch never produces one.
    pub fn new_allow_negative(
        source: FlowCategory,
        sink: FlowCategory,
        carrier: impl Into<String>,
        profile: Vec<f64>,
    ) -> anyhow::Result<Self> {
        Self::build(source, sink, carrier.into(), profile, true)
    }

    fn build(
        source: FlowCategory,
        sink: FlowCategory,
        carrier: String,
        profile: Vec<f64>,
        allow_negative: bool,
    ) -> anyhow::Result<Self> {
        if !source.can_flow_to(sink) {
            bail!("An energy flow from category '{source}' to category '{sink}' is not a valid exchange.");
        }
        if profile.is_empty() {
            bail!("An energy flow requires a non-empty profile.");
        }
        if !allow_negative {
            if let Some(bad) = profile.iter().find(|v| **v < 0.) {
                bail!(
                    "Energy flow profile for carrier '{carrier}' ({source} -> {sink}) contains a negative value ({bad}); negative flows are only permitted for diagnostics."
                );
            }
        }
        Ok(Self {
            source,
            sink,
            carrier,
            profile,
            allow_negative,
        })
    }

    pub fn source(&self) -> FlowCategory {
        self.source
    }

    pub fn sink(&self) -> FlowCategory {
        self.sink
    }

    pub fn carrier(&self) -> &str {
        &self.carrier
    }

    pub fn profile(&self) -> &[f64] {
        &self.profile
    }

    /// Collapse the profile to a single value equal to its maximum - the
    /// sizing signal for capacity calculations.
    pub fn isolate_peak(&self) -> EnergyFlow {
        EnergyFlow {
            source: self.source,
            sink: self.sink,
            carrier: self.carrier.clone(),
            profile: vec![self.peak()],
            allow_negative: self.allow_negative,
        }
    }

    pub fn peak(&self) -> f64 {
        self.profile.iter().copied().fold(f64::MIN, f64::max)
    }

    pub fn annual_total(&self) -> f64 {
        self.profile.iter().sum()
    }

    /// Subtract another profile value-by-value, clamping at zero. Used to net
    /// local potentials (e.g. on-site PV) off a demand before sizing.
    pub fn net_of(&self, other: &EnergyFlow) -> anyhow::Result<EnergyFlow> {
        if self.carrier != other.carrier {
            bail!(
                "Cannot net flows of different energy carriers ('{}' vs '{}').",
                self.carrier,
                other.carrier
            );
        }
        let profile = self
            .profile
            .iter()
            .enumerate()
            .map(|(t, v)| (v - other.profile.get(t).copied().unwrap_or(0.)).max(0.))
            .collect();
        EnergyFlow::build(
            self.source,
            self.sink,
            self.carrier.clone(),
            profile,
            self.allow_negative,
        )
    }

    fn combine(&self, other: &EnergyFlow, op: impl Fn(f64, f64) -> f64) -> anyhow::Result<Self> {
        if self.carrier != other.carrier {
            bail!(
                "Cannot combine energy flows of different carriers ('{}' and '{}').",
                self.carrier,
                other.carrier
            );
        }
        if self.profile.len() != other.profile.len() {
            bail!(
                "Cannot combine energy flows with profiles of different length ({} and {}).",
                self.profile.len(),
                other.profile.len()
            );
        }
        let profile = self
            .profile
            .iter()
            .zip(other.profile.iter())
            .map(|(a, b)| op(*a, *b))
            .collect();
        Self::build(
            self.source,
            self.sink,
            self.carrier.clone(),
            profile,
            self.allow_negative || other.allow_negative,
        )
    }
}

impl Add for &EnergyFlow {
    type Output = anyhow::Result<EnergyFlow>;

    fn add(self, rhs: Self) -> Self::Output {
        self.combine(rhs, |a, b| a + b)
    }
}

impl Sub for &EnergyFlow {
    type Output = anyhow::Result<EnergyFlow>;

    fn sub(self, rhs: Self) -> Self::Output {
        self.combine(rhs, |a, b| a - b)
    }
}

impl fmt::Display for EnergyFlow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} -> {} [{}], {} value(s)",
            self.source,
            self.sink,
            self.carrier,
            self.profile.len()
        )
    }
}

/// Parse the temperature in degrees Celsius out of a thermal-water carrier
/// code of the form `T60W`.
pub fn carrier_temperature(carrier: &str) -> Option<f64> {
    let rest = carrier.strip_prefix('T')?.strip_suffix('W')?;
    rest.parse().ok()
}

pub fn carrier_is_electricity(carrier: &str) -> bool {
    carrier.starts_with('E') && carrier.len() > 1
}

pub fn carrier_is_thermal(carrier: &str) -> bool {
    carrier_temperature(carrier).is_some()
}

/// Reduce a leap-year hourly profile (8784 values) to 8760 values by removing
/// the 24 hours corresponding to 29 February. Profiles already 8760 long (or
/// any other length) are returned unchanged.
pub fn strip_leap_day(profile: Vec<f64>) -> Vec<f64> {
    use super::units::{HOURS_PER_DAY, HOURS_PER_LEAP_YEAR};

    if profile.len() != HOURS_PER_LEAP_YEAR as usize {
        return profile;
    }
    // Feb 29 occupies hours (31 + 28) * 24 .. (31 + 29) * 24
    let start = (59 * HOURS_PER_DAY) as usize;
    let end = (60 * HOURS_PER_DAY) as usize;
    profile
        .into_iter()
        .enumerate()
        .filter_map(|(i, v)| (!(start..end).contains(&i)).then_some(v))
        .collect()
}

/// Look up the hour index of the peak value and render it as a timestamp in a
/// reference non-leap year.
pub fn peak_timestamp(profile: &[f64]) -> Option<String> {
    use chrono::{Duration, NaiveDate};

    let (peak_idx, _) = profile
        .iter()
        .enumerate()
        .max_by(|(_, a), (_, b)| a.total_cmp(b))?;
    let start = NaiveDate::from_ymd_opt(2025, 1, 1)?.and_hms_opt(0, 0, 0)?;
    Some(
        (start + Duration::hours(peak_idx as i64))
            .format("%Y-%m-%d %H:%M:%S")
            .to_string(),
    )
}
