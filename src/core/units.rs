pub const WATTS_PER_KILOWATT: u32 = 1_000;
pub const KILOWATTS_PER_MEGAWATT: u32 = 1_000;
pub const HOURS_PER_DAY: u32 = 24;
pub const DAYS_PER_YEAR: u32 = 365;
pub const HOURS_PER_YEAR: u32 = HOURS_PER_DAY * DAYS_PER_YEAR;
pub const HOURS_PER_LEAP_YEAR: u32 = HOURS_PER_DAY * 366;

/// Real discount rate applied when annualizing capital expenditure.
pub const DISCOUNT_RATE: f64 = 0.05;

/// Annualize a capital cost over a component or network lifetime using the
/// capital recovery factor at [`DISCOUNT_RATE`].
pub fn annualize_capex(capex: f64, lifetime_yrs: f64) -> f64 {
    if lifetime_yrs <= 0. {
        return capex;
    }
    let i = DISCOUNT_RATE;
    let factor = (1. + i).powf(lifetime_yrs);
    capex * i * factor / (factor - 1.)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use rstest::*;

    #[rstest]
    fn test_annualize_capex() {
        // capital recovery factor for 20 years at 5% is 0.0802425...
        assert_relative_eq!(
            annualize_capex(1_000., 20.),
            80.24258719,
            max_relative = 1e-7
        );
    }

    #[rstest]
    fn test_annualize_capex_zero_lifetime() {
        assert_relative_eq!(annualize_capex(500., 0.), 500.);
    }
}
