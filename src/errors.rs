use std::fmt;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DistrictError {
    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),
    #[error("Error identified during district supply calculation: {0}")]
    FailureInCalculation(#[from] anyhow::Error),
    #[error(transparent)]
    CapacityInsufficiency(#[from] CapacityInsufficiencyError),
}

/// Summary of one installed component, carried inside a
/// [`CapacityInsufficiencyError`] for diagnostics.
#[derive(Clone, Debug)]
pub struct InstalledComponentSummary {
    pub code: String,
    pub placement: String,
    pub capacity_kw: f64,
    pub input_carrier: Option<String>,
    pub output_carrier: String,
}

/// Raised when the installed components of a supply system are structurally
/// unable to meet its demand.
///
/// This typically signals that an explicit assembly selection contains codes
/// absent from the activation-priority table, i.e. components that are
/// installed but never activated.
#[derive(Clone, Debug, Error)]
pub struct CapacityInsufficiencyError {
    pub target: String,
    pub unmet_peak_kw: f64,
    pub installed: Vec<InstalledComponentSummary>,
    pub activation_order: Vec<(String, Vec<String>)>,
}

impl fmt::Display for CapacityInsufficiencyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "The installed supply system components for '{}' cannot meet its demand ({:.1} kW left uncovered).",
            self.target, self.unmet_peak_kw
        )?;
        writeln!(f, "Installed components:")?;
        if self.installed.is_empty() {
            writeln!(f, "  (none)")?;
        }
        for component in &self.installed {
            writeln!(
                f,
                "  - {} (placement {}, capacity {:.1} kW, input {}, output {})",
                component.code,
                component.placement,
                component.capacity_kw,
                component.input_carrier.as_deref().unwrap_or("-"),
                component.output_carrier,
            )?;
        }
        writeln!(f, "Activation order:")?;
        for (placement, order) in &self.activation_order {
            writeln!(
                f,
                "  - {placement}: {}",
                if order.is_empty() {
                    "(empty)".to_string()
                } else {
                    order.join(", ")
                }
            )?;
        }
        write!(
            f,
            "Components that appear above but not in the activation order are installed yet never activated. Check the selected supply assembly, or fall back to selecting component categories instead."
        )
    }
}
