use crate::core::units::{annualize_capex, WATTS_PER_KILOWATT};
use anyhow::{anyhow, bail};
use indexmap::IndexMap;
use serde::Deserialize;
use strum_macros::{Display, EnumIter, EnumString};

/// Carrier code for low-voltage grid electricity consumed as parasitic or
/// drive energy by components.
pub const ELECTRICITY_CARRIER: &str = "E230AC";

/// Carrier code for the low-temperature water loop through which condenser
/// heat is rejected to heat-rejection equipment or the environment.
pub const REJECTION_CARRIER: &str = "T30W";

/// Structural role of a component inside a supply system.
#[derive(Clone, Copy, Debug, Deserialize, Display, EnumIter, EnumString, Eq, Hash, PartialEq)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum Placement {
    Primary,
    Secondary,
    Tertiary,
}

/// Technology category a capacity-tier table is filed under.
#[derive(Clone, Copy, Debug, Deserialize, Display, EnumIter, EnumString, Eq, Hash, PartialEq)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ComponentCategory {
    Boilers,
    VaporCompressionChillers,
    AbsorptionChillers,
    HeatPumps,
    CoolingTowers,
}

/// Behavioral class of a component, resolved from its code through the
/// component registry.
#[derive(Clone, Copy, Debug, Display, Eq, Hash, PartialEq)]
pub enum ComponentClass {
    Boiler,
    VaporCompressionChiller,
    AbsorptionChiller,
    HeatPump,
    CoolingTower,
}

impl From<ComponentCategory> for ComponentClass {
    fn from(category: ComponentCategory) -> Self {
        match category {
            ComponentCategory::Boilers => ComponentClass::Boiler,
            ComponentCategory::VaporCompressionChillers => ComponentClass::VaporCompressionChiller,
            ComponentCategory::AbsorptionChillers => ComponentClass::AbsorptionChiller,
            ComponentCategory::HeatPumps => ComponentClass::HeatPump,
            ComponentCategory::CoolingTowers => ComponentClass::CoolingTower,
        }
    }
}

/// One capacity-tier row of a technology-category table.
///
/// Capacities are in watts; investment cost is per kW installed. The
/// efficiency field is interpreted per class (thermal efficiency for boilers,
/// COP for chillers and heat pumps) and `aux_share` is parasitic electricity
/// per unit of output.
#[derive(Clone, Debug, Deserialize)]
pub struct CapacityTier {
    pub code: String,
    #[serde(default)]
    pub description: String,
    pub cap_min: f64,
    pub cap_max: f64,
    pub inv_cost_per_kw: f64,
    pub lifetime_yrs: f64,
    pub o_and_m_share: f64,
    pub efficiency: f64,
    #[serde(default)]
    pub aux_share: f64,
    pub input_carrier: String,
    pub output_carrier: String,
}

impl CapacityTier {
    pub fn input_carrier(&self) -> Option<&str> {
        match self.input_carrier.as_str() {
            "" | "NONE" => None,
            carrier => Some(carrier),
        }
    }
}

/// The complete set of technology-category tables plus the feedstock price
/// table, loaded once per session.
#[derive(Clone, Debug, Default)]
pub struct TechnologyDatabase {
    categories: IndexMap<ComponentCategory, Vec<CapacityTier>>,
    feedstock_prices: IndexMap<String, f64>,
}

impl TechnologyDatabase {
    pub fn new(
        categories: IndexMap<ComponentCategory, Vec<CapacityTier>>,
        feedstock_prices: IndexMap<String, f64>,
    ) -> Self {
        Self {
            categories,
            feedstock_prices,
        }
    }

    pub fn category(&self, category: ComponentCategory) -> &[CapacityTier] {
        self.categories
            .get(&category)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    /// Locate the capacity tier for a component code across all categories.
    /// Where a code has several tiers, the one whose capacity band contains
    /// `capacity_w` wins, falling back to the largest tier.
    pub fn find_tier(&self, code: &str, capacity_w: f64) -> Option<&CapacityTier> {
        let mut tiers: Vec<&CapacityTier> = self
            .categories
            .values()
            .flatten()
            .filter(|tier| tier.code == code)
            .collect();
        tiers.sort_by(|a, b| a.cap_max.total_cmp(&b.cap_max));
        tiers
            .iter()
            .find(|tier| capacity_w >= tier.cap_min && capacity_w <= tier.cap_max)
            .or(tiers.last())
            .copied()
    }

    pub fn has_code(&self, code: &str) -> bool {
        self.categories
            .values()
            .flatten()
            .any(|tier| tier.code == code)
    }

    /// Price of purchasing an energy carrier, in USD per kWh. `None` when the
    /// feedstock table has no entry for the carrier.
    pub fn price(&self, carrier: &str) -> Option<f64> {
        self.feedstock_prices.get(carrier).copied()
    }
}

/// Maps component codes to their behavioral class.
///
/// Built from a technology database before any component is instantiated and
/// owned by the session; [`Component::install`] fails on codes the registry
/// does not know.
#[derive(Clone, Debug, Default)]
pub struct ComponentRegistry {
    code_to_class: IndexMap<String, ComponentClass>,
}

impl ComponentRegistry {
    pub fn from_database(database: &TechnologyDatabase) -> Self {
        let mut code_to_class: IndexMap<String, ComponentClass> = Default::default();
        for (category, tiers) in &database.categories {
            for tier in tiers {
                code_to_class
                    .entry(tier.code.clone())
                    .or_insert((*category).into());
            }
        }
        Self { code_to_class }
    }

    pub fn class_of(&self, code: &str) -> Option<ComponentClass> {
        self.code_to_class.get(code).copied()
    }
}

/// A sized instance of a technology installed in a placement slot of a supply
/// system.
#[derive(Clone, Debug)]
pub struct Component {
    pub code: String,
    pub class: ComponentClass,
    pub placement: Placement,
    pub capacity_kw: f64,
    pub inv_cost_usd: f64,
    pub inv_cost_a_usd: f64,
    pub opex_fixed_a_usd: f64,
    pub efficiency: f64,
    pub aux_share: f64,
    pub input_carrier: Option<String>,
    pub output_carrier: String,
}

/// Hourly input-carrier consumption and heat rejection resulting from
/// operating a component against an output profile.
#[derive(Clone, Debug, Default)]
pub struct ComponentOperation {
    pub inputs: IndexMap<String, Vec<f64>>,
    pub heat_rejection: IndexMap<String, Vec<f64>>,
}

impl Component {
    /// Instantiate a component of `capacity_w` from its capacity tier. The
    /// registry must already be initialized; unknown codes are an error.
    pub fn install(
        registry: &ComponentRegistry,
        tier: &CapacityTier,
        placement: Placement,
        capacity_w: f64,
    ) -> anyhow::Result<Self> {
        let class = registry.class_of(&tier.code).ok_or_else(|| {
            anyhow!(
                "Component code '{}' is not present in the component registry; the registry must be initialized from the technology database before components are instantiated.",
                tier.code
            )
        })?;
        if tier.efficiency <= 0. {
            bail!(
                "Capacity tier for component '{}' declares a non-positive efficiency ({}).",
                tier.code,
                tier.efficiency
            );
        }
        let capacity_kw = capacity_w / WATTS_PER_KILOWATT as f64;
        let inv_cost_usd = capacity_kw * tier.inv_cost_per_kw;
        Ok(Self {
            code: tier.code.clone(),
            class,
            placement,
            capacity_kw,
            inv_cost_usd,
            inv_cost_a_usd: annualize_capex(inv_cost_usd, tier.lifetime_yrs),
            opex_fixed_a_usd: tier.o_and_m_share * inv_cost_usd,
            efficiency: tier.efficiency,
            aux_share: tier.aux_share,
            input_carrier: tier.input_carrier().map(str::to_string),
            output_carrier: tier.output_carrier.clone(),
        })
    }

    /// Operate the component as a black box against an hourly output profile
    /// (kWh), returning the carriers it consumes and the heat it rejects.
    pub fn operate(&self, output: &[f64]) -> ComponentOperation {
        let mut operation = ComponentOperation::default();
        match self.class {
            ComponentClass::Boiler => {
                let fuel_carrier = self
                    .input_carrier
                    .clone()
                    .unwrap_or_else(|| ELECTRICITY_CARRIER.to_string());
                let fuel: Vec<f64> = output.iter().map(|out| out / self.efficiency).collect();
                // combustion losses leave through the flue
                let losses = fuel
                    .iter()
                    .zip(output.iter())
                    .map(|(f, out)| (f - out).max(0.))
                    .collect();
                operation.heat_rejection.insert(fuel_carrier.clone(), losses);
                operation.inputs.insert(fuel_carrier, fuel);
            }
            ComponentClass::HeatPump => {
                let electricity = output.iter().map(|out| out / self.efficiency).collect();
                operation
                    .inputs
                    .insert(ELECTRICITY_CARRIER.to_string(), electricity);
            }
            ComponentClass::VaporCompressionChiller => {
                let electricity: Vec<f64> =
                    output.iter().map(|out| out / self.efficiency).collect();
                // condenser duty is the cooling delivered plus the drive energy
                let rejection = output
                    .iter()
                    .zip(electricity.iter())
                    .map(|(out, e)| out + e)
                    .collect();
                operation
                    .heat_rejection
                    .insert(REJECTION_CARRIER.to_string(), rejection);
                operation
                    .inputs
                    .insert(ELECTRICITY_CARRIER.to_string(), electricity);
            }
            ComponentClass::AbsorptionChiller => {
                let heat_carrier = self
                    .input_carrier
                    .clone()
                    .unwrap_or_else(|| "T90W".to_string());
                let heat: Vec<f64> = output.iter().map(|out| out / self.efficiency).collect();
                let electricity: Vec<f64> =
                    output.iter().map(|out| out * self.aux_share).collect();
                let rejection = output
                    .iter()
                    .zip(heat.iter())
                    .map(|(out, h)| out + h)
                    .collect();
                operation
                    .heat_rejection
                    .insert(REJECTION_CARRIER.to_string(), rejection);
                operation.inputs.insert(heat_carrier, heat);
                operation
                    .inputs
                    .insert(ELECTRICITY_CARRIER.to_string(), electricity);
            }
            ComponentClass::CoolingTower => {
                // output is the heat absorbed from the rejection loop; fans
                // and pumps add their own electricity to what leaves as waste
                let electricity: Vec<f64> =
                    output.iter().map(|absorbed| absorbed * self.aux_share).collect();
                let rejection = output
                    .iter()
                    .zip(electricity.iter())
                    .map(|(absorbed, e)| absorbed + e)
                    .collect();
                operation
                    .heat_rejection
                    .insert(REJECTION_CARRIER.to_string(), rejection);
                operation
                    .inputs
                    .insert(ELECTRICITY_CARRIER.to_string(), electricity);
            }
        }
        operation
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use indexmap::indexmap;

    pub(crate) fn tier(
        code: &str,
        cap_min: f64,
        cap_max: f64,
        efficiency: f64,
        input_carrier: &str,
        output_carrier: &str,
    ) -> CapacityTier {
        CapacityTier {
            code: code.to_string(),
            description: String::new(),
            cap_min,
            cap_max,
            inv_cost_per_kw: 100.,
            lifetime_yrs: 20.,
            o_and_m_share: 0.02,
            efficiency,
            aux_share: 0.02,
            input_carrier: input_carrier.to_string(),
            output_carrier: output_carrier.to_string(),
        }
    }

    pub(crate) fn tiers_map() -> IndexMap<ComponentCategory, Vec<CapacityTier>> {
        indexmap! {
            ComponentCategory::Boilers => vec![
                tier("BO1", 0., 2_000_000., 0.9, "NG", "T60W"),
                tier("BO2", 0., 1_000_000., 0.85, "OIL", "T60W"),
                tier("BO5", 0., 500_000., 0.98, "E230AC", "T60W"),
            ],
            ComponentCategory::VaporCompressionChillers => vec![
                tier("CH1", 0., 10_000., 3.5, "E230AC", "T10W"),
                tier("CH2", 0., 2_000_000., 4.0, "E230AC", "T10W"),
            ],
            ComponentCategory::AbsorptionChillers => vec![
                tier("ACH1", 0., 2_000_000., 0.7, "T90W", "T10W"),
            ],
            ComponentCategory::HeatPumps => vec![
                tier("HP1", 0., 1_500_000., 3.0, "E230AC", "T60W"),
            ],
            ComponentCategory::CoolingTowers => vec![
                tier("CT1", 0., 5_000_000., 1.0, "E230AC", "T30W"),
            ],
        }
    }

    pub(crate) fn prices() -> IndexMap<String, f64> {
        indexmap! {
            "E230AC".to_string() => 0.20,
            "NG".to_string() => 0.06,
            "OIL".to_string() => 0.09,
        }
    }

    /// A small but complete technology database covering all five component
    /// categories, with prices for the common feedstocks.
    pub(crate) fn database() -> TechnologyDatabase {
        TechnologyDatabase::new(tiers_map(), prices())
    }

    pub(crate) fn registry() -> ComponentRegistry {
        ComponentRegistry::from_database(&database())
    }
}
