use crate::core::component::{
    ComponentCategory, ComponentClass, ComponentRegistry, Placement, TechnologyDatabase,
};
use crate::core::energy_flow::{carrier_temperature, EnergyFlow};
use crate::core::units::WATTS_PER_KILOWATT;
use anyhow::bail;
use indexmap::IndexMap;
use itertools::Itertools;
use tracing::debug;

/// Demands on carriers at or below this temperature are cooling demands.
pub(crate) const COOLING_SUPPLY_TEMP_MAX: f64 = 15.;

/// Heat-rejection equipment is sized to the condenser duty rather than the
/// delivered cooling, which it conservatively bounds at twice the peak.
const TERTIARY_OVERSIZE_FACTOR: f64 = 2.;

/// How the components of a supply system are chosen.
///
/// Explicit selections come from a named assembly record; the category
/// fallback draws one conservative code per selected technology category.
#[derive(Clone, Debug, PartialEq)]
pub enum ComponentSelection {
    Explicit {
        primary: Vec<String>,
        secondary: Vec<String>,
        tertiary: Vec<String>,
    },
    CategoryFallback {
        cooling: Vec<ComponentCategory>,
        heating: Vec<ComponentCategory>,
        heat_rejection: Vec<ComponentCategory>,
    },
}

/// Determines which component instances are installed in each placement slot
/// of a supply system, and in which priority order they are dispatched.
#[derive(Clone, Debug)]
pub struct SupplySystemStructure {
    target: String,
    max_supply_flow: EnergyFlow,
    available_potentials: IndexMap<String, EnergyFlow>,
    selection: ComponentSelection,
    capacity_indicators: IndexMap<Placement, IndexMap<String, f64>>,
    activation_order: IndexMap<Placement, Vec<String>>,
}

impl SupplySystemStructure {
    /// Arguments:
    /// * `target` - the building or network the system is sized for
    /// * `max_supply_flow` - the peak demand flow ([`EnergyFlow::isolate_peak`])
    /// * `available_potentials` - local supply flows per energy-carrier code
    /// * `selection` - how components are chosen for each placement
    pub fn new(
        target: impl Into<String>,
        max_supply_flow: EnergyFlow,
        available_potentials: IndexMap<String, EnergyFlow>,
        selection: ComponentSelection,
    ) -> Self {
        Self {
            target: target.into(),
            max_supply_flow,
            available_potentials,
            selection,
            capacity_indicators: Default::default(),
            activation_order: Default::default(),
        }
    }

    pub fn target(&self) -> &str {
        &self.target
    }

    pub fn demand_carrier(&self) -> &str {
        self.max_supply_flow.carrier()
    }

    pub fn available_potentials(&self) -> &IndexMap<String, EnergyFlow> {
        &self.available_potentials
    }

    pub fn capacity_indicators(&self) -> &IndexMap<Placement, IndexMap<String, f64>> {
        &self.capacity_indicators
    }

    pub fn activation_order(&self) -> &IndexMap<Placement, Vec<String>> {
        &self.activation_order
    }

    /// Peak the installed capacity has to cover, in watts, after netting off
    /// any local potential on the demand carrier.
    pub fn required_peak_w(&self) -> f64 {
        let peak_kw = self.max_supply_flow.peak();
        let potential_kw = self
            .available_potentials
            .get(self.max_supply_flow.carrier())
            .map(EnergyFlow::peak)
            .unwrap_or(0.);
        (peak_kw - potential_kw).max(0.) * WATTS_PER_KILOWATT as f64
    }

    pub fn serves_cooling(&self) -> bool {
        carrier_temperature(self.max_supply_flow.carrier())
            .is_some_and(|temp| temp <= COOLING_SUPPLY_TEMP_MAX)
    }

    /// Populate `capacity_indicators` and `activation_order` against the
    /// technology database.
    ///
    /// Fails when a named assembly references a component code with no
    /// current database entries, or when no viable component exists for a
    /// required placement in category-fallback mode.
    pub fn build(
        &mut self,
        database: &TechnologyDatabase,
        registry: &ComponentRegistry,
    ) -> anyhow::Result<()> {
        let peak_w = self.required_peak_w();
        let capacities = match &self.selection {
            ComponentSelection::Explicit {
                primary,
                secondary,
                tertiary,
            } => self.assemble_explicit(database, peak_w, primary, secondary, tertiary)?,
            ComponentSelection::CategoryFallback {
                cooling,
                heating,
                heat_rejection,
            } => self.assemble_from_categories(database, peak_w, cooling, heating, heat_rejection)?,
        };
        self.activation_order = activation_order_for(&capacities, registry);
        self.capacity_indicators = capacities;
        Ok(())
    }

    fn assemble_explicit(
        &self,
        database: &TechnologyDatabase,
        peak_w: f64,
        primary: &[String],
        secondary: &[String],
        tertiary: &[String],
    ) -> anyhow::Result<IndexMap<Placement, IndexMap<String, f64>>> {
        let mut capacities: IndexMap<Placement, IndexMap<String, f64>> = Default::default();
        let slots = [
            (Placement::Primary, primary, split_equally(peak_w, primary.len())),
            (Placement::Secondary, secondary, peak_w),
            (
                Placement::Tertiary,
                tertiary,
                split_equally(peak_w * TERTIARY_OVERSIZE_FACTOR, tertiary.len()),
            ),
        ];
        for (placement, codes, capacity_each) in slots {
            for code in codes {
                if !database.has_code(code) {
                    bail!(
                        "Supply assembly for '{}' references component code '{code}' ({placement}) with no current entries in the technology database. Check the assembly record or switch to component categories.",
                        self.target
                    );
                }
                *capacities
                    .entry(placement)
                    .or_default()
                    .entry(code.clone())
                    .or_insert(0.) += capacity_each;
            }
        }
        Ok(capacities)
    }

    fn assemble_from_categories(
        &self,
        database: &TechnologyDatabase,
        peak_w: f64,
        cooling: &[ComponentCategory],
        heating: &[ComponentCategory],
        heat_rejection: &[ComponentCategory],
    ) -> anyhow::Result<IndexMap<Placement, IndexMap<String, f64>>> {
        let primary_categories: Vec<ComponentCategory> = if self.serves_cooling() {
            // absorption chillers need a secondary heat-source configuration
            // not modeled by the conservative baseline
            cooling
                .iter()
                .copied()
                .filter(|category| *category != ComponentCategory::AbsorptionChillers)
                .collect()
        } else {
            heating.to_vec()
        };
        if primary_categories.is_empty() {
            bail!(
                "No component categories are configured for the {} demand of '{}'.",
                if self.serves_cooling() { "cooling" } else { "heating" },
                self.target
            );
        }

        let mut primary_codes = vec![];
        for category in &primary_categories {
            if let Some(code) = first_viable_code(database, *category, peak_w) {
                primary_codes.push(code);
            }
        }
        if primary_codes.is_empty() {
            bail!(
                "No component in categories [{}] has a capacity tier covering the peak demand of {:.1} kW for '{}'.",
                primary_categories.iter().join(", "),
                peak_w / WATTS_PER_KILOWATT as f64,
                self.target
            );
        }

        let mut capacities: IndexMap<Placement, IndexMap<String, f64>> = Default::default();
        let capacity_each = split_equally(peak_w, primary_codes.len());
        capacities.insert(
            Placement::Primary,
            primary_codes
                .into_iter()
                .map(|code| (code, capacity_each))
                .collect(),
        );

        if self.serves_cooling() && !heat_rejection.is_empty() {
            let tertiary_peak_w = peak_w * TERTIARY_OVERSIZE_FACTOR;
            let mut tertiary_codes = vec![];
            for category in heat_rejection {
                if let Some(code) = first_viable_code(database, *category, tertiary_peak_w) {
                    tertiary_codes.push(code);
                }
            }
            if tertiary_codes.is_empty() {
                bail!(
                    "No heat-rejection component in categories [{}] has a capacity tier covering the condenser duty of {:.1} kW for '{}'.",
                    heat_rejection.iter().join(", "),
                    tertiary_peak_w / WATTS_PER_KILOWATT as f64,
                    self.target
                );
            }
            let capacity_each = split_equally(tertiary_peak_w, tertiary_codes.len());
            capacities.insert(
                Placement::Tertiary,
                tertiary_codes
                    .into_iter()
                    .map(|code| (code, capacity_each))
                    .collect(),
            );
        }

        Ok(capacities)
    }
}

fn split_equally(total: f64, count: usize) -> f64 {
    if count == 0 {
        0.
    } else {
        total / count as f64
    }
}

/// A component code is viable for a category only if at least one of its
/// capacity tiers can cover the peak on its own; this prevents selecting
/// undersized equipment. Codes are considered in sorted order and only the
/// first viable one is kept.
fn first_viable_code(
    database: &TechnologyDatabase,
    category: ComponentCategory,
    peak_w: f64,
) -> Option<String> {
    database
        .category(category)
        .iter()
        .filter(|tier| tier.cap_max >= peak_w)
        .map(|tier| tier.code.clone())
        .sorted()
        .next()
}

/// Dispatch priority of a class within a placement slot. Classes that cannot
/// act in a slot (a cooling tower cannot generate primary supply) have no
/// rank and are left out of the activation order; evaluation then reports
/// them as installed-but-never-activated.
fn activation_rank(class: ComponentClass, placement: Placement) -> Option<u8> {
    match placement {
        Placement::Primary | Placement::Secondary => match class {
            ComponentClass::HeatPump => Some(0),
            ComponentClass::VaporCompressionChiller => Some(1),
            ComponentClass::AbsorptionChiller => Some(2),
            ComponentClass::Boiler => Some(3),
            ComponentClass::CoolingTower => None,
        },
        Placement::Tertiary => match class {
            ComponentClass::CoolingTower => Some(0),
            _ => None,
        },
    }
}

fn activation_order_for(
    capacities: &IndexMap<Placement, IndexMap<String, f64>>,
    registry: &ComponentRegistry,
) -> IndexMap<Placement, Vec<String>> {
    capacities
        .iter()
        .map(|(placement, codes)| {
            let order: Vec<String> = codes
                .keys()
                .filter_map(|code| {
                    let rank = registry
                        .class_of(code)
                        .and_then(|class| activation_rank(class, *placement));
                    match rank {
                        Some(rank) => Some((rank, code.clone())),
                        None => {
                            debug!(
                                "component '{code}' has no activation priority for placement {placement}"
                            );
                            None
                        }
                    }
                })
                .sorted()
                .map(|(_, code)| code)
                .collect();
            (*placement, order)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::component::test_support::{database, registry};
    use crate::core::energy_flow::FlowCategory;
    use pretty_assertions::assert_eq;
    use rstest::*;

    fn peak_flow(carrier: &str, peak_kw: f64) -> EnergyFlow {
        EnergyFlow::new(
            FlowCategory::Primary,
            FlowCategory::Consumer,
            carrier,
            vec![peak_kw],
        )
        .unwrap()
    }

    #[rstest]
    fn test_category_fallback_selects_first_viable_code() {
        // CH1 sorts first but maxes out at 10 kW; a 400 kW peak must skip it
        let mut structure = SupplySystemStructure::new(
            "B1001",
            peak_flow("T10W", 400.),
            Default::default(),
            ComponentSelection::CategoryFallback {
                cooling: vec![ComponentCategory::VaporCompressionChillers],
                heating: vec![],
                heat_rejection: vec![ComponentCategory::CoolingTowers],
            },
        );
        structure.build(&database(), &registry()).unwrap();
        let primary = &structure.capacity_indicators()[&Placement::Primary];
        assert_eq!(primary.keys().collect::<Vec<_>>(), vec!["CH2"]);
        assert_eq!(primary["CH2"], 400_000.);
        assert_eq!(
            structure.activation_order()[&Placement::Primary],
            vec!["CH2".to_string()]
        );
        // tertiary sized to condenser duty
        assert_eq!(
            structure.capacity_indicators()[&Placement::Tertiary]["CT1"],
            800_000.
        );
    }

    #[rstest]
    fn test_category_fallback_excludes_absorption_chillers() {
        let mut structure = SupplySystemStructure::new(
            "B1001",
            peak_flow("T10W", 5.),
            Default::default(),
            ComponentSelection::CategoryFallback {
                cooling: vec![ComponentCategory::AbsorptionChillers],
                heating: vec![],
                heat_rejection: vec![],
            },
        );
        // the only selected cooling category is excluded by policy
        assert!(structure.build(&database(), &registry()).is_err());
    }

    #[rstest]
    fn test_category_fallback_fails_when_all_codes_undersized() {
        let mut structure = SupplySystemStructure::new(
            "B1001",
            peak_flow("T60W", 9_000.),
            Default::default(),
            ComponentSelection::CategoryFallback {
                cooling: vec![],
                heating: vec![ComponentCategory::Boilers],
                heat_rejection: vec![],
            },
        );
        let result = structure.build(&database(), &registry());
        assert!(result.is_err());
        assert!(result.unwrap_err().to_string().contains("peak demand"));
    }

    #[rstest]
    fn test_explicit_assembly_splits_capacity_equally() {
        let mut structure = SupplySystemStructure::new(
            "B1001",
            peak_flow("T60W", 300.),
            Default::default(),
            ComponentSelection::Explicit {
                primary: vec!["BO1".to_string(), "HP1".to_string()],
                secondary: vec![],
                tertiary: vec![],
            },
        );
        structure.build(&database(), &registry()).unwrap();
        let primary = &structure.capacity_indicators()[&Placement::Primary];
        assert_eq!(primary["BO1"], 150_000.);
        assert_eq!(primary["HP1"], 150_000.);
        // heat pumps are dispatched before boilers
        assert_eq!(
            structure.activation_order()[&Placement::Primary],
            vec!["HP1".to_string(), "BO1".to_string()]
        );
    }

    #[rstest]
    fn test_explicit_assembly_with_unknown_code_fails() {
        let mut structure = SupplySystemStructure::new(
            "B1001",
            peak_flow("T60W", 300.),
            Default::default(),
            ComponentSelection::Explicit {
                primary: vec!["BO99".to_string()],
                secondary: vec![],
                tertiary: vec![],
            },
        );
        assert!(structure.build(&database(), &registry()).is_err());
    }

    #[rstest]
    fn test_misplaced_component_left_out_of_activation_order() {
        // a cooling tower named as a primary component is installed but can
        // never be activated
        let mut structure = SupplySystemStructure::new(
            "B1001",
            peak_flow("T10W", 100.),
            Default::default(),
            ComponentSelection::Explicit {
                primary: vec!["CT1".to_string()],
                secondary: vec![],
                tertiary: vec![],
            },
        );
        structure.build(&database(), &registry()).unwrap();
        assert!(structure.capacity_indicators()[&Placement::Primary].contains_key("CT1"));
        assert!(structure.activation_order()[&Placement::Primary].is_empty());
    }

    #[rstest]
    fn test_potentials_reduce_required_peak() {
        let mut potentials: IndexMap<String, EnergyFlow> = Default::default();
        potentials.insert(
            "T60W".to_string(),
            EnergyFlow::new(
                FlowCategory::Source,
                FlowCategory::Consumer,
                "T60W",
                vec![120.],
            )
            .unwrap(),
        );
        let structure = SupplySystemStructure::new(
            "B1001",
            peak_flow("T60W", 300.),
            potentials,
            ComponentSelection::Explicit {
                primary: vec!["BO1".to_string()],
                secondary: vec![],
                tertiary: vec![],
            },
        );
        assert_eq!(structure.required_peak_w(), 180_000.);
    }
}
