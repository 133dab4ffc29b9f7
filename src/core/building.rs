use crate::core::component::Placement;
use crate::core::energy_flow::{strip_leap_day, EnergyFlow, FlowCategory};
use crate::core::supply_system::system::SupplySystem;
use crate::input::{InputLocator, ServiceKind, SupplyAssembly, TotalDemandRecord};
use anyhow::Context;
use indexmap::IndexMap;
use std::str::FromStr;
use tracing::warn;

/// Carrier the heating and domestic-hot-water demands of a building are
/// served on (medium-temperature hot water).
pub const HEATING_CARRIER: &str = "T60W";

/// Carrier the space-cooling demand of a building is served on (chilled
/// water).
pub const COOLING_CARRIER: &str = "T10W";

/// Connectivity a building starts the calculation with, before the resolver
/// reconciles it with the selected networks.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum ConnectivityState {
    StandAlone,
    /// Member of whichever network is currently selected.
    Network,
    /// Member of one concrete named network, e.g. `N1001`.
    NamedNetwork(String),
}

impl FromStr for ConnectivityState {
    type Err = std::convert::Infallible;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        Ok(match value {
            "stand_alone" | "" => ConnectivityState::StandAlone,
            "network" => ConnectivityState::Network,
            name => ConnectivityState::NamedNetwork(name.to_string()),
        })
    }
}

/// A building with its annual demand profiles and (once calculated) its
/// standalone supply system.
#[derive(Clone, Debug)]
pub struct Building {
    pub name: String,
    pub gfa_m2: f64,
    demands: IndexMap<ServiceKind, EnergyFlow>,
    /// Local supply flows per carrier code, netted off the demand of the same
    /// carrier before any capacity is sized.
    pub available_potentials: IndexMap<String, EnergyFlow>,
    pub initial_connectivity_state: ConnectivityState,
    pub stand_alone_supply_system_composition: IndexMap<Placement, Vec<String>>,
    pub stand_alone_supply_system: Option<SupplySystem>,
}

impl Building {
    /// Load a building and its hourly demand profiles through the locator.
    /// An absent demand file leaves the building without demand flows and is
    /// reported as a warning, not an error.
    pub fn load(
        locator: &dyn InputLocator,
        record: &TotalDemandRecord,
        initial_connectivity_state: ConnectivityState,
    ) -> anyhow::Result<Self> {
        let mut demands: IndexMap<ServiceKind, EnergyFlow> = Default::default();
        match locator
            .building_demand(&record.name)
            .with_context(|| format!("could not read the demand of building {}", record.name))?
        {
            Some(demand) => {
                for (service, carrier, profile) in [
                    (ServiceKind::Heating, HEATING_CARRIER, demand.heating_kwh),
                    (ServiceKind::Cooling, COOLING_CARRIER, demand.cooling_kwh),
                    (ServiceKind::HotWater, HEATING_CARRIER, demand.hot_water_kwh),
                ] {
                    let Some(profile) = profile else { continue };
                    if profile.iter().sum::<f64>() <= 0. {
                        continue;
                    }
                    demands.insert(
                        service,
                        EnergyFlow::new(
                            FlowCategory::Primary,
                            FlowCategory::Consumer,
                            carrier,
                            strip_leap_day(profile),
                        )?,
                    );
                }
            }
            None => {
                warn!(
                    "⚠ No demand file found for building {}; it is carried without demand.",
                    record.name
                );
            }
        }
        let mut available_potentials: IndexMap<String, EnergyFlow> = Default::default();
        for (carrier, profile) in locator.building_potentials(&record.name)? {
            if profile.iter().sum::<f64>() <= 0. {
                continue;
            }
            let flow = EnergyFlow::new(
                FlowCategory::Source,
                FlowCategory::Primary,
                carrier.clone(),
                strip_leap_day(profile),
            )?;
            available_potentials.insert(carrier, flow);
        }
        Ok(Self {
            name: record.name.clone(),
            gfa_m2: record.gfa_m2,
            demands,
            available_potentials,
            initial_connectivity_state,
            stand_alone_supply_system_composition: Default::default(),
            stand_alone_supply_system: None,
        })
    }

    pub fn demand(&self, service: ServiceKind) -> Option<&EnergyFlow> {
        self.demands.get(&service)
    }

    pub fn has_demand(&self, service: ServiceKind) -> bool {
        self.demand(service)
            .is_some_and(|flow| flow.annual_total() > 0.)
    }

    /// The building-level heating system serves space heat and hot water from
    /// the same equipment, so both demands are sized together.
    pub fn combined_heating_demand(&self) -> anyhow::Result<Option<EnergyFlow>> {
        match (
            self.demand(ServiceKind::Heating),
            self.demand(ServiceKind::HotWater),
        ) {
            (Some(heating), Some(hot_water)) => Ok(Some((heating + hot_water)?)),
            (Some(flow), None) | (None, Some(flow)) => Ok(Some(flow.clone())),
            (None, None) => Ok(None),
        }
    }

    /// Record the primary/secondary/tertiary code lists of the assigned
    /// standalone assembly.
    pub fn set_composition_from_assembly(&mut self, assembly: &SupplyAssembly) {
        self.stand_alone_supply_system_composition = IndexMap::from([
            (Placement::Primary, assembly.primary_components.clone()),
            (Placement::Secondary, assembly.secondary_components.clone()),
            (Placement::Tertiary, assembly.tertiary_components.clone()),
        ]);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::input::{BuildingDemand, MemoryLocator};
    use pretty_assertions::assert_eq;
    use rstest::*;

    fn record(name: &str) -> TotalDemandRecord {
        TotalDemandRecord {
            name: name.to_string(),
            gfa_m2: 1_200.,
            qh_mwh_yr: 10.,
            qc_mwh_yr: 5.,
            qww_mwh_yr: 2.,
        }
    }

    #[rstest]
    #[case("stand_alone", ConnectivityState::StandAlone)]
    #[case("network", ConnectivityState::Network)]
    #[case("N1001", ConnectivityState::NamedNetwork("N1001".to_string()))]
    fn test_connectivity_state_parsing(#[case] value: &str, #[case] expected: ConnectivityState) {
        assert_eq!(value.parse::<ConnectivityState>().unwrap(), expected);
    }

    #[rstest]
    fn test_load_with_missing_demand_file_leaves_building_without_demand() {
        let locator = MemoryLocator::default();
        let building =
            Building::load(&locator, &record("B1001"), ConnectivityState::StandAlone).unwrap();
        assert!(!building.has_demand(ServiceKind::Heating));
        assert!(!building.has_demand(ServiceKind::Cooling));
    }

    #[rstest]
    fn test_combined_heating_demand_sums_heating_and_hot_water() {
        let mut locator = MemoryLocator::default();
        locator.demands.insert(
            "B1001".to_string(),
            BuildingDemand {
                heating_kwh: Some(vec![10., 20.]),
                cooling_kwh: None,
                hot_water_kwh: Some(vec![1., 2.]),
            },
        );
        let building =
            Building::load(&locator, &record("B1001"), ConnectivityState::StandAlone).unwrap();
        let combined = building.combined_heating_demand().unwrap().unwrap();
        assert_eq!(combined.profile(), &[11., 22.]);
        assert_eq!(combined.carrier(), HEATING_CARRIER);
    }
}
