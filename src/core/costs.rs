use crate::core::component::{Component, ComponentClass};
use crate::core::energy_flow::{carrier_is_electricity, carrier_temperature};
use crate::core::supply_system::structure::COOLING_SUPPLY_TEMP_MAX;
use crate::core::supply_system::system::SupplySystem;
use crate::core::units::annualize_capex;
use crate::input::{NetworkEdge, NetworkType, PipeCatalogRow, Scale, ServiceKind};
use indexmap::IndexMap;
use tracing::warn;

/// Unmapped energy-carrier costs below this are ignored silently; above it
/// they are surfaced as a warning.
pub const UNMAPPED_CARRIER_WARN_THRESHOLD_USD: f64 = 100.;

/// Thermal-water carriers at or above this temperature classify as space
/// heating rather than domestic hot water.
const HEATING_SUPPLY_TEMP_MIN: f64 = 60.;

/// Cost attribution of one derived service, with its component and
/// energy-carrier breakdown and ownership scale.
#[derive(Clone, Debug, PartialEq)]
pub struct ServiceCost {
    pub capex_total_usd: f64,
    pub capex_a_usd: f64,
    pub opex_fixed_usd: f64,
    pub opex_a_fixed_usd: f64,
    pub opex_var_usd: f64,
    pub opex_a_var_usd: f64,
    pub opex_usd: f64,
    pub opex_a_usd: f64,
    pub tac_usd: f64,
    pub scale: Scale,
    pub components: Vec<ComponentShare>,
    pub energy_costs: Vec<CarrierShare>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct ComponentShare {
    pub code: String,
    pub placement: String,
    pub capacity_kw: f64,
    pub capex_usd: f64,
}

#[derive(Clone, Debug, PartialEq)]
pub struct CarrierShare {
    pub carrier: String,
    pub cost_usd: f64,
}

impl ServiceCost {
    fn zero(scale: Scale) -> Self {
        Self {
            capex_total_usd: 0.,
            capex_a_usd: 0.,
            opex_fixed_usd: 0.,
            opex_a_fixed_usd: 0.,
            opex_var_usd: 0.,
            opex_a_var_usd: 0.,
            opex_usd: 0.,
            opex_a_usd: 0.,
            tac_usd: 0.,
            scale,
            components: vec![],
            energy_costs: vec![],
        }
    }

    fn finalize(&mut self) {
        self.opex_usd = self.opex_fixed_usd + self.opex_var_usd;
        self.opex_a_usd = self.opex_a_fixed_usd + self.opex_a_var_usd;
        self.tac_usd = self.capex_a_usd + self.opex_a_usd;
    }
}

/// Who a supply system belongs to and which of the owning building's
/// services are met by a network, for scale tagging and prefix fallbacks.
#[derive(Clone, Debug, Default)]
pub struct ExtractionContext {
    /// `Some` for a network-level system, `None` for a standalone one.
    pub network_type: Option<NetworkType>,
    /// `None` for a system owned by a whole network rather than a building.
    pub building: Option<String>,
    pub network_connected_services: Vec<ServiceKind>,
}

impl ExtractionContext {
    pub fn stand_alone(building: &str, network_connected_services: Vec<ServiceKind>) -> Self {
        Self {
            network_type: None,
            building: Some(building.to_string()),
            network_connected_services,
        }
    }

    pub fn network(network_type: NetworkType) -> Self {
        Self {
            network_type: Some(network_type),
            building: None,
            network_connected_services: vec![],
        }
    }

    /// The scale a service of this system is owned at. A real building that
    /// is not network-connected for the service is BUILDING scale regardless
    /// of what its underlying assembly claims.
    fn scale_for(&self, service: ServiceKind) -> Scale {
        match &self.building {
            None => Scale::District,
            Some(_) if self.network_connected_services.contains(&service) => Scale::District,
            Some(_) => Scale::Building,
        }
    }
}

/// Classify which service a component serves.
///
/// Cooling equipment is recognized by its code prefix; boilers and heat
/// pumps are split between space heating and hot water by the temperature of
/// their output carrier. This temperature heuristic is transitional - once
/// the technology database tags service type per component it disappears, so
/// keep it behind this single function.
pub fn classify_component(component: &Component) -> ServiceKind {
    if ["CH", "VCCH", "ACH", "CT"]
        .iter()
        .any(|prefix| component.code.starts_with(prefix))
    {
        return ServiceKind::Cooling;
    }
    if component.code.starts_with("BO") || component.code.starts_with("HP") {
        if let Some(temp) = carrier_temperature(&component.output_carrier) {
            return if temp >= HEATING_SUPPLY_TEMP_MIN {
                ServiceKind::Heating
            } else {
                ServiceKind::HotWater
            };
        }
    }
    match component.class {
        ComponentClass::VaporCompressionChiller
        | ComponentClass::AbsorptionChiller
        | ComponentClass::CoolingTower => ServiceKind::Cooling,
        _ => ServiceKind::Heating,
    }
}

/// Carrier-code to service-name-prefix table shared by the component-based
/// and carrier-based extraction paths.
fn carrier_prefix(carrier: &str) -> Option<&'static str> {
    if carrier_is_electricity(carrier) {
        return Some("GRID");
    }
    if let Some(temp) = carrier_temperature(carrier) {
        if temp <= COOLING_SUPPLY_TEMP_MAX {
            return Some("DC");
        }
        if temp >= 40. {
            return Some("DH");
        }
        // the rejection loop is never purchased
        return None;
    }
    match carrier {
        "NG" => Some("NG"),
        "OIL" => Some("OIL"),
        "COAL" => Some("COAL"),
        "WOOD" => Some("WOOD"),
        "BG" => Some("BG"),
        "BM" => Some("BM"),
        "H2" => Some("H2"),
        "DH" => Some("DH"),
        "DC" => Some("DC"),
        _ => None,
    }
}

/// Map a raw carrier entry of the annual cost table to a service. Heating
/// fuels default to space heating, the chilled-water carrier to cooling;
/// electricity is ambiguous and returns `None`, to be reconciled against
/// already-known service names instead.
pub fn carrier_service(carrier: &str) -> Option<(&'static str, ServiceKind)> {
    if carrier_is_electricity(carrier) {
        return None;
    }
    let prefix = carrier_prefix(carrier)?;
    let service = match prefix {
        "DC" => ServiceKind::Cooling,
        _ => ServiceKind::Heating,
    };
    Some((prefix, service))
}

fn component_service_prefix(component: &Component, context: &ExtractionContext) -> String {
    if let Some(prefix) = component
        .input_carrier
        .as_deref()
        .and_then(carrier_prefix)
    {
        return prefix.to_string();
    }
    // no resolvable input carrier: fall back to the network carrier when the
    // system is known network-connected, else assume grid electricity
    match context.network_type {
        Some(network_type) => network_type.to_string(),
        None => "GRID".to_string(),
    }
}

/// Transform a supply system's installed components and annual cost table
/// into named services with correct ownership scale.
pub fn extract_supply_costs(
    system: &SupplySystem,
    context: &ExtractionContext,
) -> IndexMap<String, ServiceCost> {
    let mut services: IndexMap<String, ServiceCost> = Default::default();
    let mut component_codes: Vec<String> = vec![];

    for components in system.installed_components().values() {
        for component in components.values() {
            component_codes.push(component.code.clone());
            let service = match context.network_type {
                Some(NetworkType::DH) => ServiceKind::Heating,
                Some(NetworkType::DC) => ServiceKind::Cooling,
                None => classify_component(component),
            };
            let name = format!(
                "{}{}",
                component_service_prefix(component, context),
                service.suffix()
            );
            let entry = services
                .entry(name)
                .or_insert_with(|| ServiceCost::zero(context.scale_for(service)));
            entry.capex_total_usd += component.inv_cost_usd;
            entry.capex_a_usd += component.inv_cost_a_usd;
            entry.opex_fixed_usd += component.opex_fixed_a_usd;
            entry.opex_a_fixed_usd += component.opex_fixed_a_usd;
            entry.components.push(ComponentShare {
                code: component.code.clone(),
                placement: component.placement.to_string(),
                capacity_kw: component.capacity_kw,
                capex_usd: component.inv_cost_usd,
            });
        }
    }

    for (key, cost) in system.annual_cost() {
        if component_codes.contains(key) {
            continue;
        }
        let target = match carrier_service(key) {
            Some((prefix, service)) => Some((format!("{prefix}{}", service.suffix()), service)),
            None => {
                // ambiguous carrier (electricity): reconcile against known
                // service names sharing the prefix, so that electricity cost
                // lands under the service of the equipment consuming it
                carrier_prefix(key).and_then(|prefix| {
                    services
                        .keys()
                        .find(|name| name.starts_with(&format!("{prefix}_")))
                        .cloned()
                        .map(|name| {
                            let service = suffix_service(&name);
                            (name, service)
                        })
                })
            }
        };
        match target {
            Some((name, service)) => {
                let entry = services
                    .entry(name)
                    .or_insert_with(|| ServiceCost::zero(context.scale_for(service)));
                entry.opex_var_usd += cost;
                entry.opex_a_var_usd += cost;
                entry.energy_costs.push(CarrierShare {
                    carrier: key.clone(),
                    cost_usd: *cost,
                });
            }
            None => {
                if *cost > UNMAPPED_CARRIER_WARN_THRESHOLD_USD {
                    warn!(
                        "⚠ Annual cost of {cost:.0} USD on carrier '{key}' could not be attributed to any service{}.",
                        context
                            .building
                            .as_deref()
                            .map(|b| format!(" of building {b}"))
                            .unwrap_or_default()
                    );
                }
            }
        }
    }

    for service in services.values_mut() {
        service.finalize();
    }
    services
}

fn suffix_service(name: &str) -> ServiceKind {
    if name.ends_with("_cs") {
        ServiceKind::Cooling
    } else if name.ends_with("_ww") {
        ServiceKind::HotWater
    } else {
        ServiceKind::Heating
    }
}

/// Union two per-service cost maps into a new one, summing where both sides
/// carry the same service.
pub fn merge_service_costs(
    left: &IndexMap<String, ServiceCost>,
    right: &IndexMap<String, ServiceCost>,
) -> IndexMap<String, ServiceCost> {
    let mut merged = left.clone();
    for (name, addition) in right {
        match merged.get_mut(name) {
            None => {
                merged.insert(name.clone(), addition.clone());
            }
            Some(entry) => {
                entry.capex_total_usd += addition.capex_total_usd;
                entry.capex_a_usd += addition.capex_a_usd;
                entry.opex_fixed_usd += addition.opex_fixed_usd;
                entry.opex_a_fixed_usd += addition.opex_a_fixed_usd;
                entry.opex_var_usd += addition.opex_var_usd;
                entry.opex_a_var_usd += addition.opex_a_var_usd;
                entry.components.extend(addition.components.clone());
                entry.energy_costs.extend(addition.energy_costs.clone());
                entry.finalize();
            }
        }
    }
    merged
}

/// Rename the `_hs`-suffixed services of a DHW-fallback system to `_ww`.
pub fn rename_heating_services_to_hot_water(
    services: IndexMap<String, ServiceCost>,
) -> IndexMap<String, ServiceCost> {
    services
        .into_iter()
        .map(|(name, cost)| match name.strip_suffix("_hs") {
            Some(prefix) => (format!("{prefix}_ww"), cost),
            None => (name, cost),
        })
        .collect()
}

/// Capital cost of a network's piping, reported alongside (never merged
/// into) the per-service cost table.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct PipingCost {
    pub length_m: f64,
    pub capex_total_usd: f64,
    pub capex_a_usd: f64,
}

/// Piping cost from edge lengths and diameter-indexed unit costs, annualized
/// over the configured network lifetime. Each edge is priced at the catalog
/// row nearest its diameter.
pub fn calc_network_piping_cost(
    edges: &[NetworkEdge],
    catalog: &[PipeCatalogRow],
    network_lifetime_yrs: f64,
) -> PipingCost {
    if catalog.is_empty() {
        return PipingCost::default();
    }
    let mut length_m = 0.;
    let mut capex_total_usd = 0.;
    for edge in edges {
        if let Some(row) = catalog.iter().min_by(|a, b| {
            (a.diameter_mm - edge.diameter_mm)
                .abs()
                .total_cmp(&(b.diameter_mm - edge.diameter_mm).abs())
        }) {
            length_m += edge.length_m;
            capex_total_usd += edge.length_m * row.cost_usd_per_m;
        }
    }
    PipingCost {
        length_m,
        capex_total_usd,
        capex_a_usd: annualize_capex(capex_total_usd, network_lifetime_yrs),
    }
}
