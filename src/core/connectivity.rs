//! Decides, per building and per service, whether the service is met by the
//! building's own equipment or by a district network, and drives sizing and
//! evaluation of the supply systems at both scales.
//!
//! Heating and cooling sizing touch disjoint per-building state and run over
//! independently scoped domains; the merge step runs only after both are
//! complete.

use crate::core::building::{Building, ConnectivityState};
use crate::core::component::{
    CapacityTier, Component, ComponentCategory, ComponentRegistry, Placement, TechnologyDatabase,
};
use crate::core::costs::{
    calc_network_piping_cost, extract_supply_costs, merge_service_costs,
    rename_heating_services_to_hot_water, ExtractionContext, PipingCost, ServiceCost,
};
use crate::core::energy_flow::EnergyFlow;
use crate::core::supply_system::structure::{ComponentSelection, SupplySystemStructure};
use crate::core::supply_system::system::SupplySystem;
use crate::input::{
    filter_supply_code_by_scale, strip_scale_label, Config, InputLocator, NetworkType, NodeType,
    Scale, ServiceKind, SupplyAssembly, SupplyAssignment, CATEGORY_FALLBACK_SENTINEL,
};
use anyhow::{anyhow, Context};
use indexmap::{IndexMap, IndexSet};
use strum::IntoEnumIterator;
use tracing::{info, warn};

/// Feedstock of a hot-water assembly mapped to the fuel carrier and the
/// boiler code a synthesized DHW system is built from.
const FEEDSTOCK_BOILERS: [(&str, &str, &str); 6] = [
    ("GRID", "E230AC", "BO5"),
    ("NG", "NG", "BO1"),
    ("NATURALGAS", "NG", "BO1"),
    ("OIL", "OIL", "BO2"),
    ("COAL", "COAL", "BO4"),
    ("WOOD", "WOOD", "BO3"),
];

/// The four top-level network-selection cases.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ConnectivityCase {
    NoNetwork,
    DistrictCoolingOnly,
    DistrictHeatingOnly,
    DistrictHeatingAndCooling,
}

impl ConnectivityCase {
    pub fn number(&self) -> u8 {
        match self {
            ConnectivityCase::NoNetwork => 1,
            ConnectivityCase::DistrictCoolingOnly => 2,
            ConnectivityCase::DistrictHeatingOnly => 3,
            ConnectivityCase::DistrictHeatingAndCooling => 4,
        }
    }

    pub fn description(&self) -> &'static str {
        match self {
            ConnectivityCase::NoNetwork => "no network selected; every service at building scale",
            ConnectivityCase::DistrictCoolingOnly => {
                "district cooling selected; heating and hot water at building scale"
            }
            ConnectivityCase::DistrictHeatingOnly => {
                "district heating selected; cooling at building scale"
            }
            ConnectivityCase::DistrictHeatingAndCooling => {
                "district heating and cooling networks selected"
            }
        }
    }
}

pub fn connectivity_case(config: &Config) -> ConnectivityCase {
    if !config.network_selected() {
        return ConnectivityCase::NoNetwork;
    }
    let has_dh = config.network_types.contains(&NetworkType::DH);
    let has_dc = config.network_types.contains(&NetworkType::DC);
    match (has_dh, has_dc) {
        (true, true) => ConnectivityCase::DistrictHeatingAndCooling,
        (false, true) => ConnectivityCase::DistrictCoolingOnly,
        (true, false) => ConnectivityCase::DistrictHeatingOnly,
        (false, false) => ConnectivityCase::NoNetwork,
    }
}

/// Which services a building provides for itself at building scale.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct ServiceRequirements {
    pub needs_heating: bool,
    pub needs_cooling: bool,
    pub needs_dhw: bool,
    pub case: ConnectivityCase,
}

impl ServiceRequirements {
    pub fn needs(&self, service: ServiceKind) -> bool {
        match service {
            ServiceKind::Heating => self.needs_heating,
            ServiceKind::Cooling => self.needs_cooling,
            ServiceKind::HotWater => self.needs_dhw,
        }
    }

    /// Services of this building met at network scale instead.
    pub fn network_connected_services(&self) -> Vec<ServiceKind> {
        ServiceKind::iter()
            .filter(|service| !self.needs(*service))
            .collect()
    }
}

/// A building provides a service itself exactly when the respective network
/// does not serve it.
pub fn determine_building_service_needs(
    case: ConnectivityCase,
    in_dh_network: bool,
    in_dc_network: bool,
) -> ServiceRequirements {
    let (needs_heating, needs_cooling, needs_dhw) = match case {
        ConnectivityCase::NoNetwork => (true, true, true),
        ConnectivityCase::DistrictCoolingOnly => (true, !in_dc_network, true),
        ConnectivityCase::DistrictHeatingOnly => (!in_dh_network, true, !in_dh_network),
        ConnectivityCase::DistrictHeatingAndCooling => {
            (!in_dh_network, !in_dc_network, !in_dh_network)
        }
    };
    ServiceRequirements {
        needs_heating,
        needs_cooling,
        needs_dhw,
        case,
    }
}

/// Explicit, per-run state that older revisions kept in class-level caches:
/// the technology database, the component registry, the assembly tables and
/// the building-assigned-supply table. Construct one per run (or per test)
/// via [`Session::initialize`].
pub struct Session<'a> {
    pub locator: &'a dyn InputLocator,
    pub config: &'a Config,
    pub database: TechnologyDatabase,
    pub registry: ComponentRegistry,
    pub assemblies: IndexMap<String, SupplyAssembly>,
    pub assignments: IndexMap<String, SupplyAssignment>,
    /// Append-only cache of which network a district-scale assembly belongs
    /// to, discovered while network systems are built.
    pub assembly_networks: IndexMap<String, String>,
}

impl<'a> Session<'a> {
    pub fn initialize(locator: &'a dyn InputLocator, config: &'a Config) -> anyhow::Result<Self> {
        let mut categories: IndexMap<ComponentCategory, Vec<CapacityTier>> = Default::default();
        for category in ComponentCategory::iter() {
            categories.insert(category, locator.technology_tiers(category)?);
        }
        let database = TechnologyDatabase::new(categories, locator.feedstock_prices()?);
        let registry = ComponentRegistry::from_database(&database);

        let mut assemblies: IndexMap<String, SupplyAssembly> = Default::default();
        for service in ServiceKind::iter() {
            for assembly in locator.supply_assemblies(service)? {
                assemblies.insert(assembly.code.clone(), assembly);
            }
        }
        let assignments = locator
            .building_supply_assignments()?
            .into_iter()
            .map(|assignment| (assignment.name.clone(), assignment))
            .collect();

        Ok(Self {
            locator,
            config,
            database,
            registry,
            assemblies,
            assignments,
            assembly_networks: Default::default(),
        })
    }

    fn assigned_code(&self, building: &str, service: ServiceKind) -> Option<String> {
        self.assignments
            .get(building)
            .map(|assignment| strip_scale_label(assignment.assigned(service)).0.to_string())
    }
}

/// Per-building outcome of the whole calculation.
#[derive(Clone, Debug)]
pub struct BuildingResult {
    pub services: IndexMap<String, ServiceCost>,
    pub installed_components: IndexMap<Placement, IndexMap<String, Component>>,
    pub heat_rejection: IndexMap<String, Vec<f64>>,
    pub gfa_m2: f64,
    pub case: ConnectivityCase,
}

/// Per-network outcome: the central plant's supply system plus piping.
#[derive(Clone, Debug)]
pub struct NetworkResult {
    pub network_type: NetworkType,
    pub services: IndexMap<String, ServiceCost>,
    pub installed_components: IndexMap<Placement, IndexMap<String, Component>>,
    pub heat_rejection: IndexMap<String, Vec<f64>>,
    pub plant_nodes: Vec<String>,
    pub piping: PipingCost,
}

#[derive(Clone, Debug, Default)]
pub struct DistrictResults {
    pub requirements: IndexMap<String, ServiceRequirements>,
    pub buildings: IndexMap<String, BuildingResult>,
    pub networks: IndexMap<String, NetworkResult>,
    pub fallback_substitutions: usize,
}

/// Run the connectivity resolution, sizing, evaluation and cost extraction
/// for the whole building stock.
pub fn calculate_district(session: &mut Session) -> anyhow::Result<DistrictResults> {
    let config = session.config;
    let dh_members = membership(session.locator, config, NetworkType::DH)?;
    let dc_members = membership(session.locator, config, NetworkType::DC)?;
    let case = connectivity_case(config);

    let records = session.locator.total_demand()?;
    let mut requirements: IndexMap<String, ServiceRequirements> = Default::default();
    let mut buildings: IndexMap<String, Building> = Default::default();
    for record in &records {
        let in_dh = dh_members.contains(&record.name);
        let in_dc = dc_members.contains(&record.name);
        requirements.insert(
            record.name.clone(),
            determine_building_service_needs(case, in_dh, in_dc),
        );
        let state = if in_dh || in_dc {
            ConnectivityState::NamedNetwork(config.network_name.clone())
        } else {
            ConnectivityState::StandAlone
        };
        buildings.insert(
            record.name.clone(),
            Building::load(session.locator, record, state)?,
        );
    }

    let fallback_substitutions = apply_assembly_scale_fallback(session, &requirements)?;

    // heating and cooling are sized over two independently scoped domains so
    // a building without one demand never trips configuration errors for it
    let mut heating_systems: IndexMap<String, SupplySystem> = Default::default();
    let mut cooling_systems: IndexMap<String, SupplySystem> = Default::default();
    for (name, building) in buildings.iter_mut() {
        let reqs = requirements[name.as_str()];
        if reqs.needs_heating || reqs.needs_dhw {
            if let Some(system) =
                build_stand_alone_system(session, building, ServiceKind::Heating)?
            {
                heating_systems.insert(name.clone(), system);
            }
        }
        if reqs.needs_cooling {
            if let Some(system) =
                build_stand_alone_system(session, building, ServiceKind::Cooling)?
            {
                cooling_systems.insert(name.clone(), system);
            }
        }
    }

    let mut results = DistrictResults {
        requirements: requirements.clone(),
        ..Default::default()
    };

    for (name, building) in buildings.iter_mut() {
        let reqs = requirements[name.as_str()];
        let context =
            ExtractionContext::stand_alone(name, reqs.network_connected_services());
        let mut services: IndexMap<String, ServiceCost> = Default::default();
        let mut installed: IndexMap<Placement, IndexMap<String, Component>> = Default::default();
        let mut rejection: IndexMap<String, Vec<f64>> = Default::default();
        for systems in [&heating_systems, &cooling_systems] {
            if let Some(system) = systems.get(name) {
                services = merge_service_costs(&services, &extract_supply_costs(system, &context));
                installed = merge_installed(&installed, system.installed_components());
                merge_rejection(&mut rejection, system.heat_rejection());
            }
        }
        if let Some(system) = heating_systems.shift_remove(name) {
            building.stand_alone_supply_system = Some(system);
        }

        // post-merge DHW fallback: positive hot-water demand but nothing
        // attributed to a _ww service yet
        if building.has_demand(ServiceKind::HotWater)
            && !services.keys().any(|service| service.ends_with("_ww"))
        {
            if let Some(fallback) = synthesize_dhw_system(session, building, &context)? {
                services = merge_service_costs(&services, &fallback.services);
                installed = merge_installed(&installed, &fallback.installed_components);
                merge_rejection(&mut rejection, &fallback.heat_rejection);
            }
        }

        results.buildings.insert(
            name.clone(),
            BuildingResult {
                services,
                installed_components: installed,
                heat_rejection: rejection,
                gfa_m2: building.gfa_m2,
                case: reqs.case,
            },
        );
    }

    for network_type in &config.network_types {
        let members = match network_type {
            NetworkType::DH => &dh_members,
            NetworkType::DC => &dc_members,
        };
        if let Some((id, result)) =
            build_network_result(session, *network_type, members, &buildings)?
        {
            results.networks.insert(id, result);
        }
    }

    results.fallback_substitutions = fallback_substitutions;
    Ok(results)
}

/// Consumer-node buildings of the selected network of the given type, or an
/// empty set when the type is not selected or the layout artifact is absent.
fn membership(
    locator: &dyn InputLocator,
    config: &Config,
    network_type: NetworkType,
) -> anyhow::Result<IndexSet<String>> {
    if !config.network_selected() || !config.network_types.contains(&network_type) {
        return Ok(Default::default());
    }
    match locator.network_nodes(network_type, &config.network_name)? {
        Some(nodes) => Ok(nodes
            .into_iter()
            .filter(|node| node.node_type == NodeType::Consumer)
            .map(|node| node.building)
            .filter(|building| !building.is_empty() && building != "NONE")
            .collect()),
        None => {
            warn!(
                "⚠ No {network_type} network layout found for '{}'; treating every building as not connected.",
                config.network_name
            );
            Ok(Default::default())
        }
    }
}

/// Level-1 fallback: a building that provides a service itself but whose
/// assigned assembly is scale-tagged DISTRICT gets a building-scale code from
/// the configuration substituted in, persisted back to the assigned-supply
/// table before sizing.
fn apply_assembly_scale_fallback(
    session: &mut Session,
    requirements: &IndexMap<String, ServiceRequirements>,
) -> anyhow::Result<usize> {
    let mut substitutions = 0;
    for (building, reqs) in requirements {
        for service in ServiceKind::iter() {
            if !reqs.needs(service) {
                continue;
            }
            let Some(code) = session.assigned_code(building, service) else {
                continue;
            };
            let is_district = session
                .assemblies
                .get(&code)
                .is_some_and(|assembly| assembly.scale == Scale::District);
            if !is_district {
                continue;
            }
            let Some(substitute) =
                filter_supply_code_by_scale(session.config.supply_types(service), Scale::Building)
            else {
                warn!(
                    "⚠ Building {building} provides {service} itself but its assembly '{code}' is district-scale, and no building-scale substitute is configured."
                );
                continue;
            };
            if let Some(assignment) = session.assignments.get_mut(building) {
                assignment.set_assigned(service, substitute);
                substitutions += 1;
            }
        }
    }
    if substitutions > 0 {
        let assignments: Vec<SupplyAssignment> =
            session.assignments.values().cloned().collect();
        session
            .locator
            .write_building_supply_assignments(&assignments)
            .context("could not persist the fallback-substituted supply assignments")?;
        info!(
            "Substituted building-scale supply assemblies for {substitutions} stale district-scale assignment(s)."
        );
    }
    Ok(substitutions)
}

/// Level-2 fallback: an assigned code equal to the category sentinel (or
/// empty) switches the energy system from explicit-assembly mode to
/// category-fallback mode.
fn component_selection_for(
    session: &Session,
    building: &str,
    assigned_code: Option<&str>,
) -> anyhow::Result<(ComponentSelection, Option<SupplyAssembly>)> {
    let config = session.config;
    let fallback = ComponentSelection::CategoryFallback {
        cooling: config.cooling_components.clone(),
        heating: config.heating_components.clone(),
        heat_rejection: config.heat_rejection_components.clone(),
    };
    let Some(code) = assigned_code else {
        return Ok((fallback, None));
    };
    if code.is_empty() || code == "NONE" || code.eq_ignore_ascii_case(CATEGORY_FALLBACK_SENTINEL) {
        return Ok((fallback, None));
    }
    let assembly = session.assemblies.get(code).ok_or_else(|| {
        anyhow!(
            "Building {building} is assigned supply assembly '{code}' which does not exist in any assembly table."
        )
    })?;
    Ok((
        ComponentSelection::Explicit {
            primary: assembly.primary_components.clone(),
            secondary: assembly.secondary_components.clone(),
            tertiary: assembly.tertiary_components.clone(),
        },
        Some(assembly.clone()),
    ))
}

/// Size and evaluate one building-scale system for the heating or cooling
/// domain. Returns `None` when the building has no demand in that domain.
fn build_stand_alone_system(
    session: &Session,
    building: &mut Building,
    domain: ServiceKind,
) -> anyhow::Result<Option<SupplySystem>> {
    let Some(demand) = building.demand(domain).cloned() else {
        return Ok(None);
    };
    let assigned = session.assigned_code(&building.name, domain);
    let (selection, assembly) =
        component_selection_for(session, &building.name, assigned.as_deref())?;
    if let Some(assembly) = &assembly {
        building.set_composition_from_assembly(assembly);
    }
    let mut structure = SupplySystemStructure::new(
        building.name.clone(),
        demand.isolate_peak(),
        building.available_potentials.clone(),
        selection,
    );
    structure
        .build(&session.database, &session.registry)
        .with_context(|| format!("sizing the {domain} system of building {}", building.name))?;
    let mut system = SupplySystem::new(structure, demand);
    system.evaluate(&session.database, &session.registry)?;
    Ok(Some(system))
}

struct DhwFallback {
    services: IndexMap<String, ServiceCost>,
    installed_components: IndexMap<Placement, IndexMap<String, Component>>,
    heat_rejection: IndexMap<String, Vec<f64>>,
}

/// Level-3 fallback: synthesize a minimal single-boiler DHW system from the
/// feedstock of the building's hot-water assembly, sized to the DHW peak.
///
/// Yielding `None` here is a valid terminal state - a building legitimately
/// without a DHW system - not an error.
fn synthesize_dhw_system(
    session: &Session,
    building: &Building,
    context: &ExtractionContext,
) -> anyhow::Result<Option<DhwFallback>> {
    let Some(demand) = building.demand(ServiceKind::HotWater).cloned() else {
        return Ok(None);
    };
    let Some(code) = session.assigned_code(&building.name, ServiceKind::HotWater) else {
        return Ok(None);
    };
    let Some(feedstock) = session
        .assemblies
        .get(&code)
        .and_then(|assembly| assembly.feedstock.clone())
    else {
        return Ok(None);
    };
    let Some((_, _, boiler_code)) = FEEDSTOCK_BOILERS
        .iter()
        .find(|(name, _, _)| *name == feedstock)
    else {
        return Ok(None);
    };
    if !session.database.has_code(boiler_code) {
        return Ok(None);
    }

    let mut structure = SupplySystemStructure::new(
        building.name.clone(),
        demand.isolate_peak(),
        // potentials on the heating carrier are netted by the space-heating
        // system, never a second time here
        Default::default(),
        ComponentSelection::Explicit {
            primary: vec![boiler_code.to_string()],
            secondary: vec![],
            tertiary: vec![],
        },
    );
    structure.build(&session.database, &session.registry)?;
    let mut system = SupplySystem::new(structure, demand);
    system.evaluate(&session.database, &session.registry)?;

    let services =
        rename_heating_services_to_hot_water(extract_supply_costs(&system, context));
    Ok(Some(DhwFallback {
        services,
        installed_components: system.installed_components().clone(),
        heat_rejection: system.heat_rejection().clone(),
    }))
}

/// Aggregate the demand of every connected building (and their local
/// potentials, summed per carrier), size and evaluate the network's central
/// system, and attach plant nodes and piping cost.
fn build_network_result(
    session: &mut Session,
    network_type: NetworkType,
    members: &IndexSet<String>,
    buildings: &IndexMap<String, Building>,
) -> anyhow::Result<Option<(String, NetworkResult)>> {
    let config = session.config;
    let network_id = format!("{network_type}_{}", config.network_name);

    let mut total_demand: Option<EnergyFlow> = None;
    for member in members {
        let Some(building) = buildings.get(member) else {
            continue;
        };
        let demand = match network_type {
            NetworkType::DH => building.combined_heating_demand()?,
            NetworkType::DC => building.demand(ServiceKind::Cooling).cloned(),
        };
        let Some(demand) = demand else { continue };
        total_demand = Some(match total_demand {
            None => demand,
            Some(total) => (&total + &demand)?,
        });
    }
    let Some(total_demand) = total_demand else {
        warn!(
            "⚠ Network {network_id} has no connected demand; skipping its supply system."
        );
        return Ok(None);
    };

    let service = match network_type {
        NetworkType::DH => ServiceKind::Heating,
        NetworkType::DC => ServiceKind::Cooling,
    };
    let district_code = filter_supply_code_by_scale(config.supply_types(service), Scale::District);
    let (selection, assembly) =
        component_selection_for(session, &network_id, district_code.as_deref())?;
    if let Some(assembly) = &assembly {
        session
            .assembly_networks
            .entry(assembly.code.clone())
            .or_insert_with(|| network_id.clone());
    }

    let mut structure = SupplySystemStructure::new(
        network_id.clone(),
        total_demand.isolate_peak(),
        aggregate_potentials(
            members
                .iter()
                .filter_map(|member| buildings.get(member))
                .map(|building| &building.available_potentials),
        ),
        selection,
    );
    structure
        .build(&session.database, &session.registry)
        .with_context(|| format!("sizing the central plant of network {network_id}"))?;
    let mut system = SupplySystem::new(structure, total_demand);
    system.evaluate(&session.database, &session.registry)?;

    let plant_nodes = session
        .locator
        .network_nodes(network_type, &config.network_name)?
        .unwrap_or_default()
        .into_iter()
        .filter(|node| node.node_type == NodeType::Plant)
        .map(|node| node.name)
        .collect();

    let piping = match (
        session
            .locator
            .network_edges(network_type, &config.network_name)?,
        session.locator.pipe_catalog()?,
    ) {
        (Some(edges), Some(catalog)) => {
            calc_network_piping_cost(&edges, &catalog, config.network_lifetime_yrs)
        }
        _ => {
            warn!(
                "⚠ Missing edge list or pipe catalog for network {network_id}; piping cost reported as zero."
            );
            PipingCost::default()
        }
    };

    let services = extract_supply_costs(&system, &ExtractionContext::network(network_type));
    Ok(Some((
        network_id,
        NetworkResult {
            network_type,
            services,
            installed_components: system.installed_components().clone(),
            heat_rejection: system.heat_rejection().clone(),
            plant_nodes,
            piping,
        },
    )))
}

/// Sum local-potential maps per energy-carrier code, adding the profiles of
/// overlapping carriers.
pub fn aggregate_potentials<'a>(
    potentials: impl Iterator<Item = &'a IndexMap<String, EnergyFlow>>,
) -> IndexMap<String, EnergyFlow> {
    let mut aggregated: IndexMap<String, EnergyFlow> = Default::default();
    for map in potentials {
        for (carrier, flow) in map {
            match aggregated.get(carrier) {
                None => {
                    aggregated.insert(carrier.clone(), flow.clone());
                }
                Some(existing) => {
                    if let Ok(sum) = existing + flow {
                        aggregated.insert(carrier.clone(), sum);
                    }
                }
            }
        }
    }
    aggregated
}

/// Union two installed-component maps into a new one, keyed by placement.
/// Heating and cooling systems install distinct codes, so a duplicate code
/// keeps the left-hand instance.
pub fn merge_installed(
    left: &IndexMap<Placement, IndexMap<String, Component>>,
    right: &IndexMap<Placement, IndexMap<String, Component>>,
) -> IndexMap<Placement, IndexMap<String, Component>> {
    let mut merged = left.clone();
    for (placement, components) in right {
        let slot = merged.entry(*placement).or_default();
        for (code, component) in components {
            slot.entry(code.clone()).or_insert_with(|| component.clone());
        }
    }
    merged
}

fn merge_rejection(
    accumulator: &mut IndexMap<String, Vec<f64>>,
    addition: &IndexMap<String, Vec<f64>>,
) {
    for (carrier, series) in addition {
        let entry = accumulator
            .entry(carrier.clone())
            .or_insert_with(|| vec![0.; series.len()]);
        if entry.len() < series.len() {
            entry.resize(series.len(), 0.);
        }
        for (slot, value) in entry.iter_mut().zip(series.iter()) {
            *slot += value;
        }
    }
}

/// Multiple plant nodes in one network split the total heat rejection
/// equally: each of `plant_count` plants reports `1/N` of every value.
pub fn split_among_plants(series: &[f64], plant_count: usize) -> Vec<f64> {
    if plant_count <= 1 {
        return series.to_vec();
    }
    series
        .iter()
        .map(|value| value / plant_count as f64)
        .collect()
}
