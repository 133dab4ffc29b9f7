pub mod core;
pub mod errors;
pub mod input;
pub mod output;

use crate::core::connectivity::{
    calculate_district, connectivity_case, split_among_plants, ConnectivityCase, DistrictResults,
    Session,
};
use crate::core::units::KILOWATTS_PER_MEGAWATT;
use crate::errors::{CapacityInsufficiencyError, DistrictError};
use crate::input::{Config, InputLocator, NO_NETWORK_NAME};
use crate::output::Output;
use csv::WriterBuilder;
use itertools::Itertools;
use tracing::info;

pub use crate::core::connectivity::{BuildingResult, NetworkResult};

/// Resolve connectivity, size and evaluate every supply system of the
/// building stock described by the locator, and write the result tables to
/// the output.
pub fn run_district(
    locator: &dyn InputLocator,
    config: &Config,
    output: impl Output,
) -> Result<DistrictResults, DistrictError> {
    if config.network_name != NO_NETWORK_NAME
        && !config.network_name.is_empty()
        && config.network_types.is_empty()
    {
        return Err(DistrictError::InvalidConfiguration(format!(
            "network '{}' is selected but no network type (DH/DC) is; select at least one type or set the network name to '{NO_NETWORK_NAME}'",
            config.network_name
        )));
    }

    let mut session = Session::initialize(locator, config)?;
    let results = calculate_district(&mut session).map_err(|error| {
        match error.downcast::<CapacityInsufficiencyError>() {
            Ok(insufficiency) => DistrictError::CapacityInsufficiency(insufficiency),
            Err(error) => DistrictError::FailureInCalculation(error),
        }
    })?;
    info!(
        "Calculated {} building(s) and {} network system(s).",
        results.buildings.len(),
        results.networks.len()
    );

    if !output.is_noop() {
        write_service_cost_table(&output, &results)?;
        write_heat_rejection_summary(&output, config, &results)?;
        write_heat_rejection_hourly(&output, &results)?;
        write_component_table(&output, &results)?;
        write_piping_table(&output, &results)?;
    }
    Ok(results)
}

fn write_service_cost_table(
    output: &impl Output,
    results: &DistrictResults,
) -> anyhow::Result<()> {
    let mut writer = WriterBuilder::new().from_writer(output.writer_for_location_key("service_costs")?);
    writer.write_record([
        "name",
        "service",
        "scale",
        "capex_total_usd",
        "capex_a_usd",
        "opex_fixed_usd",
        "opex_a_fixed_usd",
        "opex_var_usd",
        "opex_a_var_usd",
        "opex_usd",
        "opex_a_usd",
        "tac_usd",
        "components",
        "energy_costs",
    ])?;
    let owners = results
        .buildings
        .iter()
        .map(|(name, result)| (name, &result.services))
        .chain(
            results
                .networks
                .iter()
                .map(|(name, result)| (name, &result.services)),
        );
    for (name, services) in owners {
        for (service, cost) in services {
            let components = cost
                .components
                .iter()
                .map(|share| {
                    format!(
                        "{} ({}, {} kW, {} USD)",
                        share.code, share.placement, share.capacity_kw, share.capex_usd
                    )
                })
                .join("; ");
            let energy_costs = cost
                .energy_costs
                .iter()
                .map(|share| format!("{} ({} USD)", share.carrier, share.cost_usd))
                .join("; ");
            writer.write_record([
                name.clone(),
                service.clone(),
                cost.scale.to_string(),
                cost.capex_total_usd.to_string(),
                cost.capex_a_usd.to_string(),
                cost.opex_fixed_usd.to_string(),
                cost.opex_a_fixed_usd.to_string(),
                cost.opex_var_usd.to_string(),
                cost.opex_a_var_usd.to_string(),
                cost.opex_usd.to_string(),
                cost.opex_a_usd.to_string(),
                cost.tac_usd.to_string(),
                components,
                energy_costs,
            ])?;
        }
    }
    writer.flush()?;
    Ok(())
}

fn write_heat_rejection_summary(
    output: &impl Output,
    config: &Config,
    results: &DistrictResults,
) -> anyhow::Result<()> {
    let mut writer =
        WriterBuilder::new().from_writer(output.writer_for_location_key("heat_rejection")?);
    writer.write_record([
        "name",
        "carrier",
        "scale",
        "connectivity_case",
        "case_description",
        "gfa_m2",
        "annual_mwh",
        "peak_kw",
        "peak_at",
    ])?;
    for (name, building) in &results.buildings {
        for (carrier, series) in &building.heat_rejection {
            writer.write_record(summary_row(
                name,
                carrier,
                "BUILDING",
                building.case,
                &building.gfa_m2.to_string(),
                series,
            ))?;
        }
    }
    // a network with several plant nodes reports one row per plant, each
    // carrying an equal share of the network total
    let case = connectivity_case(config);
    for (name, network) in &results.networks {
        for (carrier, series) in &network.heat_rejection {
            if network.plant_nodes.len() > 1 {
                let share = split_among_plants(series, network.plant_nodes.len());
                for plant in &network.plant_nodes {
                    writer.write_record(summary_row(
                        &format!("{name} {plant}"),
                        carrier,
                        "DISTRICT",
                        case,
                        "",
                        &share,
                    ))?;
                }
            } else {
                writer.write_record(summary_row(name, carrier, "DISTRICT", case, "", series))?;
            }
        }
    }
    writer.flush()?;
    Ok(())
}

fn summary_row(
    name: &str,
    carrier: &str,
    scale: &str,
    case: ConnectivityCase,
    gfa: &str,
    series: &[f64],
) -> Vec<String> {
    let annual_mwh = series.iter().sum::<f64>() / KILOWATTS_PER_MEGAWATT as f64;
    let peak_kw = series.iter().copied().fold(0., f64::max);
    vec![
        name.to_string(),
        carrier.to_string(),
        scale.to_string(),
        case.number().to_string(),
        case.description().to_string(),
        gfa.to_string(),
        annual_mwh.to_string(),
        peak_kw.to_string(),
        crate::core::energy_flow::peak_timestamp(series).unwrap_or_default(),
    ]
}

/// Wide hourly table: one column per rejecting owner and carrier. A network
/// with several plant nodes reports one column per plant, each carrying an
/// equal share of the network total.
fn write_heat_rejection_hourly(
    output: &impl Output,
    results: &DistrictResults,
) -> anyhow::Result<()> {
    let mut columns: Vec<(String, Vec<f64>)> = vec![];
    for (name, building) in &results.buildings {
        for (carrier, series) in &building.heat_rejection {
            columns.push((format!("{name} {carrier}"), series.clone()));
        }
    }
    for (name, network) in &results.networks {
        for (carrier, series) in &network.heat_rejection {
            if network.plant_nodes.len() > 1 {
                let share = split_among_plants(series, network.plant_nodes.len());
                for plant in &network.plant_nodes {
                    columns.push((format!("{name} {plant} {carrier}"), share.clone()));
                }
            } else {
                columns.push((format!("{name} {carrier}"), series.clone()));
            }
        }
    }

    let mut writer = WriterBuilder::new()
        .flexible(true)
        .from_writer(output.writer_for_location_key("heat_rejection_hourly")?);
    let mut headings = vec!["hour".to_string()];
    headings.extend(columns.iter().map(|(heading, _)| heading.clone()));
    writer.write_record(&headings)?;

    let hours = columns
        .iter()
        .map(|(_, series)| series.len())
        .max()
        .unwrap_or(0);
    for hour in 0..hours {
        let mut row = vec![hour.to_string()];
        row.extend(
            columns
                .iter()
                .map(|(_, series)| series.get(hour).copied().unwrap_or(0.).to_string()),
        );
        writer.write_record(&row)?;
    }
    writer.flush()?;
    Ok(())
}

fn write_component_table(output: &impl Output, results: &DistrictResults) -> anyhow::Result<()> {
    let mut writer =
        WriterBuilder::new().from_writer(output.writer_for_location_key("components")?);
    writer.write_record([
        "name",
        "placement",
        "code",
        "capacity_kw",
        "capex_usd",
        "capex_a_usd",
        "opex_fixed_a_usd",
    ])?;
    let owners = results
        .buildings
        .iter()
        .map(|(name, result)| (name, &result.installed_components, &result.heat_rejection))
        .chain(results.networks.iter().map(|(name, result)| {
            (name, &result.installed_components, &result.heat_rejection)
        }));
    for (name, installed, rejection) in owners {
        for (placement, components) in installed {
            for component in components.values() {
                writer.write_record([
                    name.clone(),
                    placement.to_string(),
                    component.code.clone(),
                    component.capacity_kw.to_string(),
                    component.inv_cost_usd.to_string(),
                    component.inv_cost_a_usd.to_string(),
                    component.opex_fixed_a_usd.to_string(),
                ])?;
            }
        }
        // one row per non-trivial rejection carrier, peak in the capacity slot
        for (carrier, series) in rejection {
            let peak_kw = series.iter().copied().fold(0., f64::max);
            if peak_kw <= 0. {
                continue;
            }
            writer.write_record([
                name.clone(),
                "heat_rejection".to_string(),
                carrier.clone(),
                peak_kw.to_string(),
                String::new(),
                String::new(),
                String::new(),
            ])?;
        }
    }
    writer.flush()?;
    Ok(())
}

fn write_piping_table(output: &impl Output, results: &DistrictResults) -> anyhow::Result<()> {
    let mut writer = WriterBuilder::new().from_writer(output.writer_for_location_key("piping")?);
    writer.write_record(["network", "length_m", "capex_total_usd", "capex_a_usd"])?;
    for (name, network) in &results.networks {
        writer.write_record([
            name.clone(),
            network.piping.length_m.to_string(),
            network.piping.capex_total_usd.to_string(),
            network.piping.capex_a_usd.to_string(),
        ])?;
    }
    writer.flush()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::component::test_support::{prices, tiers_map};
    use crate::input::{
        BuildingDemand, MemoryLocator, NetworkNode, NetworkType, NodeType, Scale, SupplyAssembly,
        SupplyAssignment, TotalDemandRecord,
    };
    use crate::output::SinkOutput;
    use approx::assert_relative_eq;
    use indexmap::IndexMap;
    use parking_lot::RwLock;
    use pretty_assertions::assert_eq;
    use rstest::*;
    use std::io;
    use std::sync::Arc;

    /// Output keeping every written table in memory, for assertions on the
    /// rendered CSV.
    #[derive(Clone, Debug, Default)]
    struct CapturingOutput {
        tables: Arc<RwLock<IndexMap<String, Vec<u8>>>>,
    }

    impl CapturingOutput {
        fn table(&self, key: &str) -> String {
            String::from_utf8(self.tables.read().get(key).cloned().unwrap_or_default()).unwrap()
        }
    }

    struct TableWriter {
        tables: Arc<RwLock<IndexMap<String, Vec<u8>>>>,
        key: String,
    }

    impl io::Write for TableWriter {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.tables
                .write()
                .entry(self.key.clone())
                .or_default()
                .extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    impl Output for CapturingOutput {
        fn writer_for_location_key(&self, location_key: &str) -> anyhow::Result<impl io::Write> {
            Ok(TableWriter {
                tables: self.tables.clone(),
                key: location_key.to_string(),
            })
        }
    }

    fn locator_with_one_heated_building() -> MemoryLocator {
        let mut locator = MemoryLocator {
            tiers: tiers_map(),
            prices: prices(),
            ..Default::default()
        };
        locator.assemblies.insert(
            "SUPPLY_HEATING",
            vec![SupplyAssembly {
                code: "SUPPLY_HEATING_AS1".to_string(),
                scale: Scale::Building,
                primary_components: vec!["BO1".to_string()],
                secondary_components: vec![],
                tertiary_components: vec![],
                feedstock: Some("NG".to_string()),
            }],
        );
        *locator.assignments.write() = vec![SupplyAssignment {
            name: "B1001".to_string(),
            type_hs: "SUPPLY_HEATING_AS1".to_string(),
            type_cs: String::new(),
            type_dhw: String::new(),
        }];
        locator.totals = vec![TotalDemandRecord {
            name: "B1001".to_string(),
            gfa_m2: 900.,
            qh_mwh_yr: 12.,
            qc_mwh_yr: 0.,
            qww_mwh_yr: 0.,
        }];
        locator.demands.insert(
            "B1001".to_string(),
            BuildingDemand {
                heating_kwh: Some(vec![40., 90., 60.]),
                cooling_kwh: None,
                hot_water_kwh: None,
            },
        );
        locator
    }

    #[rstest]
    fn test_network_name_without_types_is_rejected() {
        let locator = MemoryLocator::default();
        let config = Config::from_json(r#"{"network_name": "N1"}"#.as_bytes()).unwrap();
        let error = run_district(&locator, &config, SinkOutput).unwrap_err();
        assert!(matches!(error, DistrictError::InvalidConfiguration(_)));
    }

    #[rstest]
    fn test_run_district_with_sink_output() {
        let locator = locator_with_one_heated_building();
        let config = Config::from_json("{}".as_bytes()).unwrap();
        let results = run_district(&locator, &config, SinkOutput).unwrap();
        assert_eq!(results.buildings.len(), 1);
        assert!(results.networks.is_empty());
        assert!(results.buildings["B1001"].services.contains_key("NG_hs"));
    }

    fn dc_locator_with_two_plants() -> MemoryLocator {
        let mut locator = locator_with_one_heated_building();
        locator.assemblies.insert(
            "SUPPLY_COOLING",
            vec![SupplyAssembly {
                code: "SUPPLY_COOLING_AS7".to_string(),
                scale: Scale::District,
                primary_components: vec!["CH2".to_string()],
                secondary_components: vec![],
                tertiary_components: vec!["CT1".to_string()],
                feedstock: None,
            }],
        );
        locator.demands.get_mut("B1001").unwrap().cooling_kwh = Some(vec![30., 60., 40.]);
        locator.nodes.insert(
            (NetworkType::DC, "N1".to_string()),
            vec![
                NetworkNode {
                    name: "NODE1".to_string(),
                    node_type: NodeType::Consumer,
                    building: "B1001".to_string(),
                },
                NetworkNode {
                    name: "PLANT1".to_string(),
                    node_type: NodeType::Plant,
                    building: String::new(),
                },
                NetworkNode {
                    name: "PLANT2".to_string(),
                    node_type: NodeType::Plant,
                    building: String::new(),
                },
            ],
        );
        locator
    }

    fn dc_config() -> Config {
        Config::from_json(
            r#"{
                "network_name": "N1",
                "network_types": ["DC"],
                "supply_type_cs": ["SUPPLY_COOLING_AS7 (district)"],
                "supply_type_hs": ["SUPPLY_HEATING_AS1 (building)"]
            }"#
            .as_bytes(),
        )
        .unwrap()
    }

    #[rstest]
    fn test_heat_rejection_summary_splits_among_plant_nodes() {
        let locator = dc_locator_with_two_plants();
        let capture = CapturingOutput::default();
        let results = run_district(&locator, &dc_config(), capture.clone()).unwrap();

        let rejection = &results.networks["DC_N1"].heat_rejection["T30W"];
        let network_annual_mwh = rejection.iter().sum::<f64>() / KILOWATTS_PER_MEGAWATT as f64;
        let network_peak_kw = rejection.iter().copied().fold(0., f64::max);

        let summary = capture.table("heat_rejection");
        let plant_rows: Vec<&str> = summary
            .lines()
            .filter(|line| line.starts_with("DC_N1 PLANT") && line.contains(",T30W,"))
            .collect();
        assert_eq!(plant_rows.len(), 2);
        for row in plant_rows {
            let fields: Vec<&str> = row.split(',').collect();
            let annual_mwh: f64 = fields[6].parse().unwrap();
            let peak_kw: f64 = fields[7].parse().unwrap();
            assert_relative_eq!(annual_mwh, network_annual_mwh / 2., max_relative = 1e-9);
            assert_relative_eq!(peak_kw, network_peak_kw / 2., max_relative = 1e-9);
        }
        // the unsplit network total must not appear as its own row
        assert!(!summary.lines().any(|line| line.starts_with("DC_N1,")));
    }

    #[rstest]
    fn test_service_cost_table_carries_full_cost_breakdown() {
        let locator = locator_with_one_heated_building();
        let config = Config::from_json("{}".as_bytes()).unwrap();
        let capture = CapturingOutput::default();
        run_district(&locator, &config, capture.clone()).unwrap();

        let table = capture.table("service_costs");
        let mut lines = table.lines();
        assert_eq!(
            lines.next().unwrap(),
            "name,service,scale,capex_total_usd,capex_a_usd,opex_fixed_usd,opex_a_fixed_usd,\
             opex_var_usd,opex_a_var_usd,opex_usd,opex_a_usd,tac_usd,components,energy_costs"
        );
        let row = lines
            .find(|line| line.starts_with("B1001,NG_hs,"))
            .unwrap();
        // component and energy-carrier shares are carried inline
        assert!(row.contains("BO1 (primary"));
        assert!(row.contains("NG ("));
    }

    #[rstest]
    fn test_structurally_unmeetable_demand_surfaces_as_capacity_error() {
        let mut locator = locator_with_one_heated_building();
        // a cooling tower as the only cooling component can never serve the
        // chilled-water demand itself
        locator.assemblies.insert(
            "SUPPLY_COOLING",
            vec![SupplyAssembly {
                code: "SUPPLY_COOLING_BAD".to_string(),
                scale: Scale::Building,
                primary_components: vec!["CT1".to_string()],
                secondary_components: vec![],
                tertiary_components: vec![],
                feedstock: None,
            }],
        );
        locator.assignments.write()[0].type_cs = "SUPPLY_COOLING_BAD".to_string();
        locator.demands.get_mut("B1001").unwrap().cooling_kwh = Some(vec![10., 25., 15.]);
        let config = Config::from_json("{}".as_bytes()).unwrap();
        let error = run_district(&locator, &config, SinkOutput).unwrap_err();
        match error {
            DistrictError::CapacityInsufficiency(insufficiency) => {
                assert_eq!(insufficiency.target, "B1001");
                assert_eq!(insufficiency.installed[0].code, "CT1");
            }
            other => panic!("expected a capacity insufficiency error, got: {other}"),
        }
    }
}
