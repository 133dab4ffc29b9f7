use crate::core::component::{CapacityTier, ComponentCategory};
use anyhow::{anyhow, Context};
use indexmap::IndexMap;
use parking_lot::RwLock;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use strum_macros::{Display, EnumIter, EnumString};

/// Sentinel a per-service supply-type setting may carry instead of an
/// assembly code, meaning the energy system should be assembled from the
/// selected component categories instead of a named assembly.
pub const CATEGORY_FALLBACK_SENTINEL: &str = "use components below";

/// Network-name setting meaning no network is selected.
pub const NO_NETWORK_NAME: &str = "(none)";

#[derive(Clone, Copy, Debug, Deserialize, Display, EnumString, Eq, Hash, PartialEq, Serialize)]
pub enum NetworkType {
    DH,
    DC,
}

#[derive(Clone, Copy, Debug, Deserialize, Display, EnumString, Eq, Hash, PartialEq, Serialize)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE", ascii_case_insensitive)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Scale {
    Building,
    District,
}

/// The three end-use services an energy system can serve.
#[derive(Clone, Copy, Debug, Display, EnumIter, Eq, Hash, PartialEq)]
pub enum ServiceKind {
    Heating,
    Cooling,
    HotWater,
}

impl ServiceKind {
    /// Suffix used in derived service names, e.g. `GRID_hs`.
    pub fn suffix(&self) -> &'static str {
        match self {
            ServiceKind::Heating => "_hs",
            ServiceKind::Cooling => "_cs",
            ServiceKind::HotWater => "_ww",
        }
    }

    /// Name of the assembly table the service is configured from.
    pub fn assembly_table(&self) -> &'static str {
        match self {
            ServiceKind::Heating => "SUPPLY_HEATING",
            ServiceKind::Cooling => "SUPPLY_COOLING",
            ServiceKind::HotWater => "SUPPLY_HOTWATER",
        }
    }
}

/// Strip a trailing scale label (`" (building)"` / `" (district)"`) off a
/// supply-type code, returning the bare code and the label if one was found.
pub fn strip_scale_label(value: &str) -> (&str, Option<Scale>) {
    for (label, scale) in [
        (" (building)", Scale::Building),
        (" (district)", Scale::District),
    ] {
        if let Some(code) = value.strip_suffix(label) {
            return (code.trim_end(), Some(scale));
        }
    }
    (value.trim_end(), None)
}

/// Pick the supply code matching the requested scale out of a (possibly
/// multi-select) supply-type setting.
///
/// A single value is returned unchanged after label stripping. For a
/// multi-select list the first code whose scale label matches wins, falling
/// back to the first code when no label matches.
pub fn filter_supply_code_by_scale(values: &[String], scale: Scale) -> Option<String> {
    match values {
        [] => None,
        [single] => Some(strip_scale_label(single).0.to_string()),
        many => many
            .iter()
            .map(|value| strip_scale_label(value))
            .find(|(_, label)| *label == Some(scale))
            .or_else(|| many.first().map(|value| strip_scale_label(value)))
            .map(|(code, _)| code.to_string()),
    }
}

/// The user-facing configuration object driving a run.
#[derive(Clone, Debug, Deserialize)]
pub struct Config {
    #[serde(default = "default_network_name")]
    pub network_name: String,
    #[serde(default)]
    pub network_types: Vec<NetworkType>,
    #[serde(default)]
    pub supply_type_hs: Vec<String>,
    #[serde(default)]
    pub supply_type_cs: Vec<String>,
    #[serde(default)]
    pub supply_type_dhw: Vec<String>,
    #[serde(default)]
    pub cooling_components: Vec<ComponentCategory>,
    #[serde(default)]
    pub heating_components: Vec<ComponentCategory>,
    #[serde(default)]
    pub heat_rejection_components: Vec<ComponentCategory>,
    #[serde(default = "default_network_lifetime")]
    pub network_lifetime_yrs: f64,
}

fn default_network_name() -> String {
    NO_NETWORK_NAME.to_string()
}

fn default_network_lifetime() -> f64 {
    20.
}

impl Config {
    pub fn from_json(json: impl std::io::Read) -> anyhow::Result<Self> {
        serde_json::from_reader(json).context("could not parse the configuration file")
    }

    pub fn network_selected(&self) -> bool {
        self.network_name != NO_NETWORK_NAME
            && !self.network_name.is_empty()
            && !self.network_types.is_empty()
    }

    pub fn supply_types(&self, service: ServiceKind) -> &[String] {
        match service {
            ServiceKind::Heating => &self.supply_type_hs,
            ServiceKind::Cooling => &self.supply_type_cs,
            ServiceKind::HotWater => &self.supply_type_dhw,
        }
    }
}

/// One record of a supply-assembly table (`SUPPLY_HEATING` etc.): a named,
/// scale-tagged composition of component codes per placement.
#[derive(Clone, Debug, Deserialize)]
#[serde(try_from = "SupplyAssemblyRow")]
pub struct SupplyAssembly {
    pub code: String,
    pub scale: Scale,
    pub primary_components: Vec<String>,
    pub secondary_components: Vec<String>,
    pub tertiary_components: Vec<String>,
    pub feedstock: Option<String>,
}

#[derive(Debug, Deserialize)]
struct SupplyAssemblyRow {
    code: String,
    scale: String,
    #[serde(default)]
    primary_components: String,
    #[serde(default)]
    secondary_components: String,
    #[serde(default)]
    tertiary_components: String,
    #[serde(default)]
    feedstock: String,
}

fn parse_component_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|code| !code.is_empty() && *code != "NONE")
        .map(str::to_string)
        .collect()
}

impl TryFrom<SupplyAssemblyRow> for SupplyAssembly {
    type Error = anyhow::Error;

    fn try_from(row: SupplyAssemblyRow) -> anyhow::Result<Self> {
        let scale = row
            .scale
            .to_uppercase()
            .parse()
            .map_err(|_| anyhow!("unknown scale '{}' in assembly '{}'", row.scale, row.code))?;
        Ok(Self {
            code: row.code,
            scale,
            primary_components: parse_component_list(&row.primary_components),
            secondary_components: parse_component_list(&row.secondary_components),
            tertiary_components: parse_component_list(&row.tertiary_components),
            feedstock: match row.feedstock.trim() {
                "" | "NONE" => None,
                feedstock => Some(feedstock.to_string()),
            },
        })
    }
}

/// The assembly codes assigned to one building for each service, as persisted
/// in the building-assigned-supply table.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct SupplyAssignment {
    pub name: String,
    pub type_hs: String,
    pub type_cs: String,
    pub type_dhw: String,
}

impl SupplyAssignment {
    pub fn assigned(&self, service: ServiceKind) -> &str {
        match service {
            ServiceKind::Heating => &self.type_hs,
            ServiceKind::Cooling => &self.type_cs,
            ServiceKind::HotWater => &self.type_dhw,
        }
    }

    pub fn set_assigned(&mut self, service: ServiceKind, code: String) {
        match service {
            ServiceKind::Heating => self.type_hs = code,
            ServiceKind::Cooling => self.type_cs = code,
            ServiceKind::HotWater => self.type_dhw = code,
        }
    }
}

#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NodeType {
    Consumer,
    Plant,
    #[serde(other)]
    None,
}

/// One node of a network-layout file. Plant nodes carry no building.
#[derive(Clone, Debug, Deserialize)]
pub struct NetworkNode {
    pub name: String,
    #[serde(rename = "type")]
    pub node_type: NodeType,
    #[serde(default)]
    pub building: String,
}

#[derive(Clone, Debug, Deserialize)]
pub struct NetworkEdge {
    pub name: String,
    pub length_m: f64,
    pub diameter_mm: f64,
}

#[derive(Clone, Debug, Deserialize)]
pub struct PipeCatalogRow {
    pub diameter_mm: f64,
    pub cost_usd_per_m: f64,
}

/// Annual totals per building, used for the building list, the DHW-presence
/// check and the GFA column of the heat-rejection summary.
#[derive(Clone, Debug, Deserialize)]
pub struct TotalDemandRecord {
    pub name: String,
    pub gfa_m2: f64,
    #[serde(default)]
    pub qh_mwh_yr: f64,
    #[serde(default)]
    pub qc_mwh_yr: f64,
    #[serde(default)]
    pub qww_mwh_yr: f64,
}

#[derive(Clone, Debug, Deserialize)]
struct FeedstockPriceRow {
    carrier: String,
    price_usd_per_kwh: f64,
}

/// Hourly demand profiles of one building, in kWh. A service whose column is
/// absent from the demand file is `None`, which downstream code treats as "no
/// such demand".
#[derive(Clone, Debug, Default)]
pub struct BuildingDemand {
    pub heating_kwh: Option<Vec<f64>>,
    pub cooling_kwh: Option<Vec<f64>>,
    pub hot_water_kwh: Option<Vec<f64>>,
}

impl BuildingDemand {
    pub fn for_service(&self, service: ServiceKind) -> Option<&Vec<f64>> {
        match service {
            ServiceKind::Heating => self.heating_kwh.as_ref(),
            ServiceKind::Cooling => self.cooling_kwh.as_ref(),
            ServiceKind::HotWater => self.hot_water_kwh.as_ref(),
        }
    }
}

/// Per-category lookup interface onto the scenario's input artifacts.
///
/// Geometry never passes through this interface; network layouts arrive
/// pre-flattened as node/edge lists. Optional artifacts (layouts, pipe
/// catalog, demand files) return `Ok(None)` when absent so callers can skip
/// the affected computation with a warning instead of aborting.
pub trait InputLocator {
    fn supply_assemblies(&self, service: ServiceKind) -> anyhow::Result<Vec<SupplyAssembly>>;
    fn technology_tiers(&self, category: ComponentCategory) -> anyhow::Result<Vec<CapacityTier>>;
    fn feedstock_prices(&self) -> anyhow::Result<IndexMap<String, f64>>;
    fn building_supply_assignments(&self) -> anyhow::Result<Vec<SupplyAssignment>>;
    /// Persist the (possibly fallback-substituted) assignments back to the
    /// building-assigned-supply table.
    fn write_building_supply_assignments(
        &self,
        assignments: &[SupplyAssignment],
    ) -> anyhow::Result<()>;
    fn total_demand(&self) -> anyhow::Result<Vec<TotalDemandRecord>>;
    fn building_demand(&self, building: &str) -> anyhow::Result<Option<BuildingDemand>>;
    /// Hourly local supply potentials of one building in kWh (e.g. solar
    /// collectors), keyed by energy-carrier code. Buildings without a
    /// potentials artifact yield an empty map.
    fn building_potentials(&self, building: &str) -> anyhow::Result<IndexMap<String, Vec<f64>>>;
    fn network_nodes(
        &self,
        network_type: NetworkType,
        network_name: &str,
    ) -> anyhow::Result<Option<Vec<NetworkNode>>>;
    fn network_edges(
        &self,
        network_type: NetworkType,
        network_name: &str,
    ) -> anyhow::Result<Option<Vec<NetworkEdge>>>;
    fn pipe_catalog(&self) -> anyhow::Result<Option<Vec<PipeCatalogRow>>>;
}

/// Locator over a scenario directory of CSV tables.
#[derive(Debug)]
pub struct FileLocator {
    scenario: PathBuf,
}

impl FileLocator {
    pub fn new(scenario: impl Into<PathBuf>) -> Self {
        Self {
            scenario: scenario.into(),
        }
    }

    fn network_dir(&self, network_type: NetworkType, network_name: &str) -> PathBuf {
        self.scenario
            .join("networks")
            .join(network_type.to_string())
            .join(network_name)
    }
}

fn read_csv<T: DeserializeOwned>(path: &Path) -> anyhow::Result<Vec<T>> {
    let file =
        File::open(path).with_context(|| format!("could not open {}", path.display()))?;
    let mut reader = csv::Reader::from_reader(BufReader::new(file));
    reader
        .deserialize()
        .collect::<Result<Vec<T>, _>>()
        .with_context(|| format!("could not parse {}", path.display()))
}

fn read_csv_optional<T: DeserializeOwned>(path: &Path) -> anyhow::Result<Option<Vec<T>>> {
    if !path.is_file() {
        return Ok(None);
    }
    read_csv(path).map(Some)
}

impl InputLocator for FileLocator {
    fn supply_assemblies(&self, service: ServiceKind) -> anyhow::Result<Vec<SupplyAssembly>> {
        read_csv(
            &self
                .scenario
                .join("assemblies")
                .join(format!("{}.csv", service.assembly_table())),
        )
    }

    fn technology_tiers(&self, category: ComponentCategory) -> anyhow::Result<Vec<CapacityTier>> {
        let path = self
            .scenario
            .join("technology")
            .join(format!("{category}.csv"));
        Ok(read_csv_optional(&path)?.unwrap_or_default())
    }

    fn feedstock_prices(&self) -> anyhow::Result<IndexMap<String, f64>> {
        let path = self.scenario.join("technology").join("FEEDSTOCKS.csv");
        let rows: Vec<FeedstockPriceRow> = read_csv_optional(&path)?.unwrap_or_default();
        Ok(rows
            .into_iter()
            .map(|row| (row.carrier, row.price_usd_per_kwh))
            .collect())
    }

    fn building_supply_assignments(&self) -> anyhow::Result<Vec<SupplyAssignment>> {
        read_csv(&self.scenario.join("building_supply.csv"))
    }

    fn write_building_supply_assignments(
        &self,
        assignments: &[SupplyAssignment],
    ) -> anyhow::Result<()> {
        let path = self.scenario.join("building_supply.csv");
        let mut writer = csv::Writer::from_path(&path)
            .with_context(|| format!("could not write {}", path.display()))?;
        for assignment in assignments {
            writer.serialize(assignment)?;
        }
        writer.flush()?;
        Ok(())
    }

    fn total_demand(&self) -> anyhow::Result<Vec<TotalDemandRecord>> {
        read_csv(&self.scenario.join("demand").join("total_demand.csv"))
    }

    fn building_demand(&self, building: &str) -> anyhow::Result<Option<BuildingDemand>> {
        let path = self.scenario.join("demand").join(format!("{building}.csv"));
        if !path.is_file() {
            return Ok(None);
        }
        let file =
            File::open(&path).with_context(|| format!("could not open {}", path.display()))?;
        let mut reader = csv::Reader::from_reader(BufReader::new(file));
        let headers = reader.headers()?.clone();
        let columns: Vec<(usize, &str)> = headers
            .iter()
            .enumerate()
            .filter(|(_, header)| matches!(*header, "qh_kwh" | "qc_kwh" | "qww_kwh"))
            .collect();
        let mut series: IndexMap<&str, Vec<f64>> =
            columns.iter().map(|(_, header)| (*header, vec![])).collect();
        for record in reader.records() {
            let record = record?;
            for (index, header) in &columns {
                let value: f64 = record
                    .get(*index)
                    .unwrap_or("0")
                    .parse()
                    .with_context(|| format!("bad value in {}", path.display()))?;
                series[*header].push(value);
            }
        }
        Ok(Some(BuildingDemand {
            heating_kwh: series.shift_remove("qh_kwh"),
            cooling_kwh: series.shift_remove("qc_kwh"),
            hot_water_kwh: series.shift_remove("qww_kwh"),
        }))
    }

    fn building_potentials(&self, building: &str) -> anyhow::Result<IndexMap<String, Vec<f64>>> {
        let path = self
            .scenario
            .join("potentials")
            .join(format!("{building}.csv"));
        if !path.is_file() {
            return Ok(Default::default());
        }
        let file =
            File::open(&path).with_context(|| format!("could not open {}", path.display()))?;
        let mut reader = csv::Reader::from_reader(BufReader::new(file));
        let headers = reader.headers()?.clone();
        let mut series: IndexMap<String, Vec<f64>> = headers
            .iter()
            .map(|header| (header.to_string(), vec![]))
            .collect();
        for record in reader.records() {
            let record = record?;
            for (index, header) in headers.iter().enumerate() {
                let value: f64 = record
                    .get(index)
                    .unwrap_or("0")
                    .parse()
                    .with_context(|| format!("bad value in {}", path.display()))?;
                series[header].push(value);
            }
        }
        Ok(series)
    }

    fn network_nodes(
        &self,
        network_type: NetworkType,
        network_name: &str,
    ) -> anyhow::Result<Option<Vec<NetworkNode>>> {
        read_csv_optional(&self.network_dir(network_type, network_name).join("nodes.csv"))
    }

    fn network_edges(
        &self,
        network_type: NetworkType,
        network_name: &str,
    ) -> anyhow::Result<Option<Vec<NetworkEdge>>> {
        read_csv_optional(&self.network_dir(network_type, network_name).join("edges.csv"))
    }

    fn pipe_catalog(&self) -> anyhow::Result<Option<Vec<PipeCatalogRow>>> {
        read_csv_optional(&self.scenario.join("technology").join("pipes.csv"))
    }
}

/// Locator over in-memory tables, for embedding and tests.
#[derive(Debug, Default)]
pub struct MemoryLocator {
    pub assemblies: IndexMap<&'static str, Vec<SupplyAssembly>>,
    pub tiers: IndexMap<ComponentCategory, Vec<CapacityTier>>,
    pub prices: IndexMap<String, f64>,
    pub assignments: RwLock<Vec<SupplyAssignment>>,
    pub totals: Vec<TotalDemandRecord>,
    pub demands: IndexMap<String, BuildingDemand>,
    pub potentials: IndexMap<String, IndexMap<String, Vec<f64>>>,
    pub nodes: IndexMap<(NetworkType, String), Vec<NetworkNode>>,
    pub edges: IndexMap<(NetworkType, String), Vec<NetworkEdge>>,
    pub pipes: Option<Vec<PipeCatalogRow>>,
}

impl InputLocator for MemoryLocator {
    fn supply_assemblies(&self, service: ServiceKind) -> anyhow::Result<Vec<SupplyAssembly>> {
        Ok(self
            .assemblies
            .get(service.assembly_table())
            .cloned()
            .unwrap_or_default())
    }

    fn technology_tiers(&self, category: ComponentCategory) -> anyhow::Result<Vec<CapacityTier>> {
        Ok(self.tiers.get(&category).cloned().unwrap_or_default())
    }

    fn feedstock_prices(&self) -> anyhow::Result<IndexMap<String, f64>> {
        Ok(self.prices.clone())
    }

    fn building_supply_assignments(&self) -> anyhow::Result<Vec<SupplyAssignment>> {
        Ok(self.assignments.read().clone())
    }

    fn write_building_supply_assignments(
        &self,
        assignments: &[SupplyAssignment],
    ) -> anyhow::Result<()> {
        *self.assignments.write() = assignments.to_vec();
        Ok(())
    }

    fn total_demand(&self) -> anyhow::Result<Vec<TotalDemandRecord>> {
        Ok(self.totals.clone())
    }

    fn building_demand(&self, building: &str) -> anyhow::Result<Option<BuildingDemand>> {
        Ok(self.demands.get(building).cloned())
    }

    fn building_potentials(&self, building: &str) -> anyhow::Result<IndexMap<String, Vec<f64>>> {
        Ok(self.potentials.get(building).cloned().unwrap_or_default())
    }

    fn network_nodes(
        &self,
        network_type: NetworkType,
        network_name: &str,
    ) -> anyhow::Result<Option<Vec<NetworkNode>>> {
        Ok(self
            .nodes
            .get(&(network_type, network_name.to_string()))
            .cloned())
    }

    fn network_edges(
        &self,
        network_type: NetworkType,
        network_name: &str,
    ) -> anyhow::Result<Option<Vec<NetworkEdge>>> {
        Ok(self
            .edges
            .get(&(network_type, network_name.to_string()))
            .cloned())
    }

    fn pipe_catalog(&self) -> anyhow::Result<Option<Vec<PipeCatalogRow>>> {
        Ok(self.pipes.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use rstest::*;

    #[rstest]
    #[case("SUPPLY_COOLING_AS1 (building)", "SUPPLY_COOLING_AS1", Some(Scale::Building))]
    #[case("SUPPLY_HEATING_AS2 (district)", "SUPPLY_HEATING_AS2", Some(Scale::District))]
    #[case("SUPPLY_HOTWATER_AS3", "SUPPLY_HOTWATER_AS3", None)]
    fn test_strip_scale_label(
        #[case] value: &str,
        #[case] code: &str,
        #[case] scale: Option<Scale>,
    ) {
        assert_eq!(strip_scale_label(value), (code, scale));
    }

    #[rstest]
    fn test_filter_supply_code_single_value_unchanged() {
        let values = vec!["SUPPLY_COOLING_AS1 (district)".to_string()];
        // single-code settings pass through regardless of the requested scale
        assert_eq!(
            filter_supply_code_by_scale(&values, Scale::Building),
            Some("SUPPLY_COOLING_AS1".to_string())
        );
    }

    #[rstest]
    fn test_filter_supply_code_multi_select_matches_scale() {
        let values = vec![
            "SUPPLY_HEATING_AS1 (district)".to_string(),
            "SUPPLY_HEATING_AS4 (building)".to_string(),
        ];
        assert_eq!(
            filter_supply_code_by_scale(&values, Scale::Building),
            Some("SUPPLY_HEATING_AS4".to_string())
        );
        assert_eq!(
            filter_supply_code_by_scale(&values, Scale::District),
            Some("SUPPLY_HEATING_AS1".to_string())
        );
    }

    #[rstest]
    fn test_filter_supply_code_falls_back_to_first() {
        let values = vec![
            "SUPPLY_HEATING_AS1".to_string(),
            "SUPPLY_HEATING_AS4".to_string(),
        ];
        assert_eq!(
            filter_supply_code_by_scale(&values, Scale::District),
            Some("SUPPLY_HEATING_AS1".to_string())
        );
        assert_eq!(filter_supply_code_by_scale(&[], Scale::District), None);
    }

    #[rstest]
    fn test_assembly_row_parsing() {
        let csv = "code,scale,primary_components,secondary_components,tertiary_components,feedstock\n\
                   SUPPLY_COOLING_AS1,BUILDING,\"CH1, CH2\",NONE,CT1,GRID\n";
        let mut reader = csv::Reader::from_reader(csv.as_bytes());
        let assembly: SupplyAssembly = reader.deserialize().next().unwrap().unwrap();
        assert_eq!(assembly.scale, Scale::Building);
        assert_eq!(assembly.primary_components, vec!["CH1", "CH2"]);
        assert!(assembly.secondary_components.is_empty());
        assert_eq!(assembly.tertiary_components, vec!["CT1"]);
        assert_eq!(assembly.feedstock.as_deref(), Some("GRID"));
    }

    #[rstest]
    fn test_config_defaults() {
        let config = Config::from_json("{}".as_bytes()).unwrap();
        assert_eq!(config.network_name, NO_NETWORK_NAME);
        assert!(!config.network_selected());
        assert_eq!(config.network_lifetime_yrs, 20.);
    }
}
