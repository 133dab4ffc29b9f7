pub mod building;
pub mod component;
pub mod connectivity;
pub mod costs;
pub mod energy_flow;
pub mod supply_system;
pub mod units;
