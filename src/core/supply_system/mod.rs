pub mod structure;
pub mod system;
