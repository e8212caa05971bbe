pub mod definitions;
pub mod store;
