pub mod manager;
pub mod refresher;
pub mod universe;

pub use manager::ClusterManager;
