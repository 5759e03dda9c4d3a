pub mod anomaly;
pub mod inventory;
