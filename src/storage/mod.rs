pub mod asset_vault;
pub mod state_store;

pub use asset_vault::{AssetVault, MoveReport};
pub use state_store::{FileStateStore, StateStore};
