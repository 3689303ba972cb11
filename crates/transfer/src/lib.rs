//! connector-transfer: provisioning the resources a data transfer needs.
//!
//! A [`TransferProcessManager`] moves each [`TransferProcess`] through
//! provisioning and deprovisioning. The work itself is done by pluggable
//! [`Provisioner`]s, one per resource kind, which report back through a
//! one-shot [`ProvisionContext`] or [`DeprovisionContext`].
//!
//! [`TransferProcess`]: connector_core::TransferProcess

pub mod config;
pub mod error;
pub mod manager;
pub mod provision;
pub mod vault;

pub use config::TransferConfig;
pub use error::{ProvisionError, TransferError, VaultError};
pub use manager::{TransferProcessManager, SECRET_KEY_SUFFIX};
pub use provision::{
    DeprovisionContext, ProvisionContext, ProvisionDataStore, Provisioner, ProvisionerRegistry,
    StorageProvisionData,
};
pub use vault::{InMemoryVault, Vault};
