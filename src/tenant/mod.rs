//! Tenant configuration: model, validation, and the versioned manager.

pub mod manager;
pub mod model;
pub mod validation;

pub use manager::TenantConfigManager;
pub use model::{
    ConfigurationChange, ConfigurationUpdate, DEFAULT_TENANT, FallbackMode, ImportReport,
    TenantConfiguration, TenantSettings,
};
