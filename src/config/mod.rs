mod migrate;
mod settings;

pub use migrate::{migrate, MAX_SCHEMA_VERSION};
pub use settings::{
    BashRules, BudgetEntry, BudgetSpec, BudgetUnit, CommitFormatConfig, ConcurrencyConfig,
    FileScopeConfig, FlotillaConfig, LimitsConfig, MemoryConfig, ModelsConfig, PermissionsConfig,
    ProjectConfig, RoleBudgets, SandboxConfig, ValidationConfig, ValidatorDiagnosticsConfig,
};
