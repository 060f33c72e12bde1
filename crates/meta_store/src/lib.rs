pub mod config;
mod db;
pub mod migration;
pub mod store;

pub use config::{
    CONFIG_FILE_NAME, DEFAULT_SQLITE_NAME, DatabaseConfig, LimitsConfig, MAX_KEY_CHARS, MetaConfig,
    PoolConfig, StoreLimits, ValidationMode,
};
pub use modelbox_meta_core::*;
pub use store::{FAILPOINT_AFTER_ENTITY_INSERT, FAILPOINT_AFTER_MUTATION_APPEND, MetaStore};
