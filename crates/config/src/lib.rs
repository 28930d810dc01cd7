//! Configuration for the naclgate server: schema, discovery and validation.

pub mod env_subst;
pub mod error;
pub mod loader;
pub mod schema;

pub use {
    error::ConfigError,
    loader::{
        clear_config_dir, config_dir, discover_and_load, find_config_file, load_config,
        save_config, set_config_dir,
    },
    schema::{AuthConfig, NaclgateConfig, ServerConfig, TlsConfig},
};
