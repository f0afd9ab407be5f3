/// TOML configuration and its hot-swappable manager.
pub mod toml_config;
