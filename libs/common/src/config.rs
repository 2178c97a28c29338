//! Layered configuration loading
//!
//! Priority (highest to lowest):
//! 1. Environment variables (`<SERVICE>_SECTION__KEY`)
//! 2. Explicit config file passed on the command line
//! 3. Service-specific file (`config/<service>.{toml,yaml}`)
//! 4. Default files (`config/default.{toml,yaml,json}`)
//! 5. `T::default()`

use std::path::Path;

use errors::{NodeError, NodeResult};
use figment::{
    providers::{Env, Format, Json, Serialized, Toml, Yaml},
    Figment,
};
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Build the layered figment for a service without extracting it
pub fn figment_for<T>(service_name: &str, explicit_path: Option<&Path>) -> NodeResult<Figment>
where
    T: Serialize + Default,
{
    let mut figment = Figment::from(Serialized::defaults(T::default()))
        .merge(Toml::file("config/default.toml"))
        .merge(Yaml::file("config/default.yaml"))
        .merge(Json::file("config/default.json"))
        .merge(Toml::file(format!("config/{}.toml", service_name)))
        .merge(Yaml::file(format!("config/{}.yaml", service_name)));

    if let Some(path) = explicit_path {
        if !path.exists() {
            return Err(NodeError::Configuration(format!(
                "Config file not found: {}",
                path.display()
            )));
        }
        figment = merge_file(figment, path)?;
        debug!("Config file: {}", path.display());
    }

    let prefix = format!("{}_", service_name.to_uppercase().replace('-', "_"));
    Ok(figment.merge(Env::prefixed(&prefix).split("__")))
}

/// Load configuration from all layers
pub fn load_config<T>(service_name: &str, explicit_path: Option<&Path>) -> NodeResult<T>
where
    T: Serialize + for<'de> Deserialize<'de> + Default,
{
    Ok(figment_for::<T>(service_name, explicit_path)?.extract()?)
}

fn merge_file(figment: Figment, path: &Path) -> NodeResult<Figment> {
    let extension = path
        .extension()
        .and_then(|s| s.to_str())
        .ok_or_else(|| NodeError::Configuration("Config file must have an extension".into()))?;

    match extension {
        "toml" => Ok(figment.merge(Toml::file(path))),
        "yaml" | "yml" => Ok(figment.merge(Yaml::file(path))),
        "json" => Ok(figment.merge(Json::file(path))),
        _ => Err(NodeError::Configuration(format!(
            "Unsupported config file format: {}",
            extension
        ))),
    }
}
