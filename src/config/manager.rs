//! Loading, saving and diffing [`super::ManagerConfig`]: dispatch on file
//! extension (YAML by default, JSON opt-in), load/save/validate.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use tracing::{debug, info};

use super::{ConfigDelta, ManagerConfig, RouteConfig};
use crate::error::ConfigError;

/// Owns the on-disk location of a [`ManagerConfig`] and knows how to load,
/// save, and diff it against a newly loaded version for reconciliation.
pub struct ConfigManager {
    config_path: PathBuf,
}

impl ConfigManager {
    pub fn new(config_path: PathBuf) -> Self {
        Self { config_path }
    }

    pub fn path(&self) -> &Path {
        &self.config_path
    }

    /// Load and validate the configuration at `config_path`, applying
    /// `VITA_*` environment overrides afterward: the environment always
    /// overrides the file, never the reverse.
    pub fn load(&self) -> Result<ManagerConfig, ConfigError> {
        info!(path = %self.config_path.display(), "loading configuration");
        let content = std::fs::read_to_string(&self.config_path).map_err(|source| ConfigError::Read {
            path: self.config_path.display().to_string(),
            source,
        })?;

        let mut config: ManagerConfig = if self.is_json() {
            serde_json::from_str(&content).map_err(|e| ConfigError::Parse {
                path: self.config_path.display().to_string(),
                source: Box::new(e),
            })?
        } else {
            serde_yaml::from_str(&content).map_err(|e| ConfigError::Parse {
                path: self.config_path.display().to_string(),
                source: Box::new(e),
            })?
        };

        config.apply_env_overrides();
        config.validate().map_err(|errors| {
            ConfigError::Invalid(errors.into_iter().map(|e| e.to_string()).collect::<Vec<_>>().join("; "))
        })?;

        debug!(routes = config.routes.len(), "configuration loaded");
        Ok(config)
    }

    pub fn save(&self, config: &ManagerConfig) -> Result<(), ConfigError> {
        if let Some(parent) = self.config_path.parent() {
            std::fs::create_dir_all(parent).map_err(|source| ConfigError::Read {
                path: self.config_path.display().to_string(),
                source,
            })?;
        }
        let content = if self.is_json() {
            serde_json::to_string_pretty(config).map_err(|e| ConfigError::Parse {
                path: self.config_path.display().to_string(),
                source: Box::new(e),
            })?
        } else {
            serde_yaml::to_string(config).map_err(|e| ConfigError::Parse {
                path: self.config_path.display().to_string(),
                source: Box::new(e),
            })?
        };
        std::fs::write(&self.config_path, content).map_err(|source| ConfigError::Read {
            path: self.config_path.display().to_string(),
            source,
        })
    }

    fn is_json(&self) -> bool {
        self.config_path.extension().and_then(|ext| ext.to_str()) == Some("json")
    }
}

/// Reconcile an old route set against a new one by identifier:
///
/// - absent in the new set -> removed
/// - present, psk and route_spi unchanged -> unchanged (or `ttl_changed` if
///   only `negotiation_ttl` differs process-wide)
/// - present, psk or route_spi changed -> replaced (torn down and rebuilt)
/// - new identifier -> added
pub fn diff_routes(old: &[RouteConfig], new: &[RouteConfig], negotiation_ttl_changed: bool) -> ConfigDelta {
    let old_by_id: HashMap<&str, &RouteConfig> = old.iter().map(|r| (r.id.as_str(), r)).collect();
    let new_ids: std::collections::HashSet<&str> = new.iter().map(|r| r.id.as_str()).collect();

    let mut delta = ConfigDelta::default();

    for route in new {
        match old_by_id.get(route.id.as_str()) {
            None => delta.added.push(route.clone()),
            Some(prior) => {
                if prior.psk != route.psk || prior.route_spi != route.route_spi {
                    delta.replaced.push(route.clone());
                } else if negotiation_ttl_changed {
                    delta.ttl_changed.push(route.clone());
                } else {
                    delta.unchanged.push(route.clone());
                }
            }
        }
    }
    for route in old {
        if !new_ids.contains(route.id.as_str()) {
            delta.removed.push(route.id.clone());
        }
    }
    delta
}
