use serde::{Deserialize, Serialize};
use std::{
    collections::BTreeSet,
    fs::{read_to_string, write},
    path::{Path, PathBuf},
};

use crate::{
    error::ForceError,
    metadata::{DEFAULT_CHUNK_SIZE, DEFAULT_QUERY_TEMPLATE},
    properties::Scope,
};

pub const DEFAULT_REMOTE_PATH: &str = "/ide0/{resource}/for.dat";
pub const DEFAULT_SSH_PORT: u16 = 22;

fn default_chunk_size() -> usize {
    DEFAULT_CHUNK_SIZE
}

fn default_query_template() -> String {
    DEFAULT_QUERY_TEMPLATE.to_string()
}

fn default_remote_path() -> String {
    DEFAULT_REMOTE_PATH.to_string()
}

fn default_port() -> u16 {
    DEFAULT_SSH_PORT
}

fn default_store_path() -> PathBuf {
    PathBuf::from("forcewatch.db")
}

/// One controller. `address`, `port` and `username` locate its file system for transports
/// that reach it over the network; [`crate::transport::MirrorTransport`] only reports them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ControllerConfig {
    pub name: String,
    pub address: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub resources: Vec<String>,
    /// Reference metadata store for this controller's resources.
    pub metadata_db: PathBuf,
}

impl ControllerConfig {
    /// `user@address:port`, or `address:port` without a user.
    pub fn endpoint(&self) -> String {
        if self.username.is_empty() {
            format!("{}:{}", self.address, self.port)
        } else {
            format!("{}@{}:{}", self.username, self.address, self.port)
        }
    }

    pub fn scopes(&self) -> impl Iterator<Item = Scope> + '_ {
        self.resources
            .iter()
            .map(move |resource| Scope::new(self.name.clone(), resource.clone()))
    }
}

/// Everything one pipeline run needs. Built once, then shared read-only.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Label attached to every record this installation produces.
    pub department: String,
    /// Root of the local dump cache; one subdirectory per controller.
    pub local_base_dir: PathBuf,
    #[serde(default = "default_store_path")]
    pub store_path: PathBuf,
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
    #[serde(default = "default_query_template")]
    pub query_template: String,
    /// Location of a resource's dump on the controller. `{resource}` is substituted.
    #[serde(default = "default_remote_path")]
    pub remote_path: String,
    #[serde(default)]
    pub controllers: Vec<ControllerConfig>,
}

impl PipelineConfig {
    pub fn new(department: impl Into<String>, local_base_dir: impl Into<PathBuf>) -> Self {
        PipelineConfig {
            department: department.into(),
            local_base_dir: local_base_dir.into(),
            store_path: default_store_path(),
            chunk_size: DEFAULT_CHUNK_SIZE,
            query_template: default_query_template(),
            remote_path: default_remote_path(),
            controllers: Vec::new(),
        }
    }

    pub fn controller(&self, name: &str) -> Option<&ControllerConfig> {
        self.controllers.iter().find(|c| c.name == name)
    }

    pub fn declared_scopes(&self) -> BTreeSet<Scope> {
        self.controllers.iter().flat_map(|c| c.scopes()).collect()
    }

    /// Controllers that still declare at least one resource.
    pub fn declared_controllers(&self) -> BTreeSet<String> {
        self.declared_scopes()
            .into_iter()
            .map(|scope| scope.controller)
            .collect()
    }

    pub fn controller_dir(&self, controller: &str) -> PathBuf {
        self.local_base_dir.join(controller)
    }

    /// `{local_base_dir}/{controller}/{controller}_{resource}.dat`
    pub fn dump_path(&self, scope: &Scope) -> PathBuf {
        self.controller_dir(&scope.controller)
            .join(scope.dump_file_name())
    }

    pub fn remote_path_for(&self, resource: &str) -> String {
        self.remote_path.replace("{resource}", resource)
    }

    pub fn validate(&self) -> Result<(), ForceError> {
        if self.chunk_size == 0 {
            return Err(ForceError::Config("chunk_size must be positive".to_string()));
        }
        if !self.query_template.contains("{placeholders}") {
            return Err(ForceError::Config(
                "query_template has no {placeholders} slot".to_string(),
            ));
        }
        let mut seen = BTreeSet::new();
        for controller in self.controllers.iter() {
            if !is_plain_name(&controller.name) || controller.name.contains('_') {
                return Err(ForceError::Config(format!(
                    "controller name {:?} must be non-empty, alphanumeric and free of '_'",
                    controller.name
                )));
            }
            if !seen.insert(controller.name.as_str()) {
                return Err(ForceError::Config(format!(
                    "controller {} declared twice",
                    controller.name
                )));
            }
            if let Some(bad) = controller
                .resources
                .iter()
                .find(|r| !is_plain_name(r) || r.starts_with(|c: char| c.is_ascii_digit()))
            {
                return Err(ForceError::Config(format!(
                    "resource name {bad:?} of controller {} is not a plain identifier",
                    controller.name
                )));
            }
        }
        Ok(())
    }
}

/// Names end up in file names and, unquoted, as table names in lookup queries.
fn is_plain_name(name: &str) -> bool {
    !name.is_empty() && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
}

pub trait ConfigProvider: Send + Sync {
    fn get_config(&self) -> Result<PipelineConfig, ForceError>;
    fn set_config(&self, config: &PipelineConfig) -> Result<(), ForceError>;
}

#[derive(Debug, Serialize, Deserialize)]
pub struct TomlConfigProvider {
    path: PathBuf,
}

impl TomlConfigProvider {
    pub fn new(path: PathBuf) -> Self {
        TomlConfigProvider { path }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl ConfigProvider for TomlConfigProvider {
    fn get_config(&self) -> Result<PipelineConfig, ForceError> {
        tracing::debug!("Attempting to read pipeline config from: {:?}", &self.path);
        if !self.path.exists() {
            return Err(ForceError::NotFound(format!(
                "config file {:?} not found",
                self.path
            )));
        }
        let content = read_to_string(&self.path)?;
        let config: PipelineConfig = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    fn set_config(&self, config: &PipelineConfig) -> Result<(), ForceError> {
        tracing::debug!("Attempting to write pipeline config to: {:?}", &self.path);
        config.validate()?;
        let toml_string = toml::to_string(config)?;
        write(&self.path, toml_string)?;
        Ok(())
    }
}
