/*
 * Copyright (c) Huawei Technologies Co., Ltd. 2024. All rights reserved.
 * KubeOS is licensed under the Mulan PSL v2.
 * You can use this software according to the terms and conditions of the Mulan PSL v2.
 * You may obtain a copy of Mulan PSL v2 at:
 *     http://license.coscl.org.cn/MulanPSL2
 * THIS SOFTWARE IS PROVIDED ON AN "AS IS" BASIS, WITHOUT WARRANTIES OF ANY KIND, EITHER EXPRESS OR
 * IMPLIED, INCLUDING BUT NOT LIMITED TO NON-INFRINGEMENT, MERCHANTABILITY OR FIT FOR A PARTICULAR
 * PURPOSE.
 * See the Mulan PSL v2 for more details.
 */

use std::{collections::BTreeMap, fs, path::Path, time::Duration};

use k8s_openapi::api::core::v1::Toleration;
use log::debug;
use serde::{Deserialize, Serialize};

use self::config_error::Error;
use crate::entities::{
    process::{parse_cpu, parse_memory, ProcLimits},
    StepMetaSet,
};

pub const DEFAULT_SLUGBUILDER_IMAGE: &str = "bkpaas/slugbuilder:heroku-bionic-v1";
pub const MAX_BUILDER_SECONDS: u64 = 3600;

#[derive(Debug, Deserialize, Serialize, Clone, Default)]
pub struct ControlPlaneConfig {
    #[serde(default = "default_region")]
    pub region: String,
    /// Also allocate the `/{region}-{engine_app_name}/` subpath.
    #[serde(default)]
    pub legacy_subpath_compat: bool,
    #[serde(default)]
    pub builder: BuilderConfig,
    #[serde(default)]
    pub blob_store: BlobStoreConfig,
    #[serde(default)]
    pub registry: RegistryConfig,
    #[serde(default)]
    pub release: ReleaseConfig,
    #[serde(default)]
    pub limits: LimitsConfig,
    #[serde(default)]
    pub clusters: Vec<ClusterConfig>,
    /// Replaces the built-in step presets when not empty.
    #[serde(default)]
    pub step_meta_sets: Vec<StepMetaSet>,
}

fn default_region() -> String {
    "default".to_string()
}

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default)]
pub struct BuilderConfig {
    pub default_image: String,
    pub max_builder_seconds: u64,
    pub image_pull_secrets: Vec<String>,
    pub node_selector: BTreeMap<String, String>,
    pub tolerations: Vec<Toleration>,
    pub log_follow_timeout_secs: u64,
    pub pod_poll_interval_ms: u64,
}

impl Default for BuilderConfig {
    fn default() -> Self {
        BuilderConfig {
            default_image: DEFAULT_SLUGBUILDER_IMAGE.to_string(),
            max_builder_seconds: MAX_BUILDER_SECONDS,
            image_pull_secrets: Vec::new(),
            node_selector: BTreeMap::new(),
            tolerations: Vec::new(),
            log_follow_timeout_secs: 3600,
            pod_poll_interval_ms: 1000,
        }
    }
}

impl BuilderConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.pod_poll_interval_ms)
    }
}

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default)]
pub struct BlobStoreConfig {
    pub endpoint: String,
    pub bucket: String,
    pub secret_key: String,
}

impl Default for BlobStoreConfig {
    fn default() -> Self {
        BlobStoreConfig {
            endpoint: "http://blobstore.local".to_string(),
            bucket: "bkpaas3-slug-packages".to_string(),
            secret_key: String::new(),
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone, Default)]
#[serde(default)]
pub struct RegistryConfig {
    pub host: String,
    pub namespace: String,
    pub username: String,
    pub password: String,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default)]
pub struct ReleaseConfig {
    pub poll_interval_ms: u64,
    pub ready_timeout_secs: u64,
    pub hook_timeout_secs: u64,
    pub wait_default_sa_secs: u64,
    /// Leave the pre-release hook to the BkApp operator instead of running it here.
    pub operator_runs_hooks: bool,
}

impl Default for ReleaseConfig {
    fn default() -> Self {
        ReleaseConfig {
            poll_interval_ms: 2000,
            ready_timeout_secs: 900,
            hook_timeout_secs: 900,
            wait_default_sa_secs: 60,
            operator_runs_hooks: false,
        }
    }
}

impl ReleaseConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default)]
pub struct LimitsConfig {
    pub max_proc_cpu: String,
    pub max_proc_mem: String,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        LimitsConfig { max_proc_cpu: "4000m".to_string(), max_proc_mem: "4Gi".to_string() }
    }
}

impl LimitsConfig {
    pub fn proc_limits(&self) -> Result<ProcLimits, Error> {
        let invalid = |e: crate::entities::entity_error::Error| Error::InvalidValue {
            field: "limits".into(),
            reason: e.to_string(),
        };
        Ok(ProcLimits {
            max_cpu_millis: parse_cpu(&self.max_proc_cpu).map_err(invalid)?,
            max_memory_mib: parse_memory(&self.max_proc_mem).map_err(invalid)?,
        })
    }
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq, Eq)]
pub struct DomainConfig {
    pub name: String,
    #[serde(default)]
    pub https_enabled: bool,
    #[serde(default)]
    pub reserved: bool,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq, Eq)]
pub struct PortMap {
    pub http: u16,
    pub https: u16,
}

impl Default for PortMap {
    fn default() -> Self {
        PortMap { http: 80, https: 443 }
    }
}

impl PortMap {
    pub fn port_for(&self, scheme: &str) -> u16 {
        if scheme == "https" {
            self.https
        } else {
            self.http
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq, Eq, Default)]
pub struct IngressConfig {
    #[serde(default)]
    pub app_root_domains: Vec<DomainConfig>,
    #[serde(default)]
    pub sub_path_domains: Vec<DomainConfig>,
    #[serde(default)]
    pub port_map: PortMap,
    #[serde(default)]
    pub default_root_domain: Option<String>,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct ClusterConfig {
    pub name: String,
    #[serde(default)]
    pub is_default: bool,
    #[serde(default = "default_tenant")]
    pub tenant_id: String,
    #[serde(default = "default_controller_version")]
    pub nginx_controller_version: String,
    #[serde(default)]
    pub ingress_config: IngressConfig,
    #[serde(default)]
    pub builder_tolerations: Vec<Toleration>,
}

fn default_tenant() -> String {
    "default".to_string()
}

fn default_controller_version() -> String {
    "0.22.0".to_string()
}

impl ControlPlaneConfig {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, Error> {
        let path = path.as_ref();
        debug!("Loading control plane config from {}", path.display());
        let content = fs::read_to_string(path)
            .map_err(|e| Error::ReadFile { path: path.display().to_string(), reason: e.to_string() })?;
        let config = Self::from_toml(&content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_toml(content: &str) -> Result<Self, Error> {
        toml::from_str(content).map_err(|e| Error::Parse { reason: e.to_string() })
    }

    pub fn validate(&self) -> Result<(), Error> {
        if self.clusters.is_empty() {
            return Err(Error::InvalidValue { field: "clusters".into(), reason: "at least one cluster is required".into() });
        }
        if self.clusters.iter().filter(|c| c.is_default).count() > 1 {
            return Err(Error::InvalidValue { field: "clusters".into(), reason: "more than one default cluster".into() });
        }
        for cluster in &self.clusters {
            if cluster.nginx_controller_version.split('.').take(2).any(|part| part.parse::<u32>().is_err()) {
                return Err(Error::InvalidValue {
                    field: format!("clusters.{}.nginx_controller_version", cluster.name),
                    reason: format!("'{}' is not a version", cluster.nginx_controller_version),
                });
            }
        }
        self.limits.proc_limits()?;
        Ok(())
    }

    pub fn cluster(&self, name: &str) -> Result<&ClusterConfig, Error> {
        self.clusters.iter().find(|c| c.name == name).ok_or_else(|| Error::UnknownCluster { name: name.to_string() })
    }

    /// The cluster flagged `is_default`, or the first one listed.
    pub fn default_cluster(&self) -> Result<&ClusterConfig, Error> {
        self.clusters
            .iter()
            .find(|c| c.is_default)
            .or_else(|| self.clusters.first())
            .ok_or_else(|| Error::UnknownCluster { name: "<default>".to_string() })
    }
}

pub mod config_error {
    use thiserror::Error;

    #[derive(Error, Debug, Clone, PartialEq, Eq)]
    pub enum Error {
        #[error("Failed to read config file {path}: {reason}")]
        ReadFile { path: String, reason: String },

        #[error("Failed to parse config: {reason}")]
        Parse { reason: String },

        #[error("Invalid config value for {field}: {reason}")]
        InvalidValue { field: String, reason: String },

        #[error("Cluster '{name}' is not configured")]
        UnknownCluster { name: String },
    }
}
