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

//! Routing of a workload: persists generated subdomains, then writes the
//! DomainGroupMapping (cloud-native apps) or Ingress objects (legacy apps)
//! so that allocated and custom addresses resolve.

pub mod dialect;
pub mod domains;
mod ingress;

use std::{collections::BTreeMap, sync::Arc};

use common::{
    apiclient::{MergeStrategy, ResourceApi},
    crd::{DomainGroup, DomainGroupMapping, DomainGroupMappingSpec, MappedDomain, MappingRef},
    kinds::Kind,
    values::{BKAPP_API_VERSION, BKAPP_KIND, LABEL_WL_APP},
};
use log::{debug, info};
use serde::Serialize;

use self::networking_error::Error;
pub use self::{
    dialect::{dialect_for, IngressDialect},
    domains::DomainPayload,
};
use crate::{
    addr::{AddrAllocator, Address},
    config::ControlPlaneConfig,
    entities::{AppDomain, DomainSource, ExposedUrlType, WlApp},
    store::Store,
};

pub const WEB_PROCESS: &str = "web";
pub const WEB_SERVICE_PORT: i32 = 80;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EntranceSource {
    Subdomain,
    Subpath,
    Custom,
}

impl EntranceSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntranceSource::Subdomain => "subdomain",
            EntranceSource::Subpath => "subpath",
            EntranceSource::Custom => "custom",
        }
    }
}

/// A routable (host, path prefix) pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Entrance {
    pub source: EntranceSource,
    pub host: String,
    pub path_prefix: String,
    pub https_enabled: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncSummary {
    pub new_app_domains: usize,
    pub entrances: Vec<Entrance>,
    pub applied: Vec<String>,
    pub deleted: Vec<String>,
}

/// Name of the Service fronting the web process of a legacy workload.
pub fn web_service_name(wl_app: &WlApp) -> String {
    format!("{}--{}", wl_app.bkapp_name(), WEB_PROCESS)
}

fn dedupe(entrances: Vec<Entrance>) -> Vec<Entrance> {
    let mut seen = Vec::new();
    let mut unique = Vec::new();
    for entrance in entrances {
        let key = (entrance.host.clone(), entrance.path_prefix.clone());
        if !seen.contains(&key) {
            seen.push(key);
            unique.push(entrance);
        }
    }
    unique
}

fn address_entrance(source: EntranceSource, address: &Address) -> Entrance {
    Entrance {
        source,
        host: address.url.host.clone(),
        path_prefix: address.url.path.clone(),
        https_enabled: address.url.scheme == "https",
    }
}

pub fn domain_group_mapping(wl_app: &WlApp, entrances: &[Entrance]) -> Result<serde_json::Value, Error> {
    let mut groups: BTreeMap<EntranceSource, BTreeMap<String, MappedDomain>> = BTreeMap::new();
    for entrance in entrances {
        let domain = groups.entry(entrance.source).or_default().entry(entrance.host.clone()).or_insert_with(|| {
            MappedDomain {
                host: entrance.host.clone(),
                path_prefix_list: Vec::new(),
                https_enabled: entrance.https_enabled,
                tls_secret_name: None,
            }
        });
        domain.path_prefix_list.push(entrance.path_prefix.clone());
    }
    let data = groups
        .into_iter()
        .map(|(source, domains)| DomainGroup {
            source_type: source.as_str().to_string(),
            domains: domains.into_values().collect(),
        })
        .collect();
    let spec = DomainGroupMappingSpec {
        ref_: MappingRef {
            api_version: BKAPP_API_VERSION.to_string(),
            kind: BKAPP_KIND.to_string(),
            name: wl_app.bkapp_name(),
        },
        data,
    };
    let mut dgm = DomainGroupMapping::new(&wl_app.bkapp_name(), spec);
    dgm.metadata.namespace = Some(wl_app.namespace.clone());
    dgm.metadata.labels = Some(BTreeMap::from([(LABEL_WL_APP.to_string(), wl_app.name.clone())]));
    Ok(serde_json::to_value(&dgm)?)
}

#[derive(Clone)]
pub struct IngressSynchronizer<T: ResourceApi> {
    pub client: T,
    pub store: Arc<Store>,
    pub config: Arc<ControlPlaneConfig>,
}

impl<T: ResourceApi> IngressSynchronizer<T> {
    pub fn new(client: T, store: Arc<Store>, config: Arc<ControlPlaneConfig>) -> Self {
        IngressSynchronizer { client, store, config }
    }

    /// Every entrance of the workload, built-in ones first.
    pub async fn entrances(&self, wl_app: &WlApp) -> Result<(Vec<Entrance>, usize), Error> {
        let cluster = self.config.cluster(&wl_app.cluster_name)?;
        let allocator = AddrAllocator::for_wl_app(wl_app, &cluster.ingress_config, self.config.legacy_subpath_compat);
        let generated: Vec<AppDomain> = allocator
            .list_available(ExposedUrlType::Subdomain, false)
            .iter()
            .map(|a| AppDomain {
                app: wl_app.name.clone(),
                host: a.url.host.clone(),
                https_enabled: a.url.scheme == "https",
                source: DomainSource::AutoGen,
            })
            .collect();
        let new_app_domains = self.store.add_app_domains(generated).await;

        let mut entrances: Vec<Entrance> = self
            .store
            .app_domains(&wl_app.name)
            .await
            .into_iter()
            .map(|d| Entrance {
                source: EntranceSource::Subdomain,
                host: d.host,
                path_prefix: "/".to_string(),
                https_enabled: d.https_enabled,
            })
            .collect();
        entrances.extend(
            allocator.list_available(ExposedUrlType::Subpath, false).iter().map(|a| address_entrance(EntranceSource::Subpath, a)),
        );
        entrances.extend(self.list_domains(&wl_app.name).await?.into_iter().map(|d| Entrance {
            source: EntranceSource::Custom,
            host: d.name,
            path_prefix: d.path_prefix,
            https_enabled: d.https_enabled,
        }));
        Ok((dedupe(entrances), new_app_domains))
    }

    pub async fn deploy_networking(&self, wl_app: &str) -> Result<SyncSummary, Error> {
        debug!("start deploy_networking for {}", wl_app);
        let wl = self.store.wl_app(wl_app).await?;
        let app = self.store.application(&wl.app_code).await?;
        let (entrances, new_app_domains) = self.entrances(&wl).await?;
        let mut summary = SyncSummary { new_app_domains, entrances, ..SyncSummary::default() };
        if app.is_cloud_native() {
            let body = domain_group_mapping(&wl, &summary.entrances)?;
            self.client
                .create_or_update(Kind::DomainGroupMapping, &wl.bkapp_name(), &wl.namespace, &body, MergeStrategy::MergePatch)
                .await?;
            summary.applied.push(wl.bkapp_name());
        } else {
            let cluster = self.config.cluster(&wl.cluster_name)?;
            let dialect = dialect_for(&cluster.nginx_controller_version);
            let (applied, deleted) = self.sync_ingresses(&wl, &summary.entrances, dialect.as_ref()).await?;
            summary.applied = applied;
            summary.deleted = deleted;
        }
        info!(
            "Synced networking of {}: {} entrances, {} new app domains",
            wl_app,
            summary.entrances.len(),
            summary.new_app_domains
        );
        Ok(summary)
    }

    pub async fn delete_networking(&self, wl_app: &str) -> Result<(), Error> {
        debug!("start delete_networking for {}", wl_app);
        let wl = self.store.wl_app(wl_app).await?;
        let app = self.store.application(&wl.app_code).await?;
        if app.is_cloud_native() {
            self.client.delete(Kind::DomainGroupMapping, &wl.bkapp_name(), &wl.namespace, None).await?;
        } else {
            let cluster = self.config.cluster(&wl.cluster_name)?;
            let dialect = dialect_for(&cluster.nginx_controller_version);
            self.sync_ingresses(&wl, &[], dialect.as_ref()).await?;
        }
        info!("Withdrew routes of {}", wl_app);
        Ok(())
    }
}

pub mod networking_error {
    use thiserror::Error;

    use crate::{config::config_error, store::store_error};
    use common::apiclient::apiclient_error;

    #[derive(Error, Debug)]
    pub enum Error {
        #[error("{source}")]
        Client {
            #[from]
            source: apiclient_error::Error,
        },

        #[error("{source}")]
        Store {
            #[from]
            source: store_error::Error,
        },

        #[error("{source}")]
        Config {
            #[from]
            source: config_error::Error,
        },

        #[error("Failed to render routing object: {source}")]
        Render {
            #[from]
            source: serde_json::Error,
        },

        #[error("Invalid domain: {reason}")]
        InvalidDomain { reason: String },

        #[error("Domain {host}{path_prefix} is already in use")]
        DuplicatedDomain { host: String, path_prefix: String },
    }
}
