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

use std::collections::BTreeMap;

use common::{
    apiclient::{MergeStrategy, ResourceApi},
    kinds::Kind,
    values::LABEL_WL_APP,
};
use log::{debug, info};
use serde_json::{json, Value};

use super::{
    dialect::IngressDialect, networking_error::Error, web_service_name, Entrance, EntranceSource, IngressSynchronizer,
    WEB_SERVICE_PORT,
};
use crate::{addr::to_dns_safe, entities::WlApp};

const ANNO_REWRITE_TARGET: &str = "nginx.ingress.kubernetes.io/rewrite-target";
const ANNO_SNIPPET: &str = "nginx.ingress.kubernetes.io/configuration-snippet";
const ANNO_USE_REGEX: &str = "nginx.ingress.kubernetes.io/use-regex";
const ANNO_SSL_REDIRECT: &str = "nginx.ingress.kubernetes.io/ssl-redirect";

pub fn ingress_name(wl_app: &WlApp, host: &str) -> String {
    format!("{}--{}", wl_app.bkapp_name(), to_dns_safe(host))
}

/// One Ingress per host, holding every path routed on it.
pub fn render_ingresses(wl_app: &WlApp, entrances: &[Entrance], dialect: &dyn IngressDialect) -> Vec<(String, Value)> {
    let fallback_script_name = entrances
        .iter()
        .filter(|e| e.source == EntranceSource::Subpath)
        .map(|e| e.path_prefix.as_str())
        .min_by_key(|p| p.len());

    let mut by_host: BTreeMap<&str, Vec<&Entrance>> = BTreeMap::new();
    for entrance in entrances {
        by_host.entry(entrance.host.as_str()).or_default().push(entrance);
    }

    by_host
        .into_iter()
        .map(|(host, entrances)| {
            let name = ingress_name(wl_app, host);
            let root_only = entrances.iter().all(|e| e.path_prefix == "/");
            let snippet_path = if root_only { "/" } else { entrances[0].path_prefix.as_str() };
            let mut annotations = json!({
                ANNO_REWRITE_TARGET: dialect.make_rewrite_target(),
                ANNO_SNIPPET: dialect.configuration_snippet(snippet_path, fallback_script_name),
                ANNO_SSL_REDIRECT: entrances.iter().any(|e| e.https_enabled).to_string(),
            });
            if dialect.uses_regex() {
                annotations[ANNO_USE_REGEX] = json!("true");
            }
            let paths: Vec<Value> = entrances
                .iter()
                .map(|e| {
                    json!({
                        "path": dialect.make_location_path(&e.path_prefix),
                        "pathType": "ImplementationSpecific",
                        "backend": {
                            "service": { "name": web_service_name(wl_app), "port": { "number": WEB_SERVICE_PORT } }
                        }
                    })
                })
                .collect();
            let body = json!({
                "apiVersion": "networking.k8s.io/v1",
                "kind": "Ingress",
                "metadata": {
                    "name": name,
                    "namespace": wl_app.namespace,
                    "labels": { LABEL_WL_APP: wl_app.name },
                    "annotations": annotations,
                },
                "spec": {
                    "ingressClassName": "nginx",
                    "rules": [{ "host": host, "http": { "paths": paths } }]
                }
            });
            (name, body)
        })
        .collect()
}

impl<T: ResourceApi> IngressSynchronizer<T> {
    /// Applies the rendered ingresses and deletes the workload's ingresses
    /// that are no longer rendered.
    pub(super) async fn sync_ingresses(
        &self,
        wl_app: &WlApp,
        entrances: &[Entrance],
        dialect: &dyn IngressDialect,
    ) -> Result<(Vec<String>, Vec<String>), Error> {
        debug!("start sync_ingresses for {} with {} dialect", wl_app.name, dialect.name());
        let rendered = render_ingresses(wl_app, entrances, dialect);
        let mut applied = Vec::new();
        for (name, body) in &rendered {
            self.client.create_or_update(Kind::Ingress, name, &wl_app.namespace, body, MergeStrategy::Replace).await?;
            applied.push(name.clone());
        }

        let selector = format!("{}={}", LABEL_WL_APP, wl_app.name);
        let existing = self.client.list(Kind::Ingress, &wl_app.namespace, &selector).await?;
        let mut deleted = Vec::new();
        for obj in existing.items {
            let Some(name) = obj.metadata.name else { continue };
            if !applied.contains(&name) {
                info!("Deleting stale ingress {}/{}", wl_app.namespace, name);
                self.client.delete(Kind::Ingress, &name, &wl_app.namespace, None).await?;
                deleted.push(name);
            }
        }
        Ok((applied, deleted))
    }
}
