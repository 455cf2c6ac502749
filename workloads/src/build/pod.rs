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

use base64::{engine::general_purpose::STANDARD, Engine as _};
use k8s_openapi::api::core::v1::Toleration;
use serde_json::{json, Value};

use common::values::{CATEGORY_SLUG_BUILDER, LABEL_CATEGORY, LABEL_WL_APP};

use super::{
    blob::{BlobMethod, BlobStore, SOURCE_URL_TTL},
    build_error::Error,
};
use crate::{
    config::{ControlPlaneConfig, RegistryConfig},
    entities::{BuildMethod, BuildProcess, Module, WlApp},
    phases::presets::CNB_BUILDER_IMAGE,
};

pub fn builder_pod_name(wl_app: &str) -> String {
    format!("slug-builder--{}", wl_app)
}

pub fn resolve_builder_image(module: &Module, config: &ControlPlaneConfig) -> String {
    match (&module.builder_image, module.build_method) {
        (Some(image), _) => image.clone(),
        (None, BuildMethod::Cnb) => CNB_BUILDER_IMAGE.to_string(),
        (None, _) => config.builder.default_image.clone(),
    }
}

pub fn image_repository(wl: &WlApp, module: &Module, registry: &RegistryConfig) -> String {
    match &module.image_repository {
        Some(repo) => repo.clone(),
        None => format!("{}/{}/{}/{}", registry.host, registry.namespace, wl.app_code, wl.module_name),
    }
}

pub fn output_image(repository: &str, bp: &BuildProcess) -> String {
    let version = bp.version_info.version_name.replace('/', "-");
    let version = if version.is_empty() { "latest".to_string() } else { version };
    format!("{}:{}-{}", repository, version, bp.generation)
}

pub fn slug_key(wl_app: &str, generation: u64) -> String {
    format!("{}/slug/{}.tgz", wl_app, generation)
}

fn cache_key(wl_app: &str) -> String {
    format!("{}/cache", wl_app)
}

/// `DOCKER_CONFIG_JSON` and `CNB_REGISTRY_AUTH` payloads, base64 encoded.
fn registry_auth(registry: &RegistryConfig) -> Option<(String, String)> {
    if registry.username.is_empty() {
        return None;
    }
    let basic = STANDARD.encode(format!("{}:{}", registry.username, registry.password));
    let docker = json!({ "auths": { registry.host.as_str(): { "auth": basic } } });
    let cnb = json!({ registry.host.as_str(): format!("Basic {}", basic) });
    Some((STANDARD.encode(docker.to_string()), STANDARD.encode(cnb.to_string())))
}

pub struct BuilderInput<'a> {
    pub wl: &'a WlApp,
    pub module: &'a Module,
    pub bp: &'a BuildProcess,
    pub extra_envs: &'a BTreeMap<String, String>,
    pub invalidate_cache: bool,
}

/// Environment handed to the builder container.
pub fn builder_envs(
    blob: &dyn BlobStore,
    config: &ControlPlaneConfig,
    input: &BuilderInput<'_>,
) -> Result<BTreeMap<String, String>, Error> {
    let wl_app = input.wl.name.as_str();
    let mut envs = input.extra_envs.clone();
    envs.insert("SOURCE_GET_URL".into(), blob.presign(BlobMethod::Get, &input.bp.source_tar_path, SOURCE_URL_TTL)?);
    if !input.invalidate_cache {
        envs.insert("CACHE_GET_URL".into(), blob.presign(BlobMethod::Get, &cache_key(wl_app), SOURCE_URL_TTL)?);
    }
    envs.insert("CACHE_SET_URL".into(), blob.presign(BlobMethod::Put, &cache_key(wl_app), SOURCE_URL_TTL)?);

    match input.module.build_method {
        BuildMethod::Buildpack => {
            let slug = slug_key(wl_app, input.bp.generation);
            envs.insert("SLUG_SET_URL".into(), blob.presign(BlobMethod::Put, &slug, SOURCE_URL_TTL)?);
        },
        BuildMethod::Cnb | BuildMethod::Dockerfile => {
            let repository = image_repository(input.wl, input.module, &config.registry);
            envs.insert("OUTPUT_IMAGE".into(), output_image(&repository, input.bp));
            envs.insert("CACHE_REPO".into(), format!("{}/cache", repository));
            envs.insert("CACHE_IMAGE".into(), format!("{}/cache:latest", repository));
            if let Some((docker, cnb)) = registry_auth(&config.registry) {
                match input.module.build_method {
                    BuildMethod::Dockerfile => envs.insert("DOCKER_CONFIG_JSON".into(), docker),
                    _ => envs.insert("CNB_REGISTRY_AUTH".into(), cnb),
                };
            }
        },
        BuildMethod::CustomImage => {
            return Err(Error::UnsupportedMethod { method: format!("{:?}", input.module.build_method) })
        },
    }

    if !input.module.buildpacks.is_empty() {
        let required: Vec<String> = input.module.buildpacks.iter().map(|bp| bp.to_string()).collect();
        envs.insert("REQUIRED_BUILDPACKS".into(), required.join(";"));
    }
    Ok(envs)
}

pub fn builder_pod_manifest(
    name: &str,
    wl: &WlApp,
    image: &str,
    envs: &BTreeMap<String, String>,
    config: &ControlPlaneConfig,
    cluster_tolerations: &[Toleration],
) -> Result<Value, Error> {
    let env: Vec<Value> = envs.iter().map(|(k, v)| json!({ "name": k, "value": v })).collect();
    let pull_secrets: Vec<Value> = config.builder.image_pull_secrets.iter().map(|s| json!({ "name": s })).collect();
    let tolerations: Vec<&Toleration> = config.builder.tolerations.iter().chain(cluster_tolerations).collect();
    Ok(json!({
        "apiVersion": "v1",
        "kind": "Pod",
        "metadata": {
            "name": name,
            "namespace": wl.namespace,
            "labels": { LABEL_CATEGORY: CATEGORY_SLUG_BUILDER, LABEL_WL_APP: wl.name },
        },
        "spec": {
            "restartPolicy": "Never",
            "containers": [{
                "name": name,
                "image": image,
                "imagePullPolicy": "IfNotPresent",
                "env": env,
                "securityContext": { "privileged": true },
            }],
            "imagePullSecrets": pull_secrets,
            "nodeSelector": config.builder.node_selector,
            "tolerations": serde_json::to_value(tolerations)?,
        },
    }))
}
