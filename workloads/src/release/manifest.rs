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

use serde_json::{json, Value};

use common::{
    crd::{AppEnvConfig, BkApp, BkAppBuildConfig, BkAppHook, BkAppHooks, BkAppProcess, BkAppSpec, EnvVar, SvcDiscConfig},
    values::{
        ANNO_DEPLOY_ID, ANNO_PROC_SERVICES_FEATURE, CATEGORY_HOOK, LABEL_APP_CODE, LABEL_CATEGORY, LABEL_ENVIRONMENT,
        LABEL_MODULE_NAME, LABEL_PROCESS_TYPE, LABEL_VERSION, LABEL_WL_APP,
    },
};

use super::release_error::Error;
use crate::{
    entities::{ArtifactType, Build, Deployment, HookSpec, Module, ProcessSpec, Release, WlApp},
    networking::{web_service_name, WEB_PROCESS, WEB_SERVICE_PORT},
};

pub const DEFAULT_SLUGRUNNER_IMAGE: &str = "bkpaas/slugrunner:heroku-bionic-v1";
pub const DEFAULT_TARGET_PORT: i32 = 5000;

/// What the processes run: an image, or the slug runner pointed at a slug.
#[derive(Debug, Clone, PartialEq)]
pub struct Runtime {
    pub image: String,
    pub envs: BTreeMap<String, String>,
    pub from_slug: bool,
}

impl Runtime {
    pub fn of(build: &Build) -> Result<Self, Error> {
        match build.artifact_type {
            ArtifactType::Image => {
                let image = build
                    .image
                    .clone()
                    .ok_or_else(|| Error::Invalid { reason: format!("build {} has no image", build.id) })?;
                Ok(Runtime { image, envs: build.env_variables.clone(), from_slug: false })
            },
            ArtifactType::Slug => {
                let slug_url = build
                    .slug_get_url
                    .clone()
                    .ok_or_else(|| Error::Invalid { reason: format!("build {} has no slug url", build.id) })?;
                let mut envs = build.env_variables.clone();
                envs.insert("SLUG_URL".to_string(), slug_url);
                Ok(Runtime { image: DEFAULT_SLUGRUNNER_IMAGE.to_string(), envs, from_slug: true })
            },
        }
    }

    /// Command and args of a process.
    pub fn command_of(&self, name: &str, command: &str, args: &[String]) -> (Vec<String>, Vec<String>) {
        if self.from_slug {
            (Vec::new(), vec!["start".to_string(), name.to_string()])
        } else {
            (command.split_whitespace().map(String::from).collect(), args.to_vec())
        }
    }
}

pub fn builtin_envs(wl: &WlApp, deployment: &Deployment) -> BTreeMap<String, String> {
    BTreeMap::from([
        ("BKPAAS_APP_ID".to_string(), wl.app_code.clone()),
        ("BKPAAS_APP_MODULE_NAME".to_string(), wl.module_name.clone()),
        ("BKPAAS_ENVIRONMENT".to_string(), wl.env.to_string()),
        ("BKPAAS_ENGINE_REGION".to_string(), wl.region.clone()),
        ("BKPAAS_DEPLOY_ID".to_string(), deployment.id.to_string()),
    ])
}

/// User variables first, built-in ones win on collision.
pub fn release_envs(
    wl: &WlApp,
    module: &Module,
    deployment: &Deployment,
    runtime: &Runtime,
) -> BTreeMap<String, String> {
    let mut envs = module.env_vars.clone();
    envs.extend(runtime.envs.clone());
    envs.extend(builtin_envs(wl, deployment));
    envs
}

fn labels(wl: &WlApp) -> BTreeMap<String, String> {
    BTreeMap::from([
        (LABEL_WL_APP.to_string(), wl.name.clone()),
        (LABEL_APP_CODE.to_string(), wl.app_code.clone()),
        (LABEL_MODULE_NAME.to_string(), wl.module_name.clone()),
        (LABEL_ENVIRONMENT.to_string(), wl.env.to_string()),
    ])
}

pub struct BkAppInput<'a> {
    pub wl: &'a WlApp,
    pub module: &'a Module,
    pub deployment: &'a Deployment,
    pub runtime: &'a Runtime,
    pub include_hooks: bool,
}

pub fn bkapp_manifest(input: &BkAppInput<'_>) -> Result<Value, Error> {
    let BkAppInput { wl, module, deployment, runtime, .. } = input;
    let processes = deployment
        .processes
        .values()
        .map(|p| {
            let (command, args) = runtime.command_of(&p.name, &p.command, &p.args);
            BkAppProcess {
                name: p.name.clone(),
                replicas: p.replicas,
                res_quota_plan: Some(p.plan.clone()),
                image: Some(runtime.image.clone()),
                command,
                args,
                target_port: p.target_port,
                probes: p.probes.clone(),
                services: p.services.clone(),
                autoscaling: p.autoscaling.clone(),
            }
        })
        .collect();
    let hooks = match (&module.pre_release_hook, input.include_hooks) {
        (Some(hook), true) => {
            Some(BkAppHooks { pre_release: Some(BkAppHook { command: hook.command.clone(), args: hook.args.clone() }) })
        },
        _ => None,
    };
    let env = release_envs(wl, module, deployment, runtime)
        .into_iter()
        .map(|(name, value)| EnvVar { name, value })
        .collect();
    let svc_discovery =
        (!module.svc_discovery.is_empty()).then(|| SvcDiscConfig { bk_saas: module.svc_discovery.clone() });
    let services_enabled = deployment.processes.values().any(|p| p.services.is_some());

    let spec = BkAppSpec {
        build: Some(BkAppBuildConfig {
            image: Some(runtime.image.clone()),
            image_pull_policy: deployment.advanced_options.image_pull_policy.clone(),
            image_credentials_name: None,
        }),
        processes,
        hooks,
        configuration: AppEnvConfig { env },
        addons: module.addons.clone(),
        mounts: module.mounts.clone(),
        svc_discovery,
    };
    let mut bkapp = BkApp::new(&wl.bkapp_name(), spec);
    bkapp.metadata.namespace = Some(wl.namespace.clone());
    bkapp.metadata.labels = Some(labels(wl));
    bkapp.metadata.annotations = Some(BTreeMap::from([
        (ANNO_DEPLOY_ID.to_string(), deployment.id.to_string()),
        (ANNO_PROC_SERVICES_FEATURE.to_string(), services_enabled.to_string()),
    ]));
    Ok(serde_json::to_value(&bkapp)?)
}

pub fn config_map(wl: &WlApp, name: &str, data: &BTreeMap<String, String>) -> Value {
    json!({
        "apiVersion": "v1",
        "kind": "ConfigMap",
        "metadata": { "name": name, "namespace": wl.namespace, "labels": labels(wl) },
        "data": data,
    })
}

pub fn svc_discovery_config_map_name(wl: &WlApp) -> String {
    format!("svc-disc-results--{}", wl.bkapp_name())
}

pub fn svc_discovery_config_map(wl: &WlApp, module: &Module) -> Result<Option<Value>, Error> {
    if module.svc_discovery.is_empty() {
        return Ok(None);
    }
    let data = BTreeMap::from([("bkSaaS".to_string(), serde_json::to_string(&module.svc_discovery)?)]);
    Ok(Some(config_map(wl, &svc_discovery_config_map_name(wl), &data)))
}

pub fn hook_pod_name(wl: &WlApp) -> String {
    format!("pre-release-hook--{}", wl.bkapp_name())
}

pub fn hook_pod_manifest(wl: &WlApp, hook: &HookSpec, runtime: &Runtime, envs: &BTreeMap<String, String>) -> Value {
    let env: Vec<Value> = envs.iter().map(|(k, v)| json!({ "name": k, "value": v })).collect();
    let (command, args) = if runtime.from_slug {
        let mut args = vec!["start".to_string()];
        args.extend(hook.command.iter().chain(&hook.args).cloned());
        (Vec::new(), args)
    } else {
        (hook.command.clone(), hook.args.clone())
    };
    let mut pod_labels = labels(wl);
    pod_labels.insert(LABEL_CATEGORY.to_string(), CATEGORY_HOOK.to_string());
    json!({
        "apiVersion": "v1",
        "kind": "Pod",
        "metadata": { "name": hook_pod_name(wl), "namespace": wl.namespace, "labels": pod_labels },
        "spec": {
            "restartPolicy": "Never",
            "containers": [{
                "name": "hook",
                "image": runtime.image,
                "command": command,
                "args": args,
                "env": env,
            }],
        },
    })
}

pub fn process_resource_name(wl: &WlApp, process: &str) -> String {
    format!("{}--{}", wl.bkapp_name(), process)
}

pub struct ProcessInput<'a> {
    pub wl: &'a WlApp,
    pub spec: &'a ProcessSpec,
    pub release: &'a Release,
    pub runtime: &'a Runtime,
    pub envs: &'a BTreeMap<String, String>,
    pub image_pull_policy: Option<&'a str>,
}

/// Deployment running one process type of a legacy workload.
pub fn deployment_manifest(input: &ProcessInput<'_>) -> Value {
    let ProcessInput { wl, spec, release, runtime, envs, image_pull_policy } = input;
    let (command, args) = runtime.command_of(&spec.name, &spec.command, &[]);
    let env: Vec<Value> = envs.iter().map(|(k, v)| json!({ "name": k, "value": v })).collect();
    let mut selector = BTreeMap::from([(LABEL_WL_APP.to_string(), wl.name.clone())]);
    selector.insert(LABEL_PROCESS_TYPE.to_string(), spec.name.clone());
    let mut pod_labels = labels(wl);
    pod_labels.insert(LABEL_PROCESS_TYPE.to_string(), spec.name.clone());
    pod_labels.insert(LABEL_VERSION.to_string(), release.version.to_string());

    let mut container = json!({
        "name": spec.name,
        "image": runtime.image,
        "args": args,
        "env": env,
        "imagePullPolicy": image_pull_policy.unwrap_or("IfNotPresent"),
    });
    if !command.is_empty() {
        container["command"] = json!(command);
    }
    if spec.name == WEB_PROCESS {
        container["ports"] = json!([{ "containerPort": DEFAULT_TARGET_PORT }]);
    }
    if let Some(probes) = &spec.probes {
        if let Some(readiness) = &probes.readiness {
            container["readinessProbe"] = json!(readiness);
        }
        if let Some(liveness) = &probes.liveness {
            container["livenessProbe"] = json!(liveness);
        }
    }
    json!({
        "apiVersion": "apps/v1",
        "kind": "Deployment",
        "metadata": {
            "name": process_resource_name(wl, &spec.name),
            "namespace": wl.namespace,
            "labels": pod_labels,
            "annotations": { "bkapp.paas.bk.tencent.com/plan": spec.plan },
        },
        "spec": {
            "replicas": spec.replicas,
            "selector": { "matchLabels": selector },
            "template": {
                "metadata": { "labels": pod_labels },
                "spec": { "containers": [container] },
            },
        },
    })
}

/// Service the web entrances route to.
pub fn web_service_manifest(wl: &WlApp) -> Value {
    json!({
        "apiVersion": "v1",
        "kind": "Service",
        "metadata": { "name": web_service_name(wl), "namespace": wl.namespace, "labels": labels(wl) },
        "spec": {
            "selector": { LABEL_WL_APP: wl.name, LABEL_PROCESS_TYPE: WEB_PROCESS },
            "ports": [{
                "name": "http",
                "port": WEB_SERVICE_PORT,
                "targetPort": DEFAULT_TARGET_PORT,
                "protocol": "TCP",
            }],
        },
    })
}
