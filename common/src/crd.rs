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

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

#[derive(CustomResource, Debug, Clone, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "paas.bk.tencent.com",
    version = "v1alpha2",
    kind = "BkApp",
    plural = "bkapps",
    singular = "bkapp",
    status = "BkAppStatus",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct BkAppSpec {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub build: Option<BkAppBuildConfig>,
    pub processes: Vec<BkAppProcess>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hooks: Option<BkAppHooks>,
    #[serde(default)]
    pub configuration: AppEnvConfig,
    #[serde(default)]
    pub addons: Vec<Addon>,
    #[serde(default)]
    pub mounts: Vec<Mount>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub svc_discovery: Option<SvcDiscConfig>,
}

#[derive(Clone, Default, Deserialize, Serialize, Debug, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct BkAppBuildConfig {
    pub image: Option<String>,
    pub image_pull_policy: Option<String>,
    pub image_credentials_name: Option<String>,
}

#[derive(Clone, Default, Deserialize, Serialize, Debug, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct BkAppProcess {
    pub name: String,
    pub replicas: i32,
    pub res_quota_plan: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
    #[serde(default)]
    pub command: Vec<String>,
    #[serde(default)]
    pub args: Vec<String>,
    pub target_port: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub probes: Option<ProbeSet>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub services: Option<Vec<ProcService>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub autoscaling: Option<AutoscalingSpec>,
}

#[derive(Clone, Default, Deserialize, Serialize, Debug, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ProbeSet {
    pub liveness: Option<Probe>,
    pub readiness: Option<Probe>,
    pub startup: Option<Probe>,
}

#[derive(Clone, Default, Deserialize, Serialize, Debug, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Probe {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exec: Option<ExecAction>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub http_get: Option<HttpGetAction>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tcp_socket: Option<TcpSocketAction>,
    pub initial_delay_seconds: i32,
    pub timeout_seconds: i32,
    pub period_seconds: i32,
    pub success_threshold: i32,
    pub failure_threshold: i32,
}

#[derive(Clone, Default, Deserialize, Serialize, Debug, PartialEq, JsonSchema)]
pub struct ExecAction {
    pub command: Vec<String>,
}

#[derive(Clone, Default, Deserialize, Serialize, Debug, PartialEq, JsonSchema)]
pub struct HttpGetAction {
    pub path: String,
    pub port: i32,
}

#[derive(Clone, Default, Deserialize, Serialize, Debug, PartialEq, JsonSchema)]
pub struct TcpSocketAction {
    pub port: i32,
}

#[derive(Clone, Default, Deserialize, Serialize, Debug, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ProcService {
    pub name: String,
    pub protocol: String,
    pub target_port: i32,
    pub port: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exposed_type: Option<ExposedType>,
}

#[derive(Clone, Default, Deserialize, Serialize, Debug, PartialEq, JsonSchema)]
pub struct ExposedType {
    pub name: String,
}

#[derive(Clone, Default, Deserialize, Serialize, Debug, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct AutoscalingSpec {
    pub min_replicas: i32,
    pub max_replicas: i32,
    pub policy: String,
}

#[derive(Clone, Default, Deserialize, Serialize, Debug, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct BkAppHooks {
    pub pre_release: Option<BkAppHook>,
}

#[derive(Clone, Default, Deserialize, Serialize, Debug, PartialEq, JsonSchema)]
pub struct BkAppHook {
    pub command: Vec<String>,
    pub args: Vec<String>,
}

#[derive(Clone, Default, Deserialize, Serialize, Debug, PartialEq, JsonSchema)]
pub struct AppEnvConfig {
    pub env: Vec<EnvVar>,
}

#[derive(Clone, Default, Deserialize, Serialize, Debug, PartialEq, Eq, JsonSchema)]
pub struct EnvVar {
    pub name: String,
    pub value: String,
}

#[derive(Clone, Default, Deserialize, Serialize, Debug, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Addon {
    pub name: String,
    #[serde(default)]
    pub specs: Vec<AddonSpec>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub shared_from_module: Option<String>,
}

#[derive(Clone, Default, Deserialize, Serialize, Debug, PartialEq, JsonSchema)]
pub struct AddonSpec {
    pub name: String,
    pub value: String,
}

#[derive(Clone, Default, Deserialize, Serialize, Debug, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Mount {
    pub name: String,
    pub mount_path: String,
    pub source: MountSource,
}

#[derive(Clone, Default, Deserialize, Serialize, Debug, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct MountSource {
    pub config_map: Option<ConfigMapSource>,
}

#[derive(Clone, Default, Deserialize, Serialize, Debug, PartialEq, JsonSchema)]
pub struct ConfigMapSource {
    pub name: String,
}

#[derive(Clone, Default, Deserialize, Serialize, Debug, PartialEq, JsonSchema)]
pub struct SvcDiscConfig {
    #[serde(rename = "bkSaaS")]
    pub bk_saas: Vec<SvcDiscEntryBkSaaS>,
}

#[derive(Clone, Default, Deserialize, Serialize, Debug, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct SvcDiscEntryBkSaaS {
    pub bk_app_code: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub module_name: Option<String>,
}

#[derive(Clone, Default, Deserialize, Serialize, Debug, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct BkAppStatus {
    pub phase: Option<String>,
    #[serde(default)]
    pub conditions: Vec<BkAppCondition>,
    pub observed_generation: Option<i64>,
    pub deploy_id: Option<String>,
}

#[derive(Clone, Default, Deserialize, Serialize, Debug, PartialEq, JsonSchema)]
pub struct BkAppCondition {
    #[serde(rename = "type")]
    pub type_: String,
    pub status: String,
    #[serde(default)]
    pub reason: String,
    #[serde(default)]
    pub message: String,
}

#[derive(CustomResource, Debug, Clone, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "paas.bk.tencent.com",
    version = "v1alpha1",
    kind = "DomainGroupMapping",
    plural = "domaingroupmappings",
    singular = "domaingroupmapping",
    namespaced
)]
pub struct DomainGroupMappingSpec {
    #[serde(rename = "ref")]
    pub ref_: MappingRef,
    pub data: Vec<DomainGroup>,
}

#[derive(Clone, Default, Deserialize, Serialize, Debug, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct MappingRef {
    pub api_version: String,
    pub kind: String,
    pub name: String,
}

#[derive(Clone, Default, Deserialize, Serialize, Debug, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct DomainGroup {
    pub source_type: String,
    pub domains: Vec<MappedDomain>,
}

#[derive(Clone, Default, Deserialize, Serialize, Debug, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct MappedDomain {
    pub host: String,
    pub path_prefix_list: Vec<String>,
    pub https_enabled: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tls_secret_name: Option<String>,
}
