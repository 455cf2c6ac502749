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

use std::{collections::BTreeMap, fmt, str::FromStr};

use common::crd::{Addon, Mount, SvcDiscEntryBkSaaS};
use serde::{Deserialize, Serialize};

use super::{entity_error::Error, process::ProcessTmpl};

pub const MAX_APP_CODE_LEN: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Environment {
    Stag,
    Prod,
}

impl Environment {
    pub fn as_str(&self) -> &'static str {
        match self {
            Environment::Stag => "stag",
            Environment::Prod => "prod",
        }
    }
}

impl fmt::Display for Environment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for Environment {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "stag" => Ok(Environment::Stag),
            "prod" => Ok(Environment::Prod),
            other => Err(Error::UnknownValue { what: "environment".into(), value: other.into() }),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExposedUrlType {
    #[default]
    Subdomain,
    Subpath,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BuildMethod {
    Dockerfile,
    Cnb,
    #[default]
    Buildpack,
    CustomImage,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum AppType {
    /// Processes are released as plain Deployments.
    #[default]
    Default,
    /// Released through a BkApp resource reconciled by the in-cluster operator.
    CloudNative,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Buildpack {
    #[serde(rename = "type")]
    pub type_: String,
    pub name: String,
    pub url: String,
    pub version: String,
}

impl fmt::Display for Buildpack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} {} {}", self.type_, self.name, self.url, self.version)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HookSpec {
    pub command: Vec<String>,
    #[serde(default)]
    pub args: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Module {
    pub name: String,
    #[serde(default)]
    pub is_default: bool,
    #[serde(default)]
    pub exposed_url_type: ExposedUrlType,
    #[serde(default)]
    pub build_method: BuildMethod,
    /// Overrides the configured default builder image.
    #[serde(default)]
    pub builder_image: Option<String>,
    /// Repository of prebuilt images, used by `CUSTOM_IMAGE` modules.
    #[serde(default)]
    pub image_repository: Option<String>,
    #[serde(default)]
    pub buildpacks: Vec<Buildpack>,
    #[serde(default)]
    pub processes: Vec<ProcessTmpl>,
    #[serde(default)]
    pub env_vars: BTreeMap<String, String>,
    #[serde(default)]
    pub pre_release_hook: Option<HookSpec>,
    #[serde(default)]
    pub mounts: Vec<Mount>,
    #[serde(default)]
    pub mount_configs: BTreeMap<String, BTreeMap<String, String>>,
    #[serde(default)]
    pub addons: Vec<Addon>,
    #[serde(default)]
    pub svc_discovery: Vec<SvcDiscEntryBkSaaS>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Application {
    pub code: String,
    #[serde(default)]
    pub name: String,
    #[serde(default = "default_region")]
    pub region: String,
    #[serde(default, rename = "type")]
    pub app_type: AppType,
    pub modules: Vec<Module>,
}

fn default_region() -> String {
    "default".to_string()
}

impl Application {
    pub fn from_yaml(content: &str) -> Result<Self, Error> {
        let app: Application =
            serde_yaml::from_str(content).map_err(|e| Error::Description { message: e.to_string() })?;
        app.validate()?;
        Ok(app)
    }

    pub fn validate(&self) -> Result<(), Error> {
        if self.code.len() > MAX_APP_CODE_LEN || !is_dns_label(&self.code) {
            return Err(Error::validation(
                "code",
                format!("'{}' must be DNS-safe and at most {} characters", self.code, MAX_APP_CODE_LEN),
            ));
        }
        let defaults = self.modules.iter().filter(|m| m.is_default).count();
        if defaults != 1 {
            return Err(Error::validation("modules", format!("expected exactly one default module, found {}", defaults)));
        }
        for module in &self.modules {
            super::process::validate_procfile(&module.processes)?;
        }
        Ok(())
    }

    pub fn module(&self, name: &str) -> Result<&Module, Error> {
        self.modules
            .iter()
            .find(|m| m.name == name)
            .ok_or_else(|| Error::UnknownValue { what: "module".into(), value: name.into() })
    }

    pub fn default_module(&self) -> Option<&Module> {
        self.modules.iter().find(|m| m.is_default)
    }

    pub fn is_cloud_native(&self) -> bool {
        self.app_type == AppType::CloudNative
    }
}

/// Workload handle of one (application, module, environment) slot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WlApp {
    pub name: String,
    pub namespace: String,
    pub region: String,
    pub tenant_id: String,
    pub cluster_name: String,
    pub app_code: String,
    pub module_name: String,
    pub env: Environment,
    pub is_default_module: bool,
}

impl WlApp {
    pub fn new(app: &Application, module: &Module, env: Environment, cluster_name: &str, tenant_id: &str) -> Self {
        let name = engine_app_name(&app.code, &module.name, module.is_default, env);
        WlApp {
            namespace: name.clone(),
            name,
            region: app.region.clone(),
            tenant_id: tenant_id.to_string(),
            cluster_name: cluster_name.to_string(),
            app_code: app.code.clone(),
            module_name: module.name.clone(),
            env,
            is_default_module: module.is_default,
        }
    }

    /// Name shared by the BkApp resource and the process Deployments' app label.
    pub fn bkapp_name(&self) -> String {
        self.name.replace('_', "0us0")
    }
}

fn is_dns_label(value: &str) -> bool {
    value.starts_with(|c: char| c.is_ascii_lowercase())
        && value.chars().all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
}

pub fn engine_app_name(code: &str, module: &str, is_default: bool, env: Environment) -> String {
    let raw = if is_default {
        format!("bkapp-{}-{}", code, env)
    } else {
        format!("bkapp-{}-m-{}-{}", code, module, env)
    };
    raw.to_lowercase().replace('_', "0us0")
}

#[cfg(test)]
mod test {
    use super::*;

    const DESCRIPTION: &str = r#"
code: foo
name: Foo
type: cloud_native
modules:
  - name: default
    is_default: true
    build_method: BUILDPACK
    processes:
      - name: web
        command: gunicorn wsgi -b :5000
        replicas: 1
  - name: api_v2
    exposed_url_type: SUBPATH
    build_method: DOCKERFILE
"#;

    #[test]
    fn test_load_description() {
        let app = Application::from_yaml(DESCRIPTION).unwrap();
        assert!(app.is_cloud_native());
        assert_eq!(app.region, "default");
        assert_eq!(app.default_module().unwrap().name, "default");
        assert_eq!(app.module("api_v2").unwrap().exposed_url_type, ExposedUrlType::Subpath);
        assert!(app.module("missing").is_err());
    }

    #[test]
    fn test_wl_app_names() {
        let app = Application::from_yaml(DESCRIPTION).unwrap();
        let default = WlApp::new(&app, app.module("default").unwrap(), Environment::Prod, "main", "default");
        assert_eq!(default.name, "bkapp-foo-prod");
        assert_eq!(default.namespace, "bkapp-foo-prod");
        let api = WlApp::new(&app, app.module("api_v2").unwrap(), Environment::Stag, "main", "default");
        assert_eq!(api.name, "bkapp-foo-m-api0us0v2-stag");
    }

    #[test]
    fn test_invalid_descriptions() {
        let long = DESCRIPTION.replace("code: foo", "code: a-very-long-application-code");
        assert!(matches!(Application::from_yaml(&long), Err(Error::Validation { .. })));
        let no_default = DESCRIPTION.replace("is_default: true", "is_default: false");
        assert!(matches!(Application::from_yaml(&no_default), Err(Error::Validation { .. })));
        assert!(matches!(Application::from_yaml("code: ["), Err(Error::Description { .. })));
    }
}
