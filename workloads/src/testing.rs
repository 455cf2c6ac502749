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

//! Fixtures shared by the unit tests of this crate.

use crate::{
    config::{ClusterConfig, ControlPlaneConfig, DomainConfig, IngressConfig, ReleaseConfig},
    entities::{Application, Environment, WlApp},
    store::Store,
};

pub(crate) fn config(controller_version: &str) -> ControlPlaneConfig {
    let mut config = ControlPlaneConfig {
        region: "default".into(),
        clusters: vec![ClusterConfig {
            name: "main".into(),
            is_default: true,
            tenant_id: "default".into(),
            nginx_controller_version: controller_version.into(),
            ingress_config: IngressConfig {
                app_root_domains: vec![DomainConfig { name: "example.com".into(), https_enabled: false, reserved: false }],
                sub_path_domains: vec![DomainConfig { name: "example.org".into(), https_enabled: true, reserved: false }],
                ..Default::default()
            },
            builder_tolerations: vec![],
        }],
        release: ReleaseConfig {
            poll_interval_ms: 10,
            ready_timeout_secs: 5,
            hook_timeout_secs: 5,
            wait_default_sa_secs: 1,
            operator_runs_hooks: false,
        },
        ..Default::default()
    };
    config.builder.pod_poll_interval_ms = 10;
    config.registry.host = "mirrors.example.com".into();
    config.registry.namespace = "bkapps".into();
    config.blob_store.secret_key = "s3cr3t".into();
    config
}

pub(crate) const APP_DESCRIPTION: &str = r#"
code: foo
type: {type}
modules:
  - name: default
    is_default: true
    build_method: {method}
    buildpacks:
      - type: tar
        name: bk-buildpack-python
        url: http://blobstore.local/buildpacks/python.tar
        version: v213
    processes:
      - name: web
        command: gunicorn wsgi -b :5000
        replicas: 2
        target_port: 5000
      - name: worker
        command: celery worker
    env_vars:
      FOO: bar
    pre_release_hook:
      command: ["python"]
      args: ["manage.py", "migrate"]
    mounts:
      - name: settings
        mountPath: /app/settings
        source:
          configMap:
            name: foo-settings
    mount_configs:
      foo-settings:
        local.py: "DEBUG = False"
"#;

pub(crate) fn application(cloud_native: bool, build_method: &str) -> Application {
    let app_type = if cloud_native { "cloud_native" } else { "default" };
    let description = APP_DESCRIPTION.replace("{type}", app_type).replace("{method}", build_method);
    match Application::from_yaml(&description) {
        Ok(app) => app,
        Err(e) => panic!("invalid fixture: {}", e),
    }
}

pub(crate) async fn seed_with(store: &Store, app: Application) -> WlApp {
    let module = app.default_module().cloned();
    let module = match module {
        Some(module) => module,
        None => panic!("fixture has no default module"),
    };
    let wl = WlApp::new(&app, &module, Environment::Prod, "main", "default");
    store.put_application(app).await;
    store.put_wl_app(wl.clone()).await;
    wl
}

pub(crate) async fn seed(store: &Store, cloud_native: bool) -> WlApp {
    seed_with(store, application(cloud_native, "BUILDPACK")).await
}
