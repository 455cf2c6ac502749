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


use std::{fs, path::Path, process::exit, sync::Arc, time::Duration};

use anyhow::{bail, Context, Result};
use clap::Parser;
use env_logger::{Builder, Env, Target};
use futures::StreamExt;
use kube::Client;
use log::{debug, error, info, warn};
use tokio::signal;

mod commands;

use common::apiclient::ClusterClient;
use workloads::{
    addr::AddrAllocator,
    build::blob::HmacPresigner,
    config::ControlPlaneConfig,
    deploy::{DeployRequest, DeployRunner},
    entities::{AdvancedOptions, Application, Environment, JobStatus, VersionInfo, WlApp},
    networking::domains::{validate_domain_payload, DomainPayload},
    processes::ProcessWatcher,
    store::Store,
    stream::{EventHub, EventKind, StreamEvent},
};

use crate::commands::{Cli, Commands, DeployArgs, ProcessesCommand};

fn load_config(path: &Path) -> Result<ControlPlaneConfig> {
    let config = ControlPlaneConfig::from_file(path)?;
    config.validate()?;
    debug!("Loaded config from {}", path.display());
    Ok(config)
}

fn load_store(snapshot: Option<&Path>) -> Result<Store> {
    match snapshot {
        Some(path) if path.exists() => Ok(Store::load_snapshot(path)?),
        _ => Ok(Store::new()),
    }
}

fn load_application(path: &Path) -> Result<Application> {
    let content = fs::read_to_string(path).with_context(|| format!("Failed to read {}", path.display()))?;
    Ok(Application::from_yaml(&content)?)
}

/// Registers the application and returns the workload of `module` in `env`.
async fn register(
    store: &Store,
    config: &ControlPlaneConfig,
    app: Application,
    module: &str,
    env: Environment,
) -> Result<WlApp> {
    let cluster = config.default_cluster()?;
    let wl = WlApp::new(&app, app.module(module)?, env, &cluster.name, &cluster.tenant_id);
    store.put_application(app).await;
    store.put_wl_app(wl.clone()).await;
    Ok(wl)
}

fn print_event(event: &StreamEvent) {
    match event.event {
        EventKind::Heartbeat | EventKind::Close => {},
        EventKind::Title => println!("==> {}", event.data["title"].as_str().unwrap_or_default()),
        EventKind::Message | EventKind::Error => println!("{}", event.data["line"].as_str().unwrap_or_default()),
        _ => println!("[{}] {}", event.event, event.data),
    }
}

async fn deploy(config: ControlPlaneConfig, args: DeployArgs) -> Result<()> {
    let DeployArgs { file, module, env, version_name, revision, source, build_only, snapshot } = args;
    let store = Arc::new(load_store(snapshot.as_deref())?);
    let app = load_application(&file)?;
    let app_code = app.code.clone();
    register(&store, &config, app, &module, env).await?;

    let client = ClusterClient::new(Client::try_default().await?);
    let hub = Arc::new(EventHub::new());
    let config = Arc::new(config);
    let blob = Arc::new(HmacPresigner::new(&config.blob_store));
    let runner = Arc::new(DeployRunner::new(client, store.clone(), hub.clone(), config, blob));
    for id in runner.recover().await? {
        warn!("Deployment {} was left unfinished, resuming it first", id);
        runner.run(id).await?;
    }

    let request = DeployRequest {
        app_code,
        module_name: module,
        env,
        operator: "paasctl".to_string(),
        version_info: VersionInfo { version_type: "branch".to_string(), version_name, revision },
        source_tar_path: source,
        advanced_options: AdvancedOptions { build_only, ..Default::default() },
        processes: None,
    };
    let deployment = runner.create_deployment(request).await?;
    info!("Deployment {} created", deployment.id);
    let mut events = hub.subscribe(&deployment.id.to_string(), None, false).await?;
    let task = {
        let runner = runner.clone();
        let id = deployment.id;
        tokio::spawn(async move { runner.run(id).await })
    };

    let mut cancelled = false;
    loop {
        tokio::select! {
            event = events.next() => match event {
                Some(event) => print_event(&event),
                None => break,
            },
            _ = signal::ctrl_c(), if !cancelled => {
                cancelled = true;
                info!("Interrupting deployment {}", deployment.id);
                runner.cancel_deployment(deployment.id).await?;
            },
        }
    }
    let deployment = task.await??;
    if let Some(path) = snapshot {
        store.save_snapshot(&path).await?;
    }
    if deployment.status != JobStatus::Successful {
        bail!("Deployment {} {}: {}", deployment.id, deployment.status, deployment.err_detail);
    }
    info!("Deployment {} finished successfully", deployment.id);
    Ok(())
}

async fn run(cli: Cli) -> Result<()> {
    let config = load_config(&cli.config)?;
    match cli.commands {
        Commands::Addrs { target, non_default, exposed_type, include_reserved } => {
            let cluster = config.default_cluster()?;
            let allocator =
                AddrAllocator::new(&target.app, &target.module, target.env, !non_default, &cluster.ingress_config);
            for addr in allocator.list_available(exposed_type.into(), include_reserved) {
                println!("{}", addr.as_string());
            }
        },
        Commands::DomainCheck { host, path_prefix, env } => {
            let cluster = config.default_cluster()?;
            let payload = DomainPayload { host, path_prefix, https_enabled: false };
            let valid = validate_domain_payload(&payload, env, &[], &cluster.ingress_config.app_root_domains, None)?;
            println!("{}{} is available", valid.host, valid.path_prefix);
        },
        Commands::Deploy(args) => deploy(config, args).await?,
        Commands::Processes { command } => {
            let store = Store::new();
            let client = ClusterClient::new(Client::try_default().await?);
            let watcher = ProcessWatcher::new(client);
            match command {
                ProcessesCommand::List { file, target } => {
                    let wl = register(&store, &config, load_application(&file)?, &target.module, target.env).await?;
                    let snapshot = watcher.list(&wl, &store, None).await?;
                    println!("{}", serde_json::to_string_pretty(&snapshot)?);
                },
                ProcessesCommand::Watch { file, target, timeout } => {
                    let wl = register(&store, &config, load_application(&file)?, &target.module, target.env).await?;
                    let snapshot = watcher.list(&wl, &store, None).await?;
                    let timeout = Duration::from_secs(timeout);
                    let mut events = watcher.watch(&wl, &snapshot.rv_proc, &snapshot.rv_inst, timeout).await;
                    while let Some(event) = events.next().await {
                        println!("{}", serde_json::to_string(&event)?);
                    }
                },
            }
        },
    }
    Ok(())
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let default_log_level: &str = if cli.debug { "debug" } else { "info" };
    Builder::from_env(Env::default().default_filter_or(default_log_level)).target(Target::Stdout).init();

    if let Err(e) = run(cli).await {
        error!("{:#}", e);
        exit(1);
    }
}

#[cfg(test)]
mod test {
    use super::*;

    const APP: &str = r#"
code: foo
modules:
  - name: default
    is_default: true
    processes:
      - name: web
        command: gunicorn wsgi
"#;

    const CONFIG: &str = r#"
[[clusters]]
name = "main"
is_default = true
"#;

    #[tokio::test]
    async fn test_register_from_files() {
        let dir = tempfile::tempdir().unwrap();
        let app_path = dir.path().join("app.yaml");
        let config_path = dir.path().join("config.toml");
        fs::write(&app_path, APP).unwrap();
        fs::write(&config_path, CONFIG).unwrap();

        let config = load_config(&config_path).unwrap();
        let store = load_store(Some(&dir.path().join("missing.json"))).unwrap();
        let wl = register(&store, &config, load_application(&app_path).unwrap(), "default", Environment::Stag)
            .await
            .unwrap();
        assert_eq!(wl.cluster_name, "main");
        assert_eq!(store.wl_app(&wl.name).await.unwrap().app_code, "foo");
    }

    #[test]
    fn test_missing_application_file() {
        let err = load_application(Path::new("/nonexistent/app.yaml")).unwrap_err();
        assert!(err.to_string().contains("/nonexistent/app.yaml"));
    }
}
