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

//! Rolls a built artifact out to the cluster.
//!
//! Cloud-native apps are released by applying a BkApp resource and waiting
//! for its operator to report the app available. Legacy apps get one
//! Deployment per process type plus the routes computed by the networking
//! synchronizer.

pub mod manifest;

use std::{
    collections::{BTreeMap, HashMap},
    sync::Arc,
    time::Duration,
};

use futures::StreamExt;
use k8s_openapi::api::{apps::v1::Deployment as KubeDeployment, core::v1::Pod};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use tokio::{
    sync::Mutex,
    time::{sleep, Instant},
};
use uuid::Uuid;

use common::{
    apiclient::{to_typed, MergeStrategy, ResourceApi},
    crd::{BkApp, BkAppStatus},
    kinds::Kind,
    values::{LABEL_VERSION, LABEL_WL_APP, POD_PHASE_FAILED, POD_PHASE_PENDING, POD_PHASE_SUCCEEDED},
};

use self::{
    manifest::{
        bkapp_manifest, config_map, deployment_manifest, hook_pod_manifest, hook_pod_name, process_resource_name,
        release_envs, svc_discovery_config_map, web_service_manifest, BkAppInput, ProcessInput, Runtime,
    },
    release_error::Error,
};
use crate::{
    config::ControlPlaneConfig,
    entities::{process::DEFAULT_PLAN, Deployment, HookSpec, JobStatus, Module, PhaseType, WlApp},
    networking::{IngressSynchronizer, WEB_PROCESS},
    phases::{
        presets::{STEP_APPLY_MANIFEST, STEP_PRE_RELEASE_HOOK, STEP_WAIT_READY},
        PhaseEngine,
    },
    processes::health::{pod_failure_message, pod_health, pod_phase, scheduling_failure, HealthStatus},
    store::Store,
    stream::EventHub,
};

const BKAPP_RUNNING: &str = "AppRunning";
const BKAPP_FAILED: &str = "AppFailed";
const CONDITION_AVAILABLE: &str = "AppAvailable";

/// Asks a running release to stop, e.g. when a quota is exceeded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReleaseAbort {
    pub reason: String,
    pub is_interrupted: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReleaseOutcome {
    pub status: JobStatus,
    pub err_detail: String,
    pub release_id: Option<Uuid>,
}

impl ReleaseOutcome {
    fn succeeded(release_id: Uuid) -> Self {
        ReleaseOutcome { status: JobStatus::Successful, err_detail: String::new(), release_id: Some(release_id) }
    }

    fn failed(reason: impl Into<String>, release_id: Option<Uuid>) -> Self {
        ReleaseOutcome { status: JobStatus::Failed, err_detail: reason.into(), release_id }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BkAppHealth {
    Ready,
    Progressing,
    Error(String),
}

/// Reads the operator's verdict. Status left by another deployment counts as progressing.
pub fn bkapp_health(status: &BkAppStatus, deploy_id: Uuid) -> BkAppHealth {
    if status.deploy_id.as_deref().map_or(false, |id| id != deploy_id.to_string()) {
        return BkAppHealth::Progressing;
    }
    match status.phase.as_deref() {
        Some(BKAPP_RUNNING)
            if status.conditions.iter().any(|c| c.type_ == CONDITION_AVAILABLE && c.status == "True") =>
        {
            BkAppHealth::Ready
        },
        Some(BKAPP_FAILED) => {
            let messages: Vec<&str> = status
                .conditions
                .iter()
                .filter(|c| c.status == "False" && !c.message.is_empty())
                .map(|c| c.message.as_str())
                .collect();
            if messages.is_empty() {
                BkAppHealth::Error("app failed without a reported reason".to_string())
            } else {
                BkAppHealth::Error(messages.join("; "))
            }
        },
        _ => BkAppHealth::Progressing,
    }
}

struct ReleaseContext {
    deployment: Deployment,
    wl: WlApp,
    module: Module,
    runtime: Runtime,
    build_id: Uuid,
}

pub struct ReleaseCoordinator<T: ResourceApi> {
    client: T,
    store: Arc<Store>,
    hub: Arc<EventHub>,
    config: Arc<ControlPlaneConfig>,
    networking: IngressSynchronizer<T>,
    engine: PhaseEngine,
    aborts: Mutex<HashMap<Uuid, ReleaseAbort>>,
}

impl<T: ResourceApi> ReleaseCoordinator<T> {
    pub fn new(client: T, store: Arc<Store>, hub: Arc<EventHub>, config: Arc<ControlPlaneConfig>) -> Self {
        let networking = IngressSynchronizer::new(client.clone(), store.clone(), config.clone());
        let engine = PhaseEngine::new(store.clone(), hub.clone());
        ReleaseCoordinator { client, store, hub, config, networking, engine, aborts: Mutex::new(HashMap::new()) }
    }

    /// Releases the build bound to the deployment and waits for the outcome.
    pub async fn release(&self, deployment_id: Uuid) -> Result<ReleaseOutcome, Error> {
        debug!("start release of deployment {}", deployment_id);
        let result = self.run_release(deployment_id).await;
        self.forget(deployment_id).await;
        let outcome = result?;
        info!("Release of deployment {} is {} {}", deployment_id, outcome.status, outcome.err_detail);
        Ok(outcome)
    }

    async fn run_release(&self, deployment_id: Uuid) -> Result<ReleaseOutcome, Error> {
        let ctx = self.context(deployment_id).await?;
        self.sync_process_specs(&ctx).await;
        self.mark(deployment_id, STEP_APPLY_MANIFEST, JobStatus::Pending).await?;
        let wait_sa = Duration::from_secs(self.config.release.wait_default_sa_secs);
        self.client.ensure_namespace(&ctx.wl.namespace, wait_sa).await?;

        let app = self.store.application(&ctx.wl.app_code).await?;
        if app.is_cloud_native() {
            self.release_cloud_native(&ctx).await
        } else {
            self.release_legacy(&ctx).await
        }
    }

    /// Stops a release at its next poll. Finished deployments are left alone.
    pub async fn abort(&self, deployment_id: Uuid, abort: ReleaseAbort) {
        match self.store.deployment(deployment_id).await {
            Ok(deployment) if !deployment.status.is_terminal() => {
                info!("Abort release of deployment {}: {}", deployment_id, abort.reason);
                self.aborts.lock().await.insert(deployment_id, abort);
            },
            Ok(_) => debug!("Deployment {} already finished, abort ignored", deployment_id),
            Err(e) => warn!("Abort of deployment {} ignored: {}", deployment_id, e),
        }
    }

    /// Drops a pending abort of the deployment.
    pub async fn forget(&self, deployment_id: Uuid) {
        self.aborts.lock().await.remove(&deployment_id);
    }

    #[cfg(test)]
    pub(crate) async fn pending_aborts(&self) -> usize {
        self.aborts.lock().await.len()
    }

    async fn context(&self, deployment_id: Uuid) -> Result<ReleaseContext, Error> {
        let deployment = self.store.deployment(deployment_id).await?;
        let wl = self.store.wl_app(&deployment.wl_app).await?;
        let app = self.store.application(&wl.app_code).await?;
        let module = app.module(&wl.module_name).map_err(|e| Error::Invalid { reason: e.to_string() })?.clone();
        let build_id = deployment
            .build_id
            .ok_or_else(|| Error::Invalid { reason: format!("deployment {} has no build", deployment_id) })?;
        let build = self.store.build(build_id).await?;
        let runtime = Runtime::of(&build)?;
        Ok(ReleaseContext { deployment, wl, module, runtime, build_id })
    }

    /// Commands follow the procfile, falling back to the declared processes.
    /// Replicas and plan of existing rows are kept.
    async fn sync_process_specs(&self, ctx: &ReleaseContext) {
        let app = ctx.wl.name.as_str();
        let mut commands: BTreeMap<&str, &str> =
            ctx.deployment.processes.values().map(|p| (p.name.as_str(), p.command.as_str())).collect();
        commands.extend(ctx.deployment.procfile.iter().map(|(name, command)| (name.as_str(), command.as_str())));
        for (name, command) in &commands {
            let tmpl = ctx.deployment.processes.get(*name);
            let replicas = tmpl.map_or(1, |p| p.replicas);
            let plan = tmpl.map_or(DEFAULT_PLAN, |p| p.plan.as_str());
            self.store.upsert_process_spec(app, name, command, replicas, plan).await;
            if let Some(probes) = tmpl.and_then(|p| p.probes.clone()) {
                if let Err(e) = self.store.update_process_spec(app, name, |spec| spec.probes = Some(probes)).await {
                    warn!("Probes of {}/{} not saved: {}", app, name, e);
                }
            }
        }
        let names: Vec<String> = commands.keys().map(|name| name.to_string()).collect();
        self.store.retain_process_specs(app, &names).await;
    }

    async fn release_cloud_native(&self, ctx: &ReleaseContext) -> Result<ReleaseOutcome, Error> {
        let wl = &ctx.wl;
        if let Some(body) = svc_discovery_config_map(wl, &ctx.module)? {
            let name = manifest::svc_discovery_config_map_name(wl);
            self.client.create_or_update(Kind::ConfigMap, &name, &wl.namespace, &body, MergeStrategy::Replace).await?;
        }
        for (name, data) in &ctx.module.mount_configs {
            let body = config_map(wl, name, data);
            self.client.create_or_update(Kind::ConfigMap, name, &wl.namespace, &body, MergeStrategy::Replace).await?;
        }

        let operator_runs_hooks = self.config.release.operator_runs_hooks;
        let input = BkAppInput {
            wl,
            module: &ctx.module,
            deployment: &ctx.deployment,
            runtime: &ctx.runtime,
            include_hooks: operator_runs_hooks,
        };
        let body = bkapp_manifest(&input)?;
        let name = wl.bkapp_name();
        self.client.create_or_update(Kind::BkApp, &name, &wl.namespace, &body, MergeStrategy::Replace).await?;
        self.networking.deploy_networking(&wl.name).await?;
        self.mark(ctx.deployment.id, STEP_APPLY_MANIFEST, JobStatus::Successful).await?;
        let release_id = self.record_release(ctx).await?;

        if !operator_runs_hooks {
            if let Some(failure) = self.pre_release_hook(ctx).await? {
                return Ok(ReleaseOutcome::failed(failure, Some(release_id)));
            }
        }

        self.mark(ctx.deployment.id, STEP_WAIT_READY, JobStatus::Pending).await?;
        let deadline = Instant::now() + Duration::from_secs(self.config.release.ready_timeout_secs);
        loop {
            if let Some(outcome) = self.aborted(ctx.deployment.id, release_id).await? {
                return Ok(outcome);
            }
            let obj = self.client.get(Kind::BkApp, &name, &wl.namespace).await?;
            let bkapp: BkApp = to_typed(&obj)?;
            match bkapp_health(&bkapp.status.unwrap_or_default(), ctx.deployment.id) {
                BkAppHealth::Ready => {
                    self.mark(ctx.deployment.id, STEP_WAIT_READY, JobStatus::Successful).await?;
                    return Ok(ReleaseOutcome::succeeded(release_id));
                },
                BkAppHealth::Error(message) => return Ok(ReleaseOutcome::failed(message, Some(release_id))),
                BkAppHealth::Progressing => {},
            }
            if Instant::now() >= deadline {
                let reason = format!("app not available after {} seconds", self.config.release.ready_timeout_secs);
                return Ok(ReleaseOutcome::failed(reason, Some(release_id)));
            }
            sleep(self.config.release.poll_interval()).await;
        }
    }

    async fn release_legacy(&self, ctx: &ReleaseContext) -> Result<ReleaseOutcome, Error> {
        let wl = &ctx.wl;
        if let Some(failure) = self.pre_release_hook(ctx).await? {
            return Ok(ReleaseOutcome::failed(failure, None));
        }
        self.networking.deploy_networking(&wl.name).await?;
        let release_id = self.record_release(ctx).await?;
        let release = self.store.release(release_id).await?;

        let envs = release_envs(wl, &ctx.module, &ctx.deployment, &ctx.runtime);
        let specs = self.store.process_specs(&wl.name).await;
        for spec in &specs {
            let input = ProcessInput {
                wl,
                spec,
                release: &release,
                runtime: &ctx.runtime,
                envs: &envs,
                image_pull_policy: ctx.deployment.advanced_options.image_pull_policy.as_deref(),
            };
            let name = process_resource_name(wl, &spec.name);
            let body = deployment_manifest(&input);
            self.client.create_or_update(Kind::Deployment, &name, &wl.namespace, &body, MergeStrategy::Replace).await?;
            if spec.name == WEB_PROCESS {
                let service = web_service_manifest(wl);
                let service_name = crate::networking::web_service_name(wl);
                self.client
                    .create_or_update(Kind::Service, &service_name, &wl.namespace, &service, MergeStrategy::Replace)
                    .await?;
            }
        }
        let keep: Vec<String> = specs.iter().map(|s| process_resource_name(wl, &s.name)).collect();
        self.remove_stale_processes(wl, &keep).await?;
        self.mark(ctx.deployment.id, STEP_APPLY_MANIFEST, JobStatus::Successful).await?;

        self.mark(ctx.deployment.id, STEP_WAIT_READY, JobStatus::Pending).await?;
        let deadline = Instant::now() + Duration::from_secs(self.config.release.ready_timeout_secs);
        let selector = format!("{}={},{}={}", LABEL_WL_APP, wl.name, LABEL_VERSION, release.version);
        loop {
            if let Some(outcome) = self.aborted(ctx.deployment.id, release_id).await? {
                return Ok(outcome);
            }
            let mut ready = true;
            for spec in &specs {
                let name = process_resource_name(wl, &spec.name);
                let obj = self.client.get(Kind::Deployment, &name, &wl.namespace).await?;
                ready &= deployment_ready(&to_typed::<KubeDeployment>(&obj)?);
            }
            if ready {
                self.mark(ctx.deployment.id, STEP_WAIT_READY, JobStatus::Successful).await?;
                return Ok(ReleaseOutcome::succeeded(release_id));
            }
            for obj in self.client.list(Kind::Pod, &wl.namespace, &selector).await?.items {
                let health = pod_health(&to_typed::<Pod>(&obj)?);
                if let (HealthStatus::Unhealthy, Some(message)) = (health.status, health.message) {
                    return Ok(ReleaseOutcome::failed(message, Some(release_id)));
                }
            }
            if Instant::now() >= deadline {
                let reason = format!("processes not ready after {} seconds", self.config.release.ready_timeout_secs);
                return Ok(ReleaseOutcome::failed(reason, Some(release_id)));
            }
            sleep(self.config.release.poll_interval()).await;
        }
    }

    async fn remove_stale_processes(&self, wl: &WlApp, keep: &[String]) -> Result<(), Error> {
        let selector = format!("{}={}", LABEL_WL_APP, wl.name);
        for obj in self.client.list(Kind::Deployment, &wl.namespace, &selector).await?.items {
            let name = obj.metadata.name.clone().unwrap_or_default();
            if !keep.contains(&name) {
                info!("Removing process {} no longer in the procfile", name);
                self.client.delete(Kind::Deployment, &name, &wl.namespace, None).await?;
            }
        }
        Ok(())
    }

    async fn record_release(&self, ctx: &ReleaseContext) -> Result<Uuid, Error> {
        let release = self
            .store
            .new_release(&ctx.wl.name, ctx.build_id, ctx.deployment.procfile.clone(), Some(ctx.deployment.id))
            .await?;
        self.store.update_deployment(ctx.deployment.id, |d| d.release_id = Some(release.id)).await?;
        Ok(release.id)
    }

    async fn aborted(&self, deployment_id: Uuid, release_id: Uuid) -> Result<Option<ReleaseOutcome>, Error> {
        if let Some(abort) = self.aborts.lock().await.get(&deployment_id).cloned() {
            let status = if abort.is_interrupted { JobStatus::Interrupted } else { JobStatus::Failed };
            return Ok(Some(ReleaseOutcome { status, err_detail: abort.reason, release_id: Some(release_id) }));
        }
        if self.store.deployment(deployment_id).await?.is_interrupt_requested() {
            return Ok(Some(ReleaseOutcome {
                status: JobStatus::Interrupted,
                err_detail: "interrupted by user".to_string(),
                release_id: Some(release_id),
            }));
        }
        Ok(None)
    }

    /// Runs the module's pre-release hook as a one-shot pod. Returns the failure, if any.
    async fn pre_release_hook(&self, ctx: &ReleaseContext) -> Result<Option<String>, Error> {
        let hook = match &ctx.module.pre_release_hook {
            Some(hook) => hook,
            None => return Ok(None),
        };
        let deployment_id = ctx.deployment.id;
        self.mark(deployment_id, STEP_PRE_RELEASE_HOOK, JobStatus::Pending).await?;
        let failure = self.run_hook(ctx, hook).await?;
        let status = if failure.is_some() { JobStatus::Failed } else { JobStatus::Successful };
        self.mark(deployment_id, STEP_PRE_RELEASE_HOOK, status).await?;
        Ok(failure.map(|reason| format!("pre-release hook failed: {}", reason)))
    }

    async fn run_hook(&self, ctx: &ReleaseContext, hook: &HookSpec) -> Result<Option<String>, Error> {
        let wl = &ctx.wl;
        let name = hook_pod_name(wl);
        let channel = ctx.deployment.id.to_string();
        match self.client.delete(Kind::Pod, &name, &wl.namespace, Some(0)).await {
            Err(e) if !e.is_not_found() => return Err(e.into()),
            _ => {},
        }
        let envs = release_envs(wl, &ctx.module, &ctx.deployment, &ctx.runtime);
        let body = hook_pod_manifest(wl, hook, &ctx.runtime, &envs);
        self.client.create_or_update(Kind::Pod, &name, &wl.namespace, &body, MergeStrategy::Replace).await?;
        if let Err(e) = self.hub.write_title(&channel, "Running pre-release hook").await {
            debug!("Hook title not published: {}", e);
        }

        let deadline = Instant::now() + Duration::from_secs(self.config.release.hook_timeout_secs);
        let mut logs_followed = false;
        loop {
            let pod: Pod = to_typed(&self.client.get(Kind::Pod, &name, &wl.namespace).await?)?;
            let phase = pod_phase(&pod).to_string();
            if phase == POD_PHASE_PENDING {
                if let Some(reason) = scheduling_failure(&pod) {
                    return Ok(Some(reason));
                }
            } else if !logs_followed {
                logs_followed = true;
                let mut lines = self.client.pod_log_lines(&name, &wl.namespace, None, true).await;
                while let Some(Ok(line)) = lines.next().await {
                    if self.hub.write_message(&channel, &line).await.is_err() {
                        break;
                    }
                }
                continue;
            }
            match phase.as_str() {
                POD_PHASE_SUCCEEDED => return Ok(None),
                POD_PHASE_FAILED => {
                    return Ok(Some(pod_failure_message(&pod).unwrap_or_else(|| "hook pod failed".to_string())));
                },
                _ => {},
            }
            if Instant::now() >= deadline {
                return Ok(Some(format!("timed out after {} seconds", self.config.release.hook_timeout_secs)));
            }
            sleep(self.config.release.poll_interval()).await;
        }
    }

    async fn mark(&self, deployment_id: Uuid, step: &str, status: JobStatus) -> Result<(), Error> {
        self.engine.mark_step(deployment_id, PhaseType::Release, step, status).await?;
        Ok(())
    }
}

fn deployment_ready(deployment: &KubeDeployment) -> bool {
    let wanted = deployment.spec.as_ref().and_then(|s| s.replicas).unwrap_or(1);
    let status = match &deployment.status {
        Some(status) => status,
        None => return wanted == 0,
    };
    status.updated_replicas.unwrap_or(0) >= wanted && status.available_replicas.unwrap_or(0) >= wanted
}

pub mod release_error {
    use thiserror::Error;

    use common::apiclient::apiclient_error;

    use crate::{networking::networking_error, phases::phases_error, store::store_error};

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
        Networking {
            #[from]
            source: networking_error::Error,
        },

        #[error("{source}")]
        Phases {
            #[from]
            source: phases_error::Error,
        },

        #[error("Failed to render release manifest: {source}")]
        Render {
            #[from]
            source: serde_json::Error,
        },

        #[error("{reason}")]
        Invalid { reason: String },
    }
}

#[cfg(test)]
mod test {
    use chrono::Utc;
    use common::fake::{FakeCluster, Op};
    use serde_json::json;

    use super::*;
    use crate::{
        entities::{ArtifactType, Build, Environment},
        phases::presets::{builtin_step_meta_sets, IMAGE_RELEASE},
        testing,
    };

    const NS: &str = "bkapp-foo-prod";
    const HOOK_POD: &str = "pre-release-hook--bkapp-foo-prod";

    struct Fixture {
        coordinator: ReleaseCoordinator<FakeCluster>,
        cluster: FakeCluster,
        store: Arc<Store>,
        deployment_id: Uuid,
    }

    async fn fixture(cloud_native: bool) -> Fixture {
        let store = Arc::new(Store::new());
        let hub = Arc::new(EventHub::new());
        let wl = testing::seed(&store, cloud_native).await;
        let module = store.application("foo").await.unwrap().default_module().unwrap().clone();
        let build = Build {
            id: Uuid::new_v4(),
            app: wl.name.clone(),
            artifact_type: ArtifactType::Image,
            image: Some("mirrors.example.com/bkapps/foo/default:main-1".into()),
            slug_path: None,
            slug_get_url: None,
            procfile: BTreeMap::new(),
            env_variables: BTreeMap::new(),
            branch: "main".into(),
            revision: "r1".into(),
            created_at: Utc::now(),
        };
        let mut deployment = Deployment::new("foo", "default", Environment::Prod, &wl.name, "admin");
        deployment.build_id = Some(build.id);
        deployment.processes = module.processes.iter().map(|p| (p.name.clone(), p.clone())).collect();
        deployment.procfile = module.processes.iter().map(|p| (p.name.clone(), p.command.clone())).collect();
        let deployment_id = deployment.id;
        store.insert_build(build).await;
        store.insert_deployment(deployment).await.unwrap();
        let engine = PhaseEngine::new(store.clone(), hub.clone());
        let set = builtin_step_meta_sets().into_iter().find(|s| s.name == IMAGE_RELEASE).unwrap();
        engine.bind_steps(deployment_id, &set).await.unwrap();

        let cluster = FakeCluster::new();
        cluster.script_status(Kind::Pod, HOOK_POD, vec![json!({"phase": "Succeeded"})]);
        let config = Arc::new(testing::config("0.22.0"));
        let coordinator = ReleaseCoordinator::new(cluster.clone(), store.clone(), hub, config);
        Fixture { coordinator, cluster, store, deployment_id }
    }

    async fn step_status(f: &Fixture, name: &str) -> Option<JobStatus> {
        let phase = f.store.phase(f.deployment_id, PhaseType::Release).await.unwrap();
        f.store.steps(phase.id).await.into_iter().find(|s| s.name == name).and_then(|s| s.status)
    }

    fn available(deploy_id: Uuid) -> serde_json::Value {
        json!({
            "phase": "AppRunning",
            "deployId": deploy_id.to_string(),
            "conditions": [{"type": "AppAvailable", "status": "True"}],
        })
    }

    #[test]
    fn test_bkapp_health() {
        let id = Uuid::new_v4();
        let status: BkAppStatus = serde_json::from_value(available(id)).unwrap();
        assert_eq!(bkapp_health(&status, id), BkAppHealth::Ready);
        assert_eq!(bkapp_health(&status, Uuid::new_v4()), BkAppHealth::Progressing);

        let running: BkAppStatus = serde_json::from_value(json!({
            "phase": "AppRunning",
            "conditions": [{"type": "AppAvailable", "status": "False"}],
        }))
        .unwrap();
        assert_eq!(bkapp_health(&running, id), BkAppHealth::Progressing);

        let failed: BkAppStatus = serde_json::from_value(json!({
            "phase": "AppFailed",
            "conditions": [
                {"type": "AppAvailable", "status": "False", "message": "web crashed"},
                {"type": "AddOnsProvisioned", "status": "True", "message": "ok"},
                {"type": "HooksFinished", "status": "False", "message": "hook timed out"},
            ],
        }))
        .unwrap();
        assert_eq!(bkapp_health(&failed, id), BkAppHealth::Error("web crashed; hook timed out".to_string()));
    }

    #[tokio::test]
    async fn test_cloud_native_release_becomes_ready() {
        let f = fixture(true).await;
        f.cluster.script_status(
            Kind::BkApp,
            NS,
            vec![json!({"phase": "AppPending"}), json!({"phase": "AppPending"}), available(f.deployment_id)],
        );
        let outcome = f.coordinator.release(f.deployment_id).await.unwrap();
        assert_eq!(outcome.status, JobStatus::Successful);

        let release = f.store.release(outcome.release_id.unwrap()).await.unwrap();
        assert_eq!(release.version, 1);
        assert_eq!(release.deployment_id, Some(f.deployment_id));
        assert_eq!(f.store.deployment(f.deployment_id).await.unwrap().release_id, Some(release.id));

        let bkapp = f.cluster.object(Kind::BkApp, NS, NS).unwrap();
        assert!(bkapp["spec"].get("hooks").is_none());
        assert!(f.cluster.object(Kind::ConfigMap, NS, "foo-settings").is_some());
        assert_eq!(f.cluster.calls_of(Op::Apply, Kind::Pod)[0].name, HOOK_POD);
        assert_eq!(f.store.process_specs(NS).await.len(), 2);
        assert_eq!(step_status(&f, STEP_APPLY_MANIFEST).await, Some(JobStatus::Successful));
        assert_eq!(step_status(&f, STEP_PRE_RELEASE_HOOK).await, Some(JobStatus::Successful));
        assert_eq!(step_status(&f, STEP_WAIT_READY).await, Some(JobStatus::Successful));
    }

    #[tokio::test]
    async fn test_failed_conditions_fail_release() {
        let f = fixture(true).await;
        f.cluster.script_status(
            Kind::BkApp,
            NS,
            vec![json!({
                "phase": "AppFailed",
                "conditions": [{"type": "AppAvailable", "status": "False", "message": "ImagePullBackOff"}],
            })],
        );
        let outcome = f.coordinator.release(f.deployment_id).await.unwrap();
        assert_eq!(outcome.status, JobStatus::Failed);
        assert_eq!(outcome.err_detail, "ImagePullBackOff");
        assert!(outcome.release_id.is_some());
    }

    #[tokio::test]
    async fn test_failed_hook_stops_release() {
        let f = fixture(true).await;
        f.cluster.script_status(
            Kind::Pod,
            HOOK_POD,
            vec![json!({
                "phase": "Failed",
                "containerStatuses": [{
                    "name": "hook",
                    "image": "x",
                    "imageID": "",
                    "ready": false,
                    "restartCount": 0,
                    "state": {"terminated": {"exitCode": 1}},
                }],
            })],
        );
        let outcome = f.coordinator.release(f.deployment_id).await.unwrap();
        assert_eq!(outcome.status, JobStatus::Failed);
        assert_eq!(outcome.err_detail, "pre-release hook failed: failed with exit code 1");
        assert_eq!(step_status(&f, STEP_PRE_RELEASE_HOOK).await, Some(JobStatus::Failed));
        assert_eq!(step_status(&f, STEP_WAIT_READY).await, None);
    }

    #[tokio::test]
    async fn test_abort_ends_release() {
        let f = fixture(true).await;
        let abort = ReleaseAbort { reason: "quota exceeded".into(), is_interrupted: false };
        f.coordinator.abort(f.deployment_id, abort).await;
        let outcome = f.coordinator.release(f.deployment_id).await.unwrap();
        assert_eq!(outcome.status, JobStatus::Failed);
        assert_eq!(outcome.err_detail, "quota exceeded");
        assert_eq!(f.coordinator.pending_aborts().await, 0);
    }

    #[tokio::test]
    async fn test_failed_release_drops_pending_abort() {
        let f = fixture(true).await;
        f.cluster.fail_next(Op::EnsureNamespace, Kind::Namespace, 500);
        let abort = ReleaseAbort { reason: "quota exceeded".into(), is_interrupted: false };
        f.coordinator.abort(f.deployment_id, abort).await;
        assert_eq!(f.coordinator.pending_aborts().await, 1);
        assert!(f.coordinator.release(f.deployment_id).await.is_err());
        assert_eq!(f.coordinator.pending_aborts().await, 0);
    }

    #[tokio::test]
    async fn test_abort_of_finished_deployment_is_ignored() {
        let f = fixture(true).await;
        f.store.update_deployment(f.deployment_id, |d| d.finish(JobStatus::Successful, "")).await.unwrap();
        let abort = ReleaseAbort { reason: "too late".into(), is_interrupted: true };
        f.coordinator.abort(f.deployment_id, abort).await;
        assert_eq!(f.coordinator.pending_aborts().await, 0);
    }

    #[tokio::test]
    async fn test_user_interrupt_ends_release() {
        let f = fixture(true).await;
        f.store.update_deployment(f.deployment_id, |d| d.int_requested_at = Some(Utc::now())).await.unwrap();
        let outcome = f.coordinator.release(f.deployment_id).await.unwrap();
        assert_eq!(outcome.status, JobStatus::Interrupted);
    }

    #[tokio::test]
    async fn test_legacy_release_applies_processes() {
        let f = fixture(false).await;
        f.cluster.insert(
            Kind::Deployment,
            NS,
            "bkapp-foo-prod--old",
            json!({"metadata": {"labels": {LABEL_WL_APP: NS}}}),
        );
        let ready = json!({"updatedReplicas": 2, "availableReplicas": 2});
        f.cluster.script_status(Kind::Deployment, "bkapp-foo-prod--web", vec![ready.clone()]);
        f.cluster.script_status(Kind::Deployment, "bkapp-foo-prod--worker", vec![ready]);

        let outcome = f.coordinator.release(f.deployment_id).await.unwrap();
        assert_eq!(outcome.status, JobStatus::Successful);
        assert!(f.cluster.object(Kind::Deployment, NS, "bkapp-foo-prod--old").is_none());
        let web = f.cluster.object(Kind::Deployment, NS, "bkapp-foo-prod--web").unwrap();
        assert_eq!(web["spec"]["template"]["metadata"]["labels"][LABEL_VERSION], "1");
        assert!(f.cluster.object(Kind::Service, NS, "bkapp-foo-prod--web").is_some());
        assert!(f.cluster.calls_of(Op::Apply, Kind::BkApp).is_empty());
    }

    #[tokio::test]
    async fn test_legacy_release_reports_crashing_pod() {
        let f = fixture(false).await;
        f.cluster.insert(
            Kind::Pod,
            NS,
            "bkapp-foo-prod--web-1",
            json!({
                "metadata": {"labels": {LABEL_WL_APP: NS, LABEL_VERSION: "1"}},
                "spec": {"containers": [{"name": "web"}], "restartPolicy": "Always"},
                "status": {
                    "phase": "Running",
                    "containerStatuses": [{
                        "name": "web",
                        "image": "x",
                        "imageID": "",
                        "ready": false,
                        "restartCount": 3,
                        "state": {"waiting": {"reason": "CrashLoopBackOff"}},
                    }],
                },
            }),
        );
        let outcome = f.coordinator.release(f.deployment_id).await.unwrap();
        assert_eq!(outcome.status, JobStatus::Failed);
        assert_eq!(outcome.err_detail, "CrashLoopBackOff");
    }
}
