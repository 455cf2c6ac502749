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

//! Drives a deployment through its phases: preparation, build and release.

use std::{collections::HashSet, sync::Arc};

use chrono::Utc;
use log::{debug, error, info, warn};
use serde_json::json;
use uuid::Uuid;

use common::apiclient::ResourceApi;

use crate::{
    build::{
        blob::BlobStore,
        pod::{image_repository, resolve_builder_image},
        BuildCoordinator, BuildParams, StepFeed,
    },
    config::ControlPlaneConfig,
    entities::{
        app::engine_app_name,
        process::{procfile_of, validate_env_keys, validate_processes},
        AdvancedOptions, ArtifactType, Build, BuildMethod, Deployment, Environment, JobStatus, PhaseType,
        Module, ProcessTmpl, StepMetaSet, VersionInfo,
    },
    error::Error,
    phases::{
        picker::pick_step_meta_set,
        presets::{builtin_step_meta_sets, STEP_PARSE_CONFIGS, STEP_UPLOAD_SOURCE},
        PhaseEngine, StepMatcher,
    },
    release::{ReleaseAbort, ReleaseCoordinator},
    store::Store,
    stream::{EventHub, EventKind},
};

/// What a caller asks to deploy.
#[derive(Debug, Clone)]
pub struct DeployRequest {
    pub app_code: String,
    pub module_name: String,
    pub env: Environment,
    pub operator: String,
    pub version_info: VersionInfo,
    pub source_tar_path: String,
    pub advanced_options: AdvancedOptions,
    /// Replaces the processes declared on the module.
    pub processes: Option<Vec<ProcessTmpl>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct PhaseOutcome {
    status: JobStatus,
    err_detail: String,
    phase: PhaseType,
}

pub struct DeployRunner<T: ResourceApi> {
    store: Arc<Store>,
    hub: Arc<EventHub>,
    config: Arc<ControlPlaneConfig>,
    engine: PhaseEngine,
    builds: BuildCoordinator<T>,
    releases: ReleaseCoordinator<T>,
}

impl<T: ResourceApi> DeployRunner<T> {
    pub fn new(
        client: T,
        store: Arc<Store>,
        hub: Arc<EventHub>,
        config: Arc<ControlPlaneConfig>,
        blob: Arc<dyn BlobStore>,
    ) -> Self {
        DeployRunner {
            engine: PhaseEngine::new(store.clone(), hub.clone()),
            builds: BuildCoordinator::new(client.clone(), store.clone(), hub.clone(), config.clone(), blob),
            releases: ReleaseCoordinator::new(client, store.clone(), hub.clone(), config.clone()),
            store,
            hub,
            config,
        }
    }

    pub fn builds(&self) -> &BuildCoordinator<T> {
        &self.builds
    }

    /// Validates the request and records a pending deployment with its phases and steps.
    pub async fn create_deployment(&self, request: DeployRequest) -> Result<Deployment, Error> {
        debug!("start create deployment of {}/{}", request.app_code, request.module_name);
        let app = self.store.application(&request.app_code).await?;
        let module = app.module(&request.module_name)?;
        let wl_name = engine_app_name(&app.code, &module.name, module.is_default, request.env);
        let wl = self.store.wl_app(&wl_name).await?;

        let processes = request.processes.unwrap_or_else(|| module.processes.clone());
        validate_processes(&processes, &self.config.limits.proc_limits()?)?;
        validate_env_keys(module.env_vars.keys())?;
        let set = pick_step_meta_set(
            module.build_method,
            &resolve_builder_image(module, &self.config),
            &self.config.step_meta_sets,
        )?;

        let mut deployment = Deployment::new(&app.code, &module.name, request.env, &wl.name, &request.operator);
        deployment.version_info = request.version_info;
        deployment.source_tar_path = request.source_tar_path;
        deployment.advanced_options = request.advanced_options;
        deployment.procfile = procfile_of(&processes);
        deployment.processes = processes.into_iter().map(|p| (p.name.clone(), p)).collect();
        let deployment_id = deployment.id;
        self.store.insert_deployment(deployment).await?;
        self.engine.bind_steps(deployment_id, &set).await?;
        self.hub.create(&deployment_id.to_string()).await;
        info!("Deployment {} of {} created with steps {}", deployment_id, wl.name, set.name);
        Ok(self.store.deployment(deployment_id).await?)
    }

    /// Runs the deployment to a terminal status, then publishes the end event
    /// and closes its channel. Safe to call again on an unfinished deployment.
    pub async fn run(&self, deployment_id: Uuid) -> Result<Deployment, Error> {
        debug!("start run deployment {}", deployment_id);
        let deployment = self.store.deployment(deployment_id).await?;
        if deployment.status.is_terminal() {
            return Ok(deployment);
        }
        let mut current = PhaseType::Preparation;
        let outcome = match self.drive(deployment_id, &mut current).await {
            Ok(outcome) => outcome,
            Err(e) => {
                error!("Deployment {} failed in {}: {}", deployment_id, current, e);
                if let Err(e) = self.engine.finish_phase(deployment_id, current, JobStatus::Failed).await {
                    warn!("Phase {} of deployment {} not closed: {}", current, deployment_id, e);
                }
                PhaseOutcome { status: JobStatus::Failed, err_detail: e.user_message(), phase: current }
            },
        };
        self.finish(deployment_id, &outcome).await
    }

    /// Asks the deployment to stop. The build is killed right away; a release
    /// notices at its next poll. Returns false when it already ended.
    pub async fn cancel_deployment(&self, deployment_id: Uuid) -> Result<bool, Error> {
        debug!("start cancel deployment {}", deployment_id);
        let deployment = self
            .store
            .update_deployment(deployment_id, |d| {
                if !d.status.is_terminal() && d.int_requested_at.is_none() {
                    d.int_requested_at = Some(Utc::now());
                }
                d.clone()
            })
            .await?;
        if deployment.status.is_terminal() {
            return Ok(false);
        }
        if let Some(bp_id) = deployment.build_process_id {
            if !self.builds.interrupt(bp_id).await? {
                info!("Build process {} of deployment {} cannot be interrupted yet", bp_id, deployment_id);
            }
        }
        info!("Deployment {} interruption requested", deployment_id);
        Ok(true)
    }

    /// Passes an abort to the release of the deployment.
    pub async fn abort_release(&self, deployment_id: Uuid, abort: ReleaseAbort) {
        self.releases.abort(deployment_id, abort).await;
    }

    /// Deployments left unfinished by a previous run, oldest first. Build
    /// processes not owned by any of them are failed.
    pub async fn recover(&self) -> Result<Vec<Uuid>, Error> {
        debug!("start recover unfinished work");
        let unfinished = self.store.recover_unfinished().await;
        let owned: HashSet<Uuid> = unfinished.deployments.iter().filter_map(|d| d.build_process_id).collect();
        for bp in unfinished.build_processes.iter().filter(|bp| !owned.contains(&bp.id)) {
            warn!("Build process {} of {} has no deployment to resume it", bp.id, bp.app);
            self.store.update_build_process(bp.id, |b| b.finish(JobStatus::Failed, "control plane restarted")).await?;
        }
        Ok(unfinished.deployments.iter().map(|d| d.id).collect())
    }

    async fn drive(&self, deployment_id: Uuid, current: &mut PhaseType) -> Result<PhaseOutcome, Error> {
        let deployment = self.store.deployment(deployment_id).await?;
        let wl = self.store.wl_app(&deployment.wl_app).await?;
        let app = self.store.application(&wl.app_code).await?;
        let module = app.module(&wl.module_name)?.clone();
        self.store.update_deployment(deployment_id, |d| d.finish(JobStatus::Processing, "")).await?;

        *current = PhaseType::Preparation;
        self.engine.start_phase(deployment_id, PhaseType::Preparation).await?;
        self.engine.mark_step(deployment_id, PhaseType::Preparation, STEP_PARSE_CONFIGS, JobStatus::Successful).await?;
        if module.build_method != BuildMethod::CustomImage {
            self.engine
                .mark_step(deployment_id, PhaseType::Preparation, STEP_UPLOAD_SOURCE, JobStatus::Successful)
                .await?;
        }
        self.engine.finish_phase(deployment_id, PhaseType::Preparation, JobStatus::Successful).await?;
        if let Some(outcome) = self.interrupted(deployment_id, PhaseType::Preparation).await? {
            return Ok(outcome);
        }

        *current = PhaseType::Build;
        self.engine.start_phase(deployment_id, PhaseType::Build).await?;
        let build_id = match deployment.build_id {
            Some(build_id) => build_id,
            None if module.build_method == BuildMethod::CustomImage => {
                let repository = image_repository(&wl, &module, &self.config.registry);
                let build = Build {
                    id: Uuid::new_v4(),
                    app: wl.name.clone(),
                    artifact_type: ArtifactType::Image,
                    image: Some(format!("{}:{}", repository, deployment.version_info.version_name)),
                    slug_path: None,
                    slug_get_url: None,
                    procfile: deployment.procfile.clone(),
                    env_variables: Default::default(),
                    branch: deployment.version_info.version_name.clone(),
                    revision: deployment.version_info.revision.clone(),
                    created_at: Utc::now(),
                };
                let build_id = build.id;
                self.store.insert_build(build).await;
                build_id
            },
            None => {
                let bp_id = match deployment.build_process_id {
                    Some(bp_id) => bp_id,
                    None => {
                        let params = BuildParams {
                            version_info: deployment.version_info.clone(),
                            source_tar_path: deployment.source_tar_path.clone(),
                            procfile: deployment.procfile.clone(),
                            stream_id: Some(deployment_id),
                            invalidate_cache: deployment.advanced_options.invalidate_image_cache,
                            ..Default::default()
                        };
                        let bp_id = self.builds.start_build(&wl, &module, params).await?;
                        self.store.update_deployment(deployment_id, |d| d.build_process_id = Some(bp_id)).await?;
                        bp_id
                    },
                };
                let set = self.step_meta_set(&deployment, &module)?;
                let matcher = StepMatcher::compile(&set, PhaseType::Build)?;
                let feed = StepFeed { engine: &self.engine, deployment_id, matcher: &matcher };
                let status = self.builds.wait_build(bp_id, Some(feed)).await?;
                let bp = self.store.build_process(bp_id).await?;
                match (status, bp.build_id) {
                    (JobStatus::Successful, Some(build_id)) => build_id,
                    _ => {
                        self.engine.finish_phase(deployment_id, PhaseType::Build, status).await?;
                        return Ok(PhaseOutcome { status, err_detail: bp.err_detail, phase: PhaseType::Build });
                    },
                }
            },
        };
        self.store.update_deployment(deployment_id, |d| d.build_id = Some(build_id)).await?;
        self.engine.finish_phase(deployment_id, PhaseType::Build, JobStatus::Successful).await?;
        if deployment.advanced_options.build_only {
            info!("Deployment {} only builds, release skipped", deployment_id);
            let err_detail = String::new();
            return Ok(PhaseOutcome { status: JobStatus::Successful, err_detail, phase: PhaseType::Build });
        }
        if let Some(outcome) = self.interrupted(deployment_id, PhaseType::Build).await? {
            return Ok(outcome);
        }

        *current = PhaseType::Release;
        self.engine.start_phase(deployment_id, PhaseType::Release).await?;
        let outcome = self.releases.release(deployment_id).await?;
        self.engine.finish_phase(deployment_id, PhaseType::Release, outcome.status).await?;
        Ok(PhaseOutcome { status: outcome.status, err_detail: outcome.err_detail, phase: PhaseType::Release })
    }

    /// The set bound at creation, picked again if it is gone from the config.
    fn step_meta_set(&self, deployment: &Deployment, module: &Module) -> Result<StepMetaSet, Error> {
        let configured = &self.config.step_meta_sets;
        let sets = if configured.is_empty() { builtin_step_meta_sets() } else { configured.clone() };
        match sets.into_iter().find(|s| deployment.step_meta_set.as_deref() == Some(s.name.as_str())) {
            Some(set) => Ok(set),
            None => {
                let builder_image = resolve_builder_image(module, &self.config);
                Ok(pick_step_meta_set(module.build_method, &builder_image, configured)?)
            },
        }
    }

    async fn interrupted(&self, deployment_id: Uuid, phase: PhaseType) -> Result<Option<PhaseOutcome>, Error> {
        if !self.store.deployment(deployment_id).await?.is_interrupt_requested() {
            return Ok(None);
        }
        let err_detail = "interrupted by user".to_string();
        Ok(Some(PhaseOutcome { status: JobStatus::Interrupted, err_detail, phase }))
    }

    async fn finish(&self, deployment_id: Uuid, outcome: &PhaseOutcome) -> Result<Deployment, Error> {
        self.releases.forget(deployment_id).await;
        self.store.update_deployment(deployment_id, |d| d.finish(outcome.status, &outcome.err_detail)).await?;
        let phase = self.store.phase(deployment_id, outcome.phase).await?;
        let step = self
            .store
            .steps(phase.id)
            .await
            .into_iter()
            .find(|s| s.status == Some(outcome.status) && outcome.status != JobStatus::Successful)
            .map(|s| s.name);
        let mut data = json!({
            "status": outcome.status.as_str(),
            "err_detail": outcome.err_detail,
            "phase": outcome.phase.as_str(),
        });
        if let Some(step) = step {
            data["step"] = json!(step);
        }
        let channel = deployment_id.to_string();
        if let Err(e) = self.hub.publish(&channel, EventKind::End, data).await {
            warn!("End event of deployment {} not published: {}", deployment_id, e);
        } else if let Err(e) = self.hub.close(&channel).await {
            warn!("Channel of deployment {} not closed: {}", deployment_id, e);
        }
        info!("Deployment {} is {} {}", deployment_id, outcome.status, outcome.err_detail);
        Ok(self.store.deployment(deployment_id).await?)
    }
}

#[cfg(test)]
mod test {
    use common::{
        fake::{FakeCluster, Op},
        kinds::Kind,
    };
    use serde_json::{json, Value};

    use super::*;
    use crate::{build::blob::MockBlobStore, error::ErrorKind, testing};

    const NS: &str = "bkapp-foo-prod";
    const BUILDER_POD: &str = "slug-builder--bkapp-foo-prod";
    const HOOK_POD: &str = "pre-release-hook--bkapp-foo-prod";

    struct Fixture {
        runner: DeployRunner<FakeCluster>,
        cluster: FakeCluster,
        store: Arc<Store>,
        hub: Arc<EventHub>,
    }

    async fn fixture(cloud_native: bool, build_method: &str) -> Fixture {
        let store = Arc::new(Store::new());
        let hub = Arc::new(EventHub::new());
        testing::seed_with(&store, testing::application(cloud_native, build_method)).await;
        let mut blob = MockBlobStore::new();
        blob.expect_presign().returning(|method, key, _| Ok(format!("https://blob/{}/{}", method, key)));
        let cluster = FakeCluster::new();
        cluster.script_status(Kind::Pod, HOOK_POD, vec![json!({"phase": "Succeeded"})]);
        let config = Arc::new(testing::config("0.22.0"));
        let runner = DeployRunner::new(cluster.clone(), store.clone(), hub.clone(), config, Arc::new(blob));
        Fixture { runner, cluster, store, hub }
    }

    fn request() -> DeployRequest {
        DeployRequest {
            app_code: "foo".into(),
            module_name: "default".into(),
            env: Environment::Prod,
            operator: "admin".into(),
            version_info: VersionInfo { version_type: "branch".into(), version_name: "main".into(), revision: "r1".into() },
            source_tar_path: "foo/source.tgz".into(),
            advanced_options: AdvancedOptions::default(),
            processes: None,
        }
    }

    async fn end_event(f: &Fixture, deployment_id: Uuid) -> Value {
        let history = f.hub.history(&deployment_id.to_string(), None, true).await.unwrap();
        history.into_iter().rev().find(|e| e.event == EventKind::End).map(|e| e.data).unwrap()
    }

    fn ready_processes(cluster: &FakeCluster) {
        let ready = json!({"updatedReplicas": 2, "availableReplicas": 2});
        cluster.script_status(Kind::Deployment, "bkapp-foo-prod--web", vec![ready.clone()]);
        cluster.script_status(Kind::Deployment, "bkapp-foo-prod--worker", vec![ready]);
    }

    #[tokio::test]
    async fn test_slug_deployment_runs_every_phase() {
        let f = fixture(false, "BUILDPACK").await;
        f.cluster.script_status(Kind::Pod, BUILDER_POD, vec![json!({"phase": "Running"}), json!({"phase": "Succeeded"})]);
        f.cluster.set_logs(BUILDER_POD, vec!["-----> Step setup begin", "-----> Compiling app"]);
        ready_processes(&f.cluster);

        let deployment = f.runner.create_deployment(request()).await.unwrap();
        assert_eq!(deployment.step_meta_set.as_deref(), Some("slug-pack"));
        assert_eq!(deployment.procfile["web"], "gunicorn wsgi -b :5000");

        let done = f.runner.run(deployment.id).await.unwrap();
        assert_eq!(done.status, JobStatus::Successful, "{}", done.err_detail);
        assert!(done.build_process_id.is_some());
        let release = f.store.release(done.release_id.unwrap()).await.unwrap();
        let build = f.store.build(release.build_id).await.unwrap();
        assert_eq!(build.artifact_type, ArtifactType::Slug);
        let web = f.cluster.object(Kind::Deployment, NS, "bkapp-foo-prod--web").unwrap();
        assert_eq!(web["spec"]["template"]["spec"]["containers"][0]["args"], json!(["start", "web"]));

        for phase in f.store.phases(deployment.id).await {
            assert_eq!(phase.status, Some(JobStatus::Successful), "{}", phase.phase_type);
        }
        let end = end_event(&f, deployment.id).await;
        assert_eq!(end, json!({"status": "successful", "err_detail": "", "phase": "release"}));
        assert!(f.hub.is_closed(&deployment.id.to_string()).await);
    }

    #[tokio::test]
    async fn test_failed_build_ends_deployment() {
        let f = fixture(false, "BUILDPACK").await;
        f.cluster.script_status(
            Kind::Pod,
            BUILDER_POD,
            vec![
                json!({"phase": "Running"}),
                json!({
                    "phase": "Failed",
                    "containerStatuses": [{
                        "name": "builder", "image": "x", "imageID": "", "ready": false, "restartCount": 0,
                        "state": {"terminated": {"exitCode": 2, "reason": "Error"}},
                    }],
                }),
            ],
        );
        f.cluster.set_logs(BUILDER_POD, vec!["-----> Compiling app"]);
        let deployment = f.runner.create_deployment(request()).await.unwrap();
        let abort = ReleaseAbort { reason: "quota exceeded".into(), is_interrupted: false };
        f.runner.abort_release(deployment.id, abort).await;
        let done = f.runner.run(deployment.id).await.unwrap();
        assert_eq!(done.status, JobStatus::Failed);
        assert_eq!(done.err_detail, "failed with exit code 2");
        assert!(done.release_id.is_none());
        // the abort never reached a release and is dropped with the deployment
        assert_eq!(f.runner.releases.pending_aborts().await, 0);

        let end = end_event(&f, deployment.id).await;
        assert_eq!(end["phase"], "build");
        assert_eq!(end["step"], "build-app");
        let release = f.store.phase(deployment.id, PhaseType::Release).await.unwrap();
        assert_eq!(release.status, None);
    }

    #[tokio::test]
    async fn test_custom_image_skips_builder() {
        let f = fixture(true, "CUSTOM_IMAGE").await;
        let deployment = f.runner.create_deployment(request()).await.unwrap();
        assert_eq!(deployment.step_meta_set.as_deref(), Some("image_release"));
        f.cluster.script_status(
            Kind::BkApp,
            NS,
            vec![json!({
                "phase": "AppRunning",
                "deployId": deployment.id.to_string(),
                "conditions": [{"type": "AppAvailable", "status": "True"}],
            })],
        );

        let done = f.runner.run(deployment.id).await.unwrap();
        assert_eq!(done.status, JobStatus::Successful, "{}", done.err_detail);
        assert!(done.build_process_id.is_none());
        let build = f.store.build(done.build_id.unwrap()).await.unwrap();
        assert_eq!(build.image.as_deref(), Some("mirrors.example.com/bkapps/foo/default:main"));
        let pods: Vec<String> = f.cluster.calls_of(Op::Apply, Kind::Pod).into_iter().map(|c| c.name).collect();
        assert_eq!(pods, vec![HOOK_POD.to_string()]);
    }

    #[tokio::test]
    async fn test_build_only_skips_release() {
        let f = fixture(true, "CUSTOM_IMAGE").await;
        let mut req = request();
        req.advanced_options.build_only = true;
        let deployment = f.runner.create_deployment(req).await.unwrap();
        let done = f.runner.run(deployment.id).await.unwrap();
        assert_eq!(done.status, JobStatus::Successful);
        assert!(done.release_id.is_none());
        assert!(f.cluster.calls_of(Op::Apply, Kind::BkApp).is_empty());
    }

    #[tokio::test]
    async fn test_invalid_processes_are_rejected() {
        let f = fixture(false, "BUILDPACK").await;
        let mut req = request();
        let web = ProcessTmpl { name: "web".into(), command: "run".into(), replicas: 1, ..Default::default() };
        req.processes = Some(vec![web.clone(), ProcessTmpl { name: "WEB".into(), ..web }]);
        let err = f.runner.create_deployment(req).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);

        f.runner.create_deployment(request()).await.unwrap();
        let err = f.runner.create_deployment(request()).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Conflict);
    }

    #[tokio::test]
    async fn test_cancel_interrupts_pending_deployment() {
        let f = fixture(false, "BUILDPACK").await;
        let deployment = f.runner.create_deployment(request()).await.unwrap();
        assert!(f.runner.cancel_deployment(deployment.id).await.unwrap());
        let done = f.runner.run(deployment.id).await.unwrap();
        assert_eq!(done.status, JobStatus::Interrupted);
        assert_eq!(end_event(&f, deployment.id).await["phase"], "preparation");
        assert!(f.cluster.calls_of(Op::Apply, Kind::Pod).is_empty());
        assert!(!f.runner.cancel_deployment(deployment.id).await.unwrap());
    }

    #[tokio::test]
    async fn test_recover_lists_unfinished_deployments() {
        let f = fixture(false, "BUILDPACK").await;
        let deployment = f.runner.create_deployment(request()).await.unwrap();
        let orphan = f.store.new_build_process("bkapp-bar-prod", "bar.tgz", VersionInfo::default()).await.unwrap();

        assert_eq!(f.runner.recover().await.unwrap(), vec![deployment.id]);
        let orphan = f.store.build_process(orphan.id).await.unwrap();
        assert_eq!(orphan.status, JobStatus::Failed);
        assert_eq!(orphan.err_detail, "control plane restarted");
    }
}
