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

//! In-memory tables behind a single lock. Per-app counters (build
//! generations, release versions) are allocated under the write lock so
//! concurrent callers serialize.

mod snapshot;

use std::collections::{BTreeMap, HashMap};

use chrono::Utc;
use log::{debug, info};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use uuid::Uuid;

pub use self::snapshot::Unfinished;
use self::store_error::Error;
use crate::entities::{
    AppDomain, Application, Build, BuildProcess, DeployPhase, DeployStep, Deployment, Domain, PhaseType,
    ProcessSpec, Release, VersionInfo, WlApp,
};

#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub(crate) struct Tables {
    applications: BTreeMap<String, Application>,
    wl_apps: BTreeMap<String, WlApp>,
    builds: HashMap<Uuid, Build>,
    build_processes: HashMap<Uuid, BuildProcess>,
    releases: HashMap<Uuid, Release>,
    deployments: HashMap<Uuid, Deployment>,
    phases: HashMap<Uuid, DeployPhase>,
    steps: HashMap<Uuid, DeployStep>,
    app_domains: Vec<AppDomain>,
    domains: HashMap<Uuid, Domain>,
    /// keyed by "{app}/{process}"
    process_specs: BTreeMap<String, ProcessSpec>,
    generations: HashMap<String, u64>,
    release_versions: HashMap<String, u64>,
}

impl Tables {
    fn allocate_build_process(&mut self, app: &str, source_tar_path: &str, version_info: VersionInfo) -> BuildProcess {
        let counter = self.generations.entry(app.to_string()).or_insert(0);
        *counter += 1;
        let bp = BuildProcess::new(app, *counter, source_tar_path, version_info);
        debug!("Created build process {} generation {} for {}", bp.id, bp.generation, app);
        self.build_processes.insert(bp.id, bp.clone());
        bp
    }
}

#[derive(Debug, Default)]
pub struct Store {
    tables: RwLock<Tables>,
}

impl Store {
    pub fn new() -> Self {
        Store::default()
    }

    pub(crate) fn from_tables(tables: Tables) -> Self {
        Store { tables: RwLock::new(tables) }
    }

    pub async fn put_application(&self, app: Application) {
        self.tables.write().await.applications.insert(app.code.clone(), app);
    }

    pub async fn application(&self, code: &str) -> Result<Application, Error> {
        self.tables.read().await.applications.get(code).cloned().ok_or_else(|| Error::not_found("application", code))
    }

    pub async fn put_wl_app(&self, wl_app: WlApp) {
        self.tables.write().await.wl_apps.insert(wl_app.name.clone(), wl_app);
    }

    pub async fn wl_app(&self, name: &str) -> Result<WlApp, Error> {
        self.tables.read().await.wl_apps.get(name).cloned().ok_or_else(|| Error::not_found("wl_app", name))
    }

    /// Removing a workload drops everything routed to it.
    pub async fn delete_wl_app(&self, name: &str) {
        let mut tables = self.tables.write().await;
        tables.wl_apps.remove(name);
        tables.app_domains.retain(|d| d.app != name);
        tables.process_specs.retain(|_, spec| spec.app != name);
    }

    /// Allocates the next generation for `app` and stores a pending process.
    pub async fn new_build_process(
        &self,
        app: &str,
        source_tar_path: &str,
        version_info: VersionInfo,
    ) -> Result<BuildProcess, Error> {
        let mut tables = self.tables.write().await;
        Ok(tables.allocate_build_process(app, source_tar_path, version_info))
    }

    /// Like `new_build_process`, refusing while another process of `app` is unfinished.
    pub async fn start_build_process(
        &self,
        app: &str,
        source_tar_path: &str,
        version_info: VersionInfo,
    ) -> Result<BuildProcess, Error> {
        let mut tables = self.tables.write().await;
        if let Some(running) = tables.build_processes.values().find(|bp| bp.app == app && !bp.status.is_terminal()) {
            return Err(Error::Conflict {
                reason: format!("build process {} of {} is still {}", running.id, app, running.status),
            });
        }
        Ok(tables.allocate_build_process(app, source_tar_path, version_info))
    }

    pub async fn build_process(&self, id: Uuid) -> Result<BuildProcess, Error> {
        self.tables.read().await.build_processes.get(&id).cloned().ok_or_else(|| Error::not_found("build_process", id))
    }

    pub async fn update_build_process<R>(
        &self,
        id: Uuid,
        f: impl FnOnce(&mut BuildProcess) -> R,
    ) -> Result<R, Error> {
        let mut tables = self.tables.write().await;
        let bp = tables.build_processes.get_mut(&id).ok_or_else(|| Error::not_found("build_process", id))?;
        Ok(f(bp))
    }

    pub async fn insert_build(&self, build: Build) {
        self.tables.write().await.builds.insert(build.id, build);
    }

    pub async fn build(&self, id: Uuid) -> Result<Build, Error> {
        self.tables.read().await.builds.get(&id).cloned().ok_or_else(|| Error::not_found("build", id))
    }

    pub async fn new_release(
        &self,
        app: &str,
        build_id: Uuid,
        procfile: BTreeMap<String, String>,
        deployment_id: Option<Uuid>,
    ) -> Result<Release, Error> {
        let mut tables = self.tables.write().await;
        if !tables.builds.contains_key(&build_id) {
            return Err(Error::not_found("build", build_id));
        }
        let version = {
            let counter = tables.release_versions.entry(app.to_string()).or_insert(0);
            *counter += 1;
            *counter
        };
        let release = Release {
            id: Uuid::new_v4(),
            app: app.to_string(),
            version,
            build_id,
            procfile,
            deployment_id,
            created_at: Utc::now(),
        };
        info!("Created release {} version {} for {}", release.id, version, app);
        tables.releases.insert(release.id, release.clone());
        Ok(release)
    }

    pub async fn release(&self, id: Uuid) -> Result<Release, Error> {
        self.tables.read().await.releases.get(&id).cloned().ok_or_else(|| Error::not_found("release", id))
    }

    pub async fn latest_release(&self, app: &str) -> Option<Release> {
        self.tables.read().await.releases.values().filter(|r| r.app == app).max_by_key(|r| r.version).cloned()
    }

    /// Stores the deployment together with its three phases.
    pub async fn insert_deployment(&self, deployment: Deployment) -> Result<Vec<DeployPhase>, Error> {
        let mut tables = self.tables.write().await;
        if let Some(running) =
            tables.deployments.values().find(|d| d.wl_app == deployment.wl_app && !d.status.is_terminal())
        {
            return Err(Error::Conflict {
                reason: format!("deployment {} of {} is still {}", running.id, running.wl_app, running.status),
            });
        }
        let phases: Vec<DeployPhase> =
            PhaseType::ALL.iter().map(|phase_type| DeployPhase::new(deployment.id, *phase_type)).collect();
        for phase in &phases {
            tables.phases.insert(phase.id, phase.clone());
        }
        tables.deployments.insert(deployment.id, deployment);
        Ok(phases)
    }

    pub async fn deployment(&self, id: Uuid) -> Result<Deployment, Error> {
        self.tables.read().await.deployments.get(&id).cloned().ok_or_else(|| Error::not_found("deployment", id))
    }

    pub async fn update_deployment<R>(&self, id: Uuid, f: impl FnOnce(&mut Deployment) -> R) -> Result<R, Error> {
        let mut tables = self.tables.write().await;
        let deployment = tables.deployments.get_mut(&id).ok_or_else(|| Error::not_found("deployment", id))?;
        Ok(f(deployment))
    }

    pub async fn phase(&self, deployment_id: Uuid, phase_type: PhaseType) -> Result<DeployPhase, Error> {
        self.tables
            .read()
            .await
            .phases
            .values()
            .find(|p| p.deployment_id == deployment_id && p.phase_type == phase_type)
            .cloned()
            .ok_or_else(|| Error::not_found("phase", format!("{}/{}", deployment_id, phase_type)))
    }

    pub async fn phases(&self, deployment_id: Uuid) -> Vec<DeployPhase> {
        let mut phases: Vec<DeployPhase> =
            self.tables.read().await.phases.values().filter(|p| p.deployment_id == deployment_id).cloned().collect();
        phases.sort_by_key(|p| p.phase_type);
        phases
    }

    pub async fn update_phase<R>(&self, id: Uuid, f: impl FnOnce(&mut DeployPhase) -> R) -> Result<R, Error> {
        let mut tables = self.tables.write().await;
        let phase = tables.phases.get_mut(&id).ok_or_else(|| Error::not_found("phase", id))?;
        Ok(f(phase))
    }

    pub async fn insert_steps(&self, steps: Vec<DeployStep>) {
        let mut tables = self.tables.write().await;
        for step in steps {
            tables.steps.insert(step.id, step);
        }
    }

    /// Steps of a phase ordered by their position in the bound meta set.
    pub async fn steps(&self, phase_id: Uuid) -> Vec<DeployStep> {
        let mut steps: Vec<DeployStep> =
            self.tables.read().await.steps.values().filter(|s| s.phase_id == phase_id).cloned().collect();
        steps.sort_by_key(|s| s.position);
        steps
    }

    pub async fn update_step<R>(
        &self,
        phase_id: Uuid,
        name: &str,
        f: impl FnOnce(&mut DeployStep) -> R,
    ) -> Result<R, Error> {
        let mut tables = self.tables.write().await;
        let step = tables
            .steps
            .values_mut()
            .find(|s| s.phase_id == phase_id && s.name == name)
            .ok_or_else(|| Error::not_found("step", name))?;
        Ok(f(step))
    }

    pub async fn app_domains(&self, app: &str) -> Vec<AppDomain> {
        self.tables.read().await.app_domains.iter().filter(|d| d.app == app).cloned().collect()
    }

    /// Inserts domains not yet known for their host; returns how many were added.
    pub async fn add_app_domains(&self, domains: Vec<AppDomain>) -> usize {
        let mut tables = self.tables.write().await;
        let mut added = 0;
        for domain in domains {
            if !tables.app_domains.iter().any(|d| d.app == domain.app && d.host == domain.host) {
                tables.app_domains.push(domain);
                added += 1;
            }
        }
        added
    }

    pub async fn insert_domain(&self, domain: Domain) -> Result<(), Error> {
        let mut tables = self.tables.write().await;
        let duplicated = tables.domains.values().any(|d| {
            d.id != domain.id
                && d.app_code == domain.app_code
                && d.same_entrance(&domain.name, &domain.path_prefix, domain.env)
        });
        if duplicated {
            return Err(Error::Conflict {
                reason: format!("domain {}{} already exists in {}", domain.name, domain.path_prefix, domain.env),
            });
        }
        tables.domains.insert(domain.id, domain);
        Ok(())
    }

    pub async fn domain(&self, id: Uuid) -> Result<Domain, Error> {
        self.tables.read().await.domains.get(&id).cloned().ok_or_else(|| Error::not_found("domain", id))
    }

    pub async fn remove_domain(&self, id: Uuid) -> Result<Domain, Error> {
        self.tables.write().await.domains.remove(&id).ok_or_else(|| Error::not_found("domain", id))
    }

    /// Custom domains of an application across modules, optionally narrowed to one module.
    pub async fn domains(&self, app_code: &str, module_name: Option<&str>) -> Vec<Domain> {
        let mut domains: Vec<Domain> = self
            .tables
            .read()
            .await
            .domains
            .values()
            .filter(|d| d.app_code == app_code && module_name.map_or(true, |m| d.module_name == m))
            .cloned()
            .collect();
        domains.sort_by(|a, b| (&a.name, &a.path_prefix).cmp(&(&b.name, &b.path_prefix)));
        domains
    }

    pub async fn upsert_process_spec(&self, app: &str, name: &str, command: &str, default_replicas: i32, plan: &str) {
        let mut tables = self.tables.write().await;
        let key = format!("{}/{}", app, name);
        match tables.process_specs.get_mut(&key) {
            Some(spec) => spec.command = command.to_string(),
            None => {
                tables.process_specs.insert(
                    key,
                    ProcessSpec {
                        app: app.to_string(),
                        name: name.to_string(),
                        command: command.to_string(),
                        replicas: default_replicas,
                        plan: plan.to_string(),
                        probes: None,
                    },
                );
            },
        }
    }

    pub async fn update_process_spec<R>(
        &self,
        app: &str,
        name: &str,
        f: impl FnOnce(&mut ProcessSpec) -> R,
    ) -> Result<R, Error> {
        let mut tables = self.tables.write().await;
        let key = format!("{}/{}", app, name);
        let spec = tables.process_specs.get_mut(&key).ok_or_else(|| Error::not_found("process_spec", &key))?;
        Ok(f(spec))
    }

    /// Drops process rows no longer present in the procfile.
    pub async fn retain_process_specs(&self, app: &str, names: &[String]) {
        self.tables.write().await.process_specs.retain(|_, spec| spec.app != app || names.contains(&spec.name));
    }

    pub async fn process_specs(&self, app: &str) -> Vec<ProcessSpec> {
        self.tables.read().await.process_specs.values().filter(|s| s.app == app).cloned().collect()
    }
}

pub mod store_error {
    use std::fmt::Display;

    use thiserror::Error;

    #[derive(Error, Debug, Clone, PartialEq, Eq)]
    pub enum Error {
        #[error("{what} '{id}' not found")]
        NotFound { what: String, id: String },

        #[error("Conflict: {reason}")]
        Conflict { reason: String },

        #[error("Snapshot {path} failed: {reason}")]
        Snapshot { path: String, reason: String },
    }

    impl Error {
        pub fn not_found(what: &str, id: impl Display) -> Self {
            Error::NotFound { what: what.to_string(), id: id.to_string() }
        }

        pub fn is_not_found(&self) -> bool {
            matches!(self, Error::NotFound { .. })
        }
    }
}

#[cfg(test)]
mod test {
    use std::sync::Arc;

    use super::*;
    use crate::entities::{Environment, JobStatus};

    #[tokio::test]
    async fn test_concurrent_generations_are_contiguous() {
        let store = Arc::new(Store::new());
        let mut handles = Vec::new();
        for i in 0..8 {
            let store = store.clone();
            let app = format!("bkapp-foo-{}", i % 2);
            handles.push(tokio::spawn(async move {
                let bp = store.new_build_process(&app, "src.tgz", VersionInfo::default()).await.unwrap();
                (app, bp.generation)
            }));
        }
        let mut per_app: HashMap<String, Vec<u64>> = HashMap::new();
        for handle in handles {
            let (app, generation) = handle.await.unwrap();
            per_app.entry(app).or_default().push(generation);
        }
        for generations in per_app.values_mut() {
            generations.sort_unstable();
            assert_eq!(generations, &vec![1, 2, 3, 4]);
        }
    }

    #[tokio::test]
    async fn test_single_running_build_process() {
        let store = Store::new();
        let bp = store.start_build_process("bkapp-foo-stag", "src.tgz", VersionInfo::default()).await.unwrap();
        let err = store.start_build_process("bkapp-foo-stag", "src.tgz", VersionInfo::default()).await.unwrap_err();
        assert!(matches!(err, Error::Conflict { .. }));
        store.update_build_process(bp.id, |bp| bp.finish(JobStatus::Failed, "")).await.unwrap();
        let next = store.start_build_process("bkapp-foo-stag", "src.tgz", VersionInfo::default()).await.unwrap();
        assert_eq!(next.generation, 2);
    }

    #[tokio::test]
    async fn test_deployment_owns_three_phases() {
        let store = Store::new();
        let deployment = Deployment::new("foo", "default", Environment::Stag, "bkapp-foo-stag", "admin");
        let id = deployment.id;
        store.insert_deployment(deployment.clone()).await.unwrap();
        let phases = store.phases(id).await;
        assert_eq!(phases.iter().map(|p| p.phase_type).collect::<Vec<_>>(), PhaseType::ALL.to_vec());
        let again = Deployment::new("foo", "default", Environment::Stag, "bkapp-foo-stag", "admin");
        assert!(matches!(store.insert_deployment(again).await, Err(Error::Conflict { .. })));
    }

    #[tokio::test]
    async fn test_release_versions_increase() {
        let store = Store::new();
        let build = Build {
            id: Uuid::new_v4(),
            app: "bkapp-foo-stag".into(),
            artifact_type: crate::entities::ArtifactType::Image,
            image: Some("foo:latest".into()),
            slug_path: None,
            slug_get_url: None,
            procfile: BTreeMap::new(),
            env_variables: BTreeMap::new(),
            branch: "main".into(),
            revision: "abc".into(),
            created_at: Utc::now(),
        };
        store.insert_build(build.clone()).await;
        let first = store.new_release("bkapp-foo-stag", build.id, BTreeMap::new(), None).await.unwrap();
        let second = store.new_release("bkapp-foo-stag", build.id, BTreeMap::new(), None).await.unwrap();
        assert_eq!((first.version, second.version), (1, 2));
        assert_eq!(store.latest_release("bkapp-foo-stag").await.unwrap().id, second.id);
        assert!(store.new_release("bkapp-foo-stag", Uuid::new_v4(), BTreeMap::new(), None).await.is_err());
    }

    #[tokio::test]
    async fn test_process_spec_keeps_replicas() {
        let store = Store::new();
        store.upsert_process_spec("app", "web", "run", 1, "default").await;
        store.update_process_spec("app", "web", |spec| spec.replicas = 3).await.unwrap();
        store.upsert_process_spec("app", "web", "run --fast", 1, "default").await;
        let specs = store.process_specs("app").await;
        assert_eq!(specs.len(), 1);
        assert_eq!((specs[0].replicas, specs[0].command.as_str()), (3, "run --fast"));
        store.retain_process_specs("app", &[]).await;
        assert!(store.process_specs("app").await.is_empty());
    }
}
