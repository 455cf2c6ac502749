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

//! Builds run as a privileged builder pod in the app's namespace. The
//! coordinator launches the pod, follows its log into the output stream
//! and records the resulting `Build` once the pod succeeds.

pub mod blob;
pub mod pod;

use std::{collections::BTreeMap, sync::Arc, time::Duration};

use chrono::Utc;
use futures::{stream::BoxStream, StreamExt};
use k8s_openapi::api::core::v1::Pod;
use log::{debug, info, warn};
use serde::Serialize;
use tokio::time::{sleep, timeout, Instant};
use uuid::Uuid;

use common::{
    apiclient::{apiclient_error, to_typed, MergeStrategy, ResourceApi},
    kinds::Kind,
    values::{POD_PHASE_FAILED, POD_PHASE_PENDING, POD_PHASE_RUNNING, POD_PHASE_SUCCEEDED},
};

use self::{
    blob::{BlobMethod, BlobStore, SLUG_GET_URL_TTL},
    build_error::Error,
    pod::{builder_envs, builder_pod_manifest, builder_pod_name, image_repository, output_image, BuilderInput},
};
use crate::{
    config::ControlPlaneConfig,
    entities::{ArtifactType, Build, BuildMethod, BuildProcess, JobStatus, Module, PhaseType, VersionInfo, WlApp},
    phases::{PhaseEngine, StepMatcher},
    processes::health::{pod_failure_message, pod_phase, scheduling_failure},
    store::Store,
    stream::{EventHub, StreamEvent},
};

/// Grace period used when interrupting a running builder.
pub const INTERRUPT_GRACE_SECONDS: u32 = 1;
/// How long a removed builder pod may stay terminating before a new one is launched.
const PREVIOUS_BUILDER_GONE_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Default)]
pub struct BuildParams {
    pub version_info: VersionInfo,
    pub source_tar_path: String,
    pub procfile: BTreeMap<String, String>,
    pub extra_envs: BTreeMap<String, String>,
    /// Channel receiving the build output; a fresh one is created when unset.
    pub stream_id: Option<Uuid>,
    pub invalidate_cache: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BuildStatus {
    pub status: JobStatus,
    pub err_detail: String,
    pub build_id: Option<Uuid>,
    pub logs_ready: bool,
    pub interruption_allowed: bool,
}

/// Feeds build output into the step engine of a deployment.
pub struct StepFeed<'a> {
    pub engine: &'a PhaseEngine,
    pub deployment_id: Uuid,
    pub matcher: &'a StepMatcher,
}

struct Launched {
    wl: WlApp,
    module: Module,
    pod_name: String,
    image: Option<String>,
    slug_path: Option<String>,
}

pub struct BuildCoordinator<T: ResourceApi> {
    client: T,
    store: Arc<Store>,
    hub: Arc<EventHub>,
    config: Arc<ControlPlaneConfig>,
    blob: Arc<dyn BlobStore>,
}

impl<T: ResourceApi> BuildCoordinator<T> {
    pub fn new(
        client: T,
        store: Arc<Store>,
        hub: Arc<EventHub>,
        config: Arc<ControlPlaneConfig>,
        blob: Arc<dyn BlobStore>,
    ) -> Self {
        BuildCoordinator { client, store, hub, config, blob }
    }

    /// Creates the build process and launches its builder pod.
    pub async fn start_build(&self, wl: &WlApp, module: &Module, params: BuildParams) -> Result<Uuid, Error> {
        debug!("start build of {} from {}", wl.name, params.source_tar_path);
        if module.build_method == BuildMethod::CustomImage {
            return Err(Error::UnsupportedMethod { method: format!("{:?}", module.build_method) });
        }
        let mut bp =
            self.store.start_build_process(&wl.name, &params.source_tar_path, params.version_info.clone()).await?;
        let stream_id = params.stream_id.unwrap_or(bp.output_stream_id);
        bp = self
            .store
            .update_build_process(bp.id, |b| {
                b.procfile = params.procfile.clone();
                b.env_variables = params.extra_envs.clone();
                b.output_stream_id = stream_id;
                b.clone()
            })
            .await?;
        self.hub.create(&stream_id.to_string()).await;

        if let Err(e) = self.launch(wl, module, &bp, &params).await {
            self.finish(bp.id, JobStatus::Failed, &e.to_string()).await?;
            return Err(e);
        }
        info!("Build process {} (generation {}) of {} launched", bp.id, bp.generation, wl.name);
        Ok(bp.id)
    }

    async fn launch(&self, wl: &WlApp, module: &Module, bp: &BuildProcess, params: &BuildParams) -> Result<(), Error> {
        let cluster = self.config.cluster(&wl.cluster_name)?;
        let wait_sa = Duration::from_secs(self.config.release.wait_default_sa_secs);
        self.client.ensure_namespace(&wl.namespace, wait_sa).await?;

        let name = builder_pod_name(&wl.name);
        self.clear_previous_builder(&name, &wl.namespace).await?;

        let input = BuilderInput {
            wl,
            module,
            bp,
            extra_envs: &params.extra_envs,
            invalidate_cache: params.invalidate_cache,
        };
        let envs = builder_envs(self.blob.as_ref(), &self.config, &input)?;
        let image = pod::resolve_builder_image(module, &self.config);
        let manifest = builder_pod_manifest(&name, wl, &image, &envs, &self.config, &cluster.builder_tolerations)?;
        self.client.create_or_update(Kind::Pod, &name, &wl.namespace, &manifest, MergeStrategy::Replace).await?;
        self.write_title(bp.output_stream_id, &format!("Starting build with {}", image)).await;
        Ok(())
    }

    /// A young running builder is a duplicate; anything else is removed first.
    async fn clear_previous_builder(&self, name: &str, namespace: &str) -> Result<(), Error> {
        let existing = match self.client.get(Kind::Pod, name, namespace).await {
            Ok(obj) => to_typed::<Pod>(&obj)?,
            Err(e) if e.is_not_found() => return Ok(()),
            Err(e) => return Err(e.into()),
        };
        let age = existing
            .metadata
            .creation_timestamp
            .as_ref()
            .map_or(chrono::Duration::zero(), |created| Utc::now() - created.0);
        let max_age = chrono::Duration::seconds(self.config.builder.max_builder_seconds as i64);
        if pod_phase(&existing) == POD_PHASE_RUNNING && age < max_age {
            return Err(Error::BuilderRunning { name: name.to_string() });
        }
        debug!("Removing previous builder pod {}", name);
        self.client.delete(Kind::Pod, name, namespace, Some(0)).await.or_else(ignore_not_found)?;
        self.wait_pod_gone(name, namespace).await
    }

    /// A terminating pod rejects being replaced, so the old builder must be gone first.
    async fn wait_pod_gone(&self, name: &str, namespace: &str) -> Result<(), Error> {
        let deadline = Instant::now() + PREVIOUS_BUILDER_GONE_TIMEOUT;
        loop {
            match self.client.get(Kind::Pod, name, namespace).await {
                Err(e) if e.is_not_found() => return Ok(()),
                Err(e) => return Err(e.into()),
                Ok(_) if Instant::now() >= deadline => {
                    return Err(apiclient_error::Error::Timeout {
                        what: format!("previous builder pod {} to terminate", name),
                        max_wait: PREVIOUS_BUILDER_GONE_TIMEOUT,
                    }
                    .into());
                },
                Ok(_) => sleep(self.config.builder.poll_interval()).await,
            }
        }
    }

    /// Follows the builder pod until the build process is terminal.
    pub async fn wait_build(&self, bp_id: Uuid, steps: Option<StepFeed<'_>>) -> Result<JobStatus, Error> {
        debug!("start wait build process {}", bp_id);
        let bp = self.store.build_process(bp_id).await?;
        let wl = self.store.wl_app(&bp.app).await?;
        let app = self.store.application(&wl.app_code).await?;
        let module = app.module(&wl.module_name).map_err(|e| Error::Invalid { reason: e.to_string() })?.clone();
        let pod_name = builder_pod_name(&wl.name);
        let mut launched = Launched { wl, module, pod_name, image: None, slug_path: None };
        match launched.module.build_method {
            BuildMethod::Buildpack => launched.slug_path = Some(pod::slug_key(&launched.wl.name, bp.generation)),
            _ => {
                let repository = image_repository(&launched.wl, &launched.module, &self.config.registry);
                launched.image = Some(output_image(&repository, &bp));
            },
        }

        let deadline = Instant::now() + Duration::from_secs(self.config.builder.max_builder_seconds);
        let mut logs_followed = false;
        loop {
            let bp = self.store.build_process(bp_id).await?;
            if bp.status.is_terminal() {
                return Ok(bp.status);
            }
            if Instant::now() >= deadline {
                let reason = format!("build timed out after {} seconds", self.config.builder.max_builder_seconds);
                self.abandon_pod(&launched).await;
                return self.finish(bp_id, JobStatus::Failed, &reason).await;
            }
            let pod = match self.client.get(Kind::Pod, &launched.pod_name, &launched.wl.namespace).await {
                Ok(obj) => to_typed::<Pod>(&obj)?,
                Err(e) if e.is_not_found() && bp.int_requested_at.is_some() => {
                    return self.finish(bp_id, JobStatus::Interrupted, "").await;
                },
                Err(e) if e.is_not_found() => {
                    return self.finish(bp_id, JobStatus::Failed, "builder pod disappeared").await;
                },
                Err(e) => return Err(e.into()),
            };

            let phase = pod_phase(&pod).to_string();
            if phase == POD_PHASE_PENDING {
                if let Some(reason) = scheduling_failure(&pod) {
                    self.abandon_pod(&launched).await;
                    return self.finish(bp_id, JobStatus::Failed, &reason).await;
                }
            } else if bp.logs_ready_at.is_none() {
                self.store
                    .update_build_process(bp_id, |b| {
                        b.logs_ready_at = Some(Utc::now());
                        if !b.status.is_terminal() {
                            b.status = JobStatus::Processing;
                        }
                    })
                    .await?;
                info!("Build process {} is {}", bp_id, JobStatus::Processing);
            }

            if phase != POD_PHASE_PENDING && !logs_followed {
                logs_followed = true;
                self.follow_logs(&bp, &launched, steps.as_ref(), deadline).await;
                continue;
            }

            match phase.as_str() {
                POD_PHASE_SUCCEEDED => return self.complete(&bp, &launched).await,
                POD_PHASE_FAILED => {
                    let reason = pod_failure_message(&pod).unwrap_or_else(|| "builder pod failed".to_string());
                    return self.finish(bp_id, JobStatus::Failed, &reason).await;
                },
                _ => sleep(self.config.builder.poll_interval()).await,
            }
        }
    }

    /// Never outlives the build deadline.
    async fn follow_logs(
        &self,
        bp: &BuildProcess,
        launched: &Launched,
        steps: Option<&StepFeed<'_>>,
        deadline: Instant,
    ) {
        let stream_id = bp.output_stream_id.to_string();
        let mut lines = self.client.pod_log_lines(&launched.pod_name, &launched.wl.namespace, None, true).await;
        let follow = async {
            while let Some(line) = lines.next().await {
                let line = match line {
                    Ok(line) => line,
                    Err(e) => {
                        warn!("Reading logs of {} failed: {}", launched.pod_name, e);
                        break;
                    },
                };
                if let Err(e) = self.hub.write_message(&stream_id, &line).await {
                    debug!("Build output of {} not published: {}", bp.id, e);
                }
                if let Some(feed) = steps {
                    let fed = feed.engine.feed_line(feed.deployment_id, PhaseType::Build, feed.matcher, &line).await;
                    if let Err(e) = fed {
                        warn!("Step update of deployment {} failed: {}", feed.deployment_id, e);
                    }
                }
            }
        };
        let limit = Duration::from_secs(self.config.builder.log_follow_timeout_secs)
            .min(deadline.saturating_duration_since(Instant::now()));
        if timeout(limit, follow).await.is_err() {
            warn!("Stop following logs of {} after {:?}", launched.pod_name, limit);
        }
    }

    async fn complete(&self, bp: &BuildProcess, launched: &Launched) -> Result<JobStatus, Error> {
        let (artifact_type, slug_get_url) = match &launched.slug_path {
            Some(path) => (ArtifactType::Slug, Some(self.blob.presign(BlobMethod::Get, path, SLUG_GET_URL_TTL)?)),
            None => (ArtifactType::Image, None),
        };
        let build = Build {
            id: Uuid::new_v4(),
            app: bp.app.clone(),
            artifact_type,
            image: launched.image.clone(),
            slug_path: launched.slug_path.clone(),
            slug_get_url,
            procfile: bp.procfile.clone(),
            env_variables: bp.env_variables.clone(),
            branch: bp.version_info.version_name.clone(),
            revision: bp.version_info.revision.clone(),
            created_at: Utc::now(),
        };
        let build_id = build.id;
        self.store.insert_build(build).await;
        self.store.update_build_process(bp.id, |b| b.build_id = Some(build_id)).await?;
        self.finish(bp.id, JobStatus::Successful, "").await
    }

    async fn abandon_pod(&self, launched: &Launched) {
        let deleted = self
            .client
            .delete(Kind::Pod, &launched.pod_name, &launched.wl.namespace, Some(INTERRUPT_GRACE_SECONDS))
            .await;
        if let Err(e) = deleted.or_else(ignore_not_found) {
            warn!("Failed to delete builder pod {}: {}", launched.pod_name, e);
        }
    }

    async fn finish(&self, bp_id: Uuid, status: JobStatus, err_detail: &str) -> Result<JobStatus, Error> {
        let (changed, current) = self
            .store
            .update_build_process(bp_id, |b| {
                let changed = b.finish(status, err_detail);
                (changed, b.clone())
            })
            .await?;
        if changed {
            info!("Build process {} is {} {}", bp_id, status, err_detail);
            if !err_detail.is_empty() {
                if let Err(e) = self.hub.write_error(&current.output_stream_id.to_string(), err_detail).await {
                    debug!("Build error of {} not published: {}", bp_id, e);
                }
            }
        }
        Ok(current.status)
    }

    async fn write_title(&self, stream_id: Uuid, title: &str) {
        if let Err(e) = self.hub.write_title(&stream_id.to_string(), title).await {
            debug!("Title not published on {}: {}", stream_id, e);
        }
    }

    pub async fn get_status(&self, bp_id: Uuid) -> Result<BuildStatus, Error> {
        let bp = self.store.build_process(bp_id).await?;
        Ok(BuildStatus {
            status: bp.status,
            err_detail: bp.err_detail.clone(),
            build_id: bp.build_id,
            logs_ready: bp.logs_ready_at.is_some(),
            interruption_allowed: bp.check_interruption_allowed(),
        })
    }

    /// Kills the builder. Returns false when the process cannot be interrupted.
    pub async fn interrupt(&self, bp_id: Uuid) -> Result<bool, Error> {
        debug!("start interrupt build process {}", bp_id);
        let allowed = self
            .store
            .update_build_process(bp_id, |b| {
                let allowed = b.check_interruption_allowed();
                if allowed {
                    b.int_requested_at = Some(Utc::now());
                }
                allowed
            })
            .await?;
        if !allowed {
            return Ok(false);
        }
        let bp = self.store.build_process(bp_id).await?;
        let wl = self.store.wl_app(&bp.app).await?;
        self.client
            .delete(Kind::Pod, &builder_pod_name(&wl.name), &wl.namespace, Some(INTERRUPT_GRACE_SECONDS))
            .await
            .or_else(ignore_not_found)?;
        self.finish(bp_id, JobStatus::Interrupted, "").await?;
        Ok(true)
    }

    /// Build output from `last_event_id` on, followed live.
    pub async fn stream_logs(
        &self,
        bp_id: Uuid,
        last_event_id: Option<u64>,
    ) -> Result<BoxStream<'static, StreamEvent>, Error> {
        let bp = self.store.build_process(bp_id).await?;
        Ok(self.hub.subscribe(&bp.output_stream_id.to_string(), last_event_id, false).await?)
    }
}

fn ignore_not_found(e: apiclient_error::Error) -> Result<(), apiclient_error::Error> {
    if e.is_not_found() {
        Ok(())
    } else {
        Err(e)
    }
}

pub mod build_error {
    use thiserror::Error;

    use common::apiclient::apiclient_error;

    use crate::{config::config_error, store::store_error, stream::stream_error};

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
        Stream {
            #[from]
            source: stream_error::Error,
        },

        #[error("{source}")]
        Config {
            #[from]
            source: config_error::Error,
        },

        #[error("Failed to render builder manifest: {source}")]
        Render {
            #[from]
            source: serde_json::Error,
        },

        #[error("Cannot presign {key}: {reason}")]
        Presign { key: String, reason: String },

        #[error("Builder pod {name} is already running")]
        BuilderRunning { name: String },

        #[error("Build method {method} needs no build")]
        UnsupportedMethod { method: String },

        #[error("{reason}")]
        Invalid { reason: String },
    }
}
