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

//! Deploy phases and the steps inside them.
//!
//! Steps move forward when build output matches the patterns of the step
//! meta set bound to the deployment, or when a coordinator marks them
//! directly. Every transition is published on the deployment's stream.

pub mod picker;
pub mod presets;

use std::sync::Arc;

use chrono::Utc;
use log::{debug, warn};
use regex::Regex;
use serde_json::json;
use uuid::Uuid;

use self::phases_error::Error;
use crate::{
    entities::{DeployStep, JobStatus, PhaseType, StepMetaSet},
    store::Store,
    stream::{EventHub, EventKind},
};

struct Rule {
    regex: Regex,
    step: String,
    status: JobStatus,
}

/// Compiled started/finished patterns of one phase.
pub struct StepMatcher {
    rules: Vec<Rule>,
}

impl StepMatcher {
    pub fn compile(set: &StepMetaSet, phase: PhaseType) -> Result<Self, Error> {
        // every started pattern of the phase comes before any finished one
        let started =
            set.metas_of(phase).flat_map(|m| m.started_patterns.iter().map(move |p| (m, p, JobStatus::Pending)));
        let finished =
            set.metas_of(phase).flat_map(|m| m.finished_patterns.iter().map(move |p| (m, p, JobStatus::Successful)));
        let mut rules = Vec::new();
        for (meta, pattern, status) in started.chain(finished) {
            let regex = Regex::new(pattern)
                .map_err(|e| Error::InvalidPattern { pattern: pattern.clone(), reason: e.to_string() })?;
            rules.push(Rule { regex, step: meta.name.clone(), status });
        }
        Ok(StepMatcher { rules })
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// Step transitions a single output line asks for, in rule order.
    pub fn matches(&self, line: &str) -> Vec<(&str, JobStatus)> {
        self.rules.iter().filter(|r| r.regex.is_match(line)).map(|r| (r.step.as_str(), r.status)).collect()
    }
}

#[derive(Clone)]
pub struct PhaseEngine {
    store: Arc<Store>,
    hub: Arc<EventHub>,
}

impl PhaseEngine {
    pub fn new(store: Arc<Store>, hub: Arc<EventHub>) -> Self {
        PhaseEngine { store, hub }
    }

    /// Creates the steps of every phase from `set`.
    pub async fn bind_steps(&self, deployment_id: Uuid, set: &StepMetaSet) -> Result<(), Error> {
        debug!("start bind step meta set {} to deployment {}", set.name, deployment_id);
        let mut steps = Vec::new();
        for phase_type in PhaseType::ALL {
            let phase = self.store.phase(deployment_id, phase_type).await?;
            for (position, meta) in set.metas_of(phase_type).enumerate() {
                steps.push(DeployStep {
                    id: Uuid::new_v4(),
                    name: meta.name.clone(),
                    phase_id: phase.id,
                    meta_set: set.name.clone(),
                    position,
                    status: None,
                    started_at: None,
                    completed_at: None,
                });
            }
        }
        self.store.insert_steps(steps).await;
        self.store.update_deployment(deployment_id, |d| d.step_meta_set = Some(set.name.clone())).await?;
        Ok(())
    }

    pub async fn start_phase(&self, deployment_id: Uuid, phase_type: PhaseType) -> Result<(), Error> {
        let phase = self.store.phase(deployment_id, phase_type).await?;
        let started = self
            .store
            .update_phase(phase.id, |p| {
                if p.status.is_some() {
                    return false;
                }
                p.status = Some(JobStatus::Pending);
                p.started_at = Some(Utc::now());
                true
            })
            .await?;
        if started {
            self.emit_phase(deployment_id, phase_type, JobStatus::Pending).await;
        }
        Ok(())
    }

    /// Ends a phase. Steps still running take the phase's status; on success
    /// the steps that never started are closed as well.
    pub async fn finish_phase(
        &self,
        deployment_id: Uuid,
        phase_type: PhaseType,
        status: JobStatus,
    ) -> Result<(), Error> {
        debug!("finish phase {} of deployment {} as {}", phase_type, deployment_id, status);
        let phase = self.store.phase(deployment_id, phase_type).await?;
        for step in self.store.steps(phase.id).await {
            if step.is_terminal() || (step.status.is_none() && status != JobStatus::Successful) {
                continue;
            }
            self.mark_step(deployment_id, phase_type, &step.name, status).await?;
        }
        let finished = self
            .store
            .update_phase(phase.id, |p| {
                if p.status.map_or(false, |s| s.is_terminal()) {
                    return false;
                }
                let now = Utc::now();
                p.started_at.get_or_insert(now);
                p.completed_at = Some(now);
                p.status = Some(status);
                true
            })
            .await?;
        if finished {
            self.emit_phase(deployment_id, phase_type, status).await;
        }
        Ok(())
    }

    /// Returns whether the step moved. Steps not in the bound set are ignored.
    pub async fn mark_step(
        &self,
        deployment_id: Uuid,
        phase_type: PhaseType,
        name: &str,
        status: JobStatus,
    ) -> Result<bool, Error> {
        let phase = self.store.phase(deployment_id, phase_type).await?;
        let moved = match self.store.update_step(phase.id, name, |s| s.transit(status)).await {
            Ok(moved) => moved,
            Err(e) if e.is_not_found() => return Ok(false),
            Err(e) => return Err(e.into()),
        };
        if moved {
            let data = json!({"name": name, "phase": phase_type.as_str(), "status": status.as_str()});
            self.emit(deployment_id, EventKind::StepStatus, data).await;
        }
        Ok(moved)
    }

    /// Feeds one output line through `matcher`, returns the number of step transitions.
    pub async fn feed_line(
        &self,
        deployment_id: Uuid,
        phase_type: PhaseType,
        matcher: &StepMatcher,
        line: &str,
    ) -> Result<usize, Error> {
        let mut moved = 0;
        for (step, status) in matcher.matches(line) {
            if self.mark_step(deployment_id, phase_type, step, status).await? {
                moved += 1;
            }
        }
        Ok(moved)
    }

    async fn emit_phase(&self, deployment_id: Uuid, phase_type: PhaseType, status: JobStatus) {
        let data = json!({"name": phase_type.as_str(), "status": status.as_str()});
        self.emit(deployment_id, EventKind::PhaseStatus, data).await;
    }

    async fn emit(&self, deployment_id: Uuid, kind: EventKind, data: serde_json::Value) {
        if let Err(e) = self.hub.publish(&deployment_id.to_string(), kind, data).await {
            warn!("Drop {} event of deployment {}: {}", kind, deployment_id, e);
        }
    }
}

pub mod phases_error {
    use thiserror::Error;

    use crate::store::store_error;

    #[derive(Error, Debug)]
    pub enum Error {
        #[error("{source}")]
        Store {
            #[from]
            source: store_error::Error,
        },

        #[error("Invalid step pattern {pattern}: {reason}")]
        InvalidPattern { pattern: String, reason: String },

        #[error("No step meta set matches {wanted}")]
        NoStepMetaSet { wanted: String },
    }
}
