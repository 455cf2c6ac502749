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

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::build::JobStatus;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PhaseType {
    Preparation,
    Build,
    Release,
}

impl PhaseType {
    pub const ALL: [PhaseType; 3] = [PhaseType::Preparation, PhaseType::Build, PhaseType::Release];

    pub fn as_str(&self) -> &'static str {
        match self {
            PhaseType::Preparation => "preparation",
            PhaseType::Build => "build",
            PhaseType::Release => "release",
        }
    }
}

impl fmt::Display for PhaseType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepMeta {
    pub phase: PhaseType,
    pub name: String,
    #[serde(default)]
    pub started_patterns: Vec<String>,
    #[serde(default)]
    pub finished_patterns: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepMetaSet {
    pub name: String,
    pub metas: Vec<StepMeta>,
    #[serde(default)]
    pub is_default: bool,
    /// Builder image this set describes, if any.
    #[serde(default)]
    pub builder_provider: Option<String>,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
}

impl StepMetaSet {
    pub fn metas_of(&self, phase: PhaseType) -> impl Iterator<Item = &StepMeta> {
        self.metas.iter().filter(move |m| m.phase == phase)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeployPhase {
    pub id: Uuid,
    pub phase_type: PhaseType,
    pub deployment_id: Uuid,
    /// `None` until the phase starts.
    pub status: Option<JobStatus>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl DeployPhase {
    pub fn new(deployment_id: Uuid, phase_type: PhaseType) -> Self {
        DeployPhase { id: Uuid::new_v4(), phase_type, deployment_id, status: None, started_at: None, completed_at: None }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeployStep {
    pub id: Uuid,
    pub name: String,
    pub phase_id: Uuid,
    pub meta_set: String,
    pub position: usize,
    pub status: Option<JobStatus>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl DeployStep {
    pub fn is_terminal(&self) -> bool {
        self.status.map_or(false, |s| s.is_terminal())
    }

    /// Moves the step forward; terminal steps and repeated statuses are left alone.
    pub fn transit(&mut self, status: JobStatus) -> bool {
        if self.is_terminal() || self.status == Some(status) {
            return false;
        }
        let now = Utc::now();
        if self.started_at.is_none() {
            self.started_at = Some(now);
        }
        if status.is_terminal() {
            self.completed_at = Some(now);
        }
        self.status = Some(status);
        true
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_step_never_leaves_terminal_status() {
        let mut step = DeployStep {
            id: Uuid::new_v4(),
            name: "build-app".into(),
            phase_id: Uuid::new_v4(),
            meta_set: "slug-pack".into(),
            position: 0,
            status: None,
            started_at: None,
            completed_at: None,
        };
        assert!(step.transit(JobStatus::Pending));
        assert!(!step.transit(JobStatus::Pending));
        assert!(step.transit(JobStatus::Successful));
        assert!(!step.transit(JobStatus::Pending));
        assert_eq!(step.status, Some(JobStatus::Successful));
        assert!(step.completed_at.is_some());
    }
}
