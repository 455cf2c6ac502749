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

use std::{collections::BTreeMap, fmt};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::deployment::VersionInfo;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Processing,
    Successful,
    Failed,
    Interrupted,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Successful | JobStatus::Failed | JobStatus::Interrupted)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Processing => "processing",
            JobStatus::Successful => "successful",
            JobStatus::Failed => "failed",
            JobStatus::Interrupted => "interrupted",
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ArtifactType {
    Slug,
    Image,
}

/// Output of a successful build. Never changed once stored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Build {
    pub id: Uuid,
    pub app: String,
    pub artifact_type: ArtifactType,
    pub image: Option<String>,
    pub slug_path: Option<String>,
    /// Presigned download URL handed to the release for slug artifacts.
    pub slug_get_url: Option<String>,
    pub procfile: BTreeMap<String, String>,
    pub env_variables: BTreeMap<String, String>,
    pub branch: String,
    pub revision: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BuildProcess {
    pub id: Uuid,
    pub app: String,
    pub generation: u64,
    pub status: JobStatus,
    pub source_tar_path: String,
    pub version_info: VersionInfo,
    pub procfile: BTreeMap<String, String>,
    /// Extra variables the build was started with, kept on the resulting `Build`.
    #[serde(default)]
    pub env_variables: BTreeMap<String, String>,
    pub output_stream_id: Uuid,
    pub build_id: Option<Uuid>,
    pub err_detail: String,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub int_requested_at: Option<DateTime<Utc>>,
    pub logs_ready_at: Option<DateTime<Utc>>,
}

impl BuildProcess {
    pub fn new(app: &str, generation: u64, source_tar_path: &str, version_info: VersionInfo) -> Self {
        BuildProcess {
            id: Uuid::new_v4(),
            app: app.to_string(),
            generation,
            status: JobStatus::Pending,
            source_tar_path: source_tar_path.to_string(),
            version_info,
            procfile: BTreeMap::new(),
            env_variables: BTreeMap::new(),
            output_stream_id: Uuid::new_v4(),
            build_id: None,
            err_detail: String::new(),
            created_at: Utc::now(),
            completed_at: None,
            int_requested_at: None,
            logs_ready_at: None,
        }
    }

    /// Only a process whose builder logs are already flowing can be interrupted.
    pub fn check_interruption_allowed(&self) -> bool {
        self.logs_ready_at.is_some() && !self.status.is_terminal()
    }

    /// Returns false when the process already reached a terminal status.
    pub fn finish(&mut self, status: JobStatus, err_detail: &str) -> bool {
        if self.status.is_terminal() {
            return false;
        }
        self.status = status;
        self.err_detail = err_detail.to_string();
        if status.is_terminal() {
            self.completed_at = Some(Utc::now());
        }
        true
    }
}
