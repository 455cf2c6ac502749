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

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::{app::Environment, build::JobStatus, process::ProcessTmpl};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct VersionInfo {
    /// branch, tag or image
    pub version_type: String,
    pub version_name: String,
    pub revision: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct AdvancedOptions {
    #[serde(default)]
    pub build_only: bool,
    #[serde(default)]
    pub image_pull_policy: Option<String>,
    #[serde(default)]
    pub invalidate_image_cache: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Deployment {
    pub id: Uuid,
    pub app_code: String,
    pub module_name: String,
    pub env: Environment,
    pub wl_app: String,
    pub operator: String,
    pub version_info: VersionInfo,
    pub advanced_options: AdvancedOptions,
    pub source_tar_path: String,
    pub build_process_id: Option<Uuid>,
    pub build_id: Option<Uuid>,
    pub release_id: Option<Uuid>,
    pub status: JobStatus,
    pub err_detail: String,
    pub processes: BTreeMap<String, ProcessTmpl>,
    pub procfile: BTreeMap<String, String>,
    pub step_meta_set: Option<String>,
    pub int_requested_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Deployment {
    pub fn new(app_code: &str, module_name: &str, env: Environment, wl_app: &str, operator: &str) -> Self {
        Deployment {
            id: Uuid::new_v4(),
            app_code: app_code.to_string(),
            module_name: module_name.to_string(),
            env,
            wl_app: wl_app.to_string(),
            operator: operator.to_string(),
            version_info: VersionInfo::default(),
            advanced_options: AdvancedOptions::default(),
            source_tar_path: String::new(),
            build_process_id: None,
            build_id: None,
            release_id: None,
            status: JobStatus::Pending,
            err_detail: String::new(),
            processes: BTreeMap::new(),
            procfile: BTreeMap::new(),
            step_meta_set: None,
            int_requested_at: None,
            created_at: Utc::now(),
            completed_at: None,
        }
    }

    /// Terminal status is set once; later attempts are ignored.
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

    pub fn is_interrupt_requested(&self) -> bool {
        self.int_requested_at.is_some()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_terminal_status_is_set_once() {
        let mut deployment = Deployment::new("foo", "default", Environment::Stag, "bkapp-foo-stag", "admin");
        assert!(deployment.finish(JobStatus::Processing, ""));
        assert!(deployment.completed_at.is_none());
        assert!(deployment.finish(JobStatus::Failed, "boom"));
        assert!(!deployment.finish(JobStatus::Successful, ""));
        assert_eq!(deployment.status, JobStatus::Failed);
        assert_eq!(deployment.err_detail, "boom");
    }
}
