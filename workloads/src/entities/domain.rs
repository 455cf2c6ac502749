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

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::app::Environment;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DomainSource {
    AutoGen,
    Custom,
}

/// Host routed to a workload, persisted so lookups need no allocation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppDomain {
    pub app: String,
    pub host: String,
    pub https_enabled: bool,
    pub source: DomainSource,
}

/// Domain declared by the user for one module environment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Domain {
    pub id: Uuid,
    pub app_code: String,
    pub module_name: String,
    pub env: Environment,
    pub name: String,
    pub path_prefix: String,
    pub https_enabled: bool,
}

impl Domain {
    pub fn same_entrance(&self, name: &str, path_prefix: &str, env: Environment) -> bool {
        self.name == name && self.path_prefix == path_prefix && self.env == env
    }
}
