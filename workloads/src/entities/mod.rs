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

//! Persisted state of the control plane: applications, builds, releases,
//! deployments with their phases and steps, and domains.

pub mod app;
pub mod build;
pub mod deployment;
pub mod domain;
pub mod phase;
pub mod process;
pub mod release;

pub use app::{AppType, Application, BuildMethod, Buildpack, Environment, ExposedUrlType, HookSpec, Module, WlApp};
pub use build::{ArtifactType, Build, BuildProcess, JobStatus};
pub use deployment::{AdvancedOptions, Deployment, VersionInfo};
pub use domain::{AppDomain, Domain, DomainSource};
pub use phase::{DeployPhase, DeployStep, PhaseType, StepMeta, StepMetaSet};
pub use process::{ProcessSpec, ProcessTmpl, ResQuota};
pub use release::Release;

pub mod entity_error {
    use thiserror::Error;

    #[derive(Error, Debug, Clone, PartialEq, Eq)]
    pub enum Error {
        #[error("Invalid {field}: {reason}")]
        Validation { field: String, reason: String },

        #[error("Conflict on {field}: {reason}")]
        Conflict { field: String, reason: String },

        #[error("Unknown {what} '{value}'")]
        UnknownValue { what: String, value: String },

        #[error("Malformed application description: {message}")]
        Description { message: String },
    }

    impl Error {
        pub fn validation(field: &str, reason: impl Into<String>) -> Self {
            Error::Validation { field: field.to_string(), reason: reason.into() }
        }

        pub fn conflict(field: &str, reason: impl Into<String>) -> Self {
            Error::Conflict { field: field.to_string(), reason: reason.into() }
        }
    }
}
