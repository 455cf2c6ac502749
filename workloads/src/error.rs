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

//! Crate level error grouping the errors of every component.

use std::fmt;

use thiserror::Error;

use common::apiclient::{apiclient_error, is_transient};

use crate::{
    build::build_error, config::config_error, entities::entity_error, networking::networking_error,
    phases::phases_error, processes::processes_error, release::release_error, store::store_error,
    stream::stream_error,
};

/// How a caller should react to an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Worth retrying later.
    Transient,
    Permission,
    NotFound,
    /// The caller sent something invalid.
    Validation,
    /// The caller can fix it, e.g. by picking another name.
    Conflict,
    /// Ends the deployment with a message the user can act on.
    Fatal,
    /// Anything else; the details stay in the logs.
    Internal,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

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
    Entity {
        #[from]
        source: entity_error::Error,
    },

    #[error("{source}")]
    Config {
        #[from]
        source: config_error::Error,
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

    #[error("{source}")]
    Build {
        #[from]
        source: build_error::Error,
    },

    #[error("{source}")]
    Release {
        #[from]
        source: release_error::Error,
    },

    #[error("{source}")]
    Processes {
        #[from]
        source: processes_error::Error,
    },

    #[error("{source}")]
    Stream {
        #[from]
        source: stream_error::Error,
    },
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Client { source } => client_kind(source),
            Error::Store { source } => store_kind(source),
            Error::Entity { source } => entity_kind(source),
            Error::Config { .. } => ErrorKind::Validation,
            Error::Networking { source } => networking_kind(source),
            Error::Phases { source } => phases_kind(source),
            Error::Build { source } => build_kind(source),
            Error::Release { source } => release_kind(source),
            Error::Processes { source } => match source {
                processes_error::Error::Client { source } => client_kind(source),
                processes_error::Error::Store { source } => store_kind(source),
                processes_error::Error::Decode { .. } => ErrorKind::Internal,
            },
            Error::Stream { .. } => ErrorKind::Internal,
        }
    }

    /// Single line shown to the user. Internal details are hidden.
    pub fn user_message(&self) -> String {
        match self.kind() {
            ErrorKind::Internal => "Release failed, internal error".to_string(),
            _ => self.to_string(),
        }
    }
}

fn client_kind(e: &apiclient_error::Error) -> ErrorKind {
    match e {
        apiclient_error::Error::NotFound { .. } => ErrorKind::NotFound,
        apiclient_error::Error::Permission { .. } => ErrorKind::Permission,
        apiclient_error::Error::Conflict { .. } => ErrorKind::Conflict,
        apiclient_error::Error::Timeout { .. } => ErrorKind::Transient,
        apiclient_error::Error::KubeError { source } if is_transient(source) => ErrorKind::Transient,
        apiclient_error::Error::KubeError { source: kube::Error::Api(_) } => ErrorKind::Fatal,
        apiclient_error::Error::KubeError { .. } | apiclient_error::Error::SerdeError { .. } => ErrorKind::Internal,
    }
}

fn store_kind(e: &store_error::Error) -> ErrorKind {
    match e {
        store_error::Error::NotFound { .. } => ErrorKind::NotFound,
        store_error::Error::Conflict { .. } => ErrorKind::Conflict,
        store_error::Error::Snapshot { .. } => ErrorKind::Internal,
    }
}

fn entity_kind(e: &entity_error::Error) -> ErrorKind {
    match e {
        entity_error::Error::Conflict { .. } => ErrorKind::Conflict,
        entity_error::Error::Validation { .. }
        | entity_error::Error::UnknownValue { .. }
        | entity_error::Error::Description { .. } => ErrorKind::Validation,
    }
}

fn networking_kind(e: &networking_error::Error) -> ErrorKind {
    match e {
        networking_error::Error::Client { source } => client_kind(source),
        networking_error::Error::Store { source } => store_kind(source),
        networking_error::Error::Config { .. } | networking_error::Error::InvalidDomain { .. } => {
            ErrorKind::Validation
        },
        networking_error::Error::DuplicatedDomain { .. } => ErrorKind::Conflict,
        networking_error::Error::Render { .. } => ErrorKind::Internal,
    }
}

fn phases_kind(e: &phases_error::Error) -> ErrorKind {
    match e {
        phases_error::Error::Store { source } => store_kind(source),
        phases_error::Error::InvalidPattern { .. } | phases_error::Error::NoStepMetaSet { .. } => {
            ErrorKind::Validation
        },
    }
}

fn build_kind(e: &build_error::Error) -> ErrorKind {
    match e {
        build_error::Error::Client { source } => client_kind(source),
        build_error::Error::Store { source } => store_kind(source),
        build_error::Error::BuilderRunning { .. } => ErrorKind::Conflict,
        build_error::Error::Config { .. }
        | build_error::Error::UnsupportedMethod { .. }
        | build_error::Error::Invalid { .. } => ErrorKind::Validation,
        build_error::Error::Stream { .. } | build_error::Error::Render { .. } | build_error::Error::Presign { .. } => {
            ErrorKind::Internal
        },
    }
}

fn release_kind(e: &release_error::Error) -> ErrorKind {
    match e {
        release_error::Error::Client { source } => client_kind(source),
        release_error::Error::Store { source } => store_kind(source),
        release_error::Error::Networking { source } => networking_kind(source),
        release_error::Error::Phases { source } => phases_kind(source),
        release_error::Error::Invalid { .. } => ErrorKind::Validation,
        release_error::Error::Render { .. } => ErrorKind::Internal,
    }
}
