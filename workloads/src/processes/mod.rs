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

//! Live view of the processes (one Deployment per process type) and the
//! instances (pods) of a workload app.

pub mod health;

use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::{stream::BoxStream, StreamExt};
use k8s_openapi::api::{apps::v1::Deployment, core::v1::Pod};
use log::{debug, warn};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;
use uuid::Uuid;

use common::{
    apiclient::{to_typed, ResourceApi},
    kinds::Kind,
    values::{LABEL_PROCESS_TYPE, LABEL_VERSION, LABEL_WL_APP},
    watch::{receiver_stream, EventType, WatchEvent},
};

use self::{
    health::{pod_health, pod_phase, HealthStatus},
    processes_error::Error,
};
use crate::{entities::WlApp, store::Store};

const WATCH_QUEUE: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ObjectType {
    Process,
    Instance,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessView {
    pub name: String,
    pub process_type: String,
    pub version: Option<String>,
    pub replicas: i32,
    pub ready_replicas: i32,
    pub available_replicas: i32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstanceView {
    pub name: String,
    pub process_type: String,
    pub version: Option<String>,
    pub phase: String,
    pub state: HealthStatus,
    pub state_message: Option<String>,
    pub ready: bool,
    pub restart_count: i32,
    pub image: Option<String>,
    pub start_time: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessSnapshot {
    pub processes: Vec<ProcessView>,
    pub instances: Vec<InstanceView>,
    pub rv_proc: String,
    pub rv_inst: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessWatchEvent {
    #[serde(rename = "type")]
    pub type_: EventType,
    pub object_type: ObjectType,
    pub object: Value,
    pub resource_version: String,
}

fn label(labels: &Option<std::collections::BTreeMap<String, String>>, key: &str) -> Option<String> {
    labels.as_ref().and_then(|l| l.get(key)).cloned()
}

impl From<&Deployment> for ProcessView {
    fn from(deployment: &Deployment) -> Self {
        let name = deployment.metadata.name.clone().unwrap_or_default();
        let labels = &deployment.metadata.labels;
        let status = deployment.status.as_ref();
        ProcessView {
            process_type: label(labels, LABEL_PROCESS_TYPE).unwrap_or_else(|| name.clone()),
            version: label(labels, LABEL_VERSION),
            replicas: deployment.spec.as_ref().and_then(|s| s.replicas).unwrap_or(0),
            ready_replicas: status.and_then(|s| s.ready_replicas).unwrap_or(0),
            available_replicas: status.and_then(|s| s.available_replicas).unwrap_or(0),
            name,
        }
    }
}

impl From<&Pod> for InstanceView {
    fn from(pod: &Pod) -> Self {
        let labels = &pod.metadata.labels;
        let health = pod_health(pod);
        let statuses = pod.status.as_ref().and_then(|s| s.container_statuses.as_ref());
        InstanceView {
            name: pod.metadata.name.clone().unwrap_or_default(),
            process_type: label(labels, LABEL_PROCESS_TYPE).unwrap_or_default(),
            version: label(labels, LABEL_VERSION),
            phase: pod_phase(pod).to_string(),
            state: health.status,
            state_message: health.message,
            ready: statuses.map_or(false, |s| !s.is_empty() && s.iter().all(|c| c.ready)),
            restart_count: statuses.map_or(0, |s| s.iter().map(|c| c.restart_count).sum()),
            image: pod.spec.as_ref().and_then(|s| s.containers.first()).and_then(|c| c.image.clone()),
            start_time: pod.status.as_ref().and_then(|s| s.start_time.as_ref()).map(|t| t.0),
        }
    }
}

fn view_of<K, V>(object: &Value) -> Result<Value, Error>
where
    K: DeserializeOwned,
    V: for<'a> From<&'a K> + Serialize,
{
    let typed: K = serde_json::from_value(object.clone())?;
    Ok(serde_json::to_value(V::from(&typed))?)
}

fn annotate(object_type: ObjectType, event: WatchEvent) -> ProcessWatchEvent {
    let object = match (event.type_, object_type) {
        (EventType::Error, _) => Ok(event.object),
        (_, ObjectType::Process) => view_of::<Deployment, ProcessView>(&event.object),
        (_, ObjectType::Instance) => view_of::<Pod, InstanceView>(&event.object),
    };
    match object {
        Ok(object) => ProcessWatchEvent { type_: event.type_, object_type, object, resource_version: event.resource_version },
        Err(e) => ProcessWatchEvent {
            type_: EventType::Error,
            object_type,
            object: serde_json::json!({ "code": 500, "message": e.to_string() }),
            resource_version: event.resource_version,
        },
    }
}

pub struct ProcessWatcher<T: ResourceApi> {
    client: T,
}

impl<T: ResourceApi> ProcessWatcher<T> {
    pub fn new(client: T) -> Self {
        ProcessWatcher { client }
    }

    /// Current processes and instances. With a release, only its instances are kept.
    pub async fn list(&self, wl: &WlApp, store: &Store, release_id: Option<Uuid>) -> Result<ProcessSnapshot, Error> {
        debug!("start list processes of {}", wl.name);
        let version = match release_id {
            Some(id) => Some(store.release(id).await?.version.to_string()),
            None => None,
        };
        let selector = format!("{}={}", LABEL_WL_APP, wl.name);
        let deployments = self.client.list(Kind::Deployment, &wl.namespace, &selector).await?;
        let pods = self.client.list(Kind::Pod, &wl.namespace, &selector).await?;

        let processes = deployments
            .items
            .iter()
            .map(|obj| to_typed::<Deployment>(obj).map(|d| ProcessView::from(&d)))
            .collect::<Result<Vec<_>, _>>()?;
        let instances = pods
            .items
            .iter()
            .map(|obj| to_typed::<Pod>(obj).map(|p| InstanceView::from(&p)))
            .collect::<Result<Vec<_>, _>>()?
            .into_iter()
            .filter(|i| version.is_none() || i.version == version)
            .collect();
        Ok(ProcessSnapshot {
            processes,
            instances,
            rv_proc: deployments.resource_version,
            rv_inst: pods.resource_version,
        })
    }

    /// Watches processes and instances together. Events of the two sources
    /// interleave in arrival order; the stream ends when both watches end.
    pub async fn watch(
        &self,
        wl: &WlApp,
        rv_proc: &str,
        rv_inst: &str,
        timeout: Duration,
    ) -> BoxStream<'static, ProcessWatchEvent> {
        debug!("start watch processes of {} from {}/{}", wl.name, rv_proc, rv_inst);
        let selector = format!("{}={}", LABEL_WL_APP, wl.name);
        let (tx, rx) = mpsc::channel(WATCH_QUEUE);
        let sources = [(Kind::Deployment, ObjectType::Process, rv_proc), (Kind::Pod, ObjectType::Instance, rv_inst)];
        for (kind, object_type, rv) in sources {
            let mut events = self.client.watch(kind, &wl.namespace, &selector, rv, timeout).await;
            let tx = tx.clone();
            tokio::spawn(async move {
                while let Some(event) = events.next().await {
                    let event = annotate(object_type, event);
                    let stop = event.type_ == EventType::Error;
                    if tx.send(event).await.is_err() {
                        break;
                    }
                    if stop {
                        warn!("Watch of {} stopped by an error event", kind);
                        break;
                    }
                }
            });
        }
        receiver_stream(rx)
    }
}

pub mod processes_error {
    use thiserror::Error;

    use common::apiclient::apiclient_error;

    use crate::store::store_error;

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

        #[error("Undecodable object: {source}")]
        Decode {
            #[from]
            source: serde_json::Error,
        },
    }
}
