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

use std::time::Duration;

use futures::{stream::BoxStream, StreamExt};
use kube::api::{Api, DynamicObject, ListParams, WatchEvent as KubeWatchEvent};
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::{sync::mpsc, time::timeout_at};

const WATCH_BUFFER: usize = 128;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventType {
    Added,
    Modified,
    Deleted,
    Error,
}

/// One event of a watch, with the raw object it carries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WatchEvent {
    #[serde(rename = "type")]
    pub type_: EventType,
    pub object: Value,
    #[serde(default)]
    pub resource_version: String,
}

impl WatchEvent {
    pub fn new(type_: EventType, object: Value) -> Self {
        let resource_version = object
            .pointer("/metadata/resourceVersion")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        WatchEvent { type_, object, resource_version }
    }

    pub fn error(code: u16, message: &str) -> Self {
        WatchEvent {
            type_: EventType::Error,
            object: json!({ "code": code, "message": message }),
            resource_version: String::new(),
        }
    }

    pub fn is_error(&self) -> bool {
        self.type_ == EventType::Error
    }

    pub fn name(&self) -> &str {
        self.object.pointer("/metadata/name").and_then(Value::as_str).unwrap_or_default()
    }

    /// Events replayed by a resumed watch carry a version not newer than the
    /// one the watch started from. Non-numeric versions are always kept.
    pub fn is_newer_than(&self, since: &str) -> bool {
        match (self.resource_version.parse::<u64>(), since.parse::<u64>()) {
            (Ok(current), Ok(since)) => current > since,
            _ => true,
        }
    }
}

fn convert(event: KubeWatchEvent<DynamicObject>) -> Option<WatchEvent> {
    let (type_, obj) = match event {
        KubeWatchEvent::Added(obj) => (EventType::Added, obj),
        KubeWatchEvent::Modified(obj) => (EventType::Modified, obj),
        KubeWatchEvent::Deleted(obj) => (EventType::Deleted, obj),
        KubeWatchEvent::Bookmark(_) => return None,
        KubeWatchEvent::Error(e) => return Some(WatchEvent::error(e.code, &e.message)),
    };
    match serde_json::to_value(&obj) {
        Ok(object) => Some(WatchEvent::new(type_, object)),
        Err(e) => Some(WatchEvent::error(500, &format!("undecodable watch object: {}", e))),
    }
}

/// Runs the watch on its own task until the server closes it, the client
/// side deadline passes or the receiver goes away.
pub fn spawn_watch(
    api: Api<DynamicObject>,
    lp: ListParams,
    resource_version: String,
    timeout: Duration,
) -> BoxStream<'static, WatchEvent> {
    let (tx, rx) = mpsc::channel(WATCH_BUFFER);
    let deadline = tokio::time::Instant::now() + timeout;
    tokio::spawn(async move {
        let since = resource_version.clone();
        let stream = match api.watch(&lp, &resource_version).await {
            Ok(stream) => stream,
            Err(e) => {
                warn!("Failed to start watch: {}", e);
                tx.send(error_event(&e)).await.ok();
                return;
            },
        };
        let mut stream = Box::pin(stream);
        loop {
            let item = match timeout_at(deadline, stream.next()).await {
                Ok(Some(item)) => item,
                Ok(None) => break,
                Err(_) => {
                    debug!("watch reached its deadline, closing");
                    break;
                },
            };
            let event = match item {
                Ok(event) => convert(event),
                Err(e) => Some(error_event(&e)),
            };
            let Some(event) = event else { continue };
            if !event.is_error() && !event.is_newer_than(&since) {
                continue;
            }
            let stop = event.is_error();
            if tx.send(event).await.is_err() || stop {
                break;
            }
        }
    });
    receiver_stream(rx)
}

fn error_event(err: &kube::Error) -> WatchEvent {
    match err {
        kube::Error::Api(resp) => WatchEvent::error(resp.code, &resp.message),
        other => WatchEvent::error(500, &other.to_string()),
    }
}

pub fn receiver_stream<T: Send + 'static>(rx: mpsc::Receiver<T>) -> BoxStream<'static, T> {
    futures::stream::unfold(rx, |mut rx| async move { rx.recv().await.map(|item| (item, rx)) }).boxed()
}
