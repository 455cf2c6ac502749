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

//! In-memory stand-in for a cluster, used by orchestration tests.

use std::{
    collections::{HashMap, HashSet, VecDeque},
    sync::{Arc, Mutex, MutexGuard},
    time::Duration,
};

use async_trait::async_trait;
use futures::{stream::BoxStream, StreamExt};
use kube::{api::DynamicObject, core::ErrorResponse};
use serde_json::{json, Value};

use crate::{
    apiclient::{apiclient_error::Error, classify, MergeStrategy, ResourceApi, ResourceList},
    kinds::Kind,
    watch::WatchEvent,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Op {
    Get,
    List,
    Apply,
    Delete,
    Watch,
    EnsureNamespace,
    Logs,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Call {
    pub op: Op,
    pub kind: Kind,
    pub namespace: String,
    pub name: String,
    pub body: Option<Value>,
}

type ObjectKey = (Kind, String, String);

#[derive(Default)]
struct State {
    objects: HashMap<ObjectKey, Value>,
    version: u64,
    calls: Vec<Call>,
    status_scripts: HashMap<(Kind, String), VecDeque<Value>>,
    failures: HashMap<(Op, Kind), VecDeque<u16>>,
    watch_batches: HashMap<Kind, VecDeque<Vec<WatchEvent>>>,
    logs: HashMap<String, Vec<String>>,
    terminating: HashMap<ObjectKey, usize>,
    open_logs: HashSet<String>,
}

#[derive(Clone, Default)]
pub struct FakeCluster {
    state: Arc<Mutex<State>>,
}

impl FakeCluster {
    pub fn new() -> Self {
        FakeCluster::default()
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub fn insert(&self, kind: Kind, namespace: &str, name: &str, body: Value) {
        let mut state = self.lock();
        state.version += 1;
        let mut body = body;
        stamp(&mut body, name, namespace, state.version);
        state.objects.insert((kind, namespace.to_string(), name.to_string()), body);
    }

    pub fn object(&self, kind: Kind, namespace: &str, name: &str) -> Option<Value> {
        self.lock().objects.get(&(kind, namespace.to_string(), name.to_string())).cloned()
    }

    pub fn objects_of(&self, kind: Kind) -> Vec<Value> {
        let state = self.lock();
        let mut found: Vec<(&ObjectKey, &Value)> = state.objects.iter().filter(|(key, _)| key.0 == kind).collect();
        found.sort_by(|a, b| a.0.cmp(b.0));
        found.into_iter().map(|(_, v)| v.clone()).collect()
    }

    pub fn set_status(&self, kind: Kind, namespace: &str, name: &str, status: Value) {
        if let Some(obj) = self.lock().objects.get_mut(&(kind, namespace.to_string(), name.to_string())) {
            obj["status"] = status;
        }
    }

    /// Each `get` of the object applies the next scripted status; the last
    /// one sticks.
    pub fn script_status(&self, kind: Kind, name: &str, statuses: Vec<Value>) {
        self.lock().status_scripts.insert((kind, name.to_string()), statuses.into());
    }

    pub fn fail_next(&self, op: Op, kind: Kind, code: u16) {
        self.lock().failures.entry((op, kind)).or_default().push_back(code);
    }

    pub fn push_watch_batch(&self, kind: Kind, events: Vec<WatchEvent>) {
        self.lock().watch_batches.entry(kind).or_default().push_back(events);
    }

    /// The next delete of the object only marks it terminating; it goes away
    /// after `gets` more reads. Replacing it meanwhile is rejected.
    pub fn linger_on_delete(&self, kind: Kind, namespace: &str, name: &str, gets: usize) {
        self.lock().terminating.insert((kind, namespace.to_string(), name.to_string()), gets);
    }

    pub fn set_logs(&self, pod: &str, lines: Vec<&str>) {
        self.lock().logs.insert(pod.to_string(), lines.into_iter().map(String::from).collect());
    }

    /// Like `set_logs`, but the follow never ends after the last line.
    pub fn set_open_logs(&self, pod: &str, lines: Vec<&str>) {
        self.set_logs(pod, lines);
        self.lock().open_logs.insert(pod.to_string());
    }

    pub fn calls(&self) -> Vec<Call> {
        self.lock().calls.clone()
    }

    pub fn calls_of(&self, op: Op, kind: Kind) -> Vec<Call> {
        self.lock().calls.iter().filter(|c| c.op == op && c.kind == kind).cloned().collect()
    }

    fn record(&self, op: Op, kind: Kind, namespace: &str, name: &str, body: Option<&Value>) -> Result<(), Error> {
        let mut state = self.lock();
        state.calls.push(Call {
            op,
            kind,
            namespace: namespace.to_string(),
            name: name.to_string(),
            body: body.cloned(),
        });
        match state.failures.get_mut(&(op, kind)).and_then(VecDeque::pop_front) {
            Some(code) => Err(classify(kind, name, api_error(code))),
            None => Ok(()),
        }
    }
}

fn api_error(code: u16) -> kube::Error {
    kube::Error::Api(ErrorResponse {
        status: "Failure".to_string(),
        message: format!("injected failure with code {}", code),
        reason: "Injected".to_string(),
        code,
    })
}

fn stamp(body: &mut Value, name: &str, namespace: &str, version: u64) {
    if !body.get("metadata").map_or(false, Value::is_object) {
        body["metadata"] = json!({});
    }
    body["metadata"]["name"] = json!(name);
    if !namespace.is_empty() {
        body["metadata"]["namespace"] = json!(namespace);
    }
    body["metadata"]["resourceVersion"] = json!(version.to_string());
}

fn merge(target: &mut Value, patch: &Value) {
    match (target.as_object_mut(), patch.as_object()) {
        (Some(target), Some(patch)) => {
            for (key, value) in patch {
                if value.is_null() {
                    target.remove(key);
                } else {
                    merge(target.entry(key.clone()).or_insert(Value::Null), value);
                }
            }
        },
        _ => *target = patch.clone(),
    }
}

fn is_terminating(obj: Option<&Value>) -> bool {
    obj.and_then(|o| o.pointer("/metadata/deletionTimestamp")).is_some()
}

fn labels_match(obj: &Value, selector: &str) -> bool {
    selector.split(',').filter(|s| !s.is_empty()).all(|term| match term.split_once('=') {
        Some((key, value)) => obj.pointer("/metadata/labels").and_then(|l| l.get(key)).and_then(Value::as_str)
            == Some(value),
        None => false,
    })
}

fn to_dynamic(value: Value) -> Result<DynamicObject, Error> {
    Ok(serde_json::from_value(value)?)
}

#[async_trait]
impl ResourceApi for FakeCluster {
    async fn get(&self, kind: Kind, name: &str, namespace: &str) -> Result<DynamicObject, Error> {
        self.record(Op::Get, kind, namespace, name, None)?;
        let mut state = self.lock();
        let key = (kind, namespace.to_string(), name.to_string());
        if is_terminating(state.objects.get(&key)) {
            let gone = match state.terminating.get_mut(&key) {
                Some(left) if *left > 0 => {
                    *left -= 1;
                    false
                },
                _ => true,
            };
            if gone {
                state.terminating.remove(&key);
                state.objects.remove(&key);
            }
        }
        let exists = state.objects.contains_key(&key);
        let next_status = match state.status_scripts.get_mut(&(kind, name.to_string())) {
            _ if !exists => None,
            Some(script) if script.len() > 1 => script.pop_front(),
            Some(script) => script.front().cloned(),
            None => None,
        };
        match state.objects.get_mut(&key) {
            Some(obj) => {
                if let Some(status) = next_status {
                    obj["status"] = status;
                }
                to_dynamic(obj.clone())
            },
            None => Err(Error::NotFound { kind, name: name.to_string() }),
        }
    }

    async fn list(&self, kind: Kind, namespace: &str, labels: &str) -> Result<ResourceList, Error> {
        self.record(Op::List, kind, namespace, "", None)?;
        let state = self.lock();
        let mut matched: Vec<(&ObjectKey, &Value)> = state
            .objects
            .iter()
            .filter(|(key, obj)| key.0 == kind && (namespace.is_empty() || key.1 == namespace) && labels_match(obj, labels))
            .collect();
        matched.sort_by(|a, b| a.0.cmp(b.0));
        let items = matched.into_iter().map(|(_, v)| to_dynamic(v.clone())).collect::<Result<Vec<_>, _>>()?;
        Ok(ResourceList { items, resource_version: state.version.to_string() })
    }

    async fn create_or_update(
        &self,
        kind: Kind,
        name: &str,
        namespace: &str,
        body: &Value,
        strategy: MergeStrategy,
    ) -> Result<DynamicObject, Error> {
        self.record(Op::Apply, kind, namespace, name, Some(body))?;
        let mut state = self.lock();
        state.version += 1;
        let version = state.version;
        let key = (kind, namespace.to_string(), name.to_string());
        if is_terminating(state.objects.get(&key)) {
            return Err(classify(kind, name, api_error(422)));
        }
        let mut merged = match (strategy, state.objects.get(&key)) {
            (MergeStrategy::Replace, _) | (_, None) => body.clone(),
            (_, Some(existing)) => {
                let mut existing = existing.clone();
                merge(&mut existing, body);
                existing
            },
        };
        stamp(&mut merged, name, namespace, version);
        state.objects.insert(key, merged.clone());
        to_dynamic(merged)
    }

    async fn delete(&self, kind: Kind, name: &str, namespace: &str, _grace_seconds: Option<u32>) -> Result<(), Error> {
        self.record(Op::Delete, kind, namespace, name, None)?;
        let mut state = self.lock();
        let key = (kind, namespace.to_string(), name.to_string());
        if state.terminating.contains_key(&key) {
            if let Some(obj) = state.objects.get_mut(&key) {
                obj["metadata"]["deletionTimestamp"] = json!("1970-01-01T00:00:00Z");
                return Ok(());
            }
        }
        state.objects.remove(&key);
        Ok(())
    }

    async fn watch(
        &self,
        kind: Kind,
        namespace: &str,
        _labels: &str,
        resource_version: &str,
        timeout: Duration,
    ) -> BoxStream<'static, WatchEvent> {
        if let Err(e) = self.record(Op::Watch, kind, namespace, "", None) {
            return futures::stream::iter(vec![WatchEvent::error(500, &e.to_string())]).boxed();
        }
        let batch = self.lock().watch_batches.get_mut(&kind).and_then(VecDeque::pop_front);
        match batch {
            Some(events) => {
                let since = resource_version.to_string();
                let events: Vec<WatchEvent> =
                    events.into_iter().filter(|e| e.is_error() || e.is_newer_than(&since)).collect();
                futures::stream::iter(events).boxed()
            },
            None => futures::stream::pending::<WatchEvent>().take_until(tokio::time::sleep(timeout)).boxed(),
        }
    }

    async fn ensure_namespace(&self, name: &str, _wait_default_sa: Duration) -> Result<(), Error> {
        self.record(Op::EnsureNamespace, Kind::Namespace, "", name, None)?;
        let key = (Kind::Namespace, String::new(), name.to_string());
        if !self.lock().objects.contains_key(&key) {
            self.insert(Kind::Namespace, "", name, json!({ "apiVersion": "v1", "kind": "Namespace" }));
        }
        Ok(())
    }

    async fn pod_log_lines(
        &self,
        name: &str,
        namespace: &str,
        _container: Option<&str>,
        _follow: bool,
    ) -> BoxStream<'static, Result<String, Error>> {
        if let Err(e) = self.record(Op::Logs, Kind::Pod, namespace, name, None) {
            return futures::stream::iter(vec![Err(e)]).boxed();
        }
        let state = self.lock();
        let lines = state.logs.get(name).cloned().unwrap_or_default();
        let lines = futures::stream::iter(lines.into_iter().map(Ok));
        if state.open_logs.contains(name) {
            lines.chain(futures::stream::pending()).boxed()
        } else {
            lines.boxed()
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[tokio::test]
    async fn test_merge_patch_keeps_existing_fields() {
        let cluster = FakeCluster::new();
        cluster.insert(Kind::ConfigMap, "ns", "cm", json!({"data": {"a": "1", "b": "2"}}));
        cluster
            .create_or_update(Kind::ConfigMap, "cm", "ns", &json!({"data": {"b": null, "c": "3"}}), MergeStrategy::MergePatch)
            .await
            .unwrap();
        let obj = cluster.object(Kind::ConfigMap, "ns", "cm").unwrap();
        assert_eq!(obj["data"], json!({"a": "1", "c": "3"}));
    }

    #[tokio::test]
    async fn test_injected_failure_is_classified() {
        let cluster = FakeCluster::new();
        cluster.fail_next(Op::Get, Kind::Pod, 403);
        let err = cluster.get(Kind::Pod, "p", "ns").await.unwrap_err();
        assert!(matches!(err, Error::Permission { .. }));
        let err = cluster.get(Kind::Pod, "p", "ns").await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_terminating_object_blocks_replace_until_gone() {
        let cluster = FakeCluster::new();
        cluster.insert(Kind::Pod, "ns", "p", json!({"spec": {}}));
        cluster.linger_on_delete(Kind::Pod, "ns", "p", 1);
        cluster.delete(Kind::Pod, "p", "ns", Some(0)).await.unwrap();
        assert!(cluster.create_or_update(Kind::Pod, "p", "ns", &json!({}), MergeStrategy::Replace).await.is_err());
        assert!(cluster.get(Kind::Pod, "p", "ns").await.is_ok());
        assert!(cluster.get(Kind::Pod, "p", "ns").await.unwrap_err().is_not_found());
        cluster.create_or_update(Kind::Pod, "p", "ns", &json!({}), MergeStrategy::Replace).await.unwrap();
    }

    #[tokio::test]
    async fn test_list_filters_by_labels() {
        let cluster = FakeCluster::new();
        cluster.insert(Kind::Pod, "ns", "a", json!({"metadata": {"labels": {"app": "x"}}}));
        cluster.insert(Kind::Pod, "ns", "b", json!({"metadata": {"labels": {"app": "y"}}}));
        let list = cluster.list(Kind::Pod, "ns", "app=y").await.unwrap();
        assert_eq!(list.items.len(), 1);
        assert_eq!(list.items[0].metadata.name.as_deref(), Some("b"));
    }
}
