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

use std::{fmt, time::Duration};

use apiclient_error::Error;
use async_trait::async_trait;
use futures::{stream::BoxStream, StreamExt};
use k8s_openapi::api::core::v1::Pod;
use kube::{
    api::{Api, DeleteParams, DynamicObject, ListParams, LogParams, Patch, PatchParams, PostParams},
    Client,
};
use log::{debug, info, warn};
use serde::de::DeserializeOwned;
use serde_json::{json, Value};
use tokio::{
    sync::mpsc,
    time::{sleep, Instant},
};
use tokio_retry::{
    strategy::{jitter, ExponentialBackoff},
    RetryIf,
};

use crate::{
    kinds::Kind,
    logs::LineSplitter,
    values::{
        DEFAULT_SERVICE_ACCOUNT, EVERY_SA_CHECK, HTTP_CODE_CONFLICT, HTTP_CODE_FORBIDDEN, HTTP_CODE_NOT_FOUND,
        HTTP_CODE_TOO_MANY_REQUESTS, HTTP_CODE_UNAUTHORIZED, MAX_CONFLICT_ATTEMPTS, MAX_TRANSIENT_RETRIES,
        RETRY_BASE_DELAY, RETRY_MAX_DELAY,
    },
    watch::{self, WatchEvent},
};

const LOG_BUFFER: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeStrategy {
    Replace,
    MergePatch,
    StrategicMerge,
}

impl fmt::Display for MergeStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            MergeStrategy::Replace => "replace",
            MergeStrategy::MergePatch => "merge-patch",
            MergeStrategy::StrategicMerge => "strategic-merge",
        };
        write!(f, "{}", name)
    }
}

#[derive(Debug, Clone, Default)]
pub struct ResourceList {
    pub items: Vec<DynamicObject>,
    pub resource_version: String,
}

#[async_trait]
pub trait ResourceApi: Clone + Sized + Send + Sync + 'static {
    async fn get(&self, kind: Kind, name: &str, namespace: &str) -> Result<DynamicObject, Error>;
    async fn list(&self, kind: Kind, namespace: &str, labels: &str) -> Result<ResourceList, Error>;
    async fn create_or_update(
        &self,
        kind: Kind,
        name: &str,
        namespace: &str,
        body: &Value,
        strategy: MergeStrategy,
    ) -> Result<DynamicObject, Error>;
    async fn delete(&self, kind: Kind, name: &str, namespace: &str, grace_seconds: Option<u32>) -> Result<(), Error>;
    /// Never fails: backend errors show up as a trailing `ERROR` event.
    async fn watch(
        &self,
        kind: Kind,
        namespace: &str,
        labels: &str,
        resource_version: &str,
        timeout: Duration,
    ) -> BoxStream<'static, WatchEvent>;
    async fn ensure_namespace(&self, name: &str, wait_default_sa: Duration) -> Result<(), Error>;
    async fn pod_log_lines(
        &self,
        name: &str,
        namespace: &str,
        container: Option<&str>,
        follow: bool,
    ) -> BoxStream<'static, Result<String, Error>>;
}

#[derive(Clone)]
pub struct ClusterClient {
    pub client: Client,
}

impl ClusterClient {
    pub fn new(client: Client) -> Self {
        ClusterClient { client }
    }

    fn dynamic_api(&self, kind: Kind, namespace: &str) -> Api<DynamicObject> {
        let resource = kind.api_resource();
        if kind.is_namespaced() {
            Api::namespaced_with(self.client.clone(), namespace, &resource)
        } else {
            Api::all_with(self.client.clone(), &resource)
        }
    }

    async fn apply_once(
        &self,
        kind: Kind,
        name: &str,
        namespace: &str,
        body: &Value,
        strategy: MergeStrategy,
    ) -> Result<DynamicObject, Error> {
        let api = self.dynamic_api(kind, namespace);
        let api = &api;
        let obj: DynamicObject = serde_json::from_value(body.clone())?;
        let obj = &obj;
        let pp = PostParams::default();
        let pp = &pp;
        let patch_params = PatchParams::default();
        let patch_params = &patch_params;
        let updated = match strategy {
            MergeStrategy::Replace => with_retry(kind, name, move || api.replace(name, pp, obj)).await,
            MergeStrategy::MergePatch => {
                let patch = Patch::Merge(body);
                let patch = &patch;
                with_retry(kind, name, move || api.patch(name, patch_params, patch)).await
            },
            MergeStrategy::StrategicMerge => {
                let patch = Patch::Strategic(body);
                let patch = &patch;
                with_retry(kind, name, move || api.patch(name, patch_params, patch)).await
            },
        };
        match updated {
            Err(Error::NotFound { .. }) => {
                info!("{} {}/{} does not exist, creating", kind, namespace, name);
                with_retry(kind, name, move || api.create(pp, obj)).await
            },
            other => other,
        }
    }
}

#[async_trait]
impl ResourceApi for ClusterClient {
    async fn get(&self, kind: Kind, name: &str, namespace: &str) -> Result<DynamicObject, Error> {
        let api = self.dynamic_api(kind, namespace);
        let api = &api;
        with_retry(kind, name, move || api.get(name)).await
    }

    async fn list(&self, kind: Kind, namespace: &str, labels: &str) -> Result<ResourceList, Error> {
        let api = self.dynamic_api(kind, namespace);
        let api = &api;
        let lp = if labels.is_empty() { ListParams::default() } else { ListParams::default().labels(labels) };
        let lp = &lp;
        let list = with_retry(kind, namespace, move || api.list(lp)).await?;
        Ok(ResourceList { resource_version: list.metadata.resource_version.unwrap_or_default(), items: list.items })
    }

    async fn create_or_update(
        &self,
        kind: Kind,
        name: &str,
        namespace: &str,
        body: &Value,
        strategy: MergeStrategy,
    ) -> Result<DynamicObject, Error> {
        debug!("start create_or_update {} {}/{} with {}", kind, namespace, name, strategy);
        let mut body = body.clone();
        let attempts = if kind.retries_on_conflict() { MAX_CONFLICT_ATTEMPTS } else { 1 };
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.apply_once(kind, name, namespace, &body, strategy).await {
                Err(Error::Conflict { .. }) if attempt < attempts => {
                    warn!(
                        "{} {}/{} update conflicted, retrying without resourceVersion ({}/{})",
                        kind, namespace, name, attempt, attempts
                    );
                    drop_resource_version(&mut body);
                },
                other => return other,
            }
        }
    }

    async fn delete(&self, kind: Kind, name: &str, namespace: &str, grace_seconds: Option<u32>) -> Result<(), Error> {
        debug!("start delete {} {}/{}", kind, namespace, name);
        let api = self.dynamic_api(kind, namespace);
        let api = &api;
        let dp = DeleteParams { grace_period_seconds: grace_seconds, ..DeleteParams::default() };
        let dp = &dp;
        match with_retry(kind, name, move || api.delete(name, dp)).await {
            Ok(_) => Ok(()),
            Err(Error::NotFound { .. }) => {
                debug!("{} {}/{} already deleted", kind, namespace, name);
                Ok(())
            },
            Err(e) => Err(e),
        }
    }

    async fn watch(
        &self,
        kind: Kind,
        namespace: &str,
        labels: &str,
        resource_version: &str,
        timeout: Duration,
    ) -> BoxStream<'static, WatchEvent> {
        let api = self.dynamic_api(kind, namespace);
        let timeout_secs = u32::try_from(timeout.as_secs()).unwrap_or(u32::MAX).max(1);
        let mut lp = ListParams::default().timeout(timeout_secs);
        if !labels.is_empty() {
            lp = lp.labels(labels);
        }
        watch::spawn_watch(api, lp, resource_version.to_string(), timeout)
    }

    async fn ensure_namespace(&self, name: &str, wait_default_sa: Duration) -> Result<(), Error> {
        debug!("start ensure_namespace {}", name);
        match self.get(Kind::Namespace, name, "").await {
            Ok(_) => debug!("namespace {} exists", name),
            Err(Error::NotFound { .. }) => {
                info!("Create namespace {}", name);
                let api = self.dynamic_api(Kind::Namespace, "");
                let api = &api;
                let body = json!({ "apiVersion": "v1", "kind": "Namespace", "metadata": { "name": name } });
                let obj: DynamicObject = serde_json::from_value(body)?;
                let obj = &obj;
                let pp = PostParams::default();
                let pp = &pp;
                match with_retry(Kind::Namespace, name, move || api.create(pp, obj)).await {
                    Ok(_) | Err(Error::Conflict { .. }) => {},
                    Err(e) => return Err(e),
                }
            },
            Err(e) => return Err(e),
        }

        let start_time = Instant::now();
        loop {
            match self.get(Kind::ServiceAccount, DEFAULT_SERVICE_ACCOUNT, name).await {
                Ok(_) => {
                    debug!("default service account of namespace {} is ready", name);
                    return Ok(());
                },
                Err(Error::NotFound { .. }) => {
                    debug!(
                        "default service account of namespace {} is not ready, waiting {}s",
                        name,
                        EVERY_SA_CHECK.as_secs_f64()
                    );
                },
                Err(e) => return Err(e),
            }
            if start_time.elapsed() > wait_default_sa {
                return Err(Error::Timeout {
                    what: format!("default service account in namespace {}", name),
                    max_wait: wait_default_sa,
                });
            }
            sleep(EVERY_SA_CHECK).await;
        }
    }

    async fn pod_log_lines(
        &self,
        name: &str,
        namespace: &str,
        container: Option<&str>,
        follow: bool,
    ) -> BoxStream<'static, Result<String, Error>> {
        let pods: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        let lp = LogParams { container: container.map(String::from), follow, ..LogParams::default() };
        let pod_name = name.to_string();
        let (tx, rx) = mpsc::channel(LOG_BUFFER);
        tokio::spawn(async move {
            let stream = match pods.log_stream(&pod_name, &lp).await {
                Ok(stream) => stream,
                Err(e) => {
                    tx.send(Err(classify(Kind::Pod, &pod_name, e))).await.ok();
                    return;
                },
            };
            let mut stream = Box::pin(stream);
            let mut splitter = LineSplitter::default();
            while let Some(chunk) = stream.next().await {
                match chunk {
                    Ok(bytes) => {
                        for line in splitter.push(&bytes) {
                            if tx.send(Ok(line)).await.is_err() {
                                return;
                            }
                        }
                    },
                    Err(e) => {
                        tx.send(Err(classify(Kind::Pod, &pod_name, e))).await.ok();
                        return;
                    },
                }
            }
            if let Some(line) = splitter.finish() {
                tx.send(Ok(line)).await.ok();
            }
        });
        watch::receiver_stream(rx)
    }
}

fn retry_strategy() -> impl Iterator<Item = Duration> {
    ExponentialBackoff::from_millis(RETRY_BASE_DELAY.as_millis() as u64)
        .max_delay(RETRY_MAX_DELAY)
        .map(jitter)
        .take(MAX_TRANSIENT_RETRIES)
}

async fn with_retry<T, F, Fut>(kind: Kind, name: &str, action: F) -> Result<T, Error>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, kube::Error>>,
{
    RetryIf::spawn(retry_strategy(), action, |e: &kube::Error| {
        let transient = is_transient(e);
        if transient {
            warn!("{} {} reported transient error: '{}', will retry", kind, name, e);
        }
        transient
    })
    .await
    .map_err(|e| classify(kind, name, e))
}

pub fn is_transient(err: &kube::Error) -> bool {
    match err {
        kube::Error::Api(resp) => resp.code >= 500 || resp.code == HTTP_CODE_TOO_MANY_REQUESTS,
        kube::Error::HyperError(_) | kube::Error::Service(_) => true,
        _ => false,
    }
}

pub fn classify(kind: Kind, name: &str, err: kube::Error) -> Error {
    let response = match &err {
        kube::Error::Api(resp) => Some((resp.code, resp.message.clone())),
        _ => None,
    };
    match response {
        Some((HTTP_CODE_NOT_FOUND, _)) => Error::NotFound { kind, name: name.to_string() },
        Some((HTTP_CODE_UNAUTHORIZED, message)) | Some((HTTP_CODE_FORBIDDEN, message)) => {
            Error::Permission { kind, name: name.to_string(), message }
        },
        Some((HTTP_CODE_CONFLICT, message)) => Error::Conflict { kind, name: name.to_string(), message },
        _ => Error::KubeError { source: err },
    }
}

pub fn drop_resource_version(body: &mut Value) {
    if let Some(metadata) = body.get_mut("metadata").and_then(Value::as_object_mut) {
        metadata.remove("resourceVersion");
    }
}

/// Converts a dynamic object into one of the typed k8s-openapi resources.
pub fn to_typed<K: DeserializeOwned>(obj: &DynamicObject) -> Result<K, Error> {
    let value = serde_json::to_value(obj)?;
    Ok(serde_json::from_value(value)?)
}

pub mod apiclient_error {
    use std::time::Duration;

    use thiserror::Error;

    use crate::kinds::Kind;

    #[derive(Error, Debug)]
    pub enum Error {
        #[error("Kubernetes reported error: {source}")]
        KubeError {
            #[from]
            source: kube::Error,
        },

        #[error("{kind} '{name}' not found")]
        NotFound { kind: Kind, name: String },

        #[error("Permission denied on {kind} '{name}': {message}")]
        Permission { kind: Kind, name: String, message: String },

        #[error("Conflict when writing {kind} '{name}': {message}")]
        Conflict { kind: Kind, name: String, message: String },

        #[error("Malformed resource body: {source}")]
        SerdeError {
            #[from]
            source: serde_json::Error,
        },

        #[error("Timeout waiting for {} ({:.2}s)", what, max_wait.as_secs_f64())]
        Timeout { what: String, max_wait: Duration },
    }

    impl Error {
        pub fn is_not_found(&self) -> bool {
            matches!(self, Error::NotFound { .. })
        }
    }
}

#[cfg(test)]
mod test {
    use std::time::Duration;

    use futures::StreamExt;
    use serde_json::json;

    use super::*;
    use crate::{
        apiserver_mock::{timeout_after_5s, Testcases},
        watch::EventType,
    };

    #[tokio::test]
    async fn test_bkapp_conflict_retries_without_resource_version() {
        let (client, fakeserver) = ClusterClient::test();
        let bkapp = json!({
            "apiVersion": "paas.bk.tencent.com/v1alpha2",
            "kind": "BkApp",
            "metadata": { "name": "demo", "namespace": "bkapp-demo-stag", "resourceVersion": "7" },
            "spec": { "processes": [{ "name": "web", "replicas": 1 }] }
        });
        let mocksrv = fakeserver.run(Testcases::BkAppConflictRetry(bkapp.clone()));
        let updated = client
            .create_or_update(Kind::BkApp, "demo", "bkapp-demo-stag", &bkapp, MergeStrategy::Replace)
            .await
            .unwrap();
        assert_eq!(updated.metadata.name.as_deref(), Some("demo"));
        timeout_after_5s(mocksrv).await;
    }

    #[tokio::test]
    async fn test_replace_missing_object_creates_it() {
        let (client, fakeserver) = ClusterClient::test();
        let cm = json!({
            "apiVersion": "v1",
            "kind": "ConfigMap",
            "metadata": { "name": "demo-env", "namespace": "bkapp-demo-stag" },
            "data": { "FOO": "bar" }
        });
        let mocksrv = fakeserver.run(Testcases::ReplaceFallsBackToCreate(cm.clone()));
        client.create_or_update(Kind::ConfigMap, "demo-env", "bkapp-demo-stag", &cm, MergeStrategy::Replace).await.unwrap();
        timeout_after_5s(mocksrv).await;
    }

    #[tokio::test]
    async fn test_delete_missing_object_is_ok() {
        let (client, fakeserver) = ClusterClient::test();
        let mocksrv = fakeserver.run(Testcases::DeleteNotFound);
        client.delete(Kind::Pod, "slug-builder--bkapp-demo-stag", "bkapp-demo-stag", Some(1)).await.unwrap();
        timeout_after_5s(mocksrv).await;
    }

    #[tokio::test]
    async fn test_ensure_namespace_waits_for_default_service_account() {
        let (client, fakeserver) = ClusterClient::test();
        let mocksrv = fakeserver.run(Testcases::EnsureNamespace("bkapp-demo-stag".to_string()));
        client.ensure_namespace("bkapp-demo-stag", Duration::from_secs(3)).await.unwrap();
        timeout_after_5s(mocksrv).await;
    }

    #[tokio::test]
    async fn test_watch_error_is_delivered_as_last_event() {
        let (client, fakeserver) = ClusterClient::test();
        let mocksrv = fakeserver.run(Testcases::WatchEndsWithError);
        let events: Vec<WatchEvent> =
            client.watch(Kind::Pod, "bkapp-demo-stag", "", "0", Duration::from_secs(3)).await.collect().await;
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].type_, EventType::Added);
        assert_eq!(events[0].name(), "web-1");
        assert_eq!(events[1].type_, EventType::Error);
        assert_eq!(events[1].object["code"], 410);
        timeout_after_5s(mocksrv).await;
    }

    #[tokio::test]
    async fn test_resumed_watch_drops_replayed_events() {
        let (client, fakeserver) = ClusterClient::test();
        let mocksrv = fakeserver.run(Testcases::WatchResumesFrom("12".to_string()));
        let events: Vec<WatchEvent> =
            client.watch(Kind::Pod, "bkapp-demo-stag", "", "12", Duration::from_secs(3)).await.collect().await;
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].type_, EventType::Modified);
        assert_eq!(events[0].name(), "web-2");
        assert_eq!(events[0].resource_version, "13");
        timeout_after_5s(mocksrv).await;
    }

    #[test]
    fn test_classify() {
        let err = classify(
            Kind::Pod,
            "p",
            kube::Error::Api(kube::core::ErrorResponse {
                status: "Failure".into(),
                message: "forbidden".into(),
                reason: "Forbidden".into(),
                code: 403,
            }),
        );
        assert!(matches!(err, apiclient_error::Error::Permission { .. }));
        let busy = kube::Error::Api(kube::core::ErrorResponse {
            status: "Failure".into(),
            message: "slow down".into(),
            reason: "TooManyRequests".into(),
            code: 429,
        });
        assert!(is_transient(&busy));
    }
}
