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

use http::{Request, Response, StatusCode};
use hyper::{body::to_bytes, Body};
use kube::Client as KubeClient;
use serde_json::{json, Value};

use self::mock_error::Error;
use crate::apiclient::ClusterClient;

type ApiServerHandle = tower_test::mock::Handle<Request<Body>, Response<Body>>;
pub struct ApiServerVerifier(ApiServerHandle);

pub enum Testcases {
    BkAppConflictRetry(Value),
    ReplaceFallsBackToCreate(Value),
    DeleteNotFound,
    EnsureNamespace(String),
    WatchEndsWithError,
    WatchResumesFrom(String),
}

pub async fn timeout_after_5s(handle: tokio::task::JoinHandle<()>) {
    tokio::time::timeout(std::time::Duration::from_secs(5), handle)
        .await
        .expect("timeout on mock apiserver")
        .expect("scenario succeeded")
}

fn status_body(code: u16, reason: &str, message: &str) -> Body {
    let status = json!({ "kind": "Status", "apiVersion": "v1", "status": "Failure", "reason": reason, "message": message, "code": code });
    Body::from(serde_json::to_vec(&status).unwrap())
}

async fn body_json(request: Request<Body>) -> Value {
    let req_body = to_bytes(request.into_body()).await.unwrap();
    serde_json::from_slice(&req_body).expect("valid document from runtime")
}

impl ApiServerVerifier {
    pub fn run(self, cases: Testcases) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            match cases {
                Testcases::BkAppConflictRetry(bkapp) => {
                    self.handler_bkapp_put_conflict(true)
                        .await
                        .unwrap()
                        .handler_bkapp_put_conflict(false)
                        .await
                        .unwrap()
                        .handler_bkapp_put_ok(bkapp)
                        .await
                },
                Testcases::ReplaceFallsBackToCreate(obj) => {
                    self.handler_replace_not_found().await.unwrap().handler_create(obj).await
                },
                Testcases::DeleteNotFound => self.handler_delete_not_found().await,
                Testcases::EnsureNamespace(name) => {
                    self.handler_namespace_get_not_found(&name)
                        .await
                        .unwrap()
                        .handler_namespace_create(&name)
                        .await
                        .unwrap()
                        .handler_service_account_get(&name, false)
                        .await
                        .unwrap()
                        .handler_service_account_get(&name, true)
                        .await
                },
                Testcases::WatchEndsWithError => self.handler_pod_watch_with_error().await,
                Testcases::WatchResumesFrom(version) => self.handler_pod_watch_replaying(&version).await,
            }
            .expect("scenario completed without errors");
        })
    }

    async fn handler_bkapp_put_conflict(mut self, expect_resource_version: bool) -> Result<Self, Error> {
        let (request, send) = self.0.next_request().await.expect("service not called");
        assert_eq!(request.method(), http::Method::PUT);
        assert_eq!(request.uri().path(), "/apis/paas.bk.tencent.com/v1alpha2/namespaces/bkapp-demo-stag/bkapps/demo");
        let body = body_json(request).await;
        assert_eq!(body.pointer("/metadata/resourceVersion").is_some(), expect_resource_version);
        send.send_response(
            Response::builder()
                .status(StatusCode::CONFLICT)
                .body(status_body(409, "Conflict", "the object has been modified"))
                .unwrap(),
        );
        Ok(self)
    }

    async fn handler_bkapp_put_ok(mut self, bkapp: Value) -> Result<Self, Error> {
        let (request, send) = self.0.next_request().await.expect("service not called");
        assert_eq!(request.method(), http::Method::PUT);
        let body = body_json(request).await;
        assert!(body.pointer("/metadata/resourceVersion").is_none());
        assert_eq!(body["spec"], bkapp["spec"]);
        send.send_response(Response::builder().body(Body::from(serde_json::to_vec(&body).unwrap())).unwrap());
        Ok(self)
    }

    async fn handler_replace_not_found(mut self) -> Result<Self, Error> {
        let (request, send) = self.0.next_request().await.expect("service not called");
        assert_eq!(request.method(), http::Method::PUT);
        assert_eq!(request.uri().path(), "/api/v1/namespaces/bkapp-demo-stag/configmaps/demo-env");
        send.send_response(
            Response::builder()
                .status(StatusCode::NOT_FOUND)
                .body(status_body(404, "NotFound", "configmaps \"demo-env\" not found"))
                .unwrap(),
        );
        Ok(self)
    }

    async fn handler_create(mut self, obj: Value) -> Result<Self, Error> {
        let (request, send) = self.0.next_request().await.expect("service not called");
        assert_eq!(request.method(), http::Method::POST);
        assert_eq!(request.uri().path(), "/api/v1/namespaces/bkapp-demo-stag/configmaps");
        let body = body_json(request).await;
        assert_eq!(body["data"], obj["data"]);
        send.send_response(
            Response::builder().status(StatusCode::CREATED).body(Body::from(serde_json::to_vec(&body).unwrap())).unwrap(),
        );
        Ok(self)
    }

    async fn handler_delete_not_found(mut self) -> Result<Self, Error> {
        let (request, send) = self.0.next_request().await.expect("service not called");
        assert_eq!(request.method(), http::Method::DELETE);
        assert_eq!(request.uri().path(), "/api/v1/namespaces/bkapp-demo-stag/pods/slug-builder--bkapp-demo-stag");
        send.send_response(
            Response::builder().status(StatusCode::NOT_FOUND).body(status_body(404, "NotFound", "pod not found")).unwrap(),
        );
        Ok(self)
    }

    async fn handler_namespace_get_not_found(mut self, name: &str) -> Result<Self, Error> {
        let (request, send) = self.0.next_request().await.expect("service not called");
        assert_eq!(request.method(), http::Method::GET);
        assert_eq!(request.uri().path(), format!("/api/v1/namespaces/{}", name));
        send.send_response(
            Response::builder()
                .status(StatusCode::NOT_FOUND)
                .body(status_body(404, "NotFound", "namespace not found"))
                .unwrap(),
        );
        Ok(self)
    }

    async fn handler_namespace_create(mut self, name: &str) -> Result<Self, Error> {
        let (request, send) = self.0.next_request().await.expect("service not called");
        assert_eq!(request.method(), http::Method::POST);
        assert_eq!(request.uri().path(), "/api/v1/namespaces");
        let body = body_json(request).await;
        assert_eq!(body["metadata"]["name"], name);
        send.send_response(
            Response::builder().status(StatusCode::CREATED).body(Body::from(serde_json::to_vec(&body).unwrap())).unwrap(),
        );
        Ok(self)
    }

    async fn handler_service_account_get(mut self, namespace: &str, ready: bool) -> Result<Self, Error> {
        let (request, send) = self.0.next_request().await.expect("service not called");
        assert_eq!(request.method(), http::Method::GET);
        assert_eq!(request.uri().path(), format!("/api/v1/namespaces/{}/serviceaccounts/default", namespace));
        let response = if ready {
            let sa = json!({
                "apiVersion": "v1",
                "kind": "ServiceAccount",
                "metadata": { "name": "default", "namespace": namespace }
            });
            Response::builder().body(Body::from(serde_json::to_vec(&sa).unwrap())).unwrap()
        } else {
            Response::builder()
                .status(StatusCode::NOT_FOUND)
                .body(status_body(404, "NotFound", "serviceaccount not found"))
                .unwrap()
        };
        send.send_response(response);
        Ok(self)
    }

    async fn handler_pod_watch_with_error(mut self) -> Result<Self, Error> {
        let (request, send) = self.0.next_request().await.expect("service not called");
        assert_eq!(request.method(), http::Method::GET);
        assert_eq!(request.uri().path(), "/api/v1/namespaces/bkapp-demo-stag/pods");
        let query = request.uri().query().unwrap_or_default().to_string();
        if !query.contains("watch=true") {
            return Err(Error::ArgumentError);
        }
        let added = json!({
            "type": "ADDED",
            "object": {
                "apiVersion": "v1",
                "kind": "Pod",
                "metadata": { "name": "web-1", "namespace": "bkapp-demo-stag", "resourceVersion": "11" }
            }
        });
        let expired = json!({
            "type": "ERROR",
            "object": { "status": "Failure", "message": "too old resource version", "reason": "Expired", "code": 410 }
        });
        let lines = format!("{}\n{}\n", added, expired);
        send.send_response(Response::builder().body(Body::from(lines)).unwrap());
        Ok(self)
    }

    async fn handler_pod_watch_replaying(mut self, version: &str) -> Result<Self, Error> {
        let (request, send) = self.0.next_request().await.expect("service not called");
        assert_eq!(request.method(), http::Method::GET);
        assert_eq!(request.uri().path(), "/api/v1/namespaces/bkapp-demo-stag/pods");
        let query = request.uri().query().unwrap_or_default().to_string();
        if !query.contains("watch=true") || !query.contains(&format!("resourceVersion={}", version)) {
            return Err(Error::ArgumentError);
        }
        let lines: String = [("ADDED", "web-1", "11"), ("MODIFIED", "web-1", "12"), ("MODIFIED", "web-2", "13")]
            .iter()
            .map(|(type_, name, rv)| {
                let event = json!({
                    "type": type_,
                    "object": {
                        "apiVersion": "v1",
                        "kind": "Pod",
                        "metadata": { "name": name, "namespace": "bkapp-demo-stag", "resourceVersion": rv }
                    }
                });
                format!("{}\n", event)
            })
            .collect();
        send.send_response(Response::builder().body(Body::from(lines)).unwrap());
        Ok(self)
    }
}

pub mod mock_error {
    use thiserror::Error;

    #[derive(Error, Debug)]
    pub enum Error {
        #[error("Kubernetes reported error: {source}")]
        KubeError {
            #[from]
            source: kube::Error,
        },

        #[error("Parameters other than expected were entered")]
        ArgumentError,
    }
}

impl ClusterClient {
    pub fn test() -> (ClusterClient, ApiServerVerifier) {
        let (mock_service, handle) = tower_test::mock::pair::<Request<Body>, Response<Body>>();
        let mock_k8s_client = KubeClient::new(mock_service, "default");
        (ClusterClient::new(mock_k8s_client), ApiServerVerifier(handle))
    }
}
