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

use common::{
    apiclient::{ClusterClient, MergeStrategy, ResourceApi},
    kinds::Kind,
};
use kube::Client;
use serde_json::json;

const NAMESPACE: &str = "paas-it-cluster";

// Needs a reachable cluster from the default kubeconfig.
#[tokio::test]
#[ignore = "integration test"]
async fn test_configmap_lifecycle() {
    let client = Client::try_default().await.expect("failed to create client");
    let api = ClusterClient::new(client);
    api.ensure_namespace(NAMESPACE, Duration::from_secs(30)).await.expect("namespace not ready");

    let body = json!({
        "apiVersion": "v1",
        "kind": "ConfigMap",
        "metadata": {"name": "it-config", "namespace": NAMESPACE},
        "data": {"key": "first"}
    });
    api.create_or_update(Kind::ConfigMap, "it-config", NAMESPACE, &body, MergeStrategy::Replace).await.unwrap();

    let patch = json!({"data": {"key": "second"}});
    api.create_or_update(Kind::ConfigMap, "it-config", NAMESPACE, &patch, MergeStrategy::MergePatch).await.unwrap();
    let got = api.get(Kind::ConfigMap, "it-config", NAMESPACE).await.unwrap();
    assert_eq!(got.data["data"]["key"], "second");

    api.delete(Kind::ConfigMap, "it-config", NAMESPACE, Some(0)).await.unwrap();
    // deleting twice is fine
    api.delete(Kind::ConfigMap, "it-config", NAMESPACE, Some(0)).await.unwrap();
    let err = api.get(Kind::ConfigMap, "it-config", NAMESPACE).await.unwrap_err();
    assert!(err.is_not_found());
    api.delete(Kind::Namespace, NAMESPACE, "", None).await.unwrap();
}
