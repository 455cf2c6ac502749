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

use k8s_openapi::api::core::v1::{ContainerStatus, Pod};
use serde::{Deserialize, Serialize};

use common::values::{POD_PHASE_PENDING, POD_PHASE_RUNNING, POD_PHASE_SUCCEEDED};

const NOT_FAILING_REASONS: [&str; 2] = ["ContainerCreating", "PodInitializing"];
const SCHEDULING_FAILURES: [&str; 2] = ["Unschedulable", "SchedulingGated"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum HealthStatus {
    Healthy,
    Unhealthy,
    Progressing,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PodHealth {
    pub status: HealthStatus,
    pub message: Option<String>,
}

impl PodHealth {
    fn new(status: HealthStatus, message: Option<String>) -> Self {
        PodHealth { status, message }
    }
}

fn non_empty(s: &Option<String>) -> Option<String> {
    s.as_ref().filter(|s| !s.is_empty()).cloned()
}

/// Why a container is failing, if it is.
pub fn container_failure_message(status: &ContainerStatus) -> Option<String> {
    let state = status.state.as_ref()?;
    if let Some(terminated) = &state.terminated {
        if let Some(message) = non_empty(&terminated.message) {
            return Some(message);
        }
        if terminated.reason.as_deref() == Some("OOMKilled") {
            return Some("OOMKilled".to_string());
        }
        if terminated.exit_code != 0 {
            return Some(format!("failed with exit code {}", terminated.exit_code));
        }
    }
    if let Some(waiting) = &state.waiting {
        if let Some(message) = non_empty(&waiting.message) {
            return Some(message);
        }
        if let Some(reason) = non_empty(&waiting.reason) {
            if !NOT_FAILING_REASONS.contains(&reason.as_str()) {
                return Some(reason);
            }
        }
    }
    None
}

/// First failure message among the pod's containers.
pub fn pod_failure_message(pod: &Pod) -> Option<String> {
    pod.status
        .as_ref()
        .and_then(|s| s.container_statuses.as_ref())
        .and_then(|statuses| statuses.iter().find_map(container_failure_message))
}

/// Message of a `PodScheduled=False` condition caused by scheduling.
pub fn scheduling_failure(pod: &Pod) -> Option<String> {
    let conditions = pod.status.as_ref()?.conditions.as_ref()?;
    conditions
        .iter()
        .find(|c| {
            c.type_ == "PodScheduled"
                && c.status == "False"
                && c.reason.as_deref().map_or(false, |r| SCHEDULING_FAILURES.contains(&r))
        })
        .map(|c| non_empty(&c.message).or_else(|| c.reason.clone()).unwrap_or_default())
}

pub fn pod_phase(pod: &Pod) -> &str {
    pod.status.as_ref().and_then(|s| s.phase.as_deref()).unwrap_or(POD_PHASE_PENDING)
}

fn is_ready(pod: &Pod) -> bool {
    pod.status
        .as_ref()
        .and_then(|s| s.conditions.as_ref())
        .map_or(false, |conditions| conditions.iter().any(|c| c.type_ == "Ready" && c.status == "True"))
}

pub fn pod_health(pod: &Pod) -> PodHealth {
    let restart_always = pod.spec.as_ref().and_then(|s| s.restart_policy.as_deref()).unwrap_or("Always") == "Always";
    match pod_phase(pod) {
        POD_PHASE_SUCCEEDED => PodHealth::new(HealthStatus::Healthy, None),
        POD_PHASE_RUNNING if restart_always && is_ready(pod) => PodHealth::new(HealthStatus::Healthy, None),
        POD_PHASE_RUNNING => match pod_failure_message(pod) {
            Some(message) => PodHealth::new(HealthStatus::Unhealthy, Some(message)),
            None => PodHealth::new(HealthStatus::Progressing, None),
        },
        POD_PHASE_PENDING => match scheduling_failure(pod) {
            Some(message) => PodHealth::new(HealthStatus::Unhealthy, Some(message)),
            None => PodHealth::new(HealthStatus::Progressing, None),
        },
        _ => PodHealth::new(HealthStatus::Progressing, None),
    }
}

#[cfg(test)]
mod test {
    use serde_json::json;

    use super::*;

    fn pod(status: serde_json::Value) -> Pod {
        serde_json::from_value(json!({
            "apiVersion": "v1",
            "kind": "Pod",
            "metadata": {"name": "web-1"},
            "spec": {"containers": [{"name": "main"}], "restartPolicy": "Always"},
            "status": status,
        }))
        .unwrap()
    }

    fn container(state: serde_json::Value) -> ContainerStatus {
        serde_json::from_value(json!({
            "name": "main", "image": "x", "imageID": "", "ready": false, "restartCount": 0, "state": state,
        }))
        .unwrap()
    }

    #[test]
    fn test_container_failure_message_order() {
        let cases = vec![
            (json!({"terminated": {"exitCode": 1, "reason": "OOMKilled", "message": "boom"}}), Some("boom")),
            (json!({"terminated": {"exitCode": 137, "reason": "OOMKilled"}}), Some("OOMKilled")),
            (json!({"terminated": {"exitCode": 2, "reason": "Error"}}), Some("failed with exit code 2")),
            (json!({"terminated": {"exitCode": 0, "reason": "Completed"}}), None),
            (json!({"waiting": {"reason": "CrashLoopBackOff", "message": "back-off restarting"}}), Some("back-off restarting")),
            (json!({"waiting": {"reason": "ImagePullBackOff"}}), Some("ImagePullBackOff")),
            (json!({"waiting": {"reason": "ContainerCreating"}}), None),
            (json!({"running": {}}), None),
        ];
        for (state, expected) in cases {
            assert_eq!(container_failure_message(&container(state.clone())).as_deref(), expected, "{}", state);
        }
    }

    #[test]
    fn test_pod_health() {
        let healthy = pod(json!({"phase": "Running", "conditions": [{"type": "Ready", "status": "True"}]}));
        assert_eq!(pod_health(&healthy).status, HealthStatus::Healthy);

        let crashing = pod(json!({
            "phase": "Running",
            "conditions": [{"type": "Ready", "status": "False"}],
            "containerStatuses": [{
                "name": "main", "image": "x", "imageID": "", "ready": false, "restartCount": 3,
                "state": {"waiting": {"reason": "CrashLoopBackOff"}},
            }],
        }));
        assert_eq!(pod_health(&crashing), PodHealth::new(HealthStatus::Unhealthy, Some("CrashLoopBackOff".into())));

        let unschedulable = pod(json!({
            "phase": "Pending",
            "conditions": [{
                "type": "PodScheduled", "status": "False", "reason": "Unschedulable",
                "message": "0/3 nodes are available",
            }],
        }));
        assert_eq!(
            pod_health(&unschedulable),
            PodHealth::new(HealthStatus::Unhealthy, Some("0/3 nodes are available".into()))
        );

        assert_eq!(pod_health(&pod(json!({"phase": "Succeeded"}))).status, HealthStatus::Healthy);
        assert_eq!(pod_health(&pod(json!({"phase": "Pending"}))).status, HealthStatus::Progressing);
    }
}
