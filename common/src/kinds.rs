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

use std::fmt;

use kube::api::ApiResource;

/// Resource kinds the control plane reads or writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Kind {
    Deployment,
    Pod,
    Service,
    Ingress,
    Namespace,
    Secret,
    ConfigMap,
    ServiceAccount,
    BkApp,
    DomainGroupMapping,
    ServiceMonitor,
    GeneralPodAutoscaler,
    BkLogConfig,
}

impl Kind {
    fn coordinates(&self) -> (&'static str, &'static str, &'static str, &'static str) {
        match self {
            Kind::Deployment => ("apps", "v1", "Deployment", "deployments"),
            Kind::Pod => ("", "v1", "Pod", "pods"),
            Kind::Service => ("", "v1", "Service", "services"),
            Kind::Ingress => ("networking.k8s.io", "v1", "Ingress", "ingresses"),
            Kind::Namespace => ("", "v1", "Namespace", "namespaces"),
            Kind::Secret => ("", "v1", "Secret", "secrets"),
            Kind::ConfigMap => ("", "v1", "ConfigMap", "configmaps"),
            Kind::ServiceAccount => ("", "v1", "ServiceAccount", "serviceaccounts"),
            Kind::BkApp => ("paas.bk.tencent.com", "v1alpha2", "BkApp", "bkapps"),
            Kind::DomainGroupMapping => ("paas.bk.tencent.com", "v1alpha1", "DomainGroupMapping", "domaingroupmappings"),
            Kind::ServiceMonitor => ("monitoring.coreos.com", "v1", "ServiceMonitor", "servicemonitors"),
            Kind::GeneralPodAutoscaler => {
                ("autoscaling.tkex.tencent.com", "v1alpha1", "GeneralPodAutoscaler", "generalpodautoscalers")
            },
            Kind::BkLogConfig => ("bk.tencent.com", "v1alpha1", "BkLogConfig", "bklogconfigs"),
        }
    }

    pub fn api_resource(&self) -> ApiResource {
        let (group, version, kind, plural) = self.coordinates();
        let api_version = if group.is_empty() { version.to_string() } else { format!("{}/{}", group, version) };
        ApiResource {
            group: group.to_string(),
            version: version.to_string(),
            api_version,
            kind: kind.to_string(),
            plural: plural.to_string(),
        }
    }

    pub fn api_version(&self) -> String {
        self.api_resource().api_version
    }

    pub fn is_namespaced(&self) -> bool {
        !matches!(self, Kind::Namespace)
    }

    /// Kinds whose updates are retried on 409 after dropping `metadata.resourceVersion`.
    pub fn retries_on_conflict(&self) -> bool {
        matches!(self, Kind::BkApp)
    }
}

impl fmt::Display for Kind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.coordinates().2)
    }
}

#[cfg(test)]
mod test {
    use super::Kind;

    #[test]
    fn test_api_version() {
        assert_eq!(Kind::Pod.api_version(), "v1");
        assert_eq!(Kind::Deployment.api_version(), "apps/v1");
        assert_eq!(Kind::BkApp.api_version(), "paas.bk.tencent.com/v1alpha2");
        assert_eq!(Kind::Ingress.api_resource().plural, "ingresses");
        assert!(!Kind::Namespace.is_namespaced());
        assert!(Kind::BkApp.retries_on_conflict());
        assert!(!Kind::ConfigMap.retries_on_conflict());
    }
}
