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

use log::{debug, info};
use uuid::Uuid;

use super::{networking_error::Error, IngressSynchronizer};
use crate::{
    config::DomainConfig,
    entities::{Domain, Environment},
};
use common::apiclient::ResourceApi;

const MAX_HOST_LEN: usize = 253;
const MAX_LABEL_LEN: usize = 63;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DomainPayload {
    pub host: String,
    pub path_prefix: String,
    pub https_enabled: bool,
}

fn is_valid_label(label: &str) -> bool {
    !label.is_empty()
        && label.len() <= MAX_LABEL_LEN
        && !label.starts_with('-')
        && !label.ends_with('-')
        && label.chars().all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
}

pub fn is_valid_fqdn(host: &str) -> bool {
    let labels: Vec<&str> = host.split('.').collect();
    host.len() <= MAX_HOST_LEN && labels.len() >= 2 && labels.iter().all(|l| is_valid_label(l))
}

/// Accepts "/", "/seg" and "/seg/"; returns the prefix with a trailing slash.
pub fn normalize_path_prefix(path_prefix: &str) -> Result<String, Error> {
    let invalid = |reason: &str| Error::InvalidDomain { reason: format!("path_prefix '{}' {}", path_prefix, reason) };
    if !path_prefix.starts_with('/') {
        return Err(invalid("must start with '/'"));
    }
    if path_prefix.contains("..") {
        return Err(invalid("must not contain '..'"));
    }
    let segments: Vec<&str> = path_prefix.split('/').filter(|s| !s.is_empty()).collect();
    match segments.as_slice() {
        [] => Ok("/".to_string()),
        [segment] if segment.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_') => {
            Ok(format!("/{}/", segment))
        },
        [_] => Err(invalid("contains unsupported characters")),
        _ => Err(invalid("must contain at most one path segment")),
    }
}

/// Checks a custom domain against the entrances already declared by the
/// application. `editing` is the id of the domain being updated, if any.
pub fn validate_domain_payload(
    payload: &DomainPayload,
    env: Environment,
    existing: &[Domain],
    app_root_domains: &[DomainConfig],
    editing: Option<Uuid>,
) -> Result<DomainPayload, Error> {
    let host = payload.host.trim().to_lowercase();
    if !is_valid_fqdn(&host) {
        return Err(Error::InvalidDomain { reason: format!("'{}' is not a valid host", payload.host) });
    }
    if let Some(root) = app_root_domains.iter().find(|d| host == d.name || host.ends_with(&format!(".{}", d.name))) {
        return Err(Error::InvalidDomain { reason: format!("'{}' belongs to the platform domain {}", host, root.name) });
    }
    let path_prefix = normalize_path_prefix(&payload.path_prefix)?;
    if existing.iter().any(|d| Some(d.id) != editing && d.same_entrance(&host, &path_prefix, env)) {
        return Err(Error::DuplicatedDomain { host, path_prefix });
    }
    Ok(DomainPayload { host, path_prefix, https_enabled: payload.https_enabled })
}

impl<T: ResourceApi> IngressSynchronizer<T> {
    pub async fn create_domain(&self, wl_app: &str, payload: &DomainPayload) -> Result<Domain, Error> {
        debug!("start create_domain {} for {}", payload.host, wl_app);
        let wl = self.store.wl_app(wl_app).await?;
        let existing = self.store.domains(&wl.app_code, None).await;
        let root_domains = &self.config.cluster(&wl.cluster_name)?.ingress_config.app_root_domains;
        let valid = validate_domain_payload(payload, wl.env, &existing, root_domains, None)?;
        let domain = Domain {
            id: Uuid::new_v4(),
            app_code: wl.app_code.clone(),
            module_name: wl.module_name.clone(),
            env: wl.env,
            name: valid.host,
            path_prefix: valid.path_prefix,
            https_enabled: valid.https_enabled,
        };
        self.store.insert_domain(domain.clone()).await?;
        info!("Created custom domain {}{} for {}", domain.name, domain.path_prefix, wl_app);
        self.deploy_networking(wl_app).await?;
        Ok(domain)
    }

    pub async fn update_domain(&self, wl_app: &str, id: Uuid, payload: &DomainPayload) -> Result<Domain, Error> {
        debug!("start update_domain {} for {}", id, wl_app);
        let wl = self.store.wl_app(wl_app).await?;
        let mut domain = self.store.domain(id).await?;
        let existing = self.store.domains(&wl.app_code, None).await;
        let root_domains = &self.config.cluster(&wl.cluster_name)?.ingress_config.app_root_domains;
        let valid = validate_domain_payload(payload, domain.env, &existing, root_domains, Some(id))?;
        domain.name = valid.host;
        domain.path_prefix = valid.path_prefix;
        domain.https_enabled = valid.https_enabled;
        self.store.insert_domain(domain.clone()).await?;
        self.deploy_networking(wl_app).await?;
        Ok(domain)
    }

    pub async fn delete_domain(&self, wl_app: &str, id: Uuid) -> Result<(), Error> {
        debug!("start delete_domain {} for {}", id, wl_app);
        let removed = self.store.remove_domain(id).await?;
        info!("Deleted custom domain {}{} of {}", removed.name, removed.path_prefix, wl_app);
        self.deploy_networking(wl_app).await?;
        Ok(())
    }

    pub async fn list_domains(&self, wl_app: &str) -> Result<Vec<Domain>, Error> {
        let wl = self.store.wl_app(wl_app).await?;
        Ok(self.store.domains(&wl.app_code, Some(&wl.module_name)).await.into_iter().filter(|d| d.env == wl.env).collect())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn payload(host: &str, path_prefix: &str) -> DomainPayload {
        DomainPayload { host: host.to_string(), path_prefix: path_prefix.to_string(), https_enabled: false }
    }

    fn existing(host: &str, path_prefix: &str, module: &str) -> Domain {
        Domain {
            id: Uuid::new_v4(),
            app_code: "foo".into(),
            module_name: module.into(),
            env: Environment::Prod,
            name: host.into(),
            path_prefix: path_prefix.into(),
            https_enabled: false,
        }
    }

    #[test]
    fn test_path_prefix_rules() {
        assert_eq!(normalize_path_prefix("/").unwrap(), "/");
        assert_eq!(normalize_path_prefix("/api").unwrap(), "/api/");
        assert_eq!(normalize_path_prefix("/api/").unwrap(), "/api/");
        assert!(normalize_path_prefix("api/").is_err());
        assert!(normalize_path_prefix("/a/b/").is_err());
        assert!(normalize_path_prefix("/../").is_err());
    }

    #[test]
    fn test_validate_domain_payload() {
        let roots = vec![DomainConfig { name: "example.com".into(), https_enabled: false, reserved: false }];
        let domains = vec![existing("www.foo.org", "/", "api")];
        let ok = validate_domain_payload(&payload("WWW.Foo.org", "/blog"), Environment::Prod, &domains, &roots, None)
            .unwrap();
        assert_eq!((ok.host.as_str(), ok.path_prefix.as_str()), ("www.foo.org", "/blog/"));
        let dup = validate_domain_payload(&payload("www.foo.org", "/"), Environment::Prod, &domains, &roots, None);
        assert!(matches!(dup, Err(Error::DuplicatedDomain { .. })));
        assert!(validate_domain_payload(&payload("www.foo.org", "/"), Environment::Stag, &domains, &roots, None).is_ok());
        assert!(validate_domain_payload(&payload("www.foo.org", "/"), Environment::Prod, &domains, &roots, Some(domains[0].id))
            .is_ok());
        let platform = validate_domain_payload(&payload("foo.example.com", "/"), Environment::Prod, &[], &roots, None);
        assert!(matches!(platform, Err(Error::InvalidDomain { .. })));
        for bad in ["localhost", "-a.com", "a_b.com", "a..com"] {
            assert!(validate_domain_payload(&payload(bad, "/"), Environment::Prod, &[], &roots, None).is_err(), "{}", bad);
        }
    }
}
