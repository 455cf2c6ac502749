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

//! Built-in entrances of a module environment: subdomains under the
//! cluster's app root domains and subpaths under its sub path domains.
//! Everything here is computed from configuration, without I/O.

mod url;

use serde::Serialize;

pub use self::url::Url;
use crate::{
    config::{DomainConfig, IngressConfig},
    entities::{Environment, ExposedUrlType, WlApp},
};

/// Lower is more specific.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AddressPriority {
    Stable = 1,
    WithoutModule = 2,
    OnlyCode = 3,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Address {
    pub url: Url,
    pub priority: AddressPriority,
    pub reserved: bool,
    pub exposed_type: ExposedUrlType,
}

impl Address {
    pub fn as_string(&self) -> String {
        self.url.to_string()
    }

    fn sort_key(&self) -> (AddressPriority, usize) {
        (self.priority, self.url.to_string().len())
    }
}

/// Lowercases and replaces every character outside `[a-z0-9-]` with `--`.
pub fn to_dns_safe(value: &str) -> String {
    let mut safe = String::with_capacity(value.len());
    for c in value.to_lowercase().chars() {
        if c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-' {
            safe.push(c);
        } else {
            safe.push_str("--");
        }
    }
    safe
}

#[derive(Debug, Clone)]
pub struct AddrAllocator<'a> {
    pub app_code: &'a str,
    pub module_name: &'a str,
    pub env: Environment,
    pub is_default_module: bool,
    pub ingress: &'a IngressConfig,
    /// `(region, engine app name)` when the legacy subpath is enabled.
    pub legacy_subpath: Option<(&'a str, &'a str)>,
}

impl<'a> AddrAllocator<'a> {
    pub fn new(
        app_code: &'a str,
        module_name: &'a str,
        env: Environment,
        is_default_module: bool,
        ingress: &'a IngressConfig,
    ) -> Self {
        AddrAllocator { app_code, module_name, env, is_default_module, ingress, legacy_subpath: None }
    }

    pub fn for_wl_app(wl_app: &'a WlApp, ingress: &'a IngressConfig, legacy_compat: bool) -> Self {
        let mut allocator =
            AddrAllocator::new(&wl_app.app_code, &wl_app.module_name, wl_app.env, wl_app.is_default_module, ingress);
        if legacy_compat {
            allocator.legacy_subpath = Some((&wl_app.region, &wl_app.name));
        }
        allocator
    }

    fn priorities(&self) -> Vec<AddressPriority> {
        let mut priorities = vec![AddressPriority::Stable];
        if self.is_default_module {
            priorities.push(AddressPriority::WithoutModule);
            if self.env == Environment::Prod {
                priorities.push(AddressPriority::OnlyCode);
            }
        }
        priorities
    }

    /// Env, module and app code, each made DNS safe.
    fn safe_names(&self) -> (String, String, String) {
        (to_dns_safe(self.env.as_str()), to_dns_safe(self.module_name), to_dns_safe(self.app_code))
    }

    fn subdomain_prefix(&self, priority: AddressPriority) -> String {
        let (env, module, code) = self.safe_names();
        match priority {
            AddressPriority::Stable => format!("{}-dot-{}-dot-{}", env, module, code),
            AddressPriority::WithoutModule => format!("{}-dot-{}", env, code),
            AddressPriority::OnlyCode => code,
        }
    }

    fn subpath(&self, priority: AddressPriority) -> String {
        let (env, module, code) = self.safe_names();
        match priority {
            AddressPriority::Stable => format!("/{}--{}--{}/", env, module, code),
            AddressPriority::WithoutModule => format!("/{}--{}/", env, code),
            AddressPriority::OnlyCode => format!("/{}/", code),
        }
    }

    fn address(
        &self,
        domain: &DomainConfig,
        host: String,
        path: String,
        priority: AddressPriority,
        exposed_type: ExposedUrlType,
    ) -> Address {
        let scheme = if domain.https_enabled { "https" } else { "http" };
        let port = self.ingress.port_map.port_for(scheme);
        Address { url: Url::new(scheme, &host, port, &path), priority, reserved: domain.reserved, exposed_type }
    }

    pub fn subdomains(&self) -> Vec<Address> {
        let mut addresses = Vec::new();
        for domain in &self.ingress.app_root_domains {
            for priority in self.priorities() {
                let host = format!("{}.{}", self.subdomain_prefix(priority), domain.name);
                addresses.push(self.address(domain, host, "/".to_string(), priority, ExposedUrlType::Subdomain));
            }
        }
        addresses
    }

    pub fn subpaths(&self) -> Vec<Address> {
        let mut addresses = Vec::new();
        for domain in &self.ingress.sub_path_domains {
            for priority in self.priorities() {
                let path = self.subpath(priority);
                addresses.push(self.address(domain, domain.name.clone(), path, priority, ExposedUrlType::Subpath));
            }
            if let Some((region, engine_app_name)) = self.legacy_subpath {
                let path = format!("/{}-{}/", region, engine_app_name);
                addresses.push(self.address(
                    domain,
                    domain.name.clone(),
                    path,
                    AddressPriority::Stable,
                    ExposedUrlType::Subpath,
                ));
            }
        }
        addresses
    }

    /// Candidates sorted by (priority, URL length). Reserved root domains
    /// are only part of the result when asked for.
    pub fn list_available(&self, exposed_type: ExposedUrlType, include_reserved: bool) -> Vec<Address> {
        let mut addresses = match exposed_type {
            ExposedUrlType::Subdomain => self.subdomains(),
            ExposedUrlType::Subpath => self.subpaths(),
        };
        addresses.retain(|a| include_reserved || !a.reserved);
        addresses.sort_by_key(Address::sort_key);
        addresses
    }

    pub fn highest_priority(&self, exposed_type: ExposedUrlType, include_reserved: bool) -> Option<Address> {
        self.list_available(exposed_type, include_reserved).into_iter().next()
    }

    pub fn shortest(&self, exposed_type: ExposedUrlType, include_reserved: bool) -> Option<Address> {
        self.list_available(exposed_type, include_reserved)
            .into_iter()
            .min_by_key(|a| (a.url.to_string().len(), a.priority))
    }
}
