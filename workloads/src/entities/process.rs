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

use std::collections::{BTreeMap, HashSet};

use common::crd::{AutoscalingSpec, ProbeSet, ProcService};
use serde::{Deserialize, Serialize};

use super::entity_error::Error;

pub const MAX_REPLICAS: i32 = 20;
pub const MAX_PROC_NAME_LEN: usize = 12;
pub const DEFAULT_PLAN: &str = "default";

const RESERVED_ENV_PREFIXES: [&str; 2] = ["BKPAAS_", "BK_"];

/// Process declared by the user, either in the application description or
/// by the deployment request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct ProcessTmpl {
    pub name: String,
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default = "default_replicas")]
    pub replicas: i32,
    #[serde(default = "default_plan")]
    pub plan: String,
    #[serde(default)]
    pub resources: Option<ResQuota>,
    #[serde(default)]
    pub target_port: Option<i32>,
    #[serde(default)]
    pub probes: Option<ProbeSet>,
    #[serde(default)]
    pub services: Option<Vec<ProcService>>,
    #[serde(default)]
    pub autoscaling: Option<AutoscalingSpec>,
}

fn default_replicas() -> i32 {
    1
}

fn default_plan() -> String {
    DEFAULT_PLAN.to_string()
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct ResQuota {
    pub cpu_limit: String,
    pub memory_limit: String,
    #[serde(default)]
    pub cpu_request: Option<String>,
    #[serde(default)]
    pub memory_request: Option<String>,
}

/// Process row kept per workload; replicas and plan survive command updates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessSpec {
    pub app: String,
    pub name: String,
    pub command: String,
    pub replicas: i32,
    pub plan: String,
    pub probes: Option<ProbeSet>,
}

/// Parses a CPU quantity ("500m", "2", "1.5") into millicores.
pub fn parse_cpu(value: &str) -> Result<u64, Error> {
    let invalid = || Error::validation("cpu", format!("'{}' is not a valid cpu quantity", value));
    let value = value.trim();
    if let Some(milli) = value.strip_suffix('m') {
        return milli.parse::<u64>().map_err(|_| invalid());
    }
    let cores: f64 = value.parse().map_err(|_| invalid())?;
    if cores.is_sign_negative() || !cores.is_finite() {
        return Err(invalid());
    }
    Ok((cores * 1000.0).round() as u64)
}

/// Parses a memory quantity ("512Mi", "2Gi", "1024Ki", "1048576") into MiB.
pub fn parse_memory(value: &str) -> Result<u64, Error> {
    let invalid = || Error::validation("memory", format!("'{}' is not a valid memory quantity", value));
    let value = value.trim();
    let (number, factor_kib) = if let Some(n) = value.strip_suffix("Gi") {
        (n, 1024 * 1024)
    } else if let Some(n) = value.strip_suffix("Mi") {
        (n, 1024)
    } else if let Some(n) = value.strip_suffix("Ki") {
        (n, 1)
    } else {
        let bytes = value.parse::<u64>().map_err(|_| invalid())?;
        return Ok(bytes / (1024 * 1024));
    };
    let number = number.parse::<u64>().map_err(|_| invalid())?;
    Ok(number * factor_kib / 1024)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcLimits {
    pub max_cpu_millis: u64,
    pub max_memory_mib: u64,
}

impl ResQuota {
    pub fn validate(&self, limits: &ProcLimits) -> Result<(), Error> {
        let cpu_limit = parse_cpu(&self.cpu_limit)?;
        let memory_limit = parse_memory(&self.memory_limit)?;
        if cpu_limit > limits.max_cpu_millis {
            return Err(Error::validation("cpu", format!("limit {} exceeds {}m", self.cpu_limit, limits.max_cpu_millis)));
        }
        if memory_limit > limits.max_memory_mib {
            return Err(Error::validation(
                "memory",
                format!("limit {} exceeds {}Mi", self.memory_limit, limits.max_memory_mib),
            ));
        }
        if let Some(request) = &self.cpu_request {
            if parse_cpu(request)? > cpu_limit {
                return Err(Error::validation("cpu", format!("request {} is above limit {}", request, self.cpu_limit)));
            }
        }
        if let Some(request) = &self.memory_request {
            if parse_memory(request)? > memory_limit {
                return Err(Error::validation(
                    "memory",
                    format!("request {} is above limit {}", request, self.memory_limit),
                ));
            }
        }
        Ok(())
    }
}

pub fn validate_procfile(processes: &[ProcessTmpl]) -> Result<(), Error> {
    let mut seen = HashSet::new();
    for process in processes {
        let name = process.name.to_lowercase();
        if !seen.insert(name.clone()) {
            return Err(Error::validation("processes", format!("duplicate process name '{}'", process.name)));
        }
        let dns_safe = name.starts_with(|c: char| c.is_ascii_lowercase())
            && name.chars().all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-');
        if !dns_safe || name.len() > MAX_PROC_NAME_LEN {
            return Err(Error::validation("processes", format!("invalid process name '{}'", process.name)));
        }
        if process.command.trim().is_empty() {
            return Err(Error::validation("processes", format!("process '{}' has an empty command", process.name)));
        }
        if !(0..=MAX_REPLICAS).contains(&process.replicas) {
            return Err(Error::validation(
                "processes",
                format!("replicas of '{}' must be within 0..={}", process.name, MAX_REPLICAS),
            ));
        }
    }
    Ok(())
}

pub fn validate_processes(processes: &[ProcessTmpl], limits: &ProcLimits) -> Result<(), Error> {
    validate_procfile(processes)?;
    for quota in processes.iter().filter_map(|p| p.resources.as_ref()) {
        quota.validate(limits)?;
    }
    Ok(())
}

/// Built-in variables are injected by the platform and cannot be overridden.
pub fn validate_env_keys<'a>(keys: impl IntoIterator<Item = &'a String>) -> Result<(), Error> {
    for key in keys {
        if RESERVED_ENV_PREFIXES.iter().any(|prefix| key.starts_with(prefix)) {
            return Err(Error::conflict("env", format!("'{}' conflicts with a built-in variable", key)));
        }
    }
    Ok(())
}

pub fn procfile_of(processes: &[ProcessTmpl]) -> BTreeMap<String, String> {
    processes.iter().map(|p| (p.name.clone(), p.command.clone())).collect()
}

#[cfg(test)]
mod test {
    use super::*;

    fn tmpl(name: &str) -> ProcessTmpl {
        ProcessTmpl { name: name.into(), command: "run".into(), replicas: 1, ..Default::default() }
    }

    const LIMITS: ProcLimits = ProcLimits { max_cpu_millis: 4000, max_memory_mib: 4096 };

    #[test]
    fn test_parse_quantities() {
        assert_eq!(parse_cpu("500m").unwrap(), 500);
        assert_eq!(parse_cpu("2").unwrap(), 2000);
        assert_eq!(parse_cpu("0.25").unwrap(), 250);
        assert!(parse_cpu("two").is_err());
        assert_eq!(parse_memory("512Mi").unwrap(), 512);
        assert_eq!(parse_memory("2Gi").unwrap(), 2048);
        assert_eq!(parse_memory("2048Ki").unwrap(), 2);
        assert!(parse_memory("1Tb").is_err());
    }

    #[test]
    fn test_duplicate_process_names() {
        let err = validate_procfile(&[tmpl("web"), tmpl("WEB")]).unwrap_err();
        assert!(matches!(err, Error::Validation { .. }));
        assert!(validate_procfile(&[tmpl("web"), tmpl("worker")]).is_ok());
        assert!(validate_procfile(&[tmpl("web_1")]).is_err());
    }

    #[test]
    fn test_quota_bounds() {
        let mut quota = ResQuota { cpu_limit: "2".into(), memory_limit: "1Gi".into(), ..Default::default() };
        assert!(quota.validate(&LIMITS).is_ok());
        quota.cpu_request = Some("3000m".into());
        assert!(quota.validate(&LIMITS).is_err());
        quota.cpu_request = None;
        quota.memory_limit = "8Gi".into();
        assert!(quota.validate(&LIMITS).is_err());
    }

    #[test]
    fn test_reserved_env_keys() {
        let keys = vec!["FOO".to_string(), "BKPAAS_APP_ID".to_string()];
        assert!(matches!(validate_env_keys(&keys), Err(Error::Conflict { .. })));
        assert!(validate_env_keys(&["DEBUG".to_string()]).is_ok());
    }
}
