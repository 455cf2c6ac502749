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

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use chrono::Utc;
use hmac::{Hmac, Mac};
use sha2::Sha256;

use super::build_error::Error;
use crate::config::BlobStoreConfig;

type HmacSha256 = Hmac<Sha256>;

/// Source tarballs are readable for a day.
pub const SOURCE_URL_TTL: Duration = Duration::from_secs(24 * 3600);
/// Slugs outlive every release that may point at them.
pub const SLUG_GET_URL_TTL: Duration = Duration::from_secs(20 * 365 * 24 * 3600);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlobMethod {
    Get,
    Put,
}

impl fmt::Display for BlobMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BlobMethod::Get => write!(f, "GET"),
            BlobMethod::Put => write!(f, "PUT"),
        }
    }
}

#[cfg_attr(test, mockall::automock)]
pub trait BlobStore: Send + Sync {
    fn presign(&self, method: BlobMethod, key: &str, ttl: Duration) -> Result<String, Error>;
}

/// Presigns object URLs with an HMAC-SHA256 of method, path and expiry.
pub struct HmacPresigner {
    endpoint: String,
    bucket: String,
    secret_key: String,
}

impl HmacPresigner {
    pub fn new(config: &BlobStoreConfig) -> Self {
        HmacPresigner {
            endpoint: config.endpoint.trim_end_matches('/').to_string(),
            bucket: config.bucket.clone(),
            secret_key: config.secret_key.clone(),
        }
    }

    fn sign(&self, method: BlobMethod, path: &str, expires: i64) -> Result<String, Error> {
        let mut mac = HmacSha256::new_from_slice(self.secret_key.as_bytes())
            .map_err(|e| Error::Presign { key: path.to_string(), reason: e.to_string() })?;
        mac.update(format!("{}\n{}\n{}", method, path, expires).as_bytes());
        Ok(URL_SAFE_NO_PAD.encode(mac.finalize().into_bytes()))
    }
}

impl BlobStore for HmacPresigner {
    fn presign(&self, method: BlobMethod, key: &str, ttl: Duration) -> Result<String, Error> {
        if self.secret_key.is_empty() {
            return Err(Error::Presign { key: key.to_string(), reason: "blob store secret key is empty".into() });
        }
        let path = format!("/{}/{}", self.bucket, key.trim_start_matches('/'));
        let expires = Utc::now().timestamp() + ttl.as_secs() as i64;
        let signature = self.sign(method, &path, expires)?;
        Ok(format!("{}{}?Expires={}&Signature={}", self.endpoint, path, expires, signature))
    }
}
