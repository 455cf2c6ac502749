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

use tokio::time::Duration;

pub const BKAPP_GROUP: &str = "paas.bk.tencent.com";
pub const BKAPP_VERSION: &str = "v1alpha2";
pub const BKAPP_API_VERSION: &str = "paas.bk.tencent.com/v1alpha2";
pub const BKAPP_KIND: &str = "BkApp";
pub const DGMAPPING_VERSION: &str = "v1alpha1";
pub const DGMAPPING_API_VERSION: &str = "paas.bk.tencent.com/v1alpha1";
pub const DGMAPPING_KIND: &str = "DomainGroupMapping";

pub const ANNO_DEPLOY_ID: &str = "bkpaas.paas.bk.tencent.com/deploy-id";
pub const ANNO_PROC_SERVICES_FEATURE: &str = "bkapp.paas.bk.tencent.com/proc-services-feature-enabled";
pub const ANNO_EGRESS_CLUSTER: &str = "bkapp.paas.bk.tencent.com/egress-cluster-name";

pub const LABEL_WL_APP: &str = "bkapp.paas.bk.tencent.com/wl-app-name";
pub const LABEL_APP_CODE: &str = "bkapp.paas.bk.tencent.com/code";
pub const LABEL_MODULE_NAME: &str = "bkapp.paas.bk.tencent.com/module-name";
pub const LABEL_ENVIRONMENT: &str = "bkapp.paas.bk.tencent.com/environment";
pub const LABEL_PROCESS_TYPE: &str = "bkapp.paas.bk.tencent.com/process-name";
pub const LABEL_CATEGORY: &str = "category";
pub const LABEL_VERSION: &str = "version";

pub const CATEGORY_SLUG_BUILDER: &str = "slug-builder";
pub const CATEGORY_HOOK: &str = "hook";

pub const DEFAULT_SERVICE_ACCOUNT: &str = "default";

pub const POD_PHASE_PENDING: &str = "Pending";
pub const POD_PHASE_RUNNING: &str = "Running";
pub const POD_PHASE_SUCCEEDED: &str = "Succeeded";
pub const POD_PHASE_FAILED: &str = "Failed";

pub const HTTP_CODE_UNAUTHORIZED: u16 = 401;
pub const HTTP_CODE_FORBIDDEN: u16 = 403;
pub const HTTP_CODE_NOT_FOUND: u16 = 404;
pub const HTTP_CODE_CONFLICT: u16 = 409;
pub const HTTP_CODE_TOO_MANY_REQUESTS: u16 = 429;

/// Attempts made when a BkApp update hits a 409 conflict.
pub const MAX_CONFLICT_ATTEMPTS: usize = 3;
pub const MAX_TRANSIENT_RETRIES: usize = 4;
pub const RETRY_BASE_DELAY: Duration = Duration::from_millis(100);
pub const RETRY_MAX_DELAY: Duration = Duration::from_secs(3);
pub const EVERY_SA_CHECK: Duration = Duration::from_millis(500);
