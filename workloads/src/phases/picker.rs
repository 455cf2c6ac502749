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

use log::debug;

use super::{
    phases_error::Error,
    presets::{builtin_step_meta_sets, DOCKER_BUILD, IMAGE_RELEASE},
};
use crate::entities::{BuildMethod, StepMetaSet};

/// Chooses the step meta set of a deployment.
///
/// Dockerfile and custom image modules use their named sets. Other modules
/// use the newest set bound to their builder image, then the newest default.
pub fn pick_step_meta_set(
    method: BuildMethod,
    builder_image: &str,
    configured: &[StepMetaSet],
) -> Result<StepMetaSet, Error> {
    let sets = if configured.is_empty() { builtin_step_meta_sets() } else { configured.to_vec() };
    let picked = match method {
        BuildMethod::Dockerfile => by_name(&sets, DOCKER_BUILD)?,
        BuildMethod::CustomImage => by_name(&sets, IMAGE_RELEASE)?,
        BuildMethod::Buildpack | BuildMethod::Cnb => sets
            .iter()
            .filter(|s| s.builder_provider.as_deref() == Some(builder_image))
            .max_by_key(|s| s.created_at)
            .or_else(|| sets.iter().filter(|s| s.is_default).max_by_key(|s| s.created_at))
            .cloned()
            .ok_or_else(|| Error::NoStepMetaSet { wanted: format!("builder {}", builder_image) })?,
    };
    debug!("Picked step meta set {} for {:?} built by {}", picked.name, method, builder_image);
    Ok(picked)
}

fn by_name(sets: &[StepMetaSet], name: &str) -> Result<StepMetaSet, Error> {
    sets.iter()
        .filter(|s| s.name == name)
        .max_by_key(|s| s.created_at)
        .cloned()
        .ok_or_else(|| Error::NoStepMetaSet { wanted: name.to_string() })
}
