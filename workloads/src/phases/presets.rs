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

use chrono::{TimeZone, Utc};

use crate::entities::{PhaseType, StepMeta, StepMetaSet};

pub const SLUG_PACK: &str = "slug-pack";
pub const CNB: &str = "cnb";
pub const DOCKER_BUILD: &str = "dockerbuild";
pub const IMAGE_RELEASE: &str = "image_release";

/// Builder image the `cnb` preset is bound to.
pub const CNB_BUILDER_IMAGE: &str = "bkpaas/builder-heroku-bionic:latest";

pub const STEP_PARSE_CONFIGS: &str = "parse-configs";
pub const STEP_UPLOAD_SOURCE: &str = "upload-source";
pub const STEP_APPLY_MANIFEST: &str = "apply-manifest";
pub const STEP_PRE_RELEASE_HOOK: &str = "pre-release-hook";
pub const STEP_WAIT_READY: &str = "wait-ready";

fn meta(phase: PhaseType, name: &str, started: &[&str], finished: &[&str]) -> StepMeta {
    StepMeta {
        phase,
        name: name.to_string(),
        started_patterns: started.iter().map(|p| p.to_string()).collect(),
        finished_patterns: finished.iter().map(|p| p.to_string()).collect(),
    }
}

fn preparation(with_upload: bool) -> Vec<StepMeta> {
    let mut metas = vec![meta(PhaseType::Preparation, STEP_PARSE_CONFIGS, &[], &[])];
    if with_upload {
        metas.push(meta(PhaseType::Preparation, STEP_UPLOAD_SOURCE, &[], &[]));
    }
    metas
}

fn release() -> Vec<StepMeta> {
    vec![
        meta(PhaseType::Release, STEP_APPLY_MANIFEST, &[], &[]),
        meta(PhaseType::Release, STEP_PRE_RELEASE_HOOK, &[], &[]),
        meta(PhaseType::Release, STEP_WAIT_READY, &[], &[]),
    ]
}

fn preset(
    name: &str,
    is_default: bool,
    builder_provider: Option<&str>,
    build: Vec<StepMeta>,
    with_upload: bool,
) -> StepMetaSet {
    let mut metas = preparation(with_upload);
    metas.extend(build);
    metas.extend(release());
    StepMetaSet {
        name: name.to_string(),
        metas,
        is_default,
        builder_provider: builder_provider.map(String::from),
        created_at: Utc.timestamp_opt(0, 0).single().unwrap_or_else(Utc::now),
    }
}

/// Step sets used when the configuration declares none.
pub fn builtin_step_meta_sets() -> Vec<StepMetaSet> {
    vec![
        preset(
            SLUG_PACK,
            true,
            None,
            vec![
                meta(PhaseType::Build, "prepare-build", &["-----> Step setup begin"], &["-----> Step setup done"]),
                meta(PhaseType::Build, "build-app", &["-----> Compiling app"], &["-----> Discovering process types"]),
                meta(PhaseType::Build, "upload-slug", &["-----> Compressing"], &["-----> Slug uploaded", "-----> Done"]),
            ],
            true,
        ),
        preset(
            CNB,
            false,
            Some(CNB_BUILDER_IMAGE),
            vec![
                meta(PhaseType::Build, "detect", &["===> DETECTING"], &["===> ANALYZING"]),
                meta(PhaseType::Build, "build-app", &["===> BUILDING"], &["===> EXPORTING"]),
                meta(PhaseType::Build, "export-image", &["===> EXPORTING"], &["\\*\\*\\* Images", "Saving .+\\.\\.\\."]),
            ],
            true,
        ),
        preset(
            DOCKER_BUILD,
            false,
            None,
            vec![
                meta(
                    PhaseType::Build,
                    "docker-build",
                    &["Step 1/\\d+", "#1 \\[internal\\]"],
                    &["Successfully built", "writing image"],
                ),
                meta(PhaseType::Build, "push-image", &["The push refers to", "pushing layers"], &["digest: sha256:"]),
            ],
            true,
        ),
        preset(IMAGE_RELEASE, false, None, vec![], false),
    ]
}
