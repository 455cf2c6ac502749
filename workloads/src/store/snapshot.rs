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

use std::{fs, path::Path};

use log::info;

use super::{store_error::Error, Store, Tables};
use crate::entities::{BuildProcess, Deployment};

/// Work left behind by a previous run.
#[derive(Debug, Default)]
pub struct Unfinished {
    pub build_processes: Vec<BuildProcess>,
    pub deployments: Vec<Deployment>,
}

impl Store {
    pub async fn save_snapshot<P: AsRef<Path>>(&self, path: P) -> Result<(), Error> {
        let path = path.as_ref();
        let snapshot_err = |reason: String| Error::Snapshot { path: path.display().to_string(), reason };
        let content = {
            let tables = self.tables.read().await;
            serde_json::to_vec_pretty(&*tables).map_err(|e| snapshot_err(e.to_string()))?
        };
        let tmp = path.with_extension("tmp");
        fs::write(&tmp, content).map_err(|e| snapshot_err(e.to_string()))?;
        fs::rename(&tmp, path).map_err(|e| snapshot_err(e.to_string()))?;
        info!("Saved store snapshot to {}", path.display());
        Ok(())
    }

    pub fn load_snapshot<P: AsRef<Path>>(path: P) -> Result<Store, Error> {
        let path = path.as_ref();
        let snapshot_err = |reason: String| Error::Snapshot { path: path.display().to_string(), reason };
        let content = fs::read(path).map_err(|e| snapshot_err(e.to_string()))?;
        let tables: Tables = serde_json::from_slice(&content).map_err(|e| snapshot_err(e.to_string()))?;
        info!("Loaded store snapshot from {}", path.display());
        Ok(Store::from_tables(tables))
    }

    pub async fn recover_unfinished(&self) -> Unfinished {
        let tables = self.tables.read().await;
        let mut unfinished = Unfinished {
            build_processes: tables.build_processes.values().filter(|bp| !bp.status.is_terminal()).cloned().collect(),
            deployments: tables.deployments.values().filter(|d| !d.status.is_terminal()).cloned().collect(),
        };
        unfinished.build_processes.sort_by_key(|bp| bp.created_at);
        unfinished.deployments.sort_by_key(|d| d.created_at);
        unfinished
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::entities::{Environment, JobStatus, VersionInfo};

    #[tokio::test]
    async fn test_snapshot_keeps_unfinished_work() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("store.json");
        let store = Store::new();
        let done = store.new_build_process("bkapp-foo-stag", "a.tgz", VersionInfo::default()).await.unwrap();
        store.update_build_process(done.id, |bp| bp.finish(JobStatus::Successful, "")).await.unwrap();
        let running = store.new_build_process("bkapp-foo-stag", "b.tgz", VersionInfo::default()).await.unwrap();
        let deployment = Deployment::new("foo", "default", Environment::Stag, "bkapp-foo-stag", "admin");
        store.insert_deployment(deployment.clone()).await.unwrap();
        store.save_snapshot(&path).await.unwrap();

        let restored = Store::load_snapshot(&path).unwrap();
        let unfinished = restored.recover_unfinished().await;
        assert_eq!(unfinished.build_processes.iter().map(|bp| bp.id).collect::<Vec<_>>(), vec![running.id]);
        assert_eq!(unfinished.deployments[0].id, deployment.id);
        assert_eq!(restored.phases(deployment.id).await.len(), 3);
        let next = restored.new_build_process("bkapp-foo-stag", "c.tgz", VersionInfo::default()).await.unwrap();
        assert_eq!(next.generation, 3);
    }

    #[test]
    fn test_load_missing_snapshot() {
        let err = Store::load_snapshot("/nonexistent/store.json").unwrap_err();
        assert!(matches!(err, Error::Snapshot { .. }));
    }
}
