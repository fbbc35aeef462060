// Copyright (c) 2020 Huawei Technologies Co.,Ltd. All rights reserved.
//
// StratoVirt is licensed under Mulan PSL v2.
// You can use this software according to the terms and conditions of the Mulan
// PSL v2.
// You may obtain a copy of Mulan PSL v2 at:
//         http://license.coscl.org.cn/MulanPSL2
// THIS SOFTWARE IS PROVIDED ON AN "AS IS" BASIS, WITHOUT WARRANTIES OF ANY
// KIND, EITHER EXPRESS OR IMPLIED, INCLUDING BUT NOT LIMITED TO
// NON-INFRINGEMENT, MERCHANTABILITY OR FIT FOR A PARTICULAR PURPOSE.
// See the Mulan PSL v2 for more details.

use std::sync::{Arc, RwLock};
use std::thread::{self, JoinHandle};

use anyhow::{Context, Result};
use log::{error, info};

use crate::error::MigrationError;
use crate::status::MigrationStatus;
use util::unix::{parse_uri, UnixPath};

/// The phases of a migration which are carried out outside of the manager.
///
/// Both calls run on the migration thread and may take a long time. They must
/// not touch the migration status themselves.
pub trait MigrationHook: Send + Sync {
    /// Set up the resources needed to save the VM into `path`.
    fn prepare(&self, path: &str) -> Result<()>;

    /// Transfer the VM state into `path`.
    fn transfer(&self, path: &str) -> Result<()>;
}

#[derive(Debug, Default, Clone)]
struct MigrationRecord {
    status: MigrationStatus,
    uri: Option<String>,
}

/// The single migration record of the process.
///
/// The record is only changed through legal `MigrationStatus` transfers, a new
/// migration is refused while the previous one is in `Setup` or `Active`.
#[derive(Debug, Default)]
pub struct MigrationManager {
    record: RwLock<MigrationRecord>,
}

/// Get the destination path from a migration uri, only `file:` is supported.
pub fn parse_migrate_uri(uri: &str) -> Result<String> {
    match parse_uri(uri) {
        Ok((UnixPath::File, path)) => Ok(path),
        _ => Err(MigrationError::UnsupportedUri(uri.to_string()).into()),
    }
}

impl MigrationManager {
    pub fn new() -> Self {
        MigrationManager::default()
    }

    /// Get current migration status.
    pub fn status(&self) -> MigrationStatus {
        self.read_record().status
    }

    /// Destination of the latest migration.
    pub fn uri(&self) -> Option<String> {
        self.read_record().uri
    }

    fn read_record(&self) -> MigrationRecord {
        match self.record.read() {
            Ok(record) => record.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// Set a new migration status, the transfer must be legal.
    pub fn set_status(&self, new_status: MigrationStatus) -> Result<()> {
        let mut record = self
            .record
            .write()
            .map_err(|_| anyhow::anyhow!("Migration record lock poisoned"))?;
        record.status = record.status.transfer(new_status)?;
        info!("Migration status changed to {}", record.status);
        Ok(())
    }

    /// Start a migration to `uri`.
    ///
    /// The status is moved to `Setup` before returning, the remaining phases run
    /// on a background thread driven by `hook`.
    pub fn start(
        self: &Arc<Self>,
        uri: &str,
        hook: Arc<dyn MigrationHook>,
    ) -> Result<JoinHandle<()>> {
        let path = {
            let mut record = self
                .record
                .write()
                .map_err(|_| anyhow::anyhow!("Migration record lock poisoned"))?;
            if record.status.is_in_progress() {
                return Err(MigrationError::MigrationInProgress(record.status).into());
            }
            let path = parse_migrate_uri(uri)?;
            record.status = record.status.transfer(MigrationStatus::Setup)?;
            record.uri = Some(uri.to_string());
            path
        };
        info!("Migration to {} is set up", uri);

        let manager = self.clone();
        let spawned = thread::Builder::new()
            .name("migration".to_string())
            .spawn(move || manager.run(&path, hook.as_ref()));
        match spawned {
            Ok(handle) => Ok(handle),
            Err(e) => {
                self.fail();
                Err(e).with_context(|| "Failed to spawn migration thread")
            }
        }
    }

    fn run(&self, path: &str, hook: &dyn MigrationHook) {
        if let Err(e) = self.do_migration(path, hook) {
            error!("Migration to {} failed: {:?}", path, e);
            self.fail();
        }
    }

    fn do_migration(&self, path: &str, hook: &dyn MigrationHook) -> Result<()> {
        hook.prepare(path)
            .with_context(|| "Failed to prepare migration")?;
        self.set_status(MigrationStatus::Active)?;
        hook.transfer(path)
            .with_context(|| "Failed to transfer vm state")?;
        self.set_status(MigrationStatus::Completed)
    }

    fn fail(&self) {
        if let Err(e) = self.set_status(MigrationStatus::Failed) {
            error!("{:?}", e);
        }
    }
}
