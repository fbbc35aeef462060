// Copyright (c) 2021 Huawei Technologies Co.,Ltd. All rights reserved.
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

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::os::unix::fs::OpenOptionsExt;
use std::path::Path;

use anyhow::{Context, Result};
use log::info;
use serde::{Deserialize, Serialize};

use crate::error::MigrationError;
use crate::manager::MigrationHook;

/// Magic string at the beginning of a snapshot file.
pub const SNAPSHOT_MAGIC: &str = "STRATOVIRT-SNAPSHOT";
const SNAPSHOT_COMPAT_VERSION: u32 = 1;

/// Header describing a snapshot file.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SnapshotHeader {
    pub magic: String,
    pub compat_version: u32,
    pub arch: String,
    /// Free form description of the saved VM.
    pub desc: String,
}

impl SnapshotHeader {
    fn new(desc: &str) -> Self {
        SnapshotHeader {
            magic: SNAPSHOT_MAGIC.to_string(),
            compat_version: SNAPSHOT_COMPAT_VERSION,
            arch: std::env::consts::ARCH.to_string(),
            desc: desc.to_string(),
        }
    }
}

/// Save VM into a local file.
///
/// The state itself is provided by the device layer, this target only owns the
/// file and its header.
pub struct FileSnapshot {
    desc: String,
}

impl FileSnapshot {
    pub fn new(desc: &str) -> Self {
        FileSnapshot {
            desc: desc.to_string(),
        }
    }

    fn open(path: &str, truncate: bool) -> Result<File> {
        OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(truncate)
            .mode(0o600)
            .open(path)
            .with_context(|| format!("Failed to open snapshot file {}", path))
    }

    /// Read back the header of a snapshot file.
    pub fn read_header(path: &str) -> Result<SnapshotHeader> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read snapshot file {}", path))?;
        let line = content.lines().next().unwrap_or_default();
        let header: SnapshotHeader = serde_json::from_str(line)?;
        if header.magic != SNAPSHOT_MAGIC {
            return Err(MigrationError::InvalidSnapshotPath(path.to_string()).into());
        }
        Ok(header)
    }
}

impl MigrationHook for FileSnapshot {
    fn prepare(&self, path: &str) -> Result<()> {
        let parent = Path::new(path)
            .parent()
            .filter(|p| p.as_os_str().is_empty() || p.is_dir());
        if parent.is_none() || Path::new(path).is_dir() {
            return Err(MigrationError::InvalidSnapshotPath(path.to_string()).into());
        }
        Self::open(path, true)?;
        Ok(())
    }

    fn transfer(&self, path: &str) -> Result<()> {
        let mut file = Self::open(path, false)?;
        let mut header = serde_json::to_string(&SnapshotHeader::new(&self.desc))?;
        header.push('\n');
        file.write_all(header.as_bytes())
            .with_context(|| "Failed to write snapshot header")?;
        file.sync_all()?;
        info!("Snapshot saved to {}", path);
        Ok(())
    }
}
