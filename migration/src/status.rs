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

use crate::error::MigrationError;

/// This status for migration in migration process.
///
/// # Notes
///
/// State transfer:
/// None -----------> Setup: set up migration resource.
/// Setup ----------> Active: start to migrate.
/// Active ---------> Completed: migrate completed successfully.
/// Completed ------> Setup: start a new migration after a finished one.
/// Failed ---------> Setup: start a new migration after a failed one.
/// Setup, Active --> Failed: Something wrong in migration.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Default)]
pub enum MigrationStatus {
    /// No migration has been started.
    #[default]
    None = 0,
    /// Migration resource is being set up.
    Setup = 1,
    /// In migration.
    Active = 2,
    /// Migration finished.
    Completed = 3,
    /// Migration failed.
    Failed = 4,
}

impl std::fmt::Display for MigrationStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}",
            match self {
                MigrationStatus::None => "none",
                MigrationStatus::Setup => "setup",
                MigrationStatus::Active => "active",
                MigrationStatus::Completed => "completed",
                MigrationStatus::Failed => "failed",
            }
        )
    }
}

impl MigrationStatus {
    pub fn transfer(self, new_status: MigrationStatus) -> Result<MigrationStatus, MigrationError> {
        let legal = match self {
            MigrationStatus::None | MigrationStatus::Completed | MigrationStatus::Failed => {
                new_status == MigrationStatus::Setup
            }
            MigrationStatus::Setup => {
                matches!(new_status, MigrationStatus::Active | MigrationStatus::Failed)
            }
            MigrationStatus::Active => matches!(
                new_status,
                MigrationStatus::Completed | MigrationStatus::Failed
            ),
        };

        if legal {
            Ok(new_status)
        } else {
            Err(MigrationError::InvalidStatusTransfer(self, new_status))
        }
    }

    /// Whether a migration is running, a new one can't be started then.
    pub fn is_in_progress(self) -> bool {
        matches!(self, MigrationStatus::Setup | MigrationStatus::Active)
    }
}
