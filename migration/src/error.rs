// Copyright (c) 2022 Huawei Technologies Co.,Ltd. All rights reserved.
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

use thiserror::Error;

use crate::status::MigrationStatus;

#[derive(Error, Debug)]
pub enum MigrationError {
    #[error("UtilError")]
    Util {
        #[from]
        source: util::error::UtilError,
    },
    #[error("Io")]
    Io {
        #[from]
        source: std::io::Error,
    },
    #[error("Json")]
    Json {
        #[from]
        source: serde_json::Error,
    },
    #[error("Failed to transfer migration status from {0} to {1}.")]
    InvalidStatusTransfer(MigrationStatus, MigrationStatus),
    #[error("A migration is already in progress, current status {0}.")]
    MigrationInProgress(MigrationStatus),
    #[error("Unsupported migration uri \'{0}\', only \'file:<path>\' is supported")]
    UnsupportedUri(String),
    #[error("Invalid snapshot path {0}")]
    InvalidSnapshotPath(String),
}
