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

#[derive(Error, Debug)]
pub enum MachineManagerError {
    #[error("ConfigParser")]
    ConfigParser {
        #[from]
        source: crate::config::error::ConfigError,
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
    #[error("Util")]
    Util {
        #[from]
        source: util::error::UtilError,
    },
    #[error("The socket message is too long, limit is {0} bytes.")]
    MsgTooLong(usize),
    #[error("The socket message is not valid UTF-8.")]
    InvalidUtf8,
    #[error("Expected a JSON object as QMP input, got: {0}")]
    NotJsonObject(String),
    #[error("Failed to spawn thread {0}")]
    SpawnThread(String),
}
