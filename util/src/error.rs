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
pub enum UtilError {
    #[error("Nul")]
    Nul {
        #[from]
        source: std::ffi::NulError,
    },
    #[error("Io")]
    Io {
        #[from]
        source: std::io::Error,
    },
    #[error("Chmod command failed, os error {0}")]
    ChmodFailed(i32),
    #[error("Unsupported uri type \'{0}\'")]
    UnsupportedUri(String),
    #[error("Invalid uri: {0}")]
    InvalidUri(String),
    #[error("Leak bucket capacity {0} overflows")]
    CapacityOverflow(u64),
}
