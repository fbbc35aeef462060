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

use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("UtilError")]
    UtilError {
        #[from]
        source: util::error::UtilError,
    },
    #[error("Invalid parameter \'{0}\' for \'{1}\'")]
    InvalidParam(String, String),
    #[error("Unable to parse \'{0}\' for \'{1}\'")]
    ConvertValueFailed(String, String),
    #[error("Input {0} string's length must be no more than {1}.")]
    StringLengthTooLong(String, usize),
    #[error("Input field \'{0}\' in {1} is offered more than once.")]
    FieldRepeat(String, String),
    #[error("\'{0}\' is missing for \'{1}\'.")]
    FieldIsMissing(String, String),
    #[error("{0} must >{} {1} and <{} {3}.", if *.2 {"="} else {""}, if *.4 {"="} else {""})]
    IllegalValue(String, u64, bool, u64, bool),
    #[error("Mac address is illegal.")]
    MacFormatError,
    #[error("Unknown machine type: {0}!")]
    UnknownMachineType(String),
}
