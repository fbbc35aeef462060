// Copyright (c) 2023 Huawei Technologies Co.,Ltd. All rights reserved.
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

use anyhow::{bail, Context, Result};
use clap::Parser;
use serde::{Deserialize, Serialize};

use super::{check_path_too_long, str_slip_to_clap, ConfigError};
use util::unix::{parse_uri, UnixPath};

/// Config of one management socket, `unix:<path>,server,nowait`.
#[derive(Parser, Clone, Debug, Default, Serialize, Deserialize)]
#[command(no_binary_name(true))]
pub struct QmpConfig {
    #[arg(long, alias = "classtype")]
    pub uri: String,
    #[arg(long)]
    pub server: bool,
    #[arg(long)]
    pub nowait: bool,
    /// Socket path taken from `uri`.
    #[arg(skip)]
    pub path: String,
}

/// This function is to parse qmp socket path and type.
///
/// # Errors
///
/// The value of `qmp` is illegal.
pub fn parse_qmp(qmp_config: &str) -> Result<QmpConfig> {
    let mut config = QmpConfig::try_parse_from(str_slip_to_clap(qmp_config, true, false))?;
    let (kind, path) =
        parse_uri(&config.uri).with_context(|| "Failed to parse qmp socket path")?;
    if kind != UnixPath::Unix {
        bail!(ConfigError::InvalidParam(config.uri, "qmp".to_string()));
    }
    check_path_too_long(&path, "qmp socket path")?;
    if !config.server {
        bail!("Argument \'server\' is needed for qmp");
    }
    if !config.nowait {
        bail!("Argument \'nowait\' is needed for qmp");
    }
    config.path = path;
    Ok(config)
}
