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

pub mod error;

mod machine_config;
mod qmp;

pub use error::ConfigError;
pub use machine_config::*;
pub use qmp::*;

use std::time::Duration;

use anyhow::{anyhow, bail, Result};
use serde::{Deserialize, Serialize};

pub const MAX_STRING_LENGTH: usize = 255;
pub const MAX_PATH_LENGTH: usize = 4096;
pub const MAC_ADDRESS_LENGTH: usize = 17;
/// Frames a session may send per second unless configured otherwise.
pub const DEFAULT_QMP_RATE_LIMIT: u64 = 100;
/// Seconds `device_del` waits for the guest, 0 waits forever.
pub const DEFAULT_UNPLUG_TIMEOUT: u64 = 5;

/// This main config structure for Vm, contains Vm's basic configuration and
/// its management sockets.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VmConfig {
    pub machine_config: MachineConfig,
    pub qmp: Vec<QmpConfig>,
    pub qmp_rate_limit: u64,
    /// Seconds to wait for an unplug acknowledgement, `None` waits forever.
    pub unplug_timeout: Option<u64>,
    pub log_file: Option<String>,
    pub freeze_cpu: bool,
    /// Initial size of the balloon, no balloon device when absent.
    pub balloon: Option<u64>,
}

impl Default for VmConfig {
    fn default() -> Self {
        VmConfig {
            machine_config: MachineConfig::default(),
            qmp: Vec::new(),
            qmp_rate_limit: DEFAULT_QMP_RATE_LIMIT,
            unplug_timeout: Some(DEFAULT_UNPLUG_TIMEOUT),
            log_file: None,
            freeze_cpu: false,
            balloon: None,
        }
    }
}

impl VmConfig {
    /// Healthy check for `VmConfig`
    pub fn check_vmconfig(&self) -> Result<()> {
        if self.qmp.is_empty() {
            bail!(ConfigError::FieldIsMissing(
                "qmp".to_string(),
                "command line".to_string()
            ));
        }
        for (idx, qmp) in self.qmp.iter().enumerate() {
            if self.qmp[..idx].iter().any(|q| q.path == qmp.path) {
                bail!(ConfigError::FieldRepeat(qmp.path.clone(), "qmp".to_string()));
            }
        }
        self.machine_config.check()
    }

    pub fn unplug_timeout(&self) -> Option<Duration> {
        self.unplug_timeout.map(Duration::from_secs)
    }
}

/// Split a `key=value,flag` option string into clap style arguments.
///
/// # Arguments
///
/// * `args` - The option string.
/// * `first_pos_is_type` - The first item without `=` is the type.
/// * `first_pos_is_id` - The first item without `=` is the id.
pub fn str_slip_to_clap(args: &str, first_pos_is_type: bool, first_pos_is_id: bool) -> Vec<String> {
    let args_vecs = args.split(',').collect::<Vec<&str>>();
    let mut itr: Vec<String> = Vec::with_capacity(args_vecs.len() * 2);
    for (idx, param) in args_vecs.into_iter().enumerate() {
        if idx == 0 && !param.contains('=') {
            if first_pos_is_type {
                itr.push("--classtype".to_string());
                itr.push(param.to_string());
                continue;
            }
            if first_pos_is_id {
                itr.push("--id".to_string());
                itr.push(param.to_string());
                continue;
            }
        }
        match param.split_once('=') {
            Some((key, value)) => {
                itr.push(format!("--{}", key));
                itr.push(value.to_string());
            }
            None => itr.push(format!("--{}", param)),
        }
    }
    itr
}

pub fn parse_bool(s: &str) -> Result<bool> {
    match s {
        "on" | "true" | "yes" => Ok(true),
        "off" | "false" | "no" => Ok(false),
        _ => Err(anyhow!(ConfigError::ConvertValueFailed(
            s.to_string(),
            "bool".to_string()
        ))),
    }
}

/// Check an identifier of a device or backend: non-empty, at most
/// `MAX_STRING_LENGTH` bytes of `[A-Za-z0-9_.-]`.
pub fn valid_id(id: &str) -> Result<String> {
    if id.is_empty() {
        bail!(ConfigError::InvalidParam(id.to_string(), "id".to_string()));
    }
    check_arg_too_long(id, "id")?;
    if !id
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.')
    {
        bail!(ConfigError::InvalidParam(id.to_string(), "id".to_string()));
    }
    Ok(id.to_string())
}

pub fn check_arg_too_long(arg: &str, name: &str) -> Result<()> {
    if arg.len() > MAX_STRING_LENGTH {
        bail!(ConfigError::StringLengthTooLong(
            name.to_string(),
            MAX_STRING_LENGTH
        ));
    }
    Ok(())
}

pub fn check_path_too_long(arg: &str, name: &str) -> Result<()> {
    if arg.len() > MAX_PATH_LENGTH {
        bail!(ConfigError::StringLengthTooLong(
            name.to_string(),
            MAX_PATH_LENGTH
        ));
    }
    Ok(())
}

pub fn check_mac_address(mac: &str) -> bool {
    if mac.len() != MAC_ADDRESS_LENGTH {
        return false;
    }

    let mac_vec: Vec<&str> = mac.split(':').collect();
    if mac_vec.len() != 6 {
        return false;
    }

    mac_vec
        .iter()
        .all(|bit| bit.len() == 2 && bit.chars().all(|c| c.is_ascii_hexdigit()))
}
