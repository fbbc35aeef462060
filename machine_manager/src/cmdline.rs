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

use anyhow::{Context, Result};
use clap::{crate_description, Parser};

use crate::config::{
    parse_machine, parse_qmp, VmConfig, DEFAULT_QMP_RATE_LIMIT, DEFAULT_UNPLUG_TIMEOUT,
};

/// Command line of the management process.
#[derive(Parser, Debug)]
#[command(name = "stratovirt-mgmt", version, about = crate_description!())]
pub struct Cmdline {
    /// Set qmp's unixsocket, like 'unix:<socket_path>,server,nowait'. Repeat
    /// it to serve several sockets.
    #[arg(long = "qmp", required = true)]
    pub qmp: Vec<String>,
    /// Selects machine type and hot-plug layout, like
    /// 'type=microvm,blk-slots=4,net-slots=2' or 'type=standard,root-ports=4'.
    #[arg(long, default_value = "microvm")]
    pub machine: String,
    /// Seconds device_del waits for the guest to release a device, 0 waits
    /// forever.
    #[arg(long = "unplug-timeout", default_value_t = DEFAULT_UNPLUG_TIMEOUT)]
    pub unplug_timeout: u64,
    /// Requests a qmp session may send per second, 0 disables the limit.
    #[arg(long = "qmp-rate-limit", default_value_t = DEFAULT_QMP_RATE_LIMIT)]
    pub qmp_rate_limit: u64,
    /// Output log to logfile.
    #[arg(short = 'D', long = "log-file")]
    pub log_file: Option<String>,
    /// Freeze CPU at startup.
    #[arg(short = 'S', long = "freeze")]
    pub freeze: bool,
    /// Add a balloon device whose initial size is the given bytes.
    #[arg(long)]
    pub balloon: Option<u64>,
}

/// Create `VmConfig` from the parsed command line.
///
/// # Errors
///
/// Input arguments is illegal for `VmConfig` or `VmConfig`'s health check
/// failed.
pub fn create_vmconfig(args: &Cmdline) -> Result<VmConfig> {
    let mut vm_cfg = VmConfig {
        machine_config: parse_machine(&args.machine)
            .with_context(|| format!("Failed to parse machine \'{}\'", args.machine))?,
        qmp_rate_limit: args.qmp_rate_limit,
        unplug_timeout: match args.unplug_timeout {
            0 => None,
            secs => Some(secs),
        },
        log_file: args.log_file.clone(),
        freeze_cpu: args.freeze,
        balloon: args.balloon,
        ..Default::default()
    };
    for qmp in args.qmp.iter() {
        vm_cfg.qmp.push(
            parse_qmp(qmp).with_context(|| format!("Failed to parse qmp \'{}\'", qmp))?,
        );
    }
    vm_cfg.check_vmconfig()?;

    Ok(vm_cfg)
}
