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

use std::fmt;
use std::str::FromStr;

use anyhow::{anyhow, bail, Result};
use clap::Parser;
use serde::{Deserialize, Serialize};

use super::{str_slip_to_clap, ConfigError};

/// Slots of one kind a micro platform offers at most.
const MAX_MMIO_SLOTS: u64 = 32;
/// Root ports a standard platform offers at most.
const MAX_ROOT_PORTS: u64 = 31;
const DEFAULT_BLK_SLOTS: usize = 4;
const DEFAULT_NET_SLOTS: usize = 2;
const DEFAULT_ROOT_PORTS: usize = 4;

/// Platform class of the machine, decides how hot-plugged devices are
/// addressed.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum MachineType {
    /// Fixed MMIO transport slots.
    MicroVm,
    /// PCIe root ports `pcie.1..N` below the root bus `pcie.0`.
    StandardVm,
}

impl FromStr for MachineType {
    type Err = ();

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "microvm" => Ok(MachineType::MicroVm),
            "standard" | "q35" | "virt" => Ok(MachineType::StandardVm),
            _ => Err(()),
        }
    }
}

impl fmt::Display for MachineType {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            MachineType::MicroVm => write!(f, "microvm"),
            MachineType::StandardVm => write!(f, "standard"),
        }
    }
}

fn parse_machine_type(s: &str) -> Result<MachineType> {
    MachineType::from_str(s).map_err(|_| anyhow!(ConfigError::UnknownMachineType(s.to_string())))
}

/// Config that contains machine's platform and hot-plug layout.
#[derive(Parser, Clone, Debug, Serialize, Deserialize)]
#[command(no_binary_name(true))]
pub struct MachineConfig {
    #[arg(long = "type", alias = "classtype", default_value = "microvm", value_parser = parse_machine_type)]
    pub mach_type: MachineType,
    #[arg(long = "blk-slots", default_value_t = DEFAULT_BLK_SLOTS)]
    pub blk_slots: usize,
    #[arg(long = "net-slots", default_value_t = DEFAULT_NET_SLOTS)]
    pub net_slots: usize,
    #[arg(long = "root-ports", default_value_t = DEFAULT_ROOT_PORTS)]
    pub root_ports: usize,
}

impl Default for MachineConfig {
    fn default() -> Self {
        MachineConfig {
            mach_type: MachineType::MicroVm,
            blk_slots: DEFAULT_BLK_SLOTS,
            net_slots: DEFAULT_NET_SLOTS,
            root_ports: DEFAULT_ROOT_PORTS,
        }
    }
}

impl MachineConfig {
    pub fn check(&self) -> Result<()> {
        let ranges = [
            ("blk-slots", self.blk_slots as u64, MAX_MMIO_SLOTS),
            ("net-slots", self.net_slots as u64, MAX_MMIO_SLOTS),
            ("root-ports", self.root_ports as u64, MAX_ROOT_PORTS),
        ];
        for (name, value, max) in ranges {
            if value > max {
                bail!(ConfigError::IllegalValue(
                    name.to_string(),
                    0,
                    true,
                    max,
                    true
                ));
            }
        }
        Ok(())
    }
}

/// Parse `--machine` option like `type=microvm,blk-slots=4,net-slots=2`.
pub fn parse_machine(machine_config: &str) -> Result<MachineConfig> {
    let config = MachineConfig::try_parse_from(str_slip_to_clap(machine_config, true, false))?;
    config.check()?;
    Ok(config)
}
