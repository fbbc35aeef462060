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

//! Interfaces of the components that actually run the guest.
//!
//! The machine only arbitrates requests, the vCPUs, the hot-plug transport and
//! the balloon are driven through these traits. Defaults are provided for a
//! machine without a hypervisor attached.

use anyhow::Result;
use log::info;

use machine_manager::machine::UnplugAck;

/// Device class decided by the driver name.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DeviceClass {
    Block,
    Net,
    Vfio,
}

/// Where a hot-plugged device sits.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DeviceAddr {
    /// Index into the replaceable slot table of its class.
    Mmio(usize),
    /// Slot and function under a root port.
    Pci { bus: String, slot: u8, func: u8 },
}

/// Everything needed to realize a hot-plugged device.
#[derive(Clone, Debug)]
pub struct DeviceSpec {
    pub id: String,
    pub driver: String,
    pub class: DeviceClass,
    pub addr: DeviceAddr,
    /// Node name or netdev id of the bound backend.
    pub backend: Option<String>,
    pub mac: Option<String>,
    pub serial: Option<String>,
    /// Host address of a passed-through device.
    pub host: Option<String>,
}

pub trait VcpuOps: Send {
    fn pause(&mut self) -> Result<()>;

    fn resume(&mut self) -> Result<()>;

    fn destroy(&mut self) -> Result<()>;
}

pub trait HotplugOps: Send {
    /// Realize the device and make it visible to the guest.
    fn plug(&mut self, spec: &DeviceSpec) -> Result<()>;

    /// Ask the guest to release device `id`, `ack` is answered once the
    /// guest has decided.
    fn request_unplug(&mut self, id: &str, ack: UnplugAck) -> Result<()>;
}

pub trait BalloonOps: Send {
    /// Ask for a new balloon size in bytes, returns the size reached.
    fn set_target(&mut self, bytes: u64) -> Result<u64>;

    fn actual(&self) -> u64;
}

/// vCPUs which are not backed by a hypervisor.
#[derive(Default)]
pub struct IdleVcpus;

impl VcpuOps for IdleVcpus {
    fn pause(&mut self) -> Result<()> {
        Ok(())
    }

    fn resume(&mut self) -> Result<()> {
        Ok(())
    }

    fn destroy(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Transport whose guest releases every device at once.
#[derive(Default)]
pub struct AutoAckHotplug;

impl HotplugOps for AutoAckHotplug {
    fn plug(&mut self, spec: &DeviceSpec) -> Result<()> {
        info!("Plug {} device {} at {:?}", spec.driver, spec.id, spec.addr);
        Ok(())
    }

    fn request_unplug(&mut self, id: &str, ack: UnplugAck) -> Result<()> {
        info!("Unplug device {}", id);
        ack.ack();
        Ok(())
    }
}

/// Balloon which reaches every requested size.
pub struct StaticBalloon {
    actual: u64,
}

impl StaticBalloon {
    pub fn new(actual: u64) -> Self {
        StaticBalloon { actual }
    }
}

impl BalloonOps for StaticBalloon {
    fn set_target(&mut self, bytes: u64) -> Result<u64> {
        self.actual = bytes;
        Ok(self.actual)
    }

    fn actual(&self) -> u64 {
        self.actual
    }
}
