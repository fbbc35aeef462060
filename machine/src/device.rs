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

use std::collections::BTreeMap;

use anyhow::{anyhow, bail, Context, Result};

use crate::error::MachineError;
use crate::ops::{DeviceAddr, DeviceClass, DeviceSpec};
use machine_manager::config::{MachineConfig, MachineType};
use machine_manager::qmp::qmp_schema::DeviceAddArgument;

/// Root bus of the standard machine, devices are never plugged on it.
pub const PCIE_ROOT_BUS: &str = "pcie.0";

/// Hot-plug state of a device.
///
/// `Requested` --`(realized)`--> `Attached` --`(device_del)`--> `UnplugRequested`
/// `UnplugRequested` --`(guest ack)`--> removed
/// `UnplugRequested` --`(guest refuse)`--> `Attached`
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DeviceState {
    Requested,
    Attached,
    UnplugRequested,
}

#[derive(Clone, Debug)]
pub struct DeviceEntry {
    pub spec: DeviceSpec,
    pub state: DeviceState,
}

/// Place of hot-plugged devices, each entry holds the id of its occupant.
enum SlotLayout {
    Mmio {
        blk: Vec<Option<String>>,
        net: Vec<Option<String>>,
    },
    /// Index `n` is root port `pcie.<n + 1>`.
    Pcie { root_ports: Vec<Option<String>> },
}

/// Parse `slot[.func]` of a pci address, numbers are hex with or without
/// the `0x` prefix.
pub fn get_pci_df(addr: &str) -> Result<(u8, u8)> {
    let addr_vec: Vec<&str> = addr.split('.').collect();
    if addr_vec.len() > 2 {
        bail!(
            "The number of args for addr is supported to be no more than two, find :{}",
            addr_vec.len()
        );
    }
    let slot = addr_vec[0];
    let slot_num = u8::from_str_radix(slot.trim_start_matches("0x"), 16)
        .with_context(|| format!("Invalid slot num: {}", slot))?;
    if slot_num > 31 {
        bail!("Invalid slot num: {}", slot);
    }
    let func_num = match addr_vec.get(1) {
        Some(func) => u8::from_str_radix(func.trim_start_matches("0x"), 16)
            .with_context(|| format!("Invalid function num: {}", func))?,
        None => 0,
    };
    if func_num > 7 {
        bail!("Invalid function num: {}", func_num);
    }
    Ok((slot_num, func_num))
}

fn parse_mmio_slot(addr: &str) -> Option<usize> {
    match addr.strip_prefix("0x") {
        Some(hex) => usize::from_str_radix(hex, 16).ok(),
        None => addr.parse::<usize>().ok(),
    }
}

/// Index of root port `pcie.<n>` in the port table.
fn root_port_index(bus: &str) -> Option<usize> {
    bus.strip_prefix("pcie.")
        .and_then(|n| n.parse::<usize>().ok())
        .and_then(|n| n.checked_sub(1))
}

/// Registry of hot-plugged devices and the slots they occupy.
pub struct DeviceRegistry {
    mach_type: MachineType,
    devices: BTreeMap<String, DeviceEntry>,
    layout: SlotLayout,
}

impl DeviceRegistry {
    pub fn new(config: &MachineConfig) -> Self {
        let layout = match config.mach_type {
            MachineType::MicroVm => SlotLayout::Mmio {
                blk: vec![None; config.blk_slots],
                net: vec![None; config.net_slots],
            },
            MachineType::StandardVm => SlotLayout::Pcie {
                root_ports: vec![None; config.root_ports],
            },
        };
        DeviceRegistry {
            mach_type: config.mach_type,
            devices: BTreeMap::new(),
            layout,
        }
    }

    /// Class of `driver` on this machine.
    pub fn driver_class(&self, driver: &str) -> Result<DeviceClass> {
        let class = match (self.mach_type, driver) {
            (MachineType::MicroVm, "virtio-blk-device" | "virtio-blk-mmio") => DeviceClass::Block,
            (MachineType::MicroVm, "virtio-net-device" | "virtio-net-mmio") => DeviceClass::Net,
            (MachineType::StandardVm, "virtio-blk-pci") => DeviceClass::Block,
            (MachineType::StandardVm, "virtio-net-pci") => DeviceClass::Net,
            (MachineType::StandardVm, "vfio-pci") => DeviceClass::Vfio,
            _ => bail!(MachineError::DevTypeErr(
                driver.to_string(),
                self.mach_type.to_string()
            )),
        };
        Ok(class)
    }

    pub fn get(&self, id: &str) -> Option<&DeviceEntry> {
        self.devices.get(id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.devices.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    /// Find the address a new device of `class` is plugged at, nothing is
    /// reserved yet.
    pub fn find_addr(&self, args: &DeviceAddArgument, class: DeviceClass) -> Result<DeviceAddr> {
        match &self.layout {
            SlotLayout::Mmio { blk, net } => {
                let (slots, name) = match class {
                    DeviceClass::Block => (blk, "blk"),
                    DeviceClass::Net => (net, "net"),
                    DeviceClass::Vfio => bail!(MachineError::DevTypeErr(
                        args.driver.clone(),
                        self.mach_type.to_string()
                    )),
                };
                Self::find_mmio_slot(slots, name, args)
            }
            SlotLayout::Pcie { root_ports } => Self::find_root_port(root_ports, args),
        }
    }

    fn find_mmio_slot(
        slots: &[Option<String>],
        name: &str,
        args: &DeviceAddArgument,
    ) -> Result<DeviceAddr> {
        let addr = match &args.addr {
            Some(addr) => addr,
            None => {
                return slots
                    .iter()
                    .position(|slot| slot.is_none())
                    .map(DeviceAddr::Mmio)
                    .ok_or_else(|| {
                        anyhow!(MachineError::RplDevLmtErr(name.to_string(), slots.len()))
                    });
            }
        };

        let slot = parse_mmio_slot(addr)
            .filter(|slot| *slot < slots.len())
            .ok_or_else(|| anyhow!(MachineError::InvalidAddr(addr.clone(), args.id.clone())))?;
        if let Some(occupant) = &slots[slot] {
            bail!(MachineError::SlotOccupied(
                format!("{} 0x{:x}", name, slot),
                occupant.clone()
            ));
        }
        Ok(DeviceAddr::Mmio(slot))
    }

    fn find_root_port(
        root_ports: &[Option<String>],
        args: &DeviceAddArgument,
    ) -> Result<DeviceAddr> {
        let bus = args.bus.as_ref().ok_or_else(|| {
            anyhow!(MachineError::FieldIsMissing(
                "bus".to_string(),
                args.id.clone()
            ))
        })?;
        if bus == PCIE_ROOT_BUS {
            bail!(MachineError::BusNotHotpluggable(bus.clone()));
        }
        let port = root_port_index(bus)
            .filter(|n| *n < root_ports.len())
            .ok_or_else(|| anyhow!(MachineError::BusNotFound(bus.clone())))?;

        if let Some(addr) = &args.addr {
            // A root port has a single downstream slot.
            match get_pci_df(addr) {
                Ok((0, 0)) => (),
                _ => bail!(MachineError::InvalidAddr(addr.clone(), args.id.clone())),
            }
        }
        if let Some(occupant) = &root_ports[port] {
            bail!(MachineError::SlotOccupied(bus.clone(), occupant.clone()));
        }
        Ok(DeviceAddr::Pci {
            bus: bus.clone(),
            slot: 0,
            func: 0,
        })
    }

    fn slot_mut(&mut self, spec: &DeviceSpec) -> Option<&mut Option<String>> {
        match &mut self.layout {
            SlotLayout::Mmio { blk, net } => {
                let slot = match spec.addr {
                    DeviceAddr::Mmio(slot) => slot,
                    _ => return None,
                };
                match spec.class {
                    DeviceClass::Block => blk.get_mut(slot),
                    DeviceClass::Net => net.get_mut(slot),
                    DeviceClass::Vfio => None,
                }
            }
            SlotLayout::Pcie { root_ports } => match &spec.addr {
                DeviceAddr::Pci { bus, .. } => {
                    root_port_index(bus).and_then(|n| root_ports.get_mut(n))
                }
                _ => None,
            },
        }
    }

    /// Record a device being realized, its slot is taken from now on.
    pub fn insert(&mut self, spec: DeviceSpec) -> Result<()> {
        if self.devices.contains_key(&spec.id) {
            bail!(MachineError::DevIdDuplicate(spec.id));
        }
        let id = spec.id.clone();
        let addr = format!("{:?}", spec.addr);
        let slot = self
            .slot_mut(&spec)
            .ok_or_else(|| anyhow!(MachineError::InvalidAddr(addr.clone(), id.clone())))?;
        if let Some(occupant) = slot.as_ref() {
            bail!(MachineError::SlotOccupied(addr, occupant.clone()));
        }
        *slot = Some(id.clone());
        self.devices.insert(
            id,
            DeviceEntry {
                spec,
                state: DeviceState::Requested,
            },
        );
        Ok(())
    }

    /// Move device `id` to `state`, returns the state it left.
    pub fn set_state(&mut self, id: &str, state: DeviceState) -> Result<DeviceState> {
        let entry = self
            .devices
            .get_mut(id)
            .ok_or_else(|| anyhow!(MachineError::DevNotFound(id.to_string())))?;
        let old = entry.state;
        entry.state = state;
        Ok(old)
    }

    /// Drop device `id` and free its slot.
    pub fn remove(&mut self, id: &str) -> Option<DeviceEntry> {
        let entry = self.devices.remove(id)?;
        if let Some(slot) = self.slot_mut(&entry.spec) {
            *slot = None;
        }
        Some(entry)
    }
}
