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

//! # Machine
//!
//! The single arbitration point of the control plane: every qmp command is
//! applied to one `Machine` behind the controller mutex.
//!
//! ## Design
//!
//! This crate offers:
//! 1. The run state of the VM and its legal transitions.
//! 2. The registries of hot-plugged devices and of their backends.
//! 3. The traits of the components which actually run the guest.

pub mod backend;
pub mod device;
pub mod error;
pub mod ops;

pub use anyhow::Result;

pub use error::MachineError;

use std::os::unix::io::RawFd;
use std::sync::Arc;

use anyhow::{anyhow, bail, Context};
use log::{error, info, warn};

use backend::{BackendRegistry, BlockBackend, NetBackend};
use device::{DeviceRegistry, DeviceState};
use error::qmp_error_class;
use machine_manager::config::{
    check_arg_too_long, check_mac_address, valid_id, ConfigError, VmConfig,
};
use machine_manager::event;
use machine_manager::machine::{
    unplug_request, DeviceInterface, MachineExternalInterface, MachineLifecycle,
    MigrateInterface, UnplugTicket, VmState,
};
use machine_manager::qmp::qmp_schema::{self, BalloonInfo, MigrationInfo, QmpErrorClass};
use machine_manager::qmp::{send_device_deleted_msg, QmpChannel, Response};
use migration::{FileSnapshot, MigrationHook, MigrationManager};
use ops::{
    AutoAckHotplug, BalloonOps, DeviceClass, DeviceSpec, HotplugOps, IdleVcpus, StaticBalloon,
    VcpuOps,
};

/// Components driven by the machine.
pub struct MachineHooks {
    pub vcpus: Box<dyn VcpuOps>,
    pub hotplug: Box<dyn HotplugOps>,
    /// `None` if the VM has no balloon device.
    pub balloon: Option<Box<dyn BalloonOps>>,
    pub migration: Arc<dyn MigrationHook>,
}

impl MachineHooks {
    /// Components of a machine which is not backed by a hypervisor.
    pub fn from_config(vm_config: &VmConfig) -> Self {
        let balloon = vm_config
            .balloon
            .map(|actual| Box::new(StaticBalloon::new(actual)) as Box<dyn BalloonOps>);
        let desc = format!("{} machine", vm_config.machine_config.mach_type);
        MachineHooks {
            vcpus: Box::new(IdleVcpus),
            hotplug: Box::new(AutoAckHotplug),
            balloon,
            migration: Arc::new(FileSnapshot::new(&desc)),
        }
    }
}

pub struct Machine {
    vm_state: VmState,
    devices: DeviceRegistry,
    backends: BackendRegistry,
    /// Events are published here.
    channel: Arc<QmpChannel>,
    migration: Arc<MigrationManager>,
    hooks: MachineHooks,
}

fn close_fd(fd: RawFd) {
    // SAFETY: the descriptor was received from a client and is owned here.
    unsafe { libc::close(fd) };
}

fn qmp_response(result: Result<()>) -> Response {
    match result {
        Ok(()) => Response::create_empty_response(),
        Err(e) => {
            error!("{:?}", e);
            Response::create_error_response(qmp_error_class(&e), None)
        }
    }
}

impl Machine {
    pub fn new(
        vm_config: &VmConfig,
        channel: Arc<QmpChannel>,
        hooks: MachineHooks,
    ) -> Result<Self> {
        vm_config.machine_config.check()?;
        Ok(Machine {
            vm_state: VmState::Created,
            devices: DeviceRegistry::new(&vm_config.machine_config),
            backends: BackendRegistry::default(),
            channel,
            migration: Arc::new(MigrationManager::new()),
            hooks,
        })
    }

    /// Start the VM, `paused` keeps vCPUs stopped until `cont`.
    pub fn run(&mut self, paused: bool) -> Result<()> {
        let new = if paused {
            VmState::Paused
        } else {
            VmState::Running
        };
        self.vm_state_transfer(VmState::Created, new)
    }

    pub fn migration_manager(&self) -> Arc<MigrationManager> {
        self.migration.clone()
    }

    pub fn devices(&self) -> &DeviceRegistry {
        &self.devices
    }

    pub fn backends(&self) -> &BackendRegistry {
        &self.backends
    }

    fn vm_state_transfer(&mut self, old: VmState, new: VmState) -> Result<()> {
        use VmState::*;

        if self.vm_state != old {
            bail!(MachineError::LifecycleErr(old, new, self.vm_state));
        }

        let vcpus = &mut self.hooks.vcpus;
        match (old, new) {
            (Created, Running) => vcpus
                .resume()
                .with_context(|| MachineError::VcpuErr("start".to_string()))?,
            (Created, Paused) => (),
            (Running, Paused) => vcpus
                .pause()
                .with_context(|| MachineError::VcpuErr("pause".to_string()))?,
            (Paused, Running) => vcpus
                .resume()
                .with_context(|| MachineError::VcpuErr("resume".to_string()))?,
            (_, Shutdown) => vcpus
                .destroy()
                .with_context(|| MachineError::VcpuErr("destroy".to_string()))?,
            (_, _) => bail!(MachineError::LifecycleErr(old, new, self.vm_state)),
        }
        self.vm_state = new;
        info!("Vm state changed from {:?} to {:?}", old, new);

        match (old, new) {
            (Running, Paused) => event!(self.channel, Stop),
            (Paused, Running) => event!(self.channel, Resume),
            _ => (),
        }
        Ok(())
    }

    fn add_device(&mut self, args: &qmp_schema::DeviceAddArgument) -> Result<()> {
        valid_id(&args.id)?;
        if self.devices.contains(&args.id) {
            bail!(MachineError::DevIdDuplicate(args.id.clone()));
        }
        let class = self.devices.driver_class(&args.driver)?;
        let addr = self.devices.find_addr(args, class)?;

        let missing = |field: &str| {
            anyhow!(MachineError::FieldIsMissing(
                field.to_string(),
                args.id.clone()
            ))
        };
        let backend = match class {
            DeviceClass::Block => Some(args.drive.clone().ok_or_else(|| missing("drive"))?),
            DeviceClass::Net => Some(args.netdev.clone().ok_or_else(|| missing("netdev"))?),
            DeviceClass::Vfio => {
                if args.host.as_deref().unwrap_or_default().is_empty() {
                    return Err(missing("host"));
                }
                None
            }
        };
        if let Some(name) = &backend {
            self.backends.check_bindable(class, name)?;
        }
        if let Some(mac) = &args.mac {
            if !check_mac_address(mac) {
                bail!(ConfigError::MacFormatError);
            }
        }
        if let Some(serial) = &args.serial_num {
            check_arg_too_long(serial, "device serial number")?;
        }

        let spec = DeviceSpec {
            id: args.id.clone(),
            driver: args.driver.clone(),
            class,
            addr,
            backend,
            mac: args.mac.clone(),
            serial: args.serial_num.clone(),
            host: args.host.clone(),
        };
        self.devices.insert(spec.clone())?;
        if let Err(e) = self.hooks.hotplug.plug(&spec) {
            self.devices.remove(&spec.id);
            return Err(e).with_context(|| MachineError::RlzDevErr(spec.id.clone()));
        }
        if let Some(name) = &spec.backend {
            self.backends.bind(class, name, &spec.id)?;
        }
        self.devices.set_state(&spec.id, DeviceState::Attached)?;
        info!("Device {} ({}) attached at {:?}", spec.id, spec.driver, spec.addr);
        Ok(())
    }

    fn request_unplug(&mut self, id: &str) -> Result<UnplugTicket> {
        let entry = self
            .devices
            .get(id)
            .ok_or_else(|| anyhow!(MachineError::DevNotFound(id.to_string())))?;
        if entry.state != DeviceState::Attached {
            bail!(MachineError::UnplugInProgress(id.to_string()));
        }

        self.devices.set_state(id, DeviceState::UnplugRequested)?;
        let (ack, ticket) = unplug_request(id);
        if let Err(e) = self.hooks.hotplug.request_unplug(id, ack) {
            self.devices.set_state(id, DeviceState::Attached)?;
            return Err(e).with_context(|| format!("Failed to request unplug of device {}", id));
        }
        info!("Unplug of device {} requested", id);
        Ok(ticket)
    }

    fn check_unplug_requested(&self, id: &str) -> Result<()> {
        match self.devices.get(id) {
            None => bail!(MachineError::DevNotFound(id.to_string())),
            Some(entry) if entry.state != DeviceState::UnplugRequested => {
                bail!(MachineError::NoUnplugRequest(id.to_string()))
            }
            Some(_) => Ok(()),
        }
    }

    fn finish_unplug(&mut self, id: &str) -> Result<()> {
        self.check_unplug_requested(id)?;
        let entry = self
            .devices
            .remove(id)
            .ok_or_else(|| anyhow!(MachineError::DevNotFound(id.to_string())))?;
        if let Some(name) = &entry.spec.backend {
            self.backends.release(entry.spec.class, name);
        }
        info!("Device {} detached", id);
        send_device_deleted_msg(&self.channel, id);
        Ok(())
    }

    fn cancel_unplug(&mut self, id: &str, reason: &str) -> Result<()> {
        self.check_unplug_requested(id)?;
        self.devices.set_state(id, DeviceState::Attached)?;
        warn!("Guest refused to release device {}: {}", id, reason);
        bail!(MachineError::UnplugRefused(id.to_string(), reason.to_string()))
    }

    fn bind_fd(&mut self, fd_name: String, fd: Option<RawFd>) -> Result<()> {
        let fd = fd.ok_or_else(|| anyhow!(MachineError::FdMissing("getfd".to_string())))?;
        if let Err(e) = check_arg_too_long(&fd_name, "fdname") {
            close_fd(fd);
            return Err(e);
        }
        if let Some(old) = self.channel.get_fd(&fd_name) {
            if let Some(net) = self.backends.net_using_fd(old) {
                close_fd(fd);
                bail!(MachineError::FdInUse(fd_name, net.id.clone()));
            }
        }
        if let Some(old) = self.channel.set_fd(fd_name, fd) {
            if old != fd {
                close_fd(old);
            }
        }
        Ok(())
    }

    fn set_balloon(&mut self, value: u64) -> Result<()> {
        let balloon = self
            .hooks
            .balloon
            .as_mut()
            .ok_or_else(|| anyhow!(MachineError::BalloonNotActive))?;
        let actual = balloon
            .set_target(value)
            .with_context(|| format!("Failed to set balloon size to {}", value))?;
        event!(self.channel, BalloonChanged; BalloonInfo { actual });
        Ok(())
    }
}

impl MachineLifecycle for Machine {
    fn notify_lifecycle(&mut self, old: VmState, new: VmState) -> Response {
        if self.vm_state == new {
            return Response::create_empty_response();
        }
        qmp_response(self.vm_state_transfer(old, new))
    }

    fn vm_state(&self) -> VmState {
        self.vm_state
    }
}

impl DeviceInterface for Machine {
    fn query_status(&self) -> Response {
        let status = match self.vm_state {
            VmState::Created => qmp_schema::RunState::prelaunch,
            VmState::Running => qmp_schema::RunState::running,
            VmState::Paused => qmp_schema::RunState::paused,
            VmState::Shutdown => qmp_schema::RunState::shutdown,
        };
        let qmp_state = qmp_schema::StatusInfo {
            singlestep: false,
            running: status == qmp_schema::RunState::running,
            status,
        };
        Ok::<_, QmpErrorClass>(qmp_state).into()
    }

    fn device_add(&mut self, args: Box<qmp_schema::DeviceAddArgument>) -> Response {
        let result = self.add_device(&args);
        if result.is_err() {
            error!("Failed to add device: id {}, type {}", args.id, args.driver);
        }
        qmp_response(result)
    }

    fn device_del(&mut self, device_id: String) -> std::result::Result<UnplugTicket, Response> {
        self.request_unplug(&device_id).map_err(|e| {
            error!("Failed to delete device: {:?}", e);
            Response::create_error_response(qmp_error_class(&e), None)
        })
    }

    fn device_unplugged(&mut self, device_id: &str) -> Response {
        qmp_response(self.finish_unplug(device_id))
    }

    fn device_unplug_refused(&mut self, device_id: &str, reason: &str) -> Response {
        qmp_response(self.cancel_unplug(device_id, reason))
    }

    fn blockdev_add(&mut self, args: Box<qmp_schema::BlockDevAddArgument>) -> Response {
        let result = BlockBackend::from_args(&args).and_then(|backend| {
            info!("Add block backend {} for {}", backend.node_name, backend.path_on_host);
            self.backends.add_block(backend)
        });
        qmp_response(result)
    }

    fn blockdev_del(&mut self, node_name: String) -> Response {
        qmp_response(self.backends.del_block(&node_name).map(|backend| {
            info!("Delete block backend {}", backend.node_name);
        }))
    }

    fn netdev_add(&mut self, args: Box<qmp_schema::NetDevAddArgument>) -> Response {
        let result = NetBackend::from_args(&args, &self.channel).and_then(|backend| {
            info!("Add net backend {}", backend.id);
            self.backends.add_net(backend)
        });
        qmp_response(result)
    }

    fn netdev_del(&mut self, id: String) -> Response {
        qmp_response(self.backends.del_net(&id).map(|backend| {
            info!("Delete net backend {}", backend.id);
        }))
    }

    fn getfd(&mut self, fd_name: String, if_fd: Option<RawFd>) -> Response {
        qmp_response(self.bind_fd(fd_name, if_fd))
    }

    fn balloon(&mut self, value: u64) -> Response {
        qmp_response(self.set_balloon(value))
    }

    fn query_balloon(&self) -> Response {
        match &self.hooks.balloon {
            Some(balloon) => Ok::<_, QmpErrorClass>(BalloonInfo {
                actual: balloon.actual(),
            })
            .into(),
            None => Response::create_error_response(
                QmpErrorClass::DeviceNotActive(MachineError::BalloonNotActive.to_string()),
                None,
            ),
        }
    }
}

impl MigrateInterface for Machine {
    fn migrate(&mut self, uri: String) -> Response {
        let result = self
            .migration
            .start(&uri, self.hooks.migration.clone())
            .map(|_| ());
        qmp_response(result)
    }

    fn query_migrate(&self) -> Response {
        let info = MigrationInfo {
            status: Some(self.migration.status().to_string()),
        };
        Ok::<_, QmpErrorClass>(info).into()
    }
}

impl MachineExternalInterface for Machine {}
