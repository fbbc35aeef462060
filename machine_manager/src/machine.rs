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

use std::os::unix::io::RawFd;
use std::sync::mpsc::{channel, Receiver, RecvTimeoutError, Sender};
use std::time::Duration;

use strum::VariantNames;

use crate::qmp::qmp_response::{Response, Version};
use crate::qmp::qmp_schema::{
    BlockDevAddArgument, Cmd, DeviceAddArgument, Events, NetDevAddArgument, QmpCommand,
    QmpErrorClass, QmpEvent,
};

/// State for VM.
#[derive(PartialEq, Eq, Copy, Clone, Debug)]
pub enum VmState {
    Created = 1,
    Running = 2,
    Paused = 5,
    Shutdown = 6,
}

/// Trait to handle virtual machine lifecycle.
///
/// # Notes
///
/// VM Life State graph:
///
/// `None` --`(new)`--> `Created`
/// `Created` --`(start)`--> `Running` or `Paused`
/// `Running` --`(pause)`--> `Paused`
/// `Paused` --`(resume)`--> `Running`
/// `VMSTATE_*` --`(destroy)`--> `Shutdown`
///
/// Requesting the state the VM is already in succeeds without effect.
pub trait MachineLifecycle {
    /// Pause VM, vCPUs are stopped until it is resumed or destroyed.
    fn pause(&mut self) -> Response {
        self.notify_lifecycle(VmState::Running, VmState::Paused)
    }

    /// Resume VM, resume VM state to running state after this call return.
    fn resume(&mut self) -> Response {
        self.notify_lifecycle(VmState::Paused, VmState::Running)
    }

    /// Close VM, stop running.
    fn destroy(&mut self) -> Response {
        let old = self.vm_state();
        self.notify_lifecycle(old, VmState::Shutdown)
    }

    /// When VM life state changed, notify concerned entry.
    ///
    /// # Arguments
    ///
    /// * `old` - The current `VmState`.
    /// * `new` - The new `VmState` expected to transform.
    fn notify_lifecycle(&mut self, old: VmState, new: VmState) -> Response;

    fn vm_state(&self) -> VmState;
}

/// Outcome of a guest unplug negotiation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UnplugOutcome {
    Acked,
    Refused(String),
    TimedOut,
}

/// Handed to the hot-plug collaborator, which answers once the guest has
/// released or refused to release the device.
#[derive(Debug)]
pub struct UnplugAck {
    device_id: String,
    sender: Sender<Result<(), String>>,
}

impl UnplugAck {
    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    /// The guest released the device.
    pub fn ack(self) {
        let _ = self.sender.send(Ok(()));
    }

    /// The guest refused to release the device.
    pub fn refuse(self, reason: &str) {
        let _ = self.sender.send(Err(reason.to_string()));
    }
}

/// Kept by the session which issued `device_del`, resolved by `UnplugAck`.
#[derive(Debug)]
pub struct UnplugTicket {
    device_id: String,
    receiver: Receiver<Result<(), String>>,
}

impl UnplugTicket {
    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    /// Wait for the guest's answer, `None` waits forever.
    pub fn wait(&self, timeout: Option<Duration>) -> UnplugOutcome {
        let answer = match timeout {
            Some(t) => self.receiver.recv_timeout(t),
            None => self
                .receiver
                .recv()
                .map_err(|_| RecvTimeoutError::Disconnected),
        };
        match answer {
            Ok(Ok(())) => UnplugOutcome::Acked,
            Ok(Err(reason)) => UnplugOutcome::Refused(reason),
            Err(RecvTimeoutError::Timeout) => UnplugOutcome::TimedOut,
            Err(RecvTimeoutError::Disconnected) => {
                UnplugOutcome::Refused("unplug request was dropped".to_string())
            }
        }
    }
}

/// Create the two ends of an unplug negotiation for `device_id`.
pub fn unplug_request(device_id: &str) -> (UnplugAck, UnplugTicket) {
    let (sender, receiver) = channel();
    (
        UnplugAck {
            device_id: device_id.to_string(),
            sender,
        },
        UnplugTicket {
            device_id: device_id.to_string(),
            receiver,
        },
    )
}

/// Device and backend hot-plug interface.
pub trait DeviceInterface {
    /// Query vm running state.
    fn query_status(&self) -> Response;

    /// Query the version of StratoVirt.
    fn query_version(&self) -> Response {
        Ok::<_, QmpErrorClass>(Version::new(1, 0, 5)).into()
    }

    /// Query all commands of StratoVirt.
    fn query_commands(&self) -> Response {
        let cmd_list: Vec<Cmd> = QmpCommand::VARIANTS
            .iter()
            .map(|name| Cmd {
                name: name.to_string(),
            })
            .collect();
        Ok::<_, QmpErrorClass>(cmd_list).into()
    }

    /// Query all events of StratoVirt.
    fn query_events(&self) -> Response {
        let events: Vec<Events> = QmpEvent::VARIANTS
            .iter()
            .map(|name| Events {
                name: name.to_string(),
            })
            .collect();
        Ok::<_, QmpErrorClass>(events).into()
    }

    /// Add a device with configuration.
    fn device_add(&mut self, args: Box<DeviceAddArgument>) -> Response;

    /// Start removing a device. On success the device is `UnplugRequested`
    /// and the returned ticket resolves when the guest answers.
    fn device_del(&mut self, device_id: String) -> Result<UnplugTicket, Response>;

    /// The guest released the device, finish its removal.
    fn device_unplugged(&mut self, device_id: &str) -> Response;

    /// The guest refused to release the device, keep it attached.
    fn device_unplug_refused(&mut self, device_id: &str, reason: &str) -> Response;

    /// Creates a new block device.
    fn blockdev_add(&mut self, args: Box<BlockDevAddArgument>) -> Response;

    /// Delete a block device.
    fn blockdev_del(&mut self, node_name: String) -> Response;

    /// Create a new network device.
    fn netdev_add(&mut self, args: Box<NetDevAddArgument>) -> Response;

    /// Delete a network device.
    fn netdev_del(&mut self, id: String) -> Response;

    /// Receive a file descriptor via SCM rights and assign it a name.
    fn getfd(&mut self, fd_name: String, if_fd: Option<RawFd>) -> Response;

    /// Set balloon's size.
    fn balloon(&mut self, size: u64) -> Response;

    /// Query the info of balloon.
    fn query_balloon(&self) -> Response;
}

/// Migrate external api
///
/// # Notes
///
/// Migration runs in background, this interface only starts it and reports
/// its status.
pub trait MigrateInterface {
    /// Migrates the current running guest to another VM or file.
    fn migrate(&mut self, uri: String) -> Response;

    /// Returns information about current migration process.
    fn query_migrate(&self) -> Response;
}

/// Machine interface which is exposed to outer hypervisor.
pub trait MachineExternalInterface:
    MachineLifecycle + DeviceInterface + MigrateInterface + Send
{
}
