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
use std::os::unix::io::RawFd;

use anyhow::{anyhow, bail, Result};

use crate::error::MachineError;
use crate::ops::DeviceClass;
use machine_manager::config::{check_arg_too_long, check_path_too_long, valid_id, ConfigError};
use machine_manager::qmp::qmp_schema::{BlockDevAddArgument, NetDevAddArgument};
use machine_manager::qmp::QmpChannel;

/// Config struct for a hot-plugged drive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockBackend {
    pub node_name: String,
    pub driver: String,
    pub path_on_host: String,
    pub read_only: bool,
    pub direct: bool,
    pub no_flush: bool,
    /// Device which uses this drive.
    pub attached: Option<String>,
}

impl BlockBackend {
    pub fn from_args(args: &BlockDevAddArgument) -> Result<Self> {
        let node_name = valid_id(&args.node_name)?;
        if args.file.driver != "file" {
            bail!(ConfigError::InvalidParam(
                args.file.driver.clone(),
                "file.driver".to_string()
            ));
        }
        if args.file.filename.is_empty() {
            bail!(ConfigError::FieldIsMissing(
                "filename".to_string(),
                "blockdev".to_string()
            ));
        }
        check_path_too_long(&args.file.filename, "Drive device path")?;

        let cache = args.cache.as_ref();
        Ok(BlockBackend {
            node_name,
            driver: args.file.driver.clone(),
            path_on_host: args.file.filename.clone(),
            read_only: args.read_only.unwrap_or(false),
            direct: cache.and_then(|c| c.direct).unwrap_or(true),
            no_flush: cache.and_then(|c| c.no_flush).unwrap_or(false),
            attached: None,
        })
    }
}

/// Config struct for a hot-plugged tap backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetBackend {
    pub id: String,
    /// Tap name on host, empty when a tap fd is given.
    pub if_name: String,
    pub tap_fd: Option<RawFd>,
    /// Name the tap fd was bound to with `getfd`.
    pub fd_name: Option<String>,
    pub attached: Option<String>,
}

impl NetBackend {
    /// Build the backend, `fds` (or `fd`) names a fd bound by `getfd` or is a
    /// fd number, with several fds only the last one is used.
    pub fn from_args(args: &NetDevAddArgument, channel: &QmpChannel) -> Result<Self> {
        let id = valid_id(&args.id)?;
        let if_name = args.if_name.clone().unwrap_or_default();
        check_arg_too_long(&if_name, "ifname")?;

        let mut backend = NetBackend {
            id,
            if_name,
            tap_fd: None,
            fd_name: None,
            attached: None,
        };
        if let Some(fds) = args.fds.as_ref().or(args.fd.as_ref()) {
            let netdev_fd = fds.rsplit(':').next().unwrap_or_default().to_string();
            if let Some(fd_num) = channel.get_fd(&netdev_fd) {
                backend.tap_fd = Some(fd_num);
                backend.fd_name = Some(netdev_fd);
            } else {
                let fd_num = netdev_fd
                    .parse::<RawFd>()
                    .map_err(|_| anyhow!(MachineError::FdUnknown(netdev_fd.clone())))?;
                backend.tap_fd = Some(fd_num);
            }
        }
        Ok(backend)
    }
}

/// Drives and taps added by `blockdev-add` and `netdev_add`.
#[derive(Default)]
pub struct BackendRegistry {
    blocks: BTreeMap<String, BlockBackend>,
    nets: BTreeMap<String, NetBackend>,
}

impl BackendRegistry {
    pub fn add_block(&mut self, backend: BlockBackend) -> Result<()> {
        if self.blocks.contains_key(&backend.node_name) {
            bail!(MachineError::BackendDuplicate(backend.node_name));
        }
        self.blocks.insert(backend.node_name.clone(), backend);
        Ok(())
    }

    pub fn del_block(&mut self, node_name: &str) -> Result<BlockBackend> {
        self.check_bindable(DeviceClass::Block, node_name)?;
        self.blocks
            .remove(node_name)
            .ok_or_else(|| anyhow!(MachineError::BackendNotFound(node_name.to_string())))
    }

    pub fn add_net(&mut self, backend: NetBackend) -> Result<()> {
        if self.nets.contains_key(&backend.id) {
            bail!(MachineError::BackendDuplicate(backend.id));
        }
        self.nets.insert(backend.id.clone(), backend);
        Ok(())
    }

    pub fn del_net(&mut self, id: &str) -> Result<NetBackend> {
        self.check_bindable(DeviceClass::Net, id)?;
        self.nets
            .remove(id)
            .ok_or_else(|| anyhow!(MachineError::BackendNotFound(id.to_string())))
    }

    pub fn block(&self, node_name: &str) -> Option<&BlockBackend> {
        self.blocks.get(node_name)
    }

    pub fn net(&self, id: &str) -> Option<&NetBackend> {
        self.nets.get(id)
    }

    fn attached(&self, class: DeviceClass, name: &str) -> Option<&Option<String>> {
        match class {
            DeviceClass::Block => self.blocks.get(name).map(|b| &b.attached),
            DeviceClass::Net => self.nets.get(name).map(|n| &n.attached),
            DeviceClass::Vfio => None,
        }
    }

    fn attached_mut(&mut self, class: DeviceClass, name: &str) -> Option<&mut Option<String>> {
        match class {
            DeviceClass::Block => self.blocks.get_mut(name).map(|b| &mut b.attached),
            DeviceClass::Net => self.nets.get_mut(name).map(|n| &mut n.attached),
            DeviceClass::Vfio => None,
        }
    }

    /// Check that backend `name` exists and no device uses it yet.
    pub fn check_bindable(&self, class: DeviceClass, name: &str) -> Result<()> {
        match self.attached(class, name) {
            None => Err(anyhow!(MachineError::BackendNotFound(name.to_string()))),
            Some(Some(dev)) => Err(anyhow!(MachineError::BackendInUse(
                name.to_string(),
                dev.clone()
            ))),
            Some(None) => Ok(()),
        }
    }

    pub fn bind(&mut self, class: DeviceClass, name: &str, dev_id: &str) -> Result<()> {
        self.check_bindable(class, name)?;
        if let Some(attached) = self.attached_mut(class, name) {
            *attached = Some(dev_id.to_string());
        }
        Ok(())
    }

    pub fn release(&mut self, class: DeviceClass, name: &str) {
        if let Some(attached) = self.attached_mut(class, name) {
            *attached = None;
        }
    }

    /// Find the net backend which uses tap fd `fd`.
    pub fn net_using_fd(&self, fd: RawFd) -> Option<&NetBackend> {
        self.nets.values().find(|n| n.tap_fd == Some(fd))
    }
}
