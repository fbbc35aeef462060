// Copyright (c) 2022 Huawei Technologies Co.,Ltd. All rights reserved.
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

use machine_manager::config::error::ConfigError;
use machine_manager::machine::VmState;
use machine_manager::qmp::qmp_schema::QmpErrorClass;
use migration::MigrationError;

#[derive(Error, Debug)]
pub enum MachineError {
    #[error("Util")]
    Util {
        #[from]
        source: util::error::UtilError,
    },
    #[error("MachineManager")]
    MachineManager {
        #[from]
        source: ConfigError,
    },
    #[error("Migration")]
    Migration {
        #[from]
        source: MigrationError,
    },
    #[error("Device id {0} already exists.")]
    DevIdDuplicate(String),
    #[error("Device {0} not found.")]
    DevNotFound(String),
    #[error("Driver {0} is not supported by {1} machine.")]
    DevTypeErr(String, String),
    #[error("Invalid addr {0} for device {1}.")]
    InvalidAddr(String, String),
    #[error("A maximum of {1} {0} replaceable devices are supported.")]
    RplDevLmtErr(String, usize),
    #[error("Slot {0} is already occupied by device {1}.")]
    SlotOccupied(String, String),
    #[error("Bus {0} not found.")]
    BusNotFound(String),
    #[error("Bus {0} doesn't support hotplug.")]
    BusNotHotpluggable(String),
    #[error("\'{0}\' is missing for \'{1}\'.")]
    FieldIsMissing(String, String),
    #[error("Backend {0} already exists.")]
    BackendDuplicate(String),
    #[error("Backend {0} not found.")]
    BackendNotFound(String),
    #[error("Backend {0} is in use by device {1}.")]
    BackendInUse(String, String),
    #[error("Device {0} is already being unplugged.")]
    UnplugInProgress(String),
    #[error("Device {0} has no pending unplug request.")]
    NoUnplugRequest(String),
    #[error("Guest refused to release device {0}: {1}")]
    UnplugRefused(String, String),
    #[error("Failed to realize device {0}.")]
    RlzDevErr(String),
    #[error("Vm lifecycle error: {0:?} -> {1:?} is illegal, current state {2:?}.")]
    LifecycleErr(VmState, VmState, VmState),
    #[error("Failed to {0} vcpus.")]
    VcpuErr(String),
    #[error("No file descriptor was passed with {0}.")]
    FdMissing(String),
    #[error("File descriptor {0} is in use by net backend {1}.")]
    FdInUse(String, String),
    #[error("Unknown file descriptor {0}.")]
    FdUnknown(String),
    #[error("No balloon device has been activated.")]
    BalloonNotActive,
}

impl MachineError {
    /// Class of the error reported to the qmp client.
    pub fn class(&self, desc: String) -> QmpErrorClass {
        match self {
            MachineError::MachineManager { .. }
            | MachineError::DevTypeErr(..)
            | MachineError::InvalidAddr(..)
            | MachineError::BusNotHotpluggable(_)
            | MachineError::FieldIsMissing(..)
            | MachineError::FdMissing(_)
            | MachineError::FdUnknown(_) => QmpErrorClass::InvalidArguments(desc),
            MachineError::DevIdDuplicate(_)
            | MachineError::SlotOccupied(..)
            | MachineError::BackendDuplicate(_)
            | MachineError::FdInUse(..) => QmpErrorClass::DuplicateKey(desc),
            MachineError::DevNotFound(_)
            | MachineError::BusNotFound(_)
            | MachineError::BackendNotFound(_) => QmpErrorClass::NotFound(desc),
            MachineError::RplDevLmtErr(..)
            | MachineError::BackendInUse(..)
            | MachineError::UnplugInProgress(_)
            | MachineError::NoUnplugRequest(_)
            | MachineError::LifecycleErr(..) => QmpErrorClass::InvalidState(desc),
            MachineError::BalloonNotActive => QmpErrorClass::DeviceNotActive(desc),
            MachineError::Migration { source } => migration_class(source, desc),
            MachineError::Util { .. }
            | MachineError::UnplugRefused(..)
            | MachineError::RlzDevErr(_)
            | MachineError::VcpuErr(_) => QmpErrorClass::BackendUnavailable(desc),
        }
    }
}

fn migration_class(err: &MigrationError, desc: String) -> QmpErrorClass {
    match err {
        MigrationError::MigrationInProgress(_) => QmpErrorClass::InvalidState(desc),
        MigrationError::UnsupportedUri(_) => QmpErrorClass::InvalidArguments(desc),
        _ => QmpErrorClass::BackendUnavailable(desc),
    }
}

/// Find the class of an error chain, the first typed error decides.
///
/// Errors nobody classified are failures of a collaborator.
pub fn qmp_error_class(err: &anyhow::Error) -> QmpErrorClass {
    let desc = format!("{:#}", err);
    // Typed errors attached as context are not visible in the chain.
    if let Some(e) = err.downcast_ref::<MachineError>() {
        return e.class(desc);
    }
    for cause in err.chain() {
        if let Some(e) = cause.downcast_ref::<MachineError>() {
            return e.class(desc);
        }
        if cause.downcast_ref::<ConfigError>().is_some() {
            return QmpErrorClass::InvalidArguments(desc);
        }
        if let Some(e) = cause.downcast_ref::<MigrationError>() {
            return migration_class(e, desc);
        }
    }
    QmpErrorClass::BackendUnavailable(desc)
}
