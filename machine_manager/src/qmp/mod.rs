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

//! This module implements a simple way to realize QMP.
//!
//! # Qmp Introduction
//!
//! [Qmp](https://wiki.qemu.org/Documentation/QMP) is a Json-based protocol
//! which allows applications to control a VM instance.
//! It has three feature:
//! 1. Qmp server is no-async service as well as Qemu's.
//! Command + events can replace asynchronous command.
//! 2. Several clients may be connected at one time, each one gets its own
//! session and all of them receive every event.
//! 3. Qmp's message structure base is transformed by scripts from Qemu's
//! `qmp-schema.json`. It's can be compatible by Qemu's zoology. Those
//! transformed structures can be found in `machine_manager/src/qmp/qmp_schema.rs`

#[allow(non_upper_case_globals)]
#[allow(non_camel_case_types)]
#[allow(non_snake_case)]
pub mod qmp_schema;

pub mod qmp_channel;
pub mod qmp_response;
pub mod qmp_socket;

pub use qmp_channel::{create_timestamp, send_device_deleted_msg, Outbound, QmpChannel, TimeStamp};
pub use qmp_response::{Empty, QmpGreeting, Response, Version};

use serde_json::Value;
use strum::VariantNames;

use self::qmp_schema::{QmpCommand, QmpErrorClass};

/// Resolve the command named by a decoded JSON object and validate its
/// arguments.
///
/// On failure the error class is returned together with the request id,
/// when one could be read, so that the error reply still echoes it.
pub fn parse_command(mut value: Value) -> Result<QmpCommand, (QmpErrorClass, Option<String>)> {
    let id = match value.get("id") {
        Some(Value::String(id)) => Some(id.clone()),
        // Only string ids are echoed, others are dropped.
        Some(_) => {
            if let Some(obj) = value.as_object_mut() {
                obj.remove("id");
            }
            None
        }
        None => None,
    };
    let name = match value.get("execute").and_then(Value::as_str) {
        Some(name) => name,
        None => {
            return Err((
                QmpErrorClass::InvalidArguments("Expected 'execute' in QMP input".to_string()),
                id,
            ))
        }
    };
    if !QmpCommand::VARIANTS.contains(&name) {
        return Err((
            QmpErrorClass::CommandNotFound(format!("The command {} has not been found", name)),
            id,
        ));
    }

    serde_json::from_value::<QmpCommand>(value)
        .map_err(|e| (QmpErrorClass::InvalidArguments(e.to_string()), id))
}
