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

//! # Migration
//!
//! Track the migration / snapshot progress of a VM.
//!
//! ## Design
//!
//! This crate offers:
//! 1. The migration status record and its legal transfers.
//! 2. A driver which runs the preparation and transfer phases in the
//!    background and records the outcome.
//! 3. A `file:` snapshot target used when no other target is configured.

pub mod error;
pub mod manager;
pub mod snapshot;
pub mod status;

pub use anyhow::Result;

pub use error::MigrationError;
pub use manager::{MigrationHook, MigrationManager};
pub use snapshot::FileSnapshot;
pub use status::MigrationStatus;
