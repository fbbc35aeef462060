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
use nix::time::{clock_gettime, ClockId};

pub const NANOSECONDS_PER_SECOND: u64 = 1_000_000_000;
pub const MICROSECONDS_PER_SECOND: u64 = 1_000_000;

/// Get the wall clock time as (seconds, nanoseconds).
pub fn gettime() -> Result<(u32, u32)> {
    let ts = clock_gettime(ClockId::CLOCK_REALTIME).with_context(|| "Failed to get clock time")?;
    Ok((ts.tv_sec() as u32, ts.tv_nsec() as u32))
}

/// Split `sec` since epoch to local [year, month, day, hour, minute, second].
pub fn get_format_time(sec: i64) -> [i32; 6] {
    // SAFETY: tm is a plain C structure, all zero is a valid value.
    let mut ti: libc::tm = unsafe { std::mem::zeroed() };
    // SAFETY: both pointers point to valid memory owned by this function.
    unsafe {
        libc::localtime_r(&sec, &mut ti);
    }

    [
        ti.tm_year + 1900,
        ti.tm_mon + 1,
        ti.tm_mday,
        ti.tm_hour,
        ti.tm_min,
        ti.tm_sec,
    ]
}
