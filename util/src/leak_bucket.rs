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

/// We use Leaky Bucket Algorithm to limit the rate of qmp commands.
///
/// The bucket holds at most `capacity` units and is refilled continuously at
/// `capacity` units per second. Refill is computed lazily from the time elapsed
/// since the previous check, so no timer is needed.
use std::time::Instant;

use anyhow::Result;

use crate::error::UtilError;
use crate::time::NANOSECONDS_PER_SECOND;

/// Used to improve the accuracy of bucket level.
const ACCURACY_SCALE: u64 = 1000;

/// Structure used to describe a Leaky Bucket.
#[derive(Debug)]
pub struct LeakBucket {
    /// Indicate the capacity of bucket, which is config by user.
    capacity: u64,
    /// Units left in the bucket, scaled by `ACCURACY_SCALE`.
    level: u64,
    /// The last time the level was refilled.
    prev_time: Instant,
}

impl LeakBucket {
    /// Construct function
    ///
    /// # Arguments
    ///
    /// * `units_ps` - units per second.
    pub fn new(units_ps: u64) -> Result<Self> {
        let capacity = units_ps
            .checked_mul(ACCURACY_SCALE)
            .ok_or(UtilError::CapacityOverflow(units_ps))?;
        Ok(LeakBucket {
            capacity,
            level: capacity,
            prev_time: Instant::now(),
        })
    }

    /// Units the bucket accepts per second.
    pub fn units_per_second(&self) -> u64 {
        self.capacity / ACCURACY_SCALE
    }

    /// Return true if the bucket has not enough units left, and the caller must
    /// reject the operation. Otherwise the units are consumed.
    ///
    /// # Arguments
    ///
    /// * `need_units` - units consumed by this operation.
    pub fn throttled(&mut self, need_units: u32) -> bool {
        self.throttled_at(Instant::now(), need_units)
    }

    /// Same as `throttled`, with the current time given by the caller.
    pub fn throttled_at(&mut self, now: Instant, need_units: u32) -> bool {
        // capacity value is zero, indicating that there is no need to limit
        if self.capacity == 0 {
            return false;
        }

        let nanos = now.saturating_duration_since(self.prev_time).as_nanos();
        let refill = nanos * u128::from(self.capacity) / u128::from(NANOSECONDS_PER_SECOND);
        if refill > 0 {
            let level = u128::from(self.level) + refill;
            self.level = level.min(u128::from(self.capacity)) as u64;
            self.prev_time = now;
        }

        let scaled_need = u64::from(need_units).saturating_mul(ACCURACY_SCALE);
        if self.level < scaled_need {
            return true;
        }
        self.level -= scaled_need;

        false
    }
}
