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

use std::collections::BTreeMap;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{channel, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use log::{error, info, warn};
use serde::{Deserialize, Serialize};

use super::qmp_schema::{self as schema};
use util::time::NANOSECONDS_PER_SECOND;

/// Macro `event!`: send event to every qmp-client subscribed on a channel.
///
/// # Arguments
///
/// * `$c` - the `QmpChannel` to publish on
/// * `$x` - event type
/// * `$y` - event context
///
/// # Example
///
/// ```text
/// #[macro_use]
/// use machine_manager::qmp::*;
///
/// event!(channel, Shutdown; shutdown_msg);
/// event!(channel, Stop);
/// event!(channel, Resume);
/// ```
#[macro_export]
macro_rules! event {
    ( $c:expr, $x:tt ) => {{
        $c.send_event(&$crate::qmp::qmp_schema::QmpEvent::$x {
            data: Default::default(),
            timestamp: $crate::qmp::qmp_channel::create_timestamp(),
        });
    }};
    ( $c:expr, $x:tt;$y:expr ) => {{
        $c.send_event(&$crate::qmp::qmp_schema::QmpEvent::$x {
            data: $y,
            timestamp: $crate::qmp::qmp_channel::create_timestamp(),
        });
    }};
}

/// `TimeStamp` structure for `QmpEvent`.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
pub struct TimeStamp {
    seconds: u64,
    microseconds: u64,
}

/// Constructs a `TimeStamp` struct.
pub fn create_timestamp() -> TimeStamp {
    let since_the_epoch = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default();
    let seconds = u128::from(since_the_epoch.as_secs());
    let microseconds =
        (since_the_epoch.as_nanos() - seconds * (NANOSECONDS_PER_SECOND as u128)) / (1_000_u128);
    TimeStamp {
        seconds: seconds as u64,
        microseconds: microseconds as u64,
    }
}

/// Item queued for a session's writer thread.
#[derive(Debug)]
pub enum Outbound {
    /// A serialized frame, without the trailing "\r\n".
    Frame(String),
    /// Acknowledged once every frame queued before it has been written.
    Flush(Sender<()>),
}

/// The struct `QmpChannel` fans events out to every connected session and
/// stores file descriptors sent by clients.
///
/// Publishing only enqueues, so it is safe to call while holding the lock
/// that applied the state transition being announced.
#[derive(Default)]
pub struct QmpChannel {
    /// Outbound queues of subscribed sessions.
    subscribers: Mutex<BTreeMap<u64, Sender<Outbound>>>,
    next_subscriber: AtomicU64,
    /// Restore file descriptor received from client.
    fds: RwLock<BTreeMap<String, RawFd>>,
}

impl QmpChannel {
    pub fn new() -> Arc<Self> {
        Arc::new(QmpChannel::default())
    }

    /// Register a session's outbound queue, returns its subscriber id.
    pub fn subscribe(&self, sender: Sender<Outbound>) -> u64 {
        let id = self.next_subscriber.fetch_add(1, Ordering::SeqCst);
        self.subscribers.lock().unwrap().insert(id, sender);
        id
    }

    pub fn unsubscribe(&self, id: u64) {
        self.subscribers.lock().unwrap().remove(&id);
    }

    /// Check whether any session listens on this channel.
    pub fn is_connected(&self) -> bool {
        !self.subscribers.lock().unwrap().is_empty()
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().unwrap().len()
    }

    /// Restore extern file descriptor, returns the descriptor previously
    /// bound to `name`.
    ///
    /// # Arguments
    ///
    /// * `name` - Name of file descriptor.
    /// * `fd` - File descriptor sent by client.
    pub fn set_fd(&self, name: String, fd: RawFd) -> Option<RawFd> {
        self.fds.write().unwrap().insert(name, fd)
    }

    /// Get extern file descriptor restored in channel.
    ///
    /// # Arguments
    ///
    /// * `name` - Name of file descriptor.
    pub fn get_fd(&self, name: &str) -> Option<RawFd> {
        self.fds.read().unwrap().get(name).copied()
    }

    /// Send a `QmpEvent` to every subscribed client.
    ///
    /// # Arguments
    ///
    /// * `event` - The `QmpEvent` sent to client.
    pub fn send_event(&self, event: &schema::QmpEvent) {
        let event_str = match serde_json::to_string(event) {
            Ok(s) => s,
            Err(e) => {
                error!("Failed to serialize event {:?}: {:?}", event, e);
                return;
            }
        };
        let mut subscribers = self.subscribers.lock().unwrap();
        subscribers.retain(|id, sender| {
            let alive = sender.send(Outbound::Frame(event_str.clone())).is_ok();
            if !alive {
                warn!("Drop event subscriber {} which is gone", id);
            }
            alive
        });
        info!("EVENT: --> {:?}", event_str);
    }

    /// Wait until frames queued so far have been written by every session,
    /// at most `timeout` in total.
    pub fn flush(&self, timeout: Duration) {
        let deadline = Instant::now() + timeout;
        let acks: Vec<_> = {
            let subscribers = self.subscribers.lock().unwrap();
            subscribers
                .values()
                .filter_map(|sender| {
                    let (tx, rx) = channel();
                    sender.send(Outbound::Flush(tx)).ok().map(|_| rx)
                })
                .collect()
        };
        for ack in acks {
            let left = deadline.saturating_duration_since(Instant::now());
            // A disconnected ack means the writer is gone, nothing to wait for.
            if let Err(RecvTimeoutError::Timeout) = ack.recv_timeout(left) {
                warn!("Timed out flushing qmp sessions");
                return;
            }
        }
    }
}

/// Send device deleted message to qmp client.
pub fn send_device_deleted_msg(channel: &QmpChannel, id: &str) {
    if channel.is_connected() {
        let deleted_event = schema::DeviceDeleted {
            device: Some(id.to_string()),
            path: format!("/machine/peripheral/{}", id),
        };
        event!(channel, DeviceDeleted; deleted_event);
    } else {
        warn!("Qmp channel is not connected while sending device deleted message");
    }
}
