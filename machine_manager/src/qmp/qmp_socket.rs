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

use std::net::Shutdown;
use std::os::unix::io::{AsRawFd, RawFd};
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{channel, Receiver, Sender};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use log::{error, info, warn};
use serde_json::Value;

use super::qmp_schema::{self as schema, QmpCommand, QmpErrorClass};
use super::{parse_command, Outbound, QmpChannel, QmpGreeting, Response};
use crate::error::MachineManagerError;
use crate::event;
use crate::machine::{MachineExternalInterface, UnplugOutcome};
use crate::socket::{Frame, SocketHandler};
use crate::temp_cleaner::TempCleaner;
use util::leak_bucket::LeakBucket;
use util::unix::limit_permission;

/// Time `quit` gives sessions to write out their queues.
const QUIT_FLUSH_TIMEOUT: Duration = Duration::from_secs(1);

static SESSION_ID: AtomicU64 = AtomicU64::new(0);

/// Called once `quit` has been answered and `SHUTDOWN` flushed.
pub type QuitNotifier = dyn Fn() + Send + Sync;

/// What every session of a server shares.
#[derive(Clone)]
pub struct QmpContext {
    /// The controller which execute actual qmp command.
    pub controller: Arc<Mutex<dyn MachineExternalInterface>>,
    pub channel: Arc<QmpChannel>,
    /// Requests per second of one session, 0 for unlimited.
    pub rate_limit: u64,
    /// How long `device_del` waits for the guest, `None` waits forever.
    pub unplug_timeout: Option<Duration>,
    pub quit_notifier: Option<Arc<QuitNotifier>>,
}

impl QmpContext {
    pub fn new(
        controller: Arc<Mutex<dyn MachineExternalInterface>>,
        channel: Arc<QmpChannel>,
    ) -> Self {
        QmpContext {
            controller,
            channel,
            rate_limit: crate::config::DEFAULT_QMP_RATE_LIMIT,
            unplug_timeout: Some(Duration::from_secs(crate::config::DEFAULT_UNPLUG_TIMEOUT)),
            quit_notifier: None,
        }
    }
}

/// The wrapper over Unix socket listener serving qmp sessions.
///
/// # Examples
///
/// ```no_run
/// use std::sync::Arc;
///
/// use machine_manager::qmp::qmp_socket::{QmpContext, Socket};
///
/// fn serve(ctx: QmpContext) -> anyhow::Result<()> {
///     let socket = Socket::bind("/path/to/my/socket", ctx)?;
///     socket.serve()?.join().unwrap();
///     Ok(())
/// }
/// ```
pub struct Socket {
    listener: UnixListener,
    ctx: QmpContext,
}

impl Socket {
    /// Allocates a new `Socket` with `UnixListener`.
    ///
    /// # Arguments
    ///
    /// * `listener` - The `UnixListener` bind to `Socket`.
    /// * `ctx` - What sessions accepted on it share.
    pub fn from_unix_listener(listener: UnixListener, ctx: QmpContext) -> Self {
        Socket { listener, ctx }
    }

    /// Bind a listener at `path`, readable and writable by the owner only.
    /// The file is removed again when the process exits.
    pub fn bind(path: &str, ctx: QmpContext) -> Result<Self> {
        if Path::new(path).exists() {
            std::fs::remove_file(path)
                .with_context(|| format!("Failed to remove stale socket {}", path))?;
        }
        let listener = UnixListener::bind(path)
            .with_context(|| format!("Failed to bind qmp socket {}", path))?;
        TempCleaner::add_path(path.to_string());
        limit_permission(path)
            .with_context(|| format!("Failed to limit permission of {}", path))?;
        info!("QMP: listening on {}", path);
        Ok(Socket::from_unix_listener(listener, ctx))
    }

    pub fn get_listener_fd(&self) -> RawFd {
        self.listener.as_raw_fd()
    }

    /// Accept a new incoming connection unix stream from unix listener.
    pub fn accept_unix_stream(&self) -> Result<UnixStream> {
        let (stream, _) = self
            .listener
            .accept()
            .with_context(|| "Failed to accept qmp connection")?;
        Ok(stream)
    }

    /// Start a session on an accepted stream: the greeting is queued first,
    /// then the session subscribes to events and its reader and writer
    /// threads start.
    pub fn start_session(&self, stream: UnixStream) -> Result<JoinHandle<()>> {
        let session_id = SESSION_ID.fetch_add(1, Ordering::SeqCst);
        let name = format!("qmp-session-{}", session_id);
        let leak_bucket = LeakBucket::new(self.ctx.rate_limit)?;
        let writer_stream = stream
            .try_clone()
            .with_context(|| "Failed to clone qmp stream")?;

        let (out, rx) = channel();
        let greeting = serde_json::to_string(&QmpGreeting::create_greeting(1, 0, 5))?;
        info!("QMP: --> {:?}", greeting);
        let _ = out.send(Outbound::Frame(greeting));
        let subscriber = self.ctx.channel.subscribe(out.clone());

        if let Err(e) = thread::Builder::new()
            .name(format!("{}-w", name))
            .spawn(move || writer_loop(writer_stream, rx))
        {
            self.ctx.channel.unsubscribe(subscriber);
            bail!(MachineManagerError::SpawnThread(format!("{}: {}", name, e)));
        }

        let session = Session {
            name: name.clone(),
            stream,
            out,
            leak_bucket,
            subscriber,
            ctx: self.ctx.clone(),
        };
        info!("QMP: {} connected", name);
        thread::Builder::new()
            .name(name.clone())
            .spawn(move || session.run())
            .map_err(|e| MachineManagerError::SpawnThread(format!("{}: {}", name, e)).into())
    }

    /// Accept clients in a background thread, each one gets its own session.
    pub fn serve(self) -> Result<JoinHandle<()>> {
        thread::Builder::new()
            .name("qmp-listener".to_string())
            .spawn(move || loop {
                match self.accept_unix_stream() {
                    Ok(stream) => {
                        if let Err(e) = self.start_session(stream) {
                            error!("Failed to start qmp session: {:?}", e);
                        }
                    }
                    Err(e) => {
                        error!("{:?}", e);
                        break;
                    }
                }
            })
            .map_err(|e| MachineManagerError::SpawnThread(format!("qmp-listener: {}", e)).into())
    }
}

/// Drain a session's outbound queue into its stream.
fn writer_loop(stream: UnixStream, rx: Receiver<Outbound>) {
    let mut handler = SocketHandler::new(stream.as_raw_fd());
    for item in rx {
        match item {
            Outbound::Frame(frame) => {
                if let Err(e) = handler.send_str(&frame) {
                    warn!("Failed to send message to qmp client: {:?}", e);
                    let _ = stream.shutdown(Shutdown::Both);
                    break;
                }
            }
            Outbound::Flush(ack) => {
                let _ = ack.send(());
            }
        }
    }
}

fn close_fds(fds: Vec<RawFd>) {
    for fd in fds {
        // SAFETY: received descriptors are owned by the session until bound.
        unsafe { libc::close(fd) };
    }
}

/// One client connection.
struct Session {
    name: String,
    stream: UnixStream,
    out: Sender<Outbound>,
    leak_bucket: LeakBucket,
    subscriber: u64,
    ctx: QmpContext,
}

impl Session {
    fn run(mut self) {
        let mut reader = SocketHandler::new(self.stream.as_raw_fd());
        loop {
            let frame = match reader.next_frame() {
                Ok(Some(frame)) => frame,
                Ok(None) => {
                    info!("QMP: {} closed by client", self.name);
                    break;
                }
                Err(e) => {
                    warn!("QMP: {} closed: {:?}", self.name, e);
                    break;
                }
            };
            match self.handle_qmp(frame) {
                Ok(true) => {}
                Ok(false) => break,
                Err(e) => {
                    warn!("QMP: {} closed: {:?}", self.name, e);
                    break;
                }
            }
        }

        close_fds(reader.take_fds());
        self.ctx.channel.unsubscribe(self.subscriber);
        // The writer owns the other half and closes it once the queue drained.
        let _ = self.stream.shutdown(Shutdown::Read);
    }

    fn send_response(&self, response: &Response) -> Result<()> {
        let msg = serde_json::to_string(response)?;
        info!("QMP: --> {:?}", msg);
        self.out
            .send(Outbound::Frame(msg))
            .with_context(|| "Failed to send message to qmp client.")
    }

    /// Accept one frame, analyze and exec it. Returns whether the session
    /// goes on.
    ///
    /// # Errors
    ///
    /// The frame is not a JSON object or the session's writer is gone.
    fn handle_qmp(&mut self, frame: Frame) -> Result<bool> {
        // If flow over `rate_limit` per seconds, discard the request and return
        // a `RateLimited` error.
        if self.leak_bucket.throttled(1) {
            close_fds(frame.fds);
            let err_resp = QmpErrorClass::RateLimited(self.leak_bucket.units_per_second());
            self.send_response(&Response::create_error_response(err_resp, None))?;
            return Ok(true);
        }

        info!("QMP: <-- {:?}", frame.text);
        let value: Value = match serde_json::from_str(&frame.text) {
            Ok(Value::Object(obj)) => Value::Object(obj),
            _ => {
                close_fds(frame.fds);
                bail!(MachineManagerError::NotJsonObject(frame.text));
            }
        };

        let mut fds = frame.fds;
        let qmp_command = match parse_command(value) {
            Ok(cmd) => cmd,
            Err((err_resp, id)) => {
                close_fds(fds);
                self.send_response(&Response::create_error_response(err_resp, id))?;
                return Ok(true);
            }
        };
        let if_fd = match qmp_command {
            QmpCommand::getfd { .. } => fds.pop(),
            _ => None,
        };
        close_fds(fds);

        let (response, shutdown_flag) = qmp_command_exec(qmp_command, &self.ctx, if_fd);
        self.send_response(&response)?;

        // handle shutdown command
        if shutdown_flag {
            let shutdown_msg = schema::Shutdown {
                guest: false,
                reason: "host-qmp-quit".to_string(),
            };
            event!(self.ctx.channel, Shutdown; shutdown_msg);
            self.ctx.channel.flush(QUIT_FLUSH_TIMEOUT);
            if let Some(notifier) = self.ctx.quit_notifier.as_ref() {
                notifier();
            }
            return Ok(false);
        }

        Ok(true)
    }
}

/// Macro: to execute handle func with every arguments.
macro_rules! qmp_command_match {
    ( $func:tt, $executor:expr, $ret:expr ) => {
        $ret = $executor.$func().into();
    };
    ( $func:tt, $executor:expr, $cmd:expr, $ret:expr, $($arg:tt),* ) => {
        $ret = $executor.$func(
            $($cmd.$arg),*
        ).into();
    };
}

/// Macro: to execute handle func with all arguments.
macro_rules! qmp_command_match_with_argument {
    ( $func:tt, $executor:expr, $cmd:expr, $ret:expr ) => {
        $ret = $executor.$func($cmd).into();
    };
}

/// Macro `create_command_matches!`: Generate a match statement for qmp_command
/// , which is combined with its handle func.
///
/// # Arguments
///
/// `cmd_type_1` - The qmp command with no arguments.
/// `cmd_type_2` - The qmp command with arguments.
/// `cmd_type_3` - The qmp command handed its whole arguments.
macro_rules! create_command_matches {
    ( $command:expr; $executor:expr; $ret:expr;
      $(($cmd_type_1:tt, $func_1:tt)),*;
      $(($cmd_type_2:tt, $func_2:tt, $($arg:tt),*)),*;
      $(($cmd_type_3:tt, $func_3:tt)),*
    ) => {
        match $command {
            $(
                $crate::qmp::qmp_schema::QmpCommand::$cmd_type_1{ id, ..} => {
                    qmp_command_match!($func_1, $executor, $ret);
                    Some(id)
                },
            )*
            $(
                $crate::qmp::qmp_schema::QmpCommand::$cmd_type_2{ arguments, id } => {
                    qmp_command_match!($func_2, $executor, arguments, $ret, $($arg),*);
                    Some(id)
                },
            )*
            $(
                $crate::qmp::qmp_schema::QmpCommand::$cmd_type_3{ arguments, id } => {
                    qmp_command_match_with_argument!($func_3, $executor, arguments, $ret);
                    Some(id)
                },
            )*
            _ => None,
        }
    };
}

/// Finish `device_del`: the machine lock is only held to start and to
/// complete the removal, never while waiting for the guest.
fn device_del_sync(ctx: &QmpContext, device_id: String) -> Response {
    let ticket = match ctx.controller.lock().unwrap().device_del(device_id.clone()) {
        Ok(ticket) => ticket,
        Err(response) => return response,
    };

    match ticket.wait(ctx.unplug_timeout) {
        UnplugOutcome::Acked => ctx.controller.lock().unwrap().device_unplugged(&device_id),
        UnplugOutcome::Refused(reason) => ctx
            .controller
            .lock()
            .unwrap()
            .device_unplug_refused(&device_id, &reason),
        UnplugOutcome::TimedOut => {
            // The device stays UnplugRequested, a late answer still finishes it.
            let controller = ctx.controller.clone();
            let waiter_id = device_id.clone();
            let waiter = thread::Builder::new()
                .name(format!("unplug-{}", device_id))
                .spawn(move || match ticket.wait(None) {
                    UnplugOutcome::Acked => {
                        controller.lock().unwrap().device_unplugged(&waiter_id);
                    }
                    UnplugOutcome::Refused(reason) => {
                        controller
                            .lock()
                            .unwrap()
                            .device_unplug_refused(&waiter_id, &reason);
                    }
                    UnplugOutcome::TimedOut => {}
                });
            if let Err(e) = waiter {
                error!("Failed to wait for unplug of {}: {:?}", device_id, e);
            }
            Response::create_error_response(
                QmpErrorClass::BackendUnavailable(format!(
                    "Timed out waiting for the guest to release device {}",
                    device_id
                )),
                None,
            )
        }
    }
}

/// Exec one qmp command, returns its response and whether the VM shuts
/// down.
fn qmp_command_exec(
    qmp_command: QmpCommand,
    ctx: &QmpContext,
    if_fd: Option<RawFd>,
) -> (Response, bool) {
    let mut qmp_response = Response::create_empty_response();
    let mut shutdown_flag = false;
    let controller = &ctx.controller;

    // Use macro create match to cover most Qmp command
    let id = create_command_matches!(
        qmp_command.clone(); controller.lock().unwrap(); qmp_response;
        (stop, pause),
        (cont, resume),
        (query_status, query_status),
        (query_version, query_version),
        (query_commands, query_commands),
        (query_events, query_events),
        (query_balloon, query_balloon),
        (query_migrate, query_migrate);
        (blockdev_del, blockdev_del, node_name),
        (netdev_del, netdev_del, id),
        (balloon, balloon, value),
        (migrate, migrate, uri);
        (device_add, device_add),
        (blockdev_add, blockdev_add),
        (netdev_add, netdev_add)
    );

    // Handle the Qmp command which macro can't cover
    let id = match id {
        Some(id) => id,
        None => match qmp_command {
            QmpCommand::qmp_capabilities { id, .. } => id,
            QmpCommand::quit { id, .. } => {
                let destroyed = controller.lock().unwrap().destroy();
                if destroyed.is_error() {
                    error!("Failed to destroy VM on quit: {:?}", destroyed);
                }
                shutdown_flag = true;
                id
            }
            QmpCommand::getfd { arguments, id } => {
                qmp_response = controller.lock().unwrap().getfd(arguments.fd_name, if_fd);
                id
            }
            QmpCommand::device_del { arguments, id } => {
                qmp_response = device_del_sync(ctx, arguments.id);
                id
            }
            _ => None,
        },
    };

    // Change response id with input qmp message
    qmp_response.change_id(id);
    (qmp_response, shutdown_flag)
}
