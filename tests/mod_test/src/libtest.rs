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

use std::cell::RefCell;
use std::fs;
use std::io::{Read, Write};
use std::os::unix::io::{AsRawFd, RawFd};
use std::os::unix::net::UnixStream;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::sleep;
use std::time::{Duration, Instant};

use anyhow::{bail, Result};
use clap::Parser;
use serde_json::Value;

use machine::ops::{DeviceSpec, HotplugOps};
use machine::{Machine, MachineHooks};
use machine_manager::cmdline::{create_vmconfig, Cmdline};
use machine_manager::machine::{MachineExternalInterface, UnplugAck};
use machine_manager::qmp::qmp_socket::{QmpContext, QuitNotifier, Socket};
use machine_manager::qmp::QmpChannel;
use machine_manager::socket::SocketRWHandler;
use migration::MigrationHook;

use crate::utils::get_tmp_dir;

const QMP_TIMEOUT: Duration = Duration::from_secs(10);

pub struct StreamHandler {
    stream: UnixStream,
    /// Bytes received after the last complete line.
    pending: RefCell<String>,
}

impl StreamHandler {
    fn new(stream: UnixStream) -> Self {
        StreamHandler {
            stream,
            pending: RefCell::new(String::new()),
        }
    }

    pub fn write_line(&self, cmd: &str) {
        (&self.stream).write_all(cmd.as_bytes()).unwrap();
    }

    /// Send `cmd` with `fd` attached as SCM_RIGHTS.
    pub fn write_with_fd(&self, cmd: &str, fd: RawFd) {
        let mut handler = SocketRWHandler::new(self.stream.as_raw_fd());
        handler.write_fd(cmd.as_bytes(), &[fd]).unwrap();
    }

    /// Read one line, `None` if nothing arrived within `timeout` or the
    /// server closed the session.
    pub fn read_line(&self, timeout: Duration) -> Option<String> {
        let start = Instant::now();
        let mut stream = &self.stream;
        loop {
            let line = {
                let mut pending = self.pending.borrow_mut();
                pending
                    .find('\n')
                    .map(|pos| pending.drain(..=pos).collect::<String>())
            };
            if let Some(line) = line {
                return Some(line.trim().to_string());
            }

            let left = timeout.checked_sub(start.elapsed())?;
            stream
                .set_read_timeout(Some(left.max(Duration::from_millis(1))))
                .unwrap();
            let mut buff = [0u8; 1024];
            match stream.read(&mut buff) {
                Ok(0) | Err(_) => return None,
                Ok(size) => self
                    .pending
                    .borrow_mut()
                    .push_str(&String::from_utf8_lossy(&buff[..size])),
            }
        }
    }

    pub fn try_read(&self, timeout: Duration) -> Option<Value> {
        self.read_line(timeout)
            .map(|line| serde_json::from_str(&line).unwrap())
    }

    pub fn qmp_read(&self) -> Value {
        self.try_read(QMP_TIMEOUT).unwrap()
    }

    pub fn qmp(&self, cmd: &str) -> Value {
        self.write_line(cmd);
        self.qmp_read()
    }

    pub fn qmp_with_fd(&self, cmd: &str, fd: RawFd) -> Value {
        self.write_with_fd(cmd, fd);
        self.qmp_read()
    }

    pub fn wait_qmp_event(&self) -> Value {
        let resp = self.qmp_read();
        assert!(resp.get("event").is_some(), "expect event, got {}", resp);
        resp
    }

    /// Check that the server closed the session.
    pub fn is_closed(&self) -> bool {
        self.read_line(QMP_TIMEOUT).is_none()
    }

    fn check_qmp_greet(&self) -> Value {
        let resp = self.qmp_read();
        assert!(resp.get("QMP").is_some(), "expect greeting, got {}", resp);
        resp
    }
}

/// What the guest answers to an unplug request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UnplugPolicy {
    Ack,
    Refuse(String),
    /// Keep the request until `TestState::answer_unplug`.
    Hold,
}

pub struct HotplugScript {
    pub unplug: UnplugPolicy,
    pub fail_plug: bool,
    /// Devices realized so far.
    pub plugged: Vec<DeviceSpec>,
    held: Vec<UnplugAck>,
}

impl Default for HotplugScript {
    fn default() -> Self {
        HotplugScript {
            unplug: UnplugPolicy::Ack,
            fail_plug: false,
            plugged: Vec::new(),
            held: Vec::new(),
        }
    }
}

struct TestHotplug(Arc<Mutex<HotplugScript>>);

impl HotplugOps for TestHotplug {
    fn plug(&mut self, spec: &DeviceSpec) -> Result<()> {
        let mut script = self.0.lock().unwrap();
        if script.fail_plug {
            bail!("Failed to realize {}", spec.id);
        }
        script.plugged.push(spec.clone());
        Ok(())
    }

    fn request_unplug(&mut self, _id: &str, ack: UnplugAck) -> Result<()> {
        let mut script = self.0.lock().unwrap();
        match script.unplug.clone() {
            UnplugPolicy::Ack => ack.ack(),
            UnplugPolicy::Refuse(reason) => ack.refuse(&reason),
            UnplugPolicy::Hold => script.held.push(ack),
        }
        Ok(())
    }
}

/// Each phase of a migration waits for one `TestState::migration_step`.
struct TestMigration {
    gate: Mutex<Receiver<()>>,
    fail_transfer: Arc<AtomicBool>,
}

impl MigrationHook for TestMigration {
    fn prepare(&self, _path: &str) -> Result<()> {
        self.gate.lock().unwrap().recv()?;
        Ok(())
    }

    fn transfer(&self, _path: &str) -> Result<()> {
        self.gate.lock().unwrap().recv()?;
        if self.fail_transfer.load(Ordering::SeqCst) {
            bail!("Failed to write vm state");
        }
        Ok(())
    }
}

pub struct TestState {
    qmp_sock: StreamHandler,
    qmp_path: String,
    hotplug: Arc<Mutex<HotplugScript>>,
    migration_gate: Sender<()>,
    fail_transfer: Arc<AtomicBool>,
    quit: Arc<AtomicBool>,
    pub resource_path: String,
}

impl Drop for TestState {
    fn drop(&mut self) {
        if Path::new(&self.resource_path).exists() {
            fs::remove_dir_all(&self.resource_path).unwrap();
        }
    }
}

impl TestState {
    /// Open another session on the same server.
    pub fn connect(&self) -> StreamHandler {
        let sock = StreamHandler::new(UnixStream::connect(&self.qmp_path).unwrap());
        sock.check_qmp_greet();
        sock
    }

    /// Quit the VM, the reply comes before the `SHUTDOWN` event.
    pub fn stop(&mut self) {
        let ret = self.qmp("{\"execute\": \"quit\"}");
        assert_eq!(ret["return"], serde_json::json!({}));
        let event = self.wait_qmp_event();
        assert_eq!(event["event"], "SHUTDOWN");
        assert_eq!(event["data"]["guest"], false);
        assert_eq!(event["data"]["reason"], "host-qmp-quit");

        let start = Instant::now();
        while !self.quit.load(Ordering::SeqCst) {
            assert!(start.elapsed() < QMP_TIMEOUT, "quit notifier never ran");
            sleep(Duration::from_millis(10));
        }
    }

    pub fn wait_qmp_event(&self) -> Value {
        self.qmp_sock.wait_qmp_event()
    }

    pub fn qmp(&self, cmd: &str) -> Value {
        self.qmp_sock.qmp(cmd)
    }

    pub fn qmp_read(&self) -> Value {
        self.qmp_sock.qmp_read()
    }

    pub fn qmp_with_fd(&self, cmd: &str, fd: RawFd) -> Value {
        self.qmp_sock.qmp_with_fd(cmd, fd)
    }

    pub fn qmp_sock(&self) -> &StreamHandler {
        &self.qmp_sock
    }

    pub fn hotplug(&self) -> MutexGuard<HotplugScript> {
        self.hotplug.lock().unwrap()
    }

    pub fn set_unplug_policy(&self, policy: UnplugPolicy) {
        self.hotplug().unplug = policy;
    }

    /// Answer every unplug request held so far.
    pub fn answer_unplug(&self, ack: bool) {
        let held: Vec<UnplugAck> = self.hotplug().held.drain(..).collect();
        for pending in held {
            if ack {
                pending.ack();
            } else {
                pending.refuse("device is busy");
            }
        }
    }

    pub fn held_unplugs(&self) -> usize {
        self.hotplug().held.len()
    }

    /// Let the running migration finish its current phase.
    pub fn migration_step(&self) {
        self.migration_gate.send(()).unwrap();
    }

    pub fn set_fail_transfer(&self, fail: bool) {
        self.fail_transfer.store(fail, Ordering::SeqCst);
    }

    /// Poll `query-migrate` until its status is `status`.
    pub fn wait_migration_status(&self, status: &str) {
        let start = Instant::now();
        loop {
            let ret = self.qmp("{\"execute\": \"query-migrate\"}");
            if ret["return"]["status"] == status {
                return;
            }
            assert!(
                start.elapsed() < QMP_TIMEOUT,
                "migration status {} never reached {}",
                ret["return"]["status"],
                status
            );
            sleep(Duration::from_millis(10));
        }
    }
}

/// Start a server with the given command line arguments plus a qmp socket
/// in a fresh temporary directory, and open a session on it.
pub fn test_init(extra_arg: Vec<&str>) -> TestState {
    let tmp_dir = get_tmp_dir();
    let qmp_path = format!("{}/qmp.socket", tmp_dir);
    let qmp_arg = format!("unix:{},server,nowait", qmp_path);
    let mut args = vec!["stratovirt-mgmt", "--qmp", qmp_arg.as_str()];
    args.extend(extra_arg);
    let cmd_args = Cmdline::try_parse_from(args).unwrap();
    let vm_config = create_vmconfig(&cmd_args).unwrap();

    let hotplug = Arc::new(Mutex::new(HotplugScript::default()));
    let (migration_gate, gate) = mpsc::channel();
    let fail_transfer = Arc::new(AtomicBool::new(false));
    let mut hooks = MachineHooks::from_config(&vm_config);
    hooks.hotplug = Box::new(TestHotplug(hotplug.clone()));
    hooks.migration = Arc::new(TestMigration {
        gate: Mutex::new(gate),
        fail_transfer: fail_transfer.clone(),
    });

    let qmp_channel = QmpChannel::new();
    let mut machine = Machine::new(&vm_config, qmp_channel.clone(), hooks).unwrap();
    machine.run(vm_config.freeze_cpu).unwrap();
    let vm: Arc<Mutex<dyn MachineExternalInterface>> = Arc::new(Mutex::new(machine));

    let quit = Arc::new(AtomicBool::new(false));
    let quit_flag = quit.clone();
    let quit_notifier: Arc<QuitNotifier> = Arc::new(move || {
        quit_flag.store(true, Ordering::SeqCst);
    });
    let mut ctx = QmpContext::new(vm, qmp_channel);
    ctx.rate_limit = vm_config.qmp_rate_limit;
    ctx.unplug_timeout = vm_config.unplug_timeout();
    ctx.quit_notifier = Some(quit_notifier);
    let socket = Socket::bind(&vm_config.qmp[0].path, ctx).unwrap();
    socket.serve().unwrap();

    let qmp_sock = StreamHandler::new(UnixStream::connect(&qmp_path).unwrap());
    qmp_sock.check_qmp_greet();
    TestState {
        qmp_sock,
        qmp_path,
        hotplug,
        migration_gate,
        fail_transfer,
        quit,
        resource_path: tmp_dir,
    }
}
