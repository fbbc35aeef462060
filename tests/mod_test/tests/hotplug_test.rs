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

use std::fs::File;
use std::os::unix::io::AsRawFd;
use std::thread::sleep;
use std::time::{Duration, Instant};

use serde_json::{json, Value};

use machine::ops::DeviceAddr;
use mod_test::libtest::{test_init, TestState, UnplugPolicy};

fn error_class(ret: &Value) -> &str {
    ret["error"]["class"].as_str().unwrap()
}

fn blockdev_add(ts: &TestState, node_name: &str) -> Value {
    let cmd = json!({
        "execute": "blockdev-add",
        "arguments": {
            "node-name": node_name,
            "file": {"driver": "file", "filename": format!("/tmp/{}.img", node_name)},
            "cache": {"direct": false},
            "read-only": false
        }
    });
    ts.qmp(&cmd.to_string())
}

fn device_add(ts: &TestState, args: Value) -> Value {
    let cmd = json!({"execute": "device_add", "arguments": args});
    ts.qmp(&cmd.to_string())
}

fn simple_cmd(ts: &TestState, execute: &str, key: &str, id: &str) -> Value {
    let cmd = json!({"execute": execute, "arguments": {key: id}});
    ts.qmp(&cmd.to_string())
}

/// Send `device_del`, the `DEVICE_DELETED` event arrives before the reply.
fn device_del_acked(ts: &TestState, id: &str) {
    let cmd = json!({"execute": "device_del", "arguments": {"id": id}, "id": "del"});
    ts.qmp_sock().write_line(&cmd.to_string());
    let event = ts.wait_qmp_event();
    assert_eq!(event["event"], "DEVICE_DELETED");
    assert_eq!(event["data"]["device"], id);
    assert_eq!(event["data"]["path"], format!("/machine/peripheral/{}", id));
    assert_eq!(ts.qmp_read(), json!({"return": {}, "id": "del"}));
}

#[test]
fn hotplug_block_device_micro() {
    let ts = test_init(Vec::new());
    assert_eq!(blockdev_add(&ts, "drive-0"), json!({"return": {}}));
    assert_eq!(blockdev_add(&ts, "drive-1"), json!({"return": {}}));

    let ret = device_add(
        &ts,
        json!({"id": "blk-0", "driver": "virtio-blk-device", "drive": "drive-0"}),
    );
    assert_eq!(ret, json!({"return": {}}));
    let ret = device_add(
        &ts,
        json!({"id": "blk-1", "driver": "virtio-blk-mmio", "drive": "drive-1", "serial": "abc"}),
    );
    assert_eq!(ret, json!({"return": {}}));
    {
        let script = ts.hotplug();
        assert_eq!(script.plugged.len(), 2);
        assert_eq!(script.plugged[0].addr, DeviceAddr::Mmio(0));
        assert_eq!(script.plugged[1].addr, DeviceAddr::Mmio(1));
        assert_eq!(script.plugged[1].serial.as_deref(), Some("abc"));
    }

    let ret = simple_cmd(&ts, "blockdev-del", "node-name", "drive-0");
    assert_eq!(error_class(&ret), "InvalidState");

    device_del_acked(&ts, "blk-0");
    let ret = simple_cmd(&ts, "blockdev-del", "node-name", "drive-0");
    assert_eq!(ret, json!({"return": {}}));
    let ret = simple_cmd(&ts, "blockdev-del", "node-name", "drive-0");
    assert_eq!(error_class(&ret), "NotFound");

    // The freed slot is reused first.
    assert_eq!(blockdev_add(&ts, "drive-2"), json!({"return": {}}));
    let ret = device_add(
        &ts,
        json!({"id": "blk-2", "driver": "virtio-blk-device", "drive": "drive-2"}),
    );
    assert_eq!(ret, json!({"return": {}}));
    assert_eq!(ts.hotplug().plugged[2].addr, DeviceAddr::Mmio(0));
}

#[test]
fn hotplug_device_errors() {
    let ts = test_init(vec!["--machine", "type=microvm,net-slots=1"]);
    assert_eq!(blockdev_add(&ts, "drive-0"), json!({"return": {}}));
    assert_eq!(error_class(&blockdev_add(&ts, "drive-0")), "DuplicateKey");
    assert_eq!(
        simple_cmd(&ts, "netdev_add", "id", "net-0"),
        json!({"return": {}})
    );
    assert_eq!(
        simple_cmd(&ts, "netdev_add", "id", "net-1"),
        json!({"return": {}})
    );
    let ret = simple_cmd(&ts, "netdev_add", "id", "net-0");
    assert_eq!(error_class(&ret), "DuplicateKey");

    let cases = [
        (json!({"id": "d", "driver": "virtio-gpu"}), "InvalidArguments"),
        (json!({"id": "d", "driver": "virtio-blk-pci", "drive": "drive-0"}), "InvalidArguments"),
        (json!({"id": "d", "driver": "virtio-blk-device"}), "InvalidArguments"),
        (json!({"id": "d", "driver": "virtio-blk-device", "drive": "nope"}), "NotFound"),
        (
            json!({"id": "d", "driver": "virtio-blk-device", "drive": "drive-0", "addr": "0x9"}),
            "InvalidArguments",
        ),
        (
            json!({"id": "d", "driver": "virtio-net-device", "netdev": "net-0", "mac": "1:2"}),
            "InvalidArguments",
        ),
        (json!({"id": "", "driver": "virtio-blk-device", "drive": "drive-0"}), "InvalidArguments"),
    ];
    for (args, class) in cases {
        let ret = device_add(&ts, args.clone());
        assert_eq!(error_class(&ret), class, "device_add {}", args);
    }
    assert!(ts.hotplug().plugged.is_empty());

    let ret = device_add(
        &ts,
        json!({"id": "blk-0", "driver": "virtio-blk-device", "drive": "drive-0", "addr": "0x1"}),
    );
    assert_eq!(ret, json!({"return": {}}));
    let ret = device_add(
        &ts,
        json!({"id": "blk-0", "driver": "virtio-blk-device", "drive": "drive-0"}),
    );
    assert_eq!(error_class(&ret), "DuplicateKey");
    let ret = device_add(
        &ts,
        json!({"id": "blk-1", "driver": "virtio-blk-device", "drive": "drive-0"}),
    );
    assert_eq!(error_class(&ret), "InvalidState");

    let ret = device_add(
        &ts,
        json!({"id": "nic-0", "driver": "virtio-net-device", "netdev": "net-0",
               "mac": "52:54:00:12:34:56"}),
    );
    assert_eq!(ret, json!({"return": {}}));
    // A single net slot was configured.
    let ret = device_add(
        &ts,
        json!({"id": "nic-1", "driver": "virtio-net-device", "netdev": "net-1"}),
    );
    assert_eq!(error_class(&ret), "InvalidState");
    let ret = simple_cmd(&ts, "netdev_del", "id", "net-0");
    assert_eq!(error_class(&ret), "InvalidState");

    let ret = simple_cmd(&ts, "device_del", "id", "nope");
    assert_eq!(error_class(&ret), "NotFound");
}

#[test]
fn hotplug_unplug_refused() {
    let ts = test_init(Vec::new());
    assert_eq!(blockdev_add(&ts, "drive-0"), json!({"return": {}}));
    let args = json!({"id": "blk-0", "driver": "virtio-blk-device", "drive": "drive-0"});
    assert_eq!(device_add(&ts, args.clone()), json!({"return": {}}));

    ts.set_unplug_policy(UnplugPolicy::Refuse("in use".to_string()));
    let ret = simple_cmd(&ts, "device_del", "id", "blk-0");
    assert_eq!(error_class(&ret), "BackendUnavailable");
    assert!(ret["error"]["desc"].as_str().unwrap().contains("in use"));
    assert!(ts.qmp_sock().try_read(Duration::from_millis(200)).is_none());

    // Still attached.
    assert_eq!(error_class(&device_add(&ts, args)), "DuplicateKey");
    ts.set_unplug_policy(UnplugPolicy::Ack);
    device_del_acked(&ts, "blk-0");
}

#[test]
fn hotplug_unplug_timeout() {
    let ts = test_init(vec!["--unplug-timeout", "1"]);
    assert_eq!(blockdev_add(&ts, "drive-0"), json!({"return": {}}));
    let args = json!({"id": "blk-0", "driver": "virtio-blk-device", "drive": "drive-0"});
    assert_eq!(device_add(&ts, args), json!({"return": {}}));

    ts.set_unplug_policy(UnplugPolicy::Hold);
    let start = Instant::now();
    let ret = simple_cmd(&ts, "device_del", "id", "blk-0");
    assert_eq!(error_class(&ret), "BackendUnavailable");
    assert!(start.elapsed() >= Duration::from_secs(1));
    assert_eq!(ts.held_unplugs(), 1);

    let ret = simple_cmd(&ts, "device_del", "id", "blk-0");
    assert_eq!(error_class(&ret), "InvalidState");

    // The guest answers late, the removal still completes.
    ts.answer_unplug(true);
    let event = ts.wait_qmp_event();
    assert_eq!(event["event"], "DEVICE_DELETED");
    assert_eq!(event["data"]["device"], "blk-0");
    let ret = simple_cmd(&ts, "blockdev-del", "node-name", "drive-0");
    assert_eq!(ret, json!({"return": {}}));
}

fn wait_held_unplug(ts: &TestState) {
    let start = Instant::now();
    while ts.held_unplugs() == 0 {
        assert!(start.elapsed() < Duration::from_secs(10), "unplug never requested");
        sleep(Duration::from_millis(10));
    }
}

#[test]
fn hotplug_pending_unplug_does_not_block_others() {
    let ts = test_init(vec!["--unplug-timeout", "0"]);
    assert_eq!(blockdev_add(&ts, "drive-0"), json!({"return": {}}));
    let args = json!({"id": "blk-0", "driver": "virtio-blk-device", "drive": "drive-0"});
    assert_eq!(device_add(&ts, args), json!({"return": {}}));
    let other = ts.connect();

    ts.set_unplug_policy(UnplugPolicy::Hold);
    let cmd = json!({"execute": "device_del", "arguments": {"id": "blk-0"}, "id": "d"});
    ts.qmp_sock().write_line(&cmd.to_string());
    wait_held_unplug(&ts);

    // The waiting session holds no lock on the machine.
    let ret = other.qmp("{\"execute\": \"query-status\"}");
    assert_eq!(ret["return"]["status"], "running");
    let ret = other.qmp("{\"execute\": \"netdev_add\", \"arguments\": {\"id\": \"net-1\"}}");
    assert_eq!(ret, json!({"return": {}}));
    assert!(ts.qmp_sock().try_read(Duration::from_millis(100)).is_none());

    ts.answer_unplug(true);
    let event = ts.wait_qmp_event();
    assert_eq!(event["event"], "DEVICE_DELETED");
    assert_eq!(event["data"]["device"], "blk-0");
    assert_eq!(ts.qmp_read(), json!({"return": {}, "id": "d"}));
    let event = other.wait_qmp_event();
    assert_eq!(event["event"], "DEVICE_DELETED");
    assert_eq!(event["data"]["device"], "blk-0");
}

#[test]
fn hotplug_getfd_queued_behind_unplug() {
    let ts = test_init(vec!["--unplug-timeout", "0"]);
    assert_eq!(blockdev_add(&ts, "drive-0"), json!({"return": {}}));
    let args = json!({"id": "blk-0", "driver": "virtio-blk-device", "drive": "drive-0"});
    assert_eq!(device_add(&ts, args), json!({"return": {}}));

    ts.set_unplug_policy(UnplugPolicy::Hold);
    let sock = ts.qmp_sock();
    let cmd = json!({"execute": "device_del", "arguments": {"id": "blk-0"}, "id": "d"});
    sock.write_line(&cmd.to_string());
    wait_held_unplug(&ts);

    // Both frames wait in the socket while the session is busy.
    let file = File::open("/dev/null").unwrap();
    sock.write_line("{\"execute\": \"query-status\", \"id\": \"a\"}");
    sock.write_with_fd(
        "{\"execute\": \"getfd\", \"arguments\": {\"fdname\": \"tap-fd\"}, \"id\": \"b\"}",
        file.as_raw_fd(),
    );
    sleep(Duration::from_millis(100));
    ts.answer_unplug(true);

    assert_eq!(ts.wait_qmp_event()["event"], "DEVICE_DELETED");
    assert_eq!(ts.qmp_read(), json!({"return": {}, "id": "d"}));
    let ret = ts.qmp_read();
    assert_eq!(ret["id"], "a");
    assert_eq!(ret["return"]["status"], "running");
    assert_eq!(ts.qmp_read(), json!({"return": {}, "id": "b"}));

    let ret = ts.qmp(
        "{\"execute\": \"netdev_add\", \"arguments\": {\"id\": \"net-0\", \"fds\": \"tap-fd\"}}",
    );
    assert_eq!(ret, json!({"return": {}}));
}

#[test]
fn hotplug_plug_failure() {
    let ts = test_init(Vec::new());
    assert_eq!(blockdev_add(&ts, "drive-0"), json!({"return": {}}));
    ts.hotplug().fail_plug = true;
    let args = json!({"id": "blk-0", "driver": "virtio-blk-device", "drive": "drive-0"});
    let ret = device_add(&ts, args.clone());
    assert_eq!(error_class(&ret), "BackendUnavailable");

    let ret = simple_cmd(&ts, "device_del", "id", "blk-0");
    assert_eq!(error_class(&ret), "NotFound");
    ts.hotplug().fail_plug = false;
    assert_eq!(device_add(&ts, args), json!({"return": {}}));
}

#[test]
fn hotplug_pcie_root_ports() {
    let ts = test_init(vec!["--machine", "type=standard,root-ports=2"]);
    assert_eq!(
        simple_cmd(&ts, "netdev_add", "id", "net-0"),
        json!({"return": {}})
    );

    let cases = [
        (json!({"id": "nic-0", "driver": "virtio-net-pci", "netdev": "net-0"}), "InvalidArguments"),
        (
            json!({"id": "nic-0", "driver": "virtio-net-pci", "netdev": "net-0", "bus": "pcie.0"}),
            "InvalidArguments",
        ),
        (
            json!({"id": "nic-0", "driver": "virtio-net-pci", "netdev": "net-0", "bus": "pcie.3"}),
            "NotFound",
        ),
        (
            json!({"id": "nic-0", "driver": "virtio-net-device", "netdev": "net-0",
                   "bus": "pcie.1"}),
            "InvalidArguments",
        ),
        (
            json!({"id": "nic-0", "driver": "virtio-net-pci", "netdev": "net-0", "bus": "pcie.1",
                   "addr": "0x1.0x0"}),
            "InvalidArguments",
        ),
    ];
    for (args, class) in cases {
        let ret = device_add(&ts, args.clone());
        assert_eq!(error_class(&ret), class, "device_add {}", args);
    }

    let ret = device_add(
        &ts,
        json!({"id": "nic-0", "driver": "virtio-net-pci", "netdev": "net-0", "bus": "pcie.1",
               "addr": "0x0"}),
    );
    assert_eq!(ret, json!({"return": {}}));
    assert_eq!(
        ts.hotplug().plugged[0].addr,
        DeviceAddr::Pci {
            bus: "pcie.1".to_string(),
            slot: 0,
            func: 0
        }
    );

    let ret = device_add(
        &ts,
        json!({"id": "vfio-0", "driver": "vfio-pci", "host": "0000:1a:00.3", "bus": "pcie.1"}),
    );
    assert_eq!(error_class(&ret), "DuplicateKey");
    let ret = device_add(&ts, json!({"id": "vfio-0", "driver": "vfio-pci", "bus": "pcie.2"}));
    assert_eq!(error_class(&ret), "InvalidArguments");
    let ret = device_add(
        &ts,
        json!({"id": "vfio-0", "driver": "vfio-pci", "host": "0000:1a:00.3", "bus": "pcie.2"}),
    );
    assert_eq!(ret, json!({"return": {}}));

    let other = ts.connect();
    device_del_acked(&ts, "nic-0");
    assert_eq!(other.wait_qmp_event()["event"], "DEVICE_DELETED");
    assert_eq!(
        simple_cmd(&ts, "netdev_del", "id", "net-0"),
        json!({"return": {}})
    );
}
