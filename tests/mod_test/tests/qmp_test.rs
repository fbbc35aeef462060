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
use std::time::Duration;

use serde_json::{json, Value};

use mod_test::libtest::test_init;

fn error_class(ret: &Value) -> &str {
    ret["error"]["class"].as_str().unwrap()
}

#[test]
fn qmp_session_basic() {
    let mut ts = test_init(Vec::new());

    let ret = ts.qmp("{\"execute\": \"qmp_capabilities\"}");
    assert_eq!(ret, json!({"return": {}}));

    let ret = ts.qmp("{\"execute\": \"query-status\", \"id\": \"status-1\"}");
    assert_eq!(ret["id"], "status-1");
    assert_eq!(
        ret["return"],
        json!({"running": true, "singlestep": false, "status": "running"})
    );

    let ret = ts.qmp("{\"execute\": \"query-version\"}");
    assert_eq!(ret["return"]["qemu"], json!({"micro": 1, "minor": 0, "major": 5}));
    assert!(ret["return"]["package"]
        .as_str()
        .unwrap()
        .starts_with("StratoVirt-"));

    let ret = ts.qmp("{\"execute\": \"query-commands\"}");
    let names: Vec<&str> = ret["return"]
        .as_array()
        .unwrap()
        .iter()
        .map(|cmd| cmd["name"].as_str().unwrap())
        .collect();
    for name in ["qmp_capabilities", "blockdev-add", "device_del", "query-migrate"] {
        assert!(names.contains(&name), "{} is missing", name);
    }

    let ret = ts.qmp("{\"execute\": \"query-events\"}");
    let events = ret["return"].to_string();
    assert!(events.contains("DEVICE_DELETED"));
    assert!(events.contains("SHUTDOWN"));

    ts.stop();
}

#[test]
fn qmp_command_errors() {
    let ts = test_init(Vec::new());

    let ret = ts.qmp("{\"execute\": \"no-such-command\", \"id\": \"x\"}");
    assert_eq!(error_class(&ret), "CommandNotFound");
    assert_eq!(ret["id"], "x");

    let ret = ts.qmp("{\"arguments\": {}}");
    assert_eq!(error_class(&ret), "InvalidArguments");

    let ret = ts.qmp("{\"execute\": \"balloon\", \"arguments\": {\"value\": \"big\"}}");
    assert_eq!(error_class(&ret), "InvalidArguments");

    let ret = ts.qmp("{\"execute\": \"netdev_del\", \"arguments\": {\"id\": \"n\", \"x\": 1}}");
    assert_eq!(error_class(&ret), "InvalidArguments");

    let ret = ts.qmp("{\"execute\": \"query-status\", \"arguments\": {\"verbose\": true}}");
    assert_eq!(error_class(&ret), "InvalidArguments");

    // A non-string id is not echoed, the command still runs.
    let ret = ts.qmp("{\"execute\": \"query-status\", \"id\": 5}");
    assert_eq!(ret["return"]["status"], "running");
    assert!(ret.get("id").is_none());

    // Errors never close the session.
    let ret = ts.qmp("{\"execute\": \"query-status\"}");
    assert_eq!(ret["return"]["running"], true);
}

#[test]
fn qmp_non_object_closes_session() {
    let ts = test_init(Vec::new());
    ts.qmp_sock().write_line("[1, 2, 3]\n");
    assert!(ts.qmp_sock().is_closed());

    // The server keeps serving other sessions.
    let session = ts.connect();
    let ret = session.qmp("{\"execute\": \"query-status\"}");
    assert_eq!(ret["return"]["status"], "running");
}

#[test]
fn qmp_stop_cont_events() {
    let ts = test_init(Vec::new());
    let other = ts.connect();

    // The event is queued before the reply.
    ts.qmp_sock().write_line("{\"execute\": \"stop\"}");
    assert_eq!(ts.wait_qmp_event()["event"], "STOP");
    assert_eq!(ts.qmp_read(), json!({"return": {}}));
    // Every session receives events.
    let event = other.wait_qmp_event();
    assert_eq!(event["event"], "STOP");
    assert!(event["timestamp"]["seconds"].as_u64().unwrap() > 0);
    assert!(event["timestamp"]["microseconds"].as_u64().unwrap() < 1_000_000);

    let ret = ts.qmp("{\"execute\": \"query-status\"}");
    assert_eq!(ret["return"]["status"], "paused");
    assert_eq!(ret["return"]["running"], false);

    // Stopping a paused VM raises nothing.
    assert_eq!(ts.qmp("{\"execute\": \"stop\"}"), json!({"return": {}}));

    ts.qmp_sock().write_line("{\"execute\": \"cont\", \"id\": \"c\"}");
    assert_eq!(ts.wait_qmp_event()["event"], "RESUME");
    assert_eq!(ts.qmp_read(), json!({"return": {}, "id": "c"}));
    assert_eq!(other.wait_qmp_event()["event"], "RESUME");
    assert!(other.try_read(Duration::from_millis(200)).is_none());
}

#[test]
fn qmp_freeze_at_startup() {
    let ts = test_init(vec!["-S"]);
    let ret = ts.qmp("{\"execute\": \"query-status\"}");
    assert_eq!(ret["return"]["status"], "paused");
    ts.qmp_sock().write_line("{\"execute\": \"cont\"}");
    assert_eq!(ts.wait_qmp_event()["event"], "RESUME");
    assert_eq!(ts.qmp_read(), json!({"return": {}}));
}

#[test]
fn qmp_rate_limit() {
    let ts = test_init(vec!["--qmp-rate-limit", "5"]);
    let burst = "{\"execute\": \"query-status\", \"id\": \"r\"}".repeat(6);
    ts.qmp_sock().write_line(&burst);
    for _ in 0..5 {
        let ret = ts.qmp_read();
        assert_eq!(ret["id"], "r");
        assert!(ret.get("return").is_some());
    }
    let ret = ts.qmp_read();
    assert_eq!(error_class(&ret), "RateLimited");
    assert!(ret.get("id").is_none());

    // The session stays open and tokens come back.
    std::thread::sleep(Duration::from_millis(1100));
    let ret = ts.qmp("{\"execute\": \"query-status\"}");
    assert!(ret.get("return").is_some());
}

#[test]
fn qmp_getfd() {
    let ts = test_init(Vec::new());

    let ret = ts.qmp("{\"execute\": \"getfd\", \"arguments\": {\"fdname\": \"tap-fd\"}}");
    assert_eq!(error_class(&ret), "InvalidArguments");

    let file = File::open("/dev/null").unwrap();
    let ret = ts.qmp_with_fd(
        "{\"execute\": \"getfd\", \"arguments\": {\"fdname\": \"tap-fd\"}}",
        file.as_raw_fd(),
    );
    assert_eq!(ret, json!({"return": {}}));

    let ret = ts.qmp(
        "{\"execute\": \"netdev_add\", \"arguments\": {\"id\": \"net-0\", \"fds\": \"tap-fd\"}}",
    );
    assert_eq!(ret, json!({"return": {}}));

    // The name is bound to a fd which a live backend uses.
    let ret = ts.qmp_with_fd(
        "{\"execute\": \"getfd\", \"arguments\": {\"fdname\": \"tap-fd\"}}",
        file.as_raw_fd(),
    );
    assert_eq!(error_class(&ret), "DuplicateKey");

    assert_eq!(
        ts.qmp("{\"execute\": \"netdev_del\", \"arguments\": {\"id\": \"net-0\"}}"),
        json!({"return": {}})
    );
    let ret = ts.qmp_with_fd(
        "{\"execute\": \"getfd\", \"arguments\": {\"fdname\": \"tap-fd\"}}",
        file.as_raw_fd(),
    );
    assert_eq!(ret, json!({"return": {}}));
}

#[test]
fn qmp_balloon() {
    let ts = test_init(Vec::new());
    let ret = ts.qmp("{\"execute\": \"query-balloon\"}");
    assert_eq!(error_class(&ret), "DeviceNotActive");
    let ret = ts.qmp("{\"execute\": \"balloon\", \"arguments\": {\"value\": 1073741824}}");
    assert_eq!(error_class(&ret), "DeviceNotActive");

    let ts = test_init(vec!["--balloon", "2147483648"]);
    let ret = ts.qmp("{\"execute\": \"query-balloon\"}");
    assert_eq!(ret["return"]["actual"], 2147483648u64);

    ts.qmp_sock()
        .write_line("{\"execute\": \"balloon\", \"arguments\": {\"value\": 1073741824}}");
    let event = ts.wait_qmp_event();
    assert_eq!(event["event"], "BALLOON_CHANGED");
    assert_eq!(event["data"]["actual"], 1073741824u64);
    assert_eq!(ts.qmp_read(), json!({"return": {}}));
    let ret = ts.qmp("{\"execute\": \"query-balloon\"}");
    assert_eq!(ret["return"]["actual"], 1073741824u64);
}

#[test]
fn qmp_quit_reaches_every_session() {
    let mut ts = test_init(Vec::new());
    let other = ts.connect();
    ts.stop();
    let event = other.wait_qmp_event();
    assert_eq!(event["event"], "SHUTDOWN");
    assert_eq!(event["data"]["reason"], "host-qmp-quit");
}
