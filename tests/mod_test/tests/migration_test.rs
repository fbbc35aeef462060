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

use serde_json::{json, Value};

use mod_test::libtest::{test_init, TestState};

fn migrate(ts: &TestState, uri: &str) -> Value {
    let cmd = json!({"execute": "migrate", "arguments": {"uri": uri}});
    ts.qmp(&cmd.to_string())
}

fn query_status(ts: &TestState) -> Value {
    ts.qmp("{\"execute\": \"query-migrate\"}")["return"]["status"].clone()
}

#[test]
fn migration_uri_check() {
    let ts = test_init(Vec::new());
    assert_eq!(query_status(&ts), "none");

    for uri in ["tcp:127.0.0.1:4446", "unix:/tmp/migrate.sock", "file:", "/tmp/vm.state"] {
        let ret = migrate(&ts, uri);
        assert_eq!(ret["error"]["class"], "InvalidArguments", "uri {}", uri);
    }
    // A refused uri leaves no record behind.
    assert_eq!(query_status(&ts), "none");
}

#[test]
fn migration_lifecycle() {
    let ts = test_init(Vec::new());
    let uri = format!("file:{}/vm.state", ts.resource_path);
    assert_eq!(migrate(&ts, &uri), json!({"return": {}}));
    assert_eq!(query_status(&ts), "setup");

    let ret = migrate(&ts, &uri);
    assert_eq!(ret["error"]["class"], "InvalidState");

    ts.migration_step();
    ts.wait_migration_status("active");
    let ret = migrate(&ts, &uri);
    assert_eq!(ret["error"]["class"], "InvalidState");

    // Other commands are served while the state is moving.
    let ret = ts.qmp("{\"execute\": \"query-status\"}");
    assert_eq!(ret["return"]["status"], "running");

    ts.migration_step();
    ts.wait_migration_status("completed");

    // A finished migration may be started again.
    assert_eq!(migrate(&ts, &uri), json!({"return": {}}));
    ts.migration_step();
    ts.migration_step();
    ts.wait_migration_status("completed");
}

#[test]
fn migration_transfer_failure() {
    let ts = test_init(Vec::new());
    let uri = format!("file:{}/vm.state", ts.resource_path);
    ts.set_fail_transfer(true);
    assert_eq!(migrate(&ts, &uri), json!({"return": {}}));
    ts.migration_step();
    ts.migration_step();
    ts.wait_migration_status("failed");

    ts.set_fail_transfer(false);
    assert_eq!(migrate(&ts, &uri), json!({"return": {}}));
    ts.migration_step();
    ts.wait_migration_status("active");
    ts.migration_step();
    ts.wait_migration_status("completed");

    let other = ts.connect();
    let ret = other.qmp("{\"execute\": \"query-migrate\"}");
    assert_eq!(ret["return"]["status"], "completed");
}
