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

use std::fs;
use std::path::Path;

use rand::distributions::Alphanumeric;
use rand::{thread_rng, Rng};

fn rand_suffix(size: usize) -> String {
    thread_rng()
        .sample_iter(&Alphanumeric)
        .take(size)
        .map(char::from)
        .collect()
}

/// Create a fresh directory holding the sockets and state files of one test.
pub fn get_tmp_dir() -> String {
    loop {
        let dir_name = format!("/tmp/stratovirt-mgmt-{}", rand_suffix(10));
        if !Path::new(&dir_name).exists() {
            fs::create_dir(&dir_name).unwrap();
            return dir_name;
        }
    }
}
