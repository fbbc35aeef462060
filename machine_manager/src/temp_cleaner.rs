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

use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::sync::{Arc, Mutex};

use log::{error, info};
use once_cell::sync::Lazy;

static GLOBAL_TEMP_CLEANER: Lazy<Mutex<TempCleaner>> = Lazy::new(|| {
    Mutex::new(TempCleaner {
        paths: Vec::new(),
        notifiers: HashMap::new(),
    })
});

pub type ExitNotifier = dyn Fn() + Send + Sync;

/// This structure used to keep temporary file which was created by program, and would be deleted
/// when Vm exit.
pub struct TempCleaner {
    /// Path of files that should be removed after exiting the vm.
    paths: Vec<String>,
    /// Notifiers are used to release residual resources after exiting the vm.
    notifiers: HashMap<String, Arc<ExitNotifier>>,
}

impl TempCleaner {
    /// Add to be removed file path
    pub fn add_path(path: String) {
        GLOBAL_TEMP_CLEANER.lock().unwrap().paths.push(path);
    }

    /// Add exit notifier.
    pub fn add_exit_notifier(id: String, exit: Arc<ExitNotifier>) {
        GLOBAL_TEMP_CLEANER
            .lock()
            .unwrap()
            .notifiers
            .insert(id, exit);
    }

    /// Remove exit notifier by id.
    pub fn remove_exit_notifier(id: &str) {
        GLOBAL_TEMP_CLEANER.lock().unwrap().notifiers.remove(id);
    }

    fn clean_files(&mut self) {
        while let Some(path) = self.paths.pop() {
            if Path::new(&path).exists() {
                if let Err(ref e) = fs::remove_file(&path) {
                    error!("Failed to delete socket file:{} :{}", &path, e);
                } else {
                    info!("Delete file: {} successfully.", &path);
                }
            } else {
                info!("file: {} has been removed", &path);
            }
        }
    }

    fn exit_notifier(&mut self) -> Vec<Arc<ExitNotifier>> {
        self.notifiers.drain().map(|(_, exit)| exit).collect()
    }

    /// Clean the resources
    pub fn clean() {
        let notifiers = {
            let mut tmp = GLOBAL_TEMP_CLEANER.lock().unwrap();
            tmp.clean_files();
            tmp.exit_notifier()
        };
        // Notifiers may register or remove others, call them unlocked.
        for exit in notifiers {
            exit();
        }
    }
}
