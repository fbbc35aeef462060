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
use std::io::Write;
use std::os::unix::fs::OpenOptionsExt;
use std::path::Path;
use std::sync::Mutex;
use std::time::UNIX_EPOCH;

use anyhow::{Context, Result};
use log::{Level, LevelFilter, Log, Metadata, Record};
use nix::unistd::{getpid, gettid};

use crate::time::{get_format_time, gettime};

/// Environment variable selecting the log level.
pub const LOG_LEVEL_ENV: &str = "STRATOVIRT_LOG_LEVEL";
// Max size of one log file is 100MB.
const LOG_ROTATE_SIZE_MAX: u64 = 100 * 1024 * 1024;
// Keep seven history files.
const LOG_ROTATE_COUNT_MAX: u32 = 7;

fn format_now() -> String {
    let (sec, nsec) = gettime().unwrap_or((0, 0));
    let t = get_format_time(i64::from(sec));

    format!(
        "{:04}-{:02}-{:02}T{:02}:{:02}:{:02}.{:09}",
        t[0], t[1], t[2], t[3], t[4], t[5], nsec
    )
}

fn open_log_file(path: &str) -> Result<File> {
    std::fs::OpenOptions::new()
        .write(true)
        .append(true)
        .create(true)
        .mode(0o640)
        .open(path)
        .with_context(|| format!("Failed to open log file {}", path))
}

/// Log destination, rotated by size and by day when backed by a file.
struct LogSink {
    writer: Box<dyn Write + Send>,
    path: String,
    written: u64,
    day: i32,
}

impl LogSink {
    fn write_record(&mut self, msg: &[u8]) -> Result<()> {
        self.writer.write_all(msg)?;
        self.written = self.written.saturating_add(msg.len() as u64);
        self.rotate_if_needed()
    }

    fn rotate_if_needed(&mut self) -> Result<()> {
        if self.path.is_empty() {
            return Ok(());
        }

        let today = get_format_time(i64::from(gettime()?.0))[2];
        if self.written < LOG_ROTATE_SIZE_MAX && self.day == today {
            return Ok(());
        }

        // "file" -> "file1" -> ... -> "file6", the oldest one is dropped.
        let oldest = format!("{}{}", self.path, LOG_ROTATE_COUNT_MAX - 1);
        if Path::new(&oldest).exists() {
            std::fs::remove_file(&oldest)
                .with_context(|| format!("Failed to remove log file {}", oldest))?;
        }
        for idx in (0..LOG_ROTATE_COUNT_MAX - 1).rev() {
            let from = if idx == 0 {
                self.path.clone()
            } else {
                format!("{}{}", self.path, idx)
            };
            let to = format!("{}{}", self.path, idx + 1);
            if Path::new(&from).exists() {
                std::fs::rename(&from, &to)
                    .with_context(|| format!("Failed to rename log file {} to {}", from, to))?;
            }
        }

        self.writer = Box::new(open_log_file(&self.path)?);
        self.written = 0;
        self.day = today;
        Ok(())
    }
}

/// Format like "%year-%mon-%dayT%hour:%min:%sec.%nsec: [pid][tid][file: line]:LEVEL: msg".
struct VmLogger {
    sink: Mutex<LogSink>,
    level: Level,
}

impl Log for VmLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= self.level
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }

        let msg = format!(
            "{:<5}: [{}][{}][{}: {}]:{}: {}\n",
            format_now(),
            getpid().as_raw(),
            gettid().as_raw(),
            record.file().unwrap_or(""),
            record.line().unwrap_or(0),
            record.level(),
            record.args()
        );

        let mut sink = match self.sink.lock() {
            Ok(sink) => sink,
            Err(poisoned) => poisoned.into_inner(),
        };
        if let Err(e) = sink.write_record(msg.as_bytes()) {
            eprintln!("Failed to log message {:?}", e);
        }
    }

    fn flush(&self) {
        if let Ok(mut sink) = self.sink.lock() {
            let _ = sink.writer.flush();
        }
    }
}

fn level_from_env() -> Level {
    match std::env::var(LOG_LEVEL_ENV) {
        Ok(l) => match l.to_lowercase().as_str() {
            "error" => Level::Error,
            "warn" => Level::Warn,
            "debug" => Level::Debug,
            "trace" => Level::Trace,
            _ => Level::Info,
        },
        _ => Level::Info,
    }
}

fn build_sink(path: &str) -> Result<LogSink> {
    if path.is_empty() {
        return Ok(LogSink {
            writer: Box::new(std::io::stderr()),
            path: String::new(),
            written: 0,
            day: 0,
        });
    }

    let file = open_log_file(path)?;
    let metadata = file.metadata()?;
    let modified = metadata.modified()?.duration_since(UNIX_EPOCH)?.as_secs();
    Ok(LogSink {
        writer: Box::new(file),
        path: path.to_string(),
        written: metadata.len(),
        day: get_format_time(modified as i64)[2],
    })
}

/// Install the process logger. An empty `path` logs to stderr.
pub fn init_log(path: String) -> Result<()> {
    let sink = build_sink(&path)?;
    let logger = VmLogger {
        sink: Mutex::new(sink),
        level: level_from_env(),
    };
    log::set_boxed_logger(Box::new(logger))
        .map(|()| log::set_max_level(LevelFilter::Trace))
        .with_context(|| format!("Failed to init logger: {}", path))
}
