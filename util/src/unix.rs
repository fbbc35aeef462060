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

use std::ffi::CString;

use anyhow::Result;

use crate::UtilError;

/// This function used to remove group and others permission using libc::chmod.
pub fn limit_permission(path: &str) -> Result<()> {
    let cstr_file_path = CString::new(path.as_bytes().to_vec())?;
    // SAFETY: the path is a valid nul terminated string.
    let ret = unsafe { libc::chmod(cstr_file_path.as_ptr(), 0o600) };

    if ret == 0 {
        Ok(())
    } else {
        Err(UtilError::ChmodFailed(ret).into())
    }
}

/// Path type of an uri.
#[derive(PartialEq, Eq, Debug, Clone, Copy)]
pub enum UnixPath {
    File = 0,
    Unix = 1,
    Tcp = 2,
    Unknown = 3,
}

impl From<&str> for UnixPath {
    fn from(s: &str) -> Self {
        match s {
            "file" | "File" | "FILE" => UnixPath::File,
            "unix" | "Unix" | "UNIX" => UnixPath::Unix,
            "tcp" | "Tcp" | "TCP" => UnixPath::Tcp,
            _ => UnixPath::Unknown,
        }
    }
}

/// Parse unix uri to unix path.
///
/// # Notions
///
/// Unix uri is the string as `file:/xxx/xxx` or `unix:/xxx/xxx`.
pub fn parse_uri(uri: &str) -> Result<(UnixPath, String)> {
    let parse_vec: Vec<&str> = uri.split(':').collect();
    if parse_vec.len() != 2 || parse_vec[1].is_empty() {
        return Err(UtilError::InvalidUri(uri.to_string()).into());
    }
    match UnixPath::from(parse_vec[0]) {
        UnixPath::File => Ok((UnixPath::File, String::from(parse_vec[1]))),
        UnixPath::Unix => Ok((UnixPath::Unix, String::from(parse_vec[1]))),
        _ => Err(UtilError::UnsupportedUri(parse_vec[0].to_string()).into()),
    }
}
