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

use std::io::{Error, ErrorKind, Read, Write};
use std::os::unix::io::RawFd;

use anyhow::{bail, Result};
use log::warn;

use crate::error::MachineManagerError;

/// Upper bound of a pending, not yet complete frame.
pub const MAX_SOCKET_MSG_LENGTH: usize = 8192;
const RECV_CHUNK_SIZE: usize = 4096;
const MAX_SCM_FDS: usize = 16;

/// Allocate a buffer able to hold control messages for `nr_fds` descriptors,
/// aligned for `cmsghdr`.
fn cmsg_buffer(nr_fds: usize) -> (Vec<u64>, usize) {
    // SAFETY: CMSG_SPACE only computes a length.
    let space =
        unsafe { libc::CMSG_SPACE((nr_fds * std::mem::size_of::<RawFd>()) as libc::c_uint) }
            as usize;
    let words = (space + std::mem::size_of::<u64>() - 1) / std::mem::size_of::<u64>();
    (vec![0_u64; words], space)
}

/// Wrapper over socket file description, which read and write message with
/// file descriptors passed through SCM_RIGHTS.
///
/// # Examples
///
/// ```no_run
/// use std::os::unix::net::UnixStream;
/// use std::os::unix::io::AsRawFd;
/// use std::io::prelude::*;
///
/// use machine_manager::socket::SocketRWHandler;
///
/// fn main() -> std::io::Result<()> {
///     let mut stream = UnixStream::connect("/path/to/my/socket")?;
///     let mut handler = SocketRWHandler::new(stream.as_raw_fd());
///     stream.write_all(b"hello world")?;
///     let mut buffer = [0_u8; 20];
///     let count = handler.read(&mut buffer)?;
///     println!("{}", String::from_utf8_lossy(&buffer[..count]));
///     Ok(())
/// }
/// ```
pub struct SocketRWHandler {
    /// Socket fd to read and write message
    socket_fd: RawFd,
    /// Fds when read from fd's scm right
    scm_fd: Vec<RawFd>,
}

impl SocketRWHandler {
    /// Allocates a new `SocketRWHandler` with a socket fd
    ///
    /// # Arguments
    ///
    /// * `r` - The file descriptor for socket.
    pub fn new(r: RawFd) -> Self {
        SocketRWHandler {
            socket_fd: r,
            scm_fd: Vec::new(),
        }
    }

    /// Take the descriptors received so far.
    pub fn take_fds(&mut self) -> Vec<RawFd> {
        std::mem::take(&mut self.scm_fd)
    }

    /// Receive bytes message with socket file descriptor, blocking until some
    /// data or end of stream arrives.
    ///
    /// # Notes
    /// Use [recvmsg(2)](https://linux.die.net/man/2/recvmsg) to receive
    /// messages from `socket_fd`. Descriptors carried in control messages are
    /// appended to `scm_fd`, with close-on-exec set.
    fn read_fd(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        use libc::{
            c_void, iovec, msghdr, recvmsg, CMSG_DATA, CMSG_FIRSTHDR, CMSG_LEN, CMSG_NXTHDR,
            MSG_CMSG_CLOEXEC, MSG_CTRUNC, SCM_RIGHTS, SOL_SOCKET,
        };

        let mut iov = iovec {
            iov_base: buf.as_mut_ptr() as *mut c_void,
            iov_len: buf.len(),
        };
        let (mut cmsg_space, cmsg_len) = cmsg_buffer(MAX_SCM_FDS);

        // In `musl` toolchain, msghdr has private member `__pad0` and `__pad1`, it can't be
        // initialized in normal way.
        // SAFETY: all-zero is a valid msghdr.
        let mut mhdr: msghdr = unsafe { std::mem::zeroed() };
        mhdr.msg_name = std::ptr::null_mut();
        mhdr.msg_namelen = 0;
        mhdr.msg_iov = &mut iov as *mut iovec;
        mhdr.msg_iovlen = 1;
        mhdr.msg_control = cmsg_space.as_mut_ptr() as *mut c_void;
        mhdr.msg_controllen = cmsg_len as _;
        mhdr.msg_flags = 0;

        let ret = loop {
            // SAFETY: iov and control buffer outlive the call.
            let ret = unsafe { recvmsg(self.socket_fd, &mut mhdr, MSG_CMSG_CLOEXEC) };
            if ret == -1 {
                let sock_err = Error::last_os_error();
                if sock_err.kind() == ErrorKind::Interrupted {
                    continue;
                }
                return Err(sock_err);
            }
            break ret as usize;
        };

        if mhdr.msg_flags & MSG_CTRUNC != 0 {
            warn!("Control message truncated, some descriptors are lost");
        }

        // SAFETY: the kernel filled `msg_controllen` bytes of the control
        // buffer, the CMSG_* helpers never walk beyond it.
        unsafe {
            let mut cmsg = CMSG_FIRSTHDR(&mhdr as *const msghdr);
            while !cmsg.is_null() {
                let scm = &*cmsg;
                if scm.cmsg_level == SOL_SOCKET && scm.cmsg_type == SCM_RIGHTS {
                    let data_len = scm.cmsg_len as usize - CMSG_LEN(0) as usize;
                    let data = CMSG_DATA(cmsg) as *const RawFd;
                    for i in 0..data_len / std::mem::size_of::<RawFd>() {
                        self.scm_fd.push(std::ptr::read_unaligned(data.add(i)));
                    }
                }
                cmsg = CMSG_NXTHDR(&mhdr as *const msghdr, cmsg);
            }
        }

        Ok(ret)
    }

    /// Send bytes message with socket file descriptor.
    ///
    /// # Notes
    /// Use [sendmsg(2)](https://linux.die.net/man/2/sendmsg) to send messages
    /// to `socket_fd`. `fds` travel as one SCM_RIGHTS control message.
    ///
    /// # Errors
    /// The socket file descriptor is broken.
    pub fn write_fd(&mut self, data: &[u8], fds: &[RawFd]) -> std::io::Result<usize> {
        use libc::{
            c_uint, c_void, iovec, msghdr, sendmsg, CMSG_DATA, CMSG_FIRSTHDR, CMSG_LEN,
            MSG_NOSIGNAL, SCM_RIGHTS, SOL_SOCKET,
        };

        let mut iov = iovec {
            iov_base: data.as_ptr() as *mut c_void,
            iov_len: data.len(),
        };

        // SAFETY: all-zero is a valid msghdr.
        let mut mhdr: msghdr = unsafe { std::mem::zeroed() };
        mhdr.msg_name = std::ptr::null_mut();
        mhdr.msg_namelen = 0;
        mhdr.msg_iov = &mut iov as *mut iovec;
        mhdr.msg_iovlen = 1;
        mhdr.msg_flags = 0;

        let (mut cmsg_space, cmsg_len) = cmsg_buffer(fds.len());
        if fds.is_empty() {
            mhdr.msg_control = std::ptr::null_mut();
            mhdr.msg_controllen = 0;
        } else {
            let fds_len = std::mem::size_of_val(fds);
            mhdr.msg_control = cmsg_space.as_mut_ptr() as *mut c_void;
            mhdr.msg_controllen = cmsg_len as _;
            // SAFETY: the control buffer is large enough for one header
            // carrying `fds`.
            unsafe {
                let cmsg = CMSG_FIRSTHDR(&mhdr as *const msghdr);
                (*cmsg).cmsg_level = SOL_SOCKET;
                (*cmsg).cmsg_type = SCM_RIGHTS;
                (*cmsg).cmsg_len = CMSG_LEN(fds_len as c_uint) as _;
                std::ptr::copy_nonoverlapping(
                    fds.as_ptr() as *const u8,
                    CMSG_DATA(cmsg),
                    fds_len,
                );
            }
        }

        // SAFETY: iov and control buffer outlive the call.
        let ret = unsafe { sendmsg(self.socket_fd, &mhdr, MSG_NOSIGNAL) };
        if ret == -1 {
            let sock_err = Error::last_os_error();
            if sock_err.kind() == ErrorKind::Interrupted {
                return Err(sock_err);
            }
            return Err(Error::new(
                ErrorKind::BrokenPipe,
                format!("The socket pipe is broken: {}", sock_err),
            ));
        }
        Ok(ret as usize)
    }
}

impl Read for SocketRWHandler {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        self.read_fd(buf)
    }
}

impl Write for SocketRWHandler {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.write_fd(buf, &[])
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

/// One complete JSON object read from the stream, together with the
/// descriptors sent along with it.
#[derive(Debug, Default)]
pub struct Frame {
    pub text: String,
    pub fds: Vec<RawFd>,
}

/// Position just past the end of the first frame in `buf`, which starts with
/// no leading whitespace.
///
/// A frame is a brace balanced object, braces inside strings do not count.
/// Input not starting with `{` is cut at the next newline so the caller can
/// reject it.
fn frame_end(buf: &[u8]) -> Option<usize> {
    if buf.first() != Some(&b'{') {
        return buf.iter().position(|b| *b == b'\n').map(|p| p + 1);
    }

    let mut depth = 0_usize;
    let mut in_string = false;
    let mut escaped = false;
    for (pos, byte) in buf.iter().enumerate() {
        if in_string {
            match byte {
                _ if escaped => escaped = false,
                b'\\' => escaped = true,
                b'"' => in_string = false,
                _ => {}
            }
            continue;
        }
        match byte {
            b'"' => in_string = true,
            b'{' => depth += 1,
            b'}' => {
                depth -= 1;
                if depth == 0 {
                    return Some(pos + 1);
                }
            }
            _ => {}
        }
    }
    None
}

/// The handler to handle socket stream and cut socket stream bytes into
/// json-string frames.
///
/// # Examples
///
/// ```no_run
/// use std::os::unix::net::UnixStream;
/// use std::os::unix::io::AsRawFd;
/// use std::io::prelude::*;
///
/// use machine_manager::socket::SocketHandler;
///
/// fn main() -> std::io::Result<()> {
///     let mut stream = UnixStream::connect("/path/to/my/socket")?;
///     let mut handler = SocketHandler::new(stream.as_raw_fd());
///     handler.send_str(&String::from("hello world"))?;
///     let mut response = String::new();
///     stream.read_to_string(&mut response)?;
///     println!("{}", response);
///     Ok(())
/// }
/// ```
pub struct SocketHandler {
    /// Handler `Read` and `Write` for socket stream
    stream: SocketRWHandler,
    /// Bytes received but not yet cut into a frame
    buffer: Vec<u8>,
    /// Descriptors received but not yet handed out, keyed by the buffer
    /// offset of the last non-blank byte of the read that carried them.
    pending_fds: Vec<(usize, Vec<RawFd>)>,
}

impl SocketHandler {
    /// Allocates a new `SocketHandler` with `socket_fd`
    ///
    /// # Arguments
    ///
    /// * `r` - The file descriptor for socket.
    pub fn new(r: RawFd) -> Self {
        SocketHandler {
            stream: SocketRWHandler::new(r),
            buffer: Vec::new(),
            pending_fds: Vec::new(),
        }
    }

    /// Read the next frame, `Ok(None)` when the peer closed the stream.
    ///
    /// # Errors
    ///
    /// The pending frame grows over `MAX_SOCKET_MSG_LENGTH`, is not UTF-8, or
    /// the socket is broken. The stream can not be resynchronized after any
    /// of them.
    pub fn next_frame(&mut self) -> Result<Option<Frame>> {
        let mut chunk = [0_u8; RECV_CHUNK_SIZE];
        loop {
            let blank = self
                .buffer
                .iter()
                .take_while(|b| b.is_ascii_whitespace())
                .count();
            self.buffer.drain(..blank);
            for (anchor, _) in self.pending_fds.iter_mut() {
                *anchor = anchor.saturating_sub(blank);
            }

            if let Some(end) = frame_end(&self.buffer) {
                if end > MAX_SOCKET_MSG_LENGTH {
                    bail!(MachineManagerError::MsgTooLong(MAX_SOCKET_MSG_LENGTH));
                }
                let (bytes, fds) = self.cut(end);
                let text =
                    String::from_utf8(bytes).map_err(|_| MachineManagerError::InvalidUtf8)?;
                return Ok(Some(Frame { text, fds }));
            }
            if self.buffer.len() > MAX_SOCKET_MSG_LENGTH {
                bail!(MachineManagerError::MsgTooLong(MAX_SOCKET_MSG_LENGTH));
            }

            let start = self.buffer.len();
            let count = self.stream.read(&mut chunk)?;
            // A read ends right after the message carrying descriptors, so
            // they belong to the frame holding the last byte read.
            let fds = self.stream.take_fds();
            if !fds.is_empty() {
                let anchor = chunk[..count]
                    .iter()
                    .rposition(|b| !b.is_ascii_whitespace())
                    .map_or(start, |pos| start + pos);
                self.pending_fds.push((anchor, fds));
            }
            if count == 0 {
                if !self.buffer.is_empty() {
                    warn!(
                        "Stream closed with {} bytes of incomplete frame",
                        self.buffer.len()
                    );
                }
                return Ok(None);
            }
            self.buffer.extend_from_slice(&chunk[..count]);
        }
    }

    /// Cut the first `len` bytes off the buffer together with the
    /// descriptors that arrived with them.
    fn cut(&mut self, len: usize) -> (Vec<u8>, Vec<RawFd>) {
        let bytes = self.buffer.drain(..len).collect();
        let mut fds = Vec::new();
        self.pending_fds.retain_mut(|(anchor, chunk_fds)| {
            if *anchor < len {
                fds.append(chunk_fds);
                false
            } else {
                *anchor -= len;
                true
            }
        });
        (bytes, fds)
    }

    /// Take descriptors received but not attached to a frame.
    pub fn take_fds(&mut self) -> Vec<RawFd> {
        let mut fds: Vec<RawFd> = self
            .pending_fds
            .drain(..)
            .flat_map(|(_, chunk_fds)| chunk_fds)
            .collect();
        fds.append(&mut self.stream.take_fds());
        fds
    }

    /// Send String to `socket_fd`, terminated by "\r\n".
    ///
    /// # Arguments
    ///
    /// * `s` - The `String` send to `socket_fd`.
    ///
    /// # Errors
    /// The socket file descriptor is broken.
    pub fn send_str(&mut self, s: &str) -> std::io::Result<()> {
        self.stream.write_all(s.as_bytes())?;
        self.stream.write_all(b"\r\n")
    }
}
