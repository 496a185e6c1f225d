//! Inter-stage OS pipes
//!
//! Stage `i` writes into a pipe whose read end becomes the stdin of stage
//! `i + 1`. The parent keeps its own copy of the write end so the downstream
//! stage sees end-of-input only after that copy is closed explicitly.

use std::io;
use std::os::fd::{IntoRawFd, OwnedFd};

use crate::error::{ProcessError, Result};

/// Read end of an inter-stage pipe, handed to the downstream stage's stdin
#[derive(Debug)]
pub struct PipeReadEnd {
    fd: OwnedFd,
}

impl PipeReadEnd {
    pub(crate) fn into_fd(self) -> OwnedFd {
        self.fd
    }
}

/// Write end of an inter-stage pipe, held by the parent until closed
#[derive(Debug)]
pub struct PipeWriteEnd {
    fd: Option<OwnedFd>,
}

impl PipeWriteEnd {
    /// Duplicate the write end for the upstream child's stdout
    pub(crate) fn duplicate(&self) -> io::Result<OwnedFd> {
        match &self.fd {
            Some(fd) => fd.try_clone(),
            None => Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "pipe write end already closed",
            )),
        }
    }

    /// Whether the parent copy is still open
    pub fn is_open(&self) -> bool {
        self.fd.is_some()
    }

    /// Close the parent copy. Closing an already closed end is a no-op.
    pub fn close(&mut self) -> io::Result<()> {
        match self.fd.take() {
            Some(fd) => nix::unistd::close(fd.into_raw_fd()).map_err(io::Error::from),
            None => Ok(()),
        }
    }
}

/// Create a close-on-exec pipe connecting two stages
pub fn stage_pipe() -> Result<(PipeReadEnd, PipeWriteEnd)> {
    let (read, write) = open_pipe().map_err(ProcessError::Pipe)?;
    Ok((PipeReadEnd { fd: read }, PipeWriteEnd { fd: Some(write) }))
}

// Both ends must be close-on-exec: a copy leaking into a sibling child keeps
// the pipe open and the downstream stage never sees end-of-input.
#[cfg(any(target_os = "linux", target_os = "android"))]
fn open_pipe() -> io::Result<(OwnedFd, OwnedFd)> {
    use nix::fcntl::OFlag;

    nix::unistd::pipe2(OFlag::O_CLOEXEC).map_err(io::Error::from)
}

#[cfg(not(any(target_os = "linux", target_os = "android")))]
fn open_pipe() -> io::Result<(OwnedFd, OwnedFd)> {
    use nix::fcntl::{fcntl, FcntlArg, FdFlag};
    use std::os::fd::AsRawFd;

    let (read, write) = nix::unistd::pipe().map_err(io::Error::from)?;
    for fd in [&read, &write] {
        fcntl(fd.as_raw_fd(), FcntlArg::F_SETFD(FdFlag::FD_CLOEXEC)).map_err(io::Error::from)?;
    }
    Ok((read, write))
}
