//! Process launcher seam.
//!
//! The engine never touches a real terminal directly. A [`PtyLauncher`] hands it an
//! output source and a control handle, which lets the buffering and fan-out logic run
//! against the in-memory fake in tests.

use anyhow::Context;
use portable_pty::{Child, CommandBuilder, MasterPty, PtySize, native_pty_system};
use std::io::{self, Read, Write};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tracing::{debug, error, info};

use crate::error::PtyError;

/// What to launch inside a fresh pseudo-terminal
#[derive(Clone, Debug)]
pub struct LaunchSpec {
    /// Argument vector; the first element is the program
    pub command: Vec<String>,
    pub working_dir: String,
    pub env: Vec<(String, String)>,
    pub rows: u16,
    pub cols: u16,
}

/// Result of a single bounded wait on the terminal output
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReadOutcome {
    Data(usize),
    Eof,
    TimedOut,
}

/// Read side of a launched terminal.
pub trait PtyOutput: Send {
    /// Wait at most `timeout` for output and read whatever is available into `buf`.
    fn read_timeout(&mut self, buf: &mut [u8], timeout: Duration) -> io::Result<ReadOutcome>;
}

/// Input, window-size, wait and signal capabilities of a launched terminal.
pub trait PtyControl: Send {
    fn write(&mut self, data: &[u8]) -> io::Result<()>;
    fn resize(&self, rows: u16, cols: u16) -> Result<(), PtyError>;
    /// Ask the child to exit (SIGTERM on unix)
    fn terminate(&mut self) -> Result<(), PtyError>;
    fn pid(&self) -> Option<u32>;
}

pub struct LaunchedPty {
    pub output: Box<dyn PtyOutput>,
    pub control: Box<dyn PtyControl>,
}

pub trait PtyLauncher: Send + Sync {
    fn launch(&self, spec: &LaunchSpec) -> Result<LaunchedPty, PtyError>;
}

/// Launches real processes on the host's native PTY implementation.
#[derive(Clone, Copy, Debug, Default)]
pub struct NativeLauncher;

type SharedMaster = Arc<Mutex<Box<dyn MasterPty + Send>>>;

impl PtyLauncher for NativeLauncher {
    fn launch(&self, spec: &LaunchSpec) -> Result<LaunchedPty, PtyError> {
        let (program, args) = spec
            .command
            .split_first()
            .ok_or_else(|| PtyError::Launch("empty command".into()))?;

        let pty_system = native_pty_system();
        let pair = pty_system
            .openpty(PtySize {
                rows: spec.rows,
                cols: spec.cols,
                pixel_width: 0,
                pixel_height: 0,
            })
            .context("Failed to open PTY")?;

        let mut cmd = CommandBuilder::new(program);
        cmd.args(args);
        cmd.cwd(&spec.working_dir);
        cmd.env("TERM", "xterm-256color");
        cmd.env("COLORTERM", "truecolor");
        for (key, value) in &spec.env {
            cmd.env(key, value);
        }

        info!(
            "Spawning PTY command: {} with args: {:?} in {}",
            program, args, spec.working_dir
        );

        let child = pair.slave.spawn_command(cmd).map_err(|e| {
            error!("Failed to spawn command '{}': {}", program, e);
            PtyError::Launch(e.to_string())
        })?;
        // The parent keeps only the primary side
        drop(pair.slave);

        let pid = child.process_id();
        info!("PTY process started with PID: {:?}", pid);

        let reader = pair
            .master
            .try_clone_reader()
            .context("Failed to clone PTY reader")?;
        let writer = pair
            .master
            .take_writer()
            .context("Failed to take PTY writer")?;

        #[cfg(unix)]
        let fd = pair.master.as_raw_fd();
        #[cfg(not(unix))]
        let fd: Option<i32> = None;

        let master: SharedMaster = Arc::new(Mutex::new(pair.master));

        Ok(LaunchedPty {
            output: Box::new(NativeOutput {
                reader,
                fd,
                _master: master.clone(),
            }),
            control: Box::new(NativeControl {
                master,
                writer,
                child: Some(child),
                pid,
            }),
        })
    }
}

struct NativeOutput {
    reader: Box<dyn Read + Send>,
    fd: Option<i32>,
    // Keeps the primary descriptor open for as long as the reader polls it
    _master: SharedMaster,
}

impl PtyOutput for NativeOutput {
    fn read_timeout(&mut self, buf: &mut [u8], timeout: Duration) -> io::Result<ReadOutcome> {
        if let Some(fd) = self.fd {
            if !wait_readable(fd, timeout)? {
                return Ok(ReadOutcome::TimedOut);
            }
        }
        match self.reader.read(buf) {
            Ok(0) => Ok(ReadOutcome::Eof),
            Ok(n) => Ok(ReadOutcome::Data(n)),
            Err(e)
                if matches!(
                    e.kind(),
                    io::ErrorKind::Interrupted | io::ErrorKind::WouldBlock
                ) =>
            {
                Ok(ReadOutcome::TimedOut)
            }
            Err(e) => Err(e),
        }
    }
}

#[cfg(unix)]
fn wait_readable(fd: i32, timeout: Duration) -> io::Result<bool> {
    let mut pfd = nix::libc::pollfd {
        fd,
        events: nix::libc::POLLIN,
        revents: 0,
    };
    let millis = timeout.as_millis().min(i32::MAX as u128) as nix::libc::c_int;
    let ret = unsafe { nix::libc::poll(&mut pfd, 1, millis) };
    if ret < 0 {
        let err = io::Error::last_os_error();
        if err.kind() == io::ErrorKind::Interrupted {
            return Ok(false);
        }
        return Err(err);
    }
    Ok(ret > 0)
}

#[cfg(not(unix))]
fn wait_readable(_fd: i32, _timeout: Duration) -> io::Result<bool> {
    Ok(true)
}

struct NativeControl {
    master: SharedMaster,
    writer: Box<dyn Write + Send>,
    child: Option<Box<dyn Child + Send + Sync>>,
    pid: Option<u32>,
}

impl PtyControl for NativeControl {
    fn write(&mut self, data: &[u8]) -> io::Result<()> {
        self.writer.write_all(data)?;
        self.writer.flush()
    }

    fn resize(&self, rows: u16, cols: u16) -> Result<(), PtyError> {
        self.master
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .resize(PtySize {
                rows,
                cols,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(|e| PtyError::Resize(e.to_string()))
    }

    fn terminate(&mut self) -> Result<(), PtyError> {
        #[cfg(unix)]
        {
            use nix::errno::Errno;
            use nix::sys::signal::{Signal, kill};
            use nix::unistd::Pid;

            if let Some(pid) = self.pid {
                match kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
                    Ok(()) | Err(Errno::ESRCH) => {}
                    Err(e) => return Err(PtyError::Signal(e.to_string())),
                }
            }
        }
        #[cfg(not(unix))]
        {
            if let Some(child) = self.child.as_mut() {
                child
                    .kill()
                    .map_err(|e| PtyError::Signal(e.to_string()))?;
            }
        }
        Ok(())
    }

    fn pid(&self) -> Option<u32> {
        self.pid
    }
}

impl Drop for NativeControl {
    fn drop(&mut self) {
        // Reap the child off-thread so a slow exit never blocks the caller
        if let Some(mut child) = self.child.take() {
            let pid = self.pid;
            std::thread::spawn(move || {
                let status = child.wait();
                debug!("PTY child {:?} reaped: {:?}", pid, status);
            });
        }
    }
}
