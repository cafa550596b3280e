use portable_pty::{native_pty_system, CommandBuilder, MasterPty, PtySize};
use std::fs::File;
use std::io::{self, Read, Write};
use std::os::fd::{AsRawFd, BorrowedFd, RawFd};
use thiserror::Error;

use crate::config::ShellConfig;
use crate::packet::WindowSize;

#[derive(Error, Debug)]
pub enum PtyError {
    #[error("failed to open pty: {0}")]
    OpenPty(#[source] anyhow::Error),

    #[error("failed to spawn command: {0}")]
    SpawnCommand(#[source] anyhow::Error),

    #[error("failed to clone reader: {0}")]
    CloneReader(#[source] anyhow::Error),

    #[error("failed to take writer: {0}")]
    TakeWriter(#[source] anyhow::Error),

    #[error("failed to resize pty: {0}")]
    Resize(#[source] anyhow::Error),

    #[error("failed to read pty size: {0}")]
    GetSize(#[source] anyhow::Error),

    #[error("pty master has no file descriptor")]
    NoMasterFd,

    #[error("failed to make pty non-blocking: {0}")]
    NonBlocking(#[source] io::Error),
}

pub type PtyChild = Box<dyn portable_pty::Child + Send + Sync>;

/// The master side of a pseudo-terminal with a shell attached to its slave.
///
/// The slave handle is dropped right after spawning so that the reader sees
/// EOF once the child and its descendants exit.
///
/// The master is non-blocking: a write the terminal cannot take right now
/// fails with `WouldBlock` or comes back short. Readers handed out by
/// [`Pty::take_reader`] still block, waiting in `poll(2)` for output.
pub struct Pty {
    master: Box<dyn MasterPty + Send>,
    child: Option<PtyChild>,
    pid: Option<u32>,
}

impl Pty {
    pub fn build_command(shell: &ShellConfig) -> CommandBuilder {
        let mut cmd = CommandBuilder::new(shell.program());
        cmd.args(&shell.args);
        cmd.env("TERM", &shell.term);
        cmd
    }

    pub fn spawn(shell: &ShellConfig, size: WindowSize) -> Result<Self, PtyError> {
        Self::spawn_with_cmd(Self::build_command(shell), size)
    }

    pub fn spawn_with_cmd(cmd: CommandBuilder, size: WindowSize) -> Result<Self, PtyError> {
        let pty_system = native_pty_system();
        let pair = pty_system
            .openpty(to_pty_size(size))
            .map_err(PtyError::OpenPty)?;

        let fd = MasterPty::as_raw_fd(&*pair.master).ok_or(PtyError::NoMasterFd)?;
        set_nonblocking(fd).map_err(PtyError::NonBlocking)?;

        let child = pair.slave.spawn_command(cmd).map_err(PtyError::SpawnCommand)?;
        let pid = child.process_id();
        drop(pair.slave);

        Ok(Self {
            master: pair.master,
            child: Some(child),
            pid,
        })
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Take ownership of the child handle (for the exit watcher).
    pub fn take_child(&mut self) -> Option<PtyChild> {
        self.child.take()
    }

    /// A blocking reader over a duplicate of the master descriptor.
    pub fn take_reader(&self) -> Result<Box<dyn Read + Send>, PtyError> {
        let fd = MasterPty::as_raw_fd(&*self.master).ok_or(PtyError::NoMasterFd)?;
        // SAFETY: `fd` belongs to `self.master`, which is alive for the call.
        let owned = unsafe { BorrowedFd::borrow_raw(fd) }
            .try_clone_to_owned()
            .map_err(|e| PtyError::CloneReader(e.into()))?;
        Ok(Box::new(PtyReader {
            file: File::from(owned),
        }))
    }

    pub fn take_writer(&self) -> Result<Box<dyn Write + Send>, PtyError> {
        self.master.take_writer().map_err(PtyError::TakeWriter)
    }

    pub fn resize(&self, size: WindowSize) -> Result<(), PtyError> {
        self.master
            .resize(to_pty_size(size))
            .map_err(PtyError::Resize)
    }

    pub fn size(&self) -> Result<WindowSize, PtyError> {
        let size = self.master.get_size().map_err(PtyError::GetSize)?;
        Ok(WindowSize {
            rows: size.rows,
            cols: size.cols,
            x_pixels: size.pixel_width,
            y_pixels: size.pixel_height,
        })
    }
}

/// Reads from the non-blocking master, parking in `poll(2)` until there is
/// output. Ends with EIO once the slave side is gone.
struct PtyReader {
    file: File,
}

impl Read for PtyReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        loop {
            match self.file.read(buf) {
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => wait_readable(&self.file)?,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                result => return result,
            }
        }
    }
}

fn wait_readable(file: &File) -> io::Result<()> {
    let mut pollfd = libc::pollfd {
        fd: file.as_raw_fd(),
        events: libc::POLLIN,
        revents: 0,
    };
    loop {
        // POLLHUP and POLLERR also wake us; the next read reports them.
        if unsafe { libc::poll(&mut pollfd, 1, -1) } >= 0 {
            return Ok(());
        }
        let e = io::Error::last_os_error();
        if e.kind() != io::ErrorKind::Interrupted {
            return Err(e);
        }
    }
}

fn set_nonblocking(fd: RawFd) -> io::Result<()> {
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };
    if flags < 0 {
        return Err(io::Error::last_os_error());
    }
    if unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) } < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

fn to_pty_size(size: WindowSize) -> PtySize {
    PtySize {
        rows: size.rows,
        cols: size.cols,
        pixel_width: size.x_pixels,
        pixel_height: size.y_pixels,
    }
}
