//! Helpers for spawning and tearing down long-running child processes.
//!
//! Download engines are external programs whose stdout is consumed record by
//! record. Every child created here has stdin closed, stdout and stderr piped,
//! and is killed when its handle is dropped, so a panicking or aborted owner
//! can never leave an orphaned engine behind.

use std::ffi::OsStr;
use std::io;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use tokio::process::{Child, Command};

#[cfg(windows)]
const CREATE_NO_WINDOW: u32 = 0x0800_0000;

/// Apply the Windows `CREATE_NO_WINDOW` flag to child processes.
///
/// On non-Windows targets this is a no-op.
pub trait NoWindowExt {
    fn no_window(&mut self) -> &mut Self;
}

impl NoWindowExt for std::process::Command {
    fn no_window(&mut self) -> &mut Self {
        #[cfg(windows)]
        {
            use std::os::windows::process::CommandExt;
            self.creation_flags(CREATE_NO_WINDOW);
        }
        self
    }
}

impl NoWindowExt for Command {
    fn no_window(&mut self) -> &mut Self {
        #[cfg(windows)]
        {
            use std::os::windows::process::CommandExt;
            self.as_std_mut().creation_flags(CREATE_NO_WINDOW);
        }
        self
    }
}

/// Create a blocking command for short checks such as `--version`.
pub fn quick_command(program: impl AsRef<OsStr>) -> std::process::Command {
    let mut cmd = std::process::Command::new(program);
    cmd.no_window().stdin(Stdio::null());
    cmd
}

/// Create a command for a supervised child whose output is streamed.
pub fn piped_command(program: impl AsRef<OsStr>) -> Command {
    let mut cmd = Command::new(program);
    cmd.no_window()
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    cmd
}

/// Kill a child process and reap it.
///
/// Returns the exit status once the child has been reaped, or `None` when it
/// did not go away within `grace`. A child that already exited is only
/// reaped.
pub async fn terminate(child: &mut Child, grace: Duration) -> io::Result<Option<ExitStatus>> {
    if let Some(status) = child.try_wait()? {
        return Ok(Some(status));
    }

    if let Err(e) = child.start_kill() {
        // The child may have exited between the two calls.
        if let Some(status) = child.try_wait()? {
            return Ok(Some(status));
        }
        return Err(e);
    }

    match tokio::time::timeout(grace, child.wait()).await {
        Ok(status) => status.map(Some),
        Err(_) => Ok(None),
    }
}
