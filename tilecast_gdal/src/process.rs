//! Child-process management for the worker pool.

use anyhow::{Result, bail};
use std::io;

/// How a joined child ended. Signal deaths are reported distinctly so that
/// callers can tell a crash from a clean nonzero exit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitStatus {
	Exited(i32),
	Signaled(i32),
}

impl ExitStatus {
	pub fn success(&self) -> bool {
		matches!(self, ExitStatus::Exited(0))
	}
}

/// Error raised by a non-blocking join when the child is still running.
#[derive(Debug)]
pub enum JoinError {
	Alive,
	Sys(io::Error),
}

impl std::fmt::Display for JoinError {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		match self {
			JoinError::Alive => write!(f, "process is still running"),
			JoinError::Sys(err) => write!(f, "waitpid failed: {err}"),
		}
	}
}

impl std::error::Error for JoinError {}

/// A forked child process.
#[derive(Debug)]
pub struct Process {
	id: libc::pid_t,
}

impl Process {
	/// Forks and runs `body` in the child; the child never returns (it
	/// exits with `_exit` so no parent-side destructors or atexit handlers
	/// run twice).
	pub fn spawn<F: FnOnce()>(body: F) -> Result<Process> {
		// SAFETY: plain fork; the child only touches the shared region and
		// its own copies of the parent's data.
		let pid = unsafe { libc::fork() };
		if pid < 0 {
			bail!("fork failed: {}", io::Error::last_os_error());
		}
		if pid == 0 {
			body();
			unsafe { libc::_exit(0) };
		}
		Ok(Process { id: pid })
	}

	pub fn id(&self) -> i32 {
		self.id
	}

	pub fn joinable(&self) -> bool {
		self.id > 0
	}

	/// Waits for the child. With `just_try` the call does not block and
	/// reports a still-running child as [`JoinError::Alive`].
	pub fn join(&mut self, just_try: bool) -> Result<ExitStatus, JoinError> {
		if !self.joinable() {
			return Err(JoinError::Sys(io::Error::from_raw_os_error(libc::EINVAL)));
		}

		let mut status: libc::c_int = 0;
		let options = if just_try { libc::WNOHANG } else { 0 };
		loop {
			// SAFETY: plain waitpid on our own child.
			let res = unsafe { libc::waitpid(self.id, &mut status, options) };
			if res < 0 {
				let err = io::Error::last_os_error();
				if err.raw_os_error() == Some(libc::EINTR) {
					continue;
				}
				return Err(JoinError::Sys(err));
			}
			if res == 0 {
				return Err(JoinError::Alive);
			}
			break;
		}

		self.id = 0;

		if libc::WIFEXITED(status) {
			Ok(ExitStatus::Exited(libc::WEXITSTATUS(status)))
		} else if libc::WIFSIGNALED(status) {
			Ok(ExitStatus::Signaled(libc::WTERMSIG(status)))
		} else {
			Ok(ExitStatus::Exited(libc::EXIT_FAILURE))
		}
	}

	pub fn kill(&self) -> Result<()> {
		if !self.joinable() {
			bail!("cannot kill a joined process");
		}
		// SAFETY: sending SIGKILL to our own child.
		if unsafe { libc::kill(self.id, libc::SIGKILL) } < 0 {
			bail!("kill failed: {}", io::Error::last_os_error());
		}
		Ok(())
	}
}

impl Drop for Process {
	fn drop(&mut self) {
		if self.joinable() {
			let _ = self.kill();
			let _ = self.join(false);
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use std::time::Duration;

	#[test]
	fn join_reports_exit_code() {
		let mut child = Process::spawn(|| unsafe { libc::_exit(7) }).unwrap();
		let status = child.join(false).unwrap();
		assert_eq!(status, ExitStatus::Exited(7));
		assert!(!status.success());
	}

	#[test]
	fn try_join_reports_alive() {
		let mut child = Process::spawn(|| {
			std::thread::sleep(Duration::from_secs(10));
		})
		.unwrap();
		assert!(matches!(child.join(true), Err(JoinError::Alive)));
		child.kill().unwrap();
		let status = child.join(false).unwrap();
		assert_eq!(status, ExitStatus::Signaled(libc::SIGKILL));
	}

	#[test]
	fn signal_death_is_not_an_exit_code() {
		let mut child = Process::spawn(|| loop {
			std::thread::sleep(Duration::from_millis(50));
		})
		.unwrap();
		child.kill().unwrap();
		match child.join(false).unwrap() {
			ExitStatus::Signaled(signal) => assert_eq!(signal, libc::SIGKILL),
			other => panic!("expected signal death, got {other:?}"),
		}
	}
}
