//! The `CommandRunner` collaborator contract (§6) and its POSIX
//! implementation. Grounded directly in the teacher's `process_posix.rs`:
//! spawn via `posix_spawn` with stdout/stderr duped onto one pipe (so we
//! get one combined output stream per command, which `std::process::Command`
//! can't do without mixing file descriptors by hand), and reap with
//! `waitpid`.

use anyhow::{bail, Result};
use std::collections::HashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Termination {
    Success,
    Failure,
    Interrupted,
}

pub struct CommandResult {
    pub token: usize,
    pub termination: Termination,
    pub output: Vec<u8>,
}

/// The `CommandRunner` contract: start commands up to some external
/// parallelism limit, and reap them as they finish. `token` is caller-
/// supplied and round-trips through `wait` so callers can correlate a
/// result back to the edge that started it.
pub trait CommandRunner {
    fn can_run_more(&self) -> bool;
    fn start_command(&mut self, token: usize, command: &str) -> Result<()>;
    fn wait(&mut self) -> Option<CommandResult>;
    fn active_tokens(&self) -> Vec<usize>;
    fn abort(&mut self);
}

#[cfg(unix)]
mod posix {
    use super::*;
    use std::io::{Read, Write};
    use std::os::fd::FromRawFd;
    use std::os::unix::process::ExitStatusExt;

    fn check(func: &str, ret: libc::c_int) -> Result<()> {
        if ret < 0 {
            let err = unsafe { std::ffi::CStr::from_ptr(libc::strerror(-ret)) };
            bail!("{}: {}", func, err.to_string_lossy());
        }
        Ok(())
    }

    struct FileActions(libc::posix_spawn_file_actions_t);

    impl FileActions {
        fn new() -> Result<Self> {
            unsafe {
                let mut actions: libc::posix_spawn_file_actions_t = std::mem::zeroed();
                check(
                    "posix_spawn_file_actions_init",
                    libc::posix_spawn_file_actions_init(&mut actions),
                )?;
                Ok(Self(actions))
            }
        }
        fn adddup2(&mut self, fd: i32, newfd: i32) -> Result<()> {
            unsafe {
                check(
                    "posix_spawn_file_actions_adddup2",
                    libc::posix_spawn_file_actions_adddup2(&mut self.0, fd, newfd),
                )
            }
        }
        fn addclose(&mut self, fd: i32) -> Result<()> {
            unsafe {
                check(
                    "posix_spawn_file_actions_addclose",
                    libc::posix_spawn_file_actions_addclose(&mut self.0, fd),
                )
            }
        }
    }

    impl Drop for FileActions {
        fn drop(&mut self) {
            unsafe {
                libc::posix_spawn_file_actions_destroy(&mut self.0);
            }
        }
    }

    struct Running {
        pid: libc::pid_t,
        pipe: std::fs::File,
        token: usize,
    }

    /// Runs commands through `posix_spawn("/bin/sh", "-c", cmd)`, collecting
    /// combined stdout+stderr and reaping with a blocking `waitpid` per
    /// `wait()` call. Parallelism across many in-flight commands is achieved
    /// by the caller (the Builder) invoking `start_command` repeatedly up to
    /// its `-j` limit before calling `wait`.
    pub struct ProcessRunner {
        running: Vec<Running>,
        max_parallel: usize,
    }

    impl ProcessRunner {
        pub fn new(max_parallel: usize) -> Self {
            ProcessRunner {
                running: Vec::new(),
                max_parallel: max_parallel.max(1),
            }
        }
    }

    impl CommandRunner for ProcessRunner {
        fn can_run_more(&self) -> bool {
            self.running.len() < self.max_parallel
        }

        fn start_command(&mut self, token: usize, command: &str) -> Result<()> {
            let (pid, pipe) = unsafe {
                let mut pipe_fds: [libc::c_int; 2] = std::mem::zeroed();
                check("pipe", libc::pipe(pipe_fds.as_mut_ptr()))?;

                let mut actions = FileActions::new()?;
                actions.adddup2(pipe_fds[1], 1)?;
                actions.adddup2(pipe_fds[1], 2)?;
                actions.addclose(pipe_fds[0])?;
                actions.addclose(pipe_fds[1])?;

                let mut pid: libc::pid_t = 0;
                let shell = std::ffi::CString::new("/bin/sh").unwrap();
                let flag = std::ffi::CString::new("-c").unwrap();
                let cmdline = std::ffi::CString::new(command).unwrap();
                let argv: [*const libc::c_char; 4] = [
                    shell.as_ptr(),
                    flag.as_ptr(),
                    cmdline.as_ptr(),
                    std::ptr::null(),
                ];
                check(
                    "posix_spawn",
                    libc::posix_spawn(
                        &mut pid,
                        shell.as_ptr(),
                        &actions.0,
                        std::ptr::null(),
                        argv.as_ptr() as *const *mut libc::c_char,
                        std::ptr::null(),
                    ),
                )?;
                check("close", libc::close(pipe_fds[1]))?;
                (pid, std::fs::File::from_raw_fd(pipe_fds[0]))
            };
            self.running.push(Running { pid, pipe, token });
            Ok(())
        }

        fn wait(&mut self) -> Option<CommandResult> {
            if self.running.is_empty() {
                return None;
            }
            // Real Ninja multiplexes all pipes with select/epoll; a single-
            // threaded blocking read-to-end per process is simpler here and
            // matches how the teacher's `run_command` (one shot at a time)
            // handles a single child.
            let mut running = self.running.remove(0);
            let mut output = Vec::new();
            let _ = running.pipe.read_to_end(&mut output);
            let status = unsafe {
                let mut status: i32 = 0;
                if libc::waitpid(running.pid, &mut status, 0) < 0 {
                    return Some(CommandResult {
                        token: running.token,
                        termination: Termination::Failure,
                        output,
                    });
                }
                std::process::ExitStatus::from_raw(status)
            };
            let mut termination = Termination::Success;
            if !status.success() {
                termination = Termination::Failure;
                if let Some(sig) = status.signal() {
                    if sig == libc::SIGINT {
                        termination = Termination::Interrupted;
                        write!(output, "\ninterrupted").ok();
                    } else {
                        write!(output, "\nsignal {sig}").ok();
                    }
                }
            }
            Some(CommandResult {
                token: running.token,
                termination,
                output,
            })
        }

        fn active_tokens(&self) -> Vec<usize> {
            self.running.iter().map(|r| r.token).collect()
        }

        fn abort(&mut self) {
            for r in &self.running {
                unsafe {
                    libc::kill(r.pid, libc::SIGTERM);
                }
            }
        }
    }
}

#[cfg(unix)]
pub use posix::ProcessRunner;

/// A `std::process`-based fallback for non-Unix targets. Simpler than the
/// POSIX implementation (polls with `try_wait` instead of blocking on a
/// pipe) since it isn't this port's primary target, but satisfies the same
/// `CommandRunner` contract.
#[cfg(not(unix))]
mod portable {
    use super::*;
    use std::io::Read;
    use std::process::{Child, Command, Stdio};
    use std::time::Duration;

    pub struct ProcessRunner {
        max_parallel: usize,
        running: HashMap<usize, Child>,
    }

    impl ProcessRunner {
        pub fn new(max_parallel: usize) -> Self {
            ProcessRunner {
                max_parallel: max_parallel.max(1),
                running: HashMap::new(),
            }
        }
    }

    impl CommandRunner for ProcessRunner {
        fn can_run_more(&self) -> bool {
            self.running.len() < self.max_parallel
        }

        fn start_command(&mut self, token: usize, command: &str) -> Result<()> {
            let child = Command::new("cmd")
                .args(["/C", command])
                .stdout(Stdio::piped())
                .stderr(Stdio::piped())
                .spawn()?;
            self.running.insert(token, child);
            Ok(())
        }

        fn wait(&mut self) -> Option<CommandResult> {
            loop {
                if self.running.is_empty() {
                    return None;
                }
                let done = self
                    .running
                    .iter_mut()
                    .find(|(_, child)| matches!(child.try_wait(), Ok(Some(_))))
                    .map(|(&token, _)| token);
                let Some(token) = done else {
                    std::thread::sleep(Duration::from_millis(5));
                    continue;
                };
                let mut child = self.running.remove(&token).unwrap();
                let status = child.wait();
                let mut output = Vec::new();
                if let Some(mut out) = child.stdout.take() {
                    let _ = out.read_to_end(&mut output);
                }
                if let Some(mut err) = child.stderr.take() {
                    let _ = err.read_to_end(&mut output);
                }
                let termination = match status {
                    Ok(s) if s.success() => Termination::Success,
                    _ => Termination::Failure,
                };
                return Some(CommandResult {
                    token,
                    termination,
                    output,
                });
            }
        }

        fn active_tokens(&self) -> Vec<usize> {
            self.running.keys().copied().collect()
        }

        fn abort(&mut self) {
            for (_, mut child) in self.running.drain() {
                let _ = child.kill();
            }
        }
    }
}

#[cfg(not(unix))]
pub use portable::ProcessRunner;

/// A deterministic, in-process substitute for tests: commands are never
/// actually spawned, results are queued by the test via `complete`.
pub struct FakeRunner {
    queued: HashMap<usize, CommandResult>,
    running: Vec<usize>,
    max_parallel: usize,
}

impl FakeRunner {
    pub fn new(max_parallel: usize) -> Self {
        FakeRunner {
            queued: HashMap::new(),
            running: Vec::new(),
            max_parallel: max_parallel.max(1),
        }
    }

    pub fn complete(&mut self, token: usize, termination: Termination) {
        self.queued.insert(
            token,
            CommandResult {
                token,
                termination,
                output: Vec::new(),
            },
        );
    }
}

impl CommandRunner for FakeRunner {
    fn can_run_more(&self) -> bool {
        self.running.len() < self.max_parallel
    }

    fn start_command(&mut self, token: usize, _command: &str) -> Result<()> {
        self.running.push(token);
        Ok(())
    }

    fn wait(&mut self) -> Option<CommandResult> {
        let pos = self.running.iter().position(|t| self.queued.contains_key(t))?;
        let token = self.running.remove(pos);
        self.queued.remove(&token)
    }

    fn active_tokens(&self) -> Vec<usize> {
        self.running.clone()
    }

    fn abort(&mut self) {
        self.running.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fake_runner_round_trips_tokens() {
        let mut runner = FakeRunner::new(2);
        runner.start_command(1, "true").unwrap();
        runner.start_command(2, "true").unwrap();
        assert!(!runner.can_run_more());
        runner.complete(1, Termination::Success);
        let r = runner.wait().unwrap();
        assert_eq!(r.token, 1);
        assert_eq!(r.termination, Termination::Success);
    }
}
