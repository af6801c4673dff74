use core::fmt;
use std::{
    ffi::{CString, OsStr, OsString},
    io,
    os::{
        fd::{OwnedFd, RawFd},
        unix::{ffi::OsStrExt as _, process::CommandExt as _},
    },
    path::{Path, PathBuf},
    process::{Command, ExitStatus, Stdio},
};

use log::debug;
use nix::fcntl::{fcntl, FcntlArg, FdFlag};
use types::InstallerError;

use crate::{
    chroot::{change_root, in_root},
    mux::{Chunk, Multiplexer},
    platform::Platform,
};

/// Output stream of a child process
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Stream {
    /// Standard Output
    Stdout,

    /// Standard Error
    Stderr,
}

/// Where the standard streams of a child process go
#[derive(Debug, Default)]
pub enum StdioMode {
    /// Stdin is closed, stdout and stderr are captured
    #[default]
    Piped,

    /// All three are shared with the installer
    Inherit,

    /// Stdin is closed, stdout and stderr are both sent to a descriptor
    Redirect(OwnedFd),
}

/// How a command root directory is honoured
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) enum RootMode {
    /// The child changes its root before executing the program
    Chroot,

    /// The program is looked up below the root and run from there, without
    /// any privilege
    #[cfg_attr(not(test), allow(dead_code))]
    Rebase,
}

/// Description of a process to run
#[derive(Debug)]
pub struct CommandSpec {
    program: PathBuf,
    args: Vec<OsString>,
    root: Option<PathBuf>,
    envs: Vec<(OsString, OsString)>,
    keep_fds: Vec<RawFd>,
    stdio: StdioMode,
}

impl CommandSpec {
    /// Creates a new command running `program` with no argument
    pub fn new(program: impl AsRef<Path>) -> Self {
        Self {
            program: program.as_ref().to_path_buf(),
            args: Vec::new(),
            root: None,
            envs: Vec::new(),
            keep_fds: Vec::new(),
            stdio: StdioMode::default(),
        }
    }

    /// Appends an argument
    #[must_use]
    pub fn arg(mut self, arg: impl AsRef<OsStr>) -> Self {
        self.args.push(arg.as_ref().to_os_string());
        self
    }

    /// Appends several arguments
    #[must_use]
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        self.args
            .extend(args.into_iter().map(|a| a.as_ref().to_os_string()));
        self
    }

    /// Runs the program with `root` as its root directory
    #[must_use]
    pub fn root(mut self, root: impl AsRef<Path>) -> Self {
        self.root = Some(root.as_ref().to_path_buf());
        self
    }

    /// Sets an environment variable
    #[must_use]
    pub fn env(mut self, key: impl AsRef<OsStr>, val: impl AsRef<OsStr>) -> Self {
        self.envs
            .push((key.as_ref().to_os_string(), val.as_ref().to_os_string()));
        self
    }

    /// Lets the child inherit a descriptor that is otherwise closed on exec
    #[must_use]
    pub fn keep_fd(mut self, fd: RawFd) -> Self {
        self.keep_fds.push(fd);
        self
    }

    /// Sets where the standard streams go
    #[must_use]
    pub fn stdio(mut self, stdio: StdioMode) -> Self {
        self.stdio = stdio;
        self
    }

    /// Program to run
    #[must_use]
    pub fn program(&self) -> &Path {
        &self.program
    }
}

impl fmt::Display for CommandSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.program.display())?;

        for arg in &self.args {
            write!(f, " {}", arg.to_string_lossy())?;
        }

        if let Some(root) = &self.root {
            write!(f, " (in {})", root.display())?;
        }

        Ok(())
    }
}

pub(crate) fn build_command(spec: &CommandSpec, mode: RootMode) -> io::Result<Command> {
    let mut chroot_path = None;

    let mut cmd = match (&spec.root, mode) {
        (Some(root), RootMode::Chroot) => {
            chroot_path = Some(
                CString::new(root.as_os_str().as_bytes())
                    .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?,
            );

            Command::new(&spec.program)
        }
        (Some(root), RootMode::Rebase) => {
            let mut cmd = Command::new(in_root(root, &spec.program));
            cmd.current_dir(root);
            cmd
        }
        (None, _) => Command::new(&spec.program),
    };

    cmd.args(&spec.args);
    cmd.envs(spec.envs.iter().map(|(k, v)| (k, v)));

    match &spec.stdio {
        StdioMode::Piped => {
            cmd.stdin(Stdio::null())
                .stdout(Stdio::piped())
                .stderr(Stdio::piped());
        }
        StdioMode::Inherit => {
            cmd.stdin(Stdio::inherit())
                .stdout(Stdio::inherit())
                .stderr(Stdio::inherit());
        }
        StdioMode::Redirect(fd) => {
            cmd.stdin(Stdio::null())
                .stdout(Stdio::from(fd.try_clone()?))
                .stderr(Stdio::from(fd.try_clone()?));
        }
    }

    if chroot_path.is_some() || !spec.keep_fds.is_empty() {
        let keep_fds = spec.keep_fds.clone();

        // SAFETY: The closure runs between fork and exec. It only issues
        // fcntl, chroot and chdir system calls, on memory allocated before the
        // fork, which are all async-signal-safe.
        unsafe {
            cmd.pre_exec(move || {
                for fd in &keep_fds {
                    fcntl(*fd, FcntlArg::F_SETFD(FdFlag::empty()))?;
                }

                if let Some(root) = &chroot_path {
                    change_root(root)?;
                }

                Ok(())
            });
        }
    }

    Ok(cmd)
}

/// Runs a command to completion, reporting each line it prints along with the
/// stream it was printed on.
///
/// # Errors
///
/// If the process can't be launched or waited for. A process exiting with an
/// error isn't an error, the caller has to check the returned status.
pub fn run_command<F>(
    platform: &dyn Platform,
    spec: CommandSpec,
    mut on_line: F,
) -> io::Result<ExitStatus>
where
    F: FnMut(Stream, &str),
{
    let spec = spec.stdio(StdioMode::Piped);

    let mut child = platform.spawn(&spec)?;
    debug!("Started {spec} as PID {}", child.id());

    let mut mux = Multiplexer::new();
    if let Some(stdout) = child.stdout.take() {
        mux.add_lines(Stream::Stdout, OwnedFd::from(stdout));
    }

    if let Some(stderr) = child.stderr.take() {
        mux.add_lines(Stream::Stderr, OwnedFd::from(stderr));
    }

    let res = mux.run(|stream, chunk| match chunk {
        Chunk::Line(line) => on_line(stream, line),
        Chunk::Raw(data) => on_line(stream, &String::from_utf8_lossy(data)),
    });

    let status = child.wait()?;
    res?;

    debug!("{} exited with {status}", spec.program().display());
    Ok(status)
}

/// Runs a command inside `root`, see [`run_command`]
///
/// # Errors
///
/// If the process can't be launched or waited for
pub fn run_command_chroot<F>(
    platform: &dyn Platform,
    root: &Path,
    spec: CommandSpec,
    on_line: F,
) -> io::Result<ExitStatus>
where
    F: FnMut(Stream, &str),
{
    run_command(platform, spec.root(root), on_line)
}

pub(crate) fn check_status(program: &Path, status: ExitStatus) -> Result<(), InstallerError> {
    if status.success() {
        return Ok(());
    }

    Err(InstallerError::CommandFailed {
        program: program.to_path_buf(),
        status: status.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use std::{fs, os::unix::fs::PermissionsExt as _};

    use tempfile::TempDir;
    use test_log::test;

    use super::{run_command, run_command_chroot, CommandSpec, Stream};
    use crate::platform::fake::FakePlatform;

    #[test]
    fn captures_both_streams() {
        let platform = FakePlatform::new();
        let mut lines = Vec::new();

        let status = run_command(
            &platform,
            CommandSpec::new("/bin/sh")
                .arg("-c")
                .arg("echo out; echo err >&2; printf 'no newline'"),
            |stream, line| lines.push((stream, line.to_owned())),
        )
        .unwrap();

        assert!(status.success(), "Command failed: {status}");
        assert!(lines.contains(&(Stream::Stdout, "out".to_owned())));
        assert!(lines.contains(&(Stream::Stderr, "err".to_owned())));
        assert!(lines.contains(&(Stream::Stdout, "no newline".to_owned())));
    }

    #[test]
    fn reports_exit_status() {
        let platform = FakePlatform::new();

        let status = run_command(
            &platform,
            CommandSpec::new("/bin/sh").args(["-c", "exit 3"]),
            |_, _| {},
        )
        .unwrap();

        assert_eq!(status.code(), Some(3));
    }

    #[test]
    fn missing_program_fails_to_launch() {
        let platform = FakePlatform::new();

        run_command(
            &platform,
            CommandSpec::new("/this/program/does/not/exist"),
            |_, _| {},
        )
        .unwrap_err();
    }

    #[test]
    fn environment_is_passed() {
        let platform = FakePlatform::new();
        let mut lines = Vec::new();

        run_command(
            &platform,
            CommandSpec::new("/bin/sh")
                .args(["-c", "echo $MB_TEST"])
                .env("MB_TEST", "value"),
            |_, line| lines.push(line.to_owned()),
        )
        .unwrap();

        assert_eq!(lines, vec!["value".to_owned()]);
    }

    #[test]
    fn runs_program_from_root() {
        let root = TempDir::new().unwrap();
        fs::create_dir(root.path().join("sbin")).unwrap();

        let script = root.path().join("sbin/hello");
        fs::write(&script, "#!/bin/sh\necho hello from $(basename $(pwd))\n").unwrap();
        fs::set_permissions(&script, fs::Permissions::from_mode(0o755)).unwrap();

        let platform = FakePlatform::new();
        let mut lines = Vec::new();

        let status = run_command_chroot(
            &platform,
            root.path(),
            CommandSpec::new("/sbin/hello"),
            |_, line| lines.push(line.to_owned()),
        )
        .unwrap();

        assert!(status.success(), "Command failed: {status}");
        assert_eq!(lines.len(), 1);
        assert!(lines[0].starts_with("hello from"));
    }
}
