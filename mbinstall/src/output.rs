use core::fmt;
use std::{
    fs::File,
    io::{self, Write},
    os::fd::OwnedFd,
};

use log::{debug, info, warn};

use crate::updater::UpdaterCommand;

/// Kind of consumer reading our output
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, clap::ValueEnum)]
pub enum Interface {
    /// A terminal, only the text meant for the user is shown
    #[default]
    Stdout,

    /// A recovery, speaking the updater command protocol
    Recovery,
}

impl fmt::Display for Interface {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Stdout => "stdout",
            Self::Recovery => "recovery",
        })
    }
}

/// The user facing channel
pub struct Output {
    interface: Interface,
    sink: Box<dyn Write>,
}

impl fmt::Debug for Output {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Output")
            .field("interface", &self.interface)
            .finish_non_exhaustive()
    }
}

impl Output {
    /// Creates an output writing to `sink`
    pub fn new(interface: Interface, sink: impl Write + 'static) -> Self {
        Self {
            interface,
            sink: Box::new(sink),
        }
    }

    /// Creates an output writing to a file descriptor
    #[must_use]
    pub fn from_fd(interface: Interface, fd: OwnedFd) -> Self {
        Self::new(interface, File::from(fd))
    }

    /// Returns who we're talking to
    #[must_use]
    pub fn interface(&self) -> Interface {
        self.interface
    }

    fn write_line(&mut self, line: &str) {
        let res = writeln!(self.sink, "{line}").and_then(|()| self.sink.flush());

        if let Err(e) = res {
            warn!("Couldn't write to the output: {e}");
        }
    }

    /// Shows a message to the user
    pub fn display_msg(&mut self, msg: &str) {
        info!(target: "display", "{msg}");

        let lines: Vec<&str> = if msg.is_empty() {
            vec![""]
        } else {
            msg.lines().collect()
        };

        for line in lines {
            match self.interface {
                Interface::Stdout => self.write_line(line),
                Interface::Recovery => self.write_line(&format!("ui_print {line}")),
            }
        }
    }

    /// Relays a line of the updater command protocol
    pub fn updater_print(&mut self, line: &str) {
        match self.interface {
            Interface::Recovery => self.write_line(line),
            Interface::Stdout => match UpdaterCommand::parse(line) {
                UpdaterCommand::UiPrint(text) => self.write_line(text),
                _ => debug!("Updater: {line}"),
            },
        }
    }

    /// Records a line a child process printed
    #[allow(clippy::unused_self)]
    pub fn command_output(&self, line: &str) {
        info!(target: "command", "{line}");
    }

    /// Relays bytes verbatim
    ///
    /// # Errors
    ///
    /// If the output can't be written to
    pub fn write_raw(&mut self, data: &[u8]) -> io::Result<()> {
        self.sink.write_all(data)?;
        self.sink.flush()
    }
}
