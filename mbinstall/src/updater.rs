//! The recovery updater protocol
//!
//! Installation scripts are started as `updater <version> <fd> <zip>` and
//! report progress by writing commands, one per line, to the descriptor they
//! were given.

use std::{io, os::fd::OwnedFd};

use log::{debug, info, warn};

use crate::{
    installer::CANCELLED,
    mux::{Chunk, Multiplexer},
    output::Output,
};

/// Updater API version we speak
pub const UPDATER_API_VERSION: u32 = 3;

/// A command sent by an updater
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum UpdaterCommand<'a> {
    /// Shows a line of text
    UiPrint(&'a str),

    /// Fills `fraction` of the progress bar over `seconds`
    Progress {
        /// Part of the progress bar to fill
        fraction: f32,

        /// Duration of the animation
        seconds: u32,
    },

    /// Sets the progress within the current progress section
    SetProgress(f32),

    /// Asks the recovery to wipe the cache partition afterwards
    WipeCache,

    /// Clears the screen
    ClearDisplay,

    /// Lets the user reboot during the installation
    EnableReboot,

    /// The user aborted the installation
    Cancelled,

    /// Anything else, kept verbatim
    Unknown(&'a str),
}

impl<'a> UpdaterCommand<'a> {
    /// Parses a command line
    #[must_use]
    pub fn parse(line: &'a str) -> Self {
        let trimmed = line.trim_end();
        let (cmd, args) = trimmed
            .split_once(' ')
            .unwrap_or((trimmed, ""));

        match cmd {
            "ui_print" => Self::UiPrint(args),
            "progress" => {
                let mut parts = args.split_whitespace();
                let fraction = parts.next().and_then(|f| f.parse().ok());
                let seconds = parts.next().and_then(|s| s.parse().ok());

                match (fraction, seconds) {
                    (Some(fraction), Some(seconds)) => Self::Progress { fraction, seconds },
                    _ => Self::Unknown(line),
                }
            }
            "set_progress" => args
                .trim()
                .parse()
                .map_or(Self::Unknown(line), Self::SetProgress),
            "wipe_cache" => Self::WipeCache,
            "clear_display" => Self::ClearDisplay,
            "enable_reboot" => Self::EnableReboot,
            CANCELLED if args.is_empty() => Self::Cancelled,
            _ => Self::Unknown(line),
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum Channel {
    Command,
    Text,
}

/// Relays what an updater sends until its command channel is closed
///
/// In passthrough mode, used for installers drawing their own interface, the
/// text output is relayed byte for byte and commands are forwarded untouched.
/// Otherwise text output is only logged. Returns whether the installation was
/// cancelled.
///
/// # Errors
///
/// If polling or reading the descriptors fails
pub(crate) fn updater_fd_reader(
    output: &mut Output,
    stdio: OwnedFd,
    command: OwnedFd,
    passthrough: bool,
) -> io::Result<bool> {
    let mut mux = Multiplexer::new();

    let cmd = mux.add_lines(Channel::Command, command);
    if passthrough {
        mux.add_raw(Channel::Text, stdio);
    } else {
        mux.add_lines(Channel::Text, stdio);
    }
    mux.terminate_on(cmd);

    let mut cancelled = false;
    mux.run(|channel, chunk| {
        if cancelled {
            return;
        }

        match (channel, chunk) {
            (Channel::Command, Chunk::Line(line)) => {
                if line.trim() == CANCELLED {
                    info!("Installation cancelled by the updater");
                    cancelled = true;
                    return;
                }

                if !passthrough {
                    if let UpdaterCommand::Unknown(unknown) = UpdaterCommand::parse(line) {
                        debug!("Unknown updater command: {unknown}");
                    }
                }

                output.updater_print(line);
            }
            (Channel::Text, Chunk::Line(line)) => output.command_output(line),
            (_, Chunk::Raw(data)) => {
                if let Err(e) = output.write_raw(data) {
                    warn!("Couldn't relay the updater output: {e}");
                }
            }
        }
    })?;

    Ok(cancelled)
}
