//! Readiness driven reader over several pipes

use std::{
    fs::File,
    io::{self, Read as _},
    os::fd::{AsFd as _, AsRawFd as _, OwnedFd},
};

use log::trace;
use nix::{
    errno::Errno,
    fcntl::{fcntl, FcntlArg, OFlag},
    poll::{poll, PollFd, PollFlags, PollTimeout},
};

const READ_SIZE: usize = 4096;

/// Piece of data read from a source
#[derive(Debug)]
pub(crate) enum Chunk<'a> {
    /// A complete line, without its terminator
    Line(&'a str),

    /// Bytes as they were read
    Raw(&'a [u8]),
}

#[derive(Debug)]
struct Source<T> {
    tag: T,
    file: File,
    raw: bool,
    open: bool,
    pending: Vec<u8>,
}

impl<T: Copy> Source<T> {
    fn emit_lines<F>(&mut self, cb: &mut F)
    where
        F: FnMut(T, Chunk<'_>),
    {
        while let Some(pos) = self.pending.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.pending.drain(..=pos).collect();
            let text = String::from_utf8_lossy(&line[..pos]);

            cb(self.tag, Chunk::Line(text.trim_end_matches('\r')));
        }
    }

    fn flush(&mut self, cb: &mut impl FnMut(T, Chunk<'_>)) {
        if self.pending.is_empty() {
            return;
        }

        let line = core::mem::take(&mut self.pending);
        let text = String::from_utf8_lossy(&line);
        cb(self.tag, Chunk::Line(text.trim_end_matches('\r')));
    }

    // Returns false once nothing more can be read for now
    fn read_once<F>(&mut self, cb: &mut F) -> io::Result<bool>
    where
        F: FnMut(T, Chunk<'_>),
    {
        let mut buf = [0; READ_SIZE];

        let len = loop {
            match self.file.read(&mut buf) {
                Ok(len) => break len,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(false),
                Err(e) => return Err(e),
            }
        };

        if len == 0 {
            trace!("Source closed");
            self.open = false;
            self.flush(cb);
            return Ok(false);
        }

        if self.raw {
            cb(self.tag, Chunk::Raw(&buf[..len]));
        } else {
            self.pending.extend_from_slice(&buf[..len]);
            self.emit_lines(cb);
        }

        Ok(true)
    }
}

/// Reads from a set of descriptors as data becomes available on them
///
/// Sources are read either line by line, or raw. One source can be marked as
/// terminal: once it hits end of file, whatever is immediately available on
/// the other sources is drained and reading stops, even if they are still
/// open.
#[derive(Debug)]
pub(crate) struct Multiplexer<T> {
    sources: Vec<Source<T>>,
    terminal: Option<usize>,
}

impl<T: Copy> Multiplexer<T> {
    pub(crate) fn new() -> Self {
        Self {
            sources: Vec::new(),
            terminal: None,
        }
    }

    fn add(&mut self, tag: T, fd: OwnedFd, raw: bool) -> usize {
        self.sources.push(Source {
            tag,
            file: File::from(fd),
            raw,
            open: true,
            pending: Vec::new(),
        });

        self.sources.len() - 1
    }

    pub(crate) fn add_lines(&mut self, tag: T, fd: OwnedFd) -> usize {
        self.add(tag, fd, false)
    }

    pub(crate) fn add_raw(&mut self, tag: T, fd: OwnedFd) -> usize {
        self.add(tag, fd, true)
    }

    pub(crate) fn terminate_on(&mut self, idx: usize) {
        self.terminal = Some(idx);
    }

    fn terminal_closed(&self) -> bool {
        self.terminal
            .and_then(|idx| self.sources.get(idx))
            .is_some_and(|s| !s.open)
    }

    fn drain<F>(&mut self, cb: &mut F) -> io::Result<()>
    where
        F: FnMut(T, Chunk<'_>),
    {
        for source in self.sources.iter_mut().filter(|s| s.open) {
            fcntl(
                source.file.as_raw_fd(),
                FcntlArg::F_SETFL(OFlag::O_NONBLOCK),
            )?;

            while source.read_once(cb)? {}

            source.flush(cb);
        }

        Ok(())
    }

    pub(crate) fn run<F>(mut self, mut cb: F) -> io::Result<()>
    where
        F: FnMut(T, Chunk<'_>),
    {
        loop {
            if self.terminal_closed() {
                trace!("Terminal source closed, draining the others");
                return self.drain(&mut cb);
            }

            if self.sources.iter().all(|s| !s.open) {
                return Ok(());
            }

            let ready: Vec<usize> = {
                let open: Vec<usize> = self
                    .sources
                    .iter()
                    .enumerate()
                    .filter(|(_, s)| s.open)
                    .map(|(idx, _)| idx)
                    .collect();

                let mut fds: Vec<PollFd<'_>> = open
                    .iter()
                    .map(|idx| PollFd::new(self.sources[*idx].file.as_fd(), PollFlags::POLLIN))
                    .collect();

                match poll(&mut fds, PollTimeout::NONE) {
                    Ok(_) => {}
                    Err(Errno::EINTR) => continue,
                    Err(e) => return Err(e.into()),
                }

                let wakeup = PollFlags::POLLIN | PollFlags::POLLHUP | PollFlags::POLLERR;
                open.iter()
                    .zip(fds.iter())
                    .filter(|(_, fd)| fd.revents().is_some_and(|r| r.intersects(wakeup)))
                    .map(|(idx, _)| *idx)
                    .collect()
            };

            for idx in ready {
                self.sources[idx].read_once(&mut cb)?;
            }
        }
    }
}
