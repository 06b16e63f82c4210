//! # Record Source Reader
//!
//! Reads newline-terminated text records from a file, a named pipe or
//! standard input, and keeps the last complete record ready for decoding.
//!
//! ## Double Buffering
//!
//! Two fixed-capacity buffers alternate roles. One is being filled from the
//! source and may hold a partial line; the other holds the last record that
//! was completed. When a newline arrives the roles swap, so a partial line is
//! never decoded and the previous complete record stays available while the
//! next one trickles in.
//!
//! A record that does not fit in one buffer is a resource-limit violation with
//! no safe recovery, reported as [`SourceError::Overflow`].
//!
//! ## Read Cycles
//!
//! Every call to [`RecordReader::read_frame`] is one read cycle:
//! 1. **Reposition**: reopen or rewind the source when the policy asks for it
//! 2. **Read**: consume complete records until the source has nothing more
//!    (default), or stop after the first new one (`read_next`)
//! 3. **Expose**: the last complete record, which is the previous one again
//!    if nothing new arrived
//!
//! Named pipes are read in non-blocking mode, so an idle writer makes a cycle
//! end early instead of stalling the session.

use crate::config::{ReadPolicy, Reposition, STDIN_PATH};
use std::fs::File;
use std::io::{self, BufRead, BufReader, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Failures while reading the data source.
#[derive(Error, Debug)]
pub enum SourceError {
    /// A record is longer than the buffer capacity
    #[error("input buffer overflow, line length greater than buffer size {capacity}")]
    Overflow { capacity: usize },

    #[error("cannot open data source {}: {source}", path.display())]
    Open { path: PathBuf, source: io::Error },

    #[error("cannot rewind a FIFO data source")]
    RewindPipe,

    #[error("cannot rewind or reopen standard input")]
    StdinReposition,

    #[error("data source IO: {0}")]
    Io(#[from] io::Error),
}

impl SourceError {
    /// Everything except a plain read error ends the process.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, SourceError::Io(_))
    }
}

/// One of the two line buffers.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Slot {
    A,
    B,
}

impl Slot {
    pub fn other(self) -> Slot {
        match self {
            Slot::A => Slot::B,
            Slot::B => Slot::A,
        }
    }

    fn index(self) -> usize {
        match self {
            Slot::A => 0,
            Slot::B => 1,
        }
    }
}

/// Where the buffer pair stands between read cycles.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FillState {
    /// `slot` holds a partial line of `offset` bytes
    Filling { slot: Slot, offset: usize },
    /// No partial line; `slot` holds the last complete record
    ReadyToDecode { slot: Slot },
}

/// Result of filling the active buffer from a source.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReadOutcome {
    /// A newline completed a record and the buffers swapped
    Record,
    /// The source has no more bytes right now (EOF or would block)
    Exhausted,
}

/// Two alternating fixed-capacity line buffers.
#[derive(Debug)]
pub struct DualLineBuffer {
    buffers: [Box<[u8]>; 2],
    lengths: [usize; 2],
    filling: Slot,
    offset: usize,
}

impl DualLineBuffer {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        DualLineBuffer {
            buffers: [
                vec![0; capacity].into_boxed_slice(),
                vec![0; capacity].into_boxed_slice(),
            ],
            lengths: [0, 0],
            filling: Slot::A,
            offset: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.buffers[0].len()
    }

    /// The buffer currently being filled.
    pub fn filling(&self) -> Slot {
        self.filling
    }

    pub fn offset(&self) -> usize {
        self.offset
    }

    pub fn state(&self) -> FillState {
        if self.offset > 0 {
            FillState::Filling {
                slot: self.filling,
                offset: self.offset,
            }
        } else {
            FillState::ReadyToDecode {
                slot: self.filling.other(),
            }
        }
    }

    /// The last complete record, newline included. Empty before the first one.
    pub fn decode_buffer(&self) -> &[u8] {
        let slot = self.filling.other().index();
        &self.buffers[slot][..self.lengths[slot]]
    }

    /// Drop a partially read line.
    pub fn discard_partial(&mut self) {
        self.offset = 0;
    }

    /// Append bytes from `source` until a newline completes a record or the
    /// source runs dry.
    pub fn fill_from<R: BufRead + ?Sized>(
        &mut self,
        source: &mut R,
    ) -> Result<ReadOutcome, SourceError> {
        loop {
            let available = match source.fill_buf() {
                Ok(bytes) => bytes,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    return Ok(ReadOutcome::Exhausted)
                }
                Err(e) => return Err(e.into()),
            };
            if available.is_empty() {
                return Ok(ReadOutcome::Exhausted);
            }

            let newline = available.iter().position(|&b| b == b'\n');
            let take = newline.map_or(available.len(), |i| i + 1);
            let room = self.capacity() - self.offset;
            if take > room || (newline.is_none() && take == room) {
                let capacity = self.capacity();
                self.offset = 0;
                return Err(SourceError::Overflow { capacity });
            }

            let slot = self.filling.index();
            self.buffers[slot][self.offset..self.offset + take]
                .copy_from_slice(&available[..take]);
            self.offset += take;
            source.consume(take);

            if newline.is_some() {
                self.lengths[slot] = self.offset;
                self.filling = self.filling.other();
                self.offset = 0;
                return Ok(ReadOutcome::Record);
            }
        }
    }
}

enum DataSource {
    Stdin(io::StdinLock<'static>),
    File(BufReader<File>),
}

impl Read for DataSource {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            DataSource::Stdin(stdin) => stdin.read(buf),
            DataSource::File(file) => file.read(buf),
        }
    }
}

impl BufRead for DataSource {
    fn fill_buf(&mut self) -> io::Result<&[u8]> {
        match self {
            DataSource::Stdin(stdin) => stdin.fill_buf(),
            DataSource::File(file) => file.fill_buf(),
        }
    }

    fn consume(&mut self, amt: usize) {
        match self {
            DataSource::Stdin(stdin) => stdin.consume(amt),
            DataSource::File(file) => file.consume(amt),
        }
    }
}

/// Reads records from the configured data source under a [`ReadPolicy`].
pub struct RecordReader {
    path: PathBuf,
    policy: ReadPolicy,
    source: Option<DataSource>,
    buffers: DualLineBuffer,
}

impl RecordReader {
    /// Open the data source at `path` (`-` for standard input).
    ///
    /// With the reopen policy a missing file is tolerated here; the first
    /// read cycle reopens it and fails then if it is still missing.
    pub fn open<P: AsRef<Path>>(
        path: P,
        capacity: usize,
        policy: ReadPolicy,
    ) -> Result<Self, SourceError> {
        let path = path.as_ref().to_path_buf();
        let source = if path.as_os_str() == STDIN_PATH {
            if policy.reposition != Reposition::Forward {
                return Err(SourceError::StdinReposition);
            }
            Some(open_stdin()?)
        } else {
            match open_file(&path, policy) {
                Ok(source) => Some(source),
                Err(SourceError::Open { source, .. }) if policy.reposition == Reposition::Reopen => {
                    log::warn!(
                        "Data source {} not available yet ({}), will retry on first read",
                        path.display(),
                        source
                    );
                    None
                }
                Err(e) => return Err(e),
            }
        };

        Ok(RecordReader {
            path,
            policy,
            source,
            buffers: DualLineBuffer::new(capacity),
        })
    }

    /// The last complete record, the one the decoder should use.
    pub fn record(&self) -> &[u8] {
        self.buffers.decode_buffer()
    }

    /// Run one read cycle and return how many new records were completed.
    ///
    /// Zero means nothing new arrived and [`record`](Self::record) still
    /// returns the previous record.
    pub fn read_frame(&mut self) -> Result<usize, SourceError> {
        self.reposition()?;

        let Some(source) = self.source.as_mut() else {
            return Ok(0);
        };

        let mut fresh = 0;
        while self.buffers.fill_from(source)? == ReadOutcome::Record {
            fresh += 1;
            if self.policy.read_next {
                break;
            }
        }

        log::trace!(
            "Read cycle completed {} records, {} bytes pending",
            fresh,
            self.buffers.offset()
        );
        Ok(fresh)
    }

    fn reposition(&mut self) -> Result<(), SourceError> {
        match self.policy.reposition {
            Reposition::Forward => Ok(()),
            Reposition::Reopen => {
                self.source = None;
                self.buffers.discard_partial();
                self.source = Some(open_file(&self.path, self.policy)?);
                Ok(())
            }
            Reposition::Rewind => {
                self.buffers.discard_partial();
                match self.source.as_mut() {
                    Some(DataSource::File(file)) => {
                        file.seek(SeekFrom::Start(0))?;
                        Ok(())
                    }
                    Some(DataSource::Stdin(_)) => Err(SourceError::StdinReposition),
                    None => Ok(()),
                }
            }
        }
    }
}

fn open_stdin() -> Result<DataSource, SourceError> {
    let stdin = io::stdin();
    if is_fifo_stdin() {
        set_nonblocking_stdin()?;
        log::debug!("Standard input is a pipe, switched to non-blocking reads");
    }
    Ok(DataSource::Stdin(stdin.lock()))
}

fn open_file(path: &Path, policy: ReadPolicy) -> Result<DataSource, SourceError> {
    let file = open_nonblocking(path).map_err(|source| SourceError::Open {
        path: path.to_path_buf(),
        source,
    })?;

    if file.metadata()?.file_type().is_fifo_like() {
        if policy.reposition == Reposition::Rewind {
            return Err(SourceError::RewindPipe);
        }
        log::debug!("Data source {} is a FIFO", path.display());
    }
    Ok(DataSource::File(BufReader::new(file)))
}

trait FifoCheck {
    fn is_fifo_like(&self) -> bool;
}

#[cfg(unix)]
impl FifoCheck for std::fs::FileType {
    fn is_fifo_like(&self) -> bool {
        use std::os::unix::fs::FileTypeExt;
        self.is_fifo()
    }
}

#[cfg(not(unix))]
impl FifoCheck for std::fs::FileType {
    fn is_fifo_like(&self) -> bool {
        false
    }
}

/// Opening a FIFO without `O_NONBLOCK` waits for a writer. The flag has no
/// effect on regular files.
#[cfg(unix)]
fn open_nonblocking(path: &Path) -> io::Result<File> {
    use std::os::unix::fs::OpenOptionsExt;
    std::fs::OpenOptions::new()
        .read(true)
        .custom_flags(libc::O_NONBLOCK)
        .open(path)
}

#[cfg(not(unix))]
fn open_nonblocking(path: &Path) -> io::Result<File> {
    File::open(path)
}

#[cfg(unix)]
fn is_fifo_stdin() -> bool {
    use std::os::fd::AsFd;
    io::stdin()
        .as_fd()
        .try_clone_to_owned()
        .map(File::from)
        .and_then(|file| file.metadata())
        .map(|meta| meta.file_type().is_fifo_like())
        .unwrap_or(false)
}

#[cfg(not(unix))]
fn is_fifo_stdin() -> bool {
    false
}

#[cfg(unix)]
fn set_nonblocking_stdin() -> io::Result<()> {
    let fd = libc::STDIN_FILENO;
    // SAFETY: fcntl on the process's own stdin descriptor, no pointers involved.
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };
    if flags < 0 {
        return Err(io::Error::last_os_error());
    }
    // SAFETY: as above.
    if unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) } < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

#[cfg(not(unix))]
fn set_nonblocking_stdin() -> io::Result<()> {
    Ok(())
}
