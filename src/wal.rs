use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use crate::model::Event;

/// Frame overhead: u32 length prefix + u32 crc32 suffix.
const FRAME_OVERHEAD: u64 = 8;

/// Encode a single event to [len][bincode][crc32] format.
fn encode_frame(writer: &mut impl Write, event: &Event) -> io::Result<()> {
    let payload =
        bincode::serialize(event).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    let len = u32::try_from(payload.len())
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "record too large"))?;
    let crc = crc32fast::hash(&payload);
    writer.write_all(&len.to_le_bytes())?;
    writer.write_all(&payload)?;
    writer.write_all(&crc.to_le_bytes())?;
    Ok(())
}

/// Read one frame. `Ok(None)` on clean EOF, truncation, or checksum/decoding failure.
fn decode_frame(reader: &mut impl Read) -> io::Result<Option<(Event, u64)>> {
    let mut len_buf = [0u8; 4];
    if !read_full(reader, &mut len_buf)? {
        return Ok(None);
    }
    let len = u32::from_le_bytes(len_buf) as usize;

    let mut payload = vec![0u8; len];
    if !read_full(reader, &mut payload)? {
        return Ok(None);
    }
    let mut crc_buf = [0u8; 4];
    if !read_full(reader, &mut crc_buf)? {
        return Ok(None);
    }
    if u32::from_le_bytes(crc_buf) != crc32fast::hash(&payload) {
        return Ok(None);
    }
    match bincode::deserialize::<Event>(&payload) {
        Ok(event) => Ok(Some((event, len as u64 + FRAME_OVERHEAD))),
        Err(_) => Ok(None),
    }
}

/// `read_exact` that reports EOF as `false` instead of an error.
fn read_full(reader: &mut impl Read, buf: &mut [u8]) -> io::Result<bool> {
    match reader.read_exact(buf) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => Ok(false),
        Err(e) => Err(e),
    }
}

/// Result of reading a WAL from disk.
#[derive(Debug, Default)]
pub struct Replay {
    pub events: Vec<Event>,
    /// Byte length of the intact prefix. Anything after it is a torn or corrupt tail.
    pub valid_len: u64,
    pub file_len: u64,
}

impl Replay {
    pub fn has_torn_tail(&self) -> bool {
        self.file_len > self.valid_len
    }
}

/// Append-only write-ahead log of booking records.
///
/// Format per entry: `[u32: len][bincode: Event][u32: crc32]`.
/// One transaction is always one entry, so a crash mid-write loses the whole
/// transaction and never half of it.
///
/// Appends are staged in memory and reach the file only in `flush_sync`. A failed
/// flush cuts the file back to its last durable length, so a batch is either wholly
/// on disk or wholly absent.
pub struct Wal {
    file: File,
    path: PathBuf,
    /// Encoded frames waiting for the next `flush_sync`.
    pending: Vec<u8>,
    pending_frames: u64,
    /// Length of the file up to the last successful flush.
    durable_len: u64,
    /// Set when a failed flush could not be rolled back. Every later write is refused.
    poisoned: bool,
    appends_since_compact: u64,
    #[cfg(test)]
    tear_next_flush: bool,
}

impl Wal {
    /// Open (or create) the WAL at `path`, cutting off any torn tail left by a crash
    /// so new records are not written behind unreadable bytes.
    pub fn open(path: &Path) -> io::Result<Self> {
        let replay = Self::replay(path)?;
        if replay.has_torn_tail() {
            tracing::warn!(
                "wal {}: discarding {} trailing bytes",
                path.display(),
                replay.file_len - replay.valid_len
            );
            let file = OpenOptions::new().write(true).open(path)?;
            file.set_len(replay.valid_len)?;
            file.sync_all()?;
        }
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            file,
            path: path.to_path_buf(),
            pending: Vec::new(),
            pending_frames: 0,
            durable_len: replay.valid_len,
            poisoned: false,
            appends_since_compact: 0,
            #[cfg(test)]
            tear_next_flush: false,
        })
    }

    #[cfg(test)]
    pub fn append(&mut self, event: &Event) -> io::Result<()> {
        self.append_buffered(event)?;
        self.flush_sync()
    }

    /// Stage one record. Durable only after `flush_sync`. An encoding failure
    /// stages nothing.
    pub fn append_buffered(&mut self, event: &Event) -> io::Result<()> {
        self.check_poisoned()?;
        let mut frame = Vec::new();
        encode_frame(&mut frame, event)?;
        self.pending.extend_from_slice(&frame);
        self.pending_frames += 1;
        Ok(())
    }

    /// Write and fsync every staged record. On failure none of them stay in the file.
    pub fn flush_sync(&mut self) -> io::Result<()> {
        self.check_poisoned()?;
        if self.pending.is_empty() {
            return Ok(());
        }
        match self.write_pending() {
            Ok(()) => {
                self.durable_len += self.pending.len() as u64;
                self.appends_since_compact += self.pending_frames;
                self.pending.clear();
                self.pending_frames = 0;
                Ok(())
            }
            Err(e) => {
                self.pending.clear();
                self.pending_frames = 0;
                self.roll_back();
                Err(e)
            }
        }
    }

    fn write_pending(&mut self) -> io::Result<()> {
        #[cfg(test)]
        if std::mem::take(&mut self.tear_next_flush) {
            let half = self.pending.len() / 2;
            self.file.write_all(&self.pending[..half])?;
            return Err(io::Error::other("simulated torn write"));
        }
        self.file.write_all(&self.pending)?;
        self.file.sync_all()
    }

    /// Cut the file back to the last durable length after a failed flush.
    fn roll_back(&mut self) {
        let result = self.file.set_len(self.durable_len).and_then(|()| self.file.sync_all());
        if let Err(e) = result {
            tracing::error!(
                "wal {}: could not roll back failed write, refusing further writes: {e}",
                self.path.display()
            );
            self.poisoned = true;
        }
    }

    fn check_poisoned(&self) -> io::Result<()> {
        if self.poisoned {
            return Err(io::Error::other("wal is unusable after a failed rollback"));
        }
        Ok(())
    }

    #[cfg(test)]
    fn arm_torn_flush(&mut self) {
        self.tear_next_flush = true;
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn appends_since_compact(&self) -> u64 {
        self.appends_since_compact
    }

    /// Write a snapshot to `<wal>.tmp` and fsync it. Slow; done before the swap.
    pub fn write_compact_file(path: &Path, events: &[Event]) -> io::Result<()> {
        let tmp_path = path.with_extension("wal.tmp");
        let mut writer = BufWriter::new(File::create(&tmp_path)?);
        for event in events {
            encode_frame(&mut writer, event)?;
        }
        writer.flush()?;
        writer.get_ref().sync_all()
    }

    /// Rename the snapshot over the live log and reopen for appends.
    pub fn swap_compact_file(&mut self) -> io::Result<()> {
        self.flush_sync()?;
        let tmp_path = self.path.with_extension("wal.tmp");
        fs::rename(&tmp_path, &self.path)?;
        let file = OpenOptions::new().create(true).append(true).open(&self.path)?;
        self.durable_len = file.metadata()?.len();
        self.file = file;
        self.appends_since_compact = 0;
        Ok(())
    }

    #[cfg(test)]
    pub fn compact(&mut self, events: &[Event]) -> io::Result<()> {
        Self::write_compact_file(&self.path, events)?;
        self.swap_compact_file()
    }

    /// Read every intact record. A missing file is an empty log.
    pub fn replay(path: &Path) -> io::Result<Replay> {
        let file = match File::open(path) {
            Ok(f) => f,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Replay::default()),
            Err(e) => return Err(e),
        };
        let file_len = file.metadata()?.len();
        let mut reader = BufReader::new(file);
        let mut replay = Replay {
            file_len,
            ..Replay::default()
        };
        while let Some((event, frame_len)) = decode_frame(&mut reader)? {
            replay.events.push(event);
            replay.valid_len += frame_len;
        }
        Ok(replay)
    }
}
