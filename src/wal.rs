use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use crate::model::Event;

/// Encode one event as `[len][bincode][crc32]`.
fn encode_event(writer: &mut impl Write, event: &Event) -> io::Result<()> {
    let payload =
        bincode::serialize(event).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    let len = u32::try_from(payload.len())
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "event larger than 4 GiB"))?;
    writer.write_all(&len.to_le_bytes())?;
    writer.write_all(&payload)?;
    writer.write_all(&crc32fast::hash(&payload).to_le_bytes())?;
    Ok(())
}

/// Fill `buf` completely, or report a clean/torn end of file as `Ok(false)`.
fn read_full(reader: &mut impl Read, buf: &mut [u8]) -> io::Result<bool> {
    match reader.read_exact(buf) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => Ok(false),
        Err(e) => Err(e),
    }
}

/// Read the next intact record and its encoded size. `None` at end of log
/// or at the first truncated/corrupt record.
fn decode_next(reader: &mut impl Read) -> io::Result<Option<(Event, u64)>> {
    let mut len_buf = [0u8; 4];
    if !read_full(reader, &mut len_buf)? {
        return Ok(None);
    }
    let mut payload = vec![0u8; u32::from_le_bytes(len_buf) as usize];
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
    let size = 8 + payload.len() as u64;
    Ok(bincode::deserialize::<Event>(&payload)
        .ok()
        .map(|event| (event, size)))
}

/// Intact prefix of a log file.
#[derive(Debug, Default)]
pub struct Replay {
    pub events: Vec<Event>,
    /// Byte length of the intact prefix. Anything after it is a torn tail.
    pub valid_len: u64,
}

/// Append-only reservation log.
///
/// One record per event: `[u32 len][bincode Event][u32 crc32]`, little
/// endian. A torn final record from a crash is dropped on replay and cut
/// off by `truncate_torn_tail` before the log is reopened.
pub struct Wal {
    file: File,
    path: PathBuf,
    /// Length of the log after the last successful commit.
    committed_len: u64,
    appends_since_compact: u64,
}

impl Wal {
    pub fn open(path: &Path) -> io::Result<Self> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        let committed_len = file.metadata()?.len();
        Ok(Self {
            file,
            path: path.to_path_buf(),
            committed_len,
            appends_since_compact: 0,
        })
    }

    /// Encode events into one contiguous run of records.
    pub fn encode(events: &[Event]) -> io::Result<Vec<u8>> {
        let mut records = Vec::new();
        for event in events {
            encode_event(&mut records, event)?;
        }
        Ok(records)
    }

    /// Write `count` pre-encoded records and fsync them. On failure the log
    /// is cut back to its last committed length, so a group lands whole or
    /// not at all.
    pub fn commit(&mut self, records: &[u8], count: u64) -> io::Result<()> {
        let result = self
            .file
            .write_all(records)
            .and_then(|()| self.file.sync_all());
        match result {
            Ok(()) => {
                self.committed_len += records.len() as u64;
                self.appends_since_compact += count;
                Ok(())
            }
            Err(e) => {
                if let Err(rollback) = self.file.set_len(self.committed_len) {
                    tracing::error!(
                        "could not cut WAL back to {} bytes: {rollback}",
                        self.committed_len
                    );
                }
                Err(e)
            }
        }
    }

    #[cfg(test)]
    pub fn append(&mut self, event: &Event) -> io::Result<()> {
        let records = Self::encode(std::slice::from_ref(event))?;
        self.commit(&records, 1)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn compact_path(path: &Path) -> PathBuf {
        path.with_extension("wal.tmp")
    }

    /// Write the compacted event set next to the log and fsync it.
    pub fn write_compact_file(path: &Path, events: &[Event]) -> io::Result<()> {
        let mut writer = BufWriter::new(File::create(Self::compact_path(path))?);
        for event in events {
            encode_event(&mut writer, event)?;
        }
        writer.flush()?;
        writer.get_ref().sync_all()
    }

    /// Rename the compacted file over the log and reopen for appends.
    pub fn swap_compact_file(&mut self) -> io::Result<()> {
        fs::rename(Self::compact_path(&self.path), &self.path)?;
        let file = OpenOptions::new().create(true).append(true).open(&self.path)?;
        self.committed_len = file.metadata()?.len();
        self.file = file;
        self.appends_since_compact = 0;
        Ok(())
    }

    #[cfg(test)]
    pub fn compact(&mut self, events: &[Event]) -> io::Result<()> {
        Self::write_compact_file(&self.path, events)?;
        self.swap_compact_file()
    }

    pub fn appends_since_compact(&self) -> u64 {
        self.appends_since_compact
    }

    /// All intact events in the log; a missing file is an empty log.
    pub fn replay(path: &Path) -> io::Result<Replay> {
        let file = match File::open(path) {
            Ok(f) => f,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Replay::default()),
            Err(e) => return Err(e),
        };
        let mut reader = BufReader::new(file);
        let mut replay = Replay::default();
        while let Some((event, size)) = decode_next(&mut reader)? {
            replay.events.push(event);
            replay.valid_len += size;
        }
        Ok(replay)
    }

    /// Drop everything past `valid_len`. Records appended after a torn tail
    /// would be unreachable on the next replay.
    pub fn truncate_torn_tail(path: &Path, valid_len: u64) -> io::Result<bool> {
        let file = match OpenOptions::new().write(true).open(path) {
            Ok(f) => f,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(false),
            Err(e) => return Err(e),
        };
        if file.metadata()?.len() <= valid_len {
            return Ok(false);
        }
        file.set_len(valid_len)?;
        file.sync_all()?;
        Ok(true)
    }
}
