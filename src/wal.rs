use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use crate::model::Event;

/// Written once at the start of every log file.
const MAGIC: &[u8; 8] = b"SLOTWAL1";

/// Upper bound on a single record. Anything larger is a torn length prefix.
const MAX_RECORD_LEN: usize = 16 * 1024 * 1024;

fn encode_event(writer: &mut impl Write, event: &Event) -> io::Result<()> {
    let payload =
        bincode::serialize(event).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    let len = u32::try_from(payload.len())
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "event too large"))?;
    let crc = crc32fast::hash(&payload);
    writer.write_all(&len.to_le_bytes())?;
    writer.write_all(&payload)?;
    writer.write_all(&crc.to_le_bytes())?;
    Ok(())
}

/// Outcome of reading one record off the log.
enum Record {
    Event(Event),
    /// Clean end of file.
    End,
    /// Torn or corrupt tail; everything from here on is dropped.
    Damaged(&'static str),
}

/// `Ok(false)` when the reader hit EOF before filling `buf`.
fn read_full(reader: &mut impl Read, buf: &mut [u8]) -> io::Result<bool> {
    match reader.read_exact(buf) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => Ok(false),
        Err(e) => Err(e),
    }
}

/// One record and the bytes it occupied on disk.
fn read_record(reader: &mut impl Read) -> io::Result<(Record, u64)> {
    let mut len_buf = [0u8; 4];
    if !read_full(reader, &mut len_buf)? {
        return Ok((Record::End, 0));
    }
    let len = u32::from_le_bytes(len_buf) as usize;
    if len > MAX_RECORD_LEN {
        return Ok((Record::Damaged("implausible record length"), 0));
    }

    let mut payload = vec![0u8; len];
    if !read_full(reader, &mut payload)? {
        return Ok((Record::Damaged("truncated payload"), 0));
    }
    let mut crc_buf = [0u8; 4];
    if !read_full(reader, &mut crc_buf)? {
        return Ok((Record::Damaged("truncated checksum"), 0));
    }
    if u32::from_le_bytes(crc_buf) != crc32fast::hash(&payload) {
        return Ok((Record::Damaged("checksum mismatch"), 0));
    }
    let size = (len + 8) as u64;
    match bincode::deserialize::<Event>(&payload) {
        Ok(event) => Ok((Record::Event(event), size)),
        Err(_) => Ok((Record::Damaged("undecodable event"), 0)),
    }
}

/// Append-only event log of one tenant.
///
/// Layout: an 8-byte magic, then records of `[u32 len][bincode Event][u32 crc32]`.
/// A torn last record (crash mid-write) is dropped on replay and cut off by
/// `recover`.
pub struct Wal {
    writer: BufWriter<File>,
    path: PathBuf,
    appends_since_compact: u64,
}

impl Wal {
    /// Open (or create) the log at `path`, stamping the header on a new file.
    pub fn open(path: &Path) -> io::Result<Self> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        let fresh = file.metadata()?.len() == 0;
        let mut writer = BufWriter::new(file);
        if fresh {
            writer.write_all(MAGIC)?;
            writer.flush()?;
            writer.get_ref().sync_all()?;
        }
        Ok(Self {
            writer,
            path: path.to_path_buf(),
            appends_since_compact: 0,
        })
    }

    #[cfg(test)]
    pub fn append(&mut self, event: &Event) -> io::Result<()> {
        self.append_buffered(event)?;
        self.flush_sync()
    }

    /// Buffer one record. Nothing is durable until `flush_sync`.
    pub fn append_buffered(&mut self, event: &Event) -> io::Result<()> {
        encode_event(&mut self.writer, event)?;
        self.appends_since_compact += 1;
        Ok(())
    }

    pub fn flush_sync(&mut self) -> io::Result<()> {
        self.writer.flush()?;
        self.writer.get_ref().sync_all()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn tmp_path(path: &Path) -> PathBuf {
        path.with_extension("wal.tmp")
    }

    /// Write a fresh log holding `events` next to `path`, fsynced.
    pub fn write_compact_file(path: &Path, events: &[Event]) -> io::Result<()> {
        let mut writer = BufWriter::new(File::create(Self::tmp_path(path))?);
        writer.write_all(MAGIC)?;
        for event in events {
            encode_event(&mut writer, event)?;
        }
        writer.flush()?;
        writer.get_ref().sync_all()
    }

    /// Rename the compacted file over the live log and reopen it.
    pub fn swap_compact_file(&mut self) -> io::Result<()> {
        self.writer.flush()?;
        fs::rename(Self::tmp_path(&self.path), &self.path)?;
        let file = OpenOptions::new().append(true).open(&self.path)?;
        self.writer = BufWriter::new(file);
        self.appends_since_compact = 0;
        debug!(path = %self.path.display(), "WAL compacted");
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

    /// Every intact event in the log, in write order. A missing file is an
    /// empty log; a foreign file is an error.
    #[cfg(test)]
    pub fn replay(path: &Path) -> io::Result<Vec<Event>> {
        Ok(Self::scan(path)?.events)
    }

    /// Replay, then cut a torn tail off the file so later appends follow the
    /// last intact record instead of the garbage.
    pub fn recover(path: &Path) -> io::Result<Vec<Event>> {
        let scan = Self::scan(path)?;
        if let Some(intact) = scan.truncate_to {
            let file = OpenOptions::new().write(true).open(path)?;
            file.set_len(intact)?;
            file.sync_all()?;
            warn!(path = %path.display(), intact, "truncated damaged WAL tail");
        }
        Ok(scan.events)
    }

    fn scan(path: &Path) -> io::Result<Scan> {
        let file = match File::open(path) {
            Ok(f) => f,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Scan::default()),
            Err(e) => return Err(e),
        };
        let file_len = file.metadata()?.len();
        if file_len == 0 {
            return Ok(Scan::default());
        }
        let mut reader = BufReader::new(file);

        let mut magic = [0u8; 8];
        if !read_full(&mut reader, &mut magic)? {
            // Crashed while stamping the header of a new file
            let mut head = Vec::new();
            File::open(path)?.read_to_end(&mut head)?;
            if MAGIC.starts_with(&head) {
                return Ok(Scan { events: Vec::new(), truncate_to: Some(0) });
            }
        }
        if &magic != MAGIC {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("{} is not a slotwise log", path.display()),
            ));
        }

        let mut events = Vec::new();
        let mut intact = MAGIC.len() as u64;
        loop {
            match read_record(&mut reader)? {
                (Record::Event(event), len) => {
                    events.push(event);
                    intact += len;
                }
                (Record::End, _) => break,
                (Record::Damaged(why), _) => {
                    warn!(
                        path = %path.display(),
                        kept = events.len(),
                        "dropping WAL tail: {why}"
                    );
                    break;
                }
            }
        }
        let truncate_to = (intact < file_len).then_some(intact);
        Ok(Scan { events, truncate_to })
    }
}

/// What a pass over the log found.
#[derive(Default)]
struct Scan {
    events: Vec<Event>,
    /// Length of the intact prefix, when bytes follow it.
    truncate_to: Option<u64>,
}

#[cfg(test)]
mod tests {
    use chrono::{NaiveDate, NaiveTime};
    use ulid::Ulid;

    use super::*;
    use crate::model::Slot;

    fn tmp_path(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join("slotwise_test_wal");
        fs::create_dir_all(&dir).unwrap();
        let path = dir.join(name);
        let _ = fs::remove_file(&path);
        path
    }

    fn created(id: Ulid) -> Event {
        Event::ProviderCreated {
            id,
            name: Some("Counselor".into()),
        }
    }

    fn override_for(provider_id: Ulid, day: u32) -> Event {
        Event::DateSlotsSet {
            provider_id,
            date: NaiveDate::from_ymd_opt(2024, 1, day).unwrap(),
            slots: vec![Slot::new(
                NaiveTime::from_hms_opt(10, 0, 0).unwrap(),
                NaiveTime::from_hms_opt(10, 30, 0).unwrap(),
            )],
        }
    }

    #[test]
    fn append_and_replay() {
        let path = tmp_path("append_and_replay.wal");
        let pid = Ulid::new();
        let events = vec![created(pid), override_for(pid, 1)];
        {
            let mut wal = Wal::open(&path).unwrap();
            for e in &events {
                wal.append(e).unwrap();
            }
        }
        assert_eq!(Wal::replay(&path).unwrap(), events);
    }

    #[test]
    fn reopen_does_not_restamp_header() {
        let path = tmp_path("reopen.wal");
        let pid = Ulid::new();
        {
            let mut wal = Wal::open(&path).unwrap();
            wal.append(&created(pid)).unwrap();
        }
        {
            let mut wal = Wal::open(&path).unwrap();
            wal.append(&override_for(pid, 2)).unwrap();
        }
        assert_eq!(Wal::replay(&path).unwrap().len(), 2);
    }

    #[test]
    fn replay_drops_torn_tail() {
        let path = tmp_path("truncation.wal");
        let event = created(Ulid::new());
        {
            let mut wal = Wal::open(&path).unwrap();
            wal.append(&event).unwrap();
        }
        {
            let mut f = OpenOptions::new().append(true).open(&path).unwrap();
            f.write_all(&[7u8, 0, 0, 0, 1, 2]).unwrap();
        }
        assert_eq!(Wal::replay(&path).unwrap(), vec![event]);
    }

    #[test]
    fn recover_cuts_torn_tail_before_new_appends() {
        let path = tmp_path("recover_torn.wal");
        let pid = Ulid::new();
        {
            let mut wal = Wal::open(&path).unwrap();
            wal.append(&created(pid)).unwrap();
        }
        {
            let mut f = OpenOptions::new().append(true).open(&path).unwrap();
            f.write_all(&[9u8, 0, 0, 0, 1, 2]).unwrap();
        }

        assert_eq!(Wal::recover(&path).unwrap(), vec![created(pid)]);
        {
            let mut wal = Wal::open(&path).unwrap();
            wal.append(&override_for(pid, 3)).unwrap();
        }
        assert_eq!(
            Wal::replay(&path).unwrap(),
            vec![created(pid), override_for(pid, 3)]
        );
    }

    #[test]
    fn recover_leaves_clean_log_alone() {
        let path = tmp_path("recover_clean.wal");
        {
            let mut wal = Wal::open(&path).unwrap();
            wal.append(&created(Ulid::new())).unwrap();
        }
        let before = fs::metadata(&path).unwrap().len();
        assert_eq!(Wal::recover(&path).unwrap().len(), 1);
        assert_eq!(fs::metadata(&path).unwrap().len(), before);
    }

    #[test]
    fn recover_restarts_half_written_header() {
        let path = tmp_path("recover_header.wal");
        fs::write(&path, &MAGIC[..3]).unwrap();
        assert!(Wal::recover(&path).unwrap().is_empty());
        {
            let mut wal = Wal::open(&path).unwrap();
            wal.append(&created(Ulid::new())).unwrap();
        }
        assert_eq!(Wal::replay(&path).unwrap().len(), 1);
    }

    #[test]
    fn replay_stops_at_bad_checksum() {
        let path = tmp_path("corrupt_crc.wal");
        let good = created(Ulid::new());
        {
            let mut wal = Wal::open(&path).unwrap();
            wal.append(&good).unwrap();
        }
        {
            let payload = bincode::serialize(&Event::ProviderDeleted { id: Ulid::new() }).unwrap();
            let mut f = OpenOptions::new().append(true).open(&path).unwrap();
            f.write_all(&(payload.len() as u32).to_le_bytes()).unwrap();
            f.write_all(&payload).unwrap();
            f.write_all(&0xDEAD_BEEFu32.to_le_bytes()).unwrap();
        }
        assert_eq!(Wal::replay(&path).unwrap(), vec![good]);
    }

    #[test]
    fn replay_rejects_foreign_file() {
        let path = tmp_path("foreign.wal");
        fs::write(&path, b"not a log at all").unwrap();
        let err = Wal::replay(&path).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[test]
    fn missing_or_empty_file_is_empty_log() {
        let path = tmp_path("nonexistent.wal");
        assert!(Wal::replay(&path).unwrap().is_empty());
        File::create(&path).unwrap();
        assert!(Wal::replay(&path).unwrap().is_empty());
    }

    #[test]
    fn compact_shrinks_and_keeps_appending() {
        let path = tmp_path("compact.wal");
        let pid = Ulid::new();
        let mut wal = Wal::open(&path).unwrap();
        wal.append(&created(pid)).unwrap();
        for day in 1..=20 {
            wal.append(&override_for(pid, day)).unwrap();
            wal.append(&Event::DateSlotsCleared {
                provider_id: pid,
                date: NaiveDate::from_ymd_opt(2024, 1, day).unwrap(),
            })
            .unwrap();
        }
        assert_eq!(wal.appends_since_compact(), 41);
        let before = fs::metadata(&path).unwrap().len();

        wal.compact(&[created(pid)]).unwrap();
        assert_eq!(wal.appends_since_compact(), 0);
        assert!(fs::metadata(&path).unwrap().len() < before);

        let later = override_for(pid, 25);
        wal.append(&later).unwrap();
        assert_eq!(Wal::replay(&path).unwrap(), vec![created(pid), later]);
    }

    #[test]
    fn buffered_appends_land_after_flush() {
        let path = tmp_path("buffered_flush.wal");
        let events: Vec<Event> = (0..5).map(|_| created(Ulid::new())).collect();
        {
            let mut wal = Wal::open(&path).unwrap();
            for e in &events {
                wal.append_buffered(e).unwrap();
            }
            assert_eq!(wal.appends_since_compact(), 5);
            wal.flush_sync().unwrap();
        }
        assert_eq!(Wal::replay(&path).unwrap(), events);
    }
}
