use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use crate::model::Event;

/// Encode a single event to [len][bincode][crc32] format.
fn encode_event(writer: &mut impl Write, event: &Event) -> io::Result<()> {
    let payload =
        bincode::serialize(event).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    let len = payload.len() as u32;
    writer.write_all(&len.to_le_bytes())?;
    writer.write_all(&payload)?;
    writer.write_all(&crc32fast::hash(&payload).to_le_bytes())?;
    Ok(())
}

/// Read one `[len][payload][crc]` frame. `None` on clean EOF, a short
/// frame, or a checksum mismatch.
fn read_frame(reader: &mut impl Read) -> io::Result<Option<Vec<u8>>> {
    let mut len_buf = [0u8; 4];
    if !read_or_eof(reader, &mut len_buf)? {
        return Ok(None);
    }
    let mut payload = vec![0u8; u32::from_le_bytes(len_buf) as usize];
    if !read_or_eof(reader, &mut payload)? {
        return Ok(None);
    }
    let mut crc_buf = [0u8; 4];
    if !read_or_eof(reader, &mut crc_buf)? {
        return Ok(None);
    }
    if u32::from_le_bytes(crc_buf) != crc32fast::hash(&payload) {
        return Ok(None);
    }
    Ok(Some(payload))
}

fn read_or_eof(reader: &mut impl Read, buf: &mut [u8]) -> io::Result<bool> {
    match reader.read_exact(buf) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => Ok(false),
        Err(e) => Err(e),
    }
}

/// Append-only log of booking events.
///
/// Format per entry: `[u32: len][bincode: Event][u32: crc32]`, little-endian.
/// A torn or corrupt tail (crash mid-write) ends replay at the last good entry.
pub struct Wal {
    writer: BufWriter<File>,
    path: PathBuf,
    appends_since_compact: u64,
    #[cfg(test)]
    fail_after: Option<u64>,
}

/// Exclusive ownership of a WAL, held through an OS lock on `<wal>.lock`.
/// Released when dropped or when the process exits.
#[derive(Debug)]
pub struct WalLock {
    _file: File,
}

impl WalLock {
    /// Fails fast with `WouldBlock` when another engine already owns `wal_path`.
    pub fn acquire(wal_path: &Path) -> io::Result<Self> {
        ensure_parent(wal_path)?;
        let lock_path = wal_path.with_extension("lock");
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&lock_path)?;
        match file.try_lock() {
            Ok(()) => Ok(Self { _file: file }),
            Err(fs::TryLockError::WouldBlock) => Err(io::Error::new(
                io::ErrorKind::WouldBlock,
                format!("{} is owned by another engine", wal_path.display()),
            )),
            Err(fs::TryLockError::Error(e)) => Err(e),
        }
    }
}

fn ensure_parent(path: &Path) -> io::Result<()> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        fs::create_dir_all(parent)?;
    }
    Ok(())
}

impl Wal {
    pub fn open(path: &Path) -> io::Result<Self> {
        ensure_parent(path)?;
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            writer: BufWriter::new(file),
            path: path.to_path_buf(),
            appends_since_compact: 0,
            #[cfg(test)]
            fail_after: None,
        })
    }

    /// Let `n` more appends through, then fail every append after that.
    #[cfg(test)]
    pub fn fail_appends_after(&mut self, n: Option<u64>) {
        self.fail_after = n;
    }

    #[cfg(test)]
    pub fn append(&mut self, event: &Event) -> io::Result<()> {
        self.append_buffered(event)?;
        self.flush_sync()
    }

    /// Buffer one event. Nothing is durable until `flush_sync`.
    pub fn append_buffered(&mut self, event: &Event) -> io::Result<()> {
        #[cfg(test)]
        match self.fail_after {
            Some(0) => return Err(io::Error::other("injected append failure")),
            Some(n) => self.fail_after = Some(n - 1),
            None => {}
        }
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

    /// Write the snapshot events to `<wal>.tmp` and fsync.
    pub fn write_compact_file(path: &Path, events: &[Event]) -> io::Result<()> {
        let mut writer = BufWriter::new(File::create(path.with_extension("wal.tmp"))?);
        for event in events {
            encode_event(&mut writer, event)?;
        }
        writer.flush()?;
        writer.get_ref().sync_all()
    }

    /// Rename the snapshot over the live log and reopen for appends.
    pub fn swap_compact_file(&mut self) -> io::Result<()> {
        fs::rename(self.path.with_extension("wal.tmp"), &self.path)?;
        let file = OpenOptions::new().create(true).append(true).open(&self.path)?;
        self.writer = BufWriter::new(file);
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

    /// All intact events in file order. A missing file is an empty log.
    pub fn replay(path: &Path) -> io::Result<Vec<Event>> {
        Ok(Self::scan(path)?.0)
    }

    /// Replay, then cut any torn or corrupt tail off the file so later appends
    /// land directly after the last intact entry.
    pub fn recover(path: &Path) -> io::Result<Vec<Event>> {
        let (events, intact_len) = Self::scan(path)?;
        let file = match OpenOptions::new().write(true).open(path) {
            Ok(f) => f,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(events),
            Err(e) => return Err(e),
        };
        let len = file.metadata()?.len();
        if len > intact_len {
            tracing::warn!(
                "discarding {} bytes of torn wal tail in {}",
                len - intact_len,
                path.display()
            );
            file.set_len(intact_len)?;
            file.sync_all()?;
        }
        Ok(events)
    }

    /// Intact events plus the byte length they occupy.
    fn scan(path: &Path) -> io::Result<(Vec<Event>, u64)> {
        let file = match File::open(path) {
            Ok(f) => f,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok((Vec::new(), 0)),
            Err(e) => return Err(e),
        };
        let mut reader = BufReader::new(file);
        let mut events = Vec::new();
        let mut intact_len = 0u64;
        while let Some(payload) = read_frame(&mut reader)? {
            match bincode::deserialize::<Event>(&payload) {
                Ok(event) => {
                    events.push(event);
                    intact_len += (payload.len() + 8) as u64;
                }
                Err(e) => {
                    tracing::warn!("wal replay stopped at undecodable entry: {e}");
                    break;
                }
            }
        }
        Ok((events, intact_len))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::*;
    use crate::time;
    use chrono::{NaiveDate, Weekday};
    use ulid::Ulid;

    fn tmp_path(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join("gymbook_test_wal");
        fs::create_dir_all(&dir).unwrap();
        let path = dir.join(name);
        let _ = fs::remove_file(&path);
        path
    }

    fn day_off(trainer_id: Ulid) -> Event {
        Event::DayOffSet {
            trainer_id,
            weekday: Weekday::Sun,
            is_day_off: true,
        }
    }

    fn created(trainer_id: Ulid) -> Event {
        let d = NaiveDate::from_ymd_opt(2025, 12, 20).unwrap();
        Event::BookingCreated {
            booking: Booking {
                id: Ulid::new(),
                user_id: Ulid::new(),
                trainer_id,
                class_type: ClassType::Boxing,
                span: Span::new(time::at(d, time::clock(8, 0)), time::at(d, time::clock(9, 0))),
                status: BookingStatus::Confirmed,
                buffer_minutes: 10,
                session: None,
                booked_at: 0,
                unavailable_marked_at: None,
                cancelled_at: None,
            },
        }
    }

    #[test]
    fn append_and_replay() {
        let path = tmp_path("append_and_replay.wal");
        let tid = Ulid::new();
        let events = vec![day_off(tid), created(tid)];

        {
            let mut wal = Wal::open(&path).unwrap();
            for e in &events {
                wal.append(e).unwrap();
            }
        }

        assert_eq!(Wal::replay(&path).unwrap(), events);
        let _ = fs::remove_file(&path);
    }

    #[test]
    fn replay_handles_truncation() {
        let path = tmp_path("truncation.wal");
        let event = created(Ulid::new());

        {
            let mut wal = Wal::open(&path).unwrap();
            wal.append(&event).unwrap();
        }
        // Half a frame after the good one
        {
            let mut f = OpenOptions::new().append(true).open(&path).unwrap();
            f.write_all(&[9u8, 0, 0, 0, 1, 2]).unwrap();
        }

        assert_eq!(Wal::replay(&path).unwrap(), vec![event]);
        let _ = fs::remove_file(&path);
    }

    #[test]
    fn appends_after_recovery_survive_the_next_restart() {
        let path = tmp_path("recover_torn_tail.wal");
        let first = created(Ulid::new());
        let second = day_off(Ulid::new());
        {
            let mut wal = Wal::open(&path).unwrap();
            wal.append(&first).unwrap();
        }
        let intact = fs::metadata(&path).unwrap().len();
        {
            let mut f = OpenOptions::new().append(true).open(&path).unwrap();
            f.write_all(&[9u8, 0, 0, 0, 1, 2]).unwrap();
        }

        assert_eq!(Wal::recover(&path).unwrap(), vec![first.clone()]);
        assert_eq!(fs::metadata(&path).unwrap().len(), intact);
        {
            let mut wal = Wal::open(&path).unwrap();
            wal.append(&second).unwrap();
        }
        assert_eq!(Wal::replay(&path).unwrap(), vec![first, second]);
        let _ = fs::remove_file(&path);
    }

    #[test]
    fn recover_leaves_clean_log_alone() {
        let path = tmp_path("recover_clean.wal");
        assert!(Wal::recover(&path).unwrap().is_empty());
        assert!(!path.exists());

        let event = day_off(Ulid::new());
        {
            let mut wal = Wal::open(&path).unwrap();
            wal.append(&event).unwrap();
        }
        let len = fs::metadata(&path).unwrap().len();
        assert_eq!(Wal::recover(&path).unwrap(), vec![event]);
        assert_eq!(fs::metadata(&path).unwrap().len(), len);
        let _ = fs::remove_file(&path);
    }

    #[test]
    fn second_owner_is_refused_until_the_first_lets_go() {
        let path = tmp_path("owned.wal");
        let owner = WalLock::acquire(&path).unwrap();
        let err = WalLock::acquire(&path).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::WouldBlock);
        assert!(err.to_string().contains("owned by another engine"));

        drop(owner);
        assert!(WalLock::acquire(&path).is_ok());
    }

    #[test]
    fn injected_failure_stops_appends() {
        let path = tmp_path("injected.wal");
        let event = day_off(Ulid::new());
        let mut wal = Wal::open(&path).unwrap();
        wal.fail_appends_after(Some(1));
        wal.append(&event).unwrap();
        assert!(wal.append(&event).is_err());
        wal.fail_appends_after(None);
        wal.append(&event).unwrap();
        assert_eq!(Wal::replay(&path).unwrap().len(), 2);
        let _ = fs::remove_file(&path);
    }

    #[test]
    fn replay_nonexistent_file() {
        let path = tmp_path("nonexistent.wal");
        assert!(Wal::replay(&path).unwrap().is_empty());
    }

    #[test]
    fn replay_stops_at_corrupt_crc() {
        let path = tmp_path("corrupt_crc.wal");
        let good = day_off(Ulid::new());
        {
            let mut wal = Wal::open(&path).unwrap();
            wal.append(&good).unwrap();
        }
        {
            let payload = bincode::serialize(&created(Ulid::new())).unwrap();
            let mut f = OpenOptions::new().append(true).open(&path).unwrap();
            f.write_all(&(payload.len() as u32).to_le_bytes()).unwrap();
            f.write_all(&payload).unwrap();
            f.write_all(&0xDEADBEEFu32.to_le_bytes()).unwrap();
        }
        // A good frame after the corrupt one is not reached either
        {
            let mut wal = Wal::open(&path).unwrap();
            wal.append(&good).unwrap();
        }

        assert_eq!(Wal::replay(&path).unwrap(), vec![good]);
        let _ = fs::remove_file(&path);
    }

    #[test]
    fn compact_then_append() {
        let path = tmp_path("compact_append.wal");
        let tid = Ulid::new();

        let mut wal = Wal::open(&path).unwrap();
        for _ in 0..20 {
            wal.append(&created(tid)).unwrap();
        }
        let before = fs::metadata(&path).unwrap().len();

        let snapshot = vec![day_off(tid)];
        wal.compact(&snapshot).unwrap();
        assert_eq!(wal.appends_since_compact(), 0);
        assert!(fs::metadata(&path).unwrap().len() < before);

        let later = created(tid);
        wal.append(&later).unwrap();
        drop(wal);

        assert_eq!(Wal::replay(&path).unwrap(), vec![snapshot[0].clone(), later]);
        let _ = fs::remove_file(&path);
    }

    #[test]
    fn buffered_appends_are_counted() {
        let path = tmp_path("buffered_flush.wal");
        let tid = Ulid::new();
        let events: Vec<Event> = (0..5).map(|_| created(tid)).collect();

        {
            let mut wal = Wal::open(&path).unwrap();
            for e in &events {
                wal.append_buffered(e).unwrap();
            }
            assert_eq!(wal.appends_since_compact(), 5);
            wal.flush_sync().unwrap();
        }

        assert_eq!(Wal::replay(&path).unwrap(), events);
        let _ = fs::remove_file(&path);
    }
}
