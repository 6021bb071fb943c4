use crate::error::{ProximityError, Result};
use crate::types::{Business, BusinessId};
use bytes::{BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::{BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

const TAG_PUT: u8 = 0;
const TAG_DELETE: u8 = 1;
const TAG_PUT_BATCH: u8 = 2;

/// How often appended records are fsynced
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncPolicy {
    /// Leave syncing to the OS
    Never,
    /// At most one fsync per second
    #[default]
    EverySecond,
    /// fsync after every record
    Always,
}

/// AOF configuration
#[derive(Debug, Clone)]
pub struct AofConfig {
    pub sync_policy: SyncPolicy,
    /// Compaction is suggested once the file grows past this many bytes
    pub rewrite_size_threshold: u64,
}

impl Default for AofConfig {
    fn default() -> Self {
        Self {
            sync_policy: SyncPolicy::EverySecond,
            rewrite_size_threshold: 64 * 1024 * 1024, // 64MB
        }
    }
}

/// Append-only log of store mutations
pub struct AofFile {
    file: File,
    writer: BufWriter<File>,
    path: PathBuf,
    size: u64,
    config: AofConfig,
    last_sync: Instant,
}

#[derive(Debug, Clone, PartialEq)]
pub enum AofCommand {
    Put(Business),
    Delete { id: BusinessId },
    PutBatch(Vec<Business>),
}

impl AofFile {
    /// Open AOF file with default configuration
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        Self::open_with_config(path, AofConfig::default())
    }

    /// Open AOF file with custom configuration
    pub fn open_with_config<P: AsRef<Path>>(path: P, config: AofConfig) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .read(true)
            .open(&path)?;

        let size = file.metadata()?.len();
        let writer = BufWriter::new(file.try_clone()?);

        Ok(AofFile {
            file,
            writer,
            path,
            size,
            config,
            last_sync: Instant::now(),
        })
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Whether the log has outgrown its rewrite threshold
    pub fn needs_rewrite(&self) -> bool {
        self.size >= self.config.rewrite_size_threshold
    }

    pub fn write_put(&mut self, business: &Business) -> Result<()> {
        self.write_command(&AofCommand::Put(business.clone()))
    }

    pub fn write_delete(&mut self, id: &BusinessId) -> Result<()> {
        self.write_command(&AofCommand::Delete { id: *id })
    }

    pub fn write_put_batch(&mut self, businesses: &[Business]) -> Result<()> {
        self.write_command(&AofCommand::PutBatch(businesses.to_vec()))
    }

    /// Append a command and apply the sync policy
    pub fn write_command(&mut self, command: &AofCommand) -> Result<()> {
        let record = Self::serialize_command(command)?;
        self.writer.write_all(&record)?;
        self.size += record.len() as u64;

        match self.config.sync_policy {
            SyncPolicy::Always => self.sync()?,
            SyncPolicy::EverySecond if self.last_sync.elapsed() >= Duration::from_secs(1) => {
                self.sync()?
            }
            SyncPolicy::EverySecond | SyncPolicy::Never => self.writer.flush()?,
        }
        Ok(())
    }

    /// Tag byte, u32 payload length, bincode payload
    fn serialize_command(command: &AofCommand) -> Result<Bytes> {
        let (tag, payload) = match command {
            AofCommand::Put(business) => (TAG_PUT, bincode::serialize(business)?),
            AofCommand::Delete { id } => (TAG_DELETE, bincode::serialize(id)?),
            AofCommand::PutBatch(businesses) => (TAG_PUT_BATCH, bincode::serialize(businesses)?),
        };
        let len = u32::try_from(payload.len())
            .map_err(|_| ProximityError::Serialization("record exceeds 4 GiB".into()))?;

        let mut buf = BytesMut::with_capacity(5 + payload.len());
        buf.put_u8(tag);
        buf.put_u32(len);
        buf.put_slice(&payload);
        Ok(buf.freeze())
    }

    /// Replay every complete record.
    ///
    /// A torn record at the tail (a crash mid-append) ends the replay and is
    /// cut from the file so later appends start on a record boundary.
    pub fn replay(&mut self) -> Result<Vec<AofCommand>> {
        self.writer.flush()?;
        self.file.seek(SeekFrom::Start(0))?;
        let mut reader = BufReader::new(&mut self.file);
        let mut commands = Vec::new();
        let mut offset = 0u64;

        loop {
            match Self::read_record(&mut reader) {
                Ok((command, len)) => {
                    commands.push(command);
                    offset += len;
                }
                Err(ProximityError::UnexpectedEof) => break,
                Err(e) => return Err(e),
            }
        }

        if offset < self.size {
            warn!(
                path = %self.path.display(),
                dropped_bytes = self.size - offset,
                "truncating torn record at end of AOF"
            );
            self.file.set_len(offset)?;
            self.size = offset;
        }

        debug!(records = commands.len(), "replayed AOF");
        Ok(commands)
    }

    fn read_record(reader: &mut impl Read) -> Result<(AofCommand, u64)> {
        let mut header = [0u8; 5];
        reader
            .read_exact(&mut header)
            .map_err(|_| ProximityError::UnexpectedEof)?;
        let tag = header[0];
        let len = u32::from_be_bytes([header[1], header[2], header[3], header[4]]) as usize;

        let mut payload = vec![0u8; len];
        reader
            .read_exact(&mut payload)
            .map_err(|_| ProximityError::UnexpectedEof)?;

        let command = match tag {
            TAG_PUT => AofCommand::Put(decode(&payload)?),
            TAG_DELETE => AofCommand::Delete {
                id: decode(&payload)?,
            },
            TAG_PUT_BATCH => AofCommand::PutBatch(decode(&payload)?),
            other => {
                return Err(ProximityError::Serialization(format!(
                    "unknown AOF record tag {}",
                    other
                )));
            }
        };
        Ok((command, 5 + len as u64))
    }

    /// Rewrite the log as one `Put` per live record.
    pub fn rewrite<'a>(&mut self, live: impl IntoIterator<Item = &'a Business>) -> Result<()> {
        self.writer.flush()?;

        let rewrite_path = self.path.with_extension("aof.rewrite");
        let _ = std::fs::remove_file(&rewrite_path);
        let mut rewrite_file = Self::open_with_config(
            &rewrite_path,
            AofConfig {
                sync_policy: SyncPolicy::Never,
                ..self.config.clone()
            },
        )?;
        for business in live {
            rewrite_file.write_put(business)?;
        }
        rewrite_file.sync()?;
        drop(rewrite_file);

        std::fs::rename(&rewrite_path, &self.path)?;

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .read(true)
            .open(&self.path)?;
        let before = self.size;
        self.size = file.metadata()?.len();
        self.writer = BufWriter::new(file.try_clone()?);
        self.file = file;
        self.last_sync = Instant::now();

        info!(before, after = self.size, "rewrote AOF");
        Ok(())
    }

    pub fn flush(&mut self) -> Result<()> {
        self.writer.flush()?;
        Ok(())
    }

    /// Flush and sync to disk
    pub fn sync(&mut self) -> Result<()> {
        self.writer.flush()?;
        self.file.sync_all()?;
        self.last_sync = Instant::now();
        Ok(())
    }
}

impl Drop for AofFile {
    fn drop(&mut self) {
        // Best effort flush on drop, ignore errors
        let _ = self.writer.flush();
    }
}

fn decode<T: serde::de::DeserializeOwned>(payload: &[u8]) -> Result<T> {
    bincode::deserialize(payload).map_err(|e| ProximityError::Serialization(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{BusinessDraft, Category};
    use chrono::Utc;
    use tempfile::NamedTempFile;

    fn business(name: &str) -> Business {
        Business::create(
            BusinessId::new(),
            BusinessDraft::new(name, "Seoul", 37.5, 127.0, Category::Cafe).with_phone("02-123-4567"),
            Utc::now(),
        )
    }

    #[test]
    fn test_aof_creation() {
        let temp_file = NamedTempFile::new().unwrap();
        let aof = AofFile::open(temp_file.path()).unwrap();
        assert_eq!(aof.size(), 0);
    }

    #[test]
    fn test_command_replay() {
        let temp_file = NamedTempFile::new().unwrap();
        let mut aof = AofFile::open(temp_file.path()).unwrap();

        let first = business("first");
        let batch = vec![business("a"), business("b")];
        aof.write_put(&first).unwrap();
        aof.write_put_batch(&batch).unwrap();
        aof.write_delete(&first.id).unwrap();
        aof.flush().unwrap();

        let commands = aof.replay().unwrap();
        assert_eq!(
            commands,
            vec![
                AofCommand::Put(first.clone()),
                AofCommand::PutBatch(batch),
                AofCommand::Delete { id: first.id },
            ]
        );
    }

    #[test]
    fn test_torn_tail_is_truncated() {
        let temp_file = NamedTempFile::new().unwrap();
        let kept = business("kept");
        {
            let mut aof = AofFile::open(temp_file.path()).unwrap();
            aof.write_put(&kept).unwrap();
            aof.write_put(&business("torn")).unwrap();
            aof.sync().unwrap();
        }
        let full = std::fs::metadata(temp_file.path()).unwrap().len();
        OpenOptions::new()
            .write(true)
            .open(temp_file.path())
            .unwrap()
            .set_len(full - 3)
            .unwrap();

        let mut aof = AofFile::open(temp_file.path()).unwrap();
        let commands = aof.replay().unwrap();
        assert_eq!(commands, vec![AofCommand::Put(kept)]);
        assert!(aof.size() < full - 3);
    }

    #[test]
    fn test_rewrite_keeps_only_live_records() {
        let temp_file = NamedTempFile::new().unwrap();
        let mut aof = AofFile::open(temp_file.path()).unwrap();

        let live = business("live");
        for _ in 0..20 {
            let gone = business("gone");
            aof.write_put(&gone).unwrap();
            aof.write_delete(&gone.id).unwrap();
        }
        aof.write_put(&live).unwrap();
        let before = aof.size();

        aof.rewrite([&live]).unwrap();
        assert!(aof.size() < before);

        let mut reopened = AofFile::open(temp_file.path()).unwrap();
        assert_eq!(reopened.replay().unwrap(), vec![AofCommand::Put(live)]);
    }

    #[test]
    fn test_rewrite_threshold() {
        let temp_file = NamedTempFile::new().unwrap();
        let config = AofConfig {
            sync_policy: SyncPolicy::Never,
            rewrite_size_threshold: 100,
        };
        let mut aof = AofFile::open_with_config(temp_file.path(), config).unwrap();
        assert!(!aof.needs_rewrite());
        for i in 0..5 {
            aof.write_put(&business(&format!("b{}", i))).unwrap();
        }
        assert!(aof.needs_rewrite());
    }
}
