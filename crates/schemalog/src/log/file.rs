//! File-backed commit log
//!
//! One append-only segment. Each record is framed as
//!
//! ```text
//! [crc32: u32][len: u32][payload: len bytes]
//! payload = [timestamp: i64][key_len: i32, -1 for none][key][value]
//! ```
//!
//! all big-endian, with the CRC covering the payload. On open the file is
//! scanned: a torn final frame (short, or failing its CRC) is truncated, a
//! bad frame anywhere before the tail is corruption.

use super::{now_millis, CommitLog, LogRecord, MemoryLog};
use crate::error::{SchemaError, SchemaResult};
use async_trait::async_trait;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use crc32fast::Hasher;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{info, warn};

/// Frame header: crc(4) + len(4)
const FRAME_HEADER_SIZE: usize = 8;

/// Payload header: timestamp(8) + key_len(4)
const PAYLOAD_HEADER_SIZE: usize = 12;

pub struct FileLog {
    path: PathBuf,
    /// Every record in the file; reads are served from here
    cache: MemoryLog,
    file: Mutex<File>,
    sync_on_append: bool,
}

impl FileLog {
    /// Open or create the log at `path`, recovering existing records
    pub async fn open(
        path: impl AsRef<Path>,
        topic: impl Into<String>,
        sync_on_append: bool,
    ) -> SchemaResult<Self> {
        let path = path.as_ref().to_path_buf();
        let cache = MemoryLog::new(topic);

        let data = match tokio::fs::read(&path).await {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Vec::new(),
            Err(e) => return Err(e.into()),
        };

        let valid_len = recover(&data, &cache)?;
        if valid_len < data.len() {
            warn!(
                path = %path.display(),
                valid_bytes = valid_len,
                dropped_bytes = data.len() - valid_len,
                "Truncating torn tail of log file"
            );
            let file = OpenOptions::new().write(true).open(&path).await?;
            file.set_len(valid_len as u64).await?;
            file.sync_all().await?;
        }

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await?;

        info!(
            path = %path.display(),
            records = cache.len(),
            "Opened file log"
        );

        Ok(Self {
            path,
            cache,
            file: Mutex::new(file),
            sync_on_append,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Load every intact frame into `cache`; returns the length of the intact prefix
fn recover(data: &[u8], cache: &MemoryLog) -> SchemaResult<usize> {
    let mut pos = 0;
    while pos < data.len() {
        let offset = cache.len() as u64;
        let remaining = &data[pos..];
        if remaining.len() < FRAME_HEADER_SIZE {
            break;
        }
        let mut header = &remaining[..FRAME_HEADER_SIZE];
        let stored_crc = header.get_u32();
        let len = header.get_u32() as usize;
        let frame_end = FRAME_HEADER_SIZE + len;
        if remaining.len() < frame_end {
            break;
        }

        let payload = &remaining[FRAME_HEADER_SIZE..frame_end];
        let mut hasher = Hasher::new();
        hasher.update(payload);
        if hasher.finalize() != stored_crc {
            if frame_end == remaining.len() {
                break;
            }
            return Err(SchemaError::LogCorruption {
                offset,
                reason: format!("CRC mismatch at byte {}", pos),
            });
        }

        let (timestamp, key, value) = decode_payload(payload).ok_or(SchemaError::LogCorruption {
            offset,
            reason: format!("malformed frame payload at byte {}", pos),
        })?;
        cache.push(timestamp, key, value);
        pos += frame_end;
    }
    Ok(pos)
}

fn encode_frame(timestamp: i64, key: Option<&Bytes>, value: &Bytes) -> Bytes {
    let key_len = key.map(|k| k.len()).unwrap_or(0);
    let mut payload = BytesMut::with_capacity(PAYLOAD_HEADER_SIZE + key_len + value.len());
    payload.put_i64(timestamp);
    match key {
        Some(key) => {
            payload.put_i32(key.len() as i32);
            payload.extend_from_slice(key);
        }
        None => payload.put_i32(-1),
    }
    payload.extend_from_slice(value);

    let mut hasher = Hasher::new();
    hasher.update(&payload);
    let crc = hasher.finalize();

    let mut frame = BytesMut::with_capacity(FRAME_HEADER_SIZE + payload.len());
    frame.put_u32(crc);
    frame.put_u32(payload.len() as u32);
    frame.extend_from_slice(&payload);
    frame.freeze()
}

fn decode_payload(mut payload: &[u8]) -> Option<(i64, Option<Bytes>, Bytes)> {
    if payload.len() < PAYLOAD_HEADER_SIZE {
        return None;
    }
    let timestamp = payload.get_i64();
    let key_len = payload.get_i32();
    let key = match key_len {
        -1 => None,
        n if n >= 0 && (n as usize) <= payload.len() => {
            let key = Bytes::copy_from_slice(&payload[..n as usize]);
            payload.advance(n as usize);
            Some(key)
        }
        _ => return None,
    };
    Some((timestamp, key, Bytes::copy_from_slice(payload)))
}

#[async_trait]
impl CommitLog for FileLog {
    fn topic(&self) -> &str {
        self.cache.topic()
    }

    async fn append(&self, key: Option<Bytes>, value: Bytes) -> SchemaResult<u64> {
        let timestamp = now_millis();
        let frame = encode_frame(timestamp, key.as_ref(), &value);

        // Held until the cache is updated so file order matches offset order
        let mut file = self.file.lock().await;
        file.write_all(&frame)
            .await
            .map_err(|e| SchemaError::Log(format!("{}: append failed: {}", self.path.display(), e)))?;
        if self.sync_on_append {
            file.sync_data()
                .await
                .map_err(|e| SchemaError::Log(format!("{}: sync failed: {}", self.path.display(), e)))?;
        }
        Ok(self.cache.push(timestamp, key, value))
    }

    async fn read(&self, from: u64, max_records: usize, max_wait: Duration) -> SchemaResult<Vec<LogRecord>> {
        self.cache.read(from, max_records, max_wait).await
    }

    async fn high_watermark(&self) -> SchemaResult<u64> {
        self.cache.high_watermark().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_records_survive_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("_schemas.log");
        {
            let log = FileLog::open(&path, "_schemas", true).await.unwrap();
            log.append(Some(Bytes::from("k1")), Bytes::from("v1")).await.unwrap();
            log.append(None, Bytes::from("v2")).await.unwrap();
        }

        let log = FileLog::open(&path, "_schemas", true).await.unwrap();
        assert_eq!(log.high_watermark().await.unwrap(), 2);
        let records = log.read(0, 10, Duration::ZERO).await.unwrap();
        assert_eq!(records[0].key, Some(Bytes::from("k1")));
        assert_eq!(records[0].value, Bytes::from("v1"));
        assert_eq!(records[1].key, None);
        assert_eq!(records[1].offset, 1);

        assert_eq!(log.append(None, Bytes::from("v3")).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_torn_tail_is_truncated() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("_schemas.log");
        {
            let log = FileLog::open(&path, "_schemas", false).await.unwrap();
            log.append(None, Bytes::from("intact")).await.unwrap();
        }
        let intact_len = std::fs::metadata(&path).unwrap().len();

        // half-written second frame
        let partial = encode_frame(0, None, &Bytes::from("torn-record"));
        let mut data = std::fs::read(&path).unwrap();
        data.extend_from_slice(&partial[..partial.len() - 4]);
        std::fs::write(&path, &data).unwrap();

        let log = FileLog::open(&path, "_schemas", false).await.unwrap();
        assert_eq!(log.high_watermark().await.unwrap(), 1);
        assert_eq!(std::fs::metadata(&path).unwrap().len(), intact_len);

        assert_eq!(log.append(None, Bytes::from("next")).await.unwrap(), 1);
        drop(log);
        let log = FileLog::open(&path, "_schemas", false).await.unwrap();
        assert_eq!(log.high_watermark().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_corrupt_frame_before_tail_is_fatal() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("_schemas.log");
        {
            let log = FileLog::open(&path, "_schemas", false).await.unwrap();
            log.append(None, Bytes::from("first")).await.unwrap();
            log.append(None, Bytes::from("second")).await.unwrap();
        }

        let mut data = std::fs::read(&path).unwrap();
        // flip a byte inside the first payload
        data[FRAME_HEADER_SIZE + PAYLOAD_HEADER_SIZE] ^= 0xff;
        std::fs::write(&path, &data).unwrap();

        let err = FileLog::open(&path, "_schemas", false).await.err().unwrap();
        assert!(matches!(err, SchemaError::LogCorruption { offset: 0, .. }), "{:?}", err);
    }

    #[test]
    fn test_payload_round_trip() {
        let frame = encode_frame(42, Some(&Bytes::from("key")), &Bytes::from("value"));
        let payload = &frame[FRAME_HEADER_SIZE..];
        let (ts, key, value) = decode_payload(payload).unwrap();
        assert_eq!(ts, 42);
        assert_eq!(key, Some(Bytes::from("key")));
        assert_eq!(value, Bytes::from("value"));
    }
}
