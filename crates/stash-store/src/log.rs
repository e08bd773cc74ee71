use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{StoreError, StoreResult};
use crate::schema::TableSchema;
use crate::table::{Mutation, Tables};

/// A single logged operation.
///
/// Record bodies are carried as JSON text so the frame itself can use a
/// compact non-self-describing encoding.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum LogOp {
    CreateTable(TableSchema),
    Put {
        table: String,
        key: String,
        record: String,
    },
    Delete {
        table: String,
        key: String,
    },
    Clear {
        table: String,
    },
}

/// One committed transaction (or one compaction snapshot).
///
/// On-disk format:
/// ```text
/// [4 bytes: payload length (little-endian u32)]
/// [4 bytes: CRC32 of payload (little-endian u32)]
/// [N bytes: payload (bincode-serialized LogFrame)]
/// ```
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogFrame {
    pub ops: Vec<LogOp>,
}

impl LogFrame {
    /// Encode a committed batch.
    pub fn from_mutations(batch: &[Mutation]) -> StoreResult<Self> {
        let ops = batch
            .iter()
            .map(|m| -> StoreResult<LogOp> {
                Ok(match m {
                    Mutation::Put { table, key, record } => LogOp::Put {
                        table: table.clone(),
                        key: key.clone(),
                        record: serde_json::to_string(record)
                            .map_err(|e| StoreError::Serialization(e.to_string()))?,
                    },
                    Mutation::Delete { table, key } => LogOp::Delete {
                        table: table.clone(),
                        key: key.clone(),
                    },
                    Mutation::Clear { table } => LogOp::Clear {
                        table: table.clone(),
                    },
                })
            })
            .collect::<StoreResult<Vec<LogOp>>>()?;
        Ok(Self { ops })
    }

    /// A frame that recreates `tables` from scratch.
    pub fn snapshot(tables: &Tables) -> StoreResult<Self> {
        let mut ops = Vec::new();
        for schema in tables.schemas() {
            ops.push(LogOp::CreateTable(schema.clone()));
            for (key, record) in tables.rows(&schema.name)? {
                ops.push(LogOp::Put {
                    table: schema.name.clone(),
                    key: key.clone(),
                    record: serde_json::to_string(record)
                        .map_err(|e| StoreError::Serialization(e.to_string()))?,
                });
            }
        }
        Ok(Self { ops })
    }

    /// Replay this frame onto `tables`.
    pub fn apply_to(&self, tables: &mut Tables) -> StoreResult<()> {
        let mut batch = Vec::with_capacity(self.ops.len());
        for op in &self.ops {
            match op {
                LogOp::CreateTable(schema) => {
                    // Flush what came before so creation order is preserved.
                    tables.apply_batch(&batch)?;
                    batch.clear();
                    tables.create(schema.clone());
                }
                LogOp::Put { table, key, record } => batch.push(Mutation::Put {
                    table: table.clone(),
                    key: key.clone(),
                    record: serde_json::from_str(record)
                        .map_err(|e| StoreError::Serialization(e.to_string()))?,
                }),
                LogOp::Delete { table, key } => batch.push(Mutation::Delete {
                    table: table.clone(),
                    key: key.clone(),
                }),
                LogOp::Clear { table } => batch.push(Mutation::Clear {
                    table: table.clone(),
                }),
            }
        }
        tables.apply_batch(&batch)
    }
}

/// Flush/sync strategy for the log.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncMode {
    /// `fsync` after every commit (safest, highest latency).
    EveryWrite,
    /// Rely on OS page-cache buffering (fastest, least durable).
    #[default]
    OsDefault,
}

/// Configuration for the mutation log.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogConfig {
    /// Sync strategy applied after each appended frame.
    #[serde(default)]
    pub sync_mode: SyncMode,
}

/// Header size: 4 bytes length + 4 bytes CRC.
const HEADER_SIZE: usize = 8;

struct LogWriter {
    writer: BufWriter<File>,
    /// Current write offset in the log file.
    offset: u64,
}

/// Crash-recoverable, append-only mutation log.
///
/// Frames are serialized with bincode, prefixed with a length and a CRC32
/// checksum, and appended to a single file. On recovery the file is read
/// front-to-back; frames that fail the CRC check are skipped and a torn tail
/// ends recovery.
pub struct MutationLog {
    path: PathBuf,
    writer: Mutex<LogWriter>,
    config: LogConfig,
}

impl MutationLog {
    /// Open (or create) the log file at `path`.
    pub fn open(path: &Path, config: LogConfig) -> StoreResult<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .append(true)
            .open(path)?;

        let offset = file.metadata()?.len();
        Ok(Self {
            path: path.to_path_buf(),
            writer: Mutex::new(LogWriter {
                writer: BufWriter::new(file),
                offset,
            }),
            config,
        })
    }

    /// Append a frame. Returns the byte offset it was written at.
    pub fn append(&self, frame: &LogFrame) -> StoreResult<u64> {
        let payload = encode(frame)?;
        let mut w = self.writer.lock().expect("log mutex poisoned");
        let frame_offset = w.offset;

        write_frame(&mut w.writer, &payload)?;
        w.writer.flush()?;
        if self.config.sync_mode == SyncMode::EveryWrite {
            w.writer.get_ref().sync_all()?;
        }

        w.offset += (HEADER_SIZE + payload.len()) as u64;
        debug!(offset = frame_offset, len = payload.len(), ops = frame.ops.len(), "log append");
        Ok(frame_offset)
    }

    /// Read back every intact frame.
    ///
    /// A torn tail is cut off the file so later appends start on a frame
    /// boundary.
    pub fn recover(&self) -> StoreResult<Vec<LogFrame>> {
        let (frames, valid_len) = self.read_frames()?;
        let mut w = self.writer.lock().expect("log mutex poisoned");
        if valid_len < w.offset {
            warn!(valid_len, file_len = w.offset, "truncating torn log tail");
            w.writer.flush()?;
            w.writer.get_ref().set_len(valid_len)?;
            w.offset = valid_len;
        }
        Ok(frames)
    }

    /// Frames up to the first torn one, and the byte length they cover.
    fn read_frames(&self) -> StoreResult<(Vec<LogFrame>, u64)> {
        let mut file = BufReader::new(File::open(&self.path)?);
        let file_len = file.get_ref().metadata()?.len();
        let mut frames = Vec::new();
        let mut offset: u64 = 0;

        while offset + HEADER_SIZE as u64 <= file_len {
            file.seek(SeekFrom::Start(offset))?;

            let mut header = [0u8; HEADER_SIZE];
            match file.read_exact(&mut header) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => break,
                Err(e) => return Err(e.into()),
            }

            let length = u32::from_le_bytes([header[0], header[1], header[2], header[3]]);
            let expected_crc = u32::from_le_bytes([header[4], header[5], header[6], header[7]]);

            if length == 0 || offset + HEADER_SIZE as u64 + length as u64 > file_len {
                warn!(offset, length, file_len, "invalid frame length; stopping recovery");
                break;
            }

            let mut payload = vec![0u8; length as usize];
            match file.read_exact(&mut payload) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => {
                    warn!(offset, "truncated frame; stopping recovery");
                    break;
                }
                Err(e) => return Err(e.into()),
            }

            let actual_crc = crc32fast::hash(&payload);
            if actual_crc != expected_crc {
                warn!(offset, expected = expected_crc, actual = actual_crc, "CRC mismatch; skipping frame");
            } else {
                match bincode::deserialize::<LogFrame>(&payload) {
                    Ok(frame) => frames.push(frame),
                    Err(e) => warn!(offset, error = %e, "undecodable frame; skipping"),
                }
            }

            offset += HEADER_SIZE as u64 + length as u64;
        }

        debug!(recovered = frames.len(), valid_len = offset, "log recovery complete");
        Ok((frames, offset))
    }

    /// Replace the whole log with `frames`.
    ///
    /// The new contents are written to a sibling temporary file, synced, and
    /// renamed over the log, so a crash leaves either the old or the new log.
    pub fn rewrite(&self, frames: &[LogFrame]) -> StoreResult<()> {
        let mut w = self.writer.lock().expect("log mutex poisoned");
        w.writer.flush()?;

        let tmp_path = self.path.with_extension("compact");
        let mut written: u64 = 0;
        {
            let tmp = OpenOptions::new()
                .create(true)
                .write(true)
                .truncate(true)
                .open(&tmp_path)?;
            let mut out = BufWriter::new(tmp);
            for frame in frames {
                let payload = encode(frame)?;
                write_frame(&mut out, &payload)?;
                written += (HEADER_SIZE + payload.len()) as u64;
            }
            out.flush()?;
            out.get_ref().sync_all()?;
        }
        fs::rename(&tmp_path, &self.path)?;

        let file = OpenOptions::new().read(true).append(true).open(&self.path)?;
        w.writer = BufWriter::new(file);
        w.offset = written;

        debug!(frames = frames.len(), bytes = written, "log rewritten");
        Ok(())
    }

    /// Current write offset (the log's length in bytes).
    pub fn offset(&self) -> u64 {
        self.writer.lock().expect("log mutex poisoned").offset
    }

    /// Path to the log file.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

fn encode(frame: &LogFrame) -> StoreResult<Vec<u8>> {
    bincode::serialize(frame).map_err(|e| StoreError::Serialization(e.to_string()))
}

fn write_frame<W: Write>(out: &mut W, payload: &[u8]) -> io::Result<()> {
    let length = payload.len() as u32;
    let crc = crc32fast::hash(payload);
    out.write_all(&length.to_le_bytes())?;
    out.write_all(&crc.to_le_bytes())?;
    out.write_all(payload)
}
