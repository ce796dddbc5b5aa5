//! Bulk raw replication.
//!
//! The primary exports a [`RawDump`] for a branch-id range and a commit-time
//! range and ships it as one encoded stream. The replica imports it, drops
//! cached revisions the import touched, rebuilds its lock table from the
//! imported lock areas and replays one synthetic commit notification per
//! branch so local listeners see the same events as for incremental
//! replication.
//!
//! Stream layout: magic `TSRW`, format version, compression algorithm,
//! blake3 digest of the uncompressed body, then the compressed bincode body.

use std::collections::{BTreeMap, BTreeSet};
use std::io::Read;

use bincode::Options;
use bytes::{BufMut, Bytes, BytesMut};
use tracing::{debug, info};

use crate::config::{RawCodecConfig, RawCompression};
use crate::error::{ReplError, Result};
use crate::primary::{RawRange, RawReplication};
use crate::repository::Repository;
use crate::store::{RawDump, RevisionStore};
use crate::types::{BranchId, Commit, ObjectId, Timestamp, SYSTEM_USER_ID};

const MAGIC: &[u8; 4] = b"TSRW";
const FORMAT_VERSION: u8 = 1;
const HEADER_LEN: usize = 4 + 1 + 1 + 32;

/// Comment of the synthetic commit notifications replayed after an import.
pub const RAW_REPLAY_COMMENT: &str = "<replicate raw commits>";

fn algo_byte(algo: RawCompression) -> u8 {
    match algo {
        RawCompression::None => 0,
        RawCompression::Lz4 => 1,
        RawCompression::Zstd => 2,
    }
}

fn algo_from_byte(b: u8) -> Result<RawCompression> {
    match b {
        0 => Ok(RawCompression::None),
        1 => Ok(RawCompression::Lz4),
        2 => Ok(RawCompression::Zstd),
        other => Err(ReplError::Codec {
            msg: format!("unknown compression algorithm {}", other),
        }),
    }
}

/// Encodes and decodes raw replication streams.
#[derive(Debug, Clone, Default)]
pub struct RawCodec {
    config: RawCodecConfig,
}

impl RawCodec {
    /// Create a codec with the given settings.
    pub fn new(config: RawCodecConfig) -> Self {
        Self { config }
    }

    /// Encodes a dump.
    pub fn encode(&self, dump: &RawDump) -> Result<Bytes> {
        let body = bincode::serialize(dump)?;
        let digest = blake3::hash(&body);
        let compressed = match self.config.compression {
            RawCompression::None => body,
            RawCompression::Lz4 => lz4_flex::compress_prepend_size(&body),
            RawCompression::Zstd => {
                zstd::encode_all(body.as_slice(), self.config.zstd_level.clamp(1, 22))?
            }
        };

        let mut out = BytesMut::with_capacity(HEADER_LEN + compressed.len());
        out.put_slice(MAGIC);
        out.put_u8(FORMAT_VERSION);
        out.put_u8(algo_byte(self.config.compression));
        out.put_slice(digest.as_bytes());
        out.put_slice(&compressed);
        Ok(out.freeze())
    }

    fn too_large(&self, size: u64) -> ReplError {
        ReplError::Codec {
            msg: format!(
                "raw replication body of {} bytes exceeds limit of {} bytes",
                size, self.config.max_body_bytes
            ),
        }
    }

    fn decompress(&self, algo: RawCompression, payload: &[u8]) -> Result<Vec<u8>> {
        let limit = self.config.max_body_bytes;
        match algo {
            RawCompression::None => {
                if payload.len() as u64 > limit {
                    return Err(self.too_large(payload.len() as u64));
                }
                Ok(payload.to_vec())
            }
            RawCompression::Lz4 => {
                let prefix: [u8; 4] = payload
                    .get(..4)
                    .and_then(|p| p.try_into().ok())
                    .ok_or_else(|| ReplError::Codec {
                        msg: "lz4 body without size prefix".to_string(),
                    })?;
                let size = u64::from(u32::from_le_bytes(prefix));
                if size > limit {
                    return Err(self.too_large(size));
                }
                lz4_flex::decompress_size_prepended(payload).map_err(|e| ReplError::Codec {
                    msg: e.to_string(),
                })
            }
            RawCompression::Zstd => {
                let mut body = Vec::new();
                zstd::stream::read::Decoder::new(payload)?
                    .take(limit.saturating_add(1))
                    .read_to_end(&mut body)?;
                if body.len() as u64 > limit {
                    return Err(self.too_large(body.len() as u64));
                }
                Ok(body)
            }
        }
    }

    /// Decodes a stream, verifying its header and digest.
    pub fn decode(&self, stream: &[u8]) -> Result<RawDump> {
        if stream.len() < HEADER_LEN || &stream[..4] != MAGIC {
            return Err(ReplError::Codec {
                msg: "not a raw replication stream".to_string(),
            });
        }
        if stream[4] != FORMAT_VERSION {
            return Err(ReplError::Codec {
                msg: format!("unsupported stream version {}", stream[4]),
            });
        }
        let algo = algo_from_byte(stream[5])?;
        let expected = &stream[6..HEADER_LEN];
        let payload = &stream[HEADER_LEN..];

        let body = self.decompress(algo, payload)?;
        if blake3::hash(&body).as_bytes() != expected {
            return Err(ReplError::Codec {
                msg: "raw replication stream digest mismatch".to_string(),
            });
        }
        // Same encoding as `bincode::serialize`, bounded by the body limit.
        let options = bincode::DefaultOptions::new()
            .with_fixint_encoding()
            .allow_trailing_bytes()
            .with_limit(self.config.max_body_bytes);
        Ok(options.deserialize(&body)?)
    }
}

/// What an import did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RawImportReport {
    /// Branches created.
    pub branches: usize,
    /// Commits written.
    pub commits: usize,
    /// Cached revisions dropped.
    pub invalidated: usize,
    /// Durable locks loaded into the lock table.
    pub locks: usize,
    /// Synthetic commit notifications published.
    pub notifications: usize,
}

/// Export on the primary side, import on the replica side.
#[derive(Debug, Clone, Default)]
pub struct RawReplicationEngine {
    codec: RawCodec,
}

impl RawReplicationEngine {
    /// Create an engine using `codec` for streams.
    pub fn new(codec: RawCodec) -> Self {
        Self { codec }
    }

    /// Exports `range` from `store`. Open upper bounds resolve to the store's
    /// latest branch and commit time.
    pub fn export(&self, store: &dyn RevisionStore, range: RawRange) -> Result<RawReplication> {
        let to_branch = match range.to_branch {
            Some(b) => b,
            None => store.last_branch_id()?,
        };
        let to_time = match range.to_time {
            Some(t) => t,
            None => store.last_non_local_commit_time()?,
        };
        let dump = store.raw_export(range.from_branch, to_branch, range.from_time, to_time)?;
        debug!(
            branches = dump.branches.len(),
            commits = dump.commits.len(),
            "raw export"
        );
        Ok(RawReplication {
            to_branch,
            to_time,
            stream: self.codec.encode(&dump)?,
        })
    }

    /// Imports a stream into `repo` and advances its replication counters.
    pub async fn import(
        &self,
        repo: &Repository,
        replication: &RawReplication,
    ) -> Result<RawImportReport> {
        let dump = self.codec.decode(&replication.stream)?;
        let from_time = Timestamp::new(dump.from_time);

        let summary = {
            let _gate = repo.commit_gate().write().await;
            repo.store().raw_import(&dump)?
        };

        let touched: BTreeSet<ObjectId> = dump
            .commits
            .iter()
            .flat_map(|c| c.data.touched_ids())
            .collect();
        let touched: Vec<ObjectId> = touched.into_iter().collect();
        let invalidated = repo.cache().remove_objects(&touched);

        let areas = repo.store().lock_areas()?;
        let locks = repo.locks().reload(&areas)?;

        // Newest commit per branch decides the replay window end.
        let mut windows: BTreeMap<BranchId, &Commit> = BTreeMap::new();
        for raw in &dump.commits {
            let entry = windows.entry(raw.commit.branch).or_insert(&raw.commit);
            if raw.commit.timestamp > entry.timestamp {
                *entry = &raw.commit;
            }
        }
        for (branch, last) in &windows {
            let changed = repo
                .store()
                .change_set(*branch, from_time, last.timestamp)?;
            let synthetic = Commit {
                id: last.id,
                timestamp: last.timestamp,
                group_id: last.group_id,
                branch: *branch,
                author: SYSTEM_USER_ID.to_string(),
                comment: RAW_REPLAY_COMMENT.to_string(),
            };
            repo.notifier().publish_commit(&synthetic, changed, Vec::new(), None);
        }
        repo.notifier().publish_locks_reloaded();

        repo.store().force_commit_time(replication.to_time)?;
        repo.role().advance_replicated_branch_id(replication.to_branch);
        repo.role().advance_replicated_commit_time(replication.to_time);

        let report = RawImportReport {
            branches: summary.branches,
            commits: summary.commits,
            invalidated,
            locks,
            notifications: windows.len(),
        };
        info!(
            to_branch = %replication.to_branch,
            to_time = %replication.to_time,
            branches = report.branches,
            commits = report.commits,
            invalidated = report.invalidated,
            "raw replication imported"
        );
        Ok(report)
    }
}
