//! 证据记录服务 - 业务能力层
//!
//! 每个关键步骤截一张图，作为提交的审计 / 法律证据。
//!
//! - 截图按 SHA-256 摘要寻址，写入后永不覆盖
//! - 元数据记录同样只创建不修改
//! - 只有超过合规保留期的记录可以被清理

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::error::EvidenceError;
use crate::models::{EvidenceId, EvidenceRecord, RequestId};

/// 门户会话某一步的快照
#[derive(Debug, Clone)]
pub struct Snapshot {
    pub step: String,
    /// PNG 截图
    pub image: Vec<u8>,
    pub page_url: Option<String>,
    pub page_title: Option<String>,
}

/// 证据存储
#[async_trait]
pub trait EvidenceStore: Send + Sync {
    /// 保存一条证据，`record.digest` 必须与 `bytes` 一致
    async fn put(&self, record: &EvidenceRecord, bytes: &[u8]) -> Result<(), EvidenceError>;

    /// 一个请求的全部证据，按采集顺序
    async fn list_for_request(&self, request_id: RequestId) -> Result<Vec<EvidenceRecord>, EvidenceError>;

    /// 取回截图内容
    async fn artifact(&self, record: &EvidenceRecord) -> Result<Vec<u8>, EvidenceError>;

    /// 删除采集时间早于 `cutoff` 的记录，返回删除数量
    async fn purge_older_than(&self, cutoff: DateTime<Utc>) -> Result<usize, EvidenceError>;

    /// 某次尝试的证据，按采集顺序
    async fn list_for_attempt(
        &self,
        request_id: RequestId,
        attempt_number: u32,
    ) -> Result<Vec<EvidenceRecord>, EvidenceError> {
        Ok(self
            .list_for_request(request_id)
            .await?
            .into_iter()
            .filter(|r| r.attempt_number == attempt_number)
            .collect())
    }
}

pub fn digest_hex(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

/// 证据记录器
///
/// 给快照补上请求 / 尝试信息、摘要和顺序号后交给存储
pub struct EvidenceRecorder {
    store: Arc<dyn EvidenceStore>,
    sequences: Mutex<HashMap<RequestId, u64>>,
}

impl EvidenceRecorder {
    pub fn new(store: Arc<dyn EvidenceStore>) -> Self {
        Self {
            store,
            sequences: Mutex::new(HashMap::new()),
        }
    }

    pub fn store(&self) -> &Arc<dyn EvidenceStore> {
        &self.store
    }

    /// 记录一条证据
    pub async fn record(
        &self,
        request_id: RequestId,
        attempt_number: u32,
        snapshot: Snapshot,
    ) -> Result<EvidenceRecord, EvidenceError> {
        let sequence = self.next_sequence(request_id).await?;
        let digest = digest_hex(&snapshot.image);
        let record = EvidenceRecord {
            id: EvidenceId::new(),
            request_id,
            attempt_number,
            sequence,
            step: snapshot.step,
            captured_at: Utc::now(),
            artifact: format!("sha256:{}", digest),
            digest,
            page_url: snapshot.page_url,
            page_title: snapshot.page_title,
            byte_len: snapshot.image.len(),
        };

        self.store.put(&record, &snapshot.image).await?;
        info!(
            "📸 证据已保存: 请求 {} 第 {} 次 步骤 {} ({} 字节)",
            request_id, attempt_number, record.step, record.byte_len
        );
        Ok(record)
    }

    /// 顺序号在进程重启后从存储里接着算
    async fn next_sequence(&self, request_id: RequestId) -> Result<u64, EvidenceError> {
        let mut sequences = self.sequences.lock().await;
        let next = match sequences.get(&request_id) {
            Some(last) => last + 1,
            None => self
                .store
                .list_for_request(request_id)
                .await?
                .iter()
                .map(|r| r.sequence + 1)
                .max()
                .unwrap_or(0),
        };
        sequences.insert(request_id, next);
        Ok(next)
    }
}

/// 文件系统证据存储
///
/// ```text
/// <root>/blobs/<sha256>.png
/// <root>/records/<request_id>/<attempt>-<sequence>-<evidence_id>.json
/// ```
pub struct FsEvidenceStore {
    root: PathBuf,
}

impl FsEvidenceStore {
    pub async fn open(root: impl Into<PathBuf>) -> Result<Self, EvidenceError> {
        let root = root.into();
        for dir in [root.join("blobs"), root.join("records")] {
            fs::create_dir_all(&dir).await.map_err(|source| io_err(&dir, source))?;
        }
        Ok(Self { root })
    }

    fn blob_path(&self, digest: &str) -> PathBuf {
        self.root.join("blobs").join(format!("{}.png", digest))
    }

    fn request_dir(&self, request_id: RequestId) -> PathBuf {
        self.root.join("records").join(request_id.to_string())
    }

    async fn read_records(dir: &Path) -> Result<Vec<EvidenceRecord>, EvidenceError> {
        let mut records = Vec::new();
        let mut entries = match fs::read_dir(dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(records),
            Err(source) => return Err(io_err(dir, source)),
        };
        while let Some(entry) = entries.next_entry().await.map_err(|source| io_err(dir, source))? {
            let path = entry.path();
            if path.extension().and_then(|s| s.to_str()) != Some("json") {
                continue;
            }
            let content = fs::read(&path).await.map_err(|source| io_err(&path, source))?;
            records.push(serde_json::from_slice(&content)?);
        }
        records.sort_by_key(|r: &EvidenceRecord| (r.sequence, r.captured_at));
        Ok(records)
    }
}

#[async_trait]
impl EvidenceStore for FsEvidenceStore {
    async fn put(&self, record: &EvidenceRecord, bytes: &[u8]) -> Result<(), EvidenceError> {
        if digest_hex(bytes) != record.digest {
            return Err(EvidenceError::DigestMismatch {
                id: record.id.to_string(),
            });
        }

        // 相同内容的截图只存一份
        let blob = self.blob_path(&record.digest);
        match write_new(&blob, bytes).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                debug!("截图内容已存在: {}", record.digest);
            }
            Err(source) => return Err(io_err(&blob, source)),
        }

        let dir = self.request_dir(record.request_id);
        fs::create_dir_all(&dir).await.map_err(|source| io_err(&dir, source))?;
        let path = dir.join(record_file_name(record));
        let metadata = serde_json::to_vec_pretty(record)?;
        write_new(&path, &metadata).await.map_err(|source| io_err(&path, source))?;
        Ok(())
    }

    async fn list_for_request(&self, request_id: RequestId) -> Result<Vec<EvidenceRecord>, EvidenceError> {
        Self::read_records(&self.request_dir(request_id)).await
    }

    async fn artifact(&self, record: &EvidenceRecord) -> Result<Vec<u8>, EvidenceError> {
        let path = self.blob_path(&record.digest);
        let bytes = match fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(EvidenceError::NotFound(record.artifact.clone()))
            }
            Err(source) => return Err(io_err(&path, source)),
        };
        if digest_hex(&bytes) != record.digest {
            return Err(EvidenceError::DigestMismatch {
                id: record.id.to_string(),
            });
        }
        Ok(bytes)
    }

    async fn purge_older_than(&self, cutoff: DateTime<Utc>) -> Result<usize, EvidenceError> {
        let records_root = self.root.join("records");
        let mut purged = 0;
        let mut live_digests = std::collections::HashSet::new();
        let mut expired = Vec::new();

        let mut dirs = fs::read_dir(&records_root)
            .await
            .map_err(|source| io_err(&records_root, source))?;
        while let Some(entry) = dirs.next_entry().await.map_err(|source| io_err(&records_root, source))? {
            let dir = entry.path();
            for record in Self::read_records(&dir).await? {
                if record.captured_at < cutoff {
                    expired.push((dir.join(record_file_name(&record)), record.digest));
                } else {
                    live_digests.insert(record.digest);
                }
            }
        }

        for (path, digest) in expired {
            fs::remove_file(&path).await.map_err(|source| io_err(&path, source))?;
            purged += 1;
            // 仍被保留期内记录引用的截图不能删
            if !live_digests.contains(&digest) {
                let blob = self.blob_path(&digest);
                if let Err(e) = fs::remove_file(&blob).await {
                    if e.kind() != std::io::ErrorKind::NotFound {
                        warn!("删除过期截图失败 {}: {}", blob.display(), e);
                    }
                }
            }
        }

        if purged > 0 {
            info!("🗑️ 已清理 {} 条超过保留期的证据", purged);
        }
        Ok(purged)
    }
}

fn record_file_name(record: &EvidenceRecord) -> String {
    format!(
        "{:03}-{:06}-{}.json",
        record.attempt_number, record.sequence, record.id
    )
}

/// 只创建新文件，已存在则返回 `AlreadyExists`
async fn write_new(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let mut file = fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(path)
        .await?;
    file.write_all(bytes).await?;
    file.sync_all().await?;
    Ok(())
}

fn io_err(path: &Path, source: std::io::Error) -> EvidenceError {
    EvidenceError::Io {
        path: path.display().to_string(),
        source,
    }
}

/// 内存证据存储（测试用）
#[derive(Default)]
pub struct MemoryEvidenceStore {
    records: Mutex<Vec<EvidenceRecord>>,
    blobs: Mutex<HashMap<String, Vec<u8>>>,
}

impl MemoryEvidenceStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl EvidenceStore for MemoryEvidenceStore {
    async fn put(&self, record: &EvidenceRecord, bytes: &[u8]) -> Result<(), EvidenceError> {
        if digest_hex(bytes) != record.digest {
            return Err(EvidenceError::DigestMismatch {
                id: record.id.to_string(),
            });
        }
        self.blobs
            .lock()
            .await
            .entry(record.digest.clone())
            .or_insert_with(|| bytes.to_vec());
        self.records.lock().await.push(record.clone());
        Ok(())
    }

    async fn list_for_request(&self, request_id: RequestId) -> Result<Vec<EvidenceRecord>, EvidenceError> {
        let mut records: Vec<_> = self
            .records
            .lock()
            .await
            .iter()
            .filter(|r| r.request_id == request_id)
            .cloned()
            .collect();
        records.sort_by_key(|r| (r.sequence, r.captured_at));
        Ok(records)
    }

    async fn artifact(&self, record: &EvidenceRecord) -> Result<Vec<u8>, EvidenceError> {
        self.blobs
            .lock()
            .await
            .get(&record.digest)
            .cloned()
            .ok_or_else(|| EvidenceError::NotFound(record.artifact.clone()))
    }

    async fn purge_older_than(&self, cutoff: DateTime<Utc>) -> Result<usize, EvidenceError> {
        let mut records = self.records.lock().await;
        let before = records.len();
        records.retain(|r| r.captured_at >= cutoff);
        Ok(before - records.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snapshot(step: &str, image: &[u8]) -> Snapshot {
        Snapshot {
            step: step.to_string(),
            image: image.to_vec(),
            page_url: Some("https://portal.example/form".to_string()),
            page_title: Some("Public Records".to_string()),
        }
    }

    #[tokio::test]
    async fn records_are_ordered_and_content_addressed() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(FsEvidenceStore::open(dir.path()).await.unwrap());
        let recorder = EvidenceRecorder::new(store.clone());
        let request_id = RequestId::new();

        let first = recorder.record(request_id, 1, snapshot("landing_page", b"png-a")).await.unwrap();
        let second = recorder.record(request_id, 1, snapshot("confirmation", b"png-b")).await.unwrap();
        let third = recorder.record(request_id, 2, snapshot("landing_page", b"png-a")).await.unwrap();

        let all = store.list_for_request(request_id).await.unwrap();
        assert_eq!(all, vec![first.clone(), second, third.clone()]);
        assert_eq!(first.digest, third.digest);
        assert_eq!(store.artifact(&first).await.unwrap(), b"png-a");

        let attempt_two = store.list_for_attempt(request_id, 2).await.unwrap();
        assert_eq!(attempt_two, vec![third]);
    }

    #[tokio::test]
    async fn tampered_artifact_is_detected() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(FsEvidenceStore::open(dir.path()).await.unwrap());
        let recorder = EvidenceRecorder::new(store.clone());
        let record = recorder
            .record(RequestId::new(), 1, snapshot("confirmation", b"original"))
            .await
            .unwrap();

        std::fs::write(dir.path().join("blobs").join(format!("{}.png", record.digest)), b"edited").unwrap();
        assert!(matches!(
            store.artifact(&record).await,
            Err(EvidenceError::DigestMismatch { .. })
        ));
    }

    #[tokio::test]
    async fn metadata_is_never_overwritten() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsEvidenceStore::open(dir.path()).await.unwrap();
        let bytes = b"shot";
        let record = EvidenceRecord {
            id: EvidenceId::new(),
            request_id: RequestId::new(),
            attempt_number: 1,
            sequence: 0,
            step: "landing_page".to_string(),
            captured_at: Utc::now(),
            digest: digest_hex(bytes),
            artifact: format!("sha256:{}", digest_hex(bytes)),
            page_url: None,
            page_title: None,
            byte_len: bytes.len(),
        };
        store.put(&record, bytes).await.unwrap();
        assert!(store.put(&record, bytes).await.is_err());
    }

    #[tokio::test]
    async fn sequence_continues_after_restart() {
        let dir = tempfile::tempdir().unwrap();
        let request_id = RequestId::new();
        {
            let store = Arc::new(FsEvidenceStore::open(dir.path()).await.unwrap());
            let recorder = EvidenceRecorder::new(store);
            recorder.record(request_id, 1, snapshot("landing_page", b"a")).await.unwrap();
        }
        let store = Arc::new(FsEvidenceStore::open(dir.path()).await.unwrap());
        let recorder = EvidenceRecorder::new(store);
        let record = recorder.record(request_id, 2, snapshot("landing_page", b"b")).await.unwrap();
        assert_eq!(record.sequence, 1);
    }

    #[tokio::test]
    async fn purge_keeps_records_inside_window() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(FsEvidenceStore::open(dir.path()).await.unwrap());
        let recorder = EvidenceRecorder::new(store.clone());
        let request_id = RequestId::new();
        recorder.record(request_id, 1, snapshot("landing_page", b"a")).await.unwrap();

        let purged = store
            .purge_older_than(Utc::now() - chrono::Duration::days(1))
            .await
            .unwrap();
        assert_eq!(purged, 0);

        let purged = store
            .purge_older_than(Utc::now() + chrono::Duration::seconds(1))
            .await
            .unwrap();
        assert_eq!(purged, 1);
        assert!(store.list_for_request(request_id).await.unwrap().is_empty());
    }
}
