#![cfg(any(test, feature = "test-support"))]
//! In-memory fakes for the MS/RG client traits, plus tiny temp-path helpers,
//! so pipeline and integration tests never need a real network peer.

use std::collections::{HashMap, VecDeque};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;

use crate::crypto::hash::Sha256Digest;
use crate::errors::{GatewayError, GwResult};
use crate::manifest::{BlockType, Manifest};
use crate::ms::client::MsClient;
use crate::ms::types::{CoordinateOutcome, GetattrOutcome, MdEntry, PathEnt, VacuumLogEntry, XattrBundle};
use crate::rg::client::RgClient;
use crate::types::{
    BlockId, BlockVersion, Capability, FileId, FileVersion, GatewayId, GatewayType, InodeType, Timespec, VolumeId,
    WriteNonce, XattrNonce,
};
use crate::wire::{Reply, Request, RequestKind};

/// Create a unique temp file path with the given stem and extension in the OS temp dir.
pub fn temp_path(stem: &str, ext: &str) -> PathBuf {
    let now = SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_nanos();
    let mut p = std::env::temp_dir();
    p.push(format!("{stem}_{now}.{ext}"));
    p
}

/// Create a unique, empty temporary directory under the OS temp dir.
pub fn temp_dir(stem: &str) -> PathBuf {
    let now = SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_nanos();
    let mut p = std::env::temp_dir();
    p.push(format!("{stem}_{now}"));
    if p.exists() {
        let _ = fs::remove_dir_all(&p);
    }
    fs::create_dir_all(&p).expect("create temp_dir failed");
    p
}

/// Join a file path inside a directory (does not create the file).
pub fn temp_file_in(dir: &Path, name: &str) -> PathBuf {
    dir.join(name)
}

fn default_entry(file_id: FileId, volume_id: VolumeId, name: String, parent_id: Option<FileId>, inode_type: InodeType, owner: GatewayId) -> MdEntry {
    MdEntry {
        file_id,
        volume_id,
        name,
        parent_id,
        inode_type,
        file_version: FileVersion(1),
        write_nonce: WriteNonce(0),
        xattr_nonce: XattrNonce(0),
        generation: 0,
        ms_num_children: 0,
        ms_capacity: 0,
        owner,
        mode: 0o644,
        coordinator_id: owner,
        ctime: Timespec::new(0, 0),
        mtime: Timespec::new(0, 0),
        manifest_mtime: Timespec::new(0, 0),
        max_read_freshness_ms: 5_000,
        max_write_freshness_ms: 1_000,
        size: 0,
        xattr_hash: [0u8; 32],
    }
}

struct FakeMsInner {
    volume_id: VolumeId,
    blocksize: u64,
    entries: HashMap<FileId, MdEntry>,
    paths: HashMap<String, FileId>,
    vacuum_logs: HashMap<(VolumeId, FileId), VecDeque<VacuumLogEntry>>,
    xattrs: HashMap<FileId, XattrBundle>,
    gateway_types: HashMap<GatewayId, GatewayType>,
    gateway_caps: HashMap<GatewayId, Vec<Capability>>,
    replica_gateway_ids: Vec<GatewayId>,
    next_file_id: u64,
}

/// An in-memory stand-in for a real MS HTTP(S) client.
/// First-caller-wins `coordinate` and a flat name->id path table are
/// deliberate simplifications: enough to drive the consistency/sync
/// engines' tests without a real linearizable metadata store.
pub struct FakeMsClient {
    inner: Mutex<FakeMsInner>,
}

impl FakeMsClient {
    #[must_use]
    pub fn new(volume_id: VolumeId) -> Self {
        Self {
            inner: Mutex::new(FakeMsInner {
                volume_id,
                blocksize: 4096,
                entries: HashMap::new(),
                paths: HashMap::new(),
                vacuum_logs: HashMap::new(),
                xattrs: HashMap::new(),
                gateway_types: HashMap::new(),
                gateway_caps: HashMap::new(),
                replica_gateway_ids: Vec::new(),
                next_file_id: 1,
            }),
        }
    }

    pub fn insert_entry(&self, path: &str, entry: MdEntry) {
        let mut inner = self.inner.lock();
        inner.paths.insert(path.to_string(), entry.file_id);
        inner.entries.insert(entry.file_id, entry);
    }

    pub fn set_replica_gateway_ids(&self, ids: Vec<GatewayId>) {
        self.inner.lock().replica_gateway_ids = ids;
    }

    pub fn set_gateway_type(&self, id: GatewayId, kind: GatewayType) {
        self.inner.lock().gateway_types.insert(id, kind);
    }

    pub fn set_gateway_caps(&self, id: GatewayId, caps: Vec<Capability>) {
        self.inner.lock().gateway_caps.insert(id, caps);
    }

    #[must_use]
    pub fn entry(&self, file_id: FileId) -> Option<MdEntry> {
        self.inner.lock().entries.get(&file_id).cloned()
    }
}

impl MsClient for FakeMsClient {
    fn getattr(&self, path_ent: &PathEnt) -> GwResult<GetattrOutcome> {
        let inner = self.inner.lock();
        match inner.entries.get(&path_ent.file_id) {
            None => Ok(GetattrOutcome::NotFound),
            Some(e) if e.file_version == path_ent.file_version && e.write_nonce == path_ent.write_nonce => {
                Ok(GetattrOutcome::NoChange)
            }
            Some(e) => Ok(GetattrOutcome::New(e.clone())),
        }
    }

    fn path_download(&self, names: &[String]) -> GwResult<Vec<MdEntry>> {
        let inner = self.inner.lock();
        let mut out = Vec::with_capacity(names.len());
        for name in names {
            let id = inner
                .paths
                .get(name)
                .ok_or_else(|| GatewayError::NotFound(format!("no such path component: {name}")))?;
            let entry = inner.entries.get(id).cloned().ok_or_else(|| GatewayError::NotFound(name.clone()))?;
            out.push(entry);
        }
        Ok(out)
    }

    fn listdir(&self, file_id: FileId, _num_children: u64, _capacity: u64) -> GwResult<Vec<MdEntry>> {
        let inner = self.inner.lock();
        Ok(inner.entries.values().filter(|e| e.parent_id == Some(file_id)).cloned().collect())
    }

    fn diffdir(&self, file_id: FileId, num_children: u64, _least_unknown_generation: u64) -> GwResult<Vec<MdEntry>> {
        self.listdir(file_id, num_children, 0)
    }

    fn create(&self, parent_id: FileId, name: &str, inode_type: InodeType, owner: GatewayId, _mode: u32) -> GwResult<MdEntry> {
        let mut inner = self.inner.lock();
        let id = FileId(inner.next_file_id);
        inner.next_file_id += 1;
        let entry = default_entry(id, inner.volume_id, name.to_string(), Some(parent_id), inode_type, owner);
        let path = format!("{}/{}", parent_id.0, name);
        inner.paths.insert(path, id);
        inner.entries.insert(id, entry.clone());
        Ok(entry)
    }

    fn update(&self, entry: &MdEntry, _write_delta: &Manifest, xattr_hash: Sha256Digest) -> GwResult<MdEntry> {
        let mut inner = self.inner.lock();
        let mut updated = entry.clone();
        updated.xattr_hash = xattr_hash;
        inner.entries.insert(updated.file_id, updated.clone());
        Ok(updated)
    }

    fn delete(&self, file_id: FileId) -> GwResult<()> {
        let mut inner = self.inner.lock();
        inner.entries.remove(&file_id);
        inner.paths.retain(|_, id| *id != file_id);
        Ok(())
    }

    fn rename(&self, old_path: &str, new_path: &str) -> GwResult<MdEntry> {
        let mut inner = self.inner.lock();
        let id = inner
            .paths
            .remove(old_path)
            .ok_or_else(|| GatewayError::NotFound(old_path.to_string()))?;
        inner.paths.insert(new_path.to_string(), id);
        let entry = inner.entries.get_mut(&id).ok_or_else(|| GatewayError::NotFound(old_path.to_string()))?;
        entry.name = new_path.rsplit('/').next().unwrap_or(new_path).to_string();
        Ok(entry.clone())
    }

    fn coordinate(&self, entry: &MdEntry, xattr_hash: Sha256Digest) -> GwResult<CoordinateOutcome> {
        let mut inner = self.inner.lock();
        let stored = inner.entries.get(&entry.file_id).cloned();
        match stored {
            None => {
                let mut confirmed = entry.clone();
                confirmed.xattr_hash = xattr_hash;
                inner.entries.insert(entry.file_id, confirmed.clone());
                Ok(CoordinateOutcome::Confirmed(confirmed))
            }
            Some(current) if entry.write_nonce >= current.write_nonce => {
                let mut confirmed = entry.clone();
                confirmed.write_nonce = WriteNonce(current.write_nonce.0 + 1);
                confirmed.xattr_hash = xattr_hash;
                inner.entries.insert(entry.file_id, confirmed.clone());
                Ok(CoordinateOutcome::Confirmed(confirmed))
            }
            Some(current) => Ok(CoordinateOutcome::Lost { winner: current.coordinator_id }),
        }
    }

    fn append_vacuum_log_entry(&self, entry: VacuumLogEntry) -> GwResult<()> {
        let mut inner = self.inner.lock();
        inner.vacuum_logs.entry((entry.volume_id, entry.file_id)).or_default().push_back(entry);
        Ok(())
    }

    fn peek_vacuum_log(&self, volume_id: VolumeId, file_id: FileId) -> GwResult<Option<VacuumLogEntry>> {
        let inner = self.inner.lock();
        Ok(inner.vacuum_logs.get(&(volume_id, file_id)).and_then(|q| q.front().cloned()))
    }

    fn remove_vacuum_log_entry(&self, volume_id: VolumeId, file_id: FileId, file_version: FileVersion, manifest_mtime: Timespec) -> GwResult<()> {
        let mut inner = self.inner.lock();
        if let Some(q) = inner.vacuum_logs.get_mut(&(volume_id, file_id)) {
            if let Some(front) = q.front() {
                if front.file_version == file_version && front.manifest_mtime == manifest_mtime {
                    q.pop_front();
                }
            }
        }
        Ok(())
    }

    fn fetchxattrs(&self, _volume_id: VolumeId, file_id: FileId, _xattr_nonce: XattrNonce, _expected_hash: Sha256Digest) -> GwResult<XattrBundle> {
        Ok(self.inner.lock().xattrs.get(&file_id).cloned().unwrap_or_default())
    }

    fn get_volume_id(&self) -> VolumeId {
        self.inner.lock().volume_id
    }

    fn get_volume_blocksize(&self) -> u64 {
        self.inner.lock().blocksize
    }

    fn get_gateway_type(&self, id: GatewayId) -> GwResult<GatewayType> {
        Ok(self.inner.lock().gateway_types.get(&id).copied().unwrap_or(GatewayType::User))
    }

    fn get_gateway_caps(&self, id: GatewayId) -> GwResult<Vec<Capability>> {
        Ok(self.inner.lock().gateway_caps.get(&id).cloned().unwrap_or_default())
    }

    fn list_replica_gateway_ids(&self) -> Vec<GatewayId> {
        self.inner.lock().replica_gateway_ids.clone()
    }
}

struct FakeRgInner {
    manifests: HashMap<FileId, Manifest>,
    blocks: HashMap<(FileId, BlockId), Vec<u8>>,
}

/// An in-memory stand-in for a real RG HTTP(S) client. Blocks are keyed by
/// `(file_id, block_id)` only: the fake always holds the latest bytes a
/// `put_chunks` wrote for that block, which is all the replication/vacuum
/// tests need.
pub struct FakeRgClient {
    inner: Mutex<FakeRgInner>,
}

impl Default for FakeRgClient {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeRgClient {
    #[must_use]
    pub fn new() -> Self {
        Self { inner: Mutex::new(FakeRgInner { manifests: HashMap::new(), blocks: HashMap::new() }) }
    }

    /// Seeds a block directly, bypassing `put_chunks`, for tests that only
    /// care about `get_block` serving it back.
    pub fn set_block(&self, _rg_id: GatewayId, file_id: FileId, _file_version: FileVersion, block_id: BlockId, data: Vec<u8>) {
        self.inner.lock().blocks.insert((file_id, block_id), data);
    }
}

impl RgClient for FakeRgClient {
    fn put_chunks(&self, _rg_id: GatewayId, request: &Request, data_plane: &[u8]) -> GwResult<Reply> {
        let RequestKind::PutChunks { file_id, blocks, .. } = &request.kind else {
            return Err(GatewayError::Bug("put_chunks called with non-PutChunks request".into()));
        };
        let mut inner = self.inner.lock();
        for desc in blocks {
            let start = desc.offset as usize;
            let end = start + desc.size as usize;
            let bytes = data_plane.get(start..end).ok_or_else(|| GatewayError::Decode("chunk out of bounds".into()))?.to_vec();
            match desc.block_type {
                BlockType::Manifest => {
                    let (manifest, _): (Manifest, usize) =
                        bincode::serde::decode_from_slice(&bytes, bincode::config::standard()).map_err(GatewayError::Decode)?;
                    inner.manifests.insert(*file_id, manifest);
                }
                BlockType::Block => {
                    inner.blocks.insert((*file_id, desc.id), bytes);
                }
            }
        }
        Ok(Reply::ok(None))
    }

    fn get_manifest(&self, _rg_id: GatewayId, file_id: FileId) -> GwResult<Manifest> {
        self.inner
            .lock()
            .manifests
            .get(&file_id)
            .cloned()
            .ok_or_else(|| GatewayError::NotFound(format!("no manifest cached for {file_id:?}")))
    }

    fn get_block(&self, _rg_id: GatewayId, file_id: FileId, _file_version: FileVersion, block_id: BlockId) -> GwResult<Vec<u8>> {
        self.inner
            .lock()
            .blocks
            .get(&(file_id, block_id))
            .cloned()
            .ok_or_else(|| GatewayError::NotFound(format!("block {block_id:?} not on fake RG")))
    }

    fn delete_blocks(&self, _rg_id: GatewayId, file_id: FileId, _file_version: FileVersion, block_ids: &[(BlockId, BlockVersion)]) -> GwResult<()> {
        let mut inner = self.inner.lock();
        for (bid, _) in block_ids {
            inner.blocks.remove(&(file_id, *bid));
        }
        Ok(())
    }
}

/// An in-memory stand-in for [`crate::ug::UgClient`]. `unreachable` drives
/// the coordinator-failover scenario: every `send` fails as if the peer
/// were down, forcing the write pipeline into `chcoord`.
pub struct FakeUgClient {
    reachable: bool,
    replies: Mutex<HashMap<GatewayId, MdEntry>>,
    last_request: Mutex<Option<Request>>,
}

impl FakeUgClient {
    #[must_use]
    pub fn unreachable() -> Self {
        Self { reachable: false, replies: Mutex::new(HashMap::new()), last_request: Mutex::new(None) }
    }

    #[must_use]
    pub fn reachable() -> Self {
        Self { reachable: true, replies: Mutex::new(HashMap::new()), last_request: Mutex::new(None) }
    }

    pub fn set_reply(&self, target: GatewayId, entry: MdEntry) {
        self.replies.lock().insert(target, entry);
    }

    /// The most recent request handed to `send`, for asserting on what a
    /// caller actually forwarded (e.g. a write's payload bytes).
    #[must_use]
    pub fn last_request(&self) -> Option<Request> {
        self.last_request.lock().clone()
    }
}

impl crate::ug::UgClient for FakeUgClient {
    fn send(&self, target: GatewayId, request: &Request) -> GwResult<Reply> {
        *self.last_request.lock() = Some(request.clone());
        if !self.reachable {
            return Err(GatewayError::RemoteIO(format!("gateway {target:?} unreachable")));
        }
        Ok(Reply::ok(self.replies.lock().get(&target).cloned()))
    }
}
