//! The vacuum engine: walks the per-file MS vacuum log and deletes
//! superseded manifests/blocks from RGs.
//!
//! A background thread drains a queue of [`VacuumRequest`]s, each carrying
//! a [`VacuumSnapshot`] (volume/file id, file version, and the *current*
//! manifest mtime so the vacuumer knows where to stop).

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::mpsc::{Receiver, RecvTimeoutError, Sender, channel};
use std::thread;
use std::time::Duration;

/// How long the vacuumer thread waits for new work before giving its
/// retry queue another pass: a transient failure re-queues the request
/// rather than dropping it.
const RETRY_INTERVAL: Duration = Duration::from_millis(500);

use parking_lot::Mutex;

use crate::errors::GwResult;
use crate::inode::Inode;
use crate::ms::client::MsClient;
use crate::rg::client::RgClient;
use crate::types::{BlockVersion, FileId, FileVersion, GatewayId, Timespec, VolumeId};

/// What kind of log entry a [`VacuumRequest`] is processing (a tagged
/// union instead of virtual dispatch).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VacuumKind {
    Write,
    Log,
}

#[derive(Debug, Clone)]
pub struct VacuumSnapshot {
    pub volume_id: VolumeId,
    pub file_id: FileId,
    pub file_version: FileVersion,
    pub manifest_mtime: Timespec,
}

pub struct VacuumRequest {
    pub fs_path: String,
    /// The inode this log entry belongs to, so completion can update its
    /// `vacuuming`/`vacuumed` flags (§4.7 step 4).
    pub inode: Arc<Inode>,
    pub snapshot: VacuumSnapshot,
    pub kind: VacuumKind,
}

/// Outcome of processing one vacuum-log entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VacuumOutcome {
    /// The log is drained down to the current manifest's head entry.
    Drained,
    /// A transient failure occurred; the caller should re-enqueue.
    Again,
}

/// Processes one vacuum request to completion: loops `peek_vacuum_log` /
/// delete / `remove_vacuum_log_entry` until the log is empty or the head
/// entry matches `snapshot.manifest_mtime`.
///
/// # Errors
/// Returns the first fatal (non-`Again`, non-`NotFound`) error encountered.
pub fn process_vacuum_request(
    req: &VacuumRequest,
    self_id: GatewayId,
    ms: &dyn MsClient,
    rg: &dyn RgClient,
    rg_ids: &[GatewayId],
) -> GwResult<VacuumOutcome> {
    loop {
        let Some(entry) = ms.peek_vacuum_log(req.snapshot.volume_id, req.snapshot.file_id)? else {
            return Ok(VacuumOutcome::Drained);
        };

        if entry.manifest_mtime == req.snapshot.manifest_mtime {
            // Head entry: this is the current manifest generation. For a
            // WRITE-triggered request there's nothing to delete yet.
            return Ok(VacuumOutcome::Drained);
        }

        if req.kind == VacuumKind::Write {
            let old_manifest = match fetch_old_manifest(rg, rg_ids, req.snapshot.file_id) {
                Ok(m) => m,
                Err(crate::errors::GatewayError::NotFound(_)) => None,
                Err(crate::errors::GatewayError::Again(_)) => return Ok(VacuumOutcome::Again),
                Err(e) => return Err(e),
            };

            let mut garbage: Vec<(crate::types::BlockId, BlockVersion)> = Vec::new();
            if let Some(manifest) = &old_manifest {
                for &bid in &entry.affected_blocks {
                    if let Some(info) = manifest.get_block(bid) {
                        garbage.push((bid, info.version));
                    }
                }
            } else {
                // Nothing left on any RG for this generation; still need
                // to advance the log, so proceed to removal with an empty
                // garbage set.
            }

            for &rg_id in rg_ids {
                match rg.delete_blocks(rg_id, req.snapshot.file_id, entry.file_version, &garbage) {
                    Ok(()) => {}
                    Err(crate::errors::GatewayError::NotFound(_)) => {
                        log::debug!("vacuum: blocks already absent on RG {rg_id:?} for {:?}", req.snapshot.file_id);
                    }
                    Err(crate::errors::GatewayError::Again(_)) => return Ok(VacuumOutcome::Again),
                    Err(e) => return Err(e),
                }
            }
        }

        ms.remove_vacuum_log_entry(req.snapshot.volume_id, req.snapshot.file_id, entry.file_version, entry.manifest_mtime)?;
        log::info!("vacuum: removed log entry for {:?}@{:?} mtime {:?}", req.snapshot.file_id, entry.file_version, entry.manifest_mtime);
        let _ = self_id;
    }
}

fn fetch_old_manifest(rg: &dyn RgClient, rg_ids: &[GatewayId], file_id: FileId) -> GwResult<Option<crate::manifest::Manifest>> {
    let mut last_err = None;
    for &rg_id in rg_ids {
        match rg.get_manifest(rg_id, file_id) {
            Ok(m) => return Ok(Some(m)),
            Err(crate::errors::GatewayError::NotFound(_)) => continue,
            Err(e) => last_err = Some(e),
        }
    }
    match last_err {
        Some(e) => Err(e),
        None => Ok(None),
    }
}

/// A background vacuumer thread plus its work queue.
pub struct Vacuumer {
    tx: Sender<VacuumMsg>,
    handle: Mutex<Option<thread::JoinHandle<()>>>,
}

enum VacuumMsg {
    Request(VacuumRequest),
    Shutdown,
}

impl Vacuumer {
    /// Spawns the vacuumer thread. `rg_ids` is the fixed set of replica
    /// gateways to delete from; in a full deployment this would be
    /// re-queried per file from the MS.
    #[must_use]
    pub fn spawn(self_id: GatewayId, ms: Arc<dyn MsClient>, rg: Arc<dyn RgClient>, rg_ids: Vec<GatewayId>) -> Arc<Self> {
        let (tx, rx): (Sender<VacuumMsg>, Receiver<VacuumMsg>) = channel();
        let handle = thread::spawn(move || {
            log::info!("vacuumer thread starting");
            let mut retry_queue: VecDeque<VacuumRequest> = VecDeque::new();
            loop {
                match rx.recv_timeout(RETRY_INTERVAL) {
                    Ok(VacuumMsg::Request(req)) => {
                        run_one(req, self_id, ms.as_ref(), rg.as_ref(), &rg_ids, &mut retry_queue);
                    }
                    Ok(VacuumMsg::Shutdown) => break,
                    Err(RecvTimeoutError::Disconnected) => break,
                    Err(RecvTimeoutError::Timeout) => {
                        for req in std::mem::take(&mut retry_queue) {
                            run_one(req, self_id, ms.as_ref(), rg.as_ref(), &rg_ids, &mut retry_queue);
                        }
                    }
                }
            }
            log::info!("vacuumer thread shutting down");
        });
        Arc::new(Self { tx, handle: Mutex::new(Some(handle)) })
    }

    pub fn submit(&self, req: VacuumRequest) {
        let _ = self.tx.send(VacuumMsg::Request(req));
    }

    pub fn shutdown(&self) {
        let _ = self.tx.send(VacuumMsg::Shutdown);
        if let Some(handle) = self.handle.lock().take() {
            let _ = handle.join();
        }
    }
}

fn run_one(
    req: VacuumRequest,
    self_id: GatewayId,
    ms: &dyn MsClient,
    rg: &dyn RgClient,
    rg_ids: &[GatewayId],
    retry_queue: &mut VecDeque<VacuumRequest>,
) {
    match process_vacuum_request(&req, self_id, ms, rg, rg_ids) {
        Ok(VacuumOutcome::Drained) => mark_vacuum_outcome(&req.inode, self_id, true),
        Ok(VacuumOutcome::Again) => retry_queue.push_back(req),
        Err(e) => {
            log::error!("vacuum request for {} failed fatally: {e}", req.fs_path);
            mark_vacuum_outcome(&req.inode, self_id, false);
        }
    }
}

/// Updates `vacuuming`/`vacuumed` on a completed or fatally-failed request,
/// but only while this gateway is still the inode's coordinator — a
/// handed-off coordinator no longer owns those flags.
fn mark_vacuum_outcome(inode: &Inode, self_id: GatewayId, succeeded: bool) {
    let mut s = inode.write();
    if s.coordinator_id == self_id {
        s.vacuuming = false;
        s.vacuumed = succeeded;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ms::types::VacuumLogEntry;
    use crate::test_support::{FakeMsClient, FakeRgClient};
    use crate::types::BlockId;

    #[test]
    fn drains_log_down_to_head_entry() {
        let ms = FakeMsClient::new(VolumeId(1));
        let rg = FakeRgClient::new();
        let vol = VolumeId(1);
        let fid = FileId(1);

        for i in 0..3u8 {
            ms.append_vacuum_log_entry(VacuumLogEntry {
                volume_id: vol,
                gateway_id: GatewayId(1),
                file_id: fid,
                file_version: FileVersion(1),
                manifest_mtime: Timespec::new(i64::from(i), 0),
                affected_blocks: vec![BlockId(u64::from(i))],
            }).unwrap();
        }

        let inode = std::sync::Arc::new(Inode::new(fid, vol, "x".into(), None, crate::types::InodeType::File, GatewayId(1), Timespec::new(0, 0)));
        let req = VacuumRequest {
            fs_path: "/x".into(),
            inode,
            snapshot: VacuumSnapshot { volume_id: vol, file_id: fid, file_version: FileVersion(1), manifest_mtime: Timespec::new(2, 0) },
            kind: VacuumKind::Write,
        };
        let outcome = process_vacuum_request(&req, GatewayId(1), &ms, &rg, &[]).unwrap();
        assert_eq!(outcome, VacuumOutcome::Drained);

        let remaining = ms.peek_vacuum_log(vol, fid).unwrap();
        assert_eq!(remaining.unwrap().manifest_mtime, Timespec::new(2, 0));
    }

    #[test]
    fn run_one_marks_vacuumed_when_still_coordinator() {
        let ms = FakeMsClient::new(VolumeId(1));
        let rg = FakeRgClient::new();
        let vol = VolumeId(1);
        let fid = FileId(1);

        let inode = std::sync::Arc::new(Inode::new(fid, vol, "x".into(), None, crate::types::InodeType::File, GatewayId(1), Timespec::new(0, 0)));
        inode.write().vacuuming = true;
        let req = VacuumRequest {
            fs_path: "/x".into(),
            inode: std::sync::Arc::clone(&inode),
            snapshot: VacuumSnapshot { volume_id: vol, file_id: fid, file_version: FileVersion(1), manifest_mtime: Timespec::new(0, 0) },
            kind: VacuumKind::Write,
        };
        let mut retry_queue = VecDeque::new();
        run_one(req, GatewayId(1), &ms, &rg, &[], &mut retry_queue);

        assert!(retry_queue.is_empty());
        let s = inode.read();
        assert!(!s.vacuuming);
        assert!(s.vacuumed);
    }

    #[test]
    fn run_one_leaves_flags_when_no_longer_coordinator() {
        let ms = FakeMsClient::new(VolumeId(1));
        let rg = FakeRgClient::new();
        let vol = VolumeId(1);
        let fid = FileId(1);

        let inode = std::sync::Arc::new(Inode::new(fid, vol, "x".into(), None, crate::types::InodeType::File, GatewayId(2), Timespec::new(0, 0)));
        inode.write().vacuuming = true;
        let req = VacuumRequest {
            fs_path: "/x".into(),
            inode: std::sync::Arc::clone(&inode),
            snapshot: VacuumSnapshot { volume_id: vol, file_id: fid, file_version: FileVersion(1), manifest_mtime: Timespec::new(0, 0) },
            kind: VacuumKind::Write,
        };
        let mut retry_queue = VecDeque::new();
        run_one(req, GatewayId(1), &ms, &rg, &[], &mut retry_queue);

        let s = inode.read();
        assert!(s.vacuuming);
        assert!(!s.vacuumed);
    }
}
