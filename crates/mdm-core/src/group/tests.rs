use super::*;
use crate::config::{FileAllocation, MdmConfig};
use crate::segmenter::Segment;
use sha2::{Digest, Sha256};
use std::time::Duration;
use tempfile::TempDir;

const URI: &str = "http://mirror.example/pub/f.bin";

fn options() -> GroupOptions {
    let mut o = GroupOptions::from_config(&MdmConfig::default(), Some(4));
    o.segment_size = 100;
    o.file_allocation = FileAllocation::None;
    o
}

fn group_in(dir: &TempDir, options: GroupOptions) -> DownloadGroup {
    DownloadGroup::new(Gid(1), DownloadRequest::new(URI, dir.path()), options)
}

/// Check out, fill and commit every remaining segment with bytes from `data`.
fn complete_all(group: &mut DownloadGroup, data: &[u8]) {
    let storage = group.storage().cloned().unwrap();
    let segments = group.segments_mut().unwrap();
    while let Some(mut seg) = segments.request_segment(WorkerId(7)) {
        let end = seg.end().unwrap() as usize;
        storage.write_at(seg.position(), &data[seg.position() as usize..end]).unwrap();
        seg.written = seg.length.unwrap();
        assert!(segments.complete_segment(&seg));
    }
}

fn write_partial(group: &mut DownloadGroup, worker: WorkerId, data: &[u8], n: u64) -> Segment {
    let storage = group.storage().cloned().unwrap();
    let segments = group.segments_mut().unwrap();
    let mut seg = segments.request_segment(worker).unwrap();
    storage.write_at(seg.start, &data[seg.start as usize..(seg.start + n) as usize]).unwrap();
    seg.written = n;
    assert!(segments.update_segment(&seg));
    seg
}

fn payload(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

#[test]
fn fresh_download_opens_temp_file_and_segments() {
    let dir = tempfile::tempdir().unwrap();
    let mut g = group_in(&dir, options());
    let decision = g.on_file_size_determined(URI, Some(1000), true, None).unwrap();
    assert_eq!(decision, SizeDecision::StartFresh);
    assert_eq!(g.path(), Some(dir.path().join("f.bin").as_path()));
    assert!(dir.path().join("f.bin.part").exists());
    assert_eq!(g.total_length(), Some(1000));
    assert_eq!(g.segments().unwrap().segment_count(), 10);
    assert_eq!(g.extra_connections(), 3);
    assert!(!g.download_finished());
}

#[test]
fn disposition_name_is_used_when_no_out() {
    let dir = tempfile::tempdir().unwrap();
    let mut g = group_in(&dir, options());
    g.on_file_size_determined(URI, Some(10), true, Some("attachment; filename=\"real.iso\""))
        .unwrap();
    assert_eq!(g.path(), Some(dir.path().join("real.iso").as_path()));
}

#[test]
fn server_without_ranges_gets_one_segment() {
    let dir = tempfile::tempdir().unwrap();
    let mut g = group_in(&dir, options());
    g.on_file_size_determined(URI, Some(1000), false, None).unwrap();
    let s = g.segments().unwrap();
    assert_eq!(s.segment_count(), 1);
    assert!(!s.is_resumable());
    assert_eq!(g.extra_connections(), 0);
}

#[test]
fn later_mirror_must_agree_on_length() {
    let dir = tempfile::tempdir().unwrap();
    let mut g = group_in(&dir, options());
    g.on_file_size_determined(URI, Some(1000), true, None).unwrap();
    assert_eq!(
        g.on_file_size_determined("http://other.example/f.bin", Some(1000), true, None)
            .unwrap(),
        SizeDecision::Resume
    );
    let err = g
        .on_file_size_determined("http://other.example/f.bin", Some(999), true, None)
        .unwrap_err();
    assert_eq!(err.kind(), crate::error::Kind::AbortGroup);
    assert!(err.message().contains("size mismatch"));
}

#[test]
fn complete_file_on_disk_is_skipped() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("f.bin"), payload(300)).unwrap();
    let mut g = group_in(&dir, options());
    let decision = g.on_file_size_determined(URI, Some(300), true, None).unwrap();
    assert_eq!(decision, SizeDecision::AlreadyComplete);
    assert!(g.download_finished());
    assert_eq!(g.result_code(), ResultCode::Finished);
    assert!(!dir.path().join("f.bin.part").exists());
}

#[test]
fn existing_file_is_not_overwritten() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("f.bin"), b"short").unwrap();
    let mut g = group_in(&dir, options());
    let err = g.on_file_size_determined(URI, Some(300), true, None).unwrap_err();
    assert!(err.message().contains("file already exists"));

    let mut o = options();
    o.allow_overwrite = true;
    let mut g = group_in(&dir, o);
    assert_eq!(
        g.on_file_size_determined(URI, Some(300), true, None).unwrap(),
        SizeDecision::StartFresh
    );
}

#[test]
fn existing_file_with_digest_is_verified_in_place() {
    let dir = tempfile::tempdir().unwrap();
    let data = payload(300);
    std::fs::write(dir.path().join("f.bin"), &data).unwrap();
    let mut req = DownloadRequest::new(URI, dir.path());
    req.sha256 = Some(hex::encode(Sha256::digest(&data)));
    let mut g = DownloadGroup::new(Gid(1), req.clone(), options());

    let decision = g.on_file_size_determined(URI, Some(300), true, None).unwrap();
    assert_eq!(decision, SizeDecision::NeedsVerification);
    assert!(!dir.path().join("f.bin.part").exists());
    let task = g.chunked_mut().unwrap();
    assert_eq!(task.kind(), crate::chunked::ChunkedKind::IntegrityCheck);
    while !task.is_done() {
        task.advance().unwrap();
    }
    task.outcome().unwrap();
    g.take_chunked();
    g.set_verified();

    let result = g.close(Instant::now());
    assert_eq!(result.code, ResultCode::Finished);
    assert_eq!(std::fs::read(dir.path().join("f.bin")).unwrap(), data);

    // A length that cannot match is still refused outright.
    let mut g = DownloadGroup::new(Gid(2), req, options());
    let err = g.on_file_size_determined(URI, Some(301), true, None).unwrap_err();
    assert!(err.message().contains("file already exists"));
}

#[test]
fn verification_disables_finished_by_length() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("f.bin"), payload(300)).unwrap();
    let mut req = DownloadRequest::new(URI, dir.path());
    req.sha256 = Some("00".repeat(32));
    let mut o = options();
    o.allow_overwrite = true;
    let g = DownloadGroup::new(Gid(1), req, o);
    assert!(!g.download_finished_by_file_length(Some(300)));
}

#[test]
fn large_file_needs_allocation() {
    let dir = tempfile::tempdir().unwrap();
    let mut o = options();
    o.file_allocation = FileAllocation::Prealloc;
    o.no_file_allocation_limit = 0;
    let mut g = group_in(&dir, o);
    let decision = g.on_file_size_determined(URI, Some(1000), true, None).unwrap();
    assert_eq!(decision, SizeDecision::NeedsAllocation);
    let task = g.chunked_mut().unwrap();
    assert_eq!(task.kind(), crate::chunked::ChunkedKind::FileAllocation);
    assert_eq!(task.total_length(), 1000);
}

#[test]
fn small_file_skips_allocation() {
    let dir = tempfile::tempdir().unwrap();
    let mut o = options();
    o.file_allocation = FileAllocation::Prealloc;
    o.no_file_allocation_limit = 5000;
    let mut g = group_in(&dir, o);
    assert_eq!(
        g.on_file_size_determined(URI, Some(1000), true, None).unwrap(),
        SizeDecision::StartFresh
    );
    assert!(g.chunked_mut().is_none());
}

#[test]
fn close_persists_and_next_run_resumes() {
    let dir = tempfile::tempdir().unwrap();
    let data = payload(1000);
    let mut g = group_in(&dir, options());
    g.on_file_size_determined(URI, Some(1000), true, None).unwrap();
    let first = write_partial(&mut g, WorkerId(1), &data, 100);
    assert!(g.segments_mut().unwrap().complete_segment(&first));
    write_partial(&mut g, WorkerId(2), &data, 40);
    g.set_halt_requested(true);
    let result = g.close(Instant::now());
    assert_eq!(result.code, ResultCode::InProgress);
    assert_eq!(result.completed_length, 140);
    assert!(dir.path().join("f.bin.mdm").exists());
    assert!(dir.path().join("f.bin.part").exists());

    let mut g = group_in(&dir, options());
    let decision = g.on_file_size_determined(URI, Some(1000), true, None).unwrap();
    assert_eq!(decision, SizeDecision::Resume);
    assert_eq!(g.completed_length(), 140);
    let seg = g.segments_mut().unwrap().request_segment(WorkerId(9)).unwrap();
    assert_eq!((seg.index, seg.position()), (1, 140));
}

#[test]
fn finished_download_is_renamed_into_place() {
    let dir = tempfile::tempdir().unwrap();
    let data = payload(250);
    let mut g = group_in(&dir, options());
    g.on_file_size_determined(URI, Some(250), true, None).unwrap();
    complete_all(&mut g, &data);
    g.save_progress().unwrap();
    assert!(g.download_finished());

    let result = g.close(Instant::now());
    assert_eq!(result.code, ResultCode::Finished);
    assert!(result.message.is_empty());
    assert_eq!(std::fs::read(dir.path().join("f.bin")).unwrap(), data);
    assert!(!dir.path().join("f.bin.part").exists());
    assert!(!dir.path().join("f.bin.mdm").exists());
}

#[test]
fn integrity_check_gates_completion() {
    let dir = tempfile::tempdir().unwrap();
    let data = payload(250);
    let mut req = DownloadRequest::new(URI, dir.path());
    req.sha256 = Some(hex::encode(Sha256::digest(&data)).to_uppercase());
    let mut g = DownloadGroup::new(Gid(1), req, options());
    g.on_file_size_determined(URI, Some(250), true, None).unwrap();
    complete_all(&mut g, &data);

    assert!(!g.download_finished());
    assert!(g.needs_verification());
    g.prepare_verification().unwrap();
    assert!(!g.needs_verification());
    let task = g.chunked_mut().unwrap();
    while !task.is_done() {
        task.advance().unwrap();
    }
    task.outcome().unwrap();
    g.take_chunked();
    g.set_verified();
    assert!(g.download_finished());
}

#[test]
fn checksum_mismatch_discards_progress() {
    let dir = tempfile::tempdir().unwrap();
    let data = payload(250);
    let mut req = DownloadRequest::new(URI, dir.path());
    req.sha256 = Some("ab".repeat(32));
    let mut g = DownloadGroup::new(Gid(1), req, options());
    g.on_file_size_determined(URI, Some(250), true, None).unwrap();
    complete_all(&mut g, &data);
    g.prepare_verification().unwrap();
    let task = g.chunked_mut().unwrap();
    while !task.is_done() {
        task.advance().unwrap();
    }
    let err = task.outcome().unwrap_err();
    g.take_chunked();
    g.discard_progress();
    g.fail(err);

    let result = g.close(Instant::now());
    assert_eq!(result.code, ResultCode::ChecksumFailed);
    assert!(result.message.contains("checksum mismatch"));
    assert!(!dir.path().join("f.bin.mdm").exists());
    assert!(!dir.path().join("f.bin").exists());
}

#[test]
fn result_code_precedence() {
    let dir = tempfile::tempdir().unwrap();
    let mut g = group_in(&dir, options());
    assert_eq!(g.result_code(), ResultCode::UnknownError);
    g.set_halt_requested(true);
    assert_eq!(g.result_code(), ResultCode::InProgress);
    g.fail(DownloadError::abort(ResultCode::ResourceNotFound, "gone"));
    g.fail(DownloadError::fatal("later"));
    assert_eq!(g.result_code(), ResultCode::ResourceNotFound);
    assert_eq!(g.last_error().unwrap().message(), "gone");
    g.set_removal_requested();
    assert_eq!(g.result_code(), ResultCode::Removed);
}

#[test]
fn halt_clears_pause_and_blocks_connections() {
    let dir = tempfile::tempdir().unwrap();
    let mut g = group_in(&dir, options());
    assert!(g.open_connection());
    g.set_pause_requested(true);
    g.set_halt_requested(true);
    assert!(!g.is_pause_requested());
    assert!(!g.open_connection());
    assert_eq!(g.connection_count(), 1);
    g.close_connection();
    g.close_connection();
    assert_eq!(g.connection_count(), 0);

    let mut g = group_in(&dir, options());
    g.set_force_halt_requested(true);
    assert!(g.is_halt_requested());
    assert!(g.is_force_halt_requested());
}

#[test]
fn record_error_does_not_halt() {
    let dir = tempfile::tempdir().unwrap();
    let mut g = group_in(&dir, options());
    g.record_error(DownloadError::fatal("one mirror down"));
    assert!(!g.is_halt_requested());
    assert_eq!(g.result_code(), ResultCode::UnknownError);
}

#[test]
fn uris_rotate_and_drop() {
    let dir = tempfile::tempdir().unwrap();
    let mut req = DownloadRequest::new("http://a/f", dir.path());
    req.uris.push("http://b/f".into());
    let mut g = DownloadGroup::new(Gid(1), req, options());
    assert_eq!(g.next_uri().as_deref(), Some("http://a/f"));
    assert_eq!(g.next_uri().as_deref(), Some("http://b/f"));
    assert_eq!(g.next_uri().as_deref(), Some("http://a/f"));
    g.drop_uri("http://a/f");
    assert_eq!(g.failed_uris(), ["http://a/f".to_string()]);
    assert_eq!(g.next_uri().as_deref(), Some("http://b/f"));
    g.drop_uri("http://b/f");
    assert!(!g.has_uris());
    assert!(g.create_initial_task().is_none());
    assert!(g.is_halt_requested());
    assert_eq!(g.last_error().unwrap().message(), "no URI available");
}

#[test]
fn transfer_tasks_are_created_once() {
    let dir = tempfile::tempdir().unwrap();
    let mut g = group_in(&dir, options());
    assert!(g.create_initial_task().is_some());
    assert_eq!(g.create_transfer_tasks(3).len(), 3);
    assert!(g.create_transfer_tasks(3).is_empty());
    g.reset_for_requeue();
    assert_eq!(g.create_transfer_tasks(2).len(), 2);
}

#[test]
fn piece_storage_group_reports_from_bitmap() {
    let dir = tempfile::tempdir().unwrap();
    let mut g = group_in(&dir, options()).with_piece_storage(Box::new(BitmapPieceStorage::new(1000, 400)));
    assert!(g.create_initial_task().is_none());
    assert_eq!(g.total_length(), Some(1000));
    let pieces = g.piece_storage_mut().unwrap();
    for i in 0..pieces.piece_count() {
        pieces.complete_piece(i);
    }
    assert_eq!(g.completed_length(), 1000);
    assert!(g.download_finished());
}

#[test]
fn stat_tracks_session_bytes() {
    let dir = tempfile::tempdir().unwrap();
    let mut g = group_in(&dir, options());
    let t0 = Instant::now();
    g.record_progress(t0, 500);
    g.record_progress(t0 + Duration::from_millis(500), 500);
    assert_eq!(g.stat(t0 + Duration::from_secs(1)).session_download_length, 1000);
}

#[test]
fn fast_worker_takes_over_slow_segment() {
    let dir = tempfile::tempdir().unwrap();
    let data = payload(200);
    let mut o = options();
    o.startup_idle_time = Duration::ZERO;
    let mut g = group_in(&dir, o);
    g.on_file_size_determined(URI, Some(200), true, None).unwrap();
    let t0 = Instant::now();
    g.start_worker(WorkerId(1), t0);
    g.start_worker(WorkerId(2), t0);
    let slow = write_partial(&mut g, WorkerId(1), &data, 10);
    g.record_worker_progress(WorkerId(1), t0, 10);
    let mut fast = g.segments_mut().unwrap().request_segment(WorkerId(2)).unwrap();
    fast.written = 100;
    g.record_worker_progress(WorkerId(2), t0, 100);
    assert!(g.segments_mut().unwrap().complete_segment(&fast));

    let taken = g.take_over_slow_segment(WorkerId(2), t0).unwrap();
    assert_eq!((taken.index, taken.position()), (slow.index, 10));
    assert!(!g.segments().unwrap().is_owned(&slow));
    // the old owner is no longer measured, so it cannot take the segment back
    assert!(g.take_over_slow_segment(WorkerId(1), t0).is_none());

    let mut o = options();
    o.startup_idle_time = Duration::ZERO;
    o.reassign_slow_segments = false;
    let mut g = group_in(&dir, o);
    g.on_file_size_determined(URI, Some(200), true, None).unwrap();
    g.start_worker(WorkerId(1), t0);
    write_partial(&mut g, WorkerId(1), &data, 10);
    g.record_worker_progress(WorkerId(2), t0, 100);
    assert!(g.take_over_slow_segment(WorkerId(2), t0).is_none());
}
