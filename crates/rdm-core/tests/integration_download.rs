//! End-to-end download scenarios over an in-process mock host network:
//! byte-exact reconstruction, overdrive hedging, host failover, and
//! shutdown behavior.

mod common;

use std::sync::Arc;
use std::time::{Duration, Instant};

use rdm_core::config::RenterConfig;
use rdm_core::error::DownloadError;
use rdm_core::filemap::IdentityResolver;
use rdm_core::renter::{DownloadParams, Renter};
use tempfile::tempdir;

fn test_config() -> RenterConfig {
    RenterConfig {
        memory_budget: 64 * 1024 * 1024,
        default_latency_target_ms: 200,
        default_overdrive: 0,
        min_fetch_timeout_ms: 2_000,
        ..RenterConfig::default()
    }
}

fn renter_for(file: &common::TestFile) -> Renter {
    let renter = Renter::new(test_config(), Arc::new(IdentityResolver));
    for (contract, host) in &file.hosts {
        renter.add_host(*contract, Arc::clone(host) as _);
    }
    renter
}

#[tokio::test]
async fn whole_file_round_trip() {
    let file = common::build_file(
        "vault/report.pdf",
        common::test_data(1024),
        1024,
        2,
        4,
        Duration::from_millis(5),
    );
    let renter = renter_for(&file);
    renter.insert_file(file.snapshot);

    let dir = tempdir().unwrap();
    let dest = dir.path().join("report.pdf");
    renter
        .download(DownloadParams {
            path: "vault/report.pdf".into(),
            offset: 0,
            length: 0,
            destination: Some(dest.clone()),
            ..Default::default()
        })
        .await
        .expect("download should complete");

    assert_eq!(std::fs::read(&dest).unwrap(), file.data);

    let history = renter.download_history();
    assert_eq!(history.len(), 1);
    assert!(history[0].completed);
    assert_eq!(history[0].length, 1024);
    assert_eq!(history[0].received, 1024);
    assert!(history[0].total_data_transferred >= 1024);
    assert_eq!(history[0].error, "");
    assert_eq!(renter.memory_outstanding(), 0);
    renter.shutdown().await;
}

#[tokio::test]
async fn partial_read_mid_chunk() {
    const MIB: u64 = 1024 * 1024;
    let file = common::build_file(
        "vault/video.mkv",
        common::test_data(10 * MIB as usize),
        4 * MIB,
        2,
        4,
        Duration::from_millis(5),
    );
    let renter = renter_for(&file);
    renter.insert_file(file.snapshot);

    let dir = tempdir().unwrap();
    let dest = dir.path().join("clip.bin");
    renter
        .download(DownloadParams {
            path: "vault/video.mkv".into(),
            offset: 5 * MIB,
            length: 2 * MIB,
            destination: Some(dest.clone()),
            ..Default::default()
        })
        .await
        .expect("partial download should complete");

    let written = std::fs::read(&dest).unwrap();
    assert_eq!(written.len() as u64, 2 * MIB);
    assert_eq!(
        written,
        &file.data[(5 * MIB) as usize..(7 * MIB) as usize]
    );
    assert_eq!(renter.memory_outstanding(), 0);
    renter.shutdown().await;
}

#[tokio::test]
async fn multi_chunk_range_crossing_boundaries() {
    let file = common::build_file(
        "vault/archive.tar",
        common::test_data(1024 * 1024),
        256 * 1024,
        4,
        8,
        Duration::from_millis(3),
    );
    let renter = renter_for(&file);
    renter.insert_file(file.snapshot);

    // Ranges chosen to hit first-chunk offsets, tail remainders, and
    // full-chunk middles.
    let dir = tempdir().unwrap();
    for (i, (offset, length)) in [
        (100_000u64, 500_000u64),
        (262_144, 262_144),
        (0, 1),
        (1_048_575, 1),
        (200_000, 0),
    ]
    .iter()
    .enumerate()
    {
        let dest = dir.path().join(format!("range-{i}.bin"));
        renter
            .download(DownloadParams {
                path: "vault/archive.tar".into(),
                offset: *offset,
                length: *length,
                destination: Some(dest.clone()),
                ..Default::default()
            })
            .await
            .unwrap_or_else(|e| panic!("range {i} failed: {e}"));
        let expected_len = if *length == 0 {
            file.data.len() as u64 - offset
        } else {
            *length
        };
        let written = std::fs::read(&dest).unwrap();
        assert_eq!(written.len() as u64, expected_len, "range {i} length");
        assert_eq!(
            written,
            &file.data[*offset as usize..(*offset + expected_len) as usize],
            "range {i} content"
        );
    }
    assert_eq!(renter.memory_outstanding(), 0);
    renter.shutdown().await;
}

#[tokio::test]
async fn slow_host_is_hedged_by_overdrive() {
    let file = common::build_file(
        "vault/latency.bin",
        common::test_data(4096),
        4096,
        2,
        4,
        Duration::from_millis(10),
    );
    // One of the four hosts is dramatically slower than the rest.
    file.hosts[1].1.set_latency(Duration::from_secs(3));

    let renter = renter_for(&file);
    renter.insert_file(file.snapshot);

    let dir = tempdir().unwrap();
    let dest = dir.path().join("latency.bin");
    let started = Instant::now();
    renter
        .download(DownloadParams {
            path: "vault/latency.bin".into(),
            offset: 0,
            length: 0,
            destination: Some(dest.clone()),
            overdrive: Some(2),
            ..Default::default()
        })
        .await
        .expect("hedged download should complete");
    let elapsed = started.elapsed();

    // With overdrive fetching all four pieces, the two fast hosts finish the
    // chunk; completion must not wait out the slow host.
    assert!(
        elapsed < Duration::from_secs(1),
        "download took {elapsed:?}, slow host was not hedged"
    );
    assert_eq!(std::fs::read(&dest).unwrap(), file.data);

    // One chunk, K + overdrive = 4: each host is asked at most once.
    let total_fetches: u64 = file.hosts.iter().map(|(_, h)| h.fetches()).sum();
    assert!(
        total_fetches <= 4,
        "expected at most K + overdrive fetches, saw {total_fetches}"
    );
    renter.shutdown().await;
}

#[tokio::test]
async fn failing_hosts_fail_over_to_healthy_ones() {
    let file = common::build_file(
        "vault/flaky.bin",
        common::test_data(2048),
        2048,
        2,
        4,
        Duration::from_millis(5),
    );
    // Two of four hosts error on every fetch; the two healthy ones must
    // carry the chunk no matter which pair is tried first.
    file.hosts[0].1.set_failing(true);
    file.hosts[2].1.set_failing(true);

    let renter = renter_for(&file);
    renter.insert_file(file.snapshot);

    let dir = tempdir().unwrap();
    let dest = dir.path().join("flaky.bin");
    renter
        .download(DownloadParams {
            path: "vault/flaky.bin".into(),
            offset: 0,
            length: 0,
            destination: Some(dest.clone()),
            ..Default::default()
        })
        .await
        .expect("download should fail over to healthy hosts");
    assert_eq!(std::fs::read(&dest).unwrap(), file.data);
    assert_eq!(renter.memory_outstanding(), 0);
    renter.shutdown().await;
}

#[tokio::test]
async fn host_dropped_mid_fetch_fails_over() {
    let file = common::build_file(
        "vault/failover.bin",
        common::test_data(2048),
        2048,
        2,
        4,
        Duration::from_millis(10),
    );
    // Start with two live hosts; the second hangs once it accepts the job.
    file.hosts[1].1.set_latency(Duration::from_secs(30));

    let renter = Renter::new(test_config(), Arc::new(IdentityResolver));
    renter.add_host(file.hosts[0].0, Arc::clone(&file.hosts[0].1) as _);
    renter.add_host(file.hosts[1].0, Arc::clone(&file.hosts[1].1) as _);
    renter.insert_file(file.snapshot);

    let dir = tempdir().unwrap();
    let dest = dir.path().join("failover.bin");
    let download = renter
        .download_async(DownloadParams {
            path: "vault/failover.bin".into(),
            offset: 0,
            length: 0,
            destination: Some(dest.clone()),
            ..Default::default()
        })
        .expect("queue download");

    // Let the hanging host accept its piece job, then bring up a standby
    // host and kill the hung one.
    tokio::time::sleep(Duration::from_millis(100)).await;
    renter.add_host(file.hosts[2].0, Arc::clone(&file.hosts[2].1) as _);
    renter.remove_host(file.hosts[1].0);

    tokio::time::timeout(Duration::from_secs(5), download.wait())
        .await
        .expect("failover should not hang")
        .expect("download should succeed via the standby host");
    assert_eq!(std::fs::read(&dest).unwrap(), file.data);
    assert_eq!(renter.memory_outstanding(), 0);
    renter.shutdown().await;
}

#[tokio::test]
async fn insufficient_hosts_fails_cleanly() {
    let file = common::build_file(
        "vault/sparse.bin",
        common::test_data(2048),
        2048,
        2,
        4,
        Duration::from_millis(5),
    );
    let renter = Renter::new(test_config(), Arc::new(IdentityResolver));
    // Only one of the required two piece sources is reachable.
    renter.add_host(file.hosts[0].0, Arc::clone(&file.hosts[0].1) as _);
    renter.insert_file(file.snapshot);

    let dir = tempdir().unwrap();
    let err = renter
        .download(DownloadParams {
            path: "vault/sparse.bin".into(),
            offset: 0,
            length: 0,
            destination: Some(dir.path().join("sparse.bin")),
            ..Default::default()
        })
        .await
        .expect_err("download must fail");
    assert!(
        matches!(err, DownloadError::InsufficientHosts { available: 1, needed: 2, .. }),
        "unexpected error: {err}"
    );

    let history = renter.download_history();
    assert!(history[0].completed);
    assert!(history[0].error.contains("insufficient hosts"));
    assert_eq!(renter.memory_outstanding(), 0);
    renter.shutdown().await;
}

#[tokio::test]
async fn shutdown_interrupts_downloads_in_flight() {
    let file = common::build_file(
        "vault/huge.bin",
        common::test_data(256 * 1024),
        64 * 1024,
        2,
        4,
        Duration::from_millis(300),
    );
    let renter = renter_for(&file);
    renter.insert_file(file.snapshot);

    let dir = tempdir().unwrap();
    let download = renter
        .download_async(DownloadParams {
            path: "vault/huge.bin".into(),
            offset: 0,
            length: 0,
            destination: Some(dir.path().join("huge.bin")),
            ..Default::default()
        })
        .expect("queue download");

    // Chunks are mid-flight when the shutdown lands.
    tokio::time::sleep(Duration::from_millis(50)).await;
    renter.shutdown().await;

    assert!(download.is_complete());
    assert_eq!(download.err(), Some(DownloadError::Interrupted));
    let history = renter.download_history();
    assert!(
        history[0]
            .error
            .starts_with("download interrupted by shutdown"),
        "history error: {}",
        history[0].error
    );
    assert_eq!(renter.memory_outstanding(), 0);
}

#[tokio::test]
async fn streamed_download_arrives_in_order() {
    use std::io::Write;
    use std::sync::Mutex;

    #[derive(Clone, Default)]
    struct SharedBuf(Arc<Mutex<Vec<u8>>>);
    impl Write for SharedBuf {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }
        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    let file = common::build_file(
        "vault/stream.bin",
        common::test_data(512 * 1024),
        64 * 1024,
        2,
        4,
        Duration::from_millis(2),
    );
    let renter = renter_for(&file);
    renter.insert_file(file.snapshot);

    let out = SharedBuf::default();
    renter
        .download(DownloadParams {
            path: "vault/stream.bin".into(),
            offset: 100_000,
            length: 300_000,
            http_writer: Some(Box::new(out.clone())),
            ..Default::default()
        })
        .await
        .expect("streamed download should complete");

    let written = out.0.lock().unwrap().clone();
    assert_eq!(written, &file.data[100_000..400_000]);
    renter.shutdown().await;
}

#[tokio::test]
async fn progress_counters_are_monotonic_and_bounded() {
    let file = common::build_file(
        "vault/progress.bin",
        common::test_data(128 * 1024),
        32 * 1024,
        2,
        4,
        Duration::from_millis(20),
    );
    let renter = renter_for(&file);
    renter.insert_file(file.snapshot);

    let dir = tempdir().unwrap();
    let download = renter
        .download_async(DownloadParams {
            path: "vault/progress.bin".into(),
            offset: 0,
            length: 0,
            destination: Some(dir.path().join("progress.bin")),
            overdrive: Some(1),
            ..Default::default()
        })
        .expect("queue download");

    let mut last_received = 0u64;
    while !download.is_complete() {
        let received = download.data_received();
        assert!(received >= last_received, "received went backwards");
        assert!(received <= download.length, "received exceeds length");
        assert!(download.total_transferred() >= received);
        last_received = received;
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    download.wait().await.expect("download should succeed");
    assert_eq!(download.data_received(), download.length);
    assert!(download.total_transferred() >= download.length);
    renter.shutdown().await;
}
