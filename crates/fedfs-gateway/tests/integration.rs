//! End-to-end scenarios over the in-memory federation.

mod common;

use std::io::Write;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use common::{pattern, pool, remote, TestGateway};
use fedfs_gateway::buffered::BufferedFs;
use fedfs_gateway::direct::DirectFs;
use fedfs_gateway::{BlockStatus, ConnClass, ConnectionPool, GatewayConfig, PoolConfig, Registry};
use fedfs_rpc::memory::MemoryStore;
use fedfs_rpc::{OpenFlags, Watchdog, WatchdogConfig};

#[test]
fn test_eleventh_acquire_shares_least_referenced_connection() {
    let store = MemoryStore::new();
    let pool = pool(&store, PoolConfig::default());

    let leases: Vec<_> = (0..10)
        .map(|_| pool.acquire(ConnClass::FileIo).unwrap())
        .collect();
    assert_eq!(store.counts().connects, 10);

    let eleventh = pool.acquire(ConnClass::FileIo).unwrap();
    assert_eq!(eleventh.id(), leases[0].id());
    assert_eq!(eleventh.refs(), 2);

    let twelfth = pool.acquire(ConnClass::FileIo).unwrap();
    assert_eq!(twelfth.id(), leases[1].id());
    assert_eq!(store.counts().connects, 10);

    let stats = pool.stats();
    assert_eq!(stats.file_io_busy, 10);
    assert_eq!(stats.total_refs, 12);
}

#[test]
fn test_reaper_disconnects_idle_connection() {
    let store = MemoryStore::new();
    let pool = pool(
        &store,
        PoolConfig {
            max_connections: 4,
            idle_timeout: Duration::from_millis(30),
            keepalive_interval: Duration::from_secs(3600),
            reaper_interval: Duration::from_millis(5),
        },
    );
    pool.start_reaper().unwrap();

    let first_id = {
        let lease = pool.acquire(ConnClass::FileIo).unwrap();
        lease.id()
    };
    assert_eq!(pool.stats().file_io_free, 1);

    thread::sleep(Duration::from_millis(150));
    assert_eq!(pool.stats().file_io_free, 0);
    assert_eq!(store.live_sessions(), 0);
    assert!(pool.stats().reaped >= 1);

    let lease = pool.acquire(ConnClass::FileIo).unwrap();
    assert_ne!(lease.id(), first_id);
    assert_eq!(store.counts().connects, 2);
}

#[test]
fn test_keepalive_pings_idle_connection() {
    let store = MemoryStore::new();
    let pool = pool(
        &store,
        PoolConfig {
            max_connections: 4,
            idle_timeout: Duration::from_secs(3600),
            keepalive_interval: Duration::from_millis(10),
            reaper_interval: Duration::from_secs(3600),
        },
    );
    drop(pool.acquire(ConnClass::FileIo).unwrap());
    thread::sleep(Duration::from_millis(20));
    let report = pool.sweep();
    assert_eq!(report.keepalives, 1);
    assert_eq!(store.counts().noops, 1);
}

#[test]
fn test_displaced_delta_is_pushed_before_new_one() {
    let gw = TestGateway::start(common::config(1024 * 1024, 3));
    gw.seed("/f", b"");
    let fh = gw.ops.open("/f", libc::O_WRONLY).unwrap();

    gw.ops.write(fh, 0, b"0123456789").unwrap();
    assert!(gw.remote_bytes("/f").is_empty());

    gw.ops.write(fh, 2_000_000, b"abcde").unwrap();
    assert_eq!(gw.remote_bytes("/f"), b"0123456789");
    let pending = gw.gateway().buffered().pending_delta(&remote("/f")).unwrap();
    assert_eq!(pending.offset, 2_000_000);
    assert_eq!(pending.len, 5);

    gw.ops.release(fh).unwrap();
    let data = gw.remote_bytes("/f");
    assert_eq!(data.len(), 2_000_005);
    assert_eq!(&data[2_000_000..], b"abcde");
}

#[test]
fn test_sequential_read_is_prefetched() {
    let bs = 64usize;
    let gw = TestGateway::with_blocks(bs as u64, 3);
    let data = pattern(bs * 8);
    gw.seed("/big", &data);
    let fh = gw.ops.open("/big", libc::O_RDONLY).unwrap();
    let preload = gw.gateway().preload();

    let first = gw.ops.read(fh, 0, bs).unwrap();
    assert_eq!(first, data[..bs].to_vec());
    preload.wait_idle(fh);
    let window = preload.window(fh);
    for block in 1..=3u64 {
        assert!(
            window.contains(&(block, BlockStatus::Completed)),
            "block {} not prefetched: {:?}",
            block,
            window
        );
    }

    for block in 1..6usize {
        let got = gw.ops.read(fh, (block * bs) as u64, bs).unwrap();
        assert_eq!(got, data[block * bs..(block + 1) * bs].to_vec());
    }
    let stats = preload.stats();
    assert_eq!(stats.hits, 6);
    assert_eq!(stats.misses, 0);
    assert_eq!(stats.fallbacks, 0);
}

#[test]
fn test_failed_prefetch_falls_back_to_direct_read() {
    let gw = TestGateway::with_blocks(32, 3);
    let data = pattern(200);
    gw.seed("/f", &data);
    gw.store.fail_reads_from_open(&remote("/f"), 1);

    let fh = gw.ops.open("/f", libc::O_RDONLY).unwrap();
    assert_eq!(gw.ops.read(fh, 0, 200).unwrap(), data);
    assert_eq!(gw.ops.read(fh, 100, 50).unwrap(), data[100..150].to_vec());
    assert!(gw.gateway().preload().stats().fallbacks >= 2);
    gw.ops.release(fh).unwrap();
}

#[test]
fn test_dirty_read_on_same_handle() {
    let gw = TestGateway::with_blocks(16, 3);
    gw.seed("/f", &pattern(64));
    let fh = gw.ops.open("/f", libc::O_RDWR).unwrap();
    gw.ops.write(fh, 20, b"dirty").unwrap();
    assert_eq!(gw.ops.read(fh, 20, 5).unwrap(), b"dirty");
    assert_eq!(gw.remote_bytes("/f"), pattern(64));
}

#[test]
fn test_unflushed_write_visible_to_other_handle() {
    let gw = TestGateway::with_blocks(16, 2);
    gw.seed("/f", &pattern(64));
    let writer = gw.ops.open("/f", libc::O_WRONLY).unwrap();
    let reader = gw.ops.open("/f", libc::O_RDONLY).unwrap();
    gw.ops.write(writer, 4, b"XY").unwrap();
    assert_eq!(gw.ops.read(reader, 4, 2).unwrap(), b"XY");
}

#[test]
fn test_close_makes_writes_visible_to_fresh_open() {
    let gw = TestGateway::with_blocks(16, 3);
    gw.seed("/f", b"");
    let w = gw.ops.open("/f", libc::O_WRONLY).unwrap();
    gw.ops.write(w, 0, b"first block!").unwrap();
    gw.ops.write(w, 40, b"later").unwrap();
    gw.ops.release(w).unwrap();

    let r = gw.ops.open("/f", libc::O_RDONLY).unwrap();
    let got = gw.ops.read(r, 0, 64).unwrap();
    assert_eq!(got.len(), 45);
    assert_eq!(&got[..12], b"first block!");
    assert_eq!(&got[40..], b"later");
    assert_eq!(gw.ops.getattr("/f").unwrap().size, 45);
}

#[test]
fn test_flush_commits_without_closing() {
    let gw = TestGateway::with_blocks(16, 3);
    gw.seed("/f", b"");
    let w = gw.ops.open("/f", libc::O_WRONLY).unwrap();
    gw.ops.write(w, 0, b"abc").unwrap();
    gw.ops.flush(w).unwrap();
    assert_eq!(gw.remote_bytes("/f"), b"abc");
    gw.ops.write(w, 3, b"def").unwrap();
    gw.ops.fsync(w).unwrap();
    assert_eq!(gw.remote_bytes("/f"), b"abcdef");
}

#[test]
fn test_transport_error_is_retried_transparently() {
    let gw = TestGateway::with_blocks(16, 1);
    let data = pattern(48);
    gw.seed("/f", &data);
    let mut config = common::config(16, 1);
    config.preload.enabled = false;
    let gw_plain = TestGateway::start(config);
    gw_plain.seed("/f", &data);

    let fh = gw_plain.ops.open("/f", libc::O_RDONLY).unwrap();
    gw_plain.store.inject_transport_errors("read", 1);
    assert_eq!(gw_plain.ops.read(fh, 0, 48).unwrap(), data);
    assert!(gw_plain.gateway().pool().stats().reconnects >= 1);

    let fh = gw.ops.open("/f", libc::O_RDONLY).unwrap();
    gw.store.inject_transport_errors("read", 1);
    assert_eq!(gw.ops.read(fh, 0, 48).unwrap(), data);
}

#[test]
fn test_watchdog_aborts_hung_read_and_retry_succeeds() {
    let store = MemoryStore::new();
    let data = pattern(40);
    store.put("/z/f", &data);
    let watchdog = Arc::new(
        Watchdog::start(WatchdogConfig {
            call_timeout: Duration::from_millis(20),
            sweep_interval: Duration::from_millis(5),
        })
        .unwrap(),
    );
    let pool = ConnectionPool::new(
        PoolConfig::default(),
        Arc::new(store.connector()),
        common::addr(),
        Some(Arc::clone(&watchdog)),
    );
    let registry = Arc::new(Registry::new(Arc::new(pool)));
    let fs = BufferedFs::new(DirectFs::new(registry), 64);

    let h = fs.open("/z/f", OpenFlags::ReadOnly).unwrap();
    store.slow_next_reads(1, Duration::from_millis(500));
    assert_eq!(fs.read(&h, 0, 40).unwrap(), data);
    assert!(watchdog.aborted_total() >= 1);
    watchdog.stop();
}

#[test]
fn test_truncate_and_unlink_keep_cache_coherent() {
    let gw = TestGateway::with_blocks(16, 2);
    gw.seed("/f", &pattern(40));
    let fh = gw.ops.open("/f", libc::O_RDWR).unwrap();
    gw.gateway().preload().wait_idle(fh);
    gw.ops.write(fh, 30, b"tail").unwrap();
    gw.ops.truncate("/f", 10).unwrap();
    assert_eq!(gw.ops.read(fh, 0, 64).unwrap(), pattern(10));
    assert_eq!(gw.ops.getattr("/f").unwrap().size, 10);
    gw.ops.release(fh).unwrap();

    gw.ops.unlink("/f").unwrap();
    assert_eq!(gw.ops.getattr("/f"), Err(libc::ENOENT));
}

#[test]
fn test_direct_path_when_cache_disabled() {
    let mut config = common::config(16, 3);
    config.cache.enabled = false;
    let gw = TestGateway::start(config);
    gw.seed("/f", b"");
    let fh = gw.ops.open("/f", libc::O_WRONLY).unwrap();
    gw.ops.write(fh, 0, b"straight").unwrap();
    assert_eq!(gw.remote_bytes("/f"), b"straight");
    gw.ops.release(fh).unwrap();
}

#[test]
fn test_concurrent_readers_on_distinct_files() {
    let gw = Arc::new(TestGateway::with_blocks(32, 3));
    let files: Vec<(String, Vec<u8>)> = (0..6)
        .map(|i| (format!("/f{}", i), pattern(300 + i * 17)))
        .collect();
    for (path, data) in &files {
        gw.seed(path, data);
    }

    let workers: Vec<_> = files
        .into_iter()
        .map(|(path, data)| {
            let gw = Arc::clone(&gw);
            thread::spawn(move || {
                let fh = gw.ops.open(&path, libc::O_RDONLY).unwrap();
                let mut got = Vec::new();
                loop {
                    let chunk = gw.ops.read(fh, got.len() as u64, 50).unwrap();
                    if chunk.is_empty() {
                        break;
                    }
                    got.extend_from_slice(&chunk);
                }
                gw.ops.release(fh).unwrap();
                assert_eq!(got, data);
            })
        })
        .collect();
    for worker in workers {
        worker.join().unwrap();
    }
    assert_eq!(gw.gateway().registry().open_files(), 0);
    assert_eq!(gw.gateway().pool().stats().total_refs, 0);
}

#[test]
fn test_shutdown_flushes_pending_writes() {
    let gw = TestGateway::with_blocks(16, 3);
    gw.seed("/f", b"");
    let fh = gw.ops.open("/f", libc::O_WRONLY).unwrap();
    gw.ops.write(fh, 0, b"unsaved").unwrap();
    gw.gateway().shutdown();
    assert_eq!(gw.remote_bytes("/f"), b"unsaved");
    assert_eq!(gw.store.live_sessions(), 0);
}

#[test]
fn test_config_file_drives_gateway() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    write!(
        file,
        r#"{{
            "server": {{ "remote_root": "{}" }},
            "cache": {{ "block_size": 32 }},
            "preload": {{ "window": 2 }}
        }}"#,
        common::ROOT
    )
    .unwrap();

    let config = GatewayConfig::load(file.path()).unwrap();
    assert_eq!(config.pool.max_connections, 10);
    let gw = TestGateway::start(config);
    gw.seed("/f", &pattern(100));
    let fh = gw.ops.open("/f", libc::O_RDONLY).unwrap();
    assert_eq!(gw.ops.read(fh, 10, 80).unwrap(), pattern(100)[10..90].to_vec());
    assert_eq!(gw.gateway().buffered().geometry().block_size(), 32);
}

#[test]
fn test_oversized_read_returns_file_bytes_on_every_path() {
    let data = pattern(10);
    for (cache, preload) in [(false, false), (true, false), (true, true)] {
        let mut config = common::config(16, 3);
        config.cache.enabled = cache;
        config.preload.enabled = preload;
        let gw = TestGateway::start(config);
        gw.seed("/small", &data);
        let fh = gw.ops.open("/small", libc::O_RDONLY).unwrap();
        assert_eq!(gw.ops.read(fh, 0, 1usize << 44).unwrap(), data);
        assert_eq!(gw.ops.read(fh, 4, 1usize << 44).unwrap(), data[4..].to_vec());
        assert!(gw.ops.read(fh, 1 << 40, 1usize << 44).unwrap().is_empty());
        gw.ops.release(fh).unwrap();
    }
}

#[test]
fn test_read_on_released_handle_does_not_reopen() {
    let mut config = common::config(16, 3);
    config.preload.enabled = false;
    let gw = TestGateway::start(config);
    gw.seed("/f", &pattern(32));
    let fh = gw.ops.open("/f", libc::O_RDONLY).unwrap();
    let handle = gw.gateway().registry().get(fh).unwrap();
    gw.ops.read(fh, 0, 4).unwrap();
    gw.ops.release(fh).unwrap();

    let opens = gw.store.counts().opens;
    assert!(matches!(
        gw.gateway().direct().read(&handle, 0, 4),
        Err(fedfs_gateway::GatewayError::BadHandle { .. })
    ));
    assert_eq!(gw.store.counts().opens, opens);
    assert_eq!(gw.store.counts().closes, gw.store.counts().opens);
}
