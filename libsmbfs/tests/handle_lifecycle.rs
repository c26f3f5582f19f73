mod common;

use std::time::Duration;

use common::{CONTENT, FILE, fast_config, setup, setup_with};
use futures::future::join_all;
use libsmbfs::rpc::{CloseFlags, Rights};
use libsmbfs::slot::AccessCounters;
use libsmbfs::{AccessMode, ClientConfig, DeferredReusePolicy, OpenFlags, SlotKind, SmbFsError};

#[tokio::test]
async fn test_read_only_close_is_deferred_and_reused() {
    let (server, share) = setup();
    let node = share.lookup(FILE);

    let token = share.open_for_access(&node, OpenFlags::READ).await.unwrap();
    assert_eq!(token.slot, SlotKind::Shared);
    let data = share.read(&node, &token, 0, 4).await.unwrap();
    assert_eq!(data, b"0123");
    share.close_handle(&node, token).await.unwrap();

    let snap = node.snapshot().await;
    assert!(snap.shared.deferred);
    assert_eq!(snap.shared.refcount, 0);
    assert_eq!(share.deferred_stats().current, 1);
    assert_eq!(server.open_handle_count(FILE), 1);
    assert_eq!(server.stats().closes, 0);

    let token = share.open_for_access(&node, OpenFlags::READ).await.unwrap();
    assert_eq!(server.stats().opens, 1, "reuse must not hit the server");
    assert_eq!(share.deferred_stats().current, 0);
    let snap = node.snapshot().await;
    assert!(!snap.shared.deferred);
    assert_eq!(snap.shared.refcount, 1);
    assert_eq!(snap.lease.handle_reuse_count, 1);
    share.close_handle(&node, token).await.unwrap();
}

#[tokio::test]
async fn test_two_readers_last_close_defers() {
    let (server, share) = setup();
    let node = share.lookup(FILE);
    let first = share.open_for_access(&node, OpenFlags::READ).await.unwrap();
    let second = share.open_for_access(&node, OpenFlags::READ).await.unwrap();
    let snap = node.snapshot().await;
    assert_eq!(snap.shared.refcount, 2);
    assert_eq!(snap.shared.counters.read, 2);
    assert_eq!(server.stats().opens, 1);

    share.close_handle(&node, first).await.unwrap();
    assert_eq!(node.snapshot().await.shared.refcount, 1);
    assert_eq!(server.stats().closes, 0);

    share.close_handle(&node, second).await.unwrap();
    let snap = node.snapshot().await;
    assert_eq!(snap.shared.refcount, 0);
    assert!(snap.shared.deferred);
    assert_eq!(server.stats().closes, 0);
    assert_eq!(share.deferred_stats().current, 1);
}

#[tokio::test]
async fn test_write_only_without_lease_closes_with_postquery() {
    let (server, share) = setup();
    server.set_faults(|f| f.deny_rights = Rights::READ_DATA);
    let node = share.lookup(FILE);

    let token = share.open_for_access(&node, OpenFlags::WRITE).await.unwrap();
    let stats = server.stats();
    assert_eq!(stats.opens, 3, "full, no-ACL, then no-read attempt");
    assert_eq!(stats.last_open_lease, None);
    let rights = stats.last_open_rights.unwrap();
    assert!(!rights.contains(Rights::READ_DATA));
    assert!(!rights.contains(Rights::WRITE_DAC));

    share.write(&node, &token, 16, b"xyz").await.unwrap();
    share.close_handle(&node, token).await.unwrap();

    let stats = server.stats();
    assert_eq!(stats.closes, 1);
    assert_eq!(stats.last_close_flags, Some(CloseFlags::POSTQUERY_ATTRIB));
    let snap = node.snapshot().await;
    assert!(!snap.shared.deferred);
    assert_eq!(snap.attrs.map(|a| a.size), Some(CONTENT.len() as u64 + 3));
    assert_eq!(share.deferred_stats().current, 0);
}

#[tokio::test]
async fn test_acl_write_dropped_on_access_denied() {
    let (server, share) = setup();
    server.set_faults(|f| f.deny_rights = Rights::WRITE_DAC);
    let node = share.lookup(FILE);

    let token = share
        .open_for_access(&node, OpenFlags::READ | OpenFlags::WRITE)
        .await
        .unwrap();
    let stats = server.stats();
    assert_eq!(stats.opens, 2);
    assert!(!stats.last_open_rights.unwrap().contains(Rights::WRITE_DAC));
    assert!(stats.last_open_lease.is_some());
    assert_eq!(node.snapshot().await.shared.access, Some(AccessMode::ReadWrite));
    share.close_handle(&node, token).await.unwrap();
}

#[tokio::test]
async fn test_upgrade_then_downgrade_shared_handle() {
    let (server, share) = setup();
    let node = share.lookup(FILE);

    let reader = share.open_for_access(&node, OpenFlags::READ).await.unwrap();
    let writer = share.open_for_access(&node, OpenFlags::WRITE).await.unwrap();
    let snap = node.snapshot().await;
    assert_eq!(snap.shared.access, Some(AccessMode::ReadWrite));
    assert_eq!(snap.shared.refcount, 2);
    assert_eq!(
        snap.shared.counters,
        AccessCounters {
            read: 1,
            write: 1,
            read_write: 0
        }
    );
    assert_eq!(server.open_handle_count(FILE), 1);
    assert_eq!(server.stats().closes, 1, "old handle replaced");

    share.write(&node, &writer, 0, b"AB").await.unwrap();
    share.close_handle(&node, writer).await.unwrap();
    let snap = node.snapshot().await;
    assert_eq!(snap.shared.access, Some(AccessMode::Read));
    assert_eq!(snap.shared.refcount, 1);
    assert_eq!(server.open_handle_count(FILE), 1);

    let data = share.read(&node, &reader, 0, 2).await.unwrap();
    assert_eq!(data, b"AB");
    share.close_handle(&node, reader).await.unwrap();
}

#[tokio::test]
async fn test_downgrade_disabled_keeps_handle() {
    let (server, share) = setup_with(ClientConfig {
        enable_downgrade: false,
        ..Default::default()
    });
    let node = share.lookup(FILE);
    let reader = share.open_for_access(&node, OpenFlags::READ).await.unwrap();
    let writer = share
        .open_for_access(&node, OpenFlags::READ | OpenFlags::WRITE)
        .await
        .unwrap();
    share.close_handle(&node, writer).await.unwrap();
    assert_eq!(node.snapshot().await.shared.access, Some(AccessMode::ReadWrite));
    assert_eq!(server.stats().opens, 2);
    share.close_handle(&node, reader).await.unwrap();
}

#[tokio::test]
async fn test_exclusive_conflicts_return_busy_without_state_change() {
    let (server, share) = setup();
    let node = share.lookup(FILE);

    let held = share
        .open_for_access(&node, OpenFlags::READ | OpenFlags::EXLOCK)
        .await
        .unwrap();
    assert_eq!(held.slot, SlotKind::Exclusive);
    let opens = server.stats().opens;

    for flags in [
        OpenFlags::READ | OpenFlags::EXLOCK,
        OpenFlags::READ | OpenFlags::SHLOCK,
    ] {
        let err = share.open_for_access(&node, flags).await.unwrap_err();
        assert!(matches!(err, SmbFsError::Busy));
        assert_eq!(err.errno(), libc::EBUSY);
    }
    let snap = node.snapshot().await;
    assert_eq!(snap.exclusive.refcount, 1);
    assert_eq!(server.stats().opens, opens);
    share.close_handle(&node, held).await.unwrap();
}

#[tokio::test]
async fn test_exlock_refused_by_server_while_shared_open() {
    let (_server, share) = setup();
    let node = share.lookup(FILE);
    let shared = share.open_for_access(&node, OpenFlags::READ).await.unwrap();

    let err = share
        .open_for_access(&node, OpenFlags::READ | OpenFlags::EXLOCK)
        .await
        .unwrap_err();
    assert!(matches!(err, SmbFsError::Busy));
    let snap = node.snapshot().await;
    assert_eq!(snap.exclusive.refcount, 0);
    assert!(!snap.exclusive.remote.is_valid());
    assert_eq!(snap.shared.refcount, 1);
    share.close_handle(&node, shared).await.unwrap();
}

#[tokio::test]
async fn test_share_lock_opens_stack_within_held_access() {
    let (server, share) = setup();
    let node = share.lookup(FILE);
    let first = share
        .open_for_access(&node, OpenFlags::READ | OpenFlags::WRITE | OpenFlags::SHLOCK)
        .await
        .unwrap();
    let second = share
        .open_for_access(&node, OpenFlags::READ | OpenFlags::SHLOCK)
        .await
        .unwrap();
    assert_eq!(server.stats().opens, 1);
    assert_eq!(node.snapshot().await.exclusive.refcount, 2);

    share.close_handle(&node, second).await.unwrap();
    share.close_handle(&node, first).await.unwrap();
    assert_eq!(node.snapshot().await.exclusive.refcount, 0);
}

#[tokio::test]
async fn test_deferred_shared_handle_flushed_before_exclusive_open() {
    let (server, share) = setup();
    let node = share.lookup(FILE);
    let token = share.open_for_access(&node, OpenFlags::READ).await.unwrap();
    share.close_handle(&node, token).await.unwrap();
    assert!(node.snapshot().await.shared.deferred);

    let excl = share
        .open_for_access(&node, OpenFlags::READ | OpenFlags::EXLOCK)
        .await
        .unwrap();
    let snap = node.snapshot().await;
    assert!(!snap.shared.deferred);
    assert!(!snap.shared.remote.is_valid());
    assert_eq!(snap.exclusive.refcount, 1);
    assert_eq!(share.deferred_stats().current, 0);
    assert_eq!(server.stats().closes, 1);
    share.close_handle(&node, excl).await.unwrap();
}

#[tokio::test]
async fn test_deferred_exclusive_handle_flushed_before_plain_open() {
    let (server, share) = setup();
    let node = share.lookup(FILE);
    let excl = share
        .open_for_access(&node, OpenFlags::READ | OpenFlags::EXLOCK)
        .await
        .unwrap();
    share.close_handle(&node, excl).await.unwrap();
    assert!(node.snapshot().await.exclusive.deferred);

    let token = share.open_for_access(&node, OpenFlags::READ).await.unwrap();
    assert_eq!(token.slot, SlotKind::Shared);
    let snap = node.snapshot().await;
    assert!(!snap.exclusive.deferred);
    assert!(!snap.exclusive.remote.is_valid());
    assert_eq!(snap.shared.refcount, 1);
    assert_eq!(share.deferred_stats().current, 0);
    assert_eq!(server.stats().closes, 1);
    assert_eq!(server.open_handle_count(FILE), 1);
    share.close_handle(&node, token).await.unwrap();
}

#[tokio::test]
async fn test_exact_reuse_policy_requires_same_access() {
    let (server, share) = setup_with(ClientConfig {
        deferred_reuse: DeferredReusePolicy::Exact,
        ..Default::default()
    });
    let node = share.lookup(FILE);
    let rw = share
        .open_for_access(&node, OpenFlags::READ | OpenFlags::WRITE)
        .await
        .unwrap();
    share.close_handle(&node, rw).await.unwrap();

    let ro = share.open_for_access(&node, OpenFlags::READ).await.unwrap();
    assert_eq!(server.stats().opens, 2);
    assert_eq!(server.stats().closes, 1);
    assert_eq!(node.snapshot().await.shared.access, Some(AccessMode::Read));
    share.close_handle(&node, ro).await.unwrap();
}

#[tokio::test]
async fn test_exact_reuse_policy_reuses_write_only_handle() {
    let (server, share) = setup_with(ClientConfig {
        deferred_reuse: DeferredReusePolicy::Exact,
        ..Default::default()
    });
    let node = share.lookup(FILE);
    let wo = share.open_for_access(&node, OpenFlags::WRITE).await.unwrap();
    share.close_handle(&node, wo).await.unwrap();
    assert!(node.snapshot().await.shared.deferred);

    let wo = share.open_for_access(&node, OpenFlags::WRITE).await.unwrap();
    assert_eq!(server.stats().opens, 1);
    assert_eq!(server.stats().closes, 0);
    let snap = node.snapshot().await;
    assert_eq!(snap.lease.handle_reuse_count, 1);
    assert_eq!(snap.shared.counters.write, 1);
    share.close_handle(&node, wo).await.unwrap();
}

#[tokio::test]
async fn test_superset_reuse_serves_write_only_open() {
    let (server, share) = setup();
    let node = share.lookup(FILE);
    let rw = share
        .open_for_access(&node, OpenFlags::READ | OpenFlags::WRITE)
        .await
        .unwrap();
    share.close_handle(&node, rw).await.unwrap();

    let wo = share.open_for_access(&node, OpenFlags::WRITE).await.unwrap();
    assert_eq!(server.stats().opens, 1);
    let snap = node.snapshot().await;
    assert_eq!(snap.shared.access, Some(AccessMode::ReadWrite));
    assert_eq!(snap.shared.counters.write, 1);
    share.close_handle(&node, wo).await.unwrap();
}

#[tokio::test]
async fn test_registry_bound_degrades_to_real_close() {
    let (server, share) = setup_with(ClientConfig {
        max_deferred_closes: 1,
        ..Default::default()
    });
    server.create_file("/share/other.txt", b"other");
    let a = share.lookup(FILE);
    let b = share.lookup("/share/other.txt");

    let ta = share.open_for_access(&a, OpenFlags::READ).await.unwrap();
    let tb = share.open_for_access(&b, OpenFlags::READ).await.unwrap();
    share.close_handle(&a, ta).await.unwrap();
    share.close_handle(&b, tb).await.unwrap();

    assert!(a.snapshot().await.shared.deferred);
    assert!(!b.snapshot().await.shared.deferred);
    assert_eq!(server.open_handle_count("/share/other.txt"), 0);
    let stats = share.deferred_stats();
    assert_eq!(stats.current, 1);
    assert_eq!(stats.max, 1);
    assert_eq!(stats.cumulative, 1);
}

#[tokio::test]
async fn test_concurrent_opens_and_closes_balance() {
    let (server, share) = setup_with(fast_config());
    let node = share.lookup(FILE);
    let modes = [
        OpenFlags::READ,
        OpenFlags::WRITE,
        OpenFlags::READ | OpenFlags::WRITE,
    ];

    let tasks = (0..24).map(|i| {
        let share = share.clone();
        let node = node.clone();
        let flags = modes[i % modes.len()];
        async move {
            let token = share.open_for_access(&node, flags).await.unwrap();
            if flags.contains(OpenFlags::WRITE) {
                share.write(&node, &token, 0, b"x").await.unwrap();
            } else {
                share.read(&node, &token, 0, 1).await.unwrap();
            }
            tokio::task::yield_now().await;
            share.close_handle(&node, token).await.unwrap();
        }
    });
    join_all(tasks).await;

    let snap = node.snapshot().await;
    assert_eq!(snap.shared.refcount, 0);
    assert_eq!(snap.shared.counters, AccessCounters::default());
    let expected = usize::from(snap.shared.deferred);
    assert_eq!(server.open_handle_count(FILE), expected);
}

#[tokio::test]
async fn test_close_without_opener_is_bad_handle() {
    let (_server, share) = setup();
    let node = share.lookup(FILE);
    let token = share.open_for_access(&node, OpenFlags::READ).await.unwrap();
    share.close_handle(&node, token).await.unwrap();
    let err = share.close_handle(&node, token).await.unwrap_err();
    assert_eq!(err.errno(), libc::EBADF);
}

#[tokio::test]
async fn test_open_requires_access() {
    let (_server, share) = setup();
    let node = share.lookup(FILE);
    let err = share
        .open_for_access(&node, OpenFlags::CREATE)
        .await
        .unwrap_err();
    assert_eq!(err.errno(), libc::EINVAL);
}

#[tokio::test]
async fn test_missing_file_and_create() {
    let (server, share) = setup();
    let node = share.lookup("/share/new.txt");
    let err = share.open_for_access(&node, OpenFlags::READ).await.unwrap_err();
    assert_eq!(err.errno(), libc::ENOENT);

    let token = share
        .open_for_access(&node, OpenFlags::WRITE | OpenFlags::CREATE)
        .await
        .unwrap();
    share.write(&node, &token, 0, b"new").await.unwrap();
    share.close_handle(&node, token).await.unwrap();
    assert_eq!(server.file_data("/share/new.txt").unwrap(), b"new");
}

#[tokio::test]
async fn test_mmap_holds_handle_until_munmap() {
    let (server, share) = setup();
    let node = share.lookup(FILE);
    let token = share
        .open_for_access(&node, OpenFlags::READ | OpenFlags::WRITE)
        .await
        .unwrap();
    share.mmap(&node, &token).await.unwrap();
    share.close_handle(&node, token).await.unwrap();

    let snap = node.snapshot().await;
    assert_eq!(snap.shared.refcount, 1);
    assert!(snap.shared.mmapped);
    assert!(!snap.shared.deferred);
    assert_eq!(server.open_handle_count(FILE), 1);

    share.munmap(&node).await.unwrap();
    let snap = node.snapshot().await;
    assert_eq!(snap.shared.refcount, 0);
    assert!(!snap.shared.mmapped);
    assert!(snap.shared.deferred);
    // A second munmap has nothing to release.
    share.munmap(&node).await.unwrap();
}

#[tokio::test]
async fn test_named_streams_never_defer() {
    let (server, share) = setup();
    server.create_file("/share/file.txt:meta", b"stream");
    let node = share.lookup_stream(FILE, "meta");
    assert!(node.is_stream());

    let token = share.open_for_access(&node, OpenFlags::READ).await.unwrap();
    share.close_handle(&node, token).await.unwrap();
    assert!(!node.snapshot().await.shared.deferred);
    assert_eq!(server.open_handle_count("/share/file.txt:meta"), 0);
    assert_eq!(share.deferred_stats().cumulative, 0);
}

#[tokio::test]
async fn test_delete_on_close_removes_file_at_last_close() {
    let (server, share) = setup();
    let path = "/share/dir/victim";
    server.create_file(path, b"bye");
    let node = share.lookup(path);

    let token = share
        .open_for_access(&node, OpenFlags::READ | OpenFlags::WRITE)
        .await
        .unwrap();
    share.set_delete_on_close(&node).await.unwrap();
    assert!(server.file_exists(path));

    share.close_handle(&node, token).await.unwrap();
    assert!(!server.file_exists(path));
    assert!(share.cached(path).is_none());
    assert_eq!(share.dir_generation("/share/dir"), 1);
    assert_eq!(share.deferred_stats().current, 0);
}

#[tokio::test]
async fn test_delete_on_close_flushes_deferred_handle() {
    let (server, share) = setup();
    let node = share.lookup(FILE);
    let token = share.open_for_access(&node, OpenFlags::READ).await.unwrap();
    share.close_handle(&node, token).await.unwrap();
    assert_eq!(share.deferred_stats().current, 1);

    share.set_delete_on_close(&node).await.unwrap();
    assert_eq!(share.deferred_stats().current, 0);
    assert!(!server.file_exists(FILE));
    assert_eq!(share.dir_generation("/share"), 1);
}

#[tokio::test]
async fn test_reap_expired_deferred_closes() {
    let (server, share) = setup_with(ClientConfig {
        deferred_close_timeout_ms: 0,
        ..Default::default()
    });
    let node = share.lookup(FILE);
    let token = share.open_for_access(&node, OpenFlags::READ).await.unwrap();
    share.close_handle(&node, token).await.unwrap();

    assert_eq!(share.reap_deferred_closes().await, 1);
    assert_eq!(server.open_handle_count(FILE), 0);
    assert_eq!(share.deferred_stats().current, 0);
    assert_eq!(share.reap_deferred_closes().await, 0);
}

#[tokio::test]
async fn test_background_reaper_closes_deferred_handles() {
    let (server, share) = setup_with(ClientConfig {
        deferred_close_timeout_ms: 20,
        deferred_reaper_interval_ms: 10,
        ..Default::default()
    });
    let reaper = share.spawn_deferred_reaper();
    let node = share.lookup(FILE);
    let token = share.open_for_access(&node, OpenFlags::READ).await.unwrap();
    share.close_handle(&node, token).await.unwrap();
    assert_eq!(share.deferred_stats().current, 1);

    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(share.deferred_stats().current, 0);
    assert_eq!(server.open_handle_count(FILE), 0);
    reaper.abort();
}

#[tokio::test]
async fn test_evict_and_shutdown_close_everything() {
    let (server, share) = setup();
    server.create_file("/share/b", b"b");
    let a = share.lookup(FILE);
    let b = share.lookup("/share/b");

    let ta = share.open_for_access(&a, OpenFlags::READ).await.unwrap();
    share.close_handle(&a, ta).await.unwrap();
    let _tb = share.open_for_access(&b, OpenFlags::READ).await.unwrap();

    assert!(share.evict(FILE).await);
    assert!(!share.evict(FILE).await);
    assert_eq!(server.open_handle_count(FILE), 0);
    assert_eq!(share.deferred_stats().current, 0);

    share.shutdown().await;
    assert_eq!(server.open_handle_count("/share/b"), 0);
    assert!(share.cached("/share/b").is_none());
}
