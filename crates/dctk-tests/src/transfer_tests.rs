//! End-to-end transfer scenarios over the in-process hub.

use crate::harness::{launch, shutdown, test_config, TestHub};
use dctk_client::{ClientEvent, DownloadConf};
use dctk_hash::tth_of_bytes;
use std::fs;

fn is_download_terminal(event: &ClientEvent) -> bool {
    matches!(
        event,
        ClientEvent::DownloadSuccessful(_) | ClientEvent::DownloadError { .. }
    )
}

#[tokio::test]
async fn test_active_mode_download() {
    let hub = TestHub::start().await;
    let share_dir = tempfile::tempdir().unwrap();
    let payload = vec![b'A'; 10_000];
    fs::write(share_dir.path().join("test file.txt"), &payload).unwrap();

    let (seeder, _seeder_events, seeder_task) =
        launch(test_config("client1", &hub.url()), Some(share_dir.path())).await;
    let (leecher, mut events, leecher_task) =
        launch(test_config("client2", &hub.url()), None).await;

    events
        .expect("peer client1", |e| {
            matches!(e, ClientEvent::PeerConnected(p) if p.nick == "client1")
        })
        .await;

    let tth = tth_of_bytes(&payload);
    assert_eq!(tth.to_string(), "UJUIOGYVALWRB56PRJEB6ZH3G4OLTELOEQ3UKMY");
    leecher
        .download_file(DownloadConf::new("client1", tth))
        .unwrap();

    match events.expect("download finished", is_download_terminal).await {
        ClientEvent::DownloadSuccessful(res) => {
            assert_eq!(res.size, 10_000);
            assert_eq!(res.content.as_deref(), Some(payload.as_slice()));
        }
        other => panic!("download failed: {:?}", other),
    }

    shutdown(leecher, leecher_task).await;
    shutdown(seeder, seeder_task).await;
}

#[tokio::test]
async fn test_download_to_disk_renames_tmp() {
    let hub = TestHub::start().await;
    let share_dir = tempfile::tempdir().unwrap();
    let payload: Vec<u8> = (0..50_000u32).map(|i| (i % 251) as u8).collect();
    fs::write(share_dir.path().join("data.bin"), &payload).unwrap();

    let (seeder, _se, seeder_task) =
        launch(test_config("disk1", &hub.url()), Some(share_dir.path())).await;
    let (leecher, mut events, leecher_task) = launch(test_config("disk2", &hub.url()), None).await;

    events
        .expect("peer disk1", |e| {
            matches!(e, ClientEvent::PeerConnected(p) if p.nick == "disk1")
        })
        .await;

    let dest_dir = tempfile::tempdir().unwrap();
    let dest = dest_dir.path().join("data.bin");
    let mut conf = DownloadConf::new("disk1", tth_of_bytes(&payload));
    conf.save_path = Some(dest.clone());
    leecher.download_file(conf).unwrap();

    match events.expect("download finished", is_download_terminal).await {
        ClientEvent::DownloadSuccessful(res) => {
            assert_eq!(res.save_path.as_deref(), Some(dest.as_path()));
        }
        other => panic!("download failed: {:?}", other),
    }
    assert_eq!(fs::read(&dest).unwrap(), payload);
    assert!(
        !dest_dir.path().join("data.bin.tmp").exists(),
        "temporary file must be renamed away"
    );

    shutdown(leecher, leecher_task).await;
    shutdown(seeder, seeder_task).await;
}

#[tokio::test]
async fn test_passive_passive_cannot_transfer() {
    let hub = TestHub::start().await;
    let share_dir = tempfile::tempdir().unwrap();
    let payload = vec![b'B'; 4_096];
    fs::write(share_dir.path().join("unreachable.bin"), &payload).unwrap();

    let mut conf1 = test_config("pass1", &hub.url());
    conf1.is_passive = true;
    let mut conf2 = test_config("pass2", &hub.url());
    conf2.is_passive = true;

    let (seeder, _se, seeder_task) = launch(conf1, Some(share_dir.path())).await;
    let (leecher, mut events, leecher_task) = launch(conf2, None).await;

    events
        .expect("peer pass1", |e| {
            matches!(e, ClientEvent::PeerConnected(p) if p.nick == "pass1" && p.is_passive)
        })
        .await;

    leecher
        .download_file(DownloadConf::new("pass1", tth_of_bytes(&payload)))
        .unwrap();

    match events.expect("download finished", is_download_terminal).await {
        ClientEvent::DownloadError { error, .. } => {
            assert!(
                error.contains("cannot connect to passive peer"),
                "unexpected error: {}",
                error
            );
        }
        other => panic!("expected failure, got {:?}", other),
    }

    shutdown(leecher, leecher_task).await;
    shutdown(seeder, seeder_task).await;
}

#[tokio::test]
async fn test_slot_queueing_serializes_downloads() {
    let hub = TestHub::start().await;
    let share_dir = tempfile::tempdir().unwrap();
    let payload: Vec<u8> = (0..200_000u32).map(|i| (i % 199) as u8).collect();
    fs::write(share_dir.path().join("big.bin"), &payload).unwrap();

    let (seeder, _se, seeder_task) =
        launch(test_config("slots1", &hub.url()), Some(share_dir.path())).await;

    let mut conf = test_config("slots2", &hub.url());
    conf.download_slots = 1;
    let (leecher, mut events, leecher_task) = launch(conf, None).await;

    events
        .expect("peer slots1", |e| {
            matches!(e, ClientEvent::PeerConnected(p) if p.nick == "slots1")
        })
        .await;

    let tth = tth_of_bytes(&payload);
    for _ in 0..3 {
        leecher
            .download_file(DownloadConf::new("slots1", tth))
            .unwrap();
    }

    for round in 0..3 {
        match events.expect("download finished", is_download_terminal).await {
            ClientEvent::DownloadSuccessful(res) => {
                assert_eq!(res.size, payload.len() as u64, "round {}", round)
            }
            other => panic!("round {} failed: {:?}", round, other),
        }
    }
    assert_eq!(leecher.download_count(), 0);

    shutdown(leecher, leecher_task).await;
    shutdown(seeder, seeder_task).await;
}

#[tokio::test]
async fn test_compressed_download_fidelity() {
    let hub = TestHub::start().await;
    let share_dir = tempfile::tempdir().unwrap();
    // Highly compressible, one mebibyte.
    let payload: Vec<u8> = std::iter::repeat(b"compressible content ")
        .flatten()
        .copied()
        .take(1024 * 1024)
        .collect();
    fs::write(share_dir.path().join("big.txt"), &payload).unwrap();

    let (seeder, _se, seeder_task) =
        launch(test_config("zlib1", &hub.url()), Some(share_dir.path())).await;
    let (leecher, mut events, leecher_task) = launch(test_config("zlib2", &hub.url()), None).await;

    events
        .expect("peer zlib1", |e| {
            matches!(e, ClientEvent::PeerConnected(p) if p.nick == "zlib1")
        })
        .await;

    leecher
        .download_file(DownloadConf::new("zlib1", tth_of_bytes(&payload)))
        .unwrap();

    match events.expect("download finished", is_download_terminal).await {
        ClientEvent::DownloadSuccessful(res) => {
            assert_eq!(res.size, payload.len() as u64);
            assert_eq!(res.content.as_deref(), Some(payload.as_slice()));
        }
        other => panic!("download failed: {:?}", other),
    }

    shutdown(leecher, leecher_task).await;
    shutdown(seeder, seeder_task).await;
}

#[tokio::test]
async fn test_file_list_roundtrip() {
    let hub = TestHub::start().await;
    let share_dir = tempfile::tempdir().unwrap();

    // Three levels, five files.
    fs::write(share_dir.path().join("top1.txt"), b"one").unwrap();
    fs::write(share_dir.path().join("top2.txt"), b"two").unwrap();
    fs::create_dir(share_dir.path().join("mid")).unwrap();
    fs::write(share_dir.path().join("mid/mid1.txt"), b"three").unwrap();
    fs::create_dir(share_dir.path().join("mid/deep")).unwrap();
    fs::write(share_dir.path().join("mid/deep/deep1.txt"), b"four").unwrap();
    fs::write(share_dir.path().join("mid/deep/deep2.txt"), b"five").unwrap();

    let (seeder, _se, seeder_task) =
        launch(test_config("list1", &hub.url()), Some(share_dir.path())).await;
    let (leecher, mut events, leecher_task) = launch(test_config("list2", &hub.url()), None).await;

    events
        .expect("peer list1", |e| {
            matches!(e, ClientEvent::PeerConnected(p) if p.nick == "list1")
        })
        .await;

    leecher.download_file_list("list1", None).unwrap();

    let content = match events.expect("download finished", is_download_terminal).await {
        ClientEvent::DownloadSuccessful(res) => res.content.expect("in-memory list"),
        other => panic!("file list download failed: {:?}", other),
    };

    let list = dctk_share::parse_file_list(&content).expect("parse file list");
    let share = &list.root.dirs[0];
    assert_eq!(share.name, "share");
    assert_eq!(list.root.file_count(), 5);

    assert_eq!(share.files.len(), 2);
    assert_eq!(share.files[0].name, "top1.txt");
    assert_eq!(share.files[0].size, 3);
    assert_eq!(share.files[0].tth, tth_of_bytes(b"one"));

    let mid = &share.dirs[0];
    assert_eq!(mid.name, "mid");
    assert_eq!(mid.files[0].tth, tth_of_bytes(b"three"));

    let deep = &mid.dirs[0];
    assert_eq!(deep.name, "deep");
    assert_eq!(deep.files.len(), 2);
    assert_eq!(deep.files[1].tth, tth_of_bytes(b"five"));

    shutdown(leecher, leecher_task).await;
    shutdown(seeder, seeder_task).await;
}

#[tokio::test]
async fn test_terminate_mid_download_joins_quickly() {
    let hub = TestHub::start().await;
    let share_dir = tempfile::tempdir().unwrap();
    let payload: Vec<u8> = (0..4 * 1024 * 1024u32).map(|i| (i % 239) as u8).collect();
    fs::write(share_dir.path().join("large.bin"), &payload).unwrap();

    let (seeder, _se, seeder_task) =
        launch(test_config("term1", &hub.url()), Some(share_dir.path())).await;
    let (leecher, mut events, leecher_task) = launch(test_config("term2", &hub.url()), None).await;

    events
        .expect("peer term1", |e| {
            matches!(e, ClientEvent::PeerConnected(p) if p.nick == "term1")
        })
        .await;

    leecher
        .download_file(DownloadConf::new("term1", tth_of_bytes(&payload)))
        .unwrap();

    // Tear down while the transfer is (most likely) in flight; every task
    // must still join promptly and without a panic.
    shutdown(leecher, leecher_task).await;
    shutdown(seeder, seeder_task).await;
}

#[tokio::test]
async fn test_close_download_releases_entry() {
    let hub = TestHub::start().await;
    let share_dir = tempfile::tempdir().unwrap();
    let payload: Vec<u8> = (0..1024 * 1024u32).map(|i| (i % 61) as u8).collect();
    fs::write(share_dir.path().join("closeme.bin"), &payload).unwrap();

    let (seeder, _se, seeder_task) =
        launch(test_config("close1", &hub.url()), Some(share_dir.path())).await;
    let (leecher, mut events, leecher_task) =
        launch(test_config("close2", &hub.url()), None).await;

    events
        .expect("peer close1", |e| {
            matches!(e, ClientEvent::PeerConnected(p) if p.nick == "close1")
        })
        .await;

    let id = leecher
        .download_file(DownloadConf::new("close1", tth_of_bytes(&payload)))
        .unwrap();
    leecher.download_close(id);
    leecher.download_close(id); // idempotent

    let deadline = std::time::Instant::now() + std::time::Duration::from_secs(5);
    while leecher.download_count() != 0 {
        assert!(
            std::time::Instant::now() < deadline,
            "closed download was never released"
        );
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
    }

    shutdown(leecher, leecher_task).await;
    shutdown(seeder, seeder_task).await;
}

#[tokio::test]
async fn test_download_from_unknown_peer_is_config_error() {
    let hub = TestHub::start().await;
    let (client, _events, task) = launch(test_config("alone", &hub.url()), None).await;

    let result = client.download_file(DownloadConf::new("ghost", tth_of_bytes(b"x")));
    assert!(result.is_err());

    shutdown(client, task).await;
}
