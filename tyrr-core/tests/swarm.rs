//! End-to-end swarm scenarios over in-memory transports: a scripted remote
//! peer drives one side of a duplex pipe, the engine the other.

use std::{net::SocketAddr, path::PathBuf, sync::Arc, time::Duration};

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use sha1::{Digest, Sha1};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt, DuplexStream},
    sync::mpsc,
    time::timeout,
};
use tokio_util::{codec::Framed, sync::CancellationToken};

use tyrr_common::{FileSpec, InfoHash, Manifest, PeerId};
use tyrr_core::{
    client::{Admission, Client, ClientError},
    config::Config,
    disk::MemoryStore,
    download::{DownloadArgs, DownloadHandle, DownloadMessage, TaskState},
    peer::{self, SessionConfig, SessionError, SessionState},
    resume::ResumeData,
};
use tyrr_wire::{Handshake, Message, PeerCodec, Request, Response};

const PIECE: &[u8] = b"0123456789abcdef";
const INFO_HASH: [u8; 20] = [7u8; 20];

fn fixture_manifest() -> Arc<Manifest> {
    let digest: [u8; 20] = Sha1::digest(PIECE).into();
    Arc::new(Manifest {
        info_hash: InfoHash::new(INFO_HASH),
        name: "fixture".to_string(),
        piece_length: 16,
        piece_hashes: vec![digest; 4],
        total_length: 64,
        files: vec![FileSpec {
            path: PathBuf::from("fixture"),
            length: 64,
        }],
        private: false,
        announce_list: Vec::new(),
    })
}

fn addr(port: u16) -> SocketAddr {
    format!("192.0.2.1:{port}").parse().unwrap()
}

fn spawn_download(
    disk: Arc<MemoryStore>,
    resume: Option<ResumeData>,
) -> (DownloadHandle, CancellationToken) {
    let cancel = CancellationToken::new();
    let handle = DownloadHandle::spawn(DownloadArgs {
        manifest: fixture_manifest(),
        download_path: PathBuf::from("/unused"),
        tags: vec!["fixture".to_string()],
        our_id: PeerId::generate(),
        disk,
        admission: Arc::new(Admission::new(50)),
        resume,
        cancel: cancel.child_token(),
    });
    (handle, cancel)
}

async fn wait_for_state(handle: &DownloadHandle, state: TaskState) {
    timeout(Duration::from_secs(5), async {
        while handle.state() != state {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap_or_else(|_| panic!("never reached state {state:?}, at {:?}", handle.state()));
}

async fn wait_for_completed(handle: &DownloadHandle, completed: u64) {
    timeout(Duration::from_secs(5), async {
        while handle.completed() != completed {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("completion counter never reached the target");
}

/// Attach a scripted remote peer; returns the remote's framed transport.
async fn attach_peer(handle: &DownloadHandle, port: u16) -> Framed<DuplexStream, PeerCodec> {
    let (engine_side, remote_side) = tokio::io::duplex(256 * 1024);
    handle
        .attach_inbound(Box::new(engine_side), addr(port), PeerId::generate(), None)
        .await
        .unwrap();
    Framed::new(remote_side, PeerCodec)
}

async fn recv(remote: &mut Framed<DuplexStream, PeerCodec>) -> Message {
    timeout(Duration::from_secs(5), remote.next())
        .await
        .expect("timed out waiting for a message")
        .expect("stream closed")
        .expect("decode error")
}

/// Drain messages until a request shows up.
async fn recv_request(remote: &mut Framed<DuplexStream, PeerCodec>) -> Request {
    loop {
        if let Message::Request(request) = recv(remote).await {
            return request;
        }
    }
}

fn local_bitmap_of(snapshot: &[u8]) -> Vec<u8> {
    ResumeData::decode(snapshot).unwrap().bitmap.to_vec()
}

fn full_bitfield() -> Message {
    Message::Bitfield(Bytes::from_static(&[0b1111_0000]))
}

// S1: a dial-side session whose remote answers with a different info-hash
// dies within one message round without touching any piece state.
#[tokio::test]
async fn handshake_info_hash_mismatch_kills_session() {
    let (engine_side, mut remote_side) = tokio::io::duplex(64 * 1024);
    let (events_tx, mut events_rx) = mpsc::channel(8);
    let (res_tx, _res_rx) = mpsc::channel(8);
    let (req_tx, _req_rx) = mpsc::channel(8);

    let mut expected = INFO_HASH;
    expected[19] = 0x02;
    let session = peer::spawn_outbound(
        Box::new(engine_side),
        SessionConfig {
            address: addr(1),
            info_hash: InfoHash::new(expected),
            our_id: PeerId::generate(),
            num_pieces: 4,
            cancel: CancellationToken::new(),
            events: events_tx,
            responses: res_tx,
            requests: req_tx,
        },
    );

    let mut buf = [0u8; Handshake::LEN];
    remote_side.read_exact(&mut buf).await.unwrap();
    let theirs = Handshake::from_bytes(&buf).unwrap();
    assert_eq!(theirs.info_hash, InfoHash::new(expected));

    let mut advertised = INFO_HASH;
    advertised[19] = 0x01;
    let reply = Handshake::new(InfoHash::new(advertised), PeerId::generate());
    remote_side.write_all(&reply.to_bytes()).await.unwrap();

    let event = timeout(Duration::from_secs(5), events_rx.recv())
        .await
        .unwrap()
        .unwrap();
    match event {
        DownloadMessage::PeerClosed { reason, .. } => {
            assert!(matches!(reason, SessionError::InfoHashMismatch));
        }
        _ => panic!("expected PeerClosed"),
    }
    assert!(session.is_dead());
    assert_eq!(session.state(), SessionState::Dead);
}

// S2: bitfield + unchoke, one 16-byte piece delivered; the bitmap flips,
// the counter moves, and the sole peer (who has the piece) gets no have.
#[tokio::test]
async fn single_piece_happy_path() {
    let disk = Arc::new(MemoryStore::new());
    let (handle, _cancel) = spawn_download(disk.clone(), None);
    wait_for_state(&handle, TaskState::Downloading).await;

    let mut remote = attach_peer(&handle, 2).await;
    assert_eq!(recv(&mut remote).await, Message::Unchoke);

    remote.send(full_bitfield()).await.unwrap();
    assert_eq!(recv(&mut remote).await, Message::Interested);

    remote.send(Message::Unchoke).await.unwrap();

    // ascending tie-break: piece 0, a single 16-byte block, comes first
    let request = recv_request(&mut remote).await;
    assert_eq!(
        request,
        Request {
            piece_index: 0,
            begin: 0,
            length: 16
        }
    );

    remote
        .send(Message::Piece(Response {
            piece_index: 0,
            begin: 0,
            data: Bytes::from_static(PIECE),
        }))
        .await
        .unwrap();

    wait_for_completed(&handle, 16).await;
    assert_eq!(handle.state(), TaskState::Downloading);

    let snapshot = handle.snapshot().await.unwrap();
    assert_eq!(local_bitmap_of(&snapshot), vec![0b1000_0000]);
    assert_eq!(&disk.payload(InfoHash::new(INFO_HASH)).unwrap()[..16], PIECE);

    // the remaining requests for pieces 1..3 arrive, but never a have(0)
    for _ in 0..3 {
        let request = recv_request(&mut remote).await;
        assert_ne!(request.piece_index, 0);
    }
}

// S3: with peers A(1100) and B(1110) and only B unchoked, piece 2
// (rarity 1) is requested before pieces 0 and 1 (rarity 2).
#[tokio::test]
async fn rarest_piece_is_requested_first() {
    let disk = Arc::new(MemoryStore::new());
    let (handle, _cancel) = spawn_download(disk, None);
    wait_for_state(&handle, TaskState::Downloading).await;

    let mut peer_a = attach_peer(&handle, 3).await;
    assert_eq!(recv(&mut peer_a).await, Message::Unchoke);
    peer_a
        .send(Message::Bitfield(Bytes::from_static(&[0b1100_0000])))
        .await
        .unwrap();
    assert_eq!(recv(&mut peer_a).await, Message::Interested);

    let mut peer_b = attach_peer(&handle, 4).await;
    assert_eq!(recv(&mut peer_b).await, Message::Unchoke);
    peer_b
        .send(Message::Bitfield(Bytes::from_static(&[0b1110_0000])))
        .await
        .unwrap();
    assert_eq!(recv(&mut peer_b).await, Message::Interested);

    peer_b.send(Message::Unchoke).await.unwrap();

    let first = recv_request(&mut peer_b).await;
    assert_eq!(first.piece_index, 2);
}

// S4: a piece nobody asked for terminates the session; piece state is
// untouched.
#[tokio::test]
async fn unsolicited_piece_terminates_session() {
    let disk = Arc::new(MemoryStore::new());
    let (handle, _cancel) = spawn_download(disk, None);
    wait_for_state(&handle, TaskState::Downloading).await;

    let mut remote = attach_peer(&handle, 5).await;
    assert_eq!(recv(&mut remote).await, Message::Unchoke);

    remote
        .send(Message::Piece(Response {
            piece_index: 0,
            begin: 0,
            data: Bytes::from_static(PIECE),
        }))
        .await
        .unwrap();

    // the engine closes the transport
    let eof = timeout(Duration::from_secs(5), async {
        loop {
            match remote.next().await {
                None => break,
                Some(Err(_)) => break,
                Some(Ok(_)) => {}
            }
        }
    })
    .await;
    assert!(eof.is_ok(), "session was not torn down");

    assert_eq!(handle.completed(), 0);
    let snapshot = handle.snapshot().await.unwrap();
    assert_eq!(local_bitmap_of(&snapshot), vec![0u8]);
}

// S5: a corrupt piece is discarded, the task keeps downloading and the
// block is re-requested; the peer survives its first offence.
#[tokio::test]
async fn hash_mismatch_discards_piece() {
    let disk = Arc::new(MemoryStore::new());
    let (handle, _cancel) = spawn_download(disk, None);
    wait_for_state(&handle, TaskState::Downloading).await;

    let mut remote = attach_peer(&handle, 6).await;
    assert_eq!(recv(&mut remote).await, Message::Unchoke);
    remote.send(full_bitfield()).await.unwrap();
    assert_eq!(recv(&mut remote).await, Message::Interested);
    remote.send(Message::Unchoke).await.unwrap();

    // collect the initial requests until piece 1 shows up
    let mut piece1 = None;
    for _ in 0..4 {
        let request = recv_request(&mut remote).await;
        if request.piece_index == 1 {
            piece1 = Some(request);
        }
    }
    let piece1 = piece1.expect("piece 1 was never requested");

    let mut corrupted = PIECE.to_vec();
    corrupted[0] ^= 0xff;
    remote
        .send(Message::Piece(Response {
            piece_index: piece1.piece_index,
            begin: piece1.begin,
            data: corrupted.into(),
        }))
        .await
        .unwrap();

    // the discarded block comes straight back to the scheduler
    let again = recv_request(&mut remote).await;
    assert_eq!(again.piece_index, 1);

    assert_eq!(handle.state(), TaskState::Downloading);
    assert_eq!(handle.completed(), 0);
    let snapshot = handle.snapshot().await.unwrap();
    assert_eq!(local_bitmap_of(&snapshot), vec![0u8]);
}

// S6: snapshot, tear down, restart from the resume blob; the restored task
// never re-requests the piece it already has.
#[tokio::test]
async fn resume_round_trip_skips_verified_pieces() {
    let disk = Arc::new(MemoryStore::new());
    let (handle, cancel) = spawn_download(disk, None);
    wait_for_state(&handle, TaskState::Downloading).await;

    let mut remote = attach_peer(&handle, 7).await;
    assert_eq!(recv(&mut remote).await, Message::Unchoke);
    remote.send(full_bitfield()).await.unwrap();
    assert_eq!(recv(&mut remote).await, Message::Interested);
    remote.send(Message::Unchoke).await.unwrap();

    let first = recv_request(&mut remote).await;
    assert_eq!(first.piece_index, 0);
    remote
        .send(Message::Piece(Response {
            piece_index: 0,
            begin: 0,
            data: Bytes::from_static(PIECE),
        }))
        .await
        .unwrap();
    wait_for_completed(&handle, 16).await;

    let snapshot = handle.snapshot().await.unwrap();
    cancel.cancel();

    let resume = ResumeData::decode(&snapshot).unwrap();
    assert_eq!(resume.state, TaskState::Downloading);
    assert_eq!(resume.completed, 16);
    assert_eq!(resume.tags, vec!["fixture".to_string()]);

    // R2: a fresh task adopts the snapshot instead of re-checking
    let disk = Arc::new(MemoryStore::new());
    let (restored, _cancel) = spawn_download(disk, Some(resume));
    wait_for_state(&restored, TaskState::Downloading).await;
    assert_eq!(restored.completed(), 16);

    let mut remote = attach_peer(&restored, 8).await;
    // a restored non-empty bitmap is announced before anything else
    assert_eq!(
        recv(&mut remote).await,
        Message::Bitfield(Bytes::from_static(&[0b1000_0000]))
    );
    assert_eq!(recv(&mut remote).await, Message::Unchoke);
    remote.send(full_bitfield()).await.unwrap();
    assert_eq!(recv(&mut remote).await, Message::Interested);
    remote.send(Message::Unchoke).await.unwrap();

    let mut seen = Vec::new();
    for _ in 0..3 {
        seen.push(recv_request(&mut remote).await.piece_index);
    }
    seen.sort_unstable();
    assert_eq!(seen, vec![1, 2, 3]);
}

// B2: a have for a piece outside the domain is a protocol violation.
#[tokio::test]
async fn have_out_of_range_is_a_violation() {
    let disk = Arc::new(MemoryStore::new());
    let (handle, _cancel) = spawn_download(disk, None);
    wait_for_state(&handle, TaskState::Downloading).await;

    let mut remote = attach_peer(&handle, 9).await;
    assert_eq!(recv(&mut remote).await, Message::Unchoke);
    remote
        .send(Message::Have { piece_index: 7 })
        .await
        .unwrap();

    let closed = timeout(Duration::from_secs(5), async {
        loop {
            match remote.next().await {
                None | Some(Err(_)) => break,
                Some(Ok(_)) => {}
            }
        }
    })
    .await;
    assert!(closed.is_ok());
}

// B3: a bitfield after any other message is a protocol violation.
#[tokio::test]
async fn late_bitfield_is_a_violation() {
    let disk = Arc::new(MemoryStore::new());
    let (handle, _cancel) = spawn_download(disk, None);
    wait_for_state(&handle, TaskState::Downloading).await;

    let mut remote = attach_peer(&handle, 10).await;
    assert_eq!(recv(&mut remote).await, Message::Unchoke);

    remote.send(Message::Have { piece_index: 0 }).await.unwrap();
    remote.send(full_bitfield()).await.unwrap();

    let closed = timeout(Duration::from_secs(5), async {
        loop {
            match remote.next().await {
                None | Some(Err(_)) => break,
                Some(Ok(_)) => {}
            }
        }
    })
    .await;
    assert!(closed.is_ok());
}

// Completed pieces are served back to requesting peers.
#[tokio::test]
async fn serves_blocks_from_completed_pieces() {
    let disk = Arc::new(MemoryStore::new());
    let (handle, _cancel) = spawn_download(disk, None);
    wait_for_state(&handle, TaskState::Downloading).await;

    let mut remote = attach_peer(&handle, 11).await;
    assert_eq!(recv(&mut remote).await, Message::Unchoke);
    remote.send(full_bitfield()).await.unwrap();
    assert_eq!(recv(&mut remote).await, Message::Interested);
    remote.send(Message::Unchoke).await.unwrap();

    let first = recv_request(&mut remote).await;
    assert_eq!(first.piece_index, 0);
    remote
        .send(Message::Piece(Response {
            piece_index: 0,
            begin: 0,
            data: Bytes::from_static(PIECE),
        }))
        .await
        .unwrap();
    wait_for_completed(&handle, 16).await;

    remote
        .send(Message::Request(Request {
            piece_index: 0,
            begin: 0,
            length: 16,
        }))
        .await
        .unwrap();

    let served = timeout(Duration::from_secs(5), async {
        loop {
            if let Message::Piece(response) = recv(&mut remote).await {
                return response;
            }
        }
    })
    .await
    .unwrap();
    assert_eq!(served.piece_index, 0);
    assert_eq!(&served.data[..], PIECE);
}

// R3: cancel is idempotent and the teardown is observed exactly once.
#[tokio::test]
async fn cancel_is_idempotent() {
    let (engine_side, mut remote_side) = tokio::io::duplex(64 * 1024);
    let (events_tx, mut events_rx) = mpsc::channel(8);
    let (res_tx, _res_rx) = mpsc::channel(8);
    let (req_tx, _req_rx) = mpsc::channel(8);

    let session = peer::spawn_inbound(
        Box::new(engine_side),
        PeerId::generate(),
        SessionConfig {
            address: addr(12),
            info_hash: InfoHash::new(INFO_HASH),
            our_id: PeerId::generate(),
            num_pieces: 4,
            cancel: CancellationToken::new(),
            events: events_tx,
            responses: res_tx,
            requests: req_tx,
        },
    );

    session.cancel();
    session.cancel();
    assert!(session.is_dead());

    let event = timeout(Duration::from_secs(5), events_rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert!(matches!(event, DownloadMessage::PeerClosed { .. }));
    assert!(timeout(Duration::from_millis(100), events_rx.recv())
        .await
        .is_err());

    // transport is closed for the remote too
    let mut buf = [0u8; 1];
    assert_eq!(remote_side.read(&mut buf).await.unwrap(), 0);
}

// Keep-alives flow after two minutes of outbound silence.
#[tokio::test(start_paused = true)]
async fn keep_alive_after_two_minutes() {
    let (engine_side, remote_side) = tokio::io::duplex(64 * 1024);
    let (events_tx, _events_rx) = mpsc::channel(8);
    let (res_tx, _res_rx) = mpsc::channel(8);
    let (req_tx, _req_rx) = mpsc::channel(8);

    let _session = peer::spawn_inbound(
        Box::new(engine_side),
        PeerId::generate(),
        SessionConfig {
            address: addr(13),
            info_hash: InfoHash::new(INFO_HASH),
            our_id: PeerId::generate(),
            num_pieces: 4,
            cancel: CancellationToken::new(),
            events: events_tx,
            responses: res_tx,
            requests: req_tx,
        },
    );

    let mut remote = Framed::new(remote_side, PeerCodec);
    let msg = timeout(Duration::from_secs(150), remote.next())
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(msg, Message::KeepAlive);
}

// P4/P5: the registry rejects duplicate info-hashes and inbound
// connections past the cap, and routes inbound handshakes by info-hash.
#[tokio::test]
async fn registry_admission_and_duplicates() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = Config::default();
    config.application.global_connections_limit = 1;

    let disk = Arc::new(MemoryStore::new());
    let client = Client::new(config, dir.path().to_path_buf(), disk);

    let manifest = fixture_manifest();
    let handle = client
        .add_torrent(manifest.clone(), dir.path().join("dl"), vec![])
        .unwrap();
    assert!(matches!(
        client.add_torrent(manifest, dir.path().join("dl"), vec![]),
        Err(ClientError::Exists(_))
    ));

    wait_for_state(&handle, TaskState::Downloading).await;

    // first inbound connection is admitted
    let (their_side, mut ours) = tokio::io::duplex(64 * 1024);
    let accepting = {
        let client = client.clone();
        tokio::spawn(async move { client.accept(Box::new(their_side), addr(20)).await })
    };
    let hello = Handshake::new(InfoHash::new(INFO_HASH), PeerId::new([3u8; 20]));
    ours.write_all(&hello.to_bytes()).await.unwrap();
    let mut buf = [0u8; Handshake::LEN];
    ours.read_exact(&mut buf).await.unwrap();
    let reply = Handshake::from_bytes(&buf).unwrap();
    assert_eq!(reply.info_hash, InfoHash::new(INFO_HASH));
    assert_eq!(reply.peer_id, client.peer_id());
    accepting.await.unwrap().unwrap();

    // the cap is one: the next connection is rejected immediately
    let (their_side, _ours2) = tokio::io::duplex(64 * 1024);
    assert!(matches!(
        client.accept(Box::new(their_side), addr(21)).await,
        Err(ClientError::AtCapacity)
    ));
}

// An inbound handshake for an unregistered torrent is dropped.
#[tokio::test]
async fn unknown_info_hash_is_dropped() {
    let dir = tempfile::tempdir().unwrap();
    let disk = Arc::new(MemoryStore::new());
    let client = Client::new(Config::default(), dir.path().to_path_buf(), disk);

    let (their_side, mut ours) = tokio::io::duplex(64 * 1024);
    let accepting = {
        let client = client.clone();
        tokio::spawn(async move { client.accept(Box::new(their_side), addr(22)).await })
    };
    let hello = Handshake::new(InfoHash::new([0xee; 20]), PeerId::generate());
    ours.write_all(&hello.to_bytes()).await.unwrap();

    assert!(matches!(
        accepting.await.unwrap(),
        Err(ClientError::UnknownTorrent(_))
    ));
}

// Shutdown snapshots every task into <session>/torrents/<hex>.resume.
#[tokio::test]
async fn shutdown_writes_resume_files() {
    let dir = tempfile::tempdir().unwrap();
    let disk = Arc::new(MemoryStore::new());
    let client = Client::new(Config::default(), dir.path().to_path_buf(), disk);

    let handle = client
        .add_torrent(fixture_manifest(), dir.path().join("dl"), vec!["keep".into()])
        .unwrap();
    wait_for_state(&handle, TaskState::Downloading).await;

    client.shutdown().await;

    let path = dir
        .path()
        .join("torrents")
        .join(format!("{}.resume", InfoHash::new(INFO_HASH).to_hex()));
    let raw = std::fs::read(path).unwrap();
    let resume = ResumeData::decode(&raw).unwrap();
    assert_eq!(resume.info_hash, InfoHash::new(INFO_HASH));
    assert_eq!(resume.state, TaskState::Downloading);
    assert_eq!(resume.tags, vec!["keep".to_string()]);
}
