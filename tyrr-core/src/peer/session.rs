use std::{io, sync::Arc, sync::atomic::Ordering, time::Duration};

use futures::{
    stream::{SplitSink, SplitStream},
    SinkExt, StreamExt,
};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    sync::mpsc,
    time::Instant,
};
use tokio_util::codec::Framed;
use tracing::{debug, trace};

use tyrr_wire::{Handshake, Message, PeerCodec};

use crate::{
    bitfield::Bitfield,
    download::DownloadMessage,
    peer::{PeerShared, SessionConfig, SessionError, SessionState, Transport},
};

const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);
const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(120);

pub(super) async fn run(
    stream: Transport,
    shared: Arc<PeerShared>,
    out_rx: mpsc::Receiver<Message>,
    cfg: SessionConfig,
    initiator: bool,
) {
    let reason = drive(stream, &shared, out_rx, &cfg, initiator).await;

    // Dying: both loops have returned and the transport is dropped/closed.
    shared.dead.store(true, Ordering::Release);
    shared
        .state
        .store(SessionState::Dying as u8, Ordering::Release);
    shared.cancel.cancel();
    shared
        .state
        .store(SessionState::Dead as u8, Ordering::Release);

    debug!(addr = %shared.address, %reason, "peer session closed");
    let _ = cfg
        .events
        .send(DownloadMessage::PeerClosed {
            addr: shared.address,
            reason,
        })
        .await;
}

async fn drive(
    mut stream: Transport,
    shared: &Arc<PeerShared>,
    out_rx: mpsc::Receiver<Message>,
    cfg: &SessionConfig,
    initiator: bool,
) -> SessionError {
    if initiator {
        if let Err(e) = handshake(&mut stream, shared, cfg).await {
            return e;
        }
        shared
            .state
            .store(SessionState::Running as u8, Ordering::Release);
    }

    let (sink, frames) = Framed::new(stream, PeerCodec).split();

    let writer = tokio::spawn(write_loop(sink, out_rx, shared.clone()));
    let read_reason = read_loop(frames, shared, cfg).await;

    shared.cancel.cancel();
    let write_err = writer.await.ok().flatten();

    match (read_reason, write_err) {
        // the read side only saw the cancellation the write error triggered
        (SessionError::Cancelled, Some(e)) => SessionError::Io(e),
        (reason, _) => reason,
    }
}

/// Send our handshake, then expect and verify the remote's.
async fn handshake(
    stream: &mut Transport,
    shared: &PeerShared,
    cfg: &SessionConfig,
) -> Result<(), SessionError> {
    let exchange = async {
        let ours = Handshake::new(shared.info_hash, cfg.our_id);
        stream.write_all(&ours.to_bytes()).await?;
        stream.flush().await?;

        let mut buf = [0u8; Handshake::LEN];
        stream.read_exact(&mut buf).await?;
        Ok::<_, io::Error>(buf)
    };

    let buf = tokio::select! {
        _ = shared.cancel.cancelled() => return Err(SessionError::Cancelled),
        outcome = tokio::time::timeout(HANDSHAKE_TIMEOUT, exchange) => match outcome {
            Ok(Ok(buf)) => buf,
            Ok(Err(e)) => return Err(SessionError::Io(e)),
            Err(_) => return Err(SessionError::HandshakeTimeout),
        },
    };

    let remote =
        Handshake::from_bytes(&buf).ok_or(SessionError::Protocol("malformed handshake"))?;
    if remote.info_hash != shared.info_hash {
        return Err(SessionError::InfoHashMismatch);
    }

    trace!(addr = %shared.address, peer_id = %remote.peer_id, "handshake complete");
    *shared.remote_id.lock().expect("peer id lock poisoned") = Some(remote.peer_id);
    Ok(())
}

async fn read_loop(
    mut frames: SplitStream<Framed<Transport, PeerCodec>>,
    shared: &Arc<PeerShared>,
    cfg: &SessionConfig,
) -> SessionError {
    // the bitfield is only legal as the very first message after handshake
    let mut first_message = true;

    loop {
        let msg = tokio::select! {
            _ = shared.cancel.cancelled() => return SessionError::Cancelled,
            frame = frames.next() => match frame {
                Some(Ok(msg)) => msg,
                Some(Err(e)) => return SessionError::Io(e),
                None => return SessionError::ClosedByRemote,
            },
        };

        trace!(addr = %shared.address, ?msg, "received");

        match msg {
            Message::KeepAlive => {}
            Message::Choke => {
                shared.choked_by_remote.store(true, Ordering::Release);
                if notify(cfg, DownloadMessage::PeerChoked { addr: shared.address }).await {
                    return SessionError::Cancelled;
                }
            }
            Message::Unchoke => {
                shared.choked_by_remote.store(false, Ordering::Release);
                if notify(cfg, DownloadMessage::PeerUnchoked { addr: shared.address }).await {
                    return SessionError::Cancelled;
                }
            }
            Message::Interested => {
                shared.interesting_to_remote.store(true, Ordering::Release);
            }
            Message::NotInterested => {
                shared.interesting_to_remote.store(false, Ordering::Release);
            }
            Message::Have { piece_index } => {
                if piece_index >= shared.num_pieces {
                    return SessionError::Protocol("have index outside the piece domain");
                }
                shared
                    .remote_bitmap
                    .lock()
                    .expect("bitmap lock poisoned")
                    .set(piece_index);
                let event = DownloadMessage::PeerHave {
                    addr: shared.address,
                    piece: piece_index,
                };
                if notify(cfg, event).await {
                    return SessionError::Cancelled;
                }
            }
            Message::Bitfield(payload) => {
                if !first_message {
                    return SessionError::Protocol("bitfield after another message");
                }
                let bitmap = match Bitfield::from_bytes_checked(&payload, shared.num_pieces) {
                    Ok(bitmap) => bitmap,
                    Err(_) => return SessionError::Protocol("malformed bitfield"),
                };
                *shared.remote_bitmap.lock().expect("bitmap lock poisoned") = bitmap;
                if notify(cfg, DownloadMessage::PeerBitfield { addr: shared.address }).await {
                    return SessionError::Cancelled;
                }
            }
            Message::Request(request) => {
                // bounded channel: a spamming peer stalls its own read loop
                if cfg.requests.send((shared.address, request)).await.is_err() {
                    return SessionError::Cancelled;
                }
            }
            Message::Piece(response) => {
                let implied = response.implied_request();
                let solicited = shared
                    .outstanding
                    .lock()
                    .expect("outstanding lock poisoned")
                    .remove(&implied);
                if !solicited {
                    return SessionError::InvalidData;
                }
                if cfg.responses.send((shared.address, response)).await.is_err() {
                    return SessionError::Cancelled;
                }
            }
            Message::Cancel(request) => {
                let event = DownloadMessage::PeerCancelled {
                    addr: shared.address,
                    request,
                };
                if notify(cfg, event).await {
                    return SessionError::Cancelled;
                }
            }
        }

        first_message = false;
    }
}

/// Returns true when the download side is gone.
async fn notify(cfg: &SessionConfig, event: DownloadMessage) -> bool {
    cfg.events.send(event).await.is_err()
}

async fn write_loop(
    mut sink: SplitSink<Framed<Transport, PeerCodec>, Message>,
    mut out_rx: mpsc::Receiver<Message>,
    shared: Arc<PeerShared>,
) -> Option<io::Error> {
    let mut last_write = Instant::now();

    loop {
        tokio::select! {
            _ = shared.cancel.cancelled() => return None,
            maybe = out_rx.recv() => match maybe {
                Some(msg) => {
                    if let Err(e) = sink.send(msg).await {
                        shared.cancel.cancel();
                        return Some(e);
                    }
                    last_write = Instant::now();
                }
                None => return None,
            },
            _ = tokio::time::sleep_until(last_write + KEEPALIVE_INTERVAL) => {
                if let Err(e) = sink.send(Message::KeepAlive).await {
                    shared.cancel.cancel();
                    return Some(e);
                }
                last_write = Instant::now();
            }
        }
    }
}
