//! Socket-facing tasks: dialing, accepting, frame pumps, block serving,
//! and the tracker announce loop. Each one reports back to the engine
//! over the internal channel and owns nothing the engine also touches.

use super::event::Internal;
use crate::peer::{
    connect_and_handshake, BlockRequest, FrameReader, FrameWriter, Handshake, Message, PeerId,
    PeerTransport,
};
use crate::rate::UploadLimiter;
use crate::storage::PieceStore;
use crate::tracker::{AnnounceRequest, AnnounceTransport, TrackerClient};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tracing::{debug, trace};

/// Depth of each peer's outgoing message queue. A peer that falls this
/// far behind is treated as dead by the engine's `try_send`.
const OUTGOING_QUEUE: usize = 64;

pub(super) async fn dial(
    addr: SocketAddr,
    info_hash: [u8; 20],
    our_id: PeerId,
    grace: Duration,
    events: mpsc::Sender<Internal>,
) {
    match connect_and_handshake(addr, info_hash, *our_id.as_bytes(), grace).await {
        Ok((theirs, transport)) => {
            pump(transport, addr, PeerId::from_bytes(theirs.peer_id), events).await;
        }
        Err(error) => {
            debug!(%addr, %error, "dial failed");
            let _ = events.send(Internal::DialFailed { addr }).await;
        }
    }
}

pub(super) async fn accept(
    stream: TcpStream,
    addr: SocketAddr,
    info_hash: [u8; 20],
    our_id: PeerId,
    grace: Duration,
    events: mpsc::Sender<Internal>,
) {
    let mut transport = PeerTransport::new(stream);
    let ours = Handshake::new(info_hash, *our_id.as_bytes());

    match transport.handshake_inbound(&ours, grace).await {
        Ok(theirs) if theirs.info_hash == info_hash => {
            pump(transport, addr, PeerId::from_bytes(theirs.peer_id), events).await;
        }
        Ok(_) => debug!(%addr, "inbound handshake for unknown torrent"),
        Err(error) => debug!(%addr, %error, "inbound handshake failed"),
    }
}

/// Registers the connection with the engine, then pumps frames both
/// ways until either side gives up.
async fn pump(
    transport: PeerTransport,
    addr: SocketAddr,
    peer_id: PeerId,
    events: mpsc::Sender<Internal>,
) {
    let (reader, writer) = transport.into_split();
    let (outgoing_tx, outgoing_rx) = mpsc::channel(OUTGOING_QUEUE);

    if events
        .send(Internal::Connected {
            addr,
            peer_id,
            outgoing: outgoing_tx,
        })
        .await
        .is_err()
    {
        return;
    }

    tokio::spawn(write_loop(writer, outgoing_rx, events.clone(), addr));
    read_loop(reader, events, addr).await;
}

async fn read_loop(mut reader: FrameReader, events: mpsc::Sender<Internal>, addr: SocketAddr) {
    loop {
        match reader.next_message().await {
            Ok(message) => {
                trace!(%addr, ?message, "received");
                if events
                    .send(Internal::PeerMessage { addr, message })
                    .await
                    .is_err()
                {
                    return;
                }
            }
            Err(error) => {
                let _ = events
                    .send(Internal::Closed {
                        addr,
                        reason: Some(error),
                    })
                    .await;
                return;
            }
        }
    }
}

async fn write_loop(
    mut writer: FrameWriter,
    mut outgoing: mpsc::Receiver<Message>,
    events: mpsc::Sender<Internal>,
    addr: SocketAddr,
) {
    while let Some(message) = outgoing.recv().await {
        if let Err(error) = writer.send(&message).await {
            let _ = events
                .send(Internal::Closed {
                    addr,
                    reason: Some(error),
                })
                .await;
            return;
        }
    }
}

/// Serves one requested block: waits for upload bandwidth, reads the
/// block, and hands it to the peer's writer. Cancels abort the task
/// before the read happens.
pub(super) async fn serve_block(
    store: Arc<PieceStore>,
    limiter: UploadLimiter,
    request: BlockRequest,
    outgoing: mpsc::Sender<Message>,
    events: mpsc::Sender<Internal>,
    addr: SocketAddr,
) {
    limiter.acquire(request.length as usize).await;

    match store
        .read_block(request.piece, request.offset, request.length)
        .await
    {
        Ok(data) => {
            let message = Message::Piece {
                index: request.piece,
                begin: request.offset,
                data,
            };
            if outgoing.send(message).await.is_ok() {
                let _ = events
                    .send(Internal::Served {
                        addr,
                        request,
                        bytes: request.length as usize,
                    })
                    .await;
            }
        }
        Err(error) => {
            debug!(%addr, %error, "serving block failed");
            let _ = events.send(Internal::ServeFailed { addr, request }).await;
        }
    }
}

/// Owns the tracker client so announces never block the engine loop.
pub(super) async fn tracker_loop<T: AnnounceTransport>(
    mut client: TrackerClient<T>,
    mut requests: mpsc::Receiver<AnnounceRequest>,
    events: mpsc::Sender<Internal>,
) {
    while let Some(request) = requests.recv().await {
        let result = client.announce(&request).await;
        if events.send(Internal::Announce(result)).await.is_err() {
            return;
        }
    }
}
