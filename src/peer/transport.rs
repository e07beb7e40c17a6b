use super::error::PeerError;
use super::message::{Handshake, Message, HANDSHAKE_LEN};
use crate::config::MAX_FRAME_SIZE;
use bytes::{Buf, BytesMut};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::time::timeout;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const WRITE_TIMEOUT: Duration = Duration::from_secs(30);

/// A TCP stream in the handshake phase.
///
/// Once both handshakes have been exchanged the transport splits into a
/// [`FrameReader`] and [`FrameWriter`] so reading and writing can run on
/// independent tasks.
pub struct PeerTransport {
    stream: TcpStream,
    read_buf: BytesMut,
}

impl PeerTransport {
    pub fn new(stream: TcpStream) -> Self {
        Self {
            stream,
            read_buf: BytesMut::with_capacity(32 * 1024),
        }
    }

    pub fn peer_addr(&self) -> std::io::Result<SocketAddr> {
        self.stream.peer_addr()
    }

    /// Sends our handshake and waits for the remote one, enforcing the
    /// grace period. Used for outbound connections.
    pub async fn handshake_outbound(
        &mut self,
        ours: &Handshake,
        grace: Duration,
    ) -> Result<Handshake, PeerError> {
        timeout(grace, async {
            self.send_handshake(ours).await?;
            self.receive_handshake().await
        })
        .await
        .map_err(|_| PeerError::HandshakeTimeout)?
    }

    /// Waits for the remote handshake before answering with ours. Used
    /// for inbound connections; the caller validates the info hash.
    pub async fn handshake_inbound(
        &mut self,
        ours: &Handshake,
        grace: Duration,
    ) -> Result<Handshake, PeerError> {
        timeout(grace, async {
            let theirs = self.receive_handshake().await?;
            self.send_handshake(ours).await?;
            Ok(theirs)
        })
        .await
        .map_err(|_| PeerError::HandshakeTimeout)?
    }

    async fn send_handshake(&mut self, handshake: &Handshake) -> Result<(), PeerError> {
        self.stream.write_all(&handshake.encode()).await?;
        Ok(())
    }

    async fn receive_handshake(&mut self) -> Result<Handshake, PeerError> {
        while self.read_buf.len() < HANDSHAKE_LEN {
            let n = self.stream.read_buf(&mut self.read_buf).await?;
            if n == 0 {
                return Err(PeerError::ConnectionClosed);
            }
        }

        let data = self.read_buf.split_to(HANDSHAKE_LEN);
        Handshake::decode(&data)
    }

    pub fn into_split(self) -> (FrameReader, FrameWriter) {
        let (read, write) = self.stream.into_split();
        (
            FrameReader {
                half: read,
                buf: self.read_buf,
            },
            FrameWriter { half: write },
        )
    }
}

/// Dials a peer and completes the wire handshake.
///
/// Fails on connect/handshake timeout or when the remote announces a
/// different torrent.
pub async fn connect_and_handshake(
    addr: SocketAddr,
    info_hash: [u8; 20],
    peer_id: [u8; 20],
    grace: Duration,
) -> Result<(Handshake, PeerTransport), PeerError> {
    let stream = timeout(CONNECT_TIMEOUT, TcpStream::connect(addr))
        .await
        .map_err(|_| PeerError::HandshakeTimeout)??;

    let mut transport = PeerTransport::new(stream);
    let ours = Handshake::new(info_hash, peer_id);
    let theirs = transport.handshake_outbound(&ours, grace).await?;

    if theirs.info_hash != info_hash {
        return Err(PeerError::InfoHashMismatch);
    }

    Ok((theirs, transport))
}

/// The read half of a peer connection.
///
/// Accumulates bytes until a full frame is buffered, then decodes it.
/// Partial TCP reads simply loop back into the accumulation await, so a
/// slow sender never blocks anything but its own task.
pub struct FrameReader {
    half: OwnedReadHalf,
    buf: BytesMut,
}

impl FrameReader {
    /// Reads the next complete message, including keep-alives.
    pub async fn next_message(&mut self) -> Result<Message, PeerError> {
        loop {
            if self.buf.len() >= 4 {
                let length =
                    u32::from_be_bytes([self.buf[0], self.buf[1], self.buf[2], self.buf[3]])
                        as usize;

                if length > MAX_FRAME_SIZE {
                    return Err(PeerError::FrameTooLarge(length));
                }

                if self.buf.len() >= 4 + length {
                    self.buf.advance(4);
                    let body = self.buf.split_to(length).freeze();
                    return Message::decode(body);
                }
            }

            let n = self.half.read_buf(&mut self.buf).await?;
            if n == 0 {
                return Err(PeerError::ConnectionClosed);
            }
        }
    }
}

/// The write half of a peer connection.
pub struct FrameWriter {
    half: OwnedWriteHalf,
}

impl FrameWriter {
    pub async fn send(&mut self, message: &Message) -> Result<(), PeerError> {
        timeout(WRITE_TIMEOUT, self.half.write_all(&message.encode()))
            .await
            .map_err(|_| PeerError::WriteTimeout)??;
        Ok(())
    }
}
