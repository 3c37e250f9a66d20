//! One OpenFlow session per bridge over the switch daemon's management
//! socket.
//!
//! The session task dials, exchanges HELLO, answers ECHO keepalives, and
//! drains an outgoing queue. On any error it flips the connected latch,
//! emits a disconnect event, and redials after a short backoff; the
//! replay coordinator decides what to do about it.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::BytesMut;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::UnixStream;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use domain::bridge::{BridgeKind, ChainId};
use ports::secondary::switch_port::BridgeEvent;

use super::message::{
    encode_echo_reply, encode_features_request, encode_hello, OfpHeader, OFPT_ECHO_REQUEST,
    OFPT_ERROR, OFPT_HELLO, OFPT_MULTIPART_REPLY, OFPT_PACKET_IN, OFP_HEADER_LEN,
};

const RECONNECT_BACKOFF: Duration = Duration::from_secs(1);
const MAX_MESSAGE_LEN: usize = 1 << 16;

/// Handle shared with the switch adapter; the session task owns the
/// socket.
pub struct SessionHandle {
    chain: ChainId,
    bridge: BridgeKind,
    connected: Arc<AtomicBool>,
    outgoing: mpsc::UnboundedSender<Vec<u8>>,
    next_xid: AtomicU32,
}

impl SessionHandle {
    pub fn chain(&self) -> &ChainId {
        &self.chain
    }

    pub fn bridge(&self) -> BridgeKind {
        self.bridge
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    pub fn next_xid(&self) -> u32 {
        self.next_xid.fetch_add(1, Ordering::Relaxed)
    }

    /// Queue a message; fails when the session is down.
    pub fn send(&self, msg: Vec<u8>) -> Result<(), ()> {
        if !self.is_connected() {
            return Err(());
        }
        self.outgoing.send(msg).map_err(|_| ())
    }
}

/// Spawn the session task for one bridge. Returns the shared handle.
pub fn spawn_session(
    chain: ChainId,
    bridge: BridgeKind,
    socket_path: PathBuf,
    events: mpsc::Sender<BridgeEvent>,
    token: CancellationToken,
) -> Arc<SessionHandle> {
    let connected = Arc::new(AtomicBool::new(false));
    let (outgoing_tx, outgoing_rx) = mpsc::unbounded_channel();
    let handle = Arc::new(SessionHandle {
        chain: chain.clone(),
        bridge,
        connected: connected.clone(),
        outgoing: outgoing_tx,
        next_xid: AtomicU32::new(1),
    });

    tokio::spawn(session_task(
        chain,
        bridge,
        socket_path,
        connected,
        outgoing_rx,
        events,
        token,
    ));
    handle
}

#[allow(clippy::too_many_arguments)]
async fn session_task(
    chain: ChainId,
    bridge: BridgeKind,
    socket_path: PathBuf,
    connected: Arc<AtomicBool>,
    mut outgoing: mpsc::UnboundedReceiver<Vec<u8>>,
    events: mpsc::Sender<BridgeEvent>,
    token: CancellationToken,
) {
    loop {
        let stream = tokio::select! {
            () = token.cancelled() => return,
            stream = UnixStream::connect(&socket_path) => stream,
        };
        match stream {
            Ok(stream) => {
                info!(chain = %chain, bridge = %bridge, "bridge session connecting");
                let result = run_connected(
                    stream,
                    &chain,
                    bridge,
                    &connected,
                    &mut outgoing,
                    &events,
                    &token,
                )
                .await;
                let was_connected = connected.swap(false, Ordering::SeqCst);
                if token.is_cancelled() {
                    return;
                }
                if was_connected {
                    warn!(chain = %chain, bridge = %bridge, ?result, "bridge session lost");
                    let _ = events
                        .send(BridgeEvent::Disconnected {
                            chain: chain.clone(),
                            bridge,
                        })
                        .await;
                }
            }
            Err(e) => {
                debug!(chain = %chain, bridge = %bridge, error = %e, "connect failed");
            }
        }
        tokio::select! {
            () = token.cancelled() => return,
            () = tokio::time::sleep(RECONNECT_BACKOFF) => {}
        }
    }
}

async fn run_connected(
    stream: UnixStream,
    chain: &ChainId,
    bridge: BridgeKind,
    connected: &AtomicBool,
    outgoing: &mut mpsc::UnboundedReceiver<Vec<u8>>,
    events: &mpsc::Sender<BridgeEvent>,
    token: &CancellationToken,
) -> std::io::Result<()> {
    let (mut reader, mut writer) = stream.into_split();
    writer.write_all(&encode_hello(0)).await?;

    let mut buf = BytesMut::with_capacity(4096);
    loop {
        while let Some((header, body)) = take_message(&mut buf)? {
            match header.msg_type {
                OFPT_HELLO => {
                    connected.store(true, Ordering::SeqCst);
                    writer
                        .write_all(&encode_features_request(header.xid + 1))
                        .await?;
                    info!(chain = %chain, bridge = %bridge, "bridge session connected");
                    let _ = events
                        .send(BridgeEvent::Connected {
                            chain: chain.clone(),
                            bridge,
                        })
                        .await;
                }
                OFPT_ECHO_REQUEST => {
                    writer.write_all(&encode_echo_reply(header.xid, &body)).await?;
                }
                OFPT_PACKET_IN => {
                    let _ = events
                        .send(BridgeEvent::PacketIn {
                            chain: chain.clone(),
                            bridge,
                            payload: body,
                        })
                        .await;
                }
                OFPT_MULTIPART_REPLY => {
                    debug!(chain = %chain, bridge = %bridge, xid = header.xid,
                        "multipart reply");
                }
                OFPT_ERROR => {
                    warn!(chain = %chain, bridge = %bridge, xid = header.xid,
                        "switch reported error");
                }
                _ => {}
            }
        }

        tokio::select! {
            () = token.cancelled() => return Ok(()),

            msg = outgoing.recv() => {
                let Some(msg) = msg else { return Ok(()) };
                writer.write_all(&msg).await?;
            }

            read = reader.read_buf(&mut buf) => {
                if read? == 0 {
                    return Err(std::io::Error::new(
                        std::io::ErrorKind::UnexpectedEof,
                        "switch closed the session",
                    ));
                }
            }
        }
    }
}

/// Pop one complete message off the read buffer.
fn take_message(buf: &mut BytesMut) -> std::io::Result<Option<(OfpHeader, Vec<u8>)>> {
    let Some(header) = OfpHeader::parse(buf) else {
        return Ok(None);
    };
    let length = header.length as usize;
    if length < OFP_HEADER_LEN || length > MAX_MESSAGE_LEN {
        return Err(std::io::Error::other("invalid message length"));
    }
    if buf.len() < length {
        return Ok(None);
    }
    let msg = buf.split_to(length);
    Ok(Some((header, msg[OFP_HEADER_LEN..].to_vec())))
}
