use crate::model::{DecodeError, InboundMessage, Role, DEVICE_ROLE_NAME};
use crate::registry::{Outbound, Peer, PeerRegistry};
use crate::router::Router;
use serde_json::Value;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, info, warn};

// Peers that omit `role`, or name anything other than the firmware, are viewers.
pub const DEFAULT_ROLE: Role = Role::Controller;

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("handshake failed: {0}")]
    Handshake(String),
    #[error("no handshake within {0:?}")]
    HandshakeTimeout(Duration),
    #[error("decode failed: {0}")]
    Decode(#[from] DecodeError),
    #[error("frame of {size} bytes exceeds limit of {limit}")]
    FrameTooLarge { size: usize, limit: usize },
    #[error("transport: {0}")]
    Transport(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SocketMessage {
    Text(String),
    Binary(Vec<u8>),
    // ping, pong
    Control,
    Close,
}

pub trait PeerSocket: Send {
    type Reader: SocketReader;
    type Writer: SocketWriter;

    fn split(self) -> (Self::Reader, Self::Writer);
}

pub trait SocketReader: Send {
    fn recv(&mut self) -> impl Future<Output = Option<Result<SocketMessage, SessionError>>> + Send;
}

pub trait SocketWriter: Send + 'static {
    fn send(&mut self, message: Outbound) -> impl Future<Output = Result<(), SessionError>> + Send;

    fn close(&mut self) -> impl Future<Output = ()> + Send;
}

#[derive(Debug, Clone, Copy)]
pub struct SessionSettings {
    pub outbound_queue: usize,
    pub handshake_timeout: Duration,
    pub max_frame_bytes: usize,
}

pub struct SessionContext {
    pub registry: Arc<PeerRegistry>,
    pub router: Arc<Router>,
    pub settings: SessionSettings,
    pub shutdown: watch::Receiver<bool>,
}

pub async fn run_session<S: PeerSocket>(
    socket: S,
    remote: Option<SocketAddr>,
    ctx: &SessionContext,
) -> Result<(), SessionError> {
    let (mut reader, mut writer) = socket.split();

    let timeout = ctx.settings.handshake_timeout;
    let role = match tokio::time::timeout(timeout, read_handshake(&mut reader)).await {
        Ok(Ok(role)) => role,
        Ok(Err(err)) => {
            writer.close().await;
            return Err(err);
        }
        Err(_) => {
            writer.close().await;
            return Err(SessionError::HandshakeTimeout(timeout));
        }
    };

    let (peer, outbound_rx) = Peer::new(role, remote, ctx.settings.outbound_queue);
    ctx.registry.register(peer.clone());
    info!(peer_id = %peer.id(), %role, remote = ?remote, "peer connected");

    // The writer drains the queue on its own task so routing an inbound
    // message never waits on this peer's socket.
    let (stop_tx, stop_rx) = oneshot::channel();
    let writer_task = tokio::spawn(write_loop(writer, outbound_rx, stop_rx, peer.clone()));

    let result = receive_loop(&mut reader, &peer, ctx).await;

    ctx.registry.unregister(peer.id());
    let _ = stop_tx.send(());
    let written = match writer_task.await {
        Ok(written) => written,
        Err(err) => Err(SessionError::Transport(format!("writer task failed: {err}"))),
    };
    let result = result.and(written);

    match &result {
        Ok(()) => info!(peer_id = %peer.id(), %role, connected_for = ?peer.age(), "peer disconnected"),
        Err(err) => warn!(peer_id = %peer.id(), %role, error = %err, "peer session ended with error"),
    }
    result
}

async fn read_handshake<R: SocketReader>(reader: &mut R) -> Result<Role, SessionError> {
    loop {
        match reader.recv().await {
            Some(Ok(SocketMessage::Control)) => continue,
            first => return parse_handshake(first),
        }
    }
}

fn parse_handshake(
    first: Option<Result<SocketMessage, SessionError>>,
) -> Result<Role, SessionError> {
    let text = match first {
        Some(Ok(SocketMessage::Text(text))) => text,
        Some(Ok(other)) => {
            return Err(SessionError::Handshake(format!(
                "expected text role declaration, got {}",
                kind(&other)
            )))
        }
        Some(Err(err)) => return Err(err),
        None => return Err(SessionError::Handshake("connection closed".to_string())),
    };

    let value: Value = serde_json::from_str(&text)
        .map_err(|err| SessionError::Handshake(format!("invalid json: {err}")))?;
    let object = value
        .as_object()
        .ok_or_else(|| SessionError::Handshake("role declaration is not an object".to_string()))?;

    Ok(role_from_declaration(object.get("role")))
}

fn role_from_declaration(role: Option<&Value>) -> Role {
    match role.and_then(Value::as_str) {
        Some(DEVICE_ROLE_NAME) => Role::Device,
        _ => DEFAULT_ROLE,
    }
}

fn kind(message: &SocketMessage) -> &'static str {
    match message {
        SocketMessage::Text(_) => "text",
        SocketMessage::Binary(_) => "binary",
        SocketMessage::Control => "control",
        SocketMessage::Close => "close",
    }
}

async fn write_loop<W: SocketWriter>(
    mut writer: W,
    mut outbound_rx: mpsc::Receiver<Outbound>,
    mut stop: oneshot::Receiver<()>,
    peer: Arc<Peer>,
) -> Result<(), SessionError> {
    let result = loop {
        tokio::select! {
            biased;
            _ = &mut stop => break Ok(()),
            message = outbound_rx.recv() => {
                let Some(message) = message else {
                    break Ok(());
                };
                if let Err(err) = writer.send(message).await {
                    peer.close();
                    break Err(err);
                }
            }
        }
    };
    writer.close().await;
    result
}

async fn receive_loop<R: SocketReader>(
    reader: &mut R,
    peer: &Arc<Peer>,
    ctx: &SessionContext,
) -> Result<(), SessionError> {
    let mut shutdown = ctx.shutdown.clone();
    if *shutdown.borrow() {
        return Ok(());
    }

    loop {
        tokio::select! {
            inbound = reader.recv() => {
                match inbound {
                    None | Some(Ok(SocketMessage::Close)) => return Ok(()),
                    Some(Err(err)) => return Err(err),
                    Some(Ok(SocketMessage::Control)) => {}
                    Some(Ok(SocketMessage::Text(text))) => handle_text(&text, peer, ctx).await?,
                    Some(Ok(SocketMessage::Binary(bytes))) => handle_binary(bytes, peer, ctx).await?,
                }
            }
            _ = peer.closed() => {
                debug!(peer_id = %peer.id(), "session closed by hub");
                return Ok(());
            }
            _ = shutdown.changed() => {
                debug!(peer_id = %peer.id(), "session stopping for shutdown");
                return Ok(());
            }
        }
    }
}

async fn handle_text(text: &str, peer: &Peer, ctx: &SessionContext) -> Result<(), SessionError> {
    match InboundMessage::parse(text)? {
        InboundMessage::Command(command) => {
            debug!(peer_id = %peer.id(), action = %command.action, speed = command.speed, "command received");
            ctx.router.handle_command(command, Some(peer.id())).await;
        }
        InboundMessage::Image(Some(bytes)) => {
            if peer.role() == Role::Device {
                route_frame(bytes, peer, ctx).await?;
            } else {
                debug!(peer_id = %peer.id(), "ignoring image from controller");
            }
        }
        InboundMessage::Image(None) => {
            // payload follows as the next binary message
            if peer.role() != Role::Device {
                debug!(peer_id = %peer.id(), "ignoring image header from controller");
            }
        }
        InboundMessage::Unknown(tag) => {
            debug!(peer_id = %peer.id(), tag = %tag, "ignoring message with unknown type");
        }
    }
    Ok(())
}

async fn handle_binary(bytes: Vec<u8>, peer: &Peer, ctx: &SessionContext) -> Result<(), SessionError> {
    if peer.role() != Role::Device {
        debug!(peer_id = %peer.id(), size = bytes.len(), "ignoring binary message from controller");
        return Ok(());
    }
    route_frame(bytes, peer, ctx).await
}

async fn route_frame(bytes: Vec<u8>, peer: &Peer, ctx: &SessionContext) -> Result<(), SessionError> {
    let limit = ctx.settings.max_frame_bytes;
    if bytes.len() > limit {
        return Err(SessionError::FrameTooLarge {
            size: bytes.len(),
            limit,
        });
    }
    ctx.router.handle_frame(Arc::from(bytes), Some(peer.id())).await;
    Ok(())
}
