use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, PoisonError, RwLock};

use ed25519_dalek::SigningKey;
use futures_util::{SinkExt, StreamExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;
use tokio_util::codec::{FramedRead, FramedWrite, LinesCodec};
use tokio_util::sync::CancellationToken;

use crate::handshake::{self, Hello, Proof, Role};
use crate::{HostConfig, PeerId, TransportError, IDENTIFY_PROTOCOL};

pub(crate) type FrameReader = FramedRead<OwnedReadHalf, LinesCodec>;
pub(crate) type FrameWriter = FramedWrite<OwnedWriteHalf, LinesCodec>;

/// Callback invoked for every inbound stream that completed the handshake
/// under the protocol it was registered for.
pub type StreamHandler = Arc<dyn Fn(RawStream) + Send + Sync>;

/// A handshaken, newline-framed connection to one remote peer.
pub struct RawStream {
    pub(crate) peer: PeerId,
    pub(crate) protocol: String,
    pub(crate) remote_addr: SocketAddr,
    pub(crate) reader: FrameReader,
    pub(crate) writer: FrameWriter,
}

impl RawStream {
    /// Identity the remote proved by signing our handshake nonce.
    pub fn peer(&self) -> PeerId {
        self.peer
    }

    pub fn protocol(&self) -> &str {
        &self.protocol
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    /// Write one frame. The line must not contain a newline.
    pub async fn send_line(&mut self, line: &str) -> Result<(), TransportError> {
        if line.contains('\n') {
            return Err(TransportError::InvalidFrame("frame contains a newline".into()));
        }
        self.writer
            .send(line)
            .await
            .map_err(|e| TransportError::Send {
                peer: self.peer,
                source: e.into(),
            })
    }

    /// Read the next frame, `None` once the remote closed the stream.
    pub async fn next_line(&mut self) -> Option<Result<String, TransportError>> {
        self.reader
            .next()
            .await
            .map(|r| r.map_err(|e| TransportError::InvalidFrame(e.to_string())))
    }
}

impl std::fmt::Debug for RawStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RawStream")
            .field("peer", &self.peer)
            .field("protocol", &self.protocol)
            .field("remote_addr", &self.remote_addr)
            .finish()
    }
}

/// Listening TCP endpoint bound to one Ed25519 identity.
///
/// Keeps an address book of peers learned through handshakes so streams can
/// be opened by [`PeerId`] alone.
pub struct TcpHost {
    id: PeerId,
    signing_key: SigningKey,
    listener: TcpListener,
    local_addr: SocketAddr,
    config: HostConfig,
    handlers: RwLock<HashMap<String, StreamHandler>>,
    addresses: Mutex<HashMap<PeerId, SocketAddr>>,
}

impl TcpHost {
    /// Bind a listener for the identity derived from `secret_seed`.
    pub async fn bind(secret_seed: &[u8; 32], config: HostConfig) -> Result<Self, TransportError> {
        let listener = TcpListener::bind(config.listen_addr)
            .await
            .map_err(|source| TransportError::Bind {
                addr: config.listen_addr,
                source,
            })?;
        let local_addr = listener
            .local_addr()
            .map_err(|source| TransportError::Bind {
                addr: config.listen_addr,
                source,
            })?;
        let signing_key = SigningKey::from_bytes(secret_seed);
        let id = PeerId::from_secret_seed(secret_seed);

        tracing::info!(%id, %local_addr, "transport host bound");

        Ok(Self {
            id,
            signing_key,
            listener,
            local_addr,
            config,
            handlers: RwLock::new(HashMap::new()),
            addresses: Mutex::new(HashMap::new()),
        })
    }

    /// This host's identity.
    pub fn identity(&self) -> PeerId {
        self.id
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn config(&self) -> &HostConfig {
        &self.config
    }

    /// Register the callback for inbound streams under `protocol`.
    ///
    /// Replaces any previous handler for the same tag.
    pub fn set_stream_handler(&self, protocol: &str, handler: StreamHandler) {
        self.handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(protocol.to_string(), handler);
    }

    pub fn remove_stream_handler(&self, protocol: &str) {
        self.handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(protocol);
    }

    /// Record a dialable address for a peer.
    pub async fn add_peer_addr(&self, peer: PeerId, addr: SocketAddr) {
        self.addresses.lock().await.insert(peer, addr);
    }

    pub async fn peer_addr(&self, peer: &PeerId) -> Option<SocketAddr> {
        self.addresses.lock().await.get(peer).copied()
    }

    /// Dial `addr` and learn the identity behind it.
    ///
    /// No application stream is opened; the address is remembered so a
    /// later [`open_stream`](Self::open_stream) can reach the peer.
    pub async fn connect(&self, addr: SocketAddr) -> Result<PeerId, TransportError> {
        let stream = self
            .dial(addr, IDENTIFY_PROTOCOL)
            .await
            .map_err(|source| TransportError::Connect { addr, source })?;
        let peer = stream.peer;
        if peer != self.id {
            self.add_peer_addr(peer, addr).await;
        }
        tracing::debug!(%peer, %addr, "peer identified");
        Ok(peer)
    }

    /// Open a stream to a peer whose address is already known.
    pub async fn open_stream(&self, peer: PeerId, protocol: &str) -> Result<RawStream, TransportError> {
        let addr = self
            .peer_addr(&peer)
            .await
            .ok_or_else(|| TransportError::StreamOpen {
                peer,
                reason: "no known address".into(),
            })?;
        let stream = self
            .dial(addr, protocol)
            .await
            .map_err(|e| TransportError::StreamOpen {
                peer,
                reason: e.to_string(),
            })?;
        if stream.peer != peer {
            return Err(TransportError::StreamOpen {
                peer,
                reason: format!("remote identified as {}", stream.peer),
            });
        }
        Ok(stream)
    }

    /// Open a stream to whoever answers at `addr`.
    pub async fn open_stream_at(
        &self,
        addr: SocketAddr,
        protocol: &str,
    ) -> Result<RawStream, TransportError> {
        let stream = self
            .dial(addr, protocol)
            .await
            .map_err(|source| TransportError::Connect { addr, source })?;
        self.add_peer_addr(stream.peer, addr).await;
        Ok(stream)
    }

    /// Accept connections until `cancel` fires.
    pub async fn listen(self: Arc<Self>, cancel: CancellationToken) {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                accepted = self.listener.accept() => match accepted {
                    Ok((tcp, remote_addr)) => {
                        let host = self.clone();
                        tokio::spawn(async move {
                            if let Err(e) = host.accept_stream(tcp, remote_addr).await {
                                tracing::debug!(%remote_addr, "inbound handshake failed: {e}");
                            }
                        });
                    }
                    Err(e) => tracing::warn!("accept failed: {e}"),
                }
            }
        }
        tracing::debug!(id = %self.id, "listener stopped");
    }

    fn hello(&self, protocol: &str, nonce: &str, proof: Option<String>) -> Hello {
        Hello {
            protocol: protocol.to_string(),
            peer_id: self.id,
            listen_port: self.local_addr.port(),
            nonce: nonce.to_string(),
            proof,
        }
    }

    fn framed(&self, tcp: TcpStream) -> (FrameReader, FrameWriter) {
        let max = self.config.max_message_size;
        let (read, write) = tcp.into_split();
        (
            FramedRead::new(read, LinesCodec::new_with_max_length(max)),
            FramedWrite::new(write, LinesCodec::new_with_max_length(max)),
        )
    }

    async fn dial(&self, addr: SocketAddr, protocol: &str) -> anyhow::Result<RawStream> {
        let tcp = tokio::time::timeout(self.config.connect_timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| anyhow::anyhow!("connect timed out"))??;
        tcp.set_nodelay(true)?;
        let (mut reader, mut writer) = self.framed(tcp);

        let remote = tokio::time::timeout(self.config.handshake_timeout, async {
            let nonce = handshake::new_nonce();
            handshake::write_line(&mut writer, &self.hello(protocol, &nonce, None)).await?;
            let remote: Hello = handshake::read_line(&mut reader).await?;
            if remote.protocol != protocol {
                return Err(TransportError::Handshake(format!(
                    "remote answered with protocol {}, expected {protocol}",
                    remote.protocol
                )));
            }
            handshake::validate_nonce(&remote.nonce)?;
            let proof = remote
                .proof
                .as_deref()
                .ok_or_else(|| TransportError::Handshake("answer carries no proof".into()))?;
            handshake::check(proof, &remote.peer_id, Role::Acceptor, protocol, &nonce, &self.id)?;

            let proof = handshake::prove(
                &self.signing_key,
                Role::Dialer,
                protocol,
                &remote.nonce,
                &remote.peer_id,
            );
            handshake::write_line(&mut writer, &Proof { proof }).await?;
            Ok::<_, TransportError>(remote)
        })
        .await
        .map_err(|_| TransportError::Handshake("timed out".into()))??;

        Ok(RawStream {
            peer: remote.peer_id,
            protocol: remote.protocol,
            remote_addr: addr,
            reader,
            writer,
        })
    }

    async fn accept_stream(&self, tcp: TcpStream, remote_addr: SocketAddr) -> Result<(), TransportError> {
        let _ = tcp.set_nodelay(true);
        let (mut reader, mut writer) = self.framed(tcp);

        let hello: Hello = tokio::time::timeout(
            self.config.handshake_timeout,
            handshake::read_line(&mut reader),
        )
        .await
        .map_err(|_| TransportError::Handshake("timed out".into()))??;
        handshake::validate_nonce(&hello.nonce)?;
        if hello.proof.is_some() {
            return Err(TransportError::Handshake("unexpected proof in hello".into()));
        }

        let handler = if hello.protocol == IDENTIFY_PROTOCOL {
            None
        } else if hello.peer_id == self.id {
            tracing::debug!(%remote_addr, "dropping stream from self");
            return Ok(());
        } else {
            let handler = self
                .handlers
                .read()
                .unwrap_or_else(PoisonError::into_inner)
                .get(&hello.protocol)
                .cloned();
            match handler {
                Some(handler) => Some(handler),
                None => {
                    tracing::debug!(protocol = %hello.protocol, %remote_addr, "no handler for protocol, dropping");
                    return Ok(());
                }
            }
        };

        let nonce = handshake::new_nonce();
        let proof = handshake::prove(
            &self.signing_key,
            Role::Acceptor,
            &hello.protocol,
            &hello.nonce,
            &hello.peer_id,
        );
        handshake::write_line(&mut writer, &self.hello(&hello.protocol, &nonce, Some(proof))).await?;

        let answer: Proof = tokio::time::timeout(
            self.config.handshake_timeout,
            handshake::read_line(&mut reader),
        )
        .await
        .map_err(|_| TransportError::Handshake("timed out".into()))??;
        handshake::check(
            &answer.proof,
            &hello.peer_id,
            Role::Dialer,
            &hello.protocol,
            &nonce,
            &self.id,
        )?;

        if hello.peer_id != self.id {
            let dialable = SocketAddr::new(remote_addr.ip(), hello.listen_port);
            self.add_peer_addr(hello.peer_id, dialable).await;
        }

        if let Some(handler) = handler {
            tracing::debug!(peer = %hello.peer_id, protocol = %hello.protocol, "inbound stream accepted");
            handler(RawStream {
                peer: hello.peer_id,
                protocol: hello.protocol,
                remote_addr,
                reader,
                writer,
            });
        }
        Ok(())
    }
}
