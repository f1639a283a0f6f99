//! Per-peer stream registry.
//!
//! Outbound streams are kept in a map keyed by [`PeerId`] and used for
//! writes. Every stream, inbound or outbound, runs a read loop that forwards
//! frames to a single mpsc receiver handed out by [`StreamManager::new`].

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use futures_util::{SinkExt, StreamExt};
use tokio::sync::{broadcast, mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use crate::host::{FrameReader, FrameWriter, RawStream};
use crate::{PeerId, TcpHost, TransportError};

/// One line received from a peer.
#[derive(Debug, Clone)]
pub struct InboundFrame {
    pub peer: PeerId,
    /// Local id of the stream the line arrived on, for [`StreamManager::close_stream`].
    pub stream_id: u64,
    pub line: String,
}

struct PeerStream {
    id: u64,
    writer: Mutex<FrameWriter>,
    cancel: CancellationToken,
}

#[derive(Default)]
struct Registry {
    /// Outbound streams used for writes.
    by_peer: HashMap<PeerId, Arc<PeerStream>>,
    /// Every stream with a running read loop.
    live: HashMap<u64, (PeerId, CancellationToken)>,
}

struct Inner {
    host: Arc<TcpHost>,
    protocol: String,
    registry: Mutex<Registry>,
    inbound_tx: mpsc::Sender<InboundFrame>,
    closed_tx: broadcast::Sender<PeerId>,
    cancel: CancellationToken,
    next_id: AtomicU64,
}

/// Handle to the stream registry. Cheap to clone.
#[derive(Clone)]
pub struct StreamManager {
    inner: Arc<Inner>,
}

impl StreamManager {
    /// Create the manager and install its inbound handler on `host`.
    ///
    /// Returns the receiver every read loop forwards to.
    pub fn new(
        host: Arc<TcpHost>,
        protocol: &str,
        cancel: CancellationToken,
    ) -> (Self, mpsc::Receiver<InboundFrame>) {
        let (inbound_tx, inbound_rx) = mpsc::channel(host.config().inbound_buffer);
        let (closed_tx, _) = broadcast::channel(64);
        let inner = Arc::new(Inner {
            host: host.clone(),
            protocol: protocol.to_string(),
            registry: Mutex::new(Registry::default()),
            inbound_tx,
            closed_tx,
            cancel,
            next_id: AtomicU64::new(1),
        });

        let weak: Weak<Inner> = Arc::downgrade(&inner);
        host.set_stream_handler(
            protocol,
            Arc::new(move |stream: RawStream| {
                if let Some(inner) = weak.upgrade() {
                    let manager = StreamManager { inner };
                    tokio::spawn(async move { manager.accept(stream).await });
                }
            }),
        );

        (Self { inner }, inbound_rx)
    }

    pub fn protocol(&self) -> &str {
        &self.inner.protocol
    }

    /// Ensure an outbound stream to `peer` exists.
    ///
    /// Reuses a live stream; otherwise dials through the host's address book.
    pub async fn open(&self, peer: PeerId) -> Result<(), TransportError> {
        if self.inner.cancel.is_cancelled() {
            return Err(TransportError::Shutdown);
        }
        if self.is_connected(&peer).await {
            return Ok(());
        }
        let stream = self.inner.host.open_stream(peer, &self.inner.protocol).await?;
        self.register(stream).await;
        Ok(())
    }

    /// Adopt an already-open outbound stream, replacing any previous one.
    pub async fn register(&self, stream: RawStream) {
        let RawStream {
            peer,
            reader,
            writer,
            ..
        } = stream;
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let cancel = self.inner.cancel.child_token();
        let entry = Arc::new(PeerStream {
            id,
            writer: Mutex::new(writer),
            cancel: cancel.clone(),
        });

        let replaced = {
            let mut registry = self.inner.registry.lock().await;
            registry.live.insert(id, (peer, cancel.clone()));
            registry.by_peer.insert(peer, entry)
        };
        if let Some(old) = replaced {
            old.cancel.cancel();
        }

        tracing::debug!(%peer, stream_id = id, "outbound stream registered");

        let manager = self.clone();
        tokio::spawn(
            async move {
                manager.read_loop(peer, id, reader, cancel).await;
                manager.deregister(peer, id).await;
            }
            .instrument(tracing::debug_span!("stream", %peer, id)),
        );
    }

    /// Close and forget the outbound stream to `peer`. Idempotent.
    pub async fn close(&self, peer: &PeerId) {
        let removed = {
            let mut registry = self.inner.registry.lock().await;
            let removed = registry.by_peer.remove(peer);
            if let Some(stream) = &removed {
                registry.live.remove(&stream.id);
                stream.cancel.cancel();
            }
            removed
        };
        if let Some(stream) = removed {
            let mut writer = stream.writer.lock().await;
            let _ = SinkExt::<&str>::close(&mut *writer).await;
            tracing::debug!(%peer, "stream closed");
            let _ = self.inner.closed_tx.send(*peer);
        }
    }

    /// Close a single stream by its local id, inbound or outbound.
    pub async fn close_stream(&self, stream_id: u64) {
        let (peer, outbound) = {
            let mut registry = self.inner.registry.lock().await;
            let Some((peer, cancel)) = registry.live.remove(&stream_id) else {
                return;
            };
            cancel.cancel();
            let outbound = registry
                .by_peer
                .get(&peer)
                .is_some_and(|s| s.id == stream_id);
            if outbound {
                registry.by_peer.remove(&peer);
            }
            (peer, outbound)
        };
        tracing::debug!(%peer, stream_id, "stream closed");
        if outbound {
            let _ = self.inner.closed_tx.send(peer);
        }
    }

    /// Write one frame to the outbound stream of `peer`.
    pub async fn send(&self, peer: PeerId, frame: &str) -> Result<(), TransportError> {
        let max = self.inner.host.config().max_message_size;
        if frame.len() > max {
            return Err(TransportError::MessageTooLarge {
                size: frame.len(),
                max,
            });
        }
        if frame.contains('\n') {
            return Err(TransportError::InvalidFrame("frame contains a newline".into()));
        }

        let stream = self
            .inner
            .registry
            .lock()
            .await
            .by_peer
            .get(&peer)
            .cloned()
            .ok_or(TransportError::NotConnected { peer })?;

        let result = stream.writer.lock().await.send(frame).await;
        if let Err(e) = result {
            stream.cancel.cancel();
            self.deregister(peer, stream.id).await;
            return Err(TransportError::Send {
                peer,
                source: e.into(),
            });
        }
        Ok(())
    }

    pub async fn is_connected(&self, peer: &PeerId) -> bool {
        self.inner
            .registry
            .lock()
            .await
            .by_peer
            .get(peer)
            .is_some_and(|s| !s.cancel.is_cancelled())
    }

    /// Peers with a live outbound stream.
    pub async fn connected_peers(&self) -> Vec<PeerId> {
        self.inner
            .registry
            .lock()
            .await
            .by_peer
            .iter()
            .filter(|(_, s)| !s.cancel.is_cancelled())
            .map(|(peer, _)| *peer)
            .collect()
    }

    /// Notified with the peer id whenever its outbound stream goes away.
    pub fn closed_peers(&self) -> broadcast::Receiver<PeerId> {
        self.inner.closed_tx.subscribe()
    }

    /// Close every stream.
    pub async fn shutdown(&self) {
        let (outbound, live) = {
            let mut registry = self.inner.registry.lock().await;
            let outbound: Vec<_> = registry.by_peer.drain().map(|(_, s)| s).collect();
            let live: Vec<_> = registry.live.drain().map(|(_, (_, c))| c).collect();
            (outbound, live)
        };
        for cancel in live {
            cancel.cancel();
        }
        for stream in outbound {
            stream.cancel.cancel();
            let mut writer = stream.writer.lock().await;
            let _ = SinkExt::<&str>::close(&mut *writer).await;
        }
        self.inner.host.remove_stream_handler(&self.inner.protocol);
        tracing::debug!("stream manager shut down");
    }

    async fn accept(&self, stream: RawStream) {
        let RawStream {
            peer,
            reader,
            writer,
            ..
        } = stream;
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let cancel = self.inner.cancel.child_token();
        self.inner
            .registry
            .lock()
            .await
            .live
            .insert(id, (peer, cancel.clone()));

        // The write half stays open for the lifetime of the read loop, dropping
        // it would signal end-of-stream to the dialer.
        let _writer = writer;
        self.read_loop(peer, id, reader, cancel)
            .instrument(tracing::debug_span!("inbound", %peer, id))
            .await;
        self.inner.registry.lock().await.live.remove(&id);
    }

    async fn read_loop(&self, peer: PeerId, id: u64, mut reader: FrameReader, cancel: CancellationToken) {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                next = reader.next() => match next {
                    Some(Ok(line)) => {
                        if line.trim().is_empty() {
                            continue;
                        }
                        let frame = InboundFrame { peer, stream_id: id, line };
                        if self.inner.inbound_tx.send(frame).await.is_err() {
                            break;
                        }
                    }
                    Some(Err(e)) => {
                        tracing::warn!(%peer, "stream read failed: {e}");
                        break;
                    }
                    None => {
                        tracing::debug!(%peer, "stream closed by remote");
                        break;
                    }
                }
            }
        }
    }

    /// Drop the registry entries of stream `id` unless a newer stream replaced it.
    async fn deregister(&self, peer: PeerId, id: u64) {
        let removed = {
            let mut registry = self.inner.registry.lock().await;
            registry.live.remove(&id);
            if registry.by_peer.get(&peer).is_some_and(|s| s.id == id) {
                registry.by_peer.remove(&peer);
                true
            } else {
                false
            }
        };
        if removed {
            let _ = self.inner.closed_tx.send(peer);
        }
    }
}
