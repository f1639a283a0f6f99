use std::sync::Arc;

use agora_transport::{InboundFrame, StreamManager};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::error::OrderError;
use crate::order::{OrderService, ReceiveOutcome};

/// Feed inbound frames to the order service until cancelled.
///
/// A frame that does not decode closes the stream it came on; the peer is
/// rediscovered on a later lookup round. Every other rejection only drops
/// the message.
pub(super) async fn run_dispatch(
    orders: Arc<OrderService>,
    streams: StreamManager,
    mut inbound: mpsc::Receiver<InboundFrame>,
    cancel: CancellationToken,
) {
    loop {
        let frame = tokio::select! {
            _ = cancel.cancelled() => break,
            frame = inbound.recv() => match frame {
                Some(frame) => frame,
                None => break,
            },
        };
        handle_frame(&orders, &streams, frame).await;
    }
    tracing::debug!("dispatch loop stopped");
}

async fn handle_frame(orders: &OrderService, streams: &StreamManager, frame: InboundFrame) {
    let peer = frame.peer;
    match orders.receive(&frame.line, peer) {
        Ok(ReceiveOutcome::Stored { operation, order_id }) => {
            tracing::trace!(%peer, ?operation, order = %order_id, "frame applied");
        }
        Ok(ReceiveOutcome::Removed { order_id }) => {
            tracing::trace!(%peer, order = %order_id, "frame removed order");
        }
        Err(OrderError::Decode(reason)) => {
            tracing::warn!(%peer, stream = frame.stream_id, "undecodable frame, closing stream: {reason}");
            streams.close_stream(frame.stream_id).await;
        }
        Err(OrderError::UnknownChannel(channel)) => {
            tracing::debug!(%peer, %channel, "frame for a channel we did not join");
        }
        Err(e @ OrderError::Verification(_)) => {
            tracing::warn!(%peer, "rejected frame: {e}");
        }
        Err(e) => {
            tracing::error!(%peer, "failed to apply frame: {e}");
        }
    }
}
