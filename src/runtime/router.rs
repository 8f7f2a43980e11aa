//! Message routing between registered connections.

use crate::runtime::connection::{ConnectionRegistry, FlushStatus};
use crate::runtime::protocol;
use crate::runtime::token::ConnId;
use std::io::{Read, Write};
use tracing::{debug, trace};

/// What happened to a routed message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteOutcome {
    /// The whole frame was written to the destination.
    Delivered(ConnId),
    /// Part of the frame is queued until the destination is writable.
    Queued(ConnId),
    /// Nobody is registered under the destination name.
    Dropped,
    /// Writing to the destination failed; it must be torn down.
    Failed(ConnId),
}

/// Forward `body` from `sender` to the connection registered as `destination`.
///
/// Unknown destinations are dropped without telling the sender. Failures
/// only ever implicate the destination.
pub fn route<S: Read + Write>(
    registry: &mut ConnectionRegistry<S>,
    sender: ConnId,
    destination: &[u8],
    body: &[u8],
    max_pending_output: usize,
) -> RouteOutcome {
    let sender_name = match registry.get(sender).and_then(|conn| conn.name()) {
        Some(name) => name.clone(),
        None => return RouteOutcome::Dropped,
    };

    let Some(dest_id) = registry.lookup(destination) else {
        debug!(
            conn_id = %sender,
            destination = %String::from_utf8_lossy(destination),
            "Dropping message for unknown recipient"
        );
        return RouteOutcome::Dropped;
    };

    let Some(dest) = registry.get_mut(dest_id) else {
        return RouteOutcome::Dropped;
    };

    let frame_len = protocol::delivery_len(&sender_name, body);
    if dest.pending_output() + frame_len > max_pending_output {
        debug!(
            conn_id = %dest_id,
            pending = dest.pending_output(),
            "Recipient output limit exceeded"
        );
        return RouteOutcome::Failed(dest_id);
    }

    dest.queue_delivery(&sender_name, body);
    match dest.flush() {
        Ok(FlushStatus::Done) => {
            trace!(from = %sender, to = %dest_id, len = frame_len, "Delivered message");
            RouteOutcome::Delivered(dest_id)
        }
        Ok(FlushStatus::Pending) => RouteOutcome::Queued(dest_id),
        Err(e) => {
            debug!(conn_id = %dest_id, error = %e, "Write to recipient failed");
            RouteOutcome::Failed(dest_id)
        }
    }
}
