//! Frame forwarding pipeline
//!
//! One call per frame read from a link: the zone FDB learns and decides,
//! conntrack inspects (and may hold fragments or rewrite for SNAT), then
//! every resulting buffer is frozen and handed to the chosen ports.

use super::conntrack::{ConntrackRegistry, Verdict};
use super::fdb::{DropReason, L2ForwardAction, ZoneFdb};
use super::port_pool::PortId;
use crate::packet::PacketBuf;
use tracing::{debug, trace};

/// What happened to a frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ForwardOutcome {
    /// Refused by the FDB
    Dropped(DropReason),
    /// Flooded into a zone with no other port
    NoPeers,
    /// Destination sits behind the ingress port
    Filtered,
    /// Held by reassembly until the datagram completes
    Held,
    /// Refused by conntrack
    Rejected,
    /// Fully handed to `ports` egress ports, `frames` buffers each
    Delivered { ports: usize, frames: usize },
}

impl ForwardOutcome {
    pub fn is_delivered(&self) -> bool {
        matches!(self, ForwardOutcome::Delivered { .. })
    }
}

/// Forward `buf`, read from port `ingress` of `fdb`.
///
/// The buffer's zone and direction tags must already be set. Conntrack runs
/// on every frame the FDB counts as forwarded, including filtered ones.
pub async fn forward_frame(
    fdb: &ZoneFdb,
    ingress: PortId,
    conntrack: Option<&ConntrackRegistry>,
    buf: PacketBuf,
) -> ForwardOutcome {
    let action = fdb.forward(ingress, buf.data());
    if !action.forwarded() {
        return match action {
            L2ForwardAction::Drop(reason) => {
                trace!(zone = fdb.zone(), ingress, ?reason, "frame dropped by fdb");
                ForwardOutcome::Dropped(reason)
            }
            _ => ForwardOutcome::NoPeers,
        };
    }

    let bufs = match conntrack {
        Some(registry) => match registry.process(buf) {
            Verdict::Accept(bufs) => bufs,
            Verdict::Stolen => return ForwardOutcome::Held,
            Verdict::Drop => return ForwardOutcome::Rejected,
        },
        None => vec![buf],
    };

    let ports = action.ports();
    if ports.is_empty() {
        return ForwardOutcome::Filtered;
    }

    let frames: Vec<_> = bufs.into_iter().map(PacketBuf::freeze).collect();
    let mut delivered = 0;
    for id in &ports {
        let Some(port) = fdb.port(*id) else {
            continue;
        };
        let mut sent = true;
        for frame in &frames {
            if let Err(e) = port.send(frame.clone()).await {
                debug!(zone = fdb.zone(), port = %port.name(), error = %e, "egress failed");
                sent = false;
                break;
            }
        }
        if sent {
            delivered += 1;
        }
    }
    ForwardOutcome::Delivered {
        ports: delivered,
        frames: frames.len(),
    }
}
