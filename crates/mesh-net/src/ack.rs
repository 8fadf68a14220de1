use std::sync::Arc;

use mesh_wire::{AckMsg, FrameType, MAX_ACK_PAYLOAD};

use crate::{error::SendError, mesh::MeshInner, peer::Peer, queue::EnqueueFlags};

/// Outrc written when a handler tries to ack with a negative code. Negative
/// values are reserved for the transport, so user code can't impersonate
/// internal errors; the waiter maps any negative outrc to
/// [`SendError::InvalidAckRc`].
const INVALID_RC: i32 = -1;

/// One outstanding synchronous send on a peer's wait list.
pub(crate) struct Waiter {
    pub seqnum: u32,
    pub done: bool,
    /// Connection died or peer was decommissioned while waiting.
    pub failed: bool,
    pub outrc: i32,
    pub payload: Option<Vec<u8>>,
}

/// Per-peer list of outstanding seqnums. Small: bounded by the number of
/// caller threads blocked on this peer.
#[derive(Default)]
pub(crate) struct WaitList {
    entries: Vec<Waiter>,
}

impl WaitList {
    pub(crate) fn add(&mut self, seqnum: u32) {
        self.entries.push(Waiter { seqnum, done: false, failed: false, outrc: 0, payload: None });
    }

    /// Reader-side completion. False when no one is waiting on `seqnum`
    /// (late ack after a timeout).
    pub(crate) fn complete(&mut self, seqnum: u32, outrc: i32, payload: Option<Vec<u8>>) -> bool {
        match self.entries.iter_mut().find(|w| w.seqnum == seqnum && !w.done) {
            Some(w) => {
                w.done = true;
                w.outrc = outrc;
                w.payload = payload;
                true
            }
            None => false,
        }
    }

    pub(crate) fn take_if_done(&mut self, seqnum: u32) -> Option<Waiter> {
        let at = self.entries.iter().position(|w| w.seqnum == seqnum && w.done)?;
        Some(self.entries.swap_remove(at))
    }

    pub(crate) fn remove(&mut self, seqnum: u32) {
        if let Some(at) = self.entries.iter().position(|w| w.seqnum == seqnum) {
            self.entries.swap_remove(at);
        }
    }

    /// Fail every outstanding wait; used on close and decom so blocked
    /// senders don't ride out their full timeout.
    pub(crate) fn fail_all(&mut self) {
        for w in &mut self.entries {
            if !w.done {
                w.done = true;
                w.failed = true;
            }
        }
    }
}

/// Capability to acknowledge one received user message. Built by the reader
/// when the sender asked for an ack; the handler takes it out of
/// [`crate::HandlerCtx`] and calls [`ack`](Self::ack) (possibly from another
/// thread, after the handler returned).
pub struct AckHandle {
    mesh: Arc<MeshInner>,
    peer: Arc<Peer>,
    seqnum: u32,
}

impl AckHandle {
    pub(crate) fn new(mesh: Arc<MeshInner>, peer: Arc<Peer>, seqnum: u32) -> Self {
        Self { mesh, peer, seqnum }
    }

    /// Send the handler's return code back to the waiting sender.
    pub fn ack(self, rc: i32) -> Result<(), SendError> {
        self.send(rc, None)
    }

    /// Ack with a small payload (at most [`MAX_ACK_PAYLOAD`] bytes).
    pub fn ack_with_payload(self, rc: i32, payload: &[u8]) -> Result<(), SendError> {
        if payload.is_empty() || payload.len() > MAX_ACK_PAYLOAD {
            return Err(SendError::Internal);
        }
        self.send(rc, Some(payload.to_vec()))
    }

    fn send(self, rc: i32, payload: Option<Vec<u8>>) -> Result<(), SendError> {
        let outrc = if rc < 0 { INVALID_RC } else { rc };
        let typ = if payload.is_some() { FrameType::AckPayload } else { FrameType::Ack };
        let msg = AckMsg { seqnum: self.seqnum, outrc, payload };
        let mut body = Vec::new();
        msg.encode(&mut body).map_err(|_| SendError::Internal)?;
        // acks ride past backpressure; a full queue must not starve them
        self.mesh.enqueue_control(&self.peer, typ, &body, EnqueueFlags::NO_LIMIT | EnqueueFlags::NO_DELAY)
    }
}

/// Map a completed waiter to the caller-facing result.
pub(crate) fn waiter_result(w: Waiter) -> Result<(i32, Option<Vec<u8>>), SendError> {
    if w.failed {
        return Err(SendError::Closed);
    }
    if w.outrc < 0 {
        return Err(SendError::InvalidAckRc);
    }
    Ok((w.outrc, w.payload))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn complete_wakes_only_matching_seqnum() {
        let mut wl = WaitList::default();
        wl.add(10);
        wl.add(11);
        assert!(wl.complete(11, 42, None));
        assert!(wl.take_if_done(10).is_none());
        let w = wl.take_if_done(11).unwrap();
        assert_eq!(w.outrc, 42);
        // late ack for an abandoned seqnum is ignored
        wl.remove(10);
        assert!(!wl.complete(10, 1, None));
    }

    #[test]
    fn fail_all_marks_pending_waiters() {
        let mut wl = WaitList::default();
        wl.add(1);
        wl.complete(1, 7, None);
        wl.add(2);
        wl.fail_all();
        // completed waiter keeps its result
        assert!(waiter_result(wl.take_if_done(1).unwrap()).is_ok());
        assert_eq!(waiter_result(wl.take_if_done(2).unwrap()), Err(SendError::Closed));
    }

    #[test]
    fn negative_outrc_maps_to_invalid_ack_rc() {
        let mut wl = WaitList::default();
        wl.add(5);
        wl.complete(5, -3, None);
        assert_eq!(waiter_result(wl.take_if_done(5).unwrap()), Err(SendError::InvalidAckRc));
    }
}
