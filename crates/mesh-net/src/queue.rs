use std::{cmp::Ordering, collections::VecDeque};

use bitflags::bitflags;
use mesh_wire::FrameType;

use crate::timing::now_ms;

bitflags! {
    /// Enqueue behavior modifiers. Heartbeats use
    /// `HEAD | NO_DUPE | NO_DELAY | NO_LIMIT` so they pre-empt bulk traffic,
    /// collapse on pileup, flush immediately and ignore backpressure.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct EnqueueFlags: u32 {
        /// Insert at the front of the queue.
        const HEAD = 1 << 0;
        /// Drop the frame if the current head has the same type.
        const NO_DUPE = 1 << 1;
        /// Flush the stream after the write batch containing this frame.
        const NO_DELAY = 1 << 2;
        /// Bypass the count/byte caps.
        const NO_LIMIT = 1 << 3;
        /// Insert by the registered comparator within the reorder window.
        const INORDER = 1 << 4;
        /// Block the sender until queue depth drops below the throttle
        /// threshold before enqueueing.
        const THROTTLE_WAIT = 1 << 5;
    }
}

/// One framed buffer awaiting the writer. `buf` is complete wire bytes; the
/// writer only rewrites the envelope's `from_*` fields before transmit.
pub(crate) struct Frame {
    pub buf: Vec<u8>,
    pub typ: FrameType,
    pub flags: EnqueueFlags,
    /// Offset of the opaque user payload, zero for control frames. The
    /// in-order comparator and the getlsn hook run against this slice.
    pub body_off: usize,
    pub enq_ms: u64,
}

impl Frame {
    pub(crate) fn new(buf: Vec<u8>, typ: FrameType, flags: EnqueueFlags, body_off: usize) -> Self {
        Self { buf, typ, flags, body_off, enq_ms: now_ms() }
    }

    pub(crate) fn body(&self) -> Option<&[u8]> {
        (self.body_off != 0).then(|| &self.buf[self.body_off..])
    }
}

pub(crate) enum Enqueued {
    Queued,
    /// Coalesced against the head frame; nothing was added.
    Deduped,
}

pub(crate) struct QueueFull;

/// Per-peer send queue. Protected by the peer's queue mutex; the writer
/// detaches the whole list under the mutex and writes without it, so senders
/// never block behind the network.
#[derive(Default)]
pub(crate) struct SendQueue {
    frames: VecDeque<Frame>,
    bytes: usize,
    pub peak_count: usize,
    pub peak_bytes: usize,
    pub dedupe_count: u64,
    pub full_count: u64,
    pub reorder_count: u64,
}

impl SendQueue {
    pub(crate) fn len(&self) -> usize {
        self.frames.len()
    }

    pub(crate) fn bytes(&self) -> usize {
        self.bytes
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    /// True when depth is below `pct` percent of both caps; throttled
    /// senders resume here.
    pub(crate) fn below(&self, pct: usize, max_queue: usize, max_bytes: usize) -> bool {
        let count_ok = max_queue == 0 || self.frames.len() * 100 < max_queue * pct;
        let bytes_ok = max_bytes == 0 || self.bytes * 100 < max_bytes * pct;
        count_ok && bytes_ok
    }

    pub(crate) fn enqueue(
        &mut self,
        frame: Frame,
        max_queue: usize,
        max_bytes: usize,
        lookahead: usize,
        cmp: Option<&(dyn Fn(&[u8], &[u8]) -> Ordering + Send + Sync)>,
    ) -> Result<Enqueued, QueueFull> {
        if frame.flags.contains(EnqueueFlags::NO_DUPE)
            && self.frames.front().is_some_and(|head| head.typ == frame.typ)
        {
            self.dedupe_count += 1;
            return Ok(Enqueued::Deduped);
        }

        // One frame is always allowed through a full queue so a critical
        // message can't deadlock behind a stuck one.
        let over = (max_queue != 0 && self.frames.len() >= max_queue)
            || (max_bytes != 0 && self.bytes >= max_bytes);
        if over && !frame.flags.contains(EnqueueFlags::NO_LIMIT) && !self.frames.is_empty() {
            self.full_count += 1;
            return Err(QueueFull);
        }

        let len = frame.buf.len();
        if frame.flags.contains(EnqueueFlags::HEAD) {
            self.frames.push_front(frame);
        } else if frame.flags.contains(EnqueueFlags::INORDER) {
            if let (Some(cmp), Some(body)) = (cmp, frame.body()) {
                let at = self.inorder_position(body, lookahead, cmp);
                if at != self.frames.len() {
                    self.reorder_count += 1;
                }
                self.frames.insert(at, frame);
            } else {
                self.frames.push_back(frame);
            }
        } else {
            self.frames.push_back(frame);
        }

        self.bytes += len;
        self.peak_count = self.peak_count.max(self.frames.len());
        self.peak_bytes = self.peak_bytes.max(self.bytes);
        Ok(Enqueued::Queued)
    }

    /// Walk backward from the tail while the new body sorts before the
    /// frame under the cursor, bounded by `lookahead` steps. Frames without
    /// a comparable body stop the walk, as do keys already past the window.
    fn inorder_position(
        &self,
        body: &[u8],
        lookahead: usize,
        cmp: &(dyn Fn(&[u8], &[u8]) -> Ordering + Send + Sync),
    ) -> usize {
        let mut at = self.frames.len();
        let mut steps = 0;
        while at > 0 && steps < lookahead {
            let Some(prev) = self.frames[at - 1].body() else {
                break;
            };
            if cmp(body, prev) != Ordering::Less {
                break;
            }
            at -= 1;
            steps += 1;
        }
        at
    }

    /// Detach the whole pending list, resetting counters. The caller writes
    /// the batch with no lock held.
    pub(crate) fn detach(&mut self) -> VecDeque<Frame> {
        self.bytes = 0;
        std::mem::take(&mut self.frames)
    }

    /// Drop everything pending (connection teardown discards unsent
    /// frames). Returns how many were dropped.
    pub(crate) fn clear(&mut self) -> usize {
        let n = self.frames.len();
        self.frames.clear();
        self.bytes = 0;
        n
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = &Frame> {
        self.frames.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(typ: FrameType, flags: EnqueueFlags, len: usize) -> Frame {
        Frame::new(vec![0; len], typ, flags, 0)
    }

    fn user_frame(key: u32, flags: EnqueueFlags) -> Frame {
        // 4-byte body holding the key, preceded by a 4-byte fake header
        let mut buf = vec![0; 4];
        buf.extend_from_slice(&key.to_be_bytes());
        Frame::new(buf, FrameType::UserMsg, flags, 4)
    }

    fn keys(q: &SendQueue) -> Vec<u32> {
        q.iter()
            .map(|f| u32::from_be_bytes(f.body().unwrap().try_into().unwrap()))
            .collect()
    }

    const CMP: fn(&[u8], &[u8]) -> Ordering = |a, b| a.cmp(b);

    #[test]
    fn fifo_by_default() {
        let mut q = SendQueue::default();
        for key in [3, 1, 2] {
            q.enqueue(user_frame(key, EnqueueFlags::empty()), 0, 0, 0, None).ok().unwrap();
        }
        assert_eq!(keys(&q), [3, 1, 2]);
        assert_eq!(q.len(), 3);
        assert_eq!(q.bytes(), 24);
    }

    #[test]
    fn head_flag_preempts() {
        let mut q = SendQueue::default();
        for key in [1, 2] {
            q.enqueue(user_frame(key, EnqueueFlags::empty()), 0, 0, 0, None).ok().unwrap();
        }
        q.enqueue(frame(FrameType::Heartbeat, EnqueueFlags::HEAD, 76), 0, 0, 0, None)
            .ok()
            .unwrap();
        assert_eq!(q.iter().next().unwrap().typ, FrameType::Heartbeat);
    }

    #[test]
    fn no_dupe_collapses_against_head() {
        let mut q = SendQueue::default();
        let hb = || frame(FrameType::Heartbeat, EnqueueFlags::HEAD | EnqueueFlags::NO_DUPE, 76);
        for _ in 0..5 {
            q.enqueue(hb(), 0, 0, 0, None).ok().unwrap();
        }
        assert_eq!(q.len(), 1);
        assert_eq!(q.dedupe_count, 4);
    }

    #[test]
    fn caps_allow_exactly_one_frame_through() {
        let mut q = SendQueue::default();
        assert!(q.enqueue(user_frame(1, EnqueueFlags::empty()), 1, 0, 0, None).is_ok());
        assert!(q.enqueue(user_frame(2, EnqueueFlags::empty()), 1, 0, 0, None).is_err());
        assert_eq!(q.full_count, 1);
        // no-limit always passes
        assert!(q.enqueue(user_frame(3, EnqueueFlags::NO_LIMIT), 1, 0, 0, None).is_ok());

        // byte cap behaves the same, and an empty queue always accepts
        let mut q = SendQueue::default();
        assert!(q.enqueue(user_frame(1, EnqueueFlags::empty()), 0, 1, 0, None).is_ok());
        assert!(q.enqueue(user_frame(2, EnqueueFlags::empty()), 0, 1, 0, None).is_err());
    }

    #[test]
    fn inorder_inserts_within_lookahead() {
        let mut q = SendQueue::default();
        for key in [10, 20, 30] {
            q.enqueue(user_frame(key, EnqueueFlags::empty()), 0, 0, 0, None).ok().unwrap();
        }
        q.enqueue(user_frame(15, EnqueueFlags::INORDER), 0, 0, 8, Some(&CMP)).ok().unwrap();
        assert_eq!(keys(&q), [10, 15, 20, 30]);
        assert_eq!(q.reorder_count, 1);
    }

    #[test]
    fn inorder_walk_is_bounded() {
        let mut q = SendQueue::default();
        for key in [10, 20, 30, 40] {
            q.enqueue(user_frame(key, EnqueueFlags::empty()), 0, 0, 0, None).ok().unwrap();
        }
        // key 5 belongs at the front but the window only allows 2 steps back
        q.enqueue(user_frame(5, EnqueueFlags::INORDER), 0, 0, 2, Some(&CMP)).ok().unwrap();
        assert_eq!(keys(&q), [10, 20, 5, 30, 40]);
    }

    #[test]
    fn detach_resets_counters() {
        let mut q = SendQueue::default();
        for key in [1, 2] {
            q.enqueue(user_frame(key, EnqueueFlags::empty()), 0, 0, 0, None).ok().unwrap();
        }
        let batch = q.detach();
        assert_eq!(batch.len(), 2);
        assert!(q.is_empty());
        assert_eq!(q.bytes(), 0);
        assert_eq!(q.peak_count, 2);
    }
}
