use crate::peer::types::IceCandidate;
use std::collections::VecDeque;

/// Remote candidates that arrived before the remote description.
///
/// Candidates are queued in arrival order and drained exactly once, at the
/// moment the remote description is first installed. Whatever arrives after
/// that takes the immediate-apply path in the session, so the buffer never
/// fills again.
#[derive(Debug, Default)]
pub struct CandidateBuffer {
    pending: VecDeque<IceCandidate>,
    received: u64,
}

impl CandidateBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a candidate, preserving arrival order.
    pub fn push(&mut self, candidate: IceCandidate) {
        self.received += 1;
        log::debug!(
            "buffering remote candidate #{} until a remote description is set",
            self.received
        );
        self.pending.push_back(candidate);
    }

    /// Drains everything in receipt order; later calls return nothing.
    pub fn take(&mut self) -> Vec<IceCandidate> {
        self.pending.drain(..).collect()
    }

    /// Teardown path: queued candidates no longer have a session to apply to.
    pub fn clear(&mut self) {
        if !self.pending.is_empty() {
            log::debug!(
                "discarding {} unapplied candidates on close",
                self.pending.len()
            );
        }
        self.pending.clear();
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candidate(n: u32) -> IceCandidate {
        IceCandidate {
            candidate: format!("candidate:{n} 1 udp 2130706431 192.0.2.{n} 50000 typ host"),
            sdp_mid: Some("0".into()),
            sdp_mline_index: Some(0),
        }
    }

    #[test]
    fn preserves_arrival_order() {
        let mut buffer = CandidateBuffer::new();
        for n in 0..5 {
            buffer.push(candidate(n));
        }
        let drained = buffer.take();
        assert_eq!(drained, (0..5).map(candidate).collect::<Vec<_>>());
    }

    #[test]
    fn take_drains_exactly_once() {
        let mut buffer = CandidateBuffer::new();
        buffer.push(candidate(1));
        assert_eq!(buffer.take().len(), 1);
        assert!(buffer.take().is_empty());
        assert!(buffer.is_empty());
    }

    #[test]
    fn clear_discards_pending() {
        let mut buffer = CandidateBuffer::new();
        buffer.push(candidate(1));
        buffer.push(candidate(2));
        buffer.clear();
        assert!(buffer.is_empty());
    }
}
