/// Negotiation progress of one session.
///
/// `Idle → Offering → AwaitingAnswer → Negotiating → Connected` on the
/// caller side; the callee jumps from `Idle` to `Negotiating` when it
/// answers an offer. `Closed` is terminal and reachable from anywhere.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NegotiationState {
    /// No connection resource exists yet.
    Idle,
    /// Local offer is being produced.
    Offering,
    /// Local offer sent; the remote answer is outstanding.
    AwaitingAnswer,
    /// Both descriptions installed; transport is connecting.
    Negotiating,
    /// Transport reported a usable connection.
    Connected,
    /// Torn down. A new call requires a new session.
    Closed,
}

impl NegotiationState {
    /// A remote description is installed from `Negotiating` onward. This is
    /// the gate between buffering candidates and applying them directly.
    pub fn remote_installed(self) -> bool {
        matches!(self, Self::Negotiating | Self::Connected)
    }

    /// A local offer is pending and an incoming offer means glare.
    pub fn offer_pending(self) -> bool {
        matches!(self, Self::Offering | Self::AwaitingAnswer)
    }

    pub fn is_closed(self) -> bool {
        matches!(self, Self::Closed)
    }
}
