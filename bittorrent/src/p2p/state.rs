use std::collections::HashSet;

use crate::stats::ThroughputStats;

#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum ConnState {
    Connecting,
    Connected,
    Disconnected,
    Handshaking,
    Introducing, // Where peers tell each other what pieces they have.
}

#[derive(Debug, Clone)]
pub struct SessionState {

    pub conn_state: ConnState,

    // Whether we are answering the peer's requests.
    pub choked: bool,

    // Whether we are interested in the peer's pieces.
    pub interested: bool,

    // Whether the peer is answering our requests.
    pub peer_choking: bool,

    // Whether the peer is interested in our pieces.
    pub peer_interested: bool,

    pub throughput: ThroughputStats,

    pub num_pieces: usize,

    pub changed: bool,

    // Negotiated via the handshake reserved bytes, not renegotiable for the
    // life of the connection.
    pub fast_enabled: bool,
    pub extended_enabled: bool,
    pub v2_enabled: bool,

    // Pieces the peer told us (via allow-fast) we may request while choked,
    // and the pieces we extended the same courtesy to.
    pub peer_allowed_fast: HashSet<usize>,
    pub our_allowed_fast: HashSet<usize>,
}

impl Default for SessionState {
    fn default() -> SessionState {
        SessionState {
            conn_state: ConnState::Disconnected,
            choked: true,
            interested: false,
            peer_choking: true,
            peer_interested: false,
            throughput: ThroughputStats::default(),
            changed: false,
            num_pieces: 0,
            fast_enabled: false,
            extended_enabled: false,
            v2_enabled: false,
            peer_allowed_fast: HashSet::new(),
            our_allowed_fast: HashSet::new(),
        }
    }
}

impl SessionState {

    pub fn tick(&mut self) {
        self.throughput.reset();
    }

    #[inline(always)]
    pub fn update(&mut self, f: impl FnOnce(&mut SessionState)) {
        f(self);
        self.changed = true;
    }

    // Whether a piece may be requested right now: either we're unchoked, or
    // the peer allow-fasted it to us under BEP 6.
    pub fn can_request(&self, piece_idx: usize) -> bool {
        !self.peer_choking || (self.fast_enabled && self.peer_allowed_fast.contains(&piece_idx))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allowed_fast_piece_is_requestable_while_choked() {
        let mut state = SessionState::default();
        state.fast_enabled = true;
        state.peer_allowed_fast.insert(3);
        assert!(state.can_request(3));
        assert!(!state.can_request(4));
    }

    #[test]
    fn choked_without_fast_blocks_requests() {
        let state = SessionState::default();
        assert!(!state.can_request(0));
    }
}