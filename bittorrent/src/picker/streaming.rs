// Streaming-aware piece selection (sequential / adaptive playback), layered
// on top of the rarest-first `PiecePicker`. Four piece sets are tried in
// priority order: critical (e.g. moov atom), priority look-ahead window,
// then either a sequential sweep or rarest-first depending on mode.

use std::{
    collections::VecDeque,
    ops::Range,
    time::{Duration, Instant},
};

use crate::{
    bitfield::Bitfield,
    config::StreamingConfig,
    p2p::state::SessionState,
};

use super::piece_picker::PiecePicker;

const SEEK_LATENCY_WINDOW: usize = 10;
const BUFFER_HEALTH_HYBRID_ENTER: f64 = 90.0;
const BUFFER_HEALTH_HYBRID_EXIT: f64 = 70.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SelectionMode {
    Sequential,
    // Rarest-first beyond the priority window; BEP 40 peer priority ordering
    // still applies within it.
    Hybrid,
}

pub struct StreamingSelector {
    config: StreamingConfig,
    mode: SelectionMode,
    total_pieces: usize,
    playback_piece: usize,
    critical_zone: Range<usize>,
    priority_window: Vec<usize>,
    seek_latencies: VecDeque<Duration>,
    pending_seek_at: Option<Instant>,
    last_mode_switch: Option<Instant>,
}

impl StreamingSelector {
    pub fn new(config: StreamingConfig, total_pieces: usize) -> Self {
        Self {
            config,
            mode: SelectionMode::Sequential,
            total_pieces,
            playback_piece: 0,
            critical_zone: 0..0,
            priority_window: Vec::new(),
            seek_latencies: VecDeque::with_capacity(SEEK_LATENCY_WINDOW),
            pending_seek_at: None,
            last_mode_switch: None,
        }
    }

    pub fn mode(&self) -> SelectionMode {
        self.mode
    }

    pub fn set_critical_zone(&mut self, pieces: Range<usize>) {
        self.critical_zone = pieces;
    }

    // Maps a playback byte offset to a piece index, rebuilds the priority
    // window from there, and starts a seek-latency measurement.
    pub fn set_playback_position(&mut self, byte_offset: u64, piece_len: usize) {
        let piece_len = piece_len.max(1) as u64;
        let idx = (byte_offset / piece_len) as usize;
        self.playback_piece = idx.min(self.total_pieces.saturating_sub(1));

        self.priority_window.clear();
        let end = (self.playback_piece + self.config.look_ahead_pieces).min(self.total_pieces);
        self.priority_window.extend(self.playback_piece..end);

        self.pending_seek_at = Some(Instant::now());
    }

    // Called once every priority-window piece has arrived after a seek; feeds
    // the rolling seek-latency window used for UI/diagnostics.
    pub fn record_seek_satisfied(&mut self) {
        if let Some(start) = self.pending_seek_at.take() {
            if self.seek_latencies.len() == SEEK_LATENCY_WINDOW {
                self.seek_latencies.pop_front();
            }
            self.seek_latencies.push_back(start.elapsed());
        }
    }

    pub fn seek_latencies(&self) -> impl Iterator<Item = &Duration> {
        self.seek_latencies.iter()
    }

    // Adaptive mode switch: below `min_speed_for_sequential` with a healthy
    // buffer, prefer rarest-first beyond the priority window; once the
    // buffer drains, revert to pure sequential. A minimum dwell keeps this
    // from oscillating.
    pub fn update_adaptive(&mut self, download_bps: u64, buffer_health_pct: f64) {
        if !self.config.adaptive_strategy {
            return;
        }

        let dwell_elapsed = self
            .last_mode_switch
            .map(|t| t.elapsed() >= self.config.dwell_between_switches())
            .unwrap_or(true);
        if !dwell_elapsed {
            return;
        }

        match self.mode {
            SelectionMode::Sequential
                if download_bps < self.config.min_speed_for_sequential
                    && buffer_health_pct > BUFFER_HEALTH_HYBRID_ENTER =>
            {
                self.mode = SelectionMode::Hybrid;
                self.last_mode_switch = Some(Instant::now());
            }
            SelectionMode::Hybrid if buffer_health_pct < BUFFER_HEALTH_HYBRID_EXIT => {
                self.mode = SelectionMode::Sequential;
                self.last_mode_switch = Some(Instant::now());
            }
            _ => {}
        }
    }

    // A piece is requestable if the peer advertises it, or allow-fasted it to
    // us while we're choked — the one case the spec permits bypassing the
    // advertised-pieces check.
    fn requestable(idx: usize, peer_bf: &Bitfield, state: &SessionState) -> bool {
        (peer_bf.get(idx) || state.peer_allowed_fast.contains(&idx)) && state.can_request(idx)
    }

    pub fn select(
        &mut self,
        peer_bf: &Bitfield,
        own_bf: &Bitfield,
        state: &SessionState,
        piece_picker: &mut PiecePicker,
    ) -> Option<usize> {
        let wanted = |idx: usize| !own_bf.get(idx) && Self::requestable(idx, peer_bf, state);

        if let Some(idx) = self.critical_zone.clone().find(|&idx| wanted(idx)) {
            return Some(idx);
        }

        if let Some(&idx) = self.priority_window.iter().find(|&&idx| wanted(idx)) {
            return Some(idx);
        }

        match self.mode {
            SelectionMode::Sequential => {
                (self.playback_piece..self.total_pieces).find(|&idx| wanted(idx))
            }
            SelectionMode::Hybrid => piece_picker.pick_rarest(peer_bf, 1),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::p2p::state::SessionState;

    fn all_have(n: usize) -> Bitfield {
        Bitfield::have_all(n)
    }

    #[test]
    fn critical_zone_beats_priority_and_sequential() {
        let mut selector = StreamingSelector::new(StreamingConfig::video_streaming(), 100);
        selector.set_critical_zone(40..42);
        selector.set_playback_position(0, 1);

        let peer_bf = all_have(100);
        let own_bf = Bitfield::new(100);
        let mut state = SessionState::default();
        state.peer_choking = false;
        let mut picker = PiecePicker::new(100);

        let picked = selector.select(&peer_bf, &own_bf, &state, &mut picker).unwrap();
        assert_eq!(picked, 40);
    }

    #[test]
    fn priority_window_follows_playback_position() {
        let mut config = StreamingConfig::minimal();
        config.look_ahead_pieces = 3;
        let mut selector = StreamingSelector::new(config, 100);
        selector.set_playback_position(50, 1);

        let peer_bf = all_have(100);
        let own_bf = Bitfield::new(100);
        let mut state = SessionState::default();
        state.peer_choking = false;
        let mut picker = PiecePicker::new(100);

        let picked = selector.select(&peer_bf, &own_bf, &state, &mut picker).unwrap();
        assert_eq!(picked, 50);
    }

    #[test]
    fn choked_peer_without_allow_fast_yields_nothing() {
        let mut selector = StreamingSelector::new(StreamingConfig::minimal(), 10);
        selector.set_playback_position(0, 1);

        let peer_bf = all_have(10);
        let own_bf = Bitfield::new(10);
        let state = SessionState::default(); // peer_choking true by default
        let mut picker = PiecePicker::new(10);

        assert_eq!(selector.select(&peer_bf, &own_bf, &state, &mut picker), None);
    }

    #[test]
    fn allow_fast_permits_selection_while_choked() {
        let mut selector = StreamingSelector::new(StreamingConfig::minimal(), 10);
        selector.set_playback_position(0, 1);

        let peer_bf = Bitfield::new(10); // peer hasn't advertised piece 3 at all
        let own_bf = Bitfield::new(10);
        let mut state = SessionState::default();
        state.fast_enabled = true;
        state.peer_allowed_fast.insert(3);
        let mut picker = PiecePicker::new(10);

        let picked = selector.select(&peer_bf, &own_bf, &state, &mut picker).unwrap();
        assert_eq!(picked, 3);
    }

    #[test]
    fn adaptive_switch_respects_dwell() {
        let mut config = StreamingConfig::video_streaming();
        config.min_speed_for_sequential = 1_000_000;
        let mut selector = StreamingSelector::new(config, 10);

        selector.update_adaptive(100, 95.0);
        assert_eq!(selector.mode(), SelectionMode::Hybrid);

        // Immediately dropping below the exit threshold is within the dwell
        // window, so the mode should not revert yet.
        selector.update_adaptive(100, 50.0);
        assert_eq!(selector.mode(), SelectionMode::Hybrid);
    }

    #[test]
    fn non_adaptive_streaming_never_switches_modes() {
        let mut selector = StreamingSelector::new(StreamingConfig::minimal(), 10);
        selector.update_adaptive(0, 100.0);
        assert_eq!(selector.mode(), SelectionMode::Sequential);
    }
}
