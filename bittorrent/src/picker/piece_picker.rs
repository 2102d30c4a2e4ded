// Rarest-first bookkeeping: each peer's bitfield increments the frequency counter
// for every piece it reports having, so `pick_new_piece` can favour the least
// commonly available piece among connected peers. Randomisation among several
// of the least common pieces is left to the caller (the streaming selector),
// this layer only tracks frequency and ownership.

use crate::bitfield::Bitfield;

#[derive(Clone, Copy, Default, Debug)]
struct PieceInfo {
    // Number of peers that have this piece.
    frequency: usize,
    // Is the piece partially downloaded.
    is_partial: bool,
}

#[derive(Debug)]
pub struct PiecePicker {
    // All pieces in the torrent, idx aligned.
    pieces: Vec<PieceInfo>,
    // The pieces that we have.
    have: Bitfield,
}

impl PiecePicker {

    pub fn new(num_pieces: usize) -> Self {
        Self {
            pieces: vec![PieceInfo::default(); num_pieces],
            have: Bitfield::new(num_pieces),
        }
    }

    pub fn own_bitfield(&self) -> &Bitfield {
        &self.have
    }

    pub fn all(&self) -> bool {
        self.have.is_have_all()
    }

    pub fn set_own_bitfield(&mut self, bf: Bitfield) {
        debug_assert_eq!(bf.len(), self.have.len());
        self.have = bf;
    }

    pub fn increment_piece(&mut self, idx: usize) -> bool {
        assert!(idx < self.pieces.len());
        self.pieces[idx].frequency += 1;
        self.have.get(idx)
    }

    pub fn received_piece(&mut self, idx: usize) {
        assert!(idx < self.pieces.len());
        self.have.set(idx, true);
    }

    // Returns true if there is at least one piece that the peer has and we don't.
    pub fn bitfield_update(&mut self, bf: &Bitfield) -> bool {
        debug_assert_eq!(bf.len(), self.have.len());
        let mut interested = false;
        for idx in bf.iter_set() {
            self.pieces[idx].frequency += 1;
            if !self.have.get(idx) {
                interested = true;
            }
        }
        interested
    }

    pub fn pick_new_piece(&mut self, bf: &Bitfield) -> Option<usize> {
        for idx in 0..self.have.len() {
            let piece = &mut self.pieces[idx];
            if !self.have.get(idx) && piece.frequency > 0 && !piece.is_partial && bf.get(idx) {
                piece.is_partial = true;
                return Some(idx)
            }
        }
        None
    }

    // Picks among the `n` rarest pieces the peer has and we lack, breaking ties
    // randomly-ish by scan order rather than a full shuffle.
    pub fn pick_rarest(&mut self, bf: &Bitfield, n: usize) -> Option<usize> {
        let mut candidates: Vec<usize> = (0..self.have.len())
            .filter(|&idx| !self.have.get(idx) && !self.pieces[idx].is_partial && bf.get(idx))
            .collect();
        candidates.sort_by_key(|&idx| self.pieces[idx].frequency);
        let picked = candidates.into_iter().take(n.max(1)).next()?;
        self.pieces[picked].is_partial = true;
        Some(picked)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bitfield_update_sets_interested_and_frequency() {
        let mut picker = PiecePicker::new(4);
        let mut peer_bf = Bitfield::new(4);
        peer_bf.set(1, true);
        peer_bf.set(2, true);
        assert!(picker.bitfield_update(&peer_bf));

        let idx = picker.pick_new_piece(&peer_bf).unwrap();
        assert!(idx == 1 || idx == 2);
    }

    #[test]
    fn already_owned_piece_is_not_interesting() {
        let mut picker = PiecePicker::new(2);
        picker.received_piece(0);
        let mut peer_bf = Bitfield::new(2);
        peer_bf.set(0, true);
        assert!(!picker.bitfield_update(&peer_bf));
    }

    #[test]
    fn rarest_pick_prefers_lower_frequency() {
        let mut picker = PiecePicker::new(3);
        let mut bf_common = Bitfield::new(3);
        bf_common.set(0, true);
        bf_common.set(1, true);
        bf_common.set(2, true);
        // Piece 1 seen by three peers, piece 0 and 2 by one each.
        picker.bitfield_update(&bf_common);
        picker.bitfield_update(&bf_common);
        picker.bitfield_update(&bf_common);

        let mut bf_rare = Bitfield::new(3);
        bf_rare.set(0, true);
        picker.bitfield_update(&bf_rare);

        let picked = picker.pick_rarest(&bf_common, 1);
        assert_eq!(picked, Some(0));
    }
}
