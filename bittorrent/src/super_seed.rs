// BEP 16 super-seeding: once a task is 100% complete and the user opts in,
// advertise pieces one at a time instead of the full bitfield, spreading the
// rarest pieces first so the swarm self-organises without the seed doing all
// the upload work.
//
// The seeder never inspects payload data, only HAVE/BITFIELD observations
// (`observe_bitfield`/`observe_have`) and the outcome of its own offers
// (`on_peer_connected`/`on_piece_seen`). The orchestrator is responsible for
// suppressing the normal BITFIELD/HAVE-ALL handshake message and for sending
// whatever HAVE the methods below return.

use std::collections::HashMap;

use crate::{bitfield::Bitfield, p2p::PeerId};

#[derive(Debug, Clone, Copy, Default)]
pub struct SuperSeedStats {
    pub offered: u64,
    pub distributed: u64,
    avg_rarity: f64,
}

impl SuperSeedStats {
    pub fn avg_rarity(&self) -> f64 {
        self.avg_rarity
    }
}

#[derive(Debug)]
pub struct SuperSeeder {
    num_pieces: usize,
    // Number of connected peers known to have each piece.
    availability: Vec<usize>,
    // Pieces we have offered to at least one peer, so a later peer is never
    // re-offered the same one until everyone has it.
    offered_pieces: Vec<bool>,
    // Which piece is currently outstanding for a given peer, awaiting
    // confirmation that piece has reached someone else.
    offered_to: HashMap<PeerId, usize>,
    stats: SuperSeedStats,
}

impl SuperSeeder {
    pub fn new(num_pieces: usize) -> Self {
        Self {
            num_pieces,
            availability: vec![0; num_pieces],
            offered_pieces: vec![false; num_pieces],
            offered_to: HashMap::new(),
            stats: SuperSeedStats::default(),
        }
    }

    pub fn stats(&self) -> SuperSeedStats {
        self.stats
    }

    pub fn observe_bitfield(&mut self, from: PeerId, bf: &Bitfield) {
        for idx in bf.iter_set() {
            self.availability[idx] += 1;
        }
        self.check_distribution(from, bf.iter_set().collect::<Vec<_>>());
    }

    pub fn observe_have(&mut self, from: PeerId, idx: usize) -> Option<(PeerId, usize)> {
        self.availability[idx] += 1;
        self.check_distribution(from, vec![idx]).into_iter().next()
    }

    // A peer just connected (post-handshake, with BITFIELD/HAVE-ALL
    // suppressed): pick the globally rarest piece it hasn't been told about
    // and hand it the single HAVE to send.
    pub fn on_peer_connected(&mut self, peer: PeerId) -> Option<usize> {
        let idx = self.rarest_unoffered()?;
        self.offered_pieces[idx] = true;
        self.offered_to.insert(peer, idx);
        self.stats.offered += 1;
        self.update_avg_rarity(idx);
        Some(idx)
    }

    pub fn on_peer_disconnected(&mut self, peer: PeerId) {
        self.offered_to.remove(&peer);
    }

    // Reported pieces `indices` were just observed on peer `from`. Any other
    // peer we'd offered one of those pieces to has now had it distributed;
    // advance that peer's offer to the next rarest piece.
    fn check_distribution(&mut self, from: PeerId, indices: Vec<usize>) -> Vec<(PeerId, usize)> {
        let mut advances = Vec::new();

        let satisfied: Vec<PeerId> = self
            .offered_to
            .iter()
            .filter(|(&peer, &piece)| peer != from && indices.contains(&piece))
            .map(|(&peer, _)| peer)
            .collect();

        for peer in satisfied {
            self.stats.distributed += 1;
            if let Some(next) = self.rarest_unoffered() {
                self.offered_pieces[next] = true;
                self.offered_to.insert(peer, next);
                self.stats.offered += 1;
                self.update_avg_rarity(next);
                advances.push((peer, next));
            } else {
                self.offered_to.remove(&peer);
            }
        }

        advances
    }

    fn rarest_unoffered(&self) -> Option<usize> {
        (0..self.num_pieces)
            .filter(|&idx| !self.offered_pieces[idx])
            .min_by_key(|&idx| (self.availability[idx], idx))
    }

    fn update_avg_rarity(&mut self, idx: usize) {
        let n = self.stats.offered as f64;
        let rarity = self.availability[idx] as f64;
        self.stats.avg_rarity += (rarity - self.stats.avg_rarity) / n;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::SocketAddr;

    fn peer(port: u16) -> PeerId {
        PeerId { addr: SocketAddr::from(([127, 0, 0, 1], port)), transport: crate::p2p::Transport::Tcp }
    }

    #[test]
    fn offers_globally_rarest_piece_first() {
        let mut seeder = SuperSeeder::new(4);
        seeder.availability = vec![3, 1, 2, 0];

        let idx = seeder.on_peer_connected(peer(1)).unwrap();
        assert_eq!(idx, 3);
    }

    #[test]
    fn ties_broken_by_lowest_index() {
        let mut seeder = SuperSeeder::new(3);
        assert_eq!(seeder.availability, vec![0, 0, 0]);

        let idx = seeder.on_peer_connected(peer(1)).unwrap();
        assert_eq!(idx, 0);
    }

    #[test]
    fn advances_only_after_distinct_peer_confirms() {
        let mut seeder = SuperSeeder::new(3);
        let a = peer(1);
        let b = peer(2);

        let offered_a = seeder.on_peer_connected(a).unwrap();
        assert_eq!(offered_a, 0);

        // Same peer re-reporting the piece it was offered must not advance it.
        let advance = seeder.observe_have(a, offered_a);
        assert!(advance.is_none());
        assert_eq!(seeder.offered_to.get(&a), Some(&0));

        // A different peer reporting it confirms distribution and advances.
        let advance = seeder.observe_have(b, offered_a);
        assert_eq!(advance, Some((a, 1)));
        assert_eq!(seeder.offered_to.get(&a), Some(&1));
        assert_eq!(seeder.stats().distributed, 1);
    }

    #[test]
    fn never_offers_the_same_piece_twice() {
        let mut seeder = SuperSeeder::new(2);
        let a = peer(1);
        let b = peer(2);

        let first = seeder.on_peer_connected(a).unwrap();
        let second = seeder.on_peer_connected(b).unwrap();
        assert_ne!(first, second);
    }
}
