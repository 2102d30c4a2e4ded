// BEP 6 allowed-fast set generation. Deterministic given (ip, info_hash_v1, num_pieces):
// both ends of a connection derive the same set independently, so there is nothing to
// negotiate beyond announcing it with `allow-fast` messages.

use std::net::{IpAddr, Ipv4Addr};

use sha1::{Digest, Sha1};

const K: usize = 10;

pub fn allowed_fast_set(ip: IpAddr, info_hash_v1: &[u8; 20], num_pieces: u32) -> Vec<usize> {
    let Some(v4) = to_ipv4(ip) else { return Vec::new() };
    if num_pieces == 0 {
        return Vec::new();
    }

    let masked = u32::from(v4) & 0xFFFF_FF00;
    let mut x = Vec::with_capacity(24);
    x.extend_from_slice(&masked.to_be_bytes());
    x.extend_from_slice(info_hash_v1);

    let mut indices = Vec::with_capacity(K);
    while indices.len() < K {
        let digest = Sha1::digest(&x);
        x = digest.to_vec();

        for chunk in x.chunks_exact(4) {
            if indices.len() == K {
                break;
            }
            let n = u32::from_be_bytes(chunk.try_into().unwrap());
            let idx = (n % num_pieces) as usize;
            if !indices.contains(&idx) {
                indices.push(idx);
            }
        }
    }

    indices
}

fn to_ipv4(ip: IpAddr) -> Option<Ipv4Addr> {
    match ip {
        IpAddr::V4(v4) => Some(v4),
        IpAddr::V6(v6) => v6.to_ipv4_mapped(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deterministic_across_runs() {
        let ip = IpAddr::V4(Ipv4Addr::new(80, 4, 4, 200));
        let hash = [0x41u8; 20];
        let a = allowed_fast_set(ip, &hash, 2000);
        let b = allowed_fast_set(ip, &hash, 2000);
        assert_eq!(a, b);
        assert_eq!(a.len(), K);
    }

    #[test]
    fn indices_are_in_range_and_distinct() {
        let ip = IpAddr::V4(Ipv4Addr::new(192, 168, 1, 1));
        let hash = [0x99u8; 20];
        let set = allowed_fast_set(ip, &hash, 1313);
        assert_eq!(set.len(), K);
        for idx in &set {
            assert!(*idx < 1313);
        }
        let mut sorted = set.clone();
        sorted.sort_unstable();
        sorted.dedup();
        assert_eq!(sorted.len(), set.len());
    }

    #[test]
    fn masked_to_lower_24_bits_gives_same_set_within_subnet() {
        let hash = [0x11u8; 20];
        let a = allowed_fast_set(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)), &hash, 500);
        let b = allowed_fast_set(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 254)), &hash, 500);
        assert_eq!(a, b);
    }
}
