//! Session random number generation.
//!
//! One `SessionRng` is built from the participant seed and passed by `&mut`
//! through every allocator. The draw order is part of the reproducibility
//! contract, so allocators must never build their own generator from the
//! session seed except through [`stream_rng`].

use rand::seq::SliceRandom;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;

pub type SessionRng = ChaCha8Rng;

pub fn session_rng(seed: u64) -> SessionRng {
    ChaCha8Rng::seed_from_u64(seed)
}

/// Independent generator on its own ChaCha stream. Draws from it never shift
/// the main session stream.
pub fn stream_rng(seed: u64, stream: u64) -> SessionRng {
    let mut rng = ChaCha8Rng::seed_from_u64(seed);
    rng.set_stream(stream);
    rng
}

/// `n` distinct elements of `pool`, in random order.
pub(crate) fn sample_distinct<T: Clone>(pool: &[T], n: usize, rng: &mut SessionRng) -> Vec<T> {
    let mut scratch = pool.to_vec();
    let (picked, _) = scratch.partial_shuffle(rng, n.min(pool.len()));
    picked.to_vec()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::Rng;

    #[test]
    fn same_seed_same_stream() {
        let mut a = session_rng(7);
        let mut b = session_rng(7);
        let xs: Vec<u32> = (0..8).map(|_| a.gen()).collect();
        let ys: Vec<u32> = (0..8).map(|_| b.gen()).collect();
        assert_eq!(xs, ys);
    }

    #[test]
    fn streams_are_independent() {
        let mut a = stream_rng(7, 1);
        let mut b = stream_rng(7, 2);
        let xs: Vec<u32> = (0..8).map(|_| a.gen()).collect();
        let ys: Vec<u32> = (0..8).map(|_| b.gen()).collect();
        assert_ne!(xs, ys);
    }

    #[test]
    fn sample_distinct_never_repeats() {
        let mut rng = session_rng(3);
        let pool: Vec<u8> = (0..6).collect();
        for _ in 0..50 {
            let mut picked = sample_distinct(&pool, 3, &mut rng);
            picked.sort_unstable();
            picked.dedup();
            assert_eq!(picked.len(), 3);
        }
    }
}
