use rand::seq::SliceRandom;
use rand::Rng;

use crate::DrawError;

/// Picks one candidate uniformly at random.
///
/// Every call is independent of the previous ones; callers exclude matched
/// entities by not passing them in.
pub fn pick_uniform<'a, T, R>(candidates: &'a [T], rng: &mut R) -> Result<&'a T, DrawError>
where
    R: Rng + ?Sized,
{
    candidates.choose(rng).ok_or(DrawError::EmptyPool)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;

    #[test]
    fn empty_pool_is_an_error() {
        let mut rng = ChaCha8Rng::seed_from_u64(1);
        let empty: [u32; 0] = [];
        assert_eq!(pick_uniform(&empty, &mut rng), Err(DrawError::EmptyPool));
    }

    #[test]
    fn single_candidate_is_always_picked() {
        let mut rng = ChaCha8Rng::seed_from_u64(2);
        for _ in 0..100 {
            assert_eq!(pick_uniform(&["only"], &mut rng), Ok(&"only"));
        }
    }

    #[test]
    fn frequencies_approach_one_over_n() {
        const N: usize = 6;
        const SAMPLES: usize = 60_000;
        let candidates: Vec<usize> = (0..N).collect();
        let mut rng = ChaCha8Rng::seed_from_u64(42);
        let mut counts = [0usize; N];

        for _ in 0..SAMPLES {
            let picked = pick_uniform(&candidates, &mut rng).unwrap();
            counts[*picked] += 1;
        }

        let expected = SAMPLES as f64 / N as f64;
        for (index, count) in counts.iter().enumerate() {
            let deviation = (*count as f64 - expected).abs() / expected;
            assert!(
                deviation < 0.05,
                "candidate {index} drawn {count} times, expected about {expected}"
            );
        }
    }
}
