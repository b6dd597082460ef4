//! Internal random number generator based on PCG32.
//!
//! A minimal PRNG used for protocol identifiers (the per-session header
//! magic), avoiding a `rand` dependency for the one place randomness is
//! needed. PCG32 has 64 bits of state, 32-bit output and a period of 2^64.
//!
//! Reference: <https://www.pcg-random.org/>

/// PCG32 random number generator.
///
/// The PCG-XSH-RR variant with 64-bit state. NOT cryptographically secure;
/// the header magic only needs to differ between sessions, not resist an
/// adversary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Pcg32 {
    state: u64,
    inc: u64,
}

/// Default increment for single-stream PCG32, from the PCG paper.
const PCG_DEFAULT_INCREMENT: u64 = 1442695040888963407;

/// Standard multiplier for 64-bit state PCG.
const PCG_MULTIPLIER: u64 = 6364136223846793005;

impl Pcg32 {
    /// Creates a new PCG32 generator with the given state and stream.
    ///
    /// The increment must be odd; an even stream is made odd by OR-ing
    /// with 1.
    #[must_use]
    pub const fn new(state: u64, stream: u64) -> Self {
        let inc = (stream << 1) | 1;
        // Standard PCG seeding: advance once, add the state, advance again.
        let mut pcg = Self { state: 0, inc };
        pcg.state = pcg.state.wrapping_mul(PCG_MULTIPLIER).wrapping_add(pcg.inc);
        pcg.state = pcg.state.wrapping_add(state);
        pcg.state = pcg.state.wrapping_mul(PCG_MULTIPLIER).wrapping_add(pcg.inc);
        pcg
    }

    /// Creates a generator seeded from a 64-bit value. Same seed, same
    /// sequence; this is what [`ProtocolConfig::session_seed`] feeds.
    ///
    /// [`ProtocolConfig::session_seed`]: crate::ProtocolConfig::session_seed
    #[must_use]
    pub const fn seed_from_u64(seed: u64) -> Self {
        Self::new(seed, PCG_DEFAULT_INCREMENT)
    }

    /// Generates the next 32-bit random value.
    #[inline]
    #[must_use]
    pub fn next_u32(&mut self) -> u32 {
        let old_state = self.state;
        self.state = old_state
            .wrapping_mul(PCG_MULTIPLIER)
            .wrapping_add(self.inc);
        // XSH-RR output permutation: xor-shift, then random rotate.
        let xorshifted = (((old_state >> 18) ^ old_state) >> 27) as u32;
        let rot = (old_state >> 59) as u32;
        xorshifted.rotate_right(rot)
    }

    /// Generates the next 16-bit random value.
    #[inline]
    #[must_use]
    pub fn next_u16(&mut self) -> u16 {
        (self.next_u32() >> 16) as u16
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn same_seed_same_sequence() {
        let mut rng1 = Pcg32::seed_from_u64(12345);
        let mut rng2 = Pcg32::seed_from_u64(12345);
        for _ in 0..1000 {
            assert_eq!(rng1.next_u32(), rng2.next_u32());
        }
    }

    #[test]
    fn different_seeds_diverge() {
        let mut rng1 = Pcg32::seed_from_u64(12345);
        let mut rng2 = Pcg32::seed_from_u64(54321);
        let seq1: Vec<u32> = (0..10).map(|_| rng1.next_u32()).collect();
        let seq2: Vec<u32> = (0..10).map(|_| rng2.next_u32()).collect();
        assert_ne!(seq1, seq2);
    }

    // Golden values pin the algorithm; a change here breaks seeded sessions.
    #[test]
    fn golden_sequence_for_seed_zero() {
        let mut rng = Pcg32::seed_from_u64(0);
        let expected = [
            0x348a463f_u32,
            0x4f205a1b_u32,
            0x2946c488_u32,
            0x805e36de_u32,
            0x79f994a9_u32,
        ];
        for &exp in &expected {
            assert_eq!(rng.next_u32(), exp);
        }
    }

    #[test]
    fn sixteen_bit_output_takes_the_high_half() {
        let mut a = Pcg32::seed_from_u64(7);
        let mut b = Pcg32::seed_from_u64(7);
        assert_eq!(a.next_u16(), (b.next_u32() >> 16) as u16);
    }
}
