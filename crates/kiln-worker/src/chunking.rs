//! Adaptive chunk sizing
//!
//! Chunk size scales with free VRAM and shrinks before a chunk that would
//! otherwise OOM. Growing back is only allowed after a clean chunk; two
//! consecutive unhealthy pre-flights at the floor fail the job.

/// Decision for the next chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkDecision {
    /// Run a chunk of this many lines
    Run(usize),
    /// Unhealthy but not yet fatal; back off briefly and re-probe
    Backoff,
    /// Two consecutive unhealthy pre-flights at the floor: fail the job
    Abort,
}

#[derive(Debug, Clone)]
pub struct ChunkPolicy {
    default_size: usize,
    min_size: usize,
    current: usize,
    floor_strikes: u8,
    /// Regrow is only permitted after a chunk completed cleanly
    may_grow: bool,
}

impl ChunkPolicy {
    pub fn new(default_size: usize, min_size: usize) -> Self {
        Self {
            default_size,
            min_size,
            current: default_size,
            floor_strikes: 0,
            may_grow: false,
        }
    }

    /// Size tier for a given free-VRAM fraction.
    fn tier(&self, free_fraction: f64) -> usize {
        if free_fraction >= 0.50 {
            self.default_size
        } else if free_fraction >= 0.25 {
            (self.default_size * 3 / 5).max(self.min_size)
        } else if free_fraction >= 0.15 {
            (self.default_size / 5).max(self.min_size)
        } else {
            self.min_size
        }
    }

    /// Pre-flight decision given the health probe outcome.
    pub fn pre_flight(&mut self, healthy: bool, free_fraction: f64) -> ChunkDecision {
        if !healthy {
            if self.current == self.min_size {
                self.floor_strikes += 1;
                if self.floor_strikes >= 2 {
                    return ChunkDecision::Abort;
                }
            } else {
                self.current = (self.current / 2).max(self.min_size);
            }
            self.may_grow = false;
            return ChunkDecision::Backoff;
        }

        self.floor_strikes = 0;
        let tier = self.tier(free_fraction);
        if tier < self.current {
            self.current = tier;
        } else if tier > self.current && self.may_grow {
            self.current = tier;
        }
        self.may_grow = false;
        ChunkDecision::Run(self.current)
    }

    /// A chunk completed without incident; the next pre-flight may grow.
    pub fn on_clean_chunk(&mut self) {
        self.may_grow = true;
        self.floor_strikes = 0;
    }

    pub fn current(&self) -> usize {
        self.current
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tiers_follow_free_vram() {
        let mut p = ChunkPolicy::new(5000, 500);
        assert_eq!(p.pre_flight(true, 0.8), ChunkDecision::Run(5000));
        p.on_clean_chunk();
        assert_eq!(p.pre_flight(true, 0.4), ChunkDecision::Run(3000));
        p.on_clean_chunk();
        assert_eq!(p.pre_flight(true, 0.2), ChunkDecision::Run(1000));
        p.on_clean_chunk();
        assert_eq!(p.pre_flight(true, 0.1), ChunkDecision::Run(500));
    }

    #[test]
    fn test_unhealthy_halves_then_aborts_at_floor() {
        let mut p = ChunkPolicy::new(5000, 500);
        assert_eq!(p.pre_flight(false, 0.5), ChunkDecision::Backoff);
        assert_eq!(p.current(), 2500);
        assert_eq!(p.pre_flight(false, 0.5), ChunkDecision::Backoff);
        assert_eq!(p.pre_flight(false, 0.5), ChunkDecision::Backoff);
        assert_eq!(p.current(), 625);
        assert_eq!(p.pre_flight(false, 0.5), ChunkDecision::Backoff);
        assert_eq!(p.current(), 500);
        // First unhealthy probe at the floor is a strike, second aborts
        assert_eq!(p.pre_flight(false, 0.5), ChunkDecision::Backoff);
        assert_eq!(p.pre_flight(false, 0.5), ChunkDecision::Abort);
    }

    #[test]
    fn test_healthy_probe_resets_strikes() {
        let mut p = ChunkPolicy::new(1000, 500);
        assert_eq!(p.pre_flight(false, 0.5), ChunkDecision::Backoff);
        assert_eq!(p.current(), 500);
        assert_eq!(p.pre_flight(false, 0.5), ChunkDecision::Backoff);
        // One healthy probe wipes the strike count
        assert_eq!(p.pre_flight(true, 0.1), ChunkDecision::Run(500));
        assert_eq!(p.pre_flight(false, 0.1), ChunkDecision::Backoff);
        assert_eq!(p.pre_flight(false, 0.1), ChunkDecision::Abort);
    }

    #[test]
    fn test_no_regrow_without_clean_chunk() {
        let mut p = ChunkPolicy::new(5000, 500);
        assert_eq!(p.pre_flight(true, 0.2), ChunkDecision::Run(1000));
        // VRAM freed up, but the last chunk has not been confirmed clean
        assert_eq!(p.pre_flight(true, 0.9), ChunkDecision::Run(1000));
        p.on_clean_chunk();
        assert_eq!(p.pre_flight(true, 0.9), ChunkDecision::Run(5000));
    }
}
