use std::time::Duration;

use crate::rng::SeededRng;

// In seconds.
const JITTER_RANGE: f32 = 0.5;

/// Retransmission backoff for one outstanding flight or control message.
///
/// Doubles on every attempt with a ±0.25s jitter and never goes below 50ms.
#[derive(Debug)]
pub struct ExponentialBackoff {
    start_rto: Duration,
    retries: usize,
    rto: Duration,
    jitter: f32,
    left: usize,
}

impl ExponentialBackoff {
    pub fn new(start_rto: Duration, retries: usize, rng: &mut SeededRng) -> Self {
        Self {
            start_rto,
            retries,
            rto: start_rto,
            jitter: Self::jitter(rng),
            left: retries,
        }
    }

    pub fn reset(&mut self, rng: &mut SeededRng) {
        self.rto = self.start_rto;
        self.jitter = Self::jitter(rng);
        self.left = self.retries;
    }

    pub fn rto(&self) -> Duration {
        let jitter = Duration::from_secs_f32(self.jitter.abs());
        let rto = if self.jitter < 0.0 {
            self.rto.saturating_sub(jitter)
        } else {
            self.rto + jitter
        };
        rto.max(Duration::from_millis(50))
    }

    fn jitter(rng: &mut SeededRng) -> f32 {
        rng.random::<f32>() * JITTER_RANGE - (JITTER_RANGE / 2.0)
    }

    /// Consume one retry. No effect once retries are exhausted.
    pub fn attempt(&mut self, rng: &mut SeededRng) {
        let Some(left) = self.left.checked_sub(1) else {
            return;
        };
        self.left = left;
        self.jitter = Self::jitter(rng);
        self.rto *= 2;
    }

    pub fn can_retry(&self) -> bool {
        self.left > 0
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn attempts_double_until_exhausted() {
        let mut rng = SeededRng::new(Some(42));
        let mut exp = ExponentialBackoff::new(Duration::from_secs(1), 3, &mut rng);

        let mut last = exp.rto();
        for _ in 0..3 {
            assert!(exp.can_retry());
            exp.attempt(&mut rng);
            let next = exp.rto();
            assert!(next > last, "{:?} > {:?}", next, last);
            last = next;
        }

        assert!(!exp.can_retry());
        exp.attempt(&mut rng);
        assert_eq!(exp.rto(), last);
    }

    #[test]
    fn reset_restores_start() {
        let mut rng = SeededRng::new(Some(7));
        let mut exp = ExponentialBackoff::new(Duration::from_millis(200), 2, &mut rng);
        exp.attempt(&mut rng);
        exp.attempt(&mut rng);
        assert!(!exp.can_retry());

        exp.reset(&mut rng);
        assert!(exp.can_retry());
        assert!(exp.rto() <= Duration::from_millis(450));
    }

    #[test]
    fn floor_is_fifty_millis() {
        let mut rng = SeededRng::new(Some(1));
        let exp = ExponentialBackoff::new(Duration::from_millis(1), 1, &mut rng);
        assert!(exp.rto() >= Duration::from_millis(50));
    }
}
