/// Sliding replay window for record sequence numbers.
///
/// Maintains the highest accepted sequence number and a 64-bit bitmap of the
/// 64 sequence numbers at and below it.
///
/// Checking and marking are separate steps. A record is checked before
/// decryption and marked only once it authenticated.
#[derive(Debug, Default, Clone)]
pub struct ReplayWindow {
    max_seq: u64,
    window: u64,
}

/// Width of the window in sequence numbers.
pub const WINDOW_SIZE: u64 = 64;

impl ReplayWindow {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether `seqno` would be accepted. Does not change the window.
    pub fn check(&self, seqno: u64) -> bool {
        if self.window == 0 || seqno > self.max_seq {
            return true;
        }
        let offset = self.max_seq - seqno;
        if offset >= WINDOW_SIZE {
            return false; // too old
        }
        self.window & (1 << offset) == 0
    }

    /// Record `seqno` as accepted.
    pub fn mark(&mut self, seqno: u64) {
        if self.window == 0 {
            self.max_seq = seqno;
            self.window = 1;
        } else if seqno > self.max_seq {
            let delta = seqno - self.max_seq;
            self.window = if delta >= WINDOW_SIZE {
                0
            } else {
                self.window << delta
            };
            self.window |= 1;
            self.max_seq = seqno;
        } else {
            let offset = self.max_seq - seqno;
            if offset < WINDOW_SIZE {
                self.window |= 1 << offset;
            }
        }
    }

    /// Sequence number the peer is expected to use next.
    ///
    /// Used as the anchor for reconstructing truncated sequence numbers.
    pub fn expected_next(&self) -> u64 {
        if self.window == 0 {
            0
        } else {
            self.max_seq + 1
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn accept(w: &mut ReplayWindow, seq: u64) -> bool {
        if w.check(seq) {
            w.mark(seq);
            true
        } else {
            false
        }
    }

    #[test]
    fn accepts_fresh_and_rejects_duplicate() {
        let mut w = ReplayWindow::new();
        assert!(accept(&mut w, 0));
        assert!(!accept(&mut w, 0));
        assert!(accept(&mut w, 1));
        assert!(accept(&mut w, 2));
        assert!(!accept(&mut w, 1));
    }

    #[test]
    fn check_does_not_mutate() {
        let mut w = ReplayWindow::new();
        assert!(w.check(5));
        assert!(w.check(5));
        w.mark(5);
        assert!(!w.check(5));
    }

    #[test]
    fn accepts_out_of_order_within_window() {
        let mut w = ReplayWindow::new();
        assert!(accept(&mut w, 10));
        assert!(accept(&mut w, 8));
        assert!(!accept(&mut w, 8));
        assert!(accept(&mut w, 9));
    }

    #[test]
    fn rejects_too_old() {
        let mut w = ReplayWindow::new();
        assert!(accept(&mut w, 100));
        // offset = 64 -> too old
        assert!(!accept(&mut w, 36));
        // offset = 63 -> allowed once
        assert!(accept(&mut w, 37));
        assert!(!accept(&mut w, 37));
    }

    #[test]
    fn handles_large_jump_and_window_shift() {
        let mut w = ReplayWindow::new();
        assert!(accept(&mut w, 1));
        assert!(accept(&mut w, 80));
        assert!(accept(&mut w, 79));
        assert!(!accept(&mut w, 15));
        assert!(!accept(&mut w, 80));
    }

    #[test]
    fn expected_next_tracks_highest() {
        let mut w = ReplayWindow::new();
        assert_eq!(w.expected_next(), 0);
        w.mark(0);
        assert_eq!(w.expected_next(), 1);
        w.mark(7);
        w.mark(3);
        assert_eq!(w.expected_next(), 8);
    }

    #[test]
    fn accepted_sequence_never_accepted_again() {
        // Pseudo-random walk over a range wider than the window.
        let mut w = ReplayWindow::new();
        let mut accepted = Vec::new();
        let mut x: u64 = 17;
        for _ in 0..2000 {
            x = x.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
            let seq = (x >> 33) % 300;
            if accept(&mut w, seq) {
                assert!(!accepted.contains(&seq), "{} accepted twice", seq);
                accepted.push(seq);
            }
            let highest = *accepted.iter().max().unwrap_or(&0);
            if highest >= WINDOW_SIZE {
                assert!(!w.check(highest - WINDOW_SIZE));
            }
        }
    }
}
