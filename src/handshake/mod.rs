//! Handshake reliability: the transcript, the outgoing flight and the
//! reassembly of incoming messages.
//!
//! Both directions track a message as the window of bytes still missing
//! (receive) or not yet acknowledged (send). The window only shrinks from
//! its edges, which keeps the bookkeeping to two offsets per message.

mod recv;
mod send;
mod transcript;

pub(crate) use recv::{Absorbed, Message, RecvQueue};
pub(crate) use send::{Fragment, SendQueue, MIN_FRAGMENT};
pub(crate) use transcript::Transcript;

use std::ops::Range;

/// Shrink `window` by `covered` if it touches either edge.
///
/// Returns false, leaving the window untouched, when `covered` lies
/// strictly inside the window or misses it entirely.
pub(crate) fn collapse(window: &mut Range<usize>, covered: &Range<usize>) -> bool {
    if window.is_empty() || covered.is_empty() {
        return false;
    }
    let mut changed = false;
    if covered.start <= window.start && covered.end > window.start {
        window.start = covered.end.min(window.end);
        changed = true;
    }
    if !window.is_empty() && covered.end >= window.end && covered.start < window.end {
        window.end = covered.start.max(window.start);
        changed = true;
    }
    if window.is_empty() {
        // Normalize so an empty window compares equal regardless of where
        // it closed.
        *window = window.start..window.start;
    }
    changed
}
