//! src/gossip/protocol.rs
//!
//! Implements the probabilistic fanout rule. By isolating this logic, the
//! propagation behavior can be analyzed and tested without any networking.

use crate::domain::NodeIdentity;
use rand::{seq::SliceRandom, thread_rng};

/// Enclaves at or below this size receive full broadcasts; above it, each hop
/// sends to a random `ceil(sqrt(n))` sample.
pub const BROADCAST_THRESHOLD: usize = 10;

/// How many peers one hop sends to, for a candidate set of size `n`.
pub fn fanout_size(n: usize) -> usize {
    if n <= BROADCAST_THRESHOLD {
        n
    } else {
        (n as f64).sqrt().ceil() as usize
    }
}

/// Selects the peers one gossip hop sends to.
///
/// `exclude` is the node the message arrived from when forwarding, so a
/// message never bounces straight back. Selection is uniform via the thread
/// RNG (a CSPRNG), which keeps repeated rounds statistically independent and
/// gives the epidemic its coverage guarantee.
pub fn select_fanout<'a>(
    candidates: &'a [NodeIdentity],
    exclude: Option<&str>,
) -> Vec<&'a NodeIdentity> {
    let eligible: Vec<&NodeIdentity> = candidates
        .iter()
        .filter(|peer| exclude.map_or(true, |id| peer.id != id))
        .collect();

    let count = fanout_size(eligible.len());
    if count == eligible.len() {
        return eligible;
    }

    let mut rng = thread_rng();
    eligible
        .choose_multiple(&mut rng, count)
        .cloned()
        .collect()
}
