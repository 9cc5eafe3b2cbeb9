//! The per-thread callstack cache and the truncated-stack expander.
//!
//! The kernel caps the copied user stack, so deep recursion keeps
//! producing chains that end where the snapshot ran out. Full chains
//! seen earlier share their caller-side suffix; when the tail of a new
//! chain matches a window inside a cached one, the cached remainder is
//! spliced on.

use rustc_hash::FxHashMap;

pub const MAX_CALL_FRAME_EXPAND_CYCLE: usize = 10;
pub const MAX_CALL_FRAME_EXPAND_CACHE_SIZE: usize = 10;

use super::MAX_CALL_FRAME_UNWIND_SIZE;

/// A bounded insertion-ordered map from innermost pc to the full chain.
/// Insertion beyond capacity discards the oldest entry; re-insertion of
/// a key replaces its chain.
#[derive(Debug, Default)]
struct ChainCache {
    order: Vec<u64>,
    chains: FxHashMap<u64, Vec<u64>>,
}

impl ChainCache {
    fn insert(&mut self, key: u64, chain: Vec<u64>) {
        if self.chains.insert(key, chain).is_none() {
            self.order.push(key);
            if self.order.len() > MAX_CALL_FRAME_EXPAND_CACHE_SIZE {
                let oldest = self.order.remove(0);
                self.chains.remove(&oldest);
            }
        }
    }

    fn iter(&self) -> impl Iterator<Item = &Vec<u64>> {
        self.order.iter().filter_map(|key| self.chains.get(key))
    }

    fn len(&self) -> usize {
        self.order.len()
    }
}

#[derive(Debug, Default)]
pub struct CallStackExpander {
    caches: FxHashMap<i32, ChainCache>,
}

impl CallStackExpander {
    pub fn new() -> CallStackExpander {
        CallStackExpander::default()
    }

    /// Try to extend `frames` (innermost first) from this thread's cache
    /// and then remember the resulting chain. Returns the number of
    /// frames appended.
    pub fn expand(&mut self, tid: i32, frames: &mut Vec<u64>, expand_limit: usize) -> usize {
        if expand_limit == 0 || frames.len() < expand_limit {
            return 0;
        }

        let cache = self.caches.entry(tid).or_default();
        let mut expanded = 0;
        for chain in cache.iter() {
            if chain.len() < expand_limit {
                continue;
            }
            expanded = expand_one(frames, chain, expand_limit);
            if expanded > 0 {
                break;
            }
        }

        cache.insert(frames[0], frames.clone());
        expanded
    }

    pub fn cached_chain_count(&self, tid: i32) -> usize {
        self.caches.get(&tid).map_or(0, |cache| cache.len())
    }
}

/// Search `cached` for the first window matching the caller-side end of
/// `frames`; on a match with frames beyond the window, splice them on.
fn expand_one(frames: &mut Vec<u64>, cached: &[u64], expand_limit: usize) -> usize {
    if frames.len() < expand_limit
        || cached.len() < expand_limit
        || cached.len() >= MAX_CALL_FRAME_UNWIND_SIZE
    {
        return 0;
    }

    // The window is the chain's caller end (stack bottom); it stays
    // fixed while we slide over the cached chain.
    let window = &frames[frames.len() - expand_limit..];
    let anchor = window[0];

    let mut position = 0;
    for _ in 0..MAX_CALL_FRAME_EXPAND_CYCLE {
        let Some(found) = cached[position..].iter().position(|&pc| pc == anchor) else {
            return 0;
        };
        let start = position + found;
        if start + expand_limit > cached.len() {
            return 0;
        }
        if &cached[start..start + expand_limit] == window {
            let suffix = &cached[start + expand_limit..];
            frames.extend_from_slice(suffix);
            return suffix.len();
        }
        position = start + 1;
    }
    0
}

#[cfg(test)]
mod tests {
    use super::*;

    // Chains are innermost-first: [C, B, A] is A calling B calling C.

    #[test]
    fn splices_cached_callers_onto_truncated_chain() {
        let mut expander = CallStackExpander::new();

        // Full chain: F <- E <- C <- B <- A (innermost F).
        let full = vec![0xF, 0xE, 0xC, 0xB, 0xA];
        let mut first = full.clone();
        assert_eq!(expander.expand(1, &mut first, 2), 0);

        // Truncated chain ends at C; window [E, C] matches inside the
        // cached chain and the [B, A] tail is appended.
        let mut truncated = vec![0xF, 0xE, 0xC];
        let appended = expander.expand(1, &mut truncated, 2);
        assert_eq!(appended, 2);
        assert_eq!(truncated, vec![0xF, 0xE, 0xC, 0xB, 0xA]);

        // An even shorter chain expands against the refreshed cache.
        let mut truncated = vec![0xE, 0xC];
        let appended = expander.expand(1, &mut truncated, 2);
        assert_eq!(appended, 2);
        assert_eq!(truncated, vec![0xE, 0xC, 0xB, 0xA]);
    }

    #[test]
    fn expansion_soundness() {
        // Whenever k > 0 frames were appended, they must equal the
        // cached suffix after a window match.
        let mut expander = CallStackExpander::new();
        let cached = vec![10, 20, 30, 40, 50, 60];
        let mut seed = cached.clone();
        expander.expand(7, &mut seed, 3);

        let mut chain = vec![99, 20, 30, 40];
        let appended = expander.expand(7, &mut chain, 3);
        assert_eq!(appended, 2);
        assert_eq!(&chain[4..], &[50, 60]);
        // The matched window sits right before the appended suffix in
        // the cached chain.
        assert_eq!(&cached[1..4], &chain[1..4]);
    }

    #[test]
    fn no_match_appends_nothing() {
        let mut expander = CallStackExpander::new();
        let mut seed = vec![1, 2, 3, 4];
        expander.expand(5, &mut seed, 2);

        let mut chain = vec![7, 8, 9];
        assert_eq!(expander.expand(5, &mut chain, 2), 0);
        assert_eq!(chain, vec![7, 8, 9]);
    }

    #[test]
    fn caches_are_per_thread() {
        let mut expander = CallStackExpander::new();
        let mut seed = vec![1, 2, 3, 4];
        expander.expand(1, &mut seed, 2);

        // Same truncated chain on another tid sees an empty cache.
        let mut chain = vec![2, 3];
        assert_eq!(expander.expand(2, &mut chain, 2), 0);

        let mut chain = vec![2, 3];
        assert_eq!(expander.expand(1, &mut chain, 2), 1);
        assert_eq!(chain, vec![2, 3, 4]);
    }

    #[test]
    fn cache_is_bounded() {
        let mut expander = CallStackExpander::new();
        for i in 0..100u64 {
            let mut chain = vec![i * 1000, i * 1000 + 1];
            expander.expand(1, &mut chain, 1);
        }
        assert_eq!(
            expander.cached_chain_count(1),
            MAX_CALL_FRAME_EXPAND_CACHE_SIZE
        );
    }

    #[test]
    fn oversized_cached_chains_are_not_used() {
        let mut expander = CallStackExpander::new();
        let mut huge: Vec<u64> = (0..MAX_CALL_FRAME_UNWIND_SIZE as u64 + 4).collect();
        expander.expand(1, &mut huge, 2);

        let mut chain = vec![0, 1, 2];
        assert_eq!(expander.expand(1, &mut chain, 2), 0);
    }

    #[test]
    fn reinsertion_replaces_the_chain_for_a_key() {
        let mut expander = CallStackExpander::new();
        let mut first = vec![5, 6, 7];
        expander.expand(1, &mut first, 1);
        let mut second = vec![5, 6, 8, 9];
        expander.expand(1, &mut second, 1);
        assert_eq!(expander.cached_chain_count(1), 1);

        // The replacement chain is what future expansions see.
        let mut chain = vec![6, 8];
        assert_eq!(expander.expand(1, &mut chain, 2), 1);
        assert_eq!(chain, vec![6, 8, 9]);
    }
}
