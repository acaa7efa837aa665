//! Repeated sub-range detection over block sequences.
//!
//! [`find_cycles`] runs a hash-indexed multi-walker scan that reports every
//! repeated range in one pass, then drops ranges contained in larger ones and
//! resolves overlaps by re-scanning the non-overlapping remainder.
//! [`find_cycle_brent`] is the classic tortoise-and-hare search for the first
//! cycle of a sequence.

use std::collections::hash_map::DefaultHasher;
use std::collections::{HashMap, HashSet};
use std::hash::{Hash, Hasher};

use crate::domain::models::trace::Block;

/// Half-open `[start, end)` index range into the scanned sequence.
pub type CycleRange = (usize, usize);

/// Walker following a candidate repetition that started at `from` and was
/// spawned when the same element reappeared at `to`.
#[derive(Debug, Clone, Copy)]
struct Walker {
    from: usize,
    current: usize,
    to: usize,
}

/// Find all maximal non-overlapping repeated ranges of `seq`.
pub fn find_cycles<T: Eq + Hash>(seq: &[T]) -> Vec<CycleRange> {
    let mut ranges = scan(seq, 0, seq.len());
    ranges.sort_unstable();
    ranges.dedup();

    // Re-scanned remainders may land inside a range kept elsewhere.
    let mut disjoint: Vec<CycleRange> = Vec::with_capacity(ranges.len());
    for range in remove_subranges(ranges) {
        if disjoint.last().is_none_or(|kept| kept.1 <= range.0) {
            disjoint.push(range);
        }
    }
    disjoint
}

fn scan<T: Eq + Hash>(seq: &[T], first: usize, last: usize) -> Vec<CycleRange> {
    let mut found: Vec<CycleRange> = Vec::new();
    let mut seen: HashMap<&T, Vec<usize>> = HashMap::new();
    let mut walkers: Vec<Walker> = Vec::new();
    let mut walking_from: HashSet<usize> = HashSet::new();

    for it in first..last {
        let element = &seq[it];

        walkers.retain_mut(|w| {
            w.current += 1;
            if seq[w.current] == *element {
                return true;
            }
            if seq[w.current] == seq[w.from] {
                extend(seq, w, last);
                if w.current >= w.to {
                    found.push((w.from, w.current));
                }
            }
            walking_from.remove(&w.from);
            false
        });

        let priors = seen.entry(element).or_default();
        for &prior in priors.iter() {
            if walking_from.insert(prior) {
                walkers.push(Walker {
                    from: prior,
                    current: prior,
                    to: it,
                });
            }
        }
        priors.push(it);
    }

    // A repetition that runs to the very end never sees a mismatch.
    for w in &mut walkers {
        let next = w.current + 1;
        if next < last && seq[next] == seq[w.from] {
            w.current = next;
            extend(seq, w, last);
            if w.current >= w.to {
                found.push((w.from, w.current));
            }
        }
    }

    found.sort_unstable();
    found.dedup();
    let mut ranges = remove_subranges(found);
    remove_overlapping(seq, &mut ranges);
    ranges
}

fn extend<T: Eq>(seq: &[T], w: &mut Walker, last: usize) {
    let mut f = w.from;
    while w.current < last && seq[f] == seq[w.current] {
        f += 1;
        w.current += 1;
    }
}

/// Drop every range strictly contained in another.
fn remove_subranges(ranges: Vec<CycleRange>) -> Vec<CycleRange> {
    ranges
        .iter()
        .copied()
        .filter(|p| {
            !ranges.iter().any(|i| {
                (i.0 <= p.0 && i.1 > p.1) || (i.0 < p.0 && i.1 >= p.1)
            })
        })
        .collect()
}

/// Resolve partially overlapping ranges: keep the longer one and re-scan
/// what remains of the shorter one for cycles of its own.
fn remove_overlapping<T: Eq + Hash>(seq: &[T], ranges: &mut Vec<CycleRange>) {
    let mut i = 0;
    while i < ranges.len() {
        let cur = ranges[i];
        let Some(r) = ranges
            .iter()
            .position(|p| cur.0 < p.0 && cur.1 < p.1 && cur.1 > p.0)
        else {
            i += 1;
            continue;
        };
        let other = ranges[r];

        if cur.1 - cur.0 > other.1 - other.0 {
            let rescanned = scan(seq, cur.1, other.1);
            ranges.remove(r);
            if rescanned.is_empty() {
                if r < i {
                    i -= 1;
                }
            } else {
                ranges.extend(rescanned);
                i = 0;
            }
        } else {
            let rescanned = scan(seq, cur.0, other.0);
            ranges.remove(i);
            if !rescanned.is_empty() {
                ranges.extend(rescanned);
                i = 0;
            }
        }
    }
}

/// Replace every repeated range (after the first block) with one synthetic
/// block hashing the range.
pub fn compress_blocks(blocks: &[Block]) -> Vec<Block> {
    let Some((head, tail)) = blocks.split_first() else {
        return Vec::new();
    };

    let mut out = Vec::with_capacity(blocks.len());
    out.push(*head);

    let mut cursor = 0;
    for (start, end) in find_cycles(tail) {
        out.extend_from_slice(&tail[cursor..start]);
        let mut hasher = DefaultHasher::new();
        tail[start..end].hash(&mut hasher);
        out.push(hasher.finish());
        cursor = end;
    }
    out.extend_from_slice(&tail[cursor..]);
    out
}

/// First cycle found by Brent's algorithm.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Cycle {
    /// Index where the cycle begins.
    pub offset: usize,
    /// Period of the cycle; zero when no cycle exists.
    pub length: usize,
    /// Number of consecutive repetitions of the period.
    pub count: usize,
}

/// Locate the first repetition in `seq` with Brent's algorithm.
pub fn find_cycle_brent<T: Eq>(seq: &[T]) -> Cycle {
    if seq.len() < 2 {
        return Cycle::default();
    }

    let mut power = 1usize;
    let mut lambda = 1usize;
    let mut tortoise = 0usize;
    let mut hare = 1usize;

    while seq[tortoise] != seq[hare] {
        if power == lambda {
            tortoise = hare;
            power *= 2;
            lambda = 0;
        }
        hare += 1;
        lambda += 1;
        if hare >= seq.len() {
            return Cycle::default();
        }
    }

    let mut mu = 0usize;
    let mut tortoise = 0usize;
    let mut hare = lambda;
    while seq[tortoise] != seq[hare] {
        tortoise += 1;
        hare += 1;
        mu += 1;
    }

    let mut matched = 0usize;
    while mu + lambda + matched < seq.len() && seq[mu + lambda + matched] == seq[mu + matched] {
        matched += 1;
    }

    Cycle {
        offset: mu,
        length: lambda,
        count: 1 + matched / lambda,
    }
}

/// Repeatedly apply [`find_cycle_brent`], skipping past each cycle found.
/// Offsets are relative to the end of the previous cycle.
pub fn find_cycles_brent<T: Eq>(seq: &[T]) -> Vec<Cycle> {
    let mut cycles = Vec::new();
    let mut first = 0usize;
    while first < seq.len() {
        let cycle = find_cycle_brent(&seq[first..]);
        if cycle.length == 0 {
            break;
        }
        first += cycle.offset + cycle.length * cycle.count;
        cycles.push(cycle);
    }
    cycles
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn chars(s: &str) -> Vec<char> {
        s.chars().collect()
    }

    #[test]
    fn test_overlapping_cycles_resolve_to_larger_range() {
        let seq = chars("abcabcdebcde");
        assert_eq!(find_cycles(&seq), vec![(4, 12)]);
    }

    #[test]
    fn test_cycle_ending_at_last_element() {
        assert_eq!(find_cycles(&chars("abcabc")), vec![(0, 6)]);
    }

    #[test]
    fn test_simple_repeat_with_tail() {
        assert_eq!(find_cycles(&chars("abcabcd")), vec![(0, 6)]);
    }

    #[test]
    fn test_no_cycles() {
        assert!(find_cycles(&chars("abcdef")).is_empty());
        assert!(find_cycles::<char>(&[]).is_empty());
    }

    #[test]
    fn test_compress_keeps_first_block() {
        let blocks = vec![9, 1, 2, 1, 2, 3];
        let compressed = compress_blocks(&blocks);
        assert_eq!(compressed.len(), 3);
        assert_eq!(compressed[0], 9);
        assert_eq!(compressed[2], 3);
    }

    #[test]
    fn test_compress_is_identity_without_cycles() {
        let blocks = vec![1, 2, 3, 4];
        assert_eq!(compress_blocks(&blocks), blocks);
    }

    #[test]
    fn test_brent_finds_offset_and_period() {
        let cycle = find_cycle_brent(&chars("xyabcabcabc"));
        assert_eq!(cycle.offset, 2);
        assert_eq!(cycle.length, 3);
        assert_eq!(cycle.count, 3);
    }

    #[test]
    fn test_brent_without_cycle() {
        assert_eq!(find_cycle_brent(&chars("abcd")), Cycle::default());
        assert_eq!(find_cycle_brent::<char>(&[]), Cycle::default());
    }

    #[test]
    fn test_brent_repeated_scan() {
        let cycles = find_cycles_brent(&chars("ababxcdcd"));
        assert_eq!(cycles.len(), 2);
        assert_eq!((cycles[0].offset, cycles[0].length, cycles[0].count), (0, 2, 2));
        assert_eq!((cycles[1].offset, cycles[1].length, cycles[1].count), (1, 2, 2));
    }

    proptest! {
        #[test]
        fn prop_ranges_are_in_bounds_and_disjoint(seq in proptest::collection::vec(0u8..4, 0..40)) {
            let ranges = find_cycles(&seq);
            for (start, end) in &ranges {
                prop_assert!(start < end);
                prop_assert!(*end <= seq.len());
            }
            for pair in ranges.windows(2) {
                prop_assert!(pair[0].1 <= pair[1].0, "overlap: {:?}", pair);
            }
        }

        #[test]
        fn prop_compress_never_grows(seq in proptest::collection::vec(0u64..5, 1..40)) {
            prop_assert!(compress_blocks(&seq).len() <= seq.len());
        }
    }
}
