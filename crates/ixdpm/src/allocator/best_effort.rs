//! Topology-aware selection for unreplicated devices.
//!
//! Returns the selection of the requested size, containing every required
//! device, that maximizes the sum of pairwise link ordinals
//! (SameBoard > SingleSwitch > MultiSwitch > HostBridge > SameCPU >
//! CrossCPU). Candidate combinations are walked in lexicographic UUID
//! order and only a strictly better score replaces the incumbent, so ties
//! resolve deterministically.
//!
//! Node GPU counts are small, so the walk is exhaustive.

use std::collections::HashSet;

use tracing::warn;

use super::{AllocateArgs, LinkMap};

pub fn allocate(links: &LinkMap, args: &AllocateArgs) -> Vec<String> {
    if args.required.len() > args.size {
        warn!(
            required = args.required.len(),
            size = args.size,
            "more required devices than the allocation size"
        );
        return Vec::new();
    }

    let available: HashSet<&str> = args.available.iter().map(String::as_str).collect();
    for id in &args.required {
        if !available.contains(id.as_str()) {
            warn!(device = %id, "required device is not available");
            return Vec::new();
        }
    }

    let required: HashSet<&str> = args.required.iter().map(String::as_str).collect();
    let mut candidates: Vec<&str> = available
        .iter()
        .copied()
        .filter(|id| !required.contains(id))
        .collect();
    candidates.sort_unstable();

    let needed = args.size - args.required.len();
    if candidates.len() < needed {
        warn!(
            candidates = candidates.len(),
            needed, "not enough devices left to satisfy the allocation"
        );
        return Vec::new();
    }

    // Pool layout: required devices first, then the sorted candidates.
    let req_count = args.required.len();
    let pool: Vec<&str> = args
        .required
        .iter()
        .map(String::as_str)
        .chain(candidates.iter().copied())
        .collect();
    let affinity = affinity_matrix(links, &pool);

    let mut combo: Vec<usize> = (0..needed).collect();
    let mut best_combo = combo.clone();
    let mut best_score = score(&affinity, req_count, &combo);
    while next_combination(&mut combo, candidates.len()) {
        let s = score(&affinity, req_count, &combo);
        if s > best_score {
            best_score = s;
            best_combo = combo.clone();
        }
    }

    let mut result: Vec<String> = args.required.clone();
    result.extend(best_combo.iter().map(|&i| candidates[i].to_string()));
    result
}

/// Symmetric pairwise ordinals over the pool.
fn affinity_matrix(links: &LinkMap, pool: &[&str]) -> Vec<Vec<u64>> {
    let n = pool.len();
    let mut matrix = vec![vec![0u64; n]; n];
    for i in 0..n {
        for j in 0..n {
            if i == j {
                continue;
            }
            let forward = ordinal(links, pool[i], pool[j]);
            let backward = ordinal(links, pool[j], pool[i]);
            matrix[i][j] = forward.max(backward) as u64;
        }
    }
    matrix
}

fn ordinal(links: &LinkMap, a: &str, b: &str) -> u32 {
    links
        .get(a)
        .and_then(|peers| peers.get(b))
        .copied()
        .unwrap_or(0)
}

/// Total affinity of the required devices plus the chosen candidates.
fn score(affinity: &[Vec<u64>], req_count: usize, combo: &[usize]) -> u64 {
    let selected: Vec<usize> = (0..req_count)
        .chain(combo.iter().map(|&i| i + req_count))
        .collect();
    let mut total = 0;
    for (pos, &i) in selected.iter().enumerate() {
        for &j in &selected[pos + 1..] {
            total += affinity[i][j];
        }
    }
    total
}

/// Advances `combo` to the next k-combination of `0..m` in lexicographic
/// order. Returns false once exhausted.
fn next_combination(combo: &mut [usize], m: usize) -> bool {
    let k = combo.len();
    let mut i = k;
    while i > 0 {
        i -= 1;
        if combo[i] < m - k + i {
            combo[i] += 1;
            for j in i + 1..k {
                combo[j] = combo[j - 1] + 1;
            }
            return true;
        }
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::allocator::P2PLinkType;
    use std::collections::HashMap;

    fn link_map(pairs: &[(&str, &str, P2PLinkType)]) -> LinkMap {
        let mut map: LinkMap = HashMap::new();
        for (a, b, t) in pairs {
            map.entry(a.to_string())
                .or_default()
                .insert(b.to_string(), t.ordinal());
            map.entry(b.to_string())
                .or_default()
                .insert(a.to_string(), t.ordinal());
        }
        map
    }

    fn args(available: &[&str], required: &[&str], size: usize) -> AllocateArgs {
        AllocateArgs {
            available: available.iter().map(|s| s.to_string()).collect(),
            required: required.iter().map(|s| s.to_string()).collect(),
            size,
        }
    }

    #[test]
    fn prefers_the_tightest_pair() {
        let links = link_map(&[
            ("A", "B", P2PLinkType::SameBoard),
            ("C", "D", P2PLinkType::CrossCpu),
            ("A", "C", P2PLinkType::CrossCpu),
        ]);
        let result = allocate(&links, &args(&["A", "B", "C", "D"], &[], 2));
        assert_eq!(result, vec!["A".to_string(), "B".to_string()]);
    }

    #[test]
    fn required_devices_anchor_the_selection() {
        let links = link_map(&[
            ("A", "B", P2PLinkType::SameBoard),
            ("C", "D", P2PLinkType::SingleSwitch),
        ]);
        let result = allocate(&links, &args(&["A", "B", "C", "D"], &["C"], 2));
        assert!(result.contains(&"C".to_string()));
        assert!(result.contains(&"D".to_string()));
        assert_eq!(result.len(), 2);
    }

    #[test]
    fn ties_break_lexicographically() {
        let links = LinkMap::new();
        let result = allocate(&links, &args(&["D", "C", "B", "A"], &[], 2));
        assert_eq!(result, vec!["A".to_string(), "B".to_string()]);
    }

    #[test]
    fn no_alternative_dominates() {
        // B-C is the strongest pair not involving the required A; the best
        // 3-selection around A is then decided by total affinity.
        let links = link_map(&[
            ("A", "B", P2PLinkType::SameCpu),
            ("B", "C", P2PLinkType::SameBoard),
            ("A", "D", P2PLinkType::SingleSwitch),
            ("C", "D", P2PLinkType::CrossCpu),
        ]);
        let result = allocate(&links, &args(&["A", "B", "C", "D"], &["A"], 3));
        // A+B+C: (A,B)=2 + (B,C)=6 + (A,C)=0 = 8.
        // A+B+D: 2 + 0 + 5 = 7. A+C+D: 0 + 1 + 5 = 6.
        assert_eq!(
            result,
            vec!["A".to_string(), "B".to_string(), "C".to_string()]
        );
    }

    #[test]
    fn failures_return_empty() {
        let links = LinkMap::new();
        // More required than size.
        assert!(allocate(&links, &args(&["A", "B"], &["A", "B"], 1)).is_empty());
        // Required not available.
        assert!(allocate(&links, &args(&["A"], &["B"], 1)).is_empty());
        // Not enough devices.
        assert!(allocate(&links, &args(&["A"], &[], 2)).is_empty());
    }
}
