//! Shannon entropy over address multisets

use std::collections::BTreeMap;

/// Shannon entropy in bits of the empirical distribution of `tokens`.
///
/// Duplicates count towards frequency, so `["a", "a", "b"]` and `["a", "b"]`
/// differ. An empty slice has entropy 0.0. Terms are summed in token order,
/// so equal multisets give bit-identical results.
pub fn shannon_entropy<T: Ord>(tokens: &[T]) -> f64 {
    if tokens.is_empty() {
        return 0.0;
    }

    let mut counts: BTreeMap<&T, u32> = BTreeMap::new();
    for token in tokens {
        *counts.entry(token).or_insert(0) += 1;
    }

    let total = tokens.len() as f64;
    let entropy = -counts
        .values()
        .map(|&count| {
            let p = f64::from(count) / total;
            p * p.log2()
        })
        .sum::<f64>();

    // single distinct token yields -0.0
    entropy.max(0.0)
}
