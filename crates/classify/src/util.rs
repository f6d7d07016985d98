use rasid_core::normalize_payee;

/// Levenshtein edit distance over Unicode scalar values, two-row O(min(m,n)) space.
pub fn levenshtein_distance(s1: &str, s2: &str) -> usize {
    let a: Vec<char> = s1.chars().collect();
    let b: Vec<char> = s2.chars().collect();
    let (m, n) = (a.len(), b.len());

    if m == 0 {
        return n;
    }
    if n == 0 {
        return m;
    }

    // Keep the shorter string in the inner loop to minimise allocation.
    let (a, b, m, n) = if m <= n { (a, b, m, n) } else { (b, a, n, m) };

    let mut prev: Vec<usize> = (0..=n).collect();
    let mut curr = vec![0usize; n + 1];

    for i in 1..=m {
        curr[0] = i;
        for j in 1..=n {
            let cost = usize::from(a[i - 1] != b[j - 1]);
            curr[j] = (prev[j] + 1).min(curr[j - 1] + 1).min(prev[j - 1] + cost);
        }
        std::mem::swap(&mut prev, &mut curr);
    }

    prev[n]
}

/// Levenshtein similarity of two payee names after normalisation, in `[0.0, 1.0]`.
pub fn name_similarity(s1: &str, s2: &str) -> f32 {
    let a = normalize_payee(s1);
    let b = normalize_payee(s2);

    if a == b {
        return 1.0;
    }

    let max_len = a.chars().count().max(b.chars().count());
    if max_len == 0 {
        return 1.0;
    }

    1.0 - (levenshtein_distance(&a, &b) as f32 / max_len as f32)
}

/// Best-scoring name at or above `threshold`. Ties keep the earlier entry.
pub fn best_fuzzy_match<'a, T>(
    query: &str,
    candidates: &'a [(String, T)],
    threshold: f32,
) -> Option<(&'a (String, T), f32)> {
    candidates
        .iter()
        .map(|c| (c, name_similarity(query, &c.0)))
        .filter(|(_, score)| *score >= threshold)
        .fold(None, |best: Option<(&(String, T), f32)>, cur| match best {
            Some(b) if b.1 >= cur.1 => Some(b),
            _ => Some(cur),
        })
}
