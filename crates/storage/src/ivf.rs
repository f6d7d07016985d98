//! Inverted-file partitioning for the payee embedding table.
//!
//! Centroids come from spherical k-means over every stored embedding. Each row keeps the
//! list it was assigned to; a search only scans rows in the `probes` lists whose centroids
//! sit closest to the query. With no centroids every row is in list 0 and search is exact.

/// Cosine similarity. Zero-length vectors are dissimilar to everything.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() {
        return 0.0;
    }
    let (mut dot, mut na, mut nb) = (0.0f32, 0.0f32, 0.0f32);
    for (x, y) in a.iter().zip(b) {
        dot += x * y;
        na += x * x;
        nb += y * y;
    }
    if na == 0.0 || nb == 0.0 {
        return 0.0;
    }
    dot / (na.sqrt() * nb.sqrt())
}

pub fn normalized(v: &[f32]) -> Vec<f32> {
    let norm = v.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm == 0.0 {
        return v.to_vec();
    }
    v.iter().map(|x| x / norm).collect()
}

fn dot(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}

pub fn encode_vector(v: &[f32]) -> Vec<u8> {
    v.iter().flat_map(|x| x.to_le_bytes()).collect()
}

pub fn decode_vector(bytes: &[u8]) -> Option<Vec<f32>> {
    if bytes.len() % 4 != 0 {
        return None;
    }
    Some(
        bytes
            .chunks_exact(4)
            .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect(),
    )
}

/// Trained centroids plus the generation that produced them.
#[derive(Debug, Clone, Default)]
pub struct IvfLists {
    pub generation: i64,
    pub trained_rows: usize,
    centroids: Vec<Vec<f32>>,
}

impl IvfLists {
    pub fn new(generation: i64, trained_rows: usize, centroids: Vec<Vec<f32>>) -> Self {
        Self {
            generation,
            trained_rows,
            centroids: centroids.iter().map(|c| normalized(c)).collect(),
        }
    }

    pub fn is_trained(&self) -> bool {
        !self.centroids.is_empty()
    }

    pub fn centroids(&self) -> &[Vec<f32>] {
        &self.centroids
    }

    /// List a new vector belongs to.
    pub fn assign(&self, v: &[f32]) -> i64 {
        self.nearest(v, 1).first().copied().unwrap_or(0)
    }

    /// The `probes` list numbers nearest to `v`, closest first.
    pub fn nearest(&self, v: &[f32], probes: usize) -> Vec<i64> {
        let q = normalized(v);
        let mut scored: Vec<(usize, f32)> = self
            .centroids
            .iter()
            .enumerate()
            .map(|(i, c)| (i, dot(&q, c)))
            .collect();
        scored.sort_by(|a, b| b.1.total_cmp(&a.1).then(a.0.cmp(&b.0)));
        scored.into_iter().take(probes).map(|(i, _)| i as i64).collect()
    }
}

/// Spherical k-means with evenly strided seeding so training is reproducible.
/// Returns at most `k` centroids (fewer when there are fewer vectors).
pub fn train_centroids(vectors: &[Vec<f32>], k: usize, iterations: usize) -> Vec<Vec<f32>> {
    if vectors.is_empty() || k == 0 {
        return Vec::new();
    }
    let data: Vec<Vec<f32>> = vectors.iter().map(|v| normalized(v)).collect();
    let k = k.min(data.len());
    let stride = data.len() / k;
    let mut centroids: Vec<Vec<f32>> = (0..k).map(|i| data[i * stride].clone()).collect();
    let dims = centroids[0].len();

    for _ in 0..iterations.max(1) {
        let mut sums = vec![vec![0.0f32; dims]; k];
        let mut counts = vec![0usize; k];
        let mut moved = false;

        for v in &data {
            let best = centroids
                .iter()
                .enumerate()
                .map(|(i, c)| (i, dot(v, c)))
                .max_by(|a, b| a.1.total_cmp(&b.1).then(b.0.cmp(&a.0)))
                .map(|(i, _)| i)
                .unwrap_or(0);
            counts[best] += 1;
            for (s, x) in sums[best].iter_mut().zip(v) {
                *s += x;
            }
        }

        for (i, sum) in sums.into_iter().enumerate() {
            // Empty clusters keep their previous centroid.
            if counts[i] == 0 {
                continue;
            }
            let next = normalized(&sum);
            if next != centroids[i] {
                moved = true;
                centroids[i] = next;
            }
        }

        if !moved {
            break;
        }
    }

    centroids
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cosine_basics() {
        assert!((cosine_similarity(&[1.0, 0.0], &[2.0, 0.0]) - 1.0).abs() < 1e-6);
        assert!(cosine_similarity(&[1.0, 0.0], &[0.0, 1.0]).abs() < 1e-6);
        assert_eq!(cosine_similarity(&[0.0, 0.0], &[1.0, 0.0]), 0.0);
        assert_eq!(cosine_similarity(&[1.0], &[1.0, 0.0]), 0.0);
    }

    #[test]
    fn vector_bytes_roundtrip() {
        let v = vec![0.25f32, -1.5, 3.0];
        assert_eq!(decode_vector(&encode_vector(&v)).unwrap(), v);
        assert!(decode_vector(&[1, 2, 3]).is_none());
    }

    #[test]
    fn kmeans_separates_two_clusters() {
        let mut data = Vec::new();
        for i in 0..10 {
            let e = i as f32 * 0.01;
            data.push(vec![1.0, e, 0.0]);
            data.push(vec![0.0, e, 1.0]);
        }
        let centroids = train_centroids(&data, 2, 10);
        assert_eq!(centroids.len(), 2);
        let lists = IvfLists::new(1, data.len(), centroids);
        let a = lists.assign(&[1.0, 0.0, 0.0]);
        let b = lists.assign(&[0.0, 0.0, 1.0]);
        assert_ne!(a, b);
        assert_eq!(lists.assign(&[0.9, 0.05, 0.1]), a);
    }

    #[test]
    fn kmeans_is_deterministic() {
        let data: Vec<Vec<f32>> = (0..30)
            .map(|i| vec![(i % 3) as f32, (i % 5) as f32, 1.0])
            .collect();
        assert_eq!(train_centroids(&data, 4, 10), train_centroids(&data, 4, 10));
    }

    #[test]
    fn untrained_lists_put_everything_in_zero() {
        let lists = IvfLists::default();
        assert!(!lists.is_trained());
        assert_eq!(lists.assign(&[1.0, 2.0]), 0);
        assert!(lists.nearest(&[1.0, 2.0], 10).is_empty());
    }

    #[test]
    fn nearest_orders_by_similarity() {
        let lists = IvfLists::new(
            1,
            3,
            vec![vec![1.0, 0.0], vec![0.0, 1.0], vec![0.7, 0.7]],
        );
        assert_eq!(lists.nearest(&[1.0, 0.1], 2), vec![0, 2]);
    }
}
