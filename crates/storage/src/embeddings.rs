use std::sync::Arc;

use chrono::{DateTime, Utc};
use rasid_core::{normalize_payee, CategoryId, IndexConfig, UserId};
use serde::Serialize;
use sqlx::SqliteConnection;
use tokio::sync::{Mutex, RwLock};

use crate::db::{get_setting, set_setting, DbPool};
use crate::error::StoreError;
use crate::ivf::{cosine_similarity, decode_vector, encode_vector, train_centroids, IvfLists};

const GENERATION_KEY: &str = "ivf.generation";
const TRAINED_ROWS_KEY: &str = "ivf.trained_rows";

/// One row of the payee index.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PayeeRecord {
    pub id: i64,
    pub user_id: UserId,
    pub payee_name: String,
    pub category_id: Option<CategoryId>,
    pub usage_count: i64,
    pub last_used_at: DateTime<Utc>,
    pub has_embedding: bool,
    pub list_no: i64,
}

/// A search hit: `similarity` is `1 - cosine_distance`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PayeeMatch {
    pub id: i64,
    pub payee_name: String,
    pub category_id: Option<CategoryId>,
    pub similarity: f32,
}

type PayeeRow = (i64, i64, String, Option<i64>, i64, DateTime<Utc>, bool, i64);

const PAYEE_COLUMNS: &str =
    "id, user_id, payee_name, category_id, usage_count, last_used_at, embedding IS NOT NULL, list_no";

fn payee_from_row(r: PayeeRow) -> PayeeRecord {
    PayeeRecord {
        id: r.0,
        user_id: UserId(r.1),
        payee_name: r.2,
        category_id: r.3.map(CategoryId),
        usage_count: r.4,
        last_used_at: r.5,
        has_embedding: r.6,
        list_no: r.7,
    }
}

/// Per-user payee embeddings with an IVF-partitioned nearest-neighbour search.
///
/// Cheap to clone; clones share the centroid cache.
#[derive(Clone)]
pub struct PayeeIndex {
    pool: DbPool,
    config: IndexConfig,
    lists: Arc<RwLock<IvfLists>>,
    training: Arc<Mutex<()>>,
}

impl PayeeIndex {
    /// Loads any previously trained centroids.
    pub async fn open(pool: DbPool, config: IndexConfig) -> Result<Self, StoreError> {
        let generation = get_setting(&pool, GENERATION_KEY)
            .await?
            .and_then(|v| v.parse().ok())
            .unwrap_or(0);
        let trained_rows = get_setting(&pool, TRAINED_ROWS_KEY)
            .await?
            .and_then(|v| v.parse().ok())
            .unwrap_or(0);

        let rows = sqlx::query_as::<_, (i64, Vec<u8>)>(
            "SELECT list_no, centroid FROM ivf_centroids ORDER BY list_no",
        )
        .fetch_all(&pool)
        .await?;
        let centroids = rows
            .into_iter()
            .map(|(list_no, bytes)| {
                decode_vector(&bytes)
                    .filter(|v| v.len() == config.dimensions)
                    .ok_or_else(|| StoreError::Corrupt(format!("centroid {list_no}")))
            })
            .collect::<Result<Vec<_>, _>>()?;

        if !centroids.is_empty() {
            tracing::info!(lists = centroids.len(), generation, "loaded payee index centroids");
        }

        Ok(Self {
            pool,
            config,
            lists: Arc::new(RwLock::new(IvfLists::new(generation, trained_rows, centroids))),
            training: Arc::new(Mutex::new(())),
        })
    }

    pub fn dimensions(&self) -> usize {
        self.config.dimensions
    }

    pub async fn is_trained(&self) -> bool {
        self.lists.read().await.is_trained()
    }

    fn usable<'a>(&self, embedding: Option<&'a [f32]>) -> Option<&'a [f32]> {
        match embedding {
            Some(v) if v.len() == self.config.dimensions => Some(v),
            Some(v) => {
                tracing::warn!(
                    got = v.len(),
                    expected = self.config.dimensions,
                    "embedding dimension mismatch, treating as absent"
                );
                None
            }
            None => None,
        }
    }

    /// Insert-or-update for (user, normalised payee). A null `category` or `embedding`
    /// keeps whatever the row already holds.
    pub async fn upsert(
        &self,
        user: UserId,
        payee: &str,
        category: Option<CategoryId>,
        embedding: Option<&[f32]>,
    ) -> Result<Option<PayeeRecord>, StoreError> {
        let mut conn = self.pool.acquire().await?;
        self.upsert_with(&mut conn, user, payee, category, embedding).await?;
        drop(conn);

        if let Err(e) = self.maybe_train().await {
            tracing::warn!("payee index training failed: {e}");
        }
        self.get(user, payee).await
    }

    /// The upsert statement alone, on a caller-held connection or transaction.
    pub async fn upsert_with(
        &self,
        conn: &mut SqliteConnection,
        user: UserId,
        payee: &str,
        category: Option<CategoryId>,
        embedding: Option<&[f32]>,
    ) -> Result<(), StoreError> {
        let key = normalize_payee(payee);
        if key.is_empty() {
            return Ok(());
        }
        let embedding = self.usable(embedding);
        let (list_no, generation) = match embedding {
            Some(v) => {
                let lists = self.lists.read().await;
                (lists.assign(v), lists.generation)
            }
            None => (0, 0),
        };

        sqlx::query(
            r#"
            INSERT INTO payee_embeddings
                (user_id, payee_key, payee_name, category_id, embedding, list_no, ivf_generation,
                 usage_count, last_used_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, 1, ?)
            ON CONFLICT(user_id, payee_key) DO UPDATE SET
                usage_count = usage_count + 1,
                last_used_at = excluded.last_used_at,
                payee_name = excluded.payee_name,
                category_id = COALESCE(excluded.category_id, category_id),
                list_no = CASE WHEN excluded.embedding IS NULL THEN list_no ELSE excluded.list_no END,
                ivf_generation = CASE WHEN excluded.embedding IS NULL
                                      THEN ivf_generation ELSE excluded.ivf_generation END,
                embedding = COALESCE(excluded.embedding, embedding)
            "#,
        )
        .bind(user.0)
        .bind(&key)
        .bind(payee.split_whitespace().collect::<Vec<_>>().join(" "))
        .bind(category.map(|c| c.0))
        .bind(embedding.map(encode_vector))
        .bind(list_no)
        .bind(generation)
        .bind(Utc::now())
        .execute(&mut *conn)
        .await?;

        Ok(())
    }

    pub async fn get(&self, user: UserId, payee: &str) -> Result<Option<PayeeRecord>, StoreError> {
        let row = sqlx::query_as::<_, PayeeRow>(&format!(
            "SELECT {PAYEE_COLUMNS} FROM payee_embeddings WHERE user_id = ? AND payee_key = ?"
        ))
        .bind(user.0)
        .bind(normalize_payee(payee))
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(payee_from_row))
    }

    pub async fn count(&self, user: UserId) -> Result<i64, StoreError> {
        let (n,) = sqlx::query_as::<_, (i64,)>(
            "SELECT COUNT(*) FROM payee_embeddings WHERE user_id = ?",
        )
        .bind(user.0)
        .fetch_one(&self.pool)
        .await?;
        Ok(n)
    }

    /// Up to `top_k` rows of `user` with similarity strictly above `threshold`, best first.
    pub async fn search(
        &self,
        user: UserId,
        query: &[f32],
        threshold: f32,
        top_k: usize,
    ) -> Result<Vec<PayeeMatch>, StoreError> {
        let Some(query) = self.usable(Some(query)) else {
            return Ok(Vec::new());
        };

        let (probe_lists, generation) = {
            let lists = self.lists.read().await;
            if lists.is_trained() {
                (Some(lists.nearest(query, self.config.probes)), lists.generation)
            } else {
                (None, lists.generation)
            }
        };

        let base = "SELECT id, payee_name, category_id, embedding FROM payee_embeddings \
                    WHERE user_id = ? AND embedding IS NOT NULL";
        let rows = match probe_lists {
            None => {
                sqlx::query_as::<_, (i64, String, Option<i64>, Vec<u8>)>(base)
                    .bind(user.0)
                    .fetch_all(&self.pool)
                    .await?
            }
            Some(probes) => {
                // Rows written under an older generation have stale list numbers; always scan them.
                let placeholders = vec!["?"; probes.len()].join(", ");
                let sql = format!("{base} AND (ivf_generation <> ? OR list_no IN ({placeholders}))");
                let mut q = sqlx::query_as::<_, (i64, String, Option<i64>, Vec<u8>)>(&sql)
                    .bind(user.0)
                    .bind(generation);
                for list_no in probes {
                    q = q.bind(list_no);
                }
                q.fetch_all(&self.pool).await?
            }
        };

        let mut hits: Vec<PayeeMatch> = rows
            .into_iter()
            .filter_map(|(id, payee_name, category_id, bytes)| {
                let v = decode_vector(&bytes)?;
                let similarity = cosine_similarity(query, &v);
                (similarity > threshold).then(|| PayeeMatch {
                    id,
                    payee_name,
                    category_id: category_id.map(CategoryId),
                    similarity,
                })
            })
            .collect();
        hits.sort_by(|a, b| b.similarity.total_cmp(&a.similarity).then(a.id.cmp(&b.id)));
        hits.truncate(top_k);
        Ok(hits)
    }

    /// Exact key match first, then the most-used row whose key contains the query.
    pub async fn lookup_by_name(
        &self,
        user: UserId,
        payee: &str,
    ) -> Result<Option<PayeeRecord>, StoreError> {
        let key = normalize_payee(payee);
        if key.is_empty() {
            return Ok(None);
        }
        let row = sqlx::query_as::<_, PayeeRow>(&format!(
            "SELECT {PAYEE_COLUMNS} FROM payee_embeddings \
             WHERE user_id = ? AND instr(payee_key, ?) > 0 \
             ORDER BY payee_key = ? DESC, usage_count DESC, last_used_at DESC \
             LIMIT 1"
        ))
        .bind(user.0)
        .bind(&key)
        .bind(&key)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(payee_from_row))
    }

    /// Names with a learned category, most used first, for fuzzy matching.
    pub async fn categorized_names(
        &self,
        user: UserId,
    ) -> Result<Vec<(String, CategoryId)>, StoreError> {
        let rows = sqlx::query_as::<_, (String, i64)>(
            "SELECT payee_name, category_id FROM payee_embeddings \
             WHERE user_id = ? AND category_id IS NOT NULL \
             ORDER BY usage_count DESC, id",
        )
        .bind(user.0)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(|(n, c)| (n, CategoryId(c))).collect())
    }

    /// Trains once enough embedded rows exist, and retrains when the row count has doubled.
    /// Returns whether a training pass ran.
    pub async fn maybe_train(&self) -> Result<bool, StoreError> {
        let Ok(_guard) = self.training.try_lock() else {
            return Ok(false);
        };

        let (embedded,) = sqlx::query_as::<_, (i64,)>(
            "SELECT COUNT(*) FROM payee_embeddings WHERE embedding IS NOT NULL",
        )
        .fetch_one(&self.pool)
        .await?;
        let embedded = embedded as usize;

        let (trained, trained_rows, generation) = {
            let lists = self.lists.read().await;
            (lists.is_trained(), lists.trained_rows, lists.generation)
        };
        let due = if trained {
            embedded >= trained_rows.saturating_mul(2)
        } else {
            embedded >= self.config.lists * self.config.train_rows_per_list
        };
        if !due {
            return Ok(false);
        }

        let rows = sqlx::query_as::<_, (i64, Vec<u8>)>(
            "SELECT id, embedding FROM payee_embeddings WHERE embedding IS NOT NULL ORDER BY id",
        )
        .fetch_all(&self.pool)
        .await?;
        let rows: Vec<(i64, Vec<f32>)> = rows
            .into_iter()
            .filter_map(|(id, bytes)| decode_vector(&bytes).map(|v| (id, v)))
            .filter(|(_, v)| v.len() == self.config.dimensions)
            .collect();

        let vectors: Vec<Vec<f32>> = rows.iter().map(|(_, v)| v.clone()).collect();
        let centroids = train_centroids(&vectors, self.config.lists, self.config.kmeans_iterations);
        let next = IvfLists::new(generation + 1, rows.len(), centroids);

        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM ivf_centroids").execute(&mut *tx).await?;
        for (list_no, c) in next.centroids().iter().enumerate() {
            sqlx::query("INSERT INTO ivf_centroids (list_no, centroid) VALUES (?, ?)")
                .bind(list_no as i64)
                .bind(encode_vector(c))
                .execute(&mut *tx)
                .await?;
        }
        for (id, v) in &rows {
            sqlx::query("UPDATE payee_embeddings SET list_no = ?, ivf_generation = ? WHERE id = ?")
                .bind(next.assign(v))
                .bind(next.generation)
                .bind(id)
                .execute(&mut *tx)
                .await?;
        }
        set_setting(&mut *tx, GENERATION_KEY, &next.generation.to_string()).await?;
        set_setting(&mut *tx, TRAINED_ROWS_KEY, &next.trained_rows.to_string()).await?;
        tx.commit().await?;

        tracing::info!(
            rows = next.trained_rows,
            lists = next.centroids().len(),
            generation = next.generation,
            "trained payee index"
        );
        *self.lists.write().await = next;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_support::fixture;
    use crate::db::{create_category, delete_category, ensure_user};
    use rasid_core::Money;

    fn small_index() -> IndexConfig {
        IndexConfig {
            dimensions: 3,
            lists: 2,
            probes: 1,
            train_rows_per_list: 3,
            kmeans_iterations: 10,
        }
    }

    #[tokio::test]
    async fn upsert_twice_keeps_one_row() {
        let f = fixture().await;
        let index = PayeeIndex::open(f.pool.clone(), small_index()).await.unwrap();
        index.upsert(f.user, "Jarir Bookstore", None, Some(&[1.0, 0.0, 0.0])).await.unwrap();
        let row = index
            .upsert(f.user, "  JARIR   bookstore ", None, None)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(row.usage_count, 2);
        assert!(row.has_embedding);
        assert_eq!(index.count(f.user).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn null_category_keeps_previous_and_new_category_wins() {
        let f = fixture().await;
        let index = PayeeIndex::open(f.pool.clone(), small_index()).await.unwrap();
        let food = create_category(&f.pool, f.user, "Food", Money::zero()).await.unwrap();

        index.upsert(f.user, "Panda", Some(f.shopping.id), None).await.unwrap();
        let row = index.upsert(f.user, "Panda", None, None).await.unwrap().unwrap();
        assert_eq!(row.category_id, Some(f.shopping.id));

        let row = index.upsert(f.user, "Panda", Some(food.id), None).await.unwrap().unwrap();
        assert_eq!(row.category_id, Some(food.id));
    }

    #[tokio::test]
    async fn search_ranks_and_thresholds() {
        let f = fixture().await;
        let index = PayeeIndex::open(f.pool.clone(), small_index()).await.unwrap();
        index
            .upsert(f.user, "Jarir Bookstore", Some(f.shopping.id), Some(&[1.0, 0.0, 0.0]))
            .await
            .unwrap();
        index.upsert(f.user, "Jarir Books", None, Some(&[0.9, 0.1, 0.0])).await.unwrap();
        index.upsert(f.user, "Panda", None, Some(&[0.0, 0.0, 1.0])).await.unwrap();

        let hits = index.search(f.user, &[1.0, 0.0, 0.0], 0.7, 5).await.unwrap();
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].payee_name, "Jarir Bookstore");
        assert_eq!(hits[0].category_id, Some(f.shopping.id));
        assert!(hits[0].similarity > hits[1].similarity);

        let top = index.search(f.user, &[1.0, 0.0, 0.0], 0.7, 1).await.unwrap();
        assert_eq!(top.len(), 1);

        assert!(index.search(f.user, &[0.0, 1.0, 0.0], 0.7, 5).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn search_is_scoped_to_user() {
        let f = fixture().await;
        let other = UserId(2);
        ensure_user(&f.pool, other).await.unwrap();
        let index = PayeeIndex::open(f.pool.clone(), small_index()).await.unwrap();
        index.upsert(other, "Jarir Bookstore", None, Some(&[1.0, 0.0, 0.0])).await.unwrap();
        assert!(index.search(f.user, &[1.0, 0.0, 0.0], 0.1, 5).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn wrong_dimensions_are_ignored() {
        let f = fixture().await;
        let index = PayeeIndex::open(f.pool.clone(), small_index()).await.unwrap();
        let row = index.upsert(f.user, "Panda", None, Some(&[1.0, 0.0])).await.unwrap().unwrap();
        assert!(!row.has_embedding);
        assert!(index.search(f.user, &[1.0, 0.0], 0.0, 5).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn lookup_by_name_matches_substring() {
        let f = fixture().await;
        let index = PayeeIndex::open(f.pool.clone(), small_index()).await.unwrap();
        index.upsert(f.user, "Jarir Bookstore Riyadh", Some(f.shopping.id), None).await.unwrap();
        let row = index.lookup_by_name(f.user, "jarir bookstore").await.unwrap().unwrap();
        assert_eq!(row.category_id, Some(f.shopping.id));
        assert!(index.lookup_by_name(f.user, "panda").await.unwrap().is_none());
        assert!(index.lookup_by_name(f.user, "   ").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn deleted_category_is_cleared_from_rows() {
        let f = fixture().await;
        let index = PayeeIndex::open(f.pool.clone(), small_index()).await.unwrap();
        index.upsert(f.user, "Panda", Some(f.shopping.id), None).await.unwrap();
        delete_category(&f.pool, f.user, f.shopping.id).await.unwrap();
        let row = index.get(f.user, "panda").await.unwrap().unwrap();
        assert_eq!(row.category_id, None);
        assert!(index.categorized_names(f.user).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn trains_after_threshold_and_still_finds_rows() {
        let f = fixture().await;
        let index = PayeeIndex::open(f.pool.clone(), small_index()).await.unwrap();
        let payees = [
            ("a1", [1.0, 0.05, 0.0]),
            ("a2", [1.0, 0.10, 0.0]),
            ("a3", [1.0, 0.15, 0.0]),
            ("b1", [0.0, 0.05, 1.0]),
            ("b2", [0.0, 0.10, 1.0]),
        ];
        for (name, v) in payees {
            index.upsert(f.user, name, None, Some(&v)).await.unwrap();
        }
        assert!(!index.is_trained().await);

        index.upsert(f.user, "b3", None, Some(&[0.0, 0.15, 1.0])).await.unwrap();
        assert!(index.is_trained().await);

        let hits = index.search(f.user, &[0.0, 0.1, 1.0], 0.9, 10).await.unwrap();
        let names: Vec<_> = hits.iter().map(|h| h.payee_name.as_str()).collect();
        assert_eq!(names.len(), 3);
        assert!(names.iter().all(|n| n.starts_with('b')));

        // Reopening picks the persisted centroids back up.
        let reopened = PayeeIndex::open(f.pool.clone(), small_index()).await.unwrap();
        assert!(reopened.is_trained().await);
        let hits = reopened.search(f.user, &[1.0, 0.1, 0.0], 0.9, 10).await.unwrap();
        assert_eq!(hits.len(), 3);
    }
}
