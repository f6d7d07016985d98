use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rasid_core::{
    Account, AccountId, AccountKind, Category, CategoryId, Money, SourcePattern, TransactionType,
    UserId,
};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use sqlx::{Pool, Sqlite};

use crate::error::StoreError;

pub type DbPool = Pool<Sqlite>;

/// Saudi institutions recognised out of the box. Order is match priority.
pub const DEFAULT_SOURCE_PATTERNS: &[(&str, &str)] = &[
    ("Al Rajhi Bank", r"al\s*rajhi|الراجحي"),
    ("SNB AlAhli", r"\bsnb\b|al\s*ahli|الأهلي"),
    ("Riyad Bank", r"riyad\s*bank|بنك\s*الرياض"),
    ("Bank Albilad", r"al\s*bilad|بنك\s*البلاد"),
    ("SAB", r"\bsab\b|saudi\s+awwal|ساب"),
    ("Alinma", r"al\s*inma|الإنماء|الانماء"),
    ("Arab National Bank", r"arab\s+national|\banb\b|العربي\s*الوطني"),
];

pub async fn create_db(path: &Path, max_connections: u32) -> Result<DbPool, sqlx::Error> {
    // Pragmas go on the connect options so every pooled connection carries them.
    let options = SqliteConnectOptions::new()
        .filename(path)
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .synchronous(SqliteSynchronous::Normal)
        .foreign_keys(true)
        .busy_timeout(Duration::from_secs(5))
        .pragma("cache_size", "-32000");

    let pool = SqlitePoolOptions::new()
        .max_connections(max_connections)
        .connect_with(options)
        .await?;

    run_migrations(&pool).await?;

    Ok(pool)
}

async fn run_migrations(pool: &DbPool) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS users (
            id INTEGER PRIMARY KEY,
            created_at TEXT NOT NULL DEFAULT (datetime('now'))
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS accounts (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            user_id INTEGER NOT NULL,
            name TEXT NOT NULL,
            kind TEXT NOT NULL,
            balance_cents INTEGER NOT NULL DEFAULT 0,
            is_active INTEGER NOT NULL DEFAULT 1,
            last_used_at TEXT,
            created_at TEXT NOT NULL DEFAULT (datetime('now')),
            FOREIGN KEY (user_id) REFERENCES users(id) ON DELETE CASCADE
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS categories (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            user_id INTEGER NOT NULL,
            name TEXT NOT NULL,
            assigned_cents INTEGER NOT NULL DEFAULT 0,
            activity_cents INTEGER NOT NULL DEFAULT 0,
            is_hidden INTEGER NOT NULL DEFAULT 0,
            created_at TEXT NOT NULL DEFAULT (datetime('now')),
            FOREIGN KEY (user_id) REFERENCES users(id) ON DELETE CASCADE
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS source_patterns (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            institution TEXT NOT NULL,
            pattern TEXT NOT NULL,
            country TEXT NOT NULL,
            is_active INTEGER NOT NULL DEFAULT 1,
            UNIQUE (institution, pattern)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS pending_transactions (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            user_id INTEGER NOT NULL,
            raw_text TEXT NOT NULL,
            source TEXT NOT NULL,
            institution TEXT,
            payee TEXT,
            amount_cents INTEGER,
            date TEXT,
            transaction_type TEXT NOT NULL DEFAULT 'expense',
            suggested_account_id INTEGER,
            suggested_category_id INTEGER,
            confidence INTEGER NOT NULL DEFAULT 0,
            status TEXT NOT NULL DEFAULT 'pending',
            committed_transaction_id INTEGER,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL,
            FOREIGN KEY (user_id) REFERENCES users(id) ON DELETE CASCADE,
            FOREIGN KEY (suggested_account_id) REFERENCES accounts(id) ON DELETE SET NULL,
            FOREIGN KEY (suggested_category_id) REFERENCES categories(id) ON DELETE SET NULL,
            FOREIGN KEY (committed_transaction_id) REFERENCES transactions(id) ON DELETE SET NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS transactions (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            user_id INTEGER NOT NULL,
            account_id INTEGER NOT NULL,
            category_id INTEGER,
            payee_name TEXT NOT NULL,
            amount_cents INTEGER NOT NULL,
            transaction_type TEXT NOT NULL,
            date TEXT NOT NULL,
            memo TEXT,
            is_cleared INTEGER NOT NULL DEFAULT 0,
            raw_text TEXT,
            candidate_id INTEGER,
            transfer_peer_id INTEGER,
            created_at TEXT NOT NULL,
            FOREIGN KEY (user_id) REFERENCES users(id) ON DELETE CASCADE,
            FOREIGN KEY (account_id) REFERENCES accounts(id) ON DELETE CASCADE,
            FOREIGN KEY (category_id) REFERENCES categories(id) ON DELETE SET NULL,
            FOREIGN KEY (candidate_id) REFERENCES pending_transactions(id) ON DELETE SET NULL,
            FOREIGN KEY (transfer_peer_id) REFERENCES transactions(id) ON DELETE SET NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS payee_embeddings (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            user_id INTEGER NOT NULL,
            payee_key TEXT NOT NULL,
            payee_name TEXT NOT NULL,
            category_id INTEGER,
            embedding BLOB,
            list_no INTEGER NOT NULL DEFAULT 0,
            ivf_generation INTEGER NOT NULL DEFAULT 0,
            usage_count INTEGER NOT NULL DEFAULT 1,
            last_used_at TEXT NOT NULL,
            created_at TEXT NOT NULL DEFAULT (datetime('now')),
            UNIQUE (user_id, payee_key),
            FOREIGN KEY (user_id) REFERENCES users(id) ON DELETE CASCADE,
            FOREIGN KEY (category_id) REFERENCES categories(id) ON DELETE SET NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS ivf_centroids (
            list_no INTEGER PRIMARY KEY,
            centroid BLOB NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS settings (
            key TEXT PRIMARY KEY,
            value TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    for ddl in [
        "CREATE INDEX IF NOT EXISTS idx_pending_user_status ON pending_transactions(user_id, status, created_at)",
        "CREATE INDEX IF NOT EXISTS idx_transactions_account ON transactions(account_id, transaction_type)",
        "CREATE INDEX IF NOT EXISTS idx_payee_user_list ON payee_embeddings(user_id, list_no)",
    ] {
        sqlx::query(ddl).execute(pool).await?;
    }

    Ok(())
}

pub async fn seed_source_patterns(pool: &DbPool) -> Result<(), StoreError> {
    for (institution, pattern) in DEFAULT_SOURCE_PATTERNS {
        sqlx::query(
            "INSERT OR IGNORE INTO source_patterns (institution, pattern, country) VALUES (?, ?, 'SA')",
        )
        .bind(institution)
        .bind(pattern)
        .execute(pool)
        .await?;
    }

    Ok(())
}

pub async fn insert_source_pattern(
    pool: &DbPool,
    institution: &str,
    pattern: &str,
    country: &str,
) -> Result<i64, StoreError> {
    let (id,) = sqlx::query_as::<_, (i64,)>(
        "INSERT INTO source_patterns (institution, pattern, country) VALUES (?, ?, ?) RETURNING id",
    )
    .bind(institution)
    .bind(pattern)
    .bind(country)
    .fetch_one(pool)
    .await?;
    Ok(id)
}

pub async fn list_source_patterns(pool: &DbPool) -> Result<Vec<SourcePattern>, StoreError> {
    let rows = sqlx::query_as::<_, (i64, String, String, String, bool)>(
        "SELECT id, institution, pattern, country, is_active FROM source_patterns ORDER BY id",
    )
    .fetch_all(pool)
    .await?;

    Ok(rows
        .into_iter()
        .map(|r| SourcePattern {
            id: r.0,
            institution: r.1,
            pattern: r.2,
            country: r.3,
            is_active: r.4,
        })
        .collect())
}

// ── Users ────────────────────────────────────────────────────────────────────

/// Identities come from the token issuer; the row only anchors cascading deletes.
pub async fn ensure_user(pool: &DbPool, user: UserId) -> Result<(), StoreError> {
    sqlx::query("INSERT OR IGNORE INTO users (id) VALUES (?)")
        .bind(user.0)
        .execute(pool)
        .await?;
    Ok(())
}

pub async fn delete_user(pool: &DbPool, user: UserId) -> Result<bool, StoreError> {
    let result = sqlx::query("DELETE FROM users WHERE id = ?")
        .bind(user.0)
        .execute(pool)
        .await?;
    Ok(result.rows_affected() > 0)
}

// ── Accounts ─────────────────────────────────────────────────────────────────

type AccountRow = (i64, i64, String, String, i64, bool, Option<DateTime<Utc>>);

const ACCOUNT_COLUMNS: &str = "id, user_id, name, kind, balance_cents, is_active, last_used_at";

fn account_from_row(r: AccountRow) -> Result<Account, StoreError> {
    Ok(Account {
        id: AccountId(r.0),
        user_id: UserId(r.1),
        name: r.2,
        kind: AccountKind::from_str(&r.3).map_err(StoreError::Corrupt)?,
        balance: Money::from_cents(r.4),
        is_active: r.5,
        last_used_at: r.6,
    })
}

pub async fn create_account(
    pool: &DbPool,
    user: UserId,
    name: &str,
    kind: AccountKind,
    opening_balance: Money,
) -> Result<Account, StoreError> {
    let row = sqlx::query_as::<_, AccountRow>(&format!(
        "INSERT INTO accounts (user_id, name, kind, balance_cents) VALUES (?, ?, ?, ?) RETURNING {ACCOUNT_COLUMNS}"
    ))
    .bind(user.0)
    .bind(name)
    .bind(kind.to_string())
    .bind(opening_balance.try_to_cents()?)
    .fetch_one(pool)
    .await?;
    account_from_row(row)
}

pub async fn get_account(
    pool: &DbPool,
    user: UserId,
    id: AccountId,
) -> Result<Option<Account>, StoreError> {
    let row = sqlx::query_as::<_, AccountRow>(&format!(
        "SELECT {ACCOUNT_COLUMNS} FROM accounts WHERE id = ? AND user_id = ?"
    ))
    .bind(id.0)
    .bind(user.0)
    .fetch_optional(pool)
    .await?;
    row.map(account_from_row).transpose()
}

pub async fn list_accounts(pool: &DbPool, user: UserId) -> Result<Vec<Account>, StoreError> {
    let rows = sqlx::query_as::<_, AccountRow>(&format!(
        "SELECT {ACCOUNT_COLUMNS} FROM accounts WHERE user_id = ? ORDER BY id"
    ))
    .bind(user.0)
    .fetch_all(pool)
    .await?;
    rows.into_iter().map(account_from_row).collect()
}

pub async fn set_account_active(
    pool: &DbPool,
    user: UserId,
    id: AccountId,
    active: bool,
) -> Result<bool, StoreError> {
    let result = sqlx::query("UPDATE accounts SET is_active = ? WHERE id = ? AND user_id = ?")
        .bind(active)
        .bind(id.0)
        .bind(user.0)
        .execute(pool)
        .await?;
    Ok(result.rows_affected() > 0)
}

/// Most recently used active account for `kind` of transaction, else the most recently
/// used active account, else the first active account.
pub async fn suggest_account(
    pool: &DbPool,
    user: UserId,
    kind: TransactionType,
) -> Result<Option<AccountId>, StoreError> {
    let row = sqlx::query_as::<_, (i64,)>(
        r#"
        SELECT a.id FROM accounts a
        LEFT JOIN (
            SELECT account_id, MAX(id) AS last_tx
            FROM transactions
            WHERE user_id = ? AND transaction_type = ?
            GROUP BY account_id
        ) t ON t.account_id = a.id
        WHERE a.user_id = ? AND a.is_active = 1
        ORDER BY t.last_tx IS NULL, t.last_tx DESC,
                 a.last_used_at IS NULL, a.last_used_at DESC,
                 a.id
        LIMIT 1
        "#,
    )
    .bind(user.0)
    .bind(kind.to_string())
    .bind(user.0)
    .fetch_optional(pool)
    .await?;
    Ok(row.map(|(id,)| AccountId(id)))
}

// ── Categories ───────────────────────────────────────────────────────────────

type CategoryRow = (i64, i64, String, i64, i64, bool);

const CATEGORY_COLUMNS: &str = "id, user_id, name, assigned_cents, activity_cents, is_hidden";

fn category_from_row(r: CategoryRow) -> Category {
    Category {
        id: CategoryId(r.0),
        user_id: UserId(r.1),
        name: r.2,
        assigned: Money::from_cents(r.3),
        activity: Money::from_cents(r.4),
        is_hidden: r.5,
    }
}

pub async fn create_category(
    pool: &DbPool,
    user: UserId,
    name: &str,
    assigned: Money,
) -> Result<Category, StoreError> {
    let row = sqlx::query_as::<_, CategoryRow>(&format!(
        "INSERT INTO categories (user_id, name, assigned_cents) VALUES (?, ?, ?) RETURNING {CATEGORY_COLUMNS}"
    ))
    .bind(user.0)
    .bind(name)
    .bind(assigned.try_to_cents()?)
    .fetch_one(pool)
    .await?;
    Ok(category_from_row(row))
}

pub async fn get_category(
    pool: &DbPool,
    user: UserId,
    id: CategoryId,
) -> Result<Option<Category>, StoreError> {
    let row = sqlx::query_as::<_, CategoryRow>(&format!(
        "SELECT {CATEGORY_COLUMNS} FROM categories WHERE id = ? AND user_id = ?"
    ))
    .bind(id.0)
    .bind(user.0)
    .fetch_optional(pool)
    .await?;
    Ok(row.map(category_from_row))
}

pub async fn list_categories(pool: &DbPool, user: UserId) -> Result<Vec<Category>, StoreError> {
    let rows = sqlx::query_as::<_, CategoryRow>(&format!(
        "SELECT {CATEGORY_COLUMNS} FROM categories WHERE user_id = ? ORDER BY id"
    ))
    .bind(user.0)
    .fetch_all(pool)
    .await?;
    Ok(rows.into_iter().map(category_from_row).collect())
}

pub async fn set_category_hidden(
    pool: &DbPool,
    user: UserId,
    id: CategoryId,
    hidden: bool,
) -> Result<bool, StoreError> {
    let result = sqlx::query("UPDATE categories SET is_hidden = ? WHERE id = ? AND user_id = ?")
        .bind(hidden)
        .bind(id.0)
        .bind(user.0)
        .execute(pool)
        .await?;
    Ok(result.rows_affected() > 0)
}

pub async fn delete_category(
    pool: &DbPool,
    user: UserId,
    id: CategoryId,
) -> Result<bool, StoreError> {
    let result = sqlx::query("DELETE FROM categories WHERE id = ? AND user_id = ?")
        .bind(id.0)
        .bind(user.0)
        .execute(pool)
        .await?;
    Ok(result.rows_affected() > 0)
}

// ── Settings ─────────────────────────────────────────────────────────────────

pub async fn get_setting(pool: &DbPool, key: &str) -> Result<Option<String>, sqlx::Error> {
    let row = sqlx::query_as::<_, (String,)>("SELECT value FROM settings WHERE key = ?")
        .bind(key)
        .fetch_optional(pool)
        .await?;
    Ok(row.map(|(v,)| v))
}

pub async fn set_setting<'e, E>(executor: E, key: &str, value: &str) -> Result<(), sqlx::Error>
where
    E: sqlx::Executor<'e, Database = Sqlite>,
{
    sqlx::query(
        "INSERT INTO settings (key, value) VALUES (?, ?) ON CONFLICT(key) DO UPDATE SET value = excluded.value",
    )
    .bind(key)
    .bind(value)
    .execute(executor)
    .await?;
    Ok(())
}


#[cfg(test)]
mod tests {
    use super::test_support::fixture;
    use super::*;

    #[tokio::test]
    async fn seeds_saudi_patterns_once() {
        let f = fixture().await;
        seed_source_patterns(&f.pool).await.unwrap();
        let patterns = list_source_patterns(&f.pool).await.unwrap();
        assert_eq!(patterns.len(), DEFAULT_SOURCE_PATTERNS.len());
        assert_eq!(patterns[0].institution, "Al Rajhi Bank");
        assert!(patterns.iter().all(|p| p.country == "SA" && p.is_active));
    }

    #[tokio::test]
    async fn accounts_are_scoped_to_their_user() {
        let f = fixture().await;
        let other = UserId(2);
        ensure_user(&f.pool, other).await.unwrap();
        assert!(get_account(&f.pool, other, f.checking.id).await.unwrap().is_none());
        let mine = get_account(&f.pool, f.user, f.checking.id).await.unwrap().unwrap();
        assert_eq!(mine.balance, Money::from_cents(100_000));
        assert_eq!(mine.kind, AccountKind::Checking);
    }

    #[tokio::test]
    async fn suggest_account_falls_back_to_first_active() {
        let f = fixture().await;
        let second = create_account(&f.pool, f.user, "Cash", AccountKind::Cash, Money::zero())
            .await
            .unwrap();
        let pick = suggest_account(&f.pool, f.user, TransactionType::Expense).await.unwrap();
        assert_eq!(pick, Some(f.checking.id));

        set_account_active(&f.pool, f.user, f.checking.id, false).await.unwrap();
        let pick = suggest_account(&f.pool, f.user, TransactionType::Expense).await.unwrap();
        assert_eq!(pick, Some(second.id));

        set_account_active(&f.pool, f.user, second.id, false).await.unwrap();
        assert_eq!(suggest_account(&f.pool, f.user, TransactionType::Expense).await.unwrap(), None);
    }

    #[tokio::test]
    async fn deleting_user_cascades() {
        let f = fixture().await;
        assert!(delete_user(&f.pool, f.user).await.unwrap());
        assert!(list_accounts(&f.pool, f.user).await.unwrap().is_empty());
        assert!(list_categories(&f.pool, f.user).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn hidden_category_roundtrip() {
        let f = fixture().await;
        set_category_hidden(&f.pool, f.user, f.shopping.id, true).await.unwrap();
        let c = get_category(&f.pool, f.user, f.shopping.id).await.unwrap().unwrap();
        assert!(c.is_hidden);
        assert_eq!(c.available(), Money::from_cents(50_000));
    }

    #[tokio::test]
    async fn settings_upsert() {
        let f = fixture().await;
        set_setting(&f.pool, "k", "1").await.unwrap();
        set_setting(&f.pool, "k", "2").await.unwrap();
        assert_eq!(get_setting(&f.pool, "k").await.unwrap().as_deref(), Some("2"));
        assert_eq!(get_setting(&f.pool, "missing").await.unwrap(), None);
    }
}
