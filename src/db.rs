use crate::error::{AppError, AppResult};
use crate::models::feedback::Feedback;
use crate::models::review::{
    rounded_average, AuthorStats, HelpfulToggle, Rating, Review, ReviewRecord, TargetSummary,
    ValidPatch, ValidReview,
};
use crate::models::user::Principal;
use chrono::{DateTime, Duration, SecondsFormat, SubsecRound, Utc};
use rusqlite::types::{ToSql, Type};
use rusqlite::{params, Connection, Error, ErrorCode, OptionalExtension, Row, TransactionBehavior};
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use tokio::sync::{Mutex, MutexGuard};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Window used by `author_stats` to count recent reviews.
pub const RECENT_WINDOW_DAYS: i64 = 30;

const REVIEW_COLUMNS: &str = "r.id, r.author_id, r.target_name, r.rating, r.title, r.comment,
    r.created_at, r.updated_at, r.is_verified, r.helpful_count";

/// Which slice of the ledger a listing reads.
#[derive(Debug, Clone, Copy)]
pub enum ReviewFilter<'a> {
    All,
    Target(&'a str),
    Author(&'a str),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Page {
    pub limit: u32,
    pub offset: u32,
}

impl Page {
    pub fn first(limit: u32) -> Self {
        Page { limit, offset: 0 }
    }
}

// Shared handle to the SQLite connection
#[derive(Debug, Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

impl Database {
    // Open (or create) the database file; ":memory:" gives a private in-memory store
    pub fn new(db_path: &str) -> Result<Self, Error> {
        let conn = Connection::open(db_path)?;
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        info!("Database connection established at: {}", db_path);
        Ok(Database {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub(crate) async fn lock(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().await
    }

    // Create the database schema
    pub async fn create_schema(&self) -> Result<(), Error> {
        let conn = self.conn.lock().await;

        // 1. Accounts and sessions, owned by the identity store
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS users (
                id TEXT PRIMARY KEY,
                username TEXT NOT NULL COLLATE NOCASE UNIQUE,
                email TEXT NOT NULL COLLATE NOCASE UNIQUE,
                first_name TEXT NOT NULL DEFAULT '',
                last_name TEXT NOT NULL DEFAULT '',
                birthday TEXT,
                password_hash TEXT NOT NULL,
                profile_picture TEXT,
                is_admin INTEGER NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS sessions (
                access_token TEXT PRIMARY KEY,
                refresh_token TEXT NOT NULL UNIQUE,
                user_id TEXT NOT NULL,
                access_expires_at TEXT NOT NULL,
                refresh_expires_at TEXT NOT NULL,
                FOREIGN KEY (user_id) REFERENCES users(id) ON DELETE CASCADE
            );",
        )
        .map_err(|e| {
            warn!("Failed creating account tables: {}", e);
            e
        })?;

        // 2. Reviews; one per (author, target) with targets compared case-insensitively
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS reviews (
                id TEXT PRIMARY KEY,
                author_id TEXT NOT NULL,
                target_name TEXT NOT NULL COLLATE NOCASE CHECK (length(target_name) > 0),
                rating INTEGER NOT NULL CHECK (rating BETWEEN 1 AND 5),
                title TEXT NOT NULL DEFAULT '',
                comment TEXT NOT NULL DEFAULT '',
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                is_verified INTEGER NOT NULL DEFAULT 0,
                helpful_count INTEGER NOT NULL DEFAULT 0 CHECK (helpful_count >= 0),
                UNIQUE (author_id, target_name)
            );
            CREATE INDEX IF NOT EXISTS idx_reviews_target ON reviews (target_name, created_at);
            CREATE INDEX IF NOT EXISTS idx_reviews_author ON reviews (author_id, created_at);",
        )
        .map_err(|e| {
            warn!("Failed creating reviews table: {}", e);
            e
        })?;

        // 3. Helpful votes, removed together with their review
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS helpful_votes (
                review_id TEXT NOT NULL,
                voter_id TEXT NOT NULL,
                created_at TEXT NOT NULL,
                PRIMARY KEY (review_id, voter_id),
                FOREIGN KEY (review_id) REFERENCES reviews(id) ON DELETE CASCADE
            );",
        )
        .map_err(|e| {
            warn!("Failed creating helpful_votes table: {}", e);
            e
        })?;

        // 4. Feedback log
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS feedback (
                id TEXT PRIMARY KEY,
                author_id TEXT,
                message TEXT NOT NULL,
                created_at TEXT NOT NULL
            );",
        )
        .map_err(|e| {
            warn!("Failed creating feedback table: {}", e);
            e
        })?;
        Ok(())
    }

    pub async fn create_review(&self, author_id: &str, review: ValidReview) -> AppResult<Review> {
        let now = now();
        let created = Review {
            id: Uuid::new_v4().to_string(),
            author_id: author_id.to_string(),
            target_name: review.target_name,
            rating: review.rating,
            title: review.title,
            comment: review.comment,
            created_at: now,
            updated_at: now,
            is_verified: false,
            helpful_count: 0,
        };

        let conn = self.conn.lock().await;
        // The UNIQUE index is the duplicate check
        let inserted = conn.execute(
            "INSERT INTO reviews
                (id, author_id, target_name, rating, title, comment, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?7)",
            params![
                &created.id,
                &created.author_id,
                &created.target_name,
                i64::from(created.rating),
                &created.title,
                &created.comment,
                timestamp(now),
            ],
        );
        match inserted {
            Ok(_) => {
                info!(
                    "[DB] Review {} created by {} for '{}'",
                    created.id, created.author_id, created.target_name
                );
                Ok(created)
            }
            Err(e) if is_unique_violation(&e) => {
                debug!(
                    "[DB] Duplicate review rejected for {} on '{}'",
                    author_id, created.target_name
                );
                Err(AppError::DuplicateReview)
            }
            Err(e) => Err(e.into()),
        }
    }

    pub async fn get_review(&self, review_id: &str) -> AppResult<Review> {
        Ok(self.get_review_record(review_id).await?.review)
    }

    pub async fn get_review_record(&self, review_id: &str) -> AppResult<ReviewRecord> {
        let conn = self.conn.lock().await;
        conn.query_row(
            &format!(
                "SELECT {REVIEW_COLUMNS}, u.username, u.profile_picture
                 FROM reviews r LEFT JOIN users u ON u.id = r.author_id
                 WHERE r.id = ?1"
            ),
            [review_id],
            record_from_row,
        )
        .optional()?
        .ok_or(AppError::NotFound)
    }

    pub async fn update_review(
        &self,
        review_id: &str,
        actor: &Principal,
        patch: ValidPatch,
    ) -> AppResult<Review> {
        let mut conn = self.conn.lock().await;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let author = author_of(&tx, review_id)?.ok_or(AppError::NotFound)?;
        if author != actor.id {
            return Err(AppError::Forbidden);
        }

        tx.execute(
            "UPDATE reviews SET
                rating = COALESCE(?2, rating),
                title = COALESCE(?3, title),
                comment = COALESCE(?4, comment),
                updated_at = ?5
             WHERE id = ?1",
            params![
                review_id,
                patch.rating.map(i64::from),
                patch.title,
                patch.comment,
                timestamp(now()),
            ],
        )?;
        let review = tx.query_row(
            &format!("SELECT {REVIEW_COLUMNS} FROM reviews r WHERE r.id = ?1"),
            [review_id],
            review_from_row,
        )?;
        tx.commit()?;
        info!("[DB] Review {} updated by {}", review_id, actor.id);
        Ok(review)
    }

    /// Removes a review and every helpful vote pointing at it.
    pub async fn delete_review(&self, review_id: &str, actor: &Principal) -> AppResult<()> {
        let mut conn = self.conn.lock().await;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let author = author_of(&tx, review_id)?.ok_or(AppError::NotFound)?;
        if author != actor.id && !actor.is_admin {
            return Err(AppError::Forbidden);
        }

        let votes = tx.execute("DELETE FROM helpful_votes WHERE review_id = ?1", [review_id])?;
        tx.execute("DELETE FROM reviews WHERE id = ?1", [review_id])?;
        tx.commit()?;
        info!(
            "[DB] Review {} deleted by {} ({} helpful votes removed)",
            review_id, actor.id, votes
        );
        Ok(())
    }

    /// Trusted-process hook (e.g. purchase verification). Not reachable over HTTP.
    pub async fn set_verified(&self, review_id: &str, verified: bool) -> AppResult<Review> {
        let mut conn = self.conn.lock().await;
        let tx = conn.transaction()?;
        let changed = tx.execute(
            "UPDATE reviews SET is_verified = ?2, updated_at = ?3 WHERE id = ?1",
            params![review_id, verified, timestamp(now())],
        )?;
        if changed == 0 {
            return Err(AppError::NotFound);
        }
        let review = tx.query_row(
            &format!("SELECT {REVIEW_COLUMNS} FROM reviews r WHERE r.id = ?1"),
            [review_id],
            review_from_row,
        )?;
        tx.commit()?;
        Ok(review)
    }

    /// Newest first, ties broken by insertion order.
    pub async fn list_reviews(
        &self,
        filter: ReviewFilter<'_>,
        page: Page,
    ) -> AppResult<Vec<ReviewRecord>> {
        let conn = self.conn.lock().await;
        Ok(list_records(&conn, filter, page)?)
    }

    /// Flips the (review, voter) helpful vote and moves the counter with it.
    pub async fn toggle_helpful(
        &self,
        review_id: &str,
        voter_id: &str,
    ) -> AppResult<HelpfulToggle> {
        let mut conn = self.conn.lock().await;
        // IMMEDIATE takes the write lock before the existence check
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        if author_of(&tx, review_id)?.is_none() {
            return Err(AppError::NotFound);
        }

        let now = timestamp(now());
        let removed = tx.execute(
            "DELETE FROM helpful_votes WHERE review_id = ?1 AND voter_id = ?2",
            [review_id, voter_id],
        )?;
        let helpful = if removed == 0 {
            tx.execute(
                "INSERT INTO helpful_votes (review_id, voter_id, created_at) VALUES (?1, ?2, ?3)",
                [review_id, voter_id, now.as_str()],
            )?;
            tx.execute(
                "UPDATE reviews SET helpful_count = helpful_count + 1, updated_at = ?2
                 WHERE id = ?1",
                [review_id, now.as_str()],
            )?;
            true
        } else {
            tx.execute(
                "UPDATE reviews SET helpful_count = MAX(helpful_count - 1, 0), updated_at = ?2
                 WHERE id = ?1",
                [review_id, now.as_str()],
            )?;
            false
        };

        let helpful_count: u32 = tx.query_row(
            "SELECT helpful_count FROM reviews WHERE id = ?1",
            [review_id],
            |row| row.get(0),
        )?;
        tx.commit()?;
        debug!(
            "[DB] Helpful toggle on {} by {}: helpful={} count={}",
            review_id, voter_id, helpful, helpful_count
        );
        Ok(HelpfulToggle {
            helpful,
            helpful_count,
        })
    }

    pub async fn has_voted(&self, review_id: &str, voter_id: &str) -> AppResult<bool> {
        let conn = self.conn.lock().await;
        Ok(has_vote(&conn, review_id, voter_id)?)
    }

    /// The subset of `review_ids` the voter has marked helpful.
    pub async fn voted_among(
        &self,
        voter_id: &str,
        review_ids: &[&str],
    ) -> AppResult<HashSet<String>> {
        let conn = self.conn.lock().await;
        let mut voted = HashSet::new();
        for id in review_ids {
            if has_vote(&conn, id, voter_id)? {
                voted.insert(id.to_string());
            }
        }
        Ok(voted)
    }

    /// Live number of vote rows, independent of the cached counter.
    pub async fn count_helpful_votes(&self, review_id: &str) -> AppResult<u32> {
        let conn = self.conn.lock().await;
        Ok(conn.query_row(
            "SELECT COUNT(*) FROM helpful_votes WHERE review_id = ?1",
            [review_id],
            |row| row.get(0),
        )?)
    }

    /// Recomputes every cached `helpful_count` from the vote rows.
    /// Returns how many reviews had drifted.
    pub async fn reconcile_helpful_counts(&self) -> AppResult<usize> {
        let conn = self.conn.lock().await;
        let fixed = conn.execute(
            "UPDATE reviews SET helpful_count = (
                SELECT COUNT(*) FROM helpful_votes v WHERE v.review_id = reviews.id
             )
             WHERE helpful_count != (
                SELECT COUNT(*) FROM helpful_votes v WHERE v.review_id = reviews.id
             )",
            [],
        )?;
        if fixed > 0 {
            warn!("[DB] Reconciled helpful_count on {} reviews", fixed);
        }
        Ok(fixed)
    }

    pub async fn target_summary(
        &self,
        target_name: &str,
        recent_limit: u32,
    ) -> AppResult<TargetSummary<ReviewRecord>> {
        let mut conn = self.conn.lock().await;
        // One read transaction so the counts and the recent list agree
        let tx = conn.transaction()?;

        let (total_reviews, rating_sum): (u32, i64) = tx.query_row(
            "SELECT COUNT(*), COALESCE(SUM(rating), 0) FROM reviews WHERE target_name = ?1",
            [target_name],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )?;

        let mut rating_breakdown: BTreeMap<String, u32> = Rating::all()
            .map(|rating| (rating.get().to_string(), 0))
            .collect();
        {
            let mut stmt = tx.prepare(
                "SELECT rating, COUNT(*) FROM reviews WHERE target_name = ?1 GROUP BY rating",
            )?;
            let rows = stmt.query_map([target_name], |row| {
                Ok((row.get::<_, i64>(0)?, row.get::<_, u32>(1)?))
            })?;
            for row in rows {
                let (rating, count) = row?;
                rating_breakdown.insert(rating.to_string(), count);
            }
        }

        let recent_reviews =
            list_records(&tx, ReviewFilter::Target(target_name), Page::first(recent_limit))?;
        tx.commit()?;

        Ok(TargetSummary {
            target_name: target_name.to_string(),
            average_rating: rounded_average(rating_sum, total_reviews),
            total_reviews,
            rating_breakdown,
            recent_reviews,
        })
    }

    pub async fn author_stats(&self, author_id: &str) -> AppResult<AuthorStats> {
        let since = timestamp(now() - Duration::days(RECENT_WINDOW_DAYS));
        let conn = self.conn.lock().await;
        let stats = conn.query_row(
            "SELECT COUNT(*),
                    COALESCE(SUM(rating), 0),
                    COALESCE(SUM(created_at >= ?2), 0),
                    COALESCE(SUM(is_verified), 0),
                    COALESCE(SUM(helpful_count), 0)
             FROM reviews WHERE author_id = ?1",
            [author_id, since.as_str()],
            |row| {
                let total: u32 = row.get(0)?;
                Ok(AuthorStats {
                    total_reviews: total,
                    average_rating_given: rounded_average(row.get(1)?, total),
                    recent_reviews: row.get(2)?,
                    verified_reviews: row.get(3)?,
                    helpful_votes_received: row.get(4)?,
                })
            },
        )?;
        Ok(stats)
    }

    pub async fn add_feedback(
        &self,
        author_id: Option<&str>,
        message: String,
    ) -> AppResult<Feedback> {
        let conn = self.conn.lock().await;
        let id = Uuid::new_v4().to_string();
        let created_at = now();
        conn.execute(
            "INSERT INTO feedback (id, author_id, message, created_at) VALUES (?1, ?2, ?3, ?4)",
            params![&id, author_id, &message, timestamp(created_at)],
        )?;
        let author_name: Option<String> = match author_id {
            Some(author) => conn
                .query_row("SELECT username FROM users WHERE id = ?1", [author], |row| {
                    row.get(0)
                })
                .optional()?,
            None => None,
        };
        info!("[DB] Feedback {} recorded", id);
        Ok(Feedback {
            id,
            author_id: author_id.map(str::to_string),
            author_name,
            message,
            created_at,
        })
    }

    pub async fn list_feedback(&self, page: Page) -> AppResult<Vec<Feedback>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(
            "SELECT f.id, f.author_id, u.username, f.message, f.created_at
             FROM feedback f LEFT JOIN users u ON u.id = f.author_id
             ORDER BY f.created_at DESC, f.rowid DESC
             LIMIT ?1 OFFSET ?2",
        )?;
        let rows = stmt.query_map([page.limit, page.offset], |row| {
            Ok(Feedback {
                id: row.get(0)?,
                author_id: row.get(1)?,
                author_name: row.get(2)?,
                message: row.get(3)?,
                created_at: parse_timestamp(row, 4)?,
            })
        })?;
        let mut entries = Vec::new();
        for row in rows {
            entries.push(row?);
        }
        Ok(entries)
    }
}

fn list_records(
    conn: &Connection,
    filter: ReviewFilter<'_>,
    page: Page,
) -> Result<Vec<ReviewRecord>, Error> {
    let (clause, key) = match filter {
        ReviewFilter::All => ("", None),
        ReviewFilter::Target(name) => ("WHERE r.target_name = ?3", Some(name)),
        ReviewFilter::Author(id) => ("WHERE r.author_id = ?3", Some(id)),
    };
    let sql = format!(
        "SELECT {REVIEW_COLUMNS}, u.username, u.profile_picture
         FROM reviews r LEFT JOIN users u ON u.id = r.author_id
         {clause}
         ORDER BY r.created_at DESC, r.rowid DESC
         LIMIT ?1 OFFSET ?2"
    );

    let mut args: Vec<&dyn ToSql> = vec![&page.limit, &page.offset];
    if let Some(key) = key.as_ref() {
        args.push(key);
    }

    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map(args.as_slice(), record_from_row)?;
    let mut records = Vec::new();
    for row in rows {
        records.push(row?);
    }
    Ok(records)
}

fn author_of(conn: &Connection, review_id: &str) -> Result<Option<String>, Error> {
    conn.query_row(
        "SELECT author_id FROM reviews WHERE id = ?1",
        [review_id],
        |row| row.get(0),
    )
    .optional()
}

fn has_vote(conn: &Connection, review_id: &str, voter_id: &str) -> Result<bool, Error> {
    Ok(conn
        .query_row(
            "SELECT 1 FROM helpful_votes WHERE review_id = ?1 AND voter_id = ?2",
            [review_id, voter_id],
            |_| Ok(()),
        )
        .optional()?
        .is_some())
}

fn review_from_row(row: &Row<'_>) -> Result<Review, Error> {
    let rating: i64 = row.get(3)?;
    Ok(Review {
        id: row.get(0)?,
        author_id: row.get(1)?,
        target_name: row.get(2)?,
        rating: Rating::try_from(rating).map_err(|_| Error::IntegralValueOutOfRange(3, rating))?,
        title: row.get(4)?,
        comment: row.get(5)?,
        created_at: parse_timestamp(row, 6)?,
        updated_at: parse_timestamp(row, 7)?,
        is_verified: row.get(8)?,
        helpful_count: row.get(9)?,
    })
}

fn record_from_row(row: &Row<'_>) -> Result<ReviewRecord, Error> {
    Ok(ReviewRecord {
        review: review_from_row(row)?,
        author_name: row.get(10)?,
        author_picture: row.get(11)?,
    })
}

/// Current time at the precision the store keeps.
pub(crate) fn now() -> DateTime<Utc> {
    Utc::now().trunc_subsecs(6)
}

/// Fixed-width RFC 3339 in UTC, so text ordering matches time ordering.
pub(crate) fn timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub(crate) fn parse_timestamp(row: &Row<'_>, idx: usize) -> Result<DateTime<Utc>, Error> {
    let raw: String = row.get(idx)?;
    DateTime::parse_from_rfc3339(&raw)
        .map(|at| at.with_timezone(&Utc))
        .map_err(|e| Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

pub(crate) fn is_unique_violation(err: &Error) -> bool {
    matches!(
        err,
        Error::SqliteFailure(e, _)
            if e.code == ErrorCode::ConstraintViolation
                && e.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_UNIQUE
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::review::{NewReview, ReviewPatch};

    // Helper function to create test database
    async fn create_test_db() -> Database {
        let db = Database::new(":memory:").unwrap();
        db.create_schema().await.unwrap();
        db
    }

    fn principal(id: &str) -> Principal {
        Principal {
            id: id.into(),
            username: id.into(),
            is_admin: false,
        }
    }

    fn valid(target: &str, rating: i64) -> ValidReview {
        NewReview {
            target_name: Some(target.into()),
            rating: Some(rating),
            title: None,
            comment: Some("Worked as advertised".into()),
        }
        .validate()
        .unwrap()
    }

    #[tokio::test]
    async fn test_schema_creation() {
        let db = create_test_db().await;

        let conn = db.conn.lock().await;
        let mut stmt = conn
            .prepare("SELECT name FROM sqlite_master WHERE type='table'")
            .unwrap();
        let tables: Vec<String> = stmt
            .query_map([], |row| row.get(0))
            .unwrap()
            .collect::<Result<_, _>>()
            .unwrap();

        for table in ["users", "sessions", "reviews", "helpful_votes", "feedback"] {
            assert!(tables.contains(&table.to_string()), "missing {table}");
        }
    }

    #[tokio::test]
    async fn test_schema_is_idempotent() {
        let db = create_test_db().await;
        db.create_schema().await.unwrap();
    }

    #[tokio::test]
    async fn test_review_scenario() {
        let db = create_test_db().await;
        let author = principal("author-a");

        let review = db.create_review(&author.id, valid("svc1", 4)).await.unwrap();
        assert_eq!(review.helpful_count, 0);
        assert!(!review.is_verified);
        assert_eq!(review.created_at, review.updated_at);

        let duplicate = db.create_review(&author.id, valid("svc1", 2)).await;
        assert!(matches!(duplicate, Err(AppError::DuplicateReview)));

        let first = db.toggle_helpful(&review.id, "voter-b").await.unwrap();
        assert_eq!(
            first,
            HelpfulToggle {
                helpful: true,
                helpful_count: 1
            }
        );
        let second = db.toggle_helpful(&review.id, "voter-b").await.unwrap();
        assert_eq!(
            second,
            HelpfulToggle {
                helpful: false,
                helpful_count: 0
            }
        );

        db.delete_review(&review.id, &author).await.unwrap();
        let gone = db.toggle_helpful(&review.id, "voter-b").await;
        assert!(matches!(gone, Err(AppError::NotFound)));
    }

    #[tokio::test]
    async fn test_duplicate_target_is_case_insensitive() {
        let db = create_test_db().await;
        db.create_review("a", valid("Acme Cloud", 5)).await.unwrap();
        let clash = db.create_review("a", valid("acme cloud", 3)).await;
        assert!(matches!(clash, Err(AppError::DuplicateReview)));

        // other authors are unaffected
        db.create_review("b", valid("ACME CLOUD", 3)).await.unwrap();
        let listed = db
            .list_reviews(ReviewFilter::Target("acme cloud"), Page::first(20))
            .await
            .unwrap();
        assert_eq!(listed.len(), 2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_duplicate_creates() {
        let db = create_test_db().await;
        let (left, right) = tokio::join!(
            db.create_review("a", valid("svc1", 4)),
            db.create_review("a", valid("svc1", 1)),
        );
        let successes = [left.is_ok(), right.is_ok()].iter().filter(|ok| **ok).count();
        assert_eq!(successes, 1);
        assert!(
            matches!(left, Err(AppError::DuplicateReview))
                || matches!(right, Err(AppError::DuplicateReview))
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_toggles_from_distinct_voters() {
        let db = create_test_db().await;
        let review = db.create_review("a", valid("svc1", 4)).await.unwrap();

        let mut handles = Vec::new();
        for voter in 0..16 {
            let db = db.clone();
            let review_id = review.id.clone();
            handles.push(tokio::spawn(async move {
                db.toggle_helpful(&review_id, &format!("voter-{voter}")).await
            }));
        }
        for handle in handles {
            assert!(handle.await.unwrap().unwrap().helpful);
        }

        let stored = db.get_review(&review.id).await.unwrap();
        assert_eq!(stored.helpful_count, 16);
        assert_eq!(db.count_helpful_votes(&review.id).await.unwrap(), 16);

        // undo half of them
        for voter in 0..8 {
            db.toggle_helpful(&review.id, &format!("voter-{voter}"))
                .await
                .unwrap();
        }
        let stored = db.get_review(&review.id).await.unwrap();
        assert_eq!(stored.helpful_count, 8);
        assert_eq!(db.count_helpful_votes(&review.id).await.unwrap(), 8);
    }

    #[tokio::test]
    async fn test_update_rules() {
        let db = create_test_db().await;
        let author = principal("a");
        let review = db.create_review(&author.id, valid("svc1", 4)).await.unwrap();
        db.toggle_helpful(&review.id, "b").await.unwrap();

        let patch = ReviewPatch {
            rating: Some(2),
            title: Some("Changed my mind".into()),
            comment: None,
        }
        .validate()
        .unwrap();

        let forbidden = db.update_review(&review.id, &principal("b"), patch.clone()).await;
        assert!(matches!(forbidden, Err(AppError::Forbidden)));

        let updated = db.update_review(&review.id, &author, patch).await.unwrap();
        assert_eq!(updated.rating.get(), 2);
        assert_eq!(updated.title, "Changed my mind");
        assert_eq!(updated.comment, review.comment);
        assert_eq!(updated.created_at, review.created_at);
        assert_eq!(updated.author_id, review.author_id);
        assert_eq!(updated.target_name, review.target_name);
        assert_eq!(updated.helpful_count, 1);
        assert!(updated.updated_at >= review.updated_at);

        let missing = db
            .update_review("nope", &author, ValidPatch::default())
            .await;
        assert!(matches!(missing, Err(AppError::NotFound)));
    }

    #[tokio::test]
    async fn test_delete_rules_and_cascade() {
        let db = create_test_db().await;
        let review = db.create_review("a", valid("svc1", 4)).await.unwrap();
        for voter in ["b", "c", "d"] {
            db.toggle_helpful(&review.id, voter).await.unwrap();
        }

        let forbidden = db.delete_review(&review.id, &principal("b")).await;
        assert!(matches!(forbidden, Err(AppError::Forbidden)));
        assert_eq!(db.count_helpful_votes(&review.id).await.unwrap(), 3);

        let admin = Principal {
            is_admin: true,
            ..principal("root")
        };
        db.delete_review(&review.id, &admin).await.unwrap();
        assert_eq!(db.count_helpful_votes(&review.id).await.unwrap(), 0);
        assert!(matches!(
            db.get_review(&review.id).await,
            Err(AppError::NotFound)
        ));
        assert!(matches!(
            db.delete_review(&review.id, &admin).await,
            Err(AppError::NotFound)
        ));
    }

    #[tokio::test]
    async fn test_listing_order_and_paging() {
        let db = create_test_db().await;
        for (author, target) in [("a", "one"), ("a", "two"), ("a", "three"), ("b", "one")] {
            db.create_review(author, valid(target, 3)).await.unwrap();
        }

        let by_a = db
            .list_reviews(ReviewFilter::Author("a"), Page::first(20))
            .await
            .unwrap();
        let targets: Vec<_> = by_a.iter().map(|r| r.review.target_name.as_str()).collect();
        assert_eq!(targets, ["three", "two", "one"]);

        let page = db
            .list_reviews(ReviewFilter::All, Page { limit: 2, offset: 1 })
            .await
            .unwrap();
        let targets: Vec<_> = page.iter().map(|r| r.review.target_name.as_str()).collect();
        assert_eq!(targets, ["three", "two"]);

        // no account row, so no author profile
        assert!(by_a[0].author_name.is_none());
    }

    #[tokio::test]
    async fn test_empty_summary() {
        let db = create_test_db().await;
        let summary = db.target_summary("nothing-here", 20).await.unwrap();
        assert_eq!(summary.average_rating, 0.0);
        assert_eq!(summary.total_reviews, 0);
        assert_eq!(summary.rating_breakdown.len(), 5);
        assert!(summary.rating_breakdown.values().all(|count| *count == 0));
        assert!(summary.recent_reviews.is_empty());
    }

    #[tokio::test]
    async fn test_summary_statistics() {
        let db = create_test_db().await;
        for (author, rating) in [("a", 5), ("b", 4), ("c", 4), ("d", 1)] {
            db.create_review(author, valid("svc1", rating)).await.unwrap();
        }
        db.create_review("a", valid("other", 1)).await.unwrap();

        let summary = db.target_summary("SVC1", 3).await.unwrap();
        assert_eq!(summary.total_reviews, 4);
        assert_eq!(summary.average_rating, 3.5);
        assert_eq!(summary.rating_breakdown["1"], 1);
        assert_eq!(summary.rating_breakdown["2"], 0);
        assert_eq!(summary.rating_breakdown["4"], 2);
        assert_eq!(summary.rating_breakdown["5"], 1);
        assert_eq!(summary.recent_reviews.len(), 3);
        assert_eq!(summary.recent_reviews[0].review.author_id, "d");
    }

    #[tokio::test]
    async fn test_author_stats() {
        let db = create_test_db().await;
        let first = db.create_review("a", valid("one", 5)).await.unwrap();
        db.create_review("a", valid("two", 2)).await.unwrap();
        db.set_verified(&first.id, true).await.unwrap();
        db.toggle_helpful(&first.id, "b").await.unwrap();

        let stats = db.author_stats("a").await.unwrap();
        assert_eq!(
            stats,
            AuthorStats {
                total_reviews: 2,
                average_rating_given: 3.5,
                recent_reviews: 2,
                verified_reviews: 1,
                helpful_votes_received: 1,
            }
        );

        let empty = db.author_stats("nobody").await.unwrap();
        assert_eq!(empty.total_reviews, 0);
        assert_eq!(empty.average_rating_given, 0.0);
    }

    #[tokio::test]
    async fn test_reconcile_heals_drift() {
        let db = create_test_db().await;
        let review = db.create_review("a", valid("svc1", 4)).await.unwrap();
        db.toggle_helpful(&review.id, "b").await.unwrap();
        db.toggle_helpful(&review.id, "c").await.unwrap();

        {
            let conn = db.conn.lock().await;
            conn.execute(
                "UPDATE reviews SET helpful_count = 7 WHERE id = ?1",
                [&review.id],
            )
            .unwrap();
        }

        assert_eq!(db.reconcile_helpful_counts().await.unwrap(), 1);
        assert_eq!(db.get_review(&review.id).await.unwrap().helpful_count, 2);
        assert_eq!(db.reconcile_helpful_counts().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_counter_never_negative() {
        let db = create_test_db().await;
        let review = db.create_review("a", valid("svc1", 4)).await.unwrap();
        db.toggle_helpful(&review.id, "b").await.unwrap();
        {
            let conn = db.conn.lock().await;
            conn.execute("UPDATE reviews SET helpful_count = 0 WHERE id = ?1", [&review.id])
                .unwrap();
        }
        let toggled = db.toggle_helpful(&review.id, "b").await.unwrap();
        assert!(!toggled.helpful);
        assert_eq!(toggled.helpful_count, 0);
    }

    #[tokio::test]
    async fn test_voted_among() {
        let db = create_test_db().await;
        let one = db.create_review("a", valid("one", 4)).await.unwrap();
        let two = db.create_review("a", valid("two", 4)).await.unwrap();
        db.toggle_helpful(&two.id, "b").await.unwrap();

        assert!(db.has_voted(&two.id, "b").await.unwrap());
        assert!(!db.has_voted(&one.id, "b").await.unwrap());
        let voted = db
            .voted_among("b", &[one.id.as_str(), two.id.as_str()])
            .await
            .unwrap();
        assert_eq!(voted.len(), 1);
        assert!(voted.contains(&two.id));
    }

    #[tokio::test]
    async fn test_feedback_log() {
        let db = create_test_db().await;
        db.add_feedback(None, "first".into()).await.unwrap();
        let second = db.add_feedback(Some("u1"), "second".into()).await.unwrap();
        assert_eq!(second.author_id.as_deref(), Some("u1"));

        let entries = db.list_feedback(Page::first(10)).await.unwrap();
        let messages: Vec<_> = entries.iter().map(|f| f.message.as_str()).collect();
        assert_eq!(messages, ["second", "first"]);
        assert!(entries[1].author_id.is_none());
    }
}
