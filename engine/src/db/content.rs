/// Term corpus and accepted content persistence
///
/// Backs the executor's `TermCatalog` with SQLite.
use crate::executor::catalog::{AcceptedContent, Term, TermCatalog};
use anyhow::{Context, Result};
use async_trait::async_trait;
use sdk::types::now_millis;
use sqlx::{Row, SqlitePool};

#[derive(Clone)]
pub struct ContentRepository {
    pool: SqlitePool,
}

impl ContentRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Append a term to the end of the catalog. Re-adding an id renames it.
    pub async fn add_term(&self, term: &Term) -> Result<()> {
        sqlx::query(
            "INSERT INTO terms (id, name, position, created_at)
             VALUES (?, ?, (SELECT COALESCE(MAX(position), -1) + 1 FROM terms), ?)
             ON CONFLICT(id) DO UPDATE SET name = excluded.name",
        )
        .bind(&term.id)
        .bind(&term.name)
        .bind(now_millis())
        .execute(&self.pool)
        .await
        .context("Failed to add term")?;

        Ok(())
    }

    pub async fn get_content(
        &self,
        term_id: &str,
        column_id: &str,
    ) -> Result<Option<AcceptedContent>> {
        let row = sqlx::query(
            "SELECT term_id, column_id, content, quality_score, low_quality, operation_id
             FROM term_content WHERE term_id = ? AND column_id = ?",
        )
        .bind(term_id)
        .bind(column_id)
        .fetch_optional(&self.pool)
        .await
        .context("Failed to fetch term content")?;

        Ok(row.map(|r| AcceptedContent {
            term_id: r.get("term_id"),
            column_id: r.get("column_id"),
            content: r.get("content"),
            quality_score: r.get::<i64, _>("quality_score").clamp(1, 10) as u8,
            low_quality: r.get::<i64, _>("low_quality") != 0,
            operation_id: r.get("operation_id"),
        }))
    }

    /// Accepted content counts per column
    pub async fn content_counts(&self) -> Result<Vec<(String, i64)>> {
        let rows = sqlx::query(
            "SELECT column_id, COUNT(*) AS n FROM term_content GROUP BY column_id ORDER BY column_id",
        )
        .fetch_all(&self.pool)
        .await
        .context("Failed to count term content")?;

        Ok(rows
            .iter()
            .map(|r| (r.get("column_id"), r.get("n")))
            .collect())
    }
}

#[async_trait]
impl TermCatalog for ContentRepository {
    async fn list_terms(&self) -> Result<Vec<Term>> {
        let rows = sqlx::query("SELECT id, name FROM terms ORDER BY position, id")
            .fetch_all(&self.pool)
            .await
            .context("Failed to list terms")?;

        Ok(rows
            .iter()
            .map(|r| Term {
                id: r.get("id"),
                name: r.get("name"),
            })
            .collect())
    }

    async fn has_accepted_content(&self, term_id: &str, column_id: &str) -> Result<bool> {
        let found: Option<i64> =
            sqlx::query_scalar("SELECT 1 FROM term_content WHERE term_id = ? AND column_id = ?")
                .bind(term_id)
                .bind(column_id)
                .fetch_optional(&self.pool)
                .await
                .context("Failed to check term content")?;

        Ok(found.is_some())
    }

    async fn column_has_content(&self, column_id: &str) -> Result<bool> {
        let found: Option<i64> =
            sqlx::query_scalar("SELECT 1 FROM term_content WHERE column_id = ? LIMIT 1")
                .bind(column_id)
                .fetch_optional(&self.pool)
                .await
                .context("Failed to check column content")?;

        Ok(found.is_some())
    }

    async fn save_content(&self, content: &AcceptedContent) -> Result<()> {
        sqlx::query(
            "INSERT INTO term_content (term_id, column_id, content, quality_score, low_quality, operation_id, updated_at)
             VALUES (?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(term_id, column_id) DO UPDATE SET
                content = excluded.content,
                quality_score = excluded.quality_score,
                low_quality = excluded.low_quality,
                operation_id = excluded.operation_id,
                updated_at = excluded.updated_at",
        )
        .bind(&content.term_id)
        .bind(&content.column_id)
        .bind(&content.content)
        .bind(content.quality_score as i64)
        .bind(content.low_quality)
        .bind(&content.operation_id)
        .bind(now_millis())
        .execute(&self.pool)
        .await
        .context("Failed to save term content")?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;
    use tempfile::TempDir;

    async fn setup() -> (TempDir, ContentRepository) {
        let temp_dir = TempDir::new().unwrap();
        let db = Database::new(&temp_dir.path().join("test.db")).await.unwrap();
        (temp_dir, db.content())
    }

    fn accepted(term_id: &str, column_id: &str, score: u8) -> AcceptedContent {
        AcceptedContent {
            term_id: term_id.to_string(),
            column_id: column_id.to_string(),
            content: format!("{column_id} for {term_id}"),
            quality_score: score,
            low_quality: score < 7,
            operation_id: Some("op-1".to_string()),
        }
    }

    #[tokio::test]
    async fn test_terms_keep_insertion_order() {
        let (_dir, repo) = setup().await;
        repo.add_term(&Term::new("zeta", "Zeta")).await.unwrap();
        repo.add_term(&Term::new("alpha", "Alpha")).await.unwrap();
        repo.add_term(&Term::new("zeta", "Zeta function")).await.unwrap();

        let terms = repo.list_terms().await.unwrap();
        assert_eq!(
            terms,
            vec![Term::new("zeta", "Zeta function"), Term::new("alpha", "Alpha")]
        );
    }

    #[tokio::test]
    async fn test_save_and_replace_content() {
        let (_dir, repo) = setup().await;
        repo.add_term(&Term::new("t1", "Backprop")).await.unwrap();

        assert!(!repo.has_accepted_content("t1", "examples").await.unwrap());
        assert!(!repo.column_has_content("examples").await.unwrap());

        repo.save_content(&accepted("t1", "examples", 5)).await.unwrap();
        repo.save_content(&accepted("t1", "examples", 9)).await.unwrap();

        assert!(repo.has_accepted_content("t1", "examples").await.unwrap());
        assert!(repo.column_has_content("examples").await.unwrap());

        let stored = repo.get_content("t1", "examples").await.unwrap().unwrap();
        assert_eq!(stored.quality_score, 9);
        assert!(!stored.low_quality);

        assert_eq!(
            repo.content_counts().await.unwrap(),
            vec![("examples".to_string(), 1)]
        );
    }

    #[tokio::test]
    async fn test_content_requires_known_term() {
        let (_dir, repo) = setup().await;
        assert!(repo.save_content(&accepted("ghost", "examples", 8)).await.is_err());
    }
}
