/// Signature persistence
///
/// `plugin_signatures` holds at most one row per plugin id; signing replaces
/// it. `signature_verifications` is append-only and gets one row for every
/// verification attempt.
use anyhow::{anyhow, Context, Result};
use sdk::{SignatureAlgorithm, VerificationResult};
use serde::{Deserialize, Serialize};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};

/// Stored signature for a plugin
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignatureRecord {
    pub plugin_id: String,
    pub algorithm: SignatureAlgorithm,
    pub signature: String,
    pub public_key: String,
    pub code_hash: String,
    pub signed_at: i64,
}

/// One verification attempt
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerificationRecord {
    pub id: String,
    pub plugin_id: String,
    pub user_id: Option<String>,
    pub result: VerificationResult,
    pub error_message: Option<String>,
    pub verified_at: i64,
}

fn signature_from_row(r: &SqliteRow) -> Result<SignatureRecord> {
    let algorithm: String = r.get("algorithm");
    Ok(SignatureRecord {
        plugin_id: r.get("plugin_id"),
        algorithm: algorithm.parse().map_err(|e| anyhow!("{}", e))?,
        signature: r.get("signature"),
        public_key: r.get("public_key"),
        code_hash: r.get("code_hash"),
        signed_at: r.get("signed_at"),
    })
}

fn verification_from_row(r: &SqliteRow) -> Result<VerificationRecord> {
    let result: String = r.get("result");
    Ok(VerificationRecord {
        id: r.get("id"),
        plugin_id: r.get("plugin_id"),
        user_id: r.get("user_id"),
        result: result.parse().map_err(|e| anyhow!("{}", e))?,
        error_message: r.get("error_message"),
        verified_at: r.get("verified_at"),
    })
}

/// Signature repository for database operations
#[derive(Clone)]
pub struct SignatureRepository {
    pool: SqlitePool,
}

impl SignatureRepository {
    /// Create a new signature repository
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Store a signature, replacing any prior signature for the plugin
    pub async fn upsert_signature(&self, record: &SignatureRecord) -> Result<()> {
        sqlx::query(
            "INSERT INTO plugin_signatures (plugin_id, algorithm, signature, public_key, code_hash, signed_at)
             VALUES (?, ?, ?, ?, ?, ?)
             ON CONFLICT(plugin_id) DO UPDATE SET
                algorithm = excluded.algorithm,
                signature = excluded.signature,
                public_key = excluded.public_key,
                code_hash = excluded.code_hash,
                signed_at = excluded.signed_at",
        )
        .bind(&record.plugin_id)
        .bind(record.algorithm.as_str())
        .bind(&record.signature)
        .bind(&record.public_key)
        .bind(&record.code_hash)
        .bind(record.signed_at)
        .execute(&self.pool)
        .await
        .context("Failed to store plugin signature")?;

        Ok(())
    }

    /// Get the signature on record for a plugin
    pub async fn get_signature(&self, plugin_id: &str) -> Result<Option<SignatureRecord>> {
        let row = sqlx::query(
            "SELECT plugin_id, algorithm, signature, public_key, code_hash, signed_at
             FROM plugin_signatures WHERE plugin_id = ?",
        )
        .bind(plugin_id)
        .fetch_optional(&self.pool)
        .await
        .context("Failed to fetch plugin signature")?;

        row.as_ref().map(signature_from_row).transpose()
    }

    /// Append a verification attempt
    pub async fn insert_verification(&self, record: &VerificationRecord) -> Result<()> {
        sqlx::query(
            "INSERT INTO signature_verifications (id, plugin_id, user_id, result, error_message, verified_at)
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(&record.id)
        .bind(&record.plugin_id)
        .bind(&record.user_id)
        .bind(record.result.as_str())
        .bind(&record.error_message)
        .bind(record.verified_at)
        .execute(&self.pool)
        .await
        .context("Failed to record signature verification")?;

        Ok(())
    }

    /// Most recent verification attempts for a plugin, newest first
    pub async fn recent_verifications(
        &self,
        plugin_id: &str,
        limit: i64,
    ) -> Result<Vec<VerificationRecord>> {
        let rows = sqlx::query(
            "SELECT id, plugin_id, user_id, result, error_message, verified_at
             FROM signature_verifications
             WHERE plugin_id = ?
             ORDER BY verified_at DESC, rowid DESC
             LIMIT ?",
        )
        .bind(plugin_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .context("Failed to fetch verification history")?;

        rows.iter().map(verification_from_row).collect()
    }

    /// Number of verification attempts recorded for a plugin
    pub async fn count_verifications(&self, plugin_id: &str) -> Result<i64> {
        let count: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM signature_verifications WHERE plugin_id = ?")
                .bind(plugin_id)
                .fetch_one(&self.pool)
                .await
                .context("Failed to count verifications")?;

        Ok(count)
    }

    /// Failed verifications (result other than `valid`) per plugin since `since`
    pub async fn count_failures_by_plugin(&self, since: i64) -> Result<Vec<(String, i64)>> {
        let rows: Vec<(String, i64)> = sqlx::query_as(
            "SELECT plugin_id, COUNT(*) FROM signature_verifications
             WHERE result != 'valid' AND verified_at >= ?
             GROUP BY plugin_id",
        )
        .bind(since)
        .fetch_all(&self.pool)
        .await
        .context("Failed to count verification failures")?;

        Ok(rows)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;
    use tempfile::TempDir;

    fn record(plugin_id: &str, signature: &str) -> SignatureRecord {
        SignatureRecord {
            plugin_id: plugin_id.to_string(),
            algorithm: SignatureAlgorithm::Ed25519,
            signature: signature.to_string(),
            public_key: "ed25519:00".to_string(),
            code_hash: "abc".to_string(),
            signed_at: 1_700_000_000_000,
        }
    }

    fn verification(plugin_id: &str, result: VerificationResult, at: i64) -> VerificationRecord {
        VerificationRecord {
            id: uuid::Uuid::new_v4().to_string(),
            plugin_id: plugin_id.to_string(),
            user_id: None,
            result,
            error_message: None,
            verified_at: at,
        }
    }

    #[tokio::test]
    async fn test_signing_overwrites_prior_signature() {
        let temp_dir = TempDir::new().unwrap();
        let db = Database::new(&temp_dir.path().join("test.db")).await.unwrap();
        let repo = db.signatures();

        repo.upsert_signature(&record("com.example.a", "first"))
            .await
            .unwrap();
        repo.upsert_signature(&record("com.example.a", "second"))
            .await
            .unwrap();

        let stored = repo.get_signature("com.example.a").await.unwrap().unwrap();
        assert_eq!(stored.signature, "second");

        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM plugin_signatures")
            .fetch_one(db.pool())
            .await
            .unwrap();
        assert_eq!(count, 1);
    }

    #[tokio::test]
    async fn test_missing_signature_is_none() {
        let temp_dir = TempDir::new().unwrap();
        let db = Database::new(&temp_dir.path().join("test.db")).await.unwrap();

        let stored = db.signatures().get_signature("com.example.none").await.unwrap();
        assert!(stored.is_none());
    }

    #[tokio::test]
    async fn test_failure_counts_exclude_valid_and_old_rows() {
        let temp_dir = TempDir::new().unwrap();
        let db = Database::new(&temp_dir.path().join("test.db")).await.unwrap();
        let repo = db.signatures();

        for result in [
            VerificationResult::Invalid,
            VerificationResult::Missing,
            VerificationResult::Valid,
        ] {
            repo.insert_verification(&verification("com.example.a", result, 2_000))
                .await
                .unwrap();
        }
        repo.insert_verification(&verification("com.example.a", VerificationResult::Error, 10))
            .await
            .unwrap();

        let counts = repo.count_failures_by_plugin(1_000).await.unwrap();
        assert_eq!(counts, vec![("com.example.a".to_string(), 2)]);
        assert_eq!(repo.count_verifications("com.example.a").await.unwrap(), 4);

        let recent = repo.recent_verifications("com.example.a", 2).await.unwrap();
        assert_eq!(recent.len(), 2);
        assert!(recent.iter().all(|v| v.verified_at == 2_000));
    }
}
