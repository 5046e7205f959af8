use anyhow::{Context, Result};
use sandbox_session::OAuthSession;
use sqlx::{Row, SqlitePool, sqlite::{SqliteConnectOptions, SqliteJournalMode}};
use std::path::Path;

/// An authorization request waiting for its redirect.
#[derive(Clone, Debug)]
pub struct AuthFlowRecord {
    pub state: String,
    pub issuer: String,
    pub pds_url: Option<String>,
    pub did: Option<String>,
    pub redirect_uri: String,
    pub code_verifier: String,
    pub dpop_pkcs8: Vec<u8>,
    pub dpop_jwk: String,
    pub dpop_nonce: Option<String>,
}

#[derive(Clone)]
pub struct SqliteAuthStore {
    pool: SqlitePool,
}

impl SqliteAuthStore {
    pub async fn new(db_path: &str) -> Result<Self> {
        if let Some(dir) = Path::new(db_path).parent() {
            if !dir.as_os_str().is_empty() {
                std::fs::create_dir_all(dir)
                    .with_context(|| format!("Failed to create store directory: {}", dir.display()))?;
            }
        }
        let options = SqliteConnectOptions::new()
            .filename(db_path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal);
        let pool = SqlitePool::connect_with(options)
            .await
            .with_context(|| format!("Failed to open auth store: {}", db_path))?;
        sqlx::query(
            r#"CREATE TABLE IF NOT EXISTS auth_flows (
                state TEXT PRIMARY KEY,
                issuer TEXT NOT NULL,
                pds_url TEXT,
                did TEXT,
                redirect_uri TEXT NOT NULL,
                code_verifier TEXT NOT NULL,
                dpop_pkcs8 BLOB NOT NULL,
                dpop_jwk TEXT NOT NULL,
                dpop_nonce TEXT,
                created_at INTEGER NOT NULL
            )"#,
        )
        .execute(&pool)
        .await?;
        sqlx::query(
            r#"CREATE TABLE IF NOT EXISTS sessions (
                sub TEXT PRIMARY KEY,
                session_json TEXT NOT NULL,
                updated_at INTEGER NOT NULL
            )"#,
        )
        .execute(&pool)
        .await?;
        Ok(Self { pool })
    }

    pub async fn insert_flow(&self, rec: AuthFlowRecord) -> Result<()> {
        sqlx::query(
            r#"INSERT OR REPLACE INTO auth_flows (state, issuer, pds_url, did, redirect_uri, code_verifier, dpop_pkcs8, dpop_jwk, dpop_nonce, created_at)
               VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, strftime('%s','now'))"#,
        )
        .bind(&rec.state)
        .bind(&rec.issuer)
        .bind(&rec.pds_url)
        .bind(&rec.did)
        .bind(&rec.redirect_uri)
        .bind(&rec.code_verifier)
        .bind(&rec.dpop_pkcs8)
        .bind(&rec.dpop_jwk)
        .bind(&rec.dpop_nonce)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get_flow(&self, state: &str) -> Result<Option<AuthFlowRecord>> {
        let row = sqlx::query(
            r#"SELECT state, issuer, pds_url, did, redirect_uri, code_verifier, dpop_pkcs8, dpop_jwk, dpop_nonce
               FROM auth_flows WHERE state = ?"#,
        )
        .bind(state)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|r| AuthFlowRecord {
            state: r.get::<String, _>(0),
            issuer: r.get::<String, _>(1),
            pds_url: r.get::<Option<String>, _>(2),
            did: r.get::<Option<String>, _>(3),
            redirect_uri: r.get::<String, _>(4),
            code_verifier: r.get::<String, _>(5),
            dpop_pkcs8: r.get::<Vec<u8>, _>(6),
            dpop_jwk: r.get::<String, _>(7),
            dpop_nonce: r.get::<Option<String>, _>(8),
        }))
    }

    /// Remove and return the flow for `state`. A state is usable once.
    pub async fn take_flow(&self, state: &str) -> Result<Option<AuthFlowRecord>> {
        let flow = self.get_flow(state).await?;
        if flow.is_some() {
            self.delete_flow(state).await?;
        }
        Ok(flow)
    }

    pub async fn delete_flow(&self, state: &str) -> Result<()> {
        sqlx::query("DELETE FROM auth_flows WHERE state = ?")
            .bind(state)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Prune flows older than `max_age_secs` seconds. Returns number of rows deleted.
    pub async fn prune_flows_older_than(&self, max_age_secs: i64) -> Result<u64> {
        let result = sqlx::query(
            "DELETE FROM auth_flows WHERE created_at < strftime('%s','now') - ?",
        )
        .bind(max_age_secs)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    pub async fn save_session(&self, session: &OAuthSession) -> Result<()> {
        let json = serde_json::to_string(session).context("Failed to serialize session")?;
        sqlx::query(
            r#"INSERT OR REPLACE INTO sessions (sub, session_json, updated_at)
               VALUES (?, ?, strftime('%s','now'))"#,
        )
        .bind(&session.sub)
        .bind(json)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get_session(&self, sub: &str) -> Result<Option<OAuthSession>> {
        let row = sqlx::query("SELECT session_json FROM sessions WHERE sub = ?")
            .bind(sub)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| decode_session(&r.get::<String, _>(0))).transpose()
    }

    /// The most recently saved session.
    pub async fn current_session(&self) -> Result<Option<OAuthSession>> {
        let row = sqlx::query(
            "SELECT session_json FROM sessions ORDER BY updated_at DESC, rowid DESC LIMIT 1",
        )
        .fetch_optional(&self.pool)
        .await?;
        row.map(|r| decode_session(&r.get::<String, _>(0))).transpose()
    }

    pub async fn delete_session(&self, sub: &str) -> Result<()> {
        sqlx::query("DELETE FROM sessions WHERE sub = ?")
            .bind(sub)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

fn decode_session(json: &str) -> Result<OAuthSession> {
    serde_json::from_str(json).context("Failed to decode stored session")
}

#[cfg(test)]
mod tests {
    use super::*;
    use sandbox_session::test_helpers::session_for;
    use tempfile::tempdir;

    fn flow(state: &str) -> AuthFlowRecord {
        AuthFlowRecord {
            state: state.into(),
            issuer: "https://bsky.social".into(),
            pds_url: Some("https://bsky.social".into()),
            did: Some("did:plc:test".into()),
            redirect_uri: "https://sandbox.test/".into(),
            code_verifier: "verifier".into(),
            dpop_pkcs8: vec![1, 2, 3],
            dpop_jwk: "{\"kty\":\"EC\"}".into(),
            dpop_nonce: None,
        }
    }

    #[tokio::test]
    async fn test_flow_is_taken_once() {
        let dir = tempdir().unwrap();
        let db_path = dir.path().join("auth.db");
        let store = SqliteAuthStore::new(db_path.to_str().unwrap()).await.unwrap();

        store.insert_flow(flow("state1")).await.unwrap();
        let got = store.take_flow("state1").await.unwrap().unwrap();
        assert_eq!(got.code_verifier, "verifier");
        assert_eq!(got.did.as_deref(), Some("did:plc:test"));

        assert!(store.take_flow("state1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_prune_keeps_fresh_flows() {
        let dir = tempdir().unwrap();
        let db_path = dir.path().join("auth.db");
        let store = SqliteAuthStore::new(db_path.to_str().unwrap()).await.unwrap();

        store.insert_flow(flow("fresh")).await.unwrap();
        let pruned = store.prune_flows_older_than(600).await.unwrap();
        assert_eq!(pruned, 0);
        assert!(store.get_flow("fresh").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_sessions_round_trip_and_delete() {
        let dir = tempdir().unwrap();
        let db_path = dir.path().join("nested/auth.db");
        let store = SqliteAuthStore::new(db_path.to_str().unwrap()).await.unwrap();

        assert!(store.current_session().await.unwrap().is_none());

        store.save_session(&session_for("did:plc:one")).await.unwrap();
        store.save_session(&session_for("did:plc:two")).await.unwrap();

        let current = store.current_session().await.unwrap().unwrap();
        assert_eq!(current.sub, "did:plc:two");
        assert_eq!(
            store.get_session("did:plc:one").await.unwrap(),
            Some(session_for("did:plc:one"))
        );

        store.delete_session("did:plc:two").await.unwrap();
        let current = store.current_session().await.unwrap().unwrap();
        assert_eq!(current.sub, "did:plc:one");
    }
}
