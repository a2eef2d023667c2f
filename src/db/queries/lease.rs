//! Job lease table queries
//!
//! A lease row exists per `(kind, target_id)`. It can be taken when absent,
//! expired, or already owned by the same holder.

use sqlx::PgPool;
use uuid::Uuid;

use crate::types::LeaseKey;

/// Try to take the lease. Returns true when `holder` owns it afterwards.
pub async fn acquire_lease(pool: &PgPool, key: LeaseKey, holder: Uuid, ttl_secs: f64) -> Result<bool, sqlx::Error> {
    let acquired: Option<Uuid> = sqlx::query_scalar(
        r#"INSERT INTO job_leases (kind, target_id, holder, acquired_at, expires_at)
           VALUES ($1, $2, $3, NOW(), NOW() + make_interval(secs => $4))
           ON CONFLICT (kind, target_id) DO UPDATE
           SET holder = EXCLUDED.holder,
               acquired_at = EXCLUDED.acquired_at,
               expires_at = EXCLUDED.expires_at
           WHERE job_leases.expires_at < NOW() OR job_leases.holder = EXCLUDED.holder
           RETURNING holder"#,
    )
    .bind(key.kind.as_str())
    .bind(key.target_id)
    .bind(holder)
    .bind(ttl_secs)
    .fetch_optional(pool)
    .await?;

    Ok(acquired == Some(holder))
}

/// Push the expiry forward. Returns false if the lease is no longer ours.
pub async fn renew_lease(pool: &PgPool, key: LeaseKey, holder: Uuid, ttl_secs: f64) -> Result<bool, sqlx::Error> {
    let result = sqlx::query(
        r#"UPDATE job_leases
           SET expires_at = NOW() + make_interval(secs => $4)
           WHERE kind = $1 AND target_id = $2 AND holder = $3"#,
    )
    .bind(key.kind.as_str())
    .bind(key.target_id)
    .bind(holder)
    .bind(ttl_secs)
    .execute(pool)
    .await?;

    Ok(result.rows_affected() == 1)
}

/// Drop the lease if `holder` still owns it
pub async fn release_lease(pool: &PgPool, key: LeaseKey, holder: Uuid) -> Result<(), sqlx::Error> {
    sqlx::query("DELETE FROM job_leases WHERE kind = $1 AND target_id = $2 AND holder = $3")
        .bind(key.kind.as_str())
        .bind(key.target_id)
        .bind(holder)
        .execute(pool)
        .await?;
    Ok(())
}
