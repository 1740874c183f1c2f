//! Relational access to `FW_Profiles`, `RADIUS_Sessions`, and `PolicyLogs`,
//! in a raw-SQL `query_as` style: explicit SQL strings, explicit binds, no
//! query builder.

use chrono::{DateTime, Utc};
use md5::{Digest, Md5};
use sqlx::PgPool;

use crate::error::StateError;

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct FwProfile {
    pub id: i64,
    pub login: String,
    pub name: String,
    pub tcp_rules: String,
    pub udp_rules: String,
    pub firewall_profile: String,
    pub ip_pool: Option<String>,
    pub ip_v6_pool: Option<String>,
    pub region_id: Option<i64>,
    pub policy_id: Option<i64>,
    pub hash: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct RadiusSession {
    pub user_name: String,
    pub timestamp: DateTime<Utc>,
    pub acct_status_type: String,
    pub framed_ip_address: Option<String>,
    pub delegated_ipv6_prefix: Option<String>,
    pub nas_ip_address: Option<String>,
}

pub fn compute_hash(tcp_rules: &str, udp_rules: &str) -> String {
    let mut hasher = Md5::new();
    hasher.update(format!("{}|{}", tcp_rules, udp_rules).as_bytes());
    hex::encode(hasher.finalize())
}

pub async fn insert_session(
    pool: &PgPool,
    user_name: &str,
    acct_status_type: &str,
    framed_ip_address: Option<&str>,
    delegated_ipv6_prefix: Option<&str>,
    nas_ip_address: Option<&str>,
) -> Result<(), StateError> {
    sqlx::query(
        "INSERT INTO \"RADIUS_Sessions\" \
         (user_name, timestamp, acct_status_type, framed_ip_address, delegated_ipv6_prefix, nas_ip_address) \
         VALUES ($1, now(), $2, $3, $4, $5) \
         ON CONFLICT (user_name) DO UPDATE SET \
         timestamp = now(), acct_status_type = $2, framed_ip_address = $3, \
         delegated_ipv6_prefix = $4, nas_ip_address = $5",
    )
    .bind(user_name)
    .bind(acct_status_type)
    .bind(framed_ip_address)
    .bind(delegated_ipv6_prefix)
    .bind(nas_ip_address)
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn delete_session_by_user(pool: &PgPool, user_name: &str) -> Result<(), StateError> {
    sqlx::query("DELETE FROM \"RADIUS_Sessions\" WHERE user_name = $1")
        .bind(user_name)
        .execute(pool)
        .await?;
    Ok(())
}

pub async fn session_exists(pool: &PgPool, user_name: &str) -> Result<bool, StateError> {
    let row: Option<(i64,)> =
        sqlx::query_as("SELECT 1 FROM \"RADIUS_Sessions\" WHERE user_name = $1")
            .bind(user_name)
            .fetch_optional(pool)
            .await?;
    Ok(row.is_some())
}

pub async fn get_profile_by_login(
    pool: &PgPool,
    login: &str,
) -> Result<Option<FwProfile>, StateError> {
    let profile = sqlx::query_as::<_, FwProfile>(
        "SELECT id, login, name, tcp_rules, udp_rules, firewall_profile, ip_pool, \
         ip_v6_pool, region_id, policy_id, hash, created_at, updated_at \
         FROM \"FW_Profiles\" WHERE login = $1",
    )
    .bind(login)
    .fetch_optional(pool)
    .await?;
    Ok(profile)
}

pub async fn get_profile_by_id(pool: &PgPool, id: i64) -> Result<Option<FwProfile>, StateError> {
    let profile = sqlx::query_as::<_, FwProfile>(
        "SELECT id, login, name, tcp_rules, udp_rules, firewall_profile, ip_pool, \
         ip_v6_pool, region_id, policy_id, hash, created_at, updated_at \
         FROM \"FW_Profiles\" WHERE id = $1",
    )
    .bind(id)
    .fetch_optional(pool)
    .await?;
    Ok(profile)
}

/// Returns the policy_id carried by any profile whose hash matches, or None.
pub async fn get_policy_id_by_hash(
    pool: &PgPool,
    hash: &str,
) -> Result<Option<i64>, StateError> {
    let row: Option<(Option<i64>,)> = sqlx::query_as(
        "SELECT policy_id FROM \"FW_Profiles\" WHERE hash = $1 AND policy_id IS NOT NULL LIMIT 1",
    )
    .bind(hash)
    .fetch_optional(pool)
    .await?;
    Ok(row.and_then(|(id,)| id))
}

/// True iff the given policy_id currently appears on at least one profile row.
pub async fn policy_id_exists(pool: &PgPool, policy_id: i64) -> Result<bool, StateError> {
    let row: Option<(i64,)> =
        sqlx::query_as("SELECT 1 FROM \"FW_Profiles\" WHERE policy_id = $1 LIMIT 1")
            .bind(policy_id)
            .fetch_optional(pool)
            .await?;
    Ok(row.is_some())
}

pub struct NewProfile<'a> {
    pub login: &'a str,
    pub name: &'a str,
    pub tcp_rules: &'a str,
    pub udp_rules: &'a str,
    pub firewall_profile: &'a str,
    pub ip_pool: Option<&'a str>,
    pub ip_v6_pool: Option<&'a str>,
    pub region_id: Option<i64>,
}

pub async fn insert_profile(pool: &PgPool, new: &NewProfile<'_>) -> Result<FwProfile, StateError> {
    let hash = compute_hash(new.tcp_rules, new.udp_rules);
    let profile = sqlx::query_as::<_, FwProfile>(
        "INSERT INTO \"FW_Profiles\" \
         (login, name, tcp_rules, udp_rules, firewall_profile, ip_pool, ip_v6_pool, \
          region_id, hash, created_at, updated_at) \
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, now(), now()) \
         RETURNING id, login, name, tcp_rules, udp_rules, firewall_profile, ip_pool, \
         ip_v6_pool, region_id, policy_id, hash, created_at, updated_at",
    )
    .bind(new.login)
    .bind(new.name)
    .bind(new.tcp_rules)
    .bind(new.udp_rules)
    .bind(new.firewall_profile)
    .bind(new.ip_pool)
    .bind(new.ip_v6_pool)
    .bind(new.region_id)
    .bind(&hash)
    .fetch_one(pool)
    .await?;
    Ok(profile)
}

/// Updates a profile's rules, recomputing `hash`; returns `(old_hash, updated)`.
pub async fn update_profile(
    pool: &PgPool,
    id: i64,
    tcp_rules: &str,
    udp_rules: &str,
) -> Result<(String, FwProfile), StateError> {
    let existing = get_profile_by_id(pool, id)
        .await?
        .ok_or_else(|| StateError::ProfileNotFound(id.to_string()))?;
    let old_hash = existing.hash.clone();
    let new_hash = compute_hash(tcp_rules, udp_rules);

    let updated = sqlx::query_as::<_, FwProfile>(
        "UPDATE \"FW_Profiles\" SET tcp_rules = $2, udp_rules = $3, hash = $4, updated_at = now() \
         WHERE id = $1 \
         RETURNING id, login, name, tcp_rules, udp_rules, firewall_profile, ip_pool, \
         ip_v6_pool, region_id, policy_id, hash, created_at, updated_at",
    )
    .bind(id)
    .bind(tcp_rules)
    .bind(udp_rules)
    .bind(&new_hash)
    .fetch_one(pool)
    .await?;
    Ok((old_hash, updated))
}

pub async fn delete_profile(pool: &PgPool, id: i64) -> Result<Option<FwProfile>, StateError> {
    let removed = sqlx::query_as::<_, FwProfile>(
        "DELETE FROM \"FW_Profiles\" WHERE id = $1 \
         RETURNING id, login, name, tcp_rules, udp_rules, firewall_profile, ip_pool, \
         ip_v6_pool, region_id, policy_id, hash, created_at, updated_at",
    )
    .bind(id)
    .fetch_optional(pool)
    .await?;
    Ok(removed)
}

pub async fn update_policy_id(
    pool: &PgPool,
    login: &str,
    hash: &str,
    policy_id: i64,
) -> Result<(), StateError> {
    sqlx::query("UPDATE \"FW_Profiles\" SET policy_id = $3 WHERE login = $1 AND hash = $2")
        .bind(login)
        .bind(hash)
        .bind(policy_id)
        .execute(pool)
        .await?;
    Ok(())
}

pub async fn append_policy_log(
    pool: &PgPool,
    user: &str,
    policy_id: Option<i64>,
    result: &str,
    http_status: Option<i32>,
    fg_address: &str,
) -> Result<(), StateError> {
    sqlx::query(
        "INSERT INTO \"PolicyLogs\" (user_name, timestamp, policy_id, result, http_status, fg_address) \
         VALUES ($1, now(), $2, $3, $4, $5)",
    )
    .bind(user)
    .bind(policy_id)
    .bind(result)
    .bind(http_status)
    .bind(fg_address)
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn list_profiles_paginated(
    pool: &PgPool,
    login: Option<&str>,
    page: i64,
    page_size: i64,
) -> Result<Vec<FwProfile>, StateError> {
    let offset = (page.max(1) - 1) * page_size;
    let profiles = sqlx::query_as::<_, FwProfile>(
        "SELECT id, login, name, tcp_rules, udp_rules, firewall_profile, ip_pool, \
         ip_v6_pool, region_id, policy_id, hash, created_at, updated_at \
         FROM \"FW_Profiles\" WHERE ($1::text IS NULL OR login = $1) \
         ORDER BY id LIMIT $2 OFFSET $3",
    )
    .bind(login)
    .bind(page_size)
    .bind(offset)
    .fetch_all(pool)
    .await?;
    Ok(profiles)
}
