//! Users, their remote streaming servers and linked external accounts.

use crate::error::{Result, StorageError};
use listenledger_core::{ServerId, SpotifyLink, SubsonicTarget, User, UserId};
use sqlx::{Row, SqlitePool};

pub async fn create_user(pool: &SqlitePool, username: &str, listen_token: &str) -> Result<User> {
    let id: i64 = sqlx::query_scalar(
        "INSERT INTO users (username, listen_token) VALUES (?, ?) RETURNING id",
    )
    .bind(username)
    .bind(listen_token)
    .fetch_one(pool)
    .await?;

    Ok(User {
        id,
        username: username.to_string(),
    })
}

pub async fn list_users(pool: &SqlitePool) -> Result<Vec<User>> {
    let rows = sqlx::query("SELECT id, username FROM users ORDER BY id")
        .fetch_all(pool)
        .await?;
    rows.iter()
        .map(|r| {
            Ok(User {
                id: r.try_get("id")?,
                username: r.try_get("username")?,
            })
        })
        .collect()
}

pub async fn user_by_name(pool: &SqlitePool, username: &str) -> Result<Option<User>> {
    let row = sqlx::query("SELECT id, username FROM users WHERE username = ?")
        .bind(username)
        .fetch_optional(pool)
        .await?;
    row.map(|r| {
        Ok(User {
            id: r.try_get("id")?,
            username: r.try_get("username")?,
        })
    })
    .transpose()
}

pub async fn user_by_listen_token(pool: &SqlitePool, token: &str) -> Result<Option<User>> {
    let row = sqlx::query("SELECT id, username FROM users WHERE listen_token = ?")
        .bind(token)
        .fetch_optional(pool)
        .await?;
    row.map(|r| {
        Ok(User {
            id: r.try_get("id")?,
            username: r.try_get("username")?,
        })
    })
    .transpose()
}

pub async fn add_subsonic_server(
    pool: &SqlitePool,
    user_id: UserId,
    name: Option<&str>,
    url: &str,
    username: Option<&str>,
    password: &str,
) -> Result<ServerId> {
    let id: i64 = sqlx::query_scalar(
        "INSERT INTO subsonic_servers (user_id, name, url, username, password) \
         VALUES (?, ?, ?, ?, ?) RETURNING id",
    )
    .bind(user_id)
    .bind(name)
    .bind(url)
    .bind(username)
    .bind(password)
    .fetch_one(pool)
    .await?;
    Ok(id)
}

/// Every configured server with the remote username resolved: a server row
/// without one falls back to the local username.
pub async fn subsonic_targets(pool: &SqlitePool) -> Result<Vec<SubsonicTarget>> {
    let rows = sqlx::query(
        r#"
        SELECT s.id, s.user_id, s.name, s.url, COALESCE(s.username, u.username) AS username, s.password
        FROM subsonic_servers s
        JOIN users u ON u.id = s.user_id
        ORDER BY s.user_id, s.id
        "#,
    )
    .fetch_all(pool)
    .await?;

    rows.iter()
        .map(|r| {
            Ok(SubsonicTarget {
                server_id: r.try_get("id")?,
                user_id: r.try_get("user_id")?,
                name: r.try_get("name")?,
                base_url: r.try_get("url")?,
                username: r.try_get("username")?,
                password: r.try_get("password")?,
            })
        })
        .collect()
}

pub async fn spotify_links(pool: &SqlitePool) -> Result<Vec<SpotifyLink>> {
    let rows = sqlx::query(
        "SELECT id, spotify_access_token, spotify_refresh_token FROM users \
         WHERE spotify_access_token IS NOT NULL ORDER BY id",
    )
    .fetch_all(pool)
    .await?;

    rows.iter()
        .map(|r| {
            Ok(SpotifyLink {
                user_id: r.try_get("id")?,
                access_token: r.try_get("spotify_access_token")?,
                refresh_token: r.try_get("spotify_refresh_token")?,
            })
        })
        .collect()
}

pub async fn store_spotify_tokens(
    pool: &SqlitePool,
    user_id: UserId,
    access_token: &str,
    refresh_token: Option<&str>,
) -> Result<()> {
    let result = sqlx::query(
        "UPDATE users SET spotify_access_token = ?, \
         spotify_refresh_token = COALESCE(?, spotify_refresh_token) WHERE id = ?",
    )
    .bind(access_token)
    .bind(refresh_token)
    .bind(user_id)
    .execute(pool)
    .await?;

    if result.rows_affected() == 0 {
        return Err(StorageError::not_found("user", user_id));
    }
    Ok(())
}
