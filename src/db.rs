use sea_query::{Value, Values};
use sqlx::query::Query;
use sqlx::sqlite::{
    SqliteArguments, SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteRow,
};
use sqlx::{Row, Sqlite, SqlitePool};
use std::path::Path;

use crate::constants::EXPECTED_DB_VERSION;
use crate::error::DynError;
use crate::models::{ChatHistory, ChatSession, Message, Role, SessionSummary, Video};
use crate::queries::{ddl, messages, metadata, sessions, videos};

/// Attach sea-query values to a sqlx query in placeholder order
pub fn bind_query(sql: &str, values: Values) -> Result<Query<'_, Sqlite, SqliteArguments<'_>>, DynError> {
    let mut query = sqlx::query(sql);
    for value in values.0 {
        query = match value {
            Value::Bool(v) => query.bind(v),
            Value::Int(v) => query.bind(v),
            Value::BigInt(v) => query.bind(v),
            Value::String(v) => query.bind(v.map(|s| *s)),
            other => return Err(format!("Unsupported bind value: {:?}", other).into()),
        };
    }
    Ok(query)
}

/// Open the file-based database used by the server
/// Enables WAL mode and foreign keys, creates the schema and checks its version
pub async fn open_database(path: &Path) -> Result<SqlitePool, DynError> {
    let options = SqliteConnectOptions::new()
        .filename(path)
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .foreign_keys(true);
    let pool = SqlitePoolOptions::new()
        .max_connections(5)
        .connect_with(options)
        .await?;
    init_database_schema(&pool).await?;
    log::info!("SQLite database: {}", path.display());
    Ok(pool)
}

/// Create a database in a fresh temporary directory for tests
/// The directory is removed when the returned guard is dropped
pub async fn create_test_connection_in_temporary_file(
) -> Result<(SqlitePool, tempfile::TempDir), DynError> {
    let dir = tempfile::tempdir()?;
    let options = SqliteConnectOptions::new()
        .filename(dir.path().join("test.sqlite"))
        .create_if_missing(true)
        .foreign_keys(true);
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect_with(options)
        .await?;
    Ok((pool, dir))
}

/// Create all tables and indexes if missing, then record or verify the schema version
pub async fn init_database_schema(pool: &SqlitePool) -> Result<(), DynError> {
    for sql in [
        ddl::create_metadata_table(),
        ddl::create_chat_sessions_table(),
        ddl::create_videos_table(),
        ddl::create_messages_table(),
        ddl::create_messages_session_index(),
        ddl::create_chat_sessions_updated_index(),
    ] {
        sqlx::query(&sql).execute(pool).await?;
    }

    let (sql, values) = metadata::select_by_key("version");
    let existing: Option<String> = bind_query(&sql, values)?
        .fetch_optional(pool)
        .await?
        .map(|row| row.try_get::<String, _>("value"))
        .transpose()?;

    match existing {
        Some(version) if version != EXPECTED_DB_VERSION => Err(format!(
            "Unsupported database version: '{}'. Expected version '{}'",
            version, EXPECTED_DB_VERSION
        )
        .into()),
        Some(_) => Ok(()),
        None => {
            let (sql, values) = metadata::upsert("version", EXPECTED_DB_VERSION);
            bind_query(&sql, values)?.execute(pool).await?;
            Ok(())
        }
    }
}

/// File details of a recording that was just written to disk
#[derive(Debug, Clone)]
pub struct NewVideo {
    pub file_name: String,
    pub file_path: String,
    pub mime_type: String,
}

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

fn default_title() -> String {
    format!(
        "Speech analysis {}",
        chrono::Utc::now().format("%Y-%m-%d %H:%M")
    )
}

fn message_from_row(row: &SqliteRow) -> Result<Message, DynError> {
    let role: String = row.try_get("role")?;
    Ok(Message {
        id: row.try_get("id")?,
        session_id: row.try_get("session_id")?,
        role: Role::parse(&role).ok_or_else(|| format!("Unknown message role '{}'", role))?,
        content: row.try_get("content")?,
        created_at_ms: row.try_get("created_at_ms")?,
    })
}

fn video_from_row(row: &SqliteRow) -> Result<Video, DynError> {
    Ok(Video {
        id: row.try_get("id")?,
        file_name: row.try_get("file_name")?,
        file_path: row.try_get("file_path")?,
        mime_type: row.try_get("mime_type")?,
        uploaded_at_ms: row.try_get("uploaded_at_ms")?,
    })
}

/// Create a session and its video in one transaction
pub async fn create_session_with_video(
    pool: &SqlitePool,
    video: &NewVideo,
) -> Result<ChatSession, DynError> {
    let session_id = uuid::Uuid::new_v4().to_string();
    let video_id = uuid::Uuid::new_v4().to_string();
    let title = default_title();
    let now = now_ms();

    let mut tx = pool.begin().await?;
    let (sql, values) = sessions::insert(&session_id, Some(&title), now);
    bind_query(&sql, values)?.execute(&mut *tx).await?;
    let (sql, values) = videos::insert(
        &video_id,
        &session_id,
        &video.file_name,
        &video.file_path,
        &video.mime_type,
        now,
    );
    bind_query(&sql, values)?.execute(&mut *tx).await?;
    tx.commit().await?;

    Ok(ChatSession {
        id: session_id,
        title: Some(title),
        created_at_ms: now,
        updated_at_ms: now,
        video: Some(Video {
            id: video_id,
            file_name: video.file_name.clone(),
            file_path: video.file_path.clone(),
            mime_type: video.mime_type.clone(),
            uploaded_at_ms: now,
        }),
    })
}

pub async fn session_exists(pool: &SqlitePool, session_id: &str) -> Result<bool, DynError> {
    let (sql, values) = sessions::exists(session_id);
    Ok(bind_query(&sql, values)?
        .fetch_optional(pool)
        .await?
        .is_some())
}

/// Append a message and bump the session's update time
pub async fn insert_message(
    pool: &SqlitePool,
    session_id: &str,
    role: Role,
    content: &str,
) -> Result<Message, DynError> {
    let id = uuid::Uuid::new_v4().to_string();
    let now = now_ms();

    let mut tx = pool.begin().await?;
    let (sql, values) = messages::insert(&id, session_id, role.as_str(), content, now);
    bind_query(&sql, values)?.execute(&mut *tx).await?;
    let (sql, values) = sessions::touch(session_id, now);
    bind_query(&sql, values)?.execute(&mut *tx).await?;
    tx.commit().await?;

    Ok(Message {
        id,
        session_id: session_id.to_string(),
        role,
        content: content.to_string(),
        created_at_ms: now,
    })
}

/// All sessions, most recently updated first
pub async fn list_sessions(pool: &SqlitePool) -> Result<Vec<SessionSummary>, DynError> {
    let (sql, values) = sessions::select_summaries();
    let rows = bind_query(&sql, values)?.fetch_all(pool).await?;

    let mut summaries = Vec::with_capacity(rows.len());
    for row in rows {
        let video = match row.try_get::<Option<String>, _>("video_id")? {
            Some(video_id) => Some(Video {
                id: video_id,
                file_name: row.try_get("file_name")?,
                file_path: row.try_get("file_path")?,
                mime_type: row.try_get("mime_type")?,
                uploaded_at_ms: row.try_get("uploaded_at_ms")?,
            }),
            None => None,
        };
        summaries.push(SessionSummary {
            id: row.try_get("id")?,
            title: row.try_get("title")?,
            created_at_ms: row.try_get("created_at_ms")?,
            updated_at_ms: row.try_get("updated_at_ms")?,
            message_count: row.try_get("message_count")?,
            video,
        });
    }
    Ok(summaries)
}

async fn get_session(pool: &SqlitePool, session_id: &str) -> Result<Option<ChatSession>, DynError> {
    let (sql, values) = sessions::select_by_id(session_id);
    let Some(row) = bind_query(&sql, values)?.fetch_optional(pool).await? else {
        return Ok(None);
    };

    let (sql, values) = videos::select_by_session(session_id);
    let video = bind_query(&sql, values)?
        .fetch_optional(pool)
        .await?
        .map(|row| video_from_row(&row))
        .transpose()?;

    Ok(Some(ChatSession {
        id: row.try_get("id")?,
        title: row.try_get("title")?,
        created_at_ms: row.try_get("created_at_ms")?,
        updated_at_ms: row.try_get("updated_at_ms")?,
        video,
    }))
}

/// A session with its video and messages in creation order, None if unknown
pub async fn get_chat_history(
    pool: &SqlitePool,
    session_id: &str,
) -> Result<Option<ChatHistory>, DynError> {
    let Some(chat_session) = get_session(pool, session_id).await? else {
        return Ok(None);
    };

    let (sql, values) = messages::select_by_session(session_id);
    let messages = bind_query(&sql, values)?
        .fetch_all(pool)
        .await?
        .iter()
        .map(message_from_row)
        .collect::<Result<Vec<_>, _>>()?;

    Ok(Some(ChatHistory {
        chat_session,
        messages,
    }))
}

pub async fn count_messages(pool: &SqlitePool, session_id: &str) -> Result<i64, DynError> {
    let (sql, values) = messages::count_by_session(session_id);
    let row = bind_query(&sql, values)?.fetch_one(pool).await?;
    Ok(row.try_get::<i64, _>(0)?)
}

/// Remove one message, returning whether it existed
pub async fn delete_message(pool: &SqlitePool, message_id: &str) -> Result<bool, DynError> {
    let (sql, values) = messages::delete_by_id(message_id);
    let result = bind_query(&sql, values)?.execute(pool).await?;
    Ok(result.rows_affected() > 0)
}

/// Delete a session, its video row and its messages
/// Returns the deleted session so the caller can remove the stored file
pub async fn delete_session(
    pool: &SqlitePool,
    session_id: &str,
) -> Result<Option<ChatSession>, DynError> {
    let Some(session) = get_session(pool, session_id).await? else {
        return Ok(None);
    };
    let (sql, values) = sessions::delete(session_id);
    bind_query(&sql, values)?.execute(pool).await?;
    Ok(Some(session))
}
