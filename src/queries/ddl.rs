use sea_query::{ColumnDef, Expr, ForeignKey, ForeignKeyAction, Index, SqliteQueryBuilder, Table};

use crate::schema::{ChatSessions, Messages, Metadata, Videos};

/// CREATE TABLE IF NOT EXISTS metadata (key TEXT PRIMARY KEY, value TEXT NOT NULL)
pub fn create_metadata_table() -> String {
    Table::create()
        .table(Metadata::Table)
        .if_not_exists()
        .col(ColumnDef::new(Metadata::Key).string().primary_key())
        .col(ColumnDef::new(Metadata::Value).string().not_null())
        .to_string(SqliteQueryBuilder)
}

/// CREATE TABLE IF NOT EXISTS chat_sessions (
///     id TEXT PRIMARY KEY,
///     title TEXT,
///     created_at_ms INTEGER NOT NULL,
///     updated_at_ms INTEGER NOT NULL
/// )
pub fn create_chat_sessions_table() -> String {
    Table::create()
        .table(ChatSessions::Table)
        .if_not_exists()
        .col(ColumnDef::new(ChatSessions::Id).string().primary_key())
        .col(ColumnDef::new(ChatSessions::Title).string().null())
        .col(
            ColumnDef::new(ChatSessions::CreatedAtMs)
                .big_integer()
                .not_null(),
        )
        .col(
            ColumnDef::new(ChatSessions::UpdatedAtMs)
                .big_integer()
                .not_null(),
        )
        .to_string(SqliteQueryBuilder)
}

/// CREATE TABLE IF NOT EXISTS videos (
///     id TEXT PRIMARY KEY,
///     session_id TEXT NOT NULL UNIQUE REFERENCES chat_sessions(id) ON DELETE CASCADE,
///     file_name TEXT NOT NULL,
///     file_path TEXT NOT NULL,
///     mime_type TEXT NOT NULL,
///     uploaded_at_ms INTEGER NOT NULL
/// )
pub fn create_videos_table() -> String {
    Table::create()
        .table(Videos::Table)
        .if_not_exists()
        .col(ColumnDef::new(Videos::Id).string().primary_key())
        .col(
            ColumnDef::new(Videos::SessionId)
                .string()
                .not_null()
                .unique_key(),
        )
        .col(ColumnDef::new(Videos::FileName).string().not_null())
        .col(ColumnDef::new(Videos::FilePath).string().not_null())
        .col(ColumnDef::new(Videos::MimeType).string().not_null())
        .col(ColumnDef::new(Videos::UploadedAtMs).big_integer().not_null())
        .foreign_key(
            ForeignKey::create()
                .from(Videos::Table, Videos::SessionId)
                .to(ChatSessions::Table, ChatSessions::Id)
                .on_delete(ForeignKeyAction::Cascade),
        )
        .to_string(SqliteQueryBuilder)
}

/// CREATE TABLE IF NOT EXISTS messages (
///     id TEXT PRIMARY KEY,
///     session_id TEXT NOT NULL REFERENCES chat_sessions(id) ON DELETE CASCADE,
///     role TEXT NOT NULL CHECK (role IN ('user', 'assistant')),
///     content TEXT NOT NULL,
///     created_at_ms INTEGER NOT NULL
/// )
pub fn create_messages_table() -> String {
    Table::create()
        .table(Messages::Table)
        .if_not_exists()
        .col(ColumnDef::new(Messages::Id).string().primary_key())
        .col(ColumnDef::new(Messages::SessionId).string().not_null())
        .col(
            ColumnDef::new(Messages::Role)
                .string()
                .not_null()
                .check(Expr::col(Messages::Role).is_in(["user", "assistant"])),
        )
        .col(ColumnDef::new(Messages::Content).text().not_null())
        .col(ColumnDef::new(Messages::CreatedAtMs).big_integer().not_null())
        .foreign_key(
            ForeignKey::create()
                .from(Messages::Table, Messages::SessionId)
                .to(ChatSessions::Table, ChatSessions::Id)
                .on_delete(ForeignKeyAction::Cascade),
        )
        .to_string(SqliteQueryBuilder)
}

/// CREATE INDEX IF NOT EXISTS idx_messages_session_created ON messages(session_id, created_at_ms)
pub fn create_messages_session_index() -> String {
    Index::create()
        .if_not_exists()
        .name("idx_messages_session_created")
        .table(Messages::Table)
        .col(Messages::SessionId)
        .col(Messages::CreatedAtMs)
        .to_string(SqliteQueryBuilder)
}

/// CREATE INDEX IF NOT EXISTS idx_chat_sessions_updated ON chat_sessions(updated_at_ms)
pub fn create_chat_sessions_updated_index() -> String {
    Index::create()
        .if_not_exists()
        .name("idx_chat_sessions_updated")
        .table(ChatSessions::Table)
        .col(ChatSessions::UpdatedAtMs)
        .to_string(SqliteQueryBuilder)
}
