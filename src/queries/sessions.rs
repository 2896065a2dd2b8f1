use sea_query::{Alias, Expr, Order, Query, SqliteQueryBuilder, Values};

use crate::schema::{ChatSessions, Messages, Videos};

/// INSERT INTO chat_sessions (id, title, created_at_ms, updated_at_ms) VALUES (?, ?, ?, ?)
pub fn insert(id: &str, title: Option<&str>, now_ms: i64) -> (String, Values) {
    Query::insert()
        .into_table(ChatSessions::Table)
        .columns([
            ChatSessions::Id,
            ChatSessions::Title,
            ChatSessions::CreatedAtMs,
            ChatSessions::UpdatedAtMs,
        ])
        .values_panic([
            id.into(),
            title.map(str::to_string).into(),
            now_ms.into(),
            now_ms.into(),
        ])
        .build(SqliteQueryBuilder)
}

/// SELECT 1 FROM chat_sessions WHERE id = ? (for existence check)
pub fn exists(id: &str) -> (String, Values) {
    Query::select()
        .expr(Expr::val(1))
        .from(ChatSessions::Table)
        .and_where(Expr::col(ChatSessions::Id).eq(id))
        .build(SqliteQueryBuilder)
}

/// SELECT id, title, created_at_ms, updated_at_ms FROM chat_sessions WHERE id = ?
pub fn select_by_id(id: &str) -> (String, Values) {
    Query::select()
        .columns([
            ChatSessions::Id,
            ChatSessions::Title,
            ChatSessions::CreatedAtMs,
            ChatSessions::UpdatedAtMs,
        ])
        .from(ChatSessions::Table)
        .and_where(Expr::col(ChatSessions::Id).eq(id))
        .build(SqliteQueryBuilder)
}

/// UPDATE chat_sessions SET updated_at_ms = ? WHERE id = ?
pub fn touch(id: &str, now_ms: i64) -> (String, Values) {
    Query::update()
        .table(ChatSessions::Table)
        .value(ChatSessions::UpdatedAtMs, now_ms)
        .and_where(Expr::col(ChatSessions::Id).eq(id))
        .build(SqliteQueryBuilder)
}

/// DELETE FROM chat_sessions WHERE id = ?
pub fn delete(id: &str) -> (String, Values) {
    Query::delete()
        .from_table(ChatSessions::Table)
        .and_where(Expr::col(ChatSessions::Id).eq(id))
        .build(SqliteQueryBuilder)
}

/// SELECT s.id, s.title, s.created_at_ms, s.updated_at_ms,
///        v.id AS video_id, v.file_name, v.file_path, v.mime_type, v.uploaded_at_ms,
///        COUNT(m.id) AS message_count
/// FROM chat_sessions s
/// LEFT JOIN videos v ON v.session_id = s.id
/// LEFT JOIN messages m ON m.session_id = s.id
/// GROUP BY s.id
/// ORDER BY s.updated_at_ms DESC, s.created_at_ms DESC
pub fn select_summaries() -> (String, Values) {
    Query::select()
        .column((ChatSessions::Table, ChatSessions::Id))
        .column((ChatSessions::Table, ChatSessions::Title))
        .column((ChatSessions::Table, ChatSessions::CreatedAtMs))
        .column((ChatSessions::Table, ChatSessions::UpdatedAtMs))
        .expr_as(Expr::col((Videos::Table, Videos::Id)), Alias::new("video_id"))
        .column((Videos::Table, Videos::FileName))
        .column((Videos::Table, Videos::FilePath))
        .column((Videos::Table, Videos::MimeType))
        .column((Videos::Table, Videos::UploadedAtMs))
        .expr_as(
            Expr::col((Messages::Table, Messages::Id)).count(),
            Alias::new("message_count"),
        )
        .from(ChatSessions::Table)
        .left_join(
            Videos::Table,
            Expr::col((Videos::Table, Videos::SessionId))
                .equals((ChatSessions::Table, ChatSessions::Id)),
        )
        .left_join(
            Messages::Table,
            Expr::col((Messages::Table, Messages::SessionId))
                .equals((ChatSessions::Table, ChatSessions::Id)),
        )
        .group_by_col((ChatSessions::Table, ChatSessions::Id))
        .order_by((ChatSessions::Table, ChatSessions::UpdatedAtMs), Order::Desc)
        .order_by((ChatSessions::Table, ChatSessions::CreatedAtMs), Order::Desc)
        .build(SqliteQueryBuilder)
}
