use sea_query::{Alias, Expr, Order, Query, SqliteQueryBuilder, Values};

use crate::schema::Messages;

/// INSERT INTO messages (id, session_id, role, content, created_at_ms) VALUES (?, ?, ?, ?, ?)
pub fn insert(
    id: &str,
    session_id: &str,
    role: &str,
    content: &str,
    created_at_ms: i64,
) -> (String, Values) {
    Query::insert()
        .into_table(Messages::Table)
        .columns([
            Messages::Id,
            Messages::SessionId,
            Messages::Role,
            Messages::Content,
            Messages::CreatedAtMs,
        ])
        .values_panic([
            id.into(),
            session_id.into(),
            role.into(),
            content.into(),
            created_at_ms.into(),
        ])
        .build(SqliteQueryBuilder)
}

/// SELECT id, session_id, role, content, created_at_ms FROM messages
/// WHERE session_id = ? ORDER BY created_at_ms ASC, rowid ASC
pub fn select_by_session(session_id: &str) -> (String, Values) {
    Query::select()
        .columns([
            Messages::Id,
            Messages::SessionId,
            Messages::Role,
            Messages::Content,
            Messages::CreatedAtMs,
        ])
        .from(Messages::Table)
        .and_where(Expr::col(Messages::SessionId).eq(session_id))
        .order_by(Messages::CreatedAtMs, Order::Asc)
        .order_by(Alias::new("rowid"), Order::Asc)
        .build(SqliteQueryBuilder)
}

/// DELETE FROM messages WHERE id = ?
pub fn delete_by_id(id: &str) -> (String, Values) {
    Query::delete()
        .from_table(Messages::Table)
        .and_where(Expr::col(Messages::Id).eq(id))
        .build(SqliteQueryBuilder)
}

/// SELECT COUNT(*) FROM messages WHERE session_id = ?
pub fn count_by_session(session_id: &str) -> (String, Values) {
    Query::select()
        .expr(Expr::col(Messages::Id).count())
        .from(Messages::Table)
        .and_where(Expr::col(Messages::SessionId).eq(session_id))
        .build(SqliteQueryBuilder)
}
