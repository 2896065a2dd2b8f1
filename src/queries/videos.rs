use sea_query::{Expr, Query, SqliteQueryBuilder, Values};

use crate::schema::Videos;

/// INSERT INTO videos (id, session_id, file_name, file_path, mime_type, uploaded_at_ms)
/// VALUES (?, ?, ?, ?, ?, ?)
pub fn insert(
    id: &str,
    session_id: &str,
    file_name: &str,
    file_path: &str,
    mime_type: &str,
    uploaded_at_ms: i64,
) -> (String, Values) {
    Query::insert()
        .into_table(Videos::Table)
        .columns([
            Videos::Id,
            Videos::SessionId,
            Videos::FileName,
            Videos::FilePath,
            Videos::MimeType,
            Videos::UploadedAtMs,
        ])
        .values_panic([
            id.into(),
            session_id.into(),
            file_name.into(),
            file_path.into(),
            mime_type.into(),
            uploaded_at_ms.into(),
        ])
        .build(SqliteQueryBuilder)
}

/// SELECT id, file_name, file_path, mime_type, uploaded_at_ms FROM videos WHERE session_id = ?
pub fn select_by_session(session_id: &str) -> (String, Values) {
    Query::select()
        .columns([
            Videos::Id,
            Videos::FileName,
            Videos::FilePath,
            Videos::MimeType,
            Videos::UploadedAtMs,
        ])
        .from(Videos::Table)
        .and_where(Expr::col(Videos::SessionId).eq(session_id))
        .build(SqliteQueryBuilder)
}
