use sea_query::Iden;

/// Metadata table - key-value store for database configuration
#[derive(Iden)]
pub enum Metadata {
    Table,
    Key,
    Value,
}

/// Chat sessions table - one per analyzed recording
#[derive(Iden)]
pub enum ChatSessions {
    Table,
    Id,
    Title,
    CreatedAtMs,
    UpdatedAtMs,
}

/// Videos table - at most one stored recording per session
#[derive(Iden)]
pub enum Videos {
    Table,
    Id,
    SessionId,
    FileName,
    FilePath,
    MimeType,
    UploadedAtMs,
}

/// Messages table - append-only chat turns
#[derive(Iden)]
pub enum Messages {
    Table,
    Id,
    SessionId,
    Role,
    Content,
    CreatedAtMs,
}
