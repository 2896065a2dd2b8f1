use rand::Rng;

/// Expected database schema version
/// Databases written with a different version are refused at startup
pub const EXPECTED_DB_VERSION: &str = "1";

/// Version of the framed event protocol spoken by the streaming endpoints
pub const STREAM_PROTOCOL_VERSION: u32 = 1;

/// Response header announcing the stream protocol version
pub const STREAM_PROTOCOL_HEADER: &str = "x-stream-protocol";

/// Mime type assumed when a client does not send one
pub const DEFAULT_VIDEO_MIME_TYPE: &str = "video/webm";

/// Multipart field carrying the recorded video
pub const VIDEO_FORM_FIELD: &str = "video";

/// Sampling parameters sent with every completion request
pub const MAX_OUTPUT_TOKENS: u32 = 4096;
pub const TEMPERATURE: f32 = 0.7;

fn random_suffix(len: usize) -> String {
    rand::thread_rng()
        .sample_iter(&rand::distributions::Alphanumeric)
        .take(len)
        .map(char::from)
        .collect::<String>()
        .to_lowercase()
}

/// Generate an id for a streamed assistant message
/// Format: msg-{unix_ms}-{9 random chars}
pub fn generate_message_id() -> String {
    format!(
        "msg-{}-{}",
        chrono::Utc::now().timestamp_millis(),
        random_suffix(9)
    )
}

/// Generate a stored file name for an uploaded recording
/// Format: video_{unix_ms}_{6 random chars}.{extension}
pub fn generate_video_file_name(extension: &str) -> String {
    format!(
        "video_{}_{}.{}",
        chrono::Utc::now().timestamp_millis(),
        random_suffix(6),
        extension
    )
}
