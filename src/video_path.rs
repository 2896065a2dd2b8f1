use std::path::{Path, PathBuf};

use thiserror::Error;

/// Route prefix of the video-serving endpoint
pub const VIDEO_ROUTE_PREFIX: &str = "/video/";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum VideoPathError {
    #[error("Video path is empty")]
    Empty,
    #[error("Path traversal is not allowed")]
    Traversal,
    #[error("Path is outside the video storage directory")]
    OutsideStorage,
}

/// Map a requested video path onto a file under `uploads_dir`
///
/// The path may be absolute or relative and use either separator. It must
/// contain a segment equal to the storage directory name; only the part
/// after the last such segment is used. `.` and `..` segments are refused
/// everywhere.
pub fn resolve_video_path(uploads_dir: &Path, raw: &str) -> Result<PathBuf, VideoPathError> {
    let storage = uploads_dir
        .file_name()
        .and_then(|name| name.to_str())
        .ok_or(VideoPathError::OutsideStorage)?;

    let segments: Vec<&str> = raw
        .split(|c| c == '/' || c == '\\')
        .filter(|s| !s.is_empty())
        .collect();
    if segments.is_empty() {
        return Err(VideoPathError::Empty);
    }
    if segments.iter().any(|s| *s == ".." || *s == ".") {
        return Err(VideoPathError::Traversal);
    }

    let storage_index = segments
        .iter()
        .rposition(|s| *s == storage)
        .ok_or(VideoPathError::OutsideStorage)?;
    let remainder = &segments[storage_index + 1..];
    if remainder.is_empty() {
        return Err(VideoPathError::Empty);
    }
    // Drive letters are only tolerated ahead of the storage segment
    if remainder.iter().any(|s| s.contains(':')) {
        return Err(VideoPathError::Traversal);
    }

    let mut path = uploads_dir.to_path_buf();
    for segment in remainder {
        path.push(segment);
    }
    Ok(path)
}

pub fn content_type_for(path: &Path) -> &'static str {
    match path
        .extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| ext.to_ascii_lowercase())
        .as_deref()
    {
        Some("webm") => "video/webm",
        Some("mov") => "video/quicktime",
        _ => "video/mp4",
    }
}

/// URL under which a stored file path is served
pub fn playback_url(file_path: &str) -> String {
    let normalized = file_path.replace('\\', "/");
    format!(
        "{}{}",
        VIDEO_ROUTE_PREFIX,
        normalized.trim_start_matches('/')
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn uploads() -> PathBuf {
        PathBuf::from("/srv/app/uploads")
    }

    #[test]
    fn absolute_unix_path_resolves_under_storage() {
        let resolved = resolve_video_path(&uploads(), "home/me/project/uploads/video_1_abc.webm");
        assert_eq!(resolved, Ok(PathBuf::from("/srv/app/uploads/video_1_abc.webm")));
    }

    #[test]
    fn windows_path_with_drive_resolves() {
        let resolved =
            resolve_video_path(&uploads(), r"C:\Users\me\app\uploads\video_2_def.mp4");
        assert_eq!(resolved, Ok(PathBuf::from("/srv/app/uploads/video_2_def.mp4")));
    }

    #[test]
    fn paths_without_storage_segment_are_rejected() {
        for raw in ["etc/passwd", "video.webm", "uploadsx/video.webm", "home/uploads2/a.webm"] {
            assert_eq!(
                resolve_video_path(&uploads(), raw),
                Err(VideoPathError::OutsideStorage),
                "path {:?} should be rejected",
                raw
            );
        }
    }

    #[test]
    fn traversal_is_rejected_even_with_storage_segment() {
        for raw in [
            "uploads/../../etc/passwd",
            "../uploads/video.webm",
            r"uploads\..\secret.txt",
            "uploads/./video.webm",
        ] {
            assert_eq!(
                resolve_video_path(&uploads(), raw),
                Err(VideoPathError::Traversal),
                "path {:?} should be rejected",
                raw
            );
        }
    }

    #[test]
    fn storage_directory_itself_is_not_a_file() {
        assert_eq!(
            resolve_video_path(&uploads(), "app/uploads/"),
            Err(VideoPathError::Empty)
        );
        assert_eq!(resolve_video_path(&uploads(), ""), Err(VideoPathError::Empty));
    }

    #[test]
    fn content_types_follow_extension() {
        assert_eq!(content_type_for(Path::new("a.webm")), "video/webm");
        assert_eq!(content_type_for(Path::new("a.MOV")), "video/quicktime");
        assert_eq!(content_type_for(Path::new("a.mp4")), "video/mp4");
        assert_eq!(content_type_for(Path::new("a")), "video/mp4");
    }

    #[test]
    fn playback_url_normalizes_separators() {
        assert_eq!(
            playback_url("/srv/app/uploads/video_1.webm"),
            "/video/srv/app/uploads/video_1.webm"
        );
        assert_eq!(
            playback_url(r"C:\app\uploads\video_1.webm"),
            "/video/C:/app/uploads/video_1.webm"
        );
    }
}
