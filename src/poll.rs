use std::time::Duration;

use log::{debug, info, warn};
use tokio::time::{sleep, Instant};

use crate::error::AnalysisError;
use crate::provider::{FileState, GenerativeProvider, RemoteFile};

/// Bounds for waiting on provider-side file processing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollPolicy {
    /// Delay between state checks
    pub interval: Duration,
    /// Maximum number of state checks after the upload
    pub max_attempts: u32,
    /// Wall-clock budget measured from the first check
    pub deadline: Duration,
}

impl Default for PollPolicy {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(1),
            max_attempts: 120,
            deadline: Duration::from_secs(300),
        }
    }
}

/// Re-fetch `file` until it leaves the processing state
///
/// Returns the ready handle, `ProcessingFailed` if the provider reports
/// failure, and `Timeout` once either bound of `policy` is exhausted.
pub async fn wait_until_active(
    provider: &dyn GenerativeProvider,
    mut file: RemoteFile,
    policy: &PollPolicy,
) -> Result<RemoteFile, AnalysisError> {
    let started = Instant::now();
    let mut attempts = 0u32;

    while file.state == FileState::Processing {
        let elapsed = started.elapsed();
        if attempts >= policy.max_attempts || elapsed >= policy.deadline {
            warn!(
                "Giving up on {} after {} attempts ({:?})",
                file.name, attempts, elapsed
            );
            return Err(AnalysisError::Timeout {
                name: file.name,
                attempts,
                elapsed,
            });
        }
        sleep(policy.interval).await;
        attempts += 1;
        file = provider.get_file(&file.name).await?;
        debug!("{} state after attempt {}: {:?}", file.name, attempts, file.state);
    }

    match file.state {
        FileState::Failed => return Err(AnalysisError::ProcessingFailed { name: file.name }),
        // Unknown or missing states are treated as ready and left to the uri check
        FileState::Unspecified => warn!(
            "{} reported no known state after {} attempts, treating it as ready",
            file.name, attempts
        ),
        FileState::Active | FileState::Processing => {
            info!("{} ready after {} attempts", file.name, attempts)
        }
    }
    if file.uri.is_none() {
        return Err(AnalysisError::MissingUri(file.name));
    }
    Ok(file)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::mock::ScriptedProvider;

    fn fast_policy(max_attempts: u32) -> PollPolicy {
        PollPolicy {
            interval: Duration::from_millis(1),
            max_attempts,
            deadline: Duration::from_secs(5),
        }
    }

    fn processing(name: &str) -> RemoteFile {
        RemoteFile {
            name: name.to_string(),
            uri: None,
            mime_type: "video/webm".to_string(),
            state: FileState::Processing,
        }
    }

    #[tokio::test]
    async fn waits_through_processing_states() {
        // The first scripted state is consumed by the upload
        let provider = ScriptedProvider::new().with_file_states([
            FileState::Processing,
            FileState::Processing,
            FileState::Processing,
            FileState::Active,
        ]);
        let file = wait_until_active(&provider, processing("files/a"), &fast_policy(10))
            .await
            .unwrap();
        assert_eq!(file.state, FileState::Active);
        assert_eq!(file.uri.as_deref(), Some("mock://files/a"));
        assert_eq!(provider.poll_count(), 3);
    }

    #[tokio::test]
    async fn unknown_state_is_ready_only_with_a_uri() {
        let provider = ScriptedProvider::new();
        let mut file = processing("files/u");
        file.state = FileState::Unspecified;
        let err = wait_until_active(&provider, file.clone(), &fast_policy(10))
            .await
            .unwrap_err();
        assert!(matches!(err, AnalysisError::MissingUri(ref name) if name == "files/u"));

        file.uri = Some("mock://files/u".to_string());
        let ready = wait_until_active(&provider, file, &fast_policy(10))
            .await
            .unwrap();
        assert_eq!(ready.state, FileState::Unspecified);
        assert_eq!(provider.poll_count(), 0);
    }

    #[tokio::test]
    async fn failed_state_aborts() {
        let provider = ScriptedProvider::new()
            .with_file_states([FileState::Processing, FileState::Failed]);
        let err = wait_until_active(&provider, processing("files/b"), &fast_policy(10))
            .await
            .unwrap_err();
        assert!(matches!(err, AnalysisError::ProcessingFailed { .. }), "got {:?}", err);
    }

    #[tokio::test]
    async fn endless_processing_times_out_by_attempts() {
        let provider = ScriptedProvider::new().with_file_states([FileState::Processing]);
        let err = wait_until_active(&provider, processing("files/c"), &fast_policy(4))
            .await
            .unwrap_err();
        match err {
            AnalysisError::Timeout { attempts, .. } => assert_eq!(attempts, 4),
            other => panic!("expected timeout, got {:?}", other),
        }
        assert_eq!(provider.poll_count(), 4);
    }

    #[tokio::test]
    async fn endless_processing_times_out_by_deadline() {
        let provider = ScriptedProvider::new().with_file_states([FileState::Processing]);
        let policy = PollPolicy {
            interval: Duration::from_millis(5),
            max_attempts: u32::MAX,
            deadline: Duration::from_millis(30),
        };
        let err = wait_until_active(&provider, processing("files/d"), &policy)
            .await
            .unwrap_err();
        assert!(matches!(err, AnalysisError::Timeout { .. }));
    }

    #[tokio::test]
    async fn ready_upload_needs_no_polling() {
        let provider = ScriptedProvider::new();
        let file = RemoteFile {
            uri: Some("mock://files/e".to_string()),
            state: FileState::Active,
            ..processing("files/e")
        };
        wait_until_active(&provider, file, &fast_policy(1)).await.unwrap();
        assert_eq!(provider.poll_count(), 0);
    }
}
