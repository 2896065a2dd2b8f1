use async_trait::async_trait;
use bytes::Bytes;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;

use articulator::capture::{
    CaptureAdapter, DeviceKind, MediaConstraints, MediaDevice, MediaPlatform, MediaStreamHandle,
    MemoryPreferenceStore,
};
use articulator::client::{BackendApi, HttpBackend, DEFAULT_SERVER_URL};
use articulator::config::ServerConfig;
use articulator::error::CaptureError;
use articulator::orchestrator::Orchestrator;
use articulator::recorder::format_elapsed;
use articulator::server;
use articulator::video_path::content_type_for;

/// Bytes handed to the recorder per chunk when replaying a file
const FILE_CHUNK_BYTES: usize = 256 * 1024;

#[derive(Parser, Debug)]
#[command(author, version, about = "Record a talk, get AI feedback on your articulation, chat about it")]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the HTTP server
    Serve {
        /// Path to config file (TOML format)
        #[arg(short, long)]
        config: PathBuf,

        /// Port to listen on (overrides config file)
        #[arg(short, long)]
        port: Option<u16>,
    },
    /// Analyze a video file through a running server
    Analyze {
        /// Video file to treat as the finished recording
        video: PathBuf,

        #[arg(long, default_value = DEFAULT_SERVER_URL)]
        server: String,
    },
    /// List stored chat sessions
    Sessions {
        #[arg(long, default_value = DEFAULT_SERVER_URL)]
        server: String,
    },
    /// Print the transcript of a session
    History {
        session_id: String,

        #[arg(long, default_value = DEFAULT_SERVER_URL)]
        server: String,
    },
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    match args.command {
        Command::Serve { config, port } => serve(config, port),
        Command::Analyze { video, server } => analyze(video, server),
        Command::Sessions { server } => sessions(server),
        Command::History { session_id, server } => history(session_id, server),
    }
}

fn serve(config_path: PathBuf, port_override: Option<u16>) -> Result<(), Box<dyn std::error::Error>> {
    let mut config = ServerConfig::load(&config_path)?;
    if let Some(port) = port_override {
        config.port = port;
    }
    server::serve(config)
}

/// A capture stream standing in for a camera when replaying a file
struct FileSourceStream {
    id: String,
}

impl MediaStreamHandle for FileSourceStream {
    fn id(&self) -> &str {
        &self.id
    }

    fn video_tracks(&self) -> usize {
        1
    }

    fn audio_tracks(&self) -> usize {
        1
    }

    fn stop(&self) {}
}

struct FileSourcePlatform {
    name: String,
}

#[async_trait]
impl MediaPlatform for FileSourcePlatform {
    async fn enumerate_devices(&self) -> Result<Vec<MediaDevice>, CaptureError> {
        Ok(vec![
            MediaDevice {
                device_id: "file-video".to_string(),
                kind: DeviceKind::VideoInput,
                label: self.name.clone(),
            },
            MediaDevice {
                device_id: "file-audio".to_string(),
                kind: DeviceKind::AudioInput,
                label: self.name.clone(),
            },
        ])
    }

    async fn get_user_media(
        &self,
        _constraints: &MediaConstraints,
    ) -> Result<Box<dyn MediaStreamHandle>, CaptureError> {
        Ok(Box::new(FileSourceStream {
            id: format!("file:{}", self.name),
        }))
    }
}

fn analyze(video: PathBuf, server_url: String) -> Result<(), Box<dyn std::error::Error>> {
    let data = std::fs::read(&video)
        .map_err(|e| format!("Failed to read video file '{}': {}", video.display(), e))?;
    if data.is_empty() {
        return Err(format!("Video file '{}' is empty", video.display()).into());
    }
    let mime_type = content_type_for(&video);
    let name = video
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| "video".to_string());

    println!("Analyzing: {} ({}, {} bytes)", video.display(), mime_type, data.len());
    println!("Server: {}", server_url);

    let platform = Arc::new(FileSourcePlatform { name });
    let capture = CaptureAdapter::new(platform, Box::new(MemoryPreferenceStore::default()));
    let mut orchestrator = Orchestrator::new(HttpBackend::new(server_url), capture, mime_type);

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(async {
        orchestrator.initialize().await?;
        orchestrator.start_recording()?;
        for chunk in data.chunks(FILE_CHUNK_BYTES) {
            orchestrator.push_chunk(Bytes::copy_from_slice(chunk));
        }
        orchestrator.stop_recording();

        orchestrator.analyze().await?;
        if let Some(session_id) = orchestrator.session_id() {
            println!("Chat session: {}", session_id);
        }
        if let Some(reply) = orchestrator.messages().last() {
            println!();
            println!("{}", reply.content);
        }
        Ok::<(), Box<dyn std::error::Error>>(())
    })
}

fn sessions(server_url: String) -> Result<(), Box<dyn std::error::Error>> {
    let backend = HttpBackend::new(server_url);
    let rt = tokio::runtime::Runtime::new()?;
    let sessions = rt.block_on(backend.list_sessions())?;

    if sessions.is_empty() {
        println!("No chat sessions");
        return Ok(());
    }
    for session in sessions {
        let updated = chrono::DateTime::from_timestamp_millis(session.updated_at_ms)
            .map(|t| t.format("%Y-%m-%d %H:%M").to_string())
            .unwrap_or_default();
        println!(
            "{}  {}  {} messages  {}",
            session.id,
            updated,
            session.message_count,
            session.title.as_deref().unwrap_or("(untitled)")
        );
    }
    Ok(())
}

fn history(session_id: String, server_url: String) -> Result<(), Box<dyn std::error::Error>> {
    let backend = HttpBackend::new(server_url);
    let rt = tokio::runtime::Runtime::new()?;
    let history = rt.block_on(backend.chat_history(&session_id))?;

    println!(
        "Session: {} {}",
        history.chat_session.id,
        history.chat_session.title.as_deref().unwrap_or("")
    );
    if let Some(video) = &history.chat_session.video {
        println!("Video: {}", backend.video_url(&video.file_path));
    }
    let started = history.chat_session.created_at_ms;
    for message in &history.messages {
        let offset = (message.created_at_ms - started).max(0) as u64 / 1000;
        println!();
        println!("[{}] {}:", format_elapsed(offset), message.role.as_str());
        println!("{}", message.content);
    }
    Ok(())
}

