use clap::Parser;

#[derive(Parser, Debug, Clone)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    // --- Gemini Args ---
    /// API key for the Gemini generative model API.
    #[arg(long, env = "GEMINI_API_KEY", default_value = "")]
    pub gemini_api_key: String,

    /// Model used for both image interpretation and text generation.
    #[arg(long, env = "GEMINI_MODEL", default_value = "gemini-2.5-flash")]
    pub gemini_model: String,

    /// Base URL of the Gemini REST API.
    #[arg(
        long,
        env = "GEMINI_BASE_URL",
        default_value = "https://generativelanguage.googleapis.com/v1beta"
    )]
    pub gemini_base_url: String,

    // --- Store Args ---
    /// Persistence backend for analyses and chats (none, memory, firebase, redis)
    #[arg(long, env = "STORE_TYPE", default_value = "none")]
    pub store_type: String,

    /// Firebase Realtime Database URL (e.g., https://my-project-default-rtdb.firebaseio.com/)
    #[arg(long, env = "FIREBASE_DATABASE_URL", default_value = "")]
    pub firebase_database_url: String,

    /// Firebase storage bucket. Reported in status only, uploads live in the database.
    #[arg(long, env = "FIREBASE_STORAGE_BUCKET")]
    pub firebase_storage_bucket: Option<String>,

    /// Service account key file. When missing the database is accessed anonymously.
    #[arg(long, env = "FIREBASE_SA_KEY_PATH")]
    pub firebase_sa_key_path: Option<String>,

    /// Redis URL for the redis store (e.g., redis://127.0.0.1:6379)
    #[arg(long, env = "REDIS_URL", default_value = "redis://127.0.0.1:6379")]
    pub redis_url: String,

    /// Prefix for Redis keys.
    #[arg(long, env = "REDIS_PREFIX", default_value = "ecg:")]
    pub redis_prefix: String,

    /// Maximum number of past analyses returned by "load history".
    #[arg(long, env = "HISTORY_LOAD_LIMIT", default_value = "10")]
    pub history_load_limit: usize,

    /// Number of base64 characters of the image kept as the stored thumbnail.
    #[arg(long, env = "THUMBNAIL_CHARS", default_value = "1000")]
    pub thumbnail_chars: usize,

    // --- Workflow Args ---
    /// Number of previous chat messages included in each chat prompt.
    #[arg(long, env = "CHAT_CONTEXT_MESSAGES", default_value = "20")]
    pub chat_context_messages: usize,

    /// Chat transcript scope: "analysis" clears it on each new analysis, "session" keeps one running transcript.
    #[arg(long, env = "CHAT_SCOPE", default_value = "analysis")]
    pub chat_scope: String,

    /// Path to an optional prompt template file. Built-in prompts are used when unset.
    #[arg(long, env = "PROMPTS_PATH")]
    pub prompts_path: Option<String>,

    /// Largest accepted image, in bytes after base64 decoding.
    #[arg(long, env = "MAX_UPLOAD_BYTES", default_value = "10485760")]
    pub max_upload_bytes: usize,

    // --- Server Args ---
    /// Host address and port for the WebSocket session server.
    #[arg(long, env = "SERVER_ADDR", default_value = "127.0.0.1:4000")]
    pub server_addr: String,

    /// Port for the HTTP server hosting the viewer page and REST API.
    #[arg(long, env = "HTTP_PORT", default_value = "8080")]
    pub http_port: u16,

    /// Optional API Key required for clients to connect to the WebSocket server.
    #[arg(long, env = "SERVER_API_KEY")]
    pub server_api_key: Option<String>,

    /// Optional path to the TLS certificate file (PEM format). Requires --tls-key-path.
    #[arg(long, env = "TLS_CERT_PATH")]
    pub tls_cert_path: Option<String>,

    /// Optional path to the TLS private key file (PEM format). Requires --tls-cert-path.
    #[arg(long, env = "TLS_KEY_PATH")]
    pub tls_key_path: Option<String>,

    #[arg(long, env = "ENABLE_TLS", default_value = "false")]
    pub enable_tls: bool,
}
