pub mod agent;
pub mod cli;
pub mod config;
pub mod error;
pub mod llm;
pub mod models;
pub mod server;
pub mod session;
pub mod store;
pub mod upload;

use agent::EcgAgent;
use cli::Args;
use log::info;
use server::Server;
use std::error::Error;
use std::sync::Arc;

pub async fn run(args: Args) -> Result<(), Box<dyn Error + Send + Sync>> {
    info!("--- Core Configuration ---");
    info!("Server Address: {}", args.server_addr);
    info!("HTTP Port: {}", args.http_port);
    info!("Gemini Model: {}", args.gemini_model);
    info!("Store Type: {}", args.store_type);
    if args.store_type == "firebase" {
        info!("Firebase Database: {}", args.firebase_database_url);
        info!("Firebase Storage Bucket: {}", args.firebase_storage_bucket.as_deref().unwrap_or("(none)"));
    }
    info!("History Load Limit: {}", args.history_load_limit);
    info!("Chat Scope: {}", args.chat_scope);
    info!("Chat Context Messages: {}", args.chat_context_messages);
    info!("Prompts Path: {}", args.prompts_path.as_deref().unwrap_or("(built-in)"));
    info!("Max Upload Bytes: {}", args.max_upload_bytes);
    info!("TLS Enabled: {}", args.enable_tls);
    info!("API Key Required: {}", args.server_api_key.is_some());
    info!("-------------------------");

    let agent = Arc::new(EcgAgent::new(&args).await?);
    let addr = args.server_addr.clone();
    info!("Starting server on: {}", addr);
    let server = Server::new(addr, agent, args);
    server.run().await?;

    Ok(())
}
