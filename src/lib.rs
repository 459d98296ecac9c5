pub mod cli;
pub mod client;
pub mod config;
pub mod llm;
pub mod models;
pub mod notes;
pub mod server;
pub mod stream;

use cli::{ Args, Command };
use log::info;
use server::{ api::AppState, Server };
use std::error::Error;

pub async fn run(args: Args) -> Result<(), Box<dyn Error + Send + Sync>> {
    match args.command.clone() {
        Some(Command::Ask(ask)) => client::ask(&args, &ask).await,
        Some(Command::Serve) | None => serve(args).await,
    }
}

async fn serve(args: Args) -> Result<(), Box<dyn Error + Send + Sync>> {
    info!("--- Core Configuration ---");
    info!("Server Address: {}", args.server_addr);
    info!("Chat LLM Type: {}", args.chat_llm_type);
    info!("Chat Base URL: {}", args.chat_base_url.as_deref().unwrap_or("(provider default)"));
    info!("Prompts Path: {}", args.prompts_path);
    info!("Stream Timeout: {}s", args.stream_timeout_secs);
    info!("Reasoning Markers: {} ... {}", args.think_open, args.think_close);
    info!("Rate Limit: {}/s", args.rate_limit_per_second);
    info!("TLS Enabled: {}", args.enable_tls);
    info!("-------------------------");

    let state = AppState::from_args(&args)?;
    let addr = args.server_addr.clone();
    info!("Starting server on: {}", addr);
    let server = Server::new(addr, state, args);
    server.run().await?;

    Ok(())
}
