use axum_server::tls_rustls::RustlsConfig;
use clap::Parser;
use log::{error, info};
use mosaic_server::config::ServerConfig;
use mosaic_server::coordinator::Coordinator;
use mosaic_server::trivia::QuestionBank;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use uuid::Uuid;

const SHUTDOWN_GRACE_SECS: u64 = 5;

/// Parses configuration, loads the question bank and serves until Ctrl+C.
#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let config = ServerConfig::parse();

    let questions = QuestionBank::load_dir(&config.trivia_dir)?;
    if questions.is_empty() {
        return Err(format!(
            "no trivia questions found under {}",
            config.trivia_dir.display()
        )
        .into());
    }
    info!("Loaded {} trivia questions", questions.len());

    let host_token = config.host_token.clone().unwrap_or_else(|| {
        let generated = Uuid::new_v4().to_string();
        info!("No host token configured, generated {}", generated);
        generated
    });
    info!("Host endpoint: /ws/host/{}", host_token);

    let coordinator = Arc::new(Coordinator::new(
        config.settings(),
        Arc::new(questions),
        host_token,
        config.origins(),
    ));

    let mut server = match config.tls_paths() {
        Some((cert, key)) => {
            let tls = RustlsConfig::from_pem_file(&cert, &key).await?;
            let address: SocketAddr = config.address().parse()?;
            let coordinator = Arc::clone(&coordinator);
            tokio::spawn(async move { coordinator.serve_tls(address, tls).await })
        }
        None => {
            let listener = TcpListener::bind(config.address()).await?;
            let coordinator = Arc::clone(&coordinator);
            tokio::spawn(async move { coordinator.serve(listener).await })
        }
    };

    // Handle shutdown gracefully
    tokio::select! {
        result = &mut server => {
            match result {
                Ok(Ok(())) => info!("Server stopped"),
                Ok(Err(e)) => error!("Server failed: {}", e),
                Err(e) => error!("Server task panicked: {}", e),
            }
            return Ok(());
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down gracefully...");
            coordinator.shutdown();
        }
    }

    if tokio::time::timeout(Duration::from_secs(SHUTDOWN_GRACE_SECS), server)
        .await
        .is_err()
    {
        info!("Connections still open after {}s, exiting", SHUTDOWN_GRACE_SECS);
    }
    Ok(())
}
