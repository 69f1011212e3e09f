use clap::Parser;
use presence_sync::{config::RelayConfig, server::App};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .init();

    let app = App::new(RelayConfig::parse());
    app.run().await?;

    Ok(())
}
