use clap::Parser;
use server::classifier::SentinelClassifier;
use server::network::Server;
use server::service::GameService;
use server::store::PlayerStore;
use std::sync::Arc;

/// Main-method of the application.
/// Parses command-line arguments, opens the durable store and runs the
/// UDP server loop.
#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    // Command line arguments
    #[derive(Parser, Debug)]
    #[clap(author, version, about)]
    struct Args {
        /// Server IP address to bind to
        #[clap(short = 'H', long, default_value = "127.0.0.1")]
        host: String,
        /// Server port to listen on
        #[clap(short, long, default_value = "8080")]
        port: u16,
        /// Path to the SQLite database
        #[clap(short, long, default_value = "keyrush.db")]
        db: String,
        /// Allowed client origins (repeatable)
        #[clap(short, long, default_value = "http://localhost:3000")]
        origin: Vec<String>,
    }

    let args = Args::parse();

    let store = Arc::new(PlayerStore::open(&args.db)?);
    let (service, push_rx) = GameService::new(store, Box::new(SentinelClassifier));

    let address = format!("{}:{}", args.host, args.port);
    let mut server = Server::new(&address, service, push_rx, args.origin).await?;

    tokio::select! {
        result = server.run() => {
            if let Err(e) = result {
                eprintln!("Server loop failed: {}", e);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            println!("Received Ctrl+C, shutting down gracefully...");
        }
    }

    Ok(())
}
