use clap::Parser;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .with_writer(std::io::stderr)
        .init();

    let cli = airtimectl::Cli::parse();
    match airtimectl::run(cli).await {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("erro: {err}");
            std::process::exit(1);
        }
    }
}
