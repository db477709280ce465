use clap::Parser;
use middleman_http::serve;

#[derive(Parser)]
#[command(name = "middleman", about = "Multi-tenant synchronization gateway")]
struct Cli {
    /// Root of the outbox, archive, cache and gateway.json.
    #[arg(long, env = "MIDDLEMAN_DATA_DIR", default_value = "./data")]
    data_dir: String,
    /// Listen address; overrides bind_addr from gateway.json.
    #[arg(long, env = "MIDDLEMAN_BIND_ADDR")]
    bind_addr: Option<String>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    std::env::set_var("MIDDLEMAN_DATA_DIR", &cli.data_dir);
    if let Some(addr) = &cli.bind_addr {
        std::env::set_var("MIDDLEMAN_BIND_ADDR", addr);
    }
    serve().await
}
