use clap::Parser;

#[tokio::main]
async fn main() {
    let cli = wprofctl::Cli::parse();
    if let Err(err) = wprofctl::run(cli).await {
        eprintln!("error: {err}");
        std::process::exit(1);
    }
}
