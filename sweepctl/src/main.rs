use clap::Parser;
use tracing_subscriber::EnvFilter;

fn main() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .try_init();

    let cli = sweepctl::Cli::parse();
    if let Err(err) = sweepctl::run(cli) {
        eprintln!("error: {err}");
        std::process::exit(1);
    }
}
