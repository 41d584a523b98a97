use tracing::error;
use tracing_subscriber::{EnvFilter, FmtSubscriber};
use vlanpool::commands::run_cni;

/// Log filter override, e.g. `VLANPOOL_LOG=vlanpool=debug`
const LOG_ENV: &str = "VLANPOOL_LOG";

fn main() {
    // stdout carries the result document, logs go to stderr.
    let filter = EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new("info"));
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .finish();

    let _ = tracing::subscriber::set_global_default(subscriber);

    // run_cni has already printed the error document.
    if let Err(err) = run_cni() {
        error!("CNI plugin error: {:#}", err);
        std::process::exit(1);
    }
}
