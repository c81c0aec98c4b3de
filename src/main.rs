#[tokio::main]
async fn main() {
    if let Err(e) = medintel_lib::run().await {
        tracing::error!(error = %e, "MedIntel worker exited with error");
        eprintln!("medintel-worker: {e}");
        std::process::exit(1);
    }
}
