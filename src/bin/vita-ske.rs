//! Entry point for the `vita-ske` key manager binary.

use vita_ske::cli::CliApp;

#[tokio::main]
async fn main() {
    if let Err(err) = CliApp::new().run().await {
        eprintln!("vita-ske: {err}");
        std::process::exit(1);
    }
}
