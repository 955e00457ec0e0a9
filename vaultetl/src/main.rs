#[tokio::main]
async fn main() {
    if let Err(err) = vaultetl::run_cli().await {
        eprintln!("Error: {err:#}");
        std::process::exit(1);
    }
}
