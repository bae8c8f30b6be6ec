use anyhow::Result;

mod observability;

#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

#[tokio::main]
async fn main() -> Result<()> {
    observability::logging::init(observability::logging::LogFormat::Human);
    cloud_cli::run().await
}
