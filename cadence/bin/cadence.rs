#[cfg(not(unix))]
compile_error!("Only unix is currently supported");

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    cadence::Cadence::load()?.run().await
}
