use replichat::{cmd, Result};

#[tokio::main]
async fn main() -> Result<()> {
    cmd::process().await?;
    Ok(())
}
