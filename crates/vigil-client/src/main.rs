#[tokio::main]
async fn main() -> anyhow::Result<()> {
    vigil_client_lib::run().await
}
