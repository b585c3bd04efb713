mod api;
mod climate;
mod coordinator;
mod entity;
mod host;
mod mqtt_bridge;
mod service;
mod store;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    host::run().await
}
