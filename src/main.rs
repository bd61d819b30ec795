mod app;
mod normalize;
mod realtime;
mod reconcile;
mod store;
mod types;

#[tokio::main]
async fn main() {
    app::run().await;
}
