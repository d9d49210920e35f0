mod app;
mod dispatch;
mod types;

#[tokio::main]
async fn main() {
    app::run().await;
}
