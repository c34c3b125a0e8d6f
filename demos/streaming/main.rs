use std::time::Duration;

use flagsync::{Client, ClientConfig, Context, SyncMode};

pub fn main() -> flagsync::Result<()> {
    env_logger::init();

    let url = std::env::var("FLAGSYNC_URL").unwrap_or_else(|_| "http://localhost:4242/api".to_owned());
    let token = std::env::var("FLAGSYNC_TOKEN").unwrap_or_default();

    let client = Client::new(
        ClientConfig::new(url, "streaming-demo")
            .instance_id("local-streaming-cli")
            .custom_http_header("Authorization", token)
            .mode(SyncMode::Streaming)
            .metrics_interval(Duration::from_secs(2)),
    )?;

    let context = Context::new().with_user_id("123");
    for _ in 0..30 {
        // Evaluations are served from memory and reflect pushed updates as they arrive.
        let enabled = client.is_enabled("example-flag", &context);
        println!("example-flag enabled: {enabled} (streaming: {})", client.is_streaming());
        std::thread::sleep(Duration::from_secs(1));
    }

    client.shutdown()
}
