//! A list of posts kept fresh across a write.
//!
//! Run with `RUST_LOG=refetch=debug cargo run --example posts` to watch the
//! cache and the executor at work.

use refetch::prelude::*;
use refetch::transport::mock::MockTransport;
use serde::Deserialize;
use serde_json::json;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Deserialize)]
struct Post {
    id: u32,
    title: String,
}

async fn wait(query: &Query) -> FetchState {
    let mut states = query.subscribe();
    let state = states
        .wait_for(|state| !state.fetching)
        .await
        .map(|state| state.clone())
        .unwrap_or_default();
    state
}

#[tokio::main]
async fn main() -> Result<(), FetchError> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let api = MockTransport::new();
    api.respond(
        "https://api.example.com/posts",
        200,
        json!([{ "id": 1, "title": "Hello" }]),
    );
    api.respond(
        "https://api.example.com/posts/new",
        201,
        json!({ "id": 2, "title": "Second" }),
    );

    let client = Client::with_config(
        api.clone(),
        ClientConfig::new()
            .with_base_url("https://api.example.com")
            .with_fetch_options(RequestOptions::new().with_header("accept", "application/json")),
    );

    let posts = client.query("/posts", QueryOptions::new(["posts"]));
    posts.activate();
    let before: Option<Vec<Post>> = wait(&posts).await.data_as()?;
    println!("before: {before:?}");

    // The server now returns both posts.
    api.respond(
        "https://api.example.com/posts",
        200,
        json!([{ "id": 1, "title": "Hello" }, { "id": 2, "title": "Second" }]),
    );
    let create = client.mutation(
        "/posts/new",
        MutationOptions::new(["posts"])
            .with_fetch_options(RequestOptions::new().with_body(r#"{"title":"Second"}"#)),
    );
    create.invoke(Overrides::default()).await?;

    let after: Option<Vec<Post>> = wait(&posts).await.data_as()?;
    for post in after.unwrap_or_default() {
        println!("after: #{} {}", post.id, post.title);
    }
    println!("requests sent: {}", api.call_count());

    posts.deactivate();
    Ok(())
}
