use newsdigest::embedding::remote::RemoteEmbeddingProvider;
use newsdigest::embedding::{EmbeddingProvider, RunEmbedder};
use std::sync::Arc;

#[tokio::test]
async fn test_remote_embedding_with_mock() {
    let mut server = mockito::Server::new_async().await;

    let mock = server
        .mock("POST", "/embeddings")
        .match_header("authorization", "Bearer fake-api-key")
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(
            r#"{
                "object": "list",
                "data": [{"object": "embedding", "index": 0, "embedding": [0.1, 0.2, 0.3]}],
                "model": "multilingual-e5",
                "usage": {"prompt_tokens": 4, "total_tokens": 4}
            }"#,
        )
        .create_async()
        .await;

    let provider = RemoteEmbeddingProvider::new(server.url(), "multilingual-e5").with_api_key("fake-api-key");
    assert_eq!(provider.endpoint(), format!("{}/embeddings", server.url()));

    let vector = provider.embed("新光金控q4獲利創新高").await.expect("embedding");
    assert_eq!(vector, vec![0.1, 0.2, 0.3]);
    assert_eq!(provider.model(), "multilingual-e5");

    mock.assert_async().await;
}

#[tokio::test]
async fn test_remote_embedding_error_status() {
    let mut server = mockito::Server::new_async().await;

    let _mock = server
        .mock("POST", "/embeddings")
        .with_status(500)
        .with_body("Internal Server Error")
        .create_async()
        .await;

    let provider = RemoteEmbeddingProvider::new(server.url(), "m");
    let result = provider.embed("text").await;

    assert!(result.is_err());
    assert!(result.unwrap_err().to_string().contains("500"));
}

#[tokio::test]
async fn test_remote_embedding_memoized_per_run() {
    let mut server = mockito::Server::new_async().await;

    // A second identical request would fail the expectation
    let mock = server
        .mock("POST", "/embeddings")
        .with_status(200)
        .with_body("[1.0, 0.0]")
        .expect(1)
        .create_async()
        .await;

    let provider = Arc::new(RemoteEmbeddingProvider::new(server.url(), "m"));
    let mut embedder = RunEmbedder::new(provider, 3);
    let a = embedder.embed("same text").await.unwrap();
    let b = embedder.embed("same text").await.unwrap();
    assert_eq!(a, b);

    mock.assert_async().await;
}

#[tokio::test]
async fn test_remote_embedding_unreachable_endpoint() {
    // Nothing listens on this port
    let provider = RemoteEmbeddingProvider::new("http://127.0.0.1:9", "m").with_timeout(2);
    assert!(provider.embed("text").await.is_err());
}
