use newsdigest::embedding::remote::RemoteEmbeddingProvider;
use newsdigest::embedding::EmbeddingProvider;
use newsdigest::normalize::normalize_title;
use newsdigest::similarity::cosine_similarity;

/// Embed two headlines and print their cosine similarity, to help pick a
/// semantic threshold for a given model.
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .init();

    // Allow custom base URL or use OpenAI default
    let base_url = std::env::var("EMBEDDING_BASE_URL")
        .unwrap_or_else(|_| "https://api.openai.com/v1/embeddings".to_string());
    let model = std::env::var("EMBEDDING_MODEL")
        .unwrap_or_else(|_| "text-embedding-3-small".to_string());

    let mut args = std::env::args().skip(1);
    let first = args.next().unwrap_or_else(|| "新光金控Q4獲利創新高".to_string());
    let second = args.next().unwrap_or_else(|| "新光金控第四季獲利創新高".to_string());

    println!("\n{}", "=".repeat(60));
    println!("Testing embedding provider");
    println!("Base URL: {}", base_url);
    println!("Model: {}", model);
    println!("{}", "=".repeat(60));

    let mut provider = RemoteEmbeddingProvider::new(&base_url, &model).with_timeout(30);
    if let Ok(key) = std::env::var("EMBEDDING_API_KEY") {
        provider = provider.with_api_key(key);
    }

    let (a, b) = (normalize_title(&first), normalize_title(&second));
    let va = provider.embed(&a).await?;
    let vb = provider.embed(&b).await?;
    println!("✓ Success! ({} dimensions)", va.len());
    println!("  A: {}", a);
    println!("  B: {}", b);
    match cosine_similarity(&va, &vb) {
        Some(score) => println!("  Cosine similarity: {:.4}", score),
        None => println!("✗ Vectors are not comparable (dimension mismatch or zero norm)"),
    }
    Ok(())
}
