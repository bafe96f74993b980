/// Smoke-test for `BrowserFetcher`.
///
/// Launches a headless Chromium, fetches <https://example.com> through a
/// direct identity, and checks the rendered HTML and the screenshot.
///
/// Run with:
///   cargo run -p argus-client --example browser_smoke --features browser
use argus_client::BrowserFetcher;
use argus_core::pool::{IdentityPool, LeaseOutcome, PoolConfig};
use argus_core::traits::PageFetcher;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt().with_env_filter("info").init();

    let fetcher = BrowserFetcher::new();
    let pool = IdentityPool::direct(1, PoolConfig::default());
    let lease = pool.acquire("example.com").await?;

    let url = "https://example.com";
    println!("Fetching {url} …");
    let page = fetcher.fetch(url, &lease).await?;
    pool.release(
        lease,
        LeaseOutcome::Success {
            session_state: page.session_state.clone(),
        },
    )?;

    assert!(
        page.html.contains("<h1>Example Domain</h1>"),
        "Expected <h1> not found in rendered HTML"
    );
    let png = page
        .screenshot
        .as_deref()
        .ok_or_else(|| anyhow::anyhow!("no screenshot captured"))?;
    assert!(png.starts_with(b"\x89PNG"), "screenshot is not a PNG");

    println!(
        "OK: {} bytes of HTML, {} byte screenshot",
        page.html.len(),
        png.len()
    );
    Ok(())
}
