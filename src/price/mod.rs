use async_trait::async_trait;
use dashmap::DashMap;
use reqwest::Client;
use serde::Deserialize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};
use url::Url;

use crate::config::PriceApiConfig;
use crate::error::PriceError;

/// Upstream market data.
#[async_trait]
pub trait PriceSource: Send + Sync {
    async fn fetch(&self, symbol: &str) -> Result<f64, PriceError>;

    fn name(&self) -> &str;
}

#[derive(Debug, Clone, PartialEq)]
pub struct PriceData {
    pub symbol: String,
    pub price: f64,
    pub source: String,
}

/// Per-symbol cache with a fixed time-to-live.
#[derive(Debug)]
pub struct PriceCache {
    entries: DashMap<String, (PriceData, Instant)>,
    ttl: Duration,
}

impl PriceCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: DashMap::new(),
            ttl,
        }
    }

    pub fn get(&self, symbol: &str) -> Option<PriceData> {
        let key = symbol.to_uppercase();
        let age = self.entries.get(&key).map(|e| e.value().1.elapsed())?;

        if age > self.ttl {
            debug!("Cache expired for {} (age: {:.1}s)", key, age.as_secs_f64());
            self.entries.remove(&key);
            return None;
        }

        debug!("Cache hit for {} (age: {:.1}s)", key, age.as_secs_f64());
        self.entries.get(&key).map(|e| e.value().0.clone())
    }

    pub fn set(&self, data: PriceData) {
        debug!("Cached {} at {}", data.symbol, data.price);
        self.entries.insert(data.symbol.to_uppercase(), (data, Instant::now()));
    }

    pub fn clear(&self) {
        self.entries.clear();
        debug!("Cache cleared");
    }
}

#[derive(Debug, Deserialize)]
struct StockPricesResponse {
    #[serde(default)]
    data: Vec<StockPriceRow>,
}

#[derive(Debug, Deserialize)]
struct StockPriceRow {
    code: Option<String>,
    date: Option<String>,
    close: Option<f64>,
}

/// VNDirect finfo `stock_prices` endpoint. Prices are quoted in thousands of VND.
pub struct VndirectClient {
    client: Client,
    base_url: String,
    max_retries: u32,
}

impl VndirectClient {
    pub fn new(config: &PriceApiConfig) -> Result<Self, PriceError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;
        info!("VndirectClient initialized ({})", config.base_url);

        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            max_retries: config.max_retries,
        })
    }

    fn request_url(&self, symbol: &str) -> Result<Url, PriceError> {
        let query = format!("code:{}", symbol);
        Ok(Url::parse_with_params(
            &format!("{}/v4/stock_prices", self.base_url),
            &[("sort", "date"), ("q", query.as_str()), ("size", "1"), ("page", "1")],
        )?)
    }

    async fn fetch_once(&self, symbol: &str) -> Result<f64, PriceError> {
        let url = self.request_url(symbol)?;
        let response = self.client.get(url).send().await?;

        let status = response.status();
        if !status.is_success() {
            return Err(PriceError::Status(status.as_u16()));
        }

        let body: StockPricesResponse = response.json().await?;
        parse_latest_close(symbol, body)
    }
}

fn parse_latest_close(symbol: &str, body: StockPricesResponse) -> Result<f64, PriceError> {
    let row = body
        .data
        .into_iter()
        .find(|row| {
            row.code
                .as_deref()
                .map(|c| c.eq_ignore_ascii_case(symbol))
                .unwrap_or(true)
        })
        .ok_or_else(|| PriceError::NoData(symbol.to_string()))?;

    let price = row.close.ok_or_else(|| PriceError::NoData(symbol.to_string()))?;
    if !price.is_finite() || price < 0.0 {
        return Err(PriceError::InvalidPrice {
            symbol: symbol.to_string(),
            price,
        });
    }

    debug!("{} close {} on {}", symbol, price, row.date.as_deref().unwrap_or("?"));
    Ok(price)
}

#[async_trait]
impl PriceSource for VndirectClient {
    async fn fetch(&self, symbol: &str) -> Result<f64, PriceError> {
        let symbol = symbol.to_uppercase();
        let mut attempt = 0;

        loop {
            match self.fetch_once(&symbol).await {
                Ok(price) => {
                    info!("{}: {} (vnd)", symbol, price);
                    return Ok(price);
                }
                // Bad data will not improve on retry.
                Err(e @ (PriceError::NoData(_) | PriceError::InvalidPrice { .. })) => return Err(e),
                Err(e) if attempt < self.max_retries => {
                    attempt += 1;
                    warn!("Price fetch for {} failed (attempt {}/{}): {}", symbol, attempt, self.max_retries, e);
                    tokio::time::sleep(Duration::from_millis(500 * u64::from(attempt))).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn name(&self) -> &str {
        "vnd"
    }
}

/// Serves recent prices from a [`PriceCache`] before asking the inner source.
pub struct CachedPriceSource {
    inner: Arc<dyn PriceSource>,
    cache: PriceCache,
}

impl CachedPriceSource {
    pub fn new(inner: Arc<dyn PriceSource>, ttl: Duration) -> Self {
        info!("PriceService initialized with {} (cache TTL: {}s)", inner.name(), ttl.as_secs());
        Self {
            inner,
            cache: PriceCache::new(ttl),
        }
    }

    pub fn cache(&self) -> &PriceCache {
        &self.cache
    }

    pub async fn get_price(&self, symbol: &str) -> Result<PriceData, PriceError> {
        if let Some(cached) = self.cache.get(symbol) {
            return Ok(cached);
        }

        debug!("Cache miss - fetching fresh price for {}", symbol);
        let price = self.inner.fetch(symbol).await?;
        let data = PriceData {
            symbol: symbol.to_uppercase(),
            price,
            source: self.inner.name().to_string(),
        };
        self.cache.set(data.clone());
        Ok(data)
    }
}

#[async_trait]
impl PriceSource for CachedPriceSource {
    async fn fetch(&self, symbol: &str) -> Result<f64, PriceError> {
        Ok(self.get_price(symbol).await?.price)
    }

    fn name(&self) -> &str {
        self.inner.name()
    }
}

/// Builds the configured provider wrapped in the TTL cache.
pub fn from_config(config: &PriceApiConfig) -> Result<Arc<dyn PriceSource>, PriceError> {
    if config.provider != "vnd" {
        warn!("Unknown price provider '{}', falling back to vnd", config.provider);
    }
    let provider: Arc<dyn PriceSource> = Arc::new(VndirectClient::new(config)?);
    Ok(Arc::new(CachedPriceSource::new(
        provider,
        Duration::from_secs(config.cache_ttl_secs),
    )))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingSource {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl PriceSource for CountingSource {
        async fn fetch(&self, _symbol: &str) -> Result<f64, PriceError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(16.0 + n as f64)
        }

        fn name(&self) -> &str {
            "counting"
        }
    }

    #[tokio::test]
    async fn test_cache_serves_within_ttl() {
        let inner = Arc::new(CountingSource {
            calls: AtomicUsize::new(0),
        });
        let source = CachedPriceSource::new(inner.clone(), Duration::from_secs(60));

        assert_eq!(source.fetch("shb").await.unwrap(), 16.0);
        assert_eq!(source.fetch("SHB").await.unwrap(), 16.0);
        assert_eq!(inner.calls.load(Ordering::SeqCst), 1);

        source.cache().clear();
        assert_eq!(source.fetch("SHB").await.unwrap(), 17.0);
    }

    #[tokio::test]
    async fn test_cache_expires() {
        let inner = Arc::new(CountingSource {
            calls: AtomicUsize::new(0),
        });
        let source = CachedPriceSource::new(inner.clone(), Duration::from_millis(0));
        source.fetch("SHB").await.unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;
        source.fetch("SHB").await.unwrap();
        assert_eq!(inner.calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_parse_latest_close() {
        let body: StockPricesResponse = serde_json::from_str(
            r#"{"data":[{"code":"SHB","date":"2026-01-20","close":16.05,"open":15.9}],"currentPage":1}"#,
        )
        .unwrap();
        assert_eq!(parse_latest_close("SHB", body).unwrap(), 16.05);

        let empty: StockPricesResponse = serde_json::from_str(r#"{"data":[]}"#).unwrap();
        assert!(matches!(parse_latest_close("SHB", empty), Err(PriceError::NoData(_))));

        let negative: StockPricesResponse =
            serde_json::from_str(r#"{"data":[{"code":"SHB","close":-1.0}]}"#).unwrap();
        assert!(matches!(
            parse_latest_close("SHB", negative),
            Err(PriceError::InvalidPrice { .. })
        ));
    }

    #[test]
    fn test_request_url() {
        let client = VndirectClient::new(&PriceApiConfig::default()).unwrap();
        let url = client.request_url("SHB").unwrap();
        assert_eq!(url.path(), "/v4/stock_prices");
        assert!(url.query().unwrap().contains("q=code%3ASHB"));
    }
}
