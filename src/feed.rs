//! Market data retrieval.
//!
//! The rest of the system only sees `CandleSource`: an ordered OHLC
//! series for a symbol, or nothing. Venue specifics (endpoints, row
//! formats, availability) stay behind this trait, and every soft failure
//! collapses to `Ok(None)` so a symbol is simply skipped for the cycle.

use anyhow::Result;
use async_trait::async_trait;
use serde_json::Value;

#[derive(Debug, Clone, Copy)]
pub struct Candle {
    pub ts: u64,
    pub o: f64,
    pub h: f64,
    pub l: f64,
    pub c: f64,
    pub v: f64,
}

#[async_trait]
pub trait CandleSource {
    /// Ordered candle series, oldest first, truncated to `limit`. `None`
    /// when the venue has no usable data this cycle.
    async fn fetch_candles(
        &self,
        symbol: &str,
        granularity_secs: u64,
        limit: usize,
    ) -> Result<Option<Vec<Candle>>>;
}

/// Venue without a wired data client. Symbols on it are skipped each
/// cycle rather than failing the loop.
pub struct NullSource;

#[async_trait]
impl CandleSource for NullSource {
    async fn fetch_candles(&self, _: &str, _: u64, _: usize) -> Result<Option<Vec<Candle>>> {
        Ok(None)
    }
}

/// Public candle endpoints, spot first, derivatives as fallback.
pub struct HttpFeed {
    client: reqwest::Client,
    endpoints: Vec<String>,
}

impl HttpFeed {
    pub fn new(base: &str) -> Self {
        Self {
            client: reqwest::Client::new(),
            endpoints: vec![
                format!("{}/api/spot/v1/market/candles", base),
                format!("{}/api/mix/v1/market/candles", base),
            ],
        }
    }
}

/// Decode a `data` row array into candles: `[ts, o, h, l, c, (v)]` with
/// string or numeric cells, second- or millisecond-scale timestamps.
/// Unusable rows are dropped; an empty result reads as no data.
pub(crate) fn parse_rows(body: &Value, limit: usize) -> Option<Vec<Candle>> {
    let rows = body.get("data")?.as_array()?;
    let mut candles: Vec<Candle> = rows
        .iter()
        .filter_map(|row| {
            let cell = |i: usize| -> Option<f64> {
                let v = row.get(i)?;
                v.as_f64().or_else(|| v.as_str()?.parse().ok())
            };
            let ts_raw = cell(0)?;
            let ts = if ts_raw > 1e10 { (ts_raw / 1000.0) as u64 } else { ts_raw as u64 };
            Some(Candle {
                ts,
                o: cell(1)?,
                h: cell(2)?,
                l: cell(3)?,
                c: cell(4)?,
                v: cell(5).unwrap_or(0.0),
            })
        })
        .collect();
    if candles.is_empty() {
        return None;
    }
    candles.sort_by_key(|c| c.ts);
    if candles.len() > limit {
        candles.drain(..candles.len() - limit);
    }
    Some(candles)
}

#[async_trait]
impl CandleSource for HttpFeed {
    async fn fetch_candles(
        &self,
        symbol: &str,
        granularity_secs: u64,
        limit: usize,
    ) -> Result<Option<Vec<Candle>>> {
        for url in &self.endpoints {
            let resp = match self
                .client
                .get(url)
                .query(&[("symbol", symbol), ("granularity", &granularity_secs.to_string())])
                .send()
                .await
            {
                Ok(r) => r,
                Err(_) => continue,
            };
            if !resp.status().is_success() {
                continue;
            }
            let body: Value = match resp.json().await {
                Ok(v) => v,
                Err(_) => continue,
            };
            if let Some(candles) = parse_rows(&body, limit) {
                return Ok(Some(candles));
            }
        }
        Ok(None)
    }
}
