//! HTTP bar-service provider.
//!
//! Talks to a generic JSON endpoint:
//!
//! - `GET {base}/bars?symbol=&period=&start=&end=&limit=&order=asc|desc`
//! - `GET {base}/instruments?exchange=`
//!
//! Requests carry a bearer token and go through a shared circuit breaker.
//! There is no retry here; the fetch controller owns retry policy.

use chrono::{NaiveDate, NaiveDateTime, NaiveTime};
use reqwest::StatusCode;
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use super::circuit_breaker::CircuitBreaker;
use super::provider::{BarProvider, ProviderSession, QueryOutcome, WindowQuery};
use crate::domain::{BarRecord, Exchange, Instrument, Period};
use crate::error::SyncError;

const TS_FORMAT: &str = "%Y-%m-%dT%H:%M:%S";

#[derive(Debug, Deserialize)]
struct BarsResponse {
    #[serde(default)]
    bars: Vec<WireBar>,
    /// Set by the service when the window lies outside its coverage.
    #[serde(default)]
    exhausted: bool,
}

#[derive(Debug, Deserialize)]
struct WireBar {
    /// `YYYY-MM-DDTHH:MM:SS`, exchange wall-clock.
    datetime: String,
    open: f64,
    high: f64,
    low: f64,
    close: f64,
    #[serde(default)]
    settle: f64,
    #[serde(default)]
    volume: f64,
    #[serde(default)]
    turnover: f64,
    #[serde(default, alias = "close_oi")]
    open_interest: f64,
    #[serde(default)]
    open_interest_delta: f64,
}

#[derive(Debug, Deserialize)]
struct InstrumentsResponse {
    instruments: Vec<String>,
}

pub struct HttpProvider {
    client: reqwest::blocking::Client,
    base_url: String,
    token: Option<String>,
    circuit_breaker: Arc<CircuitBreaker>,
}

impl HttpProvider {
    pub fn new(
        base_url: impl Into<String>,
        token: Option<String>,
        timeout: Duration,
        circuit_breaker: Arc<CircuitBreaker>,
    ) -> Result<Self, SyncError> {
        let client = reqwest::blocking::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("barsync/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| SyncError::Config(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            token,
            circuit_breaker,
        })
    }

    fn bars_url(&self, q: &WindowQuery) -> String {
        format!(
            "{}/bars?symbol={}&period={}&start={}&end={}&limit={}&order={}",
            self.base_url,
            q.instrument,
            q.period.dir_name(),
            q.start.format(TS_FORMAT),
            q.end.format(TS_FORMAT),
            q.max_records,
            q.direction.order_param(),
        )
    }

    fn instruments_url(&self, exchange: Exchange) -> String {
        format!("{}/instruments?exchange={}", self.base_url, exchange)
    }

    /// Issue one GET and map transport/status failures onto the taxonomy.
    fn get(&self, url: &str) -> Result<reqwest::blocking::Response, SyncError> {
        if !self.circuit_breaker.is_allowed() {
            return Err(SyncError::CircuitBreakerTripped {
                remaining_secs: self.circuit_breaker.remaining_cooldown().as_secs(),
            });
        }

        let mut req = self.client.get(url);
        if let Some(token) = &self.token {
            req = req.bearer_auth(token);
        }
        debug!(url, "GET");

        let resp = match req.send() {
            Ok(resp) => resp,
            Err(e) => {
                self.circuit_breaker.record_failure();
                return Err(SyncError::ProviderConnection(e.to_string()));
            }
        };

        let status = resp.status();
        if status.is_success() {
            self.circuit_breaker.record_success();
            return Ok(resp);
        }

        let body = resp.text().unwrap_or_default();
        let detail = format!("HTTP {status}: {}", body.chars().take(200).collect::<String>());
        Err(classify_status(status, detail, &self.circuit_breaker))
    }
}

/// Status mapping shared by every endpoint.
fn classify_status(status: StatusCode, detail: String, breaker: &CircuitBreaker) -> SyncError {
    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => SyncError::Authentication(detail),
        StatusCode::BAD_REQUEST | StatusCode::NOT_FOUND | StatusCode::UNPROCESSABLE_ENTITY => {
            SyncError::ProviderWindow(detail)
        }
        StatusCode::TOO_MANY_REQUESTS => {
            warn!(%status, "provider is throttling");
            breaker.record_failure();
            SyncError::ProviderConnection(detail)
        }
        s if s.is_server_error() => {
            breaker.record_failure();
            SyncError::ProviderConnection(detail)
        }
        _ => SyncError::ProviderConnection(detail),
    }
}

fn parse_wire_bar(bar: WireBar, period: Period) -> Result<BarRecord, SyncError> {
    let ts = NaiveDateTime::parse_from_str(&bar.datetime, TS_FORMAT)
        .or_else(|_| {
            NaiveDate::parse_from_str(&bar.datetime, "%Y-%m-%d")
                .map(|d| d.and_time(NaiveTime::MIN))
        })
        .map_err(|e| {
            SyncError::ProviderConnection(format!("bad bar datetime '{}': {e}", bar.datetime))
        })?;
    let mut rec = BarRecord::at(ts, period);
    rec.open = bar.open;
    rec.high = bar.high;
    rec.low = bar.low;
    rec.close = bar.close;
    rec.settle = bar.settle;
    rec.volume = bar.volume;
    rec.turnover = bar.turnover;
    rec.open_interest = bar.open_interest;
    rec.open_interest_delta = bar.open_interest_delta;
    Ok(rec)
}

impl BarProvider for HttpProvider {
    fn name(&self) -> &str {
        "http"
    }

    fn open_session(&self) -> Result<Box<dyn ProviderSession + '_>, SyncError> {
        if !self.circuit_breaker.is_allowed() {
            return Err(SyncError::CircuitBreakerTripped {
                remaining_secs: self.circuit_breaker.remaining_cooldown().as_secs(),
            });
        }
        Ok(Box::new(HttpSession { provider: self }))
    }

    fn is_available(&self) -> bool {
        self.circuit_breaker.is_allowed()
    }
}

struct HttpSession<'a> {
    provider: &'a HttpProvider,
}

impl ProviderSession for HttpSession<'_> {
    fn query(&mut self, query: &WindowQuery) -> Result<QueryOutcome, SyncError> {
        let resp = self.provider.get(&self.provider.bars_url(query))?;
        let body: BarsResponse = resp.json().map_err(|e| {
            SyncError::ProviderConnection(format!("failed to parse bars for {}: {e}", query.instrument))
        })?;
        if body.exhausted && body.bars.is_empty() {
            return Ok(QueryOutcome::WindowExhausted);
        }

        let mut bars = body
            .bars
            .into_iter()
            .map(|b| parse_wire_bar(b, query.period))
            .collect::<Result<Vec<_>, _>>()?;
        // Descending responses are normalised to ascending.
        bars.sort_by_key(|b| b.key(query.period));
        Ok(QueryOutcome::Records(bars))
    }

    fn list_instruments(&mut self, exchange: Exchange) -> Result<Vec<Instrument>, SyncError> {
        let resp = self.provider.get(&self.provider.instruments_url(exchange))?;
        let body: InstrumentsResponse = resp
            .json()
            .map_err(|e| SyncError::ProviderConnection(format!("failed to parse instruments: {e}")))?;
        Ok(body
            .instruments
            .iter()
            .filter_map(|code| code.parse::<Instrument>().ok())
            .filter(|inst| inst.exchange == exchange)
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::Direction;

    fn breaker() -> Arc<CircuitBreaker> {
        Arc::new(CircuitBreaker::new(Duration::from_secs(60), 3))
    }

    #[test]
    fn builds_bars_url() {
        let p = HttpProvider::new("http://svc/", None, Duration::from_secs(1), breaker()).unwrap();
        let d = NaiveDate::from_ymd_opt(2024, 1, 2).unwrap();
        let q = WindowQuery {
            instrument: "SHFE.rb.HOT".parse().unwrap(),
            period: Period::Min5,
            start: d.and_hms_opt(9, 0, 0).unwrap(),
            end: d.and_hms_opt(15, 0, 0).unwrap(),
            max_records: 10_000,
            direction: Direction::Backward,
        };
        assert_eq!(
            p.bars_url(&q),
            "http://svc/bars?symbol=SHFE.rb.HOT&period=min5&start=2024-01-02T09:00:00\
             &end=2024-01-02T15:00:00&limit=10000&order=desc"
        );
        assert_eq!(p.instruments_url(Exchange::Czce), "http://svc/instruments?exchange=CZCE");
    }

    #[test]
    fn status_mapping() {
        let cb = breaker();
        let k = |s: StatusCode| classify_status(s, String::new(), &cb).kind();
        assert_eq!(k(StatusCode::UNAUTHORIZED), "authentication");
        assert_eq!(k(StatusCode::FORBIDDEN), "authentication");
        assert_eq!(k(StatusCode::NOT_FOUND), "provider_window");
        assert_eq!(k(StatusCode::UNPROCESSABLE_ENTITY), "provider_window");
        assert_eq!(k(StatusCode::BAD_GATEWAY), "provider_connection");
        assert!(cb.is_allowed());
        assert_eq!(k(StatusCode::TOO_MANY_REQUESTS), "provider_connection");
        assert_eq!(k(StatusCode::TOO_MANY_REQUESTS), "provider_connection");
        // 502 + 2x429 = three consecutive failures.
        assert!(!cb.is_allowed());
    }

    #[test]
    fn open_breaker_refuses_sessions() {
        let cb = breaker();
        cb.trip();
        let p = HttpProvider::new("http://svc", None, Duration::from_secs(1), cb).unwrap();
        assert!(!p.is_available());
        let err = p.open_session().err().unwrap();
        assert_eq!(err.kind(), "circuit_breaker");
    }

    #[test]
    fn wire_bar_time_truncates_for_day() {
        let raw = r#"{"datetime":"2024-01-02T21:05:00","open":1,"high":2,"low":0.5,"close":1.5,"close_oi":10}"#;
        let bar: WireBar = serde_json::from_str(raw).unwrap();
        let rec = parse_wire_bar(bar, Period::Min5).unwrap();
        assert_eq!(rec.time, 2105);
        assert_eq!(rec.open_interest, 10.0);

        let bar: WireBar = serde_json::from_str(raw).unwrap();
        assert_eq!(parse_wire_bar(bar, Period::Day).unwrap().time, 0);
    }
}
