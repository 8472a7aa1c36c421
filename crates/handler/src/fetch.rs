//! Upstream bulletin fetching.
//!
//! All connections for a cycle are issued concurrently; failures retry on
//! a carousel basis, one round per backoff sleep, until everything has
//! completed or the retry budget is spent. Responses are vetted in order:
//! status, content type, size, magic, filetime sanity, then parsed.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, TimeZone, Utc};
use futures_util::future::join_all;
use reqwest::header::{HeaderValue, CONTENT_TYPE, DATE, IF_MODIFIED_SINCE, LAST_MODIFIED};
use tracing::{debug, info, warn};

use psych_metadata::{HttpEncoding, Knobs, Resource};

use crate::bulletin::{self, Bulletin};
use crate::error::FetchError;
use crate::metrics;

/// Custom user-agent sent on every request.
pub const USER_AGENT: &str = concat!("psych/", env!("CARGO_PKG_VERSION"));

const RETRY_SLEEP_DEFAULT_MS: u64 = 1_000;
const RETRY_SLEEP_MAX_MS: u64 = 600_000;

/// Allow up to 6 cached connections per host.
const MAX_IDLE_PER_HOST: usize = 6;

/// Per-cycle transfer options.
#[derive(Debug, Clone, Copy)]
pub struct FetchFlags {
    /// Re-use pooled connections; a hard republish forces fresh ones.
    pub keepalive: bool,
    /// Send If-Modified-Since from the previous response's file time.
    pub if_modified_since: bool,
}

impl FetchFlags {
    /// The periodic timer's flag set.
    pub fn periodic() -> Self {
        Self { keepalive: true, if_modified_since: true }
    }

    /// Manual hard republish: fresh connections, unconditional GET.
    pub fn hard_republish() -> Self {
        Self { keepalive: false, if_modified_since: false }
    }
}

/// Per-resource, per-cycle transfer state. `last_filetime` survives
/// across cycles in memory only and resets at restart.
pub struct Connection {
    pub resource: Arc<Resource>,
    pub url: String,
    pub request_time: Option<DateTime<Utc>>,
    pub httpd_time: Option<DateTime<Utc>>,
    /// Unix seconds of the last accepted response's modification time;
    /// 0 until the first success.
    pub last_filetime: i64,
    pub data: Vec<u8>,
    pub error: Option<String>,
}

impl Connection {
    pub fn new(resource: Arc<Resource>) -> Self {
        let url = resource.url.clone();
        Self {
            resource,
            url,
            request_time: None,
            httpd_time: None,
            last_filetime: 0,
            data: Vec::new(),
            error: None,
        }
    }

    fn reset(&mut self) {
        self.request_time = None;
        self.httpd_time = None;
        self.data.clear();
        self.error = None;
    }
}

struct FetchOutcome {
    status: u16,
    content_type: Option<String>,
    date: Option<DateTime<Utc>>,
    /// Last-Modified as Unix seconds, -1 when absent.
    filetime: i64,
    body: Vec<u8>,
}

pub struct Fetcher {
    /// Pooled client for the periodic keepalive path.
    keepalive: reqwest::Client,
    /// Zero-idle-pool client for hard republish.
    fresh: reqwest::Client,
    knobs: Knobs,
}

impl Fetcher {
    pub fn new(knobs: &Knobs) -> Result<Self, FetchError> {
        Ok(Self {
            keepalive: build_client(knobs, false)?,
            fresh: build_client(knobs, true)?,
            knobs: knobs.clone(),
        })
    }

    /// Run one carousel over `connections`, handing every accepted
    /// bulletin to `on_bulletin`. Returns the number accepted.
    pub async fn run_cycle(
        &self,
        connections: &mut [Connection],
        flags: FetchFlags,
        mut on_bulletin: impl FnMut(&Arc<Resource>, Bulletin),
    ) -> usize {
        let start = Instant::now();
        for connection in connections.iter_mut() {
            connection.reset();
        }

        let mut pending: Vec<usize> = (0..connections.len()).collect();
        let mut retries_left = self.knobs.retry_count;
        let fixed_delay = self.knobs.retry_delay_ms;
        let mut retry_sleep = if fixed_delay > 0 { fixed_delay } else { RETRY_SLEEP_DEFAULT_MS };
        let mut accepted = 0;

        loop {
            let round_time = Utc::now();
            let requests: Vec<(usize, String, i64)> = pending
                .iter()
                .map(|&i| (i, connections[i].url.clone(), connections[i].last_filetime))
                .collect();
            let outcomes = join_all(
                requests
                    .iter()
                    .map(|(_, url, filetime)| self.fetch_one(url, *filetime, flags)),
            )
            .await;

            let mut still_pending = Vec::new();
            for ((index, _, _), outcome) in requests.into_iter().zip(outcomes) {
                let connection = &mut connections[index];
                connection.request_time = Some(round_time);
                match self.process_response(connection, outcome) {
                    Ok(Some(bulletin)) => {
                        on_bulletin(&connection.resource, bulletin);
                        accepted += 1;
                    }
                    Ok(None) => {}
                    Err(e) => {
                        warn!(url = %connection.url, error = %e, "aborted HTTP transfer");
                        let permanent = e.is_permanent();
                        connection.error = Some(e.to_string());
                        if !permanent {
                            still_pending.push(index);
                        }
                    }
                }
            }
            pending = still_pending;

            if pending.is_empty() {
                break;
            }
            let elapsed_ms = start.elapsed().as_millis() as u64;
            let within_budget =
                self.knobs.retry_timeout_ms == 0 || elapsed_ms < self.knobs.retry_timeout_ms;
            if retries_left > 0 && within_budget {
                warn!(
                    sleep_ms = retry_sleep,
                    retries_left, "transient problem, will retry"
                );
                tokio::time::sleep(Duration::from_millis(retry_sleep)).await;
                retries_left -= 1;
                retry_sleep = next_backoff(retry_sleep, fixed_delay);
                continue;
            }
            warn!(pending = pending.len(), "aborted transfer");
            metrics::inc_retries_exceeded();
            break;
        }

        let elapsed = start.elapsed();
        metrics::set_cycle_duration_ms(elapsed.as_secs_f64() * 1e3);
        info!(elapsed_ms = elapsed.as_millis() as u64, accepted, "refresh complete");
        accepted
    }

    async fn fetch_one(
        &self,
        url: &str,
        last_filetime: i64,
        flags: FetchFlags,
    ) -> Result<FetchOutcome, FetchError> {
        let client = if flags.keepalive { &self.keepalive } else { &self.fresh };
        let mut request = client.get(url);
        if flags.if_modified_since && last_filetime > 0 {
            request = request.header(IF_MODIFIED_SINCE, http_date(last_filetime));
        }
        let mut response = request.send().await?;

        let status = response.status().as_u16();
        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let date = response.headers().get(DATE).and_then(parse_http_date);
        let filetime = response
            .headers()
            .get(LAST_MODIFIED)
            .and_then(parse_http_date)
            .map(|t| t.timestamp())
            .unwrap_or(-1);

        let maximum = self.knobs.maximum_response_size;
        let mut body = Vec::new();
        while let Some(chunk) = response.chunk().await? {
            if body.len() + chunk.len() > maximum {
                warn!(url, "aborting long transfer");
                return Err(FetchError::Oversize(maximum));
            }
            body.extend_from_slice(&chunk);
        }

        Ok(FetchOutcome { status, content_type, date, filetime, body })
    }

    /// Vet one completed transfer and parse its bulletin. `Ok(None)` is a
    /// 304: nothing to publish, nothing left to retry.
    fn process_response(
        &self,
        connection: &mut Connection,
        outcome: Result<FetchOutcome, FetchError>,
    ) -> Result<Option<Bulletin>, FetchError> {
        let outcome = match outcome {
            Ok(outcome) => outcome,
            Err(e) => {
                if matches!(e, FetchError::Oversize(_)) {
                    metrics::inc_http_malformed();
                }
                return Err(e);
            }
        };

        metrics::inc_http_response(outcome.status);
        if outcome.status != 200 {
            if outcome.status == 304 {
                debug!(url = %connection.url, "not modified");
                return Ok(None);
            }
            return Err(FetchError::Status(outcome.status));
        }

        let content_type = outcome.content_type.unwrap_or_default();
        if !content_type.starts_with("text/plain") {
            metrics::inc_http_malformed();
            return Err(FetchError::ContentType(content_type));
        }
        if outcome.body.len() < self.knobs.minimum_response_size {
            metrics::inc_http_malformed();
            return Err(FetchError::TooSmall {
                got: outcome.body.len(),
                minimum: self.knobs.minimum_response_size,
            });
        }
        if !bulletin::has_magic(&outcome.body) {
            metrics::inc_http_malformed();
            return Err(FetchError::BadMagic);
        }

        let resource_name = connection.resource.name.clone();
        let request_time = connection.request_time.unwrap_or_else(Utc::now);
        connection.httpd_time = outcome.date;

        let mut httpd_offset = 0;
        if let Some(httpd_time) = outcome.date {
            httpd_offset = (httpd_time - request_time).num_seconds();
            metrics::set_clock_offset(&resource_name, "httpd", httpd_offset);
        }
        let mut http_offset = 0;
        if outcome.filetime >= 0 {
            http_offset = outcome.filetime - request_time.timestamp();
            metrics::set_clock_offset(&resource_name, "http", http_offset);
            let threshold = self.knobs.panic_threshold_secs;
            if threshold > 0 && http_offset.abs() >= threshold {
                metrics::inc_http_malformed();
                return Err(FetchError::ClockPanic { offset: http_offset, threshold });
            }
            connection.last_filetime = outcome.filetime;
        }

        connection.data = outcome.body;
        let text = String::from_utf8_lossy(&connection.data).into_owned();
        let bulletin = match bulletin::parse(&text) {
            Ok(bulletin) => bulletin,
            Err(e) => {
                metrics::inc_http_malformed();
                return Err(e.into());
            }
        };

        let psych_offset = (bulletin.close_time.and_utc() - request_time).num_seconds();
        metrics::set_clock_offset(&resource_name, "psych", psych_offset);
        info!(
            resource = %resource_name,
            httpd_offset,
            http_offset,
            psych_offset,
            open = %bulletin.open_time,
            close = %bulletin.close_time,
            "timing"
        );
        Ok(Some(bulletin))
    }
}

fn build_client(knobs: &Knobs, fresh: bool) -> Result<reqwest::Client, reqwest::Error> {
    let mut builder = reqwest::Client::builder()
        .user_agent(USER_AGENT)
        // IPv4 only
        .local_address(Some(std::net::IpAddr::from(std::net::Ipv4Addr::UNSPECIFIED)));

    if knobs.timeout_ms > 0 {
        builder = builder.timeout(Duration::from_millis(knobs.timeout_ms));
    }
    if knobs.connect_timeout_ms > 0 {
        builder = builder.connect_timeout(Duration::from_millis(knobs.connect_timeout_ms));
    }
    if let Some(proxy) = &knobs.http_proxy {
        builder = builder.proxy(reqwest::Proxy::all(proxy)?);
    }
    builder = match knobs.request_http_encoding {
        Some(HttpEncoding::Gzip) => builder.gzip(true).deflate(false),
        Some(HttpEncoding::Deflate) => builder.deflate(true).gzip(false),
        Some(HttpEncoding::Identity) | None => builder.gzip(false).deflate(false),
    };
    builder = if fresh {
        builder.pool_max_idle_per_host(0)
    } else {
        builder.pool_max_idle_per_host(if knobs.enable_http_pipelining {
            MAX_IDLE_PER_HOST
        } else {
            1
        })
    };
    builder.build()
}

/// Double up to the ten-minute cap, or hold a configured fixed delay.
fn next_backoff(current_ms: u64, fixed_delay_ms: u64) -> u64 {
    if fixed_delay_ms > 0 {
        fixed_delay_ms
    } else {
        (current_ms * 2).min(RETRY_SLEEP_MAX_MS)
    }
}

fn parse_http_date(value: &HeaderValue) -> Option<DateTime<Utc>> {
    let text = value.to_str().ok()?;
    DateTime::parse_from_rfc2822(text)
        .ok()
        .map(|t| t.with_timezone(&Utc))
}

/// RFC 2616 date from Unix seconds, for If-Modified-Since.
fn http_date(epoch_secs: i64) -> String {
    Utc.timestamp_opt(epoch_secs, 0)
        .single()
        .map(|t| t.format("%a, %d %b %Y %H:%M:%S GMT").to_string())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const BODY: &str = "# MarketPsych Engine Version 3.2 | 2024-01-02 00:00:00 UTC - 2024-01-02 00:01:00 UTC\nSector\tBuzz\n1679\t0.123456\n";

    fn test_knobs() -> Knobs {
        Knobs {
            interval_secs: 60,
            time_offset_constant: chrono::NaiveTime::from_hms_opt(0, 1, 0).unwrap(),
            tolerable_delay_ms: 0,
            retry_count: 0,
            retry_delay_ms: 10,
            retry_timeout_ms: 0,
            timeout_ms: 5_000,
            connect_timeout_ms: 2_000,
            enable_http_pipelining: false,
            maximum_response_size: 65_536,
            minimum_response_size: 16,
            request_http_encoding: None,
            panic_threshold_secs: 0,
            http_proxy: None,
            dns_cache_timeout_secs: 60,
        }
    }

    fn test_resource(url_base: &str) -> Arc<Resource> {
        Arc::new(Resource {
            name: "equities".to_string(),
            source: "MarketPsych".to_string(),
            path: "/MP.n1".to_string(),
            url: format!("{url_base}/MP.n1"),
            entitlement_code: 29,
            fields: HashMap::from([("Buzz".to_string(), 7001)]),
            items: HashMap::new(),
        })
    }

    #[tokio::test]
    async fn test_fetch_happy_path() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/MP.n1"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_raw(BODY, "text/plain")
                    .insert_header("Last-Modified", "Tue, 02 Jan 2024 00:01:00 GMT"),
            )
            .mount(&server)
            .await;

        let fetcher = Fetcher::new(&test_knobs()).unwrap();
        let mut connections = vec![Connection::new(test_resource(&server.uri()))];
        let mut bulletins = Vec::new();
        let published = fetcher
            .run_cycle(&mut connections, FetchFlags::periodic(), |_, b| bulletins.push(b))
            .await;

        assert_eq!(published, 1);
        assert_eq!(bulletins[0].rows[0].key, "1679");
        assert!(connections[0].last_filetime > 0);
        assert!(connections[0].error.is_none());
    }

    #[tokio::test]
    async fn test_retry_then_success() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/MP.n1"))
            .respond_with(ResponseTemplate::new(503))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/MP.n1"))
            .respond_with(ResponseTemplate::new(200).set_body_raw(BODY, "text/plain"))
            .mount(&server)
            .await;

        let mut knobs = test_knobs();
        knobs.retry_count = 3;
        let fives_before = metrics::http_response_count("5xx");
        let ok_before = metrics::http_response_count("200");

        let fetcher = Fetcher::new(&knobs).unwrap();
        let mut connections = vec![Connection::new(test_resource(&server.uri()))];
        let mut count = 0;
        let published = fetcher
            .run_cycle(&mut connections, FetchFlags::periodic(), |_, _| count += 1)
            .await;

        assert_eq!(published, 1);
        assert_eq!(count, 1);
        // Counters are global; other tests may bump them concurrently.
        assert!(metrics::http_response_count("5xx") >= fives_before + 1);
        assert!(metrics::http_response_count("200") >= ok_before + 1);
    }

    #[tokio::test]
    async fn test_magic_mismatch_rejected() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_raw("HELLO world, this is long enough", "text/plain"),
            )
            .mount(&server)
            .await;

        let malformed_before = metrics::http_malformed_count();
        let fetcher = Fetcher::new(&test_knobs()).unwrap();
        let mut connections = vec![Connection::new(test_resource(&server.uri()))];
        let published = fetcher
            .run_cycle(&mut connections, FetchFlags::periodic(), |_, _| {})
            .await;

        assert_eq!(published, 0);
        assert!(metrics::http_malformed_count() >= malformed_before + 1);
    }

    #[tokio::test]
    async fn test_wrong_content_type_rejected() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_raw(BODY, "application/json"))
            .mount(&server)
            .await;

        let fetcher = Fetcher::new(&test_knobs()).unwrap();
        let mut connections = vec![Connection::new(test_resource(&server.uri()))];
        let published = fetcher
            .run_cycle(&mut connections, FetchFlags::periodic(), |_, _| {})
            .await;

        assert_eq!(published, 0);
        assert!(connections[0].error.as_deref().unwrap().contains("content-type"));
    }

    #[tokio::test]
    async fn test_conditional_get_after_success() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_raw(BODY, "text/plain")
                    .insert_header("Last-Modified", "Tue, 02 Jan 2024 00:01:00 GMT"),
            )
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(header("If-Modified-Since", "Tue, 02 Jan 2024 00:01:00 GMT"))
            .respond_with(ResponseTemplate::new(304))
            .mount(&server)
            .await;

        let threes_before = metrics::http_response_count("304");
        let fetcher = Fetcher::new(&test_knobs()).unwrap();
        let mut connections = vec![Connection::new(test_resource(&server.uri()))];

        let first = fetcher
            .run_cycle(&mut connections, FetchFlags::periodic(), |_, _| {})
            .await;
        assert_eq!(first, 1);

        let second = fetcher
            .run_cycle(&mut connections, FetchFlags::periodic(), |_, _| {})
            .await;
        assert_eq!(second, 0);
        assert!(metrics::http_response_count("304") >= threes_before + 1);
        assert!(connections[0].error.is_none());
    }

    #[tokio::test]
    async fn test_panic_threshold_discards_response() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_raw(BODY, "text/plain")
                    .insert_header("Last-Modified", "Tue, 02 Jan 2024 00:01:00 GMT"),
            )
            .mount(&server)
            .await;

        let mut knobs = test_knobs();
        knobs.panic_threshold_secs = 60;
        let fetcher = Fetcher::new(&knobs).unwrap();
        let mut connections = vec![Connection::new(test_resource(&server.uri()))];
        let published = fetcher
            .run_cycle(&mut connections, FetchFlags::periodic(), |_, _| {})
            .await;

        assert_eq!(published, 0);
        // A discarded response must not seed the next conditional GET.
        assert_eq!(connections[0].last_filetime, 0);
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let mut sleep = RETRY_SLEEP_DEFAULT_MS;
        let mut previous = sleep;
        for _ in 0..16 {
            sleep = next_backoff(sleep, 0);
            assert_eq!(sleep, (previous * 2).min(RETRY_SLEEP_MAX_MS));
            previous = sleep;
        }
        assert_eq!(sleep, RETRY_SLEEP_MAX_MS);
    }

    #[test]
    fn test_backoff_fixed_delay_holds() {
        assert_eq!(next_backoff(1_000, 250), 250);
        assert_eq!(next_backoff(250, 250), 250);
    }

    #[test]
    fn test_http_date_round_trip() {
        let formatted = http_date(1_704_153_660);
        let parsed = DateTime::parse_from_rfc2822(&formatted).unwrap();
        assert_eq!(parsed.timestamp(), 1_704_153_660);
    }
}
