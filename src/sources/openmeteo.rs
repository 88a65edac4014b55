//! Open-Meteo client.
//!
//! Two endpoints share one response shape: the forecast API serves the
//! upcoming days and the archive API serves anything back to 1940. Both
//! return hourly columns keyed by unix timestamps, with `null` cells where
//! a station had a gap, so parsing fills per-field defaults instead of
//! failing the whole batch.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Timelike, Utc};
use chrono_tz::Tz;
use rand::Rng;
use reqwest::Client;
use serde::Deserialize;
use tracing::{debug, warn};

use crate::sources::{SourceError, WeatherRecord, WeatherSource};

const FORECAST_URL: &str = "https://api.open-meteo.com/v1/forecast";
const ARCHIVE_URL: &str = "https://archive-api.open-meteo.com/v1/archive";

/// Hourly variables requested from both endpoints, in feature order.
const HOURLY_PARAMS: &str = "shortwave_radiation,cloud_cover,temperature_2m,\
wind_speed_10m,relative_humidity_2m,diffuse_radiation,direct_normal_irradiance";

/// The forecast endpoint serves at most 16 days ahead.
const MAX_FORECAST_HOURS: usize = 384;

/// The archive lags real time while measurements are consolidated.
const ARCHIVE_LAG_DAYS: i64 = 5;

const MAX_ATTEMPTS: u32 = 3;
const BACKOFF_BASE: Duration = Duration::from_secs(2);

const FORECAST_TIMEOUT: Duration = Duration::from_secs(30);
const ARCHIVE_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug)]
pub struct OpenMeteo {
    client: Client,
    forecast_url: String,
    archive_url: String,
    latitude: f64,
    longitude: f64,
    timezone: Tz,
    backoff_base: Duration,
}

impl OpenMeteo {
    pub fn new(latitude: f64, longitude: f64, timezone: Tz) -> Self {
        Self::with_endpoints(
            latitude,
            longitude,
            timezone,
            FORECAST_URL,
            ARCHIVE_URL,
            BACKOFF_BASE,
        )
    }

    /// Point the client at different endpoints, for self-hosted Open-Meteo
    /// instances and for tests.
    pub fn with_endpoints(
        latitude: f64,
        longitude: f64,
        timezone: Tz,
        forecast_url: &str,
        archive_url: &str,
        backoff_base: Duration,
    ) -> Self {
        Self {
            client: Client::builder().build().unwrap_or_default(),
            forecast_url: forecast_url.to_string(),
            archive_url: archive_url.to_string(),
            latitude,
            longitude,
            timezone,
            backoff_base,
        }
    }

    /// GET `url` and decode the hourly block, retrying transient failures.
    ///
    /// Rate limiting (429), server errors (5xx) and connection problems are
    /// retried with exponential backoff and jitter; any other client error
    /// fails immediately.
    async fn get_hourly(&self, url: &str, timeout: Duration) -> Result<HourlyBlock, SourceError> {
        let mut last = String::new();

        for attempt in 0..MAX_ATTEMPTS {
            if attempt > 0 {
                let exp = self.backoff_base.as_secs_f64() * f64::from(1u32 << (attempt - 1));
                let jitter = 0.5 + rand::thread_rng().gen::<f64>();
                tokio::time::sleep(Duration::from_secs_f64(exp * jitter)).await;
            }

            let response = match self.client.get(url).timeout(timeout).send().await {
                Ok(response) => response,
                Err(e) if e.is_timeout() || e.is_connect() => {
                    warn!("weather request attempt {} failed: {}", attempt + 1, e);
                    last = e.to_string();
                    continue;
                }
                Err(e) => return Err(SourceError::Request(e)),
            };

            let status = response.status();
            if status.is_success() {
                let body: OpenMeteoResponse = response
                    .json()
                    .await
                    .map_err(|e| SourceError::Schema(e.to_string()))?;
                return Ok(body.hourly);
            }

            if status.as_u16() == 429 || status.is_server_error() {
                warn!(
                    "weather request attempt {} got status {}",
                    attempt + 1,
                    status
                );
                last = format!("status {status}");
                continue;
            }

            return Err(SourceError::Status {
                status: status.as_u16(),
            });
        }

        Err(SourceError::Exhausted {
            attempts: MAX_ATTEMPTS,
            last,
        })
    }
}

#[async_trait]
impl WeatherSource for OpenMeteo {
    fn name(&self) -> &'static str {
        "open-meteo"
    }

    async fn fetch_forecast(&self, hours: usize) -> Result<Vec<WeatherRecord>, SourceError> {
        let requested = hours.min(MAX_FORECAST_HOURS);
        let url = format!(
            "{}?latitude={}&longitude={}&hourly={}&forecast_hours={}\
             &timeformat=unixtime&timezone=UTC",
            self.forecast_url, self.latitude, self.longitude, HOURLY_PARAMS, requested
        );

        debug!("fetching {} forecast hours", requested);
        let hourly = self.get_hourly(&url, FORECAST_TIMEOUT).await?;

        // The API answers from the top of the current hour; anything older
        // than one full hour is a stale row from a cached response.
        let cutoff = Utc::now().timestamp() - 3600;
        Ok(to_records(&hourly)
            .into_iter()
            .filter(|r| r.timestamp >= cutoff)
            .take(hours)
            .collect())
    }

    async fn fetch_today(&self) -> Result<Vec<WeatherRecord>, SourceError> {
        let now_local = Utc::now().with_timezone(&self.timezone);
        let today = now_local.date_naive();

        // Ask for a margin on both sides, then trim to the local calendar
        // day; the API cannot express "local midnight to midnight" directly.
        let past_hours = now_local.hour() + 2;
        let forecast_hours = 24 - now_local.hour() + 1;
        let url = format!(
            "{}?latitude={}&longitude={}&hourly={}&past_hours={}&forecast_hours={}\
             &timeformat=unixtime&timezone=UTC",
            self.forecast_url, self.latitude, self.longitude, HOURLY_PARAMS, past_hours,
            forecast_hours
        );

        debug!("fetching weather for local day {}", today);
        let hourly = self.get_hourly(&url, FORECAST_TIMEOUT).await?;

        let timezone = self.timezone;
        Ok(to_records(&hourly)
            .into_iter()
            .filter(|r| {
                DateTime::from_timestamp(r.timestamp, 0)
                    .map(|t| t.with_timezone(&timezone).date_naive() == today)
                    .unwrap_or(false)
            })
            .collect())
    }

    async fn fetch_historical(
        &self,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<Vec<WeatherRecord>, SourceError> {
        let url = format!(
            "{}?latitude={}&longitude={}&start_date={}&end_date={}&hourly={}\
             &timeformat=unixtime&timezone=UTC",
            self.archive_url, self.latitude, self.longitude, start, end, HOURLY_PARAMS
        );

        debug!("fetching archive weather {} to {}", start, end);
        let hourly = self.get_hourly(&url, ARCHIVE_TIMEOUT).await?;
        Ok(to_records(&hourly))
    }

    fn available_range(&self) -> (NaiveDate, NaiveDate) {
        let floor = NaiveDate::from_ymd_opt(1940, 1, 1).unwrap_or_default();
        let ceiling = Utc::now().date_naive() - chrono::Duration::days(ARCHIVE_LAG_DAYS);
        (floor, ceiling)
    }
}

#[derive(Debug, Deserialize)]
struct OpenMeteoResponse {
    hourly: HourlyBlock,
}

/// Column-oriented hourly data; any column or cell may be absent.
#[derive(Debug, Default, Deserialize)]
struct HourlyBlock {
    #[serde(default)]
    time: Vec<i64>,
    shortwave_radiation: Option<Vec<Option<f64>>>,
    cloud_cover: Option<Vec<Option<f64>>>,
    temperature_2m: Option<Vec<Option<f64>>>,
    wind_speed_10m: Option<Vec<Option<f64>>>,
    relative_humidity_2m: Option<Vec<Option<f64>>>,
    diffuse_radiation: Option<Vec<Option<f64>>>,
    direct_normal_irradiance: Option<Vec<Option<f64>>>,
}

/// Turn the column block into rows, filling gaps per field.
///
/// Missing radiation reads as 0, missing temperature as a mild 10 C and
/// missing humidity as 50%, so one patchy station hour cannot sink a
/// multi-year archive download.
fn to_records(hourly: &HourlyBlock) -> Vec<WeatherRecord> {
    let cell = |column: &Option<Vec<Option<f64>>>, i: usize| {
        column.as_ref().and_then(|v| v.get(i).copied().flatten())
    };

    hourly
        .time
        .iter()
        .enumerate()
        .map(|(i, &timestamp)| WeatherRecord {
            timestamp,
            ghi_wm2: cell(&hourly.shortwave_radiation, i).unwrap_or(0.0).max(0.0),
            cloud_cover_pct: cell(&hourly.cloud_cover, i)
                .unwrap_or(0.0)
                .clamp(0.0, 100.0)
                .round() as u8,
            temperature_c: cell(&hourly.temperature_2m, i).unwrap_or(10.0),
            wind_speed_ms: cell(&hourly.wind_speed_10m, i).unwrap_or(0.0).max(0.0),
            humidity_pct: cell(&hourly.relative_humidity_2m, i)
                .unwrap_or(50.0)
                .clamp(0.0, 100.0)
                .round() as u8,
            dhi_wm2: Some(cell(&hourly.diffuse_radiation, i).unwrap_or(0.0).max(0.0)),
            dni_wm2: cell(&hourly.direct_normal_irradiance, i)
                .unwrap_or(0.0)
                .max(0.0),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn test_client(server_uri: &str, timezone: Tz) -> OpenMeteo {
        OpenMeteo::with_endpoints(
            51.83,
            7.28,
            timezone,
            &format!("{server_uri}/v1/forecast"),
            &format!("{server_uri}/v1/archive"),
            Duration::from_millis(1),
        )
    }

    /// Hourly body with `count` rows starting at `start`, clear-sky values.
    fn hourly_body(start: i64, count: usize) -> serde_json::Value {
        let time: Vec<i64> = (0..count as i64).map(|i| start + i * 3600).collect();
        json!({
            "hourly": {
                "time": time,
                "shortwave_radiation": vec![Some(500.0); count],
                "cloud_cover": vec![Some(20.0); count],
                "temperature_2m": vec![Some(18.5); count],
                "wind_speed_10m": vec![Some(3.2); count],
                "relative_humidity_2m": vec![Some(60.0); count],
                "diffuse_radiation": vec![Some(120.0); count],
                "direct_normal_irradiance": vec![Some(650.0); count],
            }
        })
    }

    fn current_hour() -> i64 {
        let now = Utc::now().timestamp();
        now - now % 3600
    }

    #[test]
    fn test_to_records_fills_null_cells() {
        let hourly = HourlyBlock {
            time: vec![1_717_243_200, 1_717_246_800],
            shortwave_radiation: Some(vec![Some(480.0), None]),
            cloud_cover: Some(vec![None, Some(75.4)]),
            temperature_2m: Some(vec![Some(21.0), None]),
            wind_speed_10m: Some(vec![None, Some(-1.0)]),
            relative_humidity_2m: Some(vec![Some(55.0), None]),
            diffuse_radiation: None,
            direct_normal_irradiance: Some(vec![Some(700.0), None]),
        };

        let records = to_records(&hourly);
        assert_eq!(records.len(), 2);

        assert_eq!(records[0].ghi_wm2, 480.0);
        assert_eq!(records[0].cloud_cover_pct, 0);
        assert_eq!(records[0].wind_speed_ms, 0.0);
        assert_eq!(records[0].dhi_wm2, Some(0.0));

        assert_eq!(records[1].ghi_wm2, 0.0);
        assert_eq!(records[1].cloud_cover_pct, 75);
        assert_eq!(records[1].temperature_c, 10.0);
        assert_eq!(records[1].humidity_pct, 50);
        // Negative wind speed is a sensor glitch, floored at zero.
        assert_eq!(records[1].wind_speed_ms, 0.0);
    }

    #[tokio::test]
    async fn test_fetch_forecast_parses_and_caps() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1/forecast"))
            .and(query_param("timeformat", "unixtime"))
            .and(query_param("timezone", "UTC"))
            .respond_with(ResponseTemplate::new(200).set_body_json(hourly_body(current_hour(), 48)))
            .mount(&server)
            .await;

        let client = test_client(&server.uri(), chrono_tz::UTC);
        let records = client.fetch_forecast(24).await.unwrap();

        assert_eq!(records.len(), 24);
        assert_eq!(records[0].ghi_wm2, 500.0);
        assert_eq!(records[0].cloud_cover_pct, 20);
        assert!(records.windows(2).all(|w| w[1].timestamp > w[0].timestamp));
    }

    #[tokio::test]
    async fn test_fetch_forecast_drops_stale_rows() {
        let server = MockServer::start().await;
        // Six rows from three hours ago: the two oldest are stale.
        Mock::given(method("GET"))
            .and(path("/v1/forecast"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(hourly_body(current_hour() - 3 * 3600, 6)),
            )
            .mount(&server)
            .await;

        let client = test_client(&server.uri(), chrono_tz::UTC);
        let records = client.fetch_forecast(24).await.unwrap();

        assert_eq!(records.len(), 4);
        assert!(records[0].timestamp >= Utc::now().timestamp() - 3600);
    }

    #[tokio::test]
    async fn test_retries_server_error_then_succeeds() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1/forecast"))
            .respond_with(ResponseTemplate::new(500))
            .up_to_n_times(1)
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/v1/forecast"))
            .respond_with(ResponseTemplate::new(200).set_body_json(hourly_body(current_hour(), 4)))
            .expect(1)
            .mount(&server)
            .await;

        let client = test_client(&server.uri(), chrono_tz::UTC);
        let records = client.fetch_forecast(4).await.unwrap();
        assert_eq!(records.len(), 4);
    }

    #[tokio::test]
    async fn test_client_error_fails_without_retry() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1/forecast"))
            .respond_with(ResponseTemplate::new(404))
            .expect(1)
            .mount(&server)
            .await;

        let client = test_client(&server.uri(), chrono_tz::UTC);
        let err = client.fetch_forecast(4).await.unwrap_err();
        assert!(matches!(err, SourceError::Status { status: 404 }));
    }

    #[tokio::test]
    async fn test_rate_limit_exhausts_retries() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1/forecast"))
            .respond_with(ResponseTemplate::new(429))
            .expect(3)
            .mount(&server)
            .await;

        let client = test_client(&server.uri(), chrono_tz::UTC);
        let err = client.fetch_forecast(4).await.unwrap_err();
        assert!(matches!(err, SourceError::Exhausted { attempts: 3, .. }));
    }

    #[tokio::test]
    async fn test_fetch_historical_sends_date_range() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1/archive"))
            .and(query_param("start_date", "2023-06-01"))
            .and(query_param("end_date", "2023-06-02"))
            .respond_with(ResponseTemplate::new(200).set_body_json(hourly_body(1_685_577_600, 48)))
            .mount(&server)
            .await;

        let client = test_client(&server.uri(), chrono_tz::UTC);
        let start = NaiveDate::from_ymd_opt(2023, 6, 1).unwrap();
        let end = NaiveDate::from_ymd_opt(2023, 6, 2).unwrap();
        let records = client.fetch_historical(start, end).await.unwrap();

        assert_eq!(records.len(), 48);
        assert_eq!(records[0].timestamp, 1_685_577_600);
    }

    #[tokio::test]
    async fn test_fetch_today_trims_to_local_day() {
        let server = MockServer::start().await;

        // One hour of yesterday, all of today, one hour of tomorrow (UTC).
        let midnight = Utc::now()
            .date_naive()
            .and_hms_opt(0, 0, 0)
            .unwrap()
            .and_utc()
            .timestamp();
        Mock::given(method("GET"))
            .and(path("/v1/forecast"))
            .respond_with(ResponseTemplate::new(200).set_body_json(hourly_body(midnight - 3600, 26)))
            .mount(&server)
            .await;

        let client = test_client(&server.uri(), chrono_tz::UTC);
        let records = client.fetch_today().await.unwrap();

        assert_eq!(records.len(), 24);
        assert_eq!(records[0].timestamp, midnight);
        assert_eq!(records[23].timestamp, midnight + 23 * 3600);
    }

    #[test]
    fn test_available_range_lags_behind_today() {
        let client = OpenMeteo::new(51.83, 7.28, chrono_tz::Europe::Berlin);
        let (floor, ceiling) = client.available_range();
        assert_eq!(floor, NaiveDate::from_ymd_opt(1940, 1, 1).unwrap());
        assert_eq!(ceiling, Utc::now().date_naive() - chrono::Duration::days(5));
    }

    // Requires network access to the live API.
    #[tokio::test]
    #[ignore]
    async fn test_live_fetch_forecast() {
        let client = OpenMeteo::new(51.83, 7.28, chrono_tz::Europe::Berlin);
        let records = client.fetch_forecast(24).await.unwrap();
        assert!(!records.is_empty());
        for record in &records {
            assert!(record.ghi_wm2 >= 0.0);
            assert!(record.cloud_cover_pct <= 100);
        }
    }
}
