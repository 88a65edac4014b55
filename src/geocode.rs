//! Geocoding via the OpenStreetMap Nominatim API.
//!
//! Turns postal codes and place names into coordinates during setup. The
//! Nominatim usage policy allows at most one request per second and requires
//! an identifying User-Agent; the limiter that enforces the interval is a
//! plain value owned by the caller, with a pluggable clock so its timing
//! can be tested without sleeping.

use std::time::{Duration, Instant};

use reqwest::Client;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

const NOMINATIM_URL: &str = "https://nominatim.openstreetmap.org/search";
const USER_AGENT: &str = concat!("pvcast/", env!("CARGO_PKG_VERSION"));

/// Nominatim policy: at most one request per second.
const MIN_REQUEST_INTERVAL: Duration = Duration::from_secs(1);

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);
const MAX_RETRIES: u32 = 3;
const RETRY_DELAY: Duration = Duration::from_secs(2);

/// Search is biased to these countries unless the caller overrides it.
pub const DEFAULT_COUNTRY_CODES: &str = "de,at,ch";

#[derive(Debug, Error)]
pub enum GeocodeError {
    #[error("geocoding request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("geocoding API returned status {status}")]
    Status { status: u16 },

    #[error("geocoding response did not match the expected schema: {0}")]
    Schema(String),

    #[error("geocoding gave up after {attempts} attempts: {last}")]
    Exhausted { attempts: u32, last: String },
}

/// A resolved place.
#[derive(Debug, Clone, Serialize)]
pub struct GeoResult {
    pub latitude: f64,
    pub longitude: f64,
    pub display_name: String,
    pub city: Option<String>,
    pub state: Option<String>,
    pub country: Option<String>,
    pub country_code: Option<String>,
}

impl GeoResult {
    /// Compact "city, region" label for terminal output.
    pub fn short_name(&self) -> String {
        let parts: Vec<&str> = [self.city.as_deref(), self.state.as_deref()]
            .into_iter()
            .flatten()
            .collect();
        if parts.is_empty() {
            return self
                .display_name
                .split(", ")
                .take(2)
                .collect::<Vec<_>>()
                .join(", ");
        }
        parts.join(", ")
    }
}

/// Time source for [`RateLimiter`].
pub trait Clock {
    fn now(&self) -> Instant;
}

#[derive(Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

/// Enforces a minimum interval between requests.
///
/// [`reserve`](Self::reserve) hands back how long the caller must wait
/// before firing; the limiter itself never sleeps, so the caller stays in
/// charge of the executor it waits on.
pub struct RateLimiter<C: Clock = SystemClock> {
    clock: C,
    min_interval: Duration,
    last_request: Option<Instant>,
}

impl RateLimiter<SystemClock> {
    pub fn new(min_interval: Duration) -> Self {
        Self::with_clock(min_interval, SystemClock)
    }
}

impl<C: Clock> RateLimiter<C> {
    pub fn with_clock(min_interval: Duration, clock: C) -> Self {
        Self {
            clock,
            min_interval,
            last_request: None,
        }
    }

    /// Reserve the next request slot, returning the wait it requires.
    pub fn reserve(&mut self) -> Duration {
        let now = self.clock.now();
        let wait = match self.last_request {
            Some(last) => self
                .min_interval
                .saturating_sub(now.saturating_duration_since(last)),
            None => Duration::ZERO,
        };
        self.last_request = Some(now + wait);
        wait
    }
}

pub struct Geocoder {
    client: Client,
    base_url: String,
    limiter: RateLimiter,
    retry_delay: Duration,
}

impl Geocoder {
    pub fn new() -> Self {
        Self::with_endpoint(NOMINATIM_URL, MIN_REQUEST_INTERVAL, RETRY_DELAY)
    }

    /// Point the client at a different endpoint, for tests.
    pub fn with_endpoint(base_url: &str, min_interval: Duration, retry_delay: Duration) -> Self {
        Self {
            client: Client::builder()
                .user_agent(USER_AGENT)
                .build()
                .unwrap_or_default(),
            base_url: base_url.to_string(),
            limiter: RateLimiter::new(min_interval),
            retry_delay,
        }
    }

    /// Free-text search for a postal code, place name or combination.
    ///
    /// Returns `Ok(None)` when the query is empty or matches nothing.
    /// Timeouts, network errors and rate limiting are retried; any other
    /// HTTP error fails immediately.
    pub async fn search(
        &mut self,
        query: &str,
        country_codes: Option<&str>,
    ) -> Result<Option<GeoResult>, GeocodeError> {
        let query = query.trim();
        if query.is_empty() {
            return Ok(None);
        }
        debug!("geocoding '{}'", query);

        let mut params = vec![
            ("q", query.to_string()),
            ("format", "jsonv2".to_string()),
            ("addressdetails", "1".to_string()),
            ("limit", "1".to_string()),
        ];
        if let Some(codes) = country_codes {
            params.push(("countrycodes", codes.to_string()));
        }

        let mut last = String::new();
        for attempt in 1..=MAX_RETRIES {
            match self.request(&params).await {
                Ok(places) => return Ok(places.into_iter().next().map(to_result).transpose()?),
                Err(RequestOutcome::RateLimited) => {
                    warn!("geocoding rate limited (attempt {attempt}/{MAX_RETRIES})");
                    last = "status 429".to_string();
                    if attempt < MAX_RETRIES {
                        tokio::time::sleep(self.retry_delay * 2).await;
                    }
                }
                Err(RequestOutcome::Transient(detail)) => {
                    warn!("geocoding attempt {attempt}/{MAX_RETRIES} failed: {detail}");
                    last = detail;
                    if attempt < MAX_RETRIES {
                        tokio::time::sleep(self.retry_delay).await;
                    }
                }
                Err(RequestOutcome::Fatal(e)) => return Err(e),
            }
        }

        Err(GeocodeError::Exhausted {
            attempts: MAX_RETRIES,
            last,
        })
    }

    /// Structured postal-code search, falling back to free text when the
    /// structured form matches nothing.
    pub async fn search_postal_code(
        &mut self,
        postal_code: &str,
        country_code: &str,
    ) -> Result<Option<GeoResult>, GeocodeError> {
        let normalized: String = postal_code.chars().filter(|c| c.is_alphanumeric()).collect();
        if normalized.is_empty() {
            return Ok(None);
        }

        let params = vec![
            ("postalcode", normalized.clone()),
            ("country", country_code.to_string()),
            ("format", "jsonv2".to_string()),
            ("addressdetails", "1".to_string()),
            ("limit", "1".to_string()),
        ];

        let places = match self.request(&params).await {
            Ok(places) => places,
            Err(RequestOutcome::RateLimited) => {
                return Err(GeocodeError::Status { status: 429 });
            }
            Err(RequestOutcome::Transient(detail)) => {
                return Err(GeocodeError::Exhausted {
                    attempts: 1,
                    last: detail,
                });
            }
            Err(RequestOutcome::Fatal(e)) => return Err(e),
        };

        match places.into_iter().next() {
            Some(place) => Ok(Some(to_result(place)?)),
            None => {
                debug!("structured postal search empty, trying free text");
                self.search(&normalized, Some(country_code)).await
            }
        }
    }

    async fn request(&mut self, params: &[(&str, String)]) -> Result<Vec<Place>, RequestOutcome> {
        let wait = self.limiter.reserve();
        if !wait.is_zero() {
            debug!("rate limit: waiting {:.2}s", wait.as_secs_f64());
            tokio::time::sleep(wait).await;
        }

        let response = match self
            .client
            .get(&self.base_url)
            .query(params)
            .timeout(REQUEST_TIMEOUT)
            .send()
            .await
        {
            Ok(response) => response,
            Err(e) if e.is_timeout() || e.is_connect() => {
                return Err(RequestOutcome::Transient(e.to_string()));
            }
            Err(e) => return Err(RequestOutcome::Fatal(GeocodeError::Request(e))),
        };

        let status = response.status();
        if status.as_u16() == 429 {
            return Err(RequestOutcome::RateLimited);
        }
        if !status.is_success() {
            return Err(RequestOutcome::Fatal(GeocodeError::Status {
                status: status.as_u16(),
            }));
        }

        response
            .json()
            .await
            .map_err(|e| RequestOutcome::Fatal(GeocodeError::Schema(e.to_string())))
    }
}

impl Default for Geocoder {
    fn default() -> Self {
        Self::new()
    }
}

enum RequestOutcome {
    RateLimited,
    Transient(String),
    Fatal(GeocodeError),
}

/// One entry of a Nominatim `jsonv2` response; `lat`/`lon` arrive as strings.
#[derive(Debug, Deserialize)]
struct Place {
    lat: String,
    lon: String,
    #[serde(default)]
    display_name: String,
    #[serde(default)]
    address: Address,
}

#[derive(Debug, Default, Deserialize)]
struct Address {
    city: Option<String>,
    town: Option<String>,
    village: Option<String>,
    municipality: Option<String>,
    state: Option<String>,
    country: Option<String>,
    country_code: Option<String>,
}

fn to_result(place: Place) -> Result<GeoResult, GeocodeError> {
    let parse = |field: &str, raw: &str| {
        raw.parse::<f64>()
            .map_err(|_| GeocodeError::Schema(format!("bad {field} value '{raw}'")))
    };

    let address = place.address;
    Ok(GeoResult {
        latitude: parse("lat", &place.lat)?,
        longitude: parse("lon", &place.lon)?,
        display_name: place.display_name,
        city: address
            .city
            .or(address.town)
            .or(address.village)
            .or(address.municipality),
        state: address.state,
        country: address.country,
        country_code: address
            .country_code
            .map(|c| c.to_uppercase())
            .filter(|c| !c.is_empty()),
    })
}
