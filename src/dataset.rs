//! Dataset Assembler
//!
//! Joins production readings with weather records on exact hour timestamps,
//! applies the data-quality filters, and provides the chronological
//! train/test split. PV data carries strong diurnal and seasonal
//! autocorrelation, so the split is positional over time-ordered rows;
//! shuffling would leak future hours into training and produce optimistic
//! error estimates.

use chrono::{DateTime, Utc};
use itertools::{merge_join_by, EitherOrBoth};
use thiserror::Error;

use crate::solar;
use crate::sources::WeatherRecord;

/// Minimum joined rows for plain training.
pub const MIN_TRAIN_ROWS: usize = 100;
/// Minimum joined rows for hyperparameter tuning (cross-validation
/// subdivides the data further).
pub const MIN_TUNE_ROWS: usize = 500;
/// Fraction of rows that form the chronological training prefix.
pub const TRAIN_FRACTION: f64 = 0.8;

/// One hourly inverter reading, as imported from the production log.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProductionReading {
    /// Hour start, UTC seconds.
    pub timestamp: i64,
    pub production_w: i64,
    /// Output was capped by an export limit during this hour.
    pub curtailed: bool,
}

#[derive(Debug, Error)]
pub enum DataError {
    #[error("insufficient data: {actual} joined rows, need at least {required}")]
    Insufficient { actual: usize, required: usize },

    #[error("no joined production/weather rows for {year}")]
    EmptyYear { year: i32 },

    #[error("{collection} rows are not sorted by timestamp ascending")]
    Unsorted { collection: &'static str },
}

/// One joined row: the weather for an hour plus the production it yielded.
#[derive(Debug, Clone, Copy)]
pub struct Sample {
    pub weather: WeatherRecord,
    pub production_w: i64,
}

/// Time-ordered joined dataset.
#[derive(Debug, Clone, Default)]
pub struct Dataset {
    pub samples: Vec<Sample>,
}

impl Dataset {
    /// Inner-join production and weather on exact timestamp equality.
    ///
    /// Both inputs must be sorted by timestamp ascending with unique keys
    /// (the storage layer reads them that way). Rows are dropped when
    /// `curtailed` is set, production is negative, or the weather row has no
    /// usable GHI; curtailed hours would teach the model a capped
    /// weather-to-power relationship.
    pub fn assemble(
        production: &[ProductionReading],
        weather: &[WeatherRecord],
    ) -> Result<Self, DataError> {
        if !production.windows(2).all(|w| w[0].timestamp < w[1].timestamp) {
            return Err(DataError::Unsorted {
                collection: "production",
            });
        }
        if !weather.windows(2).all(|w| w[0].timestamp < w[1].timestamp) {
            return Err(DataError::Unsorted {
                collection: "weather",
            });
        }

        let samples: Vec<Sample> = merge_join_by(production, weather, |reading, row| {
            reading.timestamp.cmp(&row.timestamp)
        })
        .filter_map(|pair| match pair {
            EitherOrBoth::Both(reading, row)
                if !reading.curtailed && reading.production_w >= 0 && row.ghi_wm2.is_finite() =>
            {
                Some(Sample {
                    weather: *row,
                    production_w: reading.production_w,
                })
            }
            _ => None,
        })
        .collect();

        if !samples
            .windows(2)
            .all(|w| w[0].weather.timestamp < w[1].weather.timestamp)
        {
            return Err(DataError::Unsorted {
                collection: "joined",
            });
        }

        Ok(Self { samples })
    }

    /// Keep rows whose UTC calendar year lies in the inclusive bounds.
    pub fn filter_years(mut self, since: Option<i32>, until: Option<i32>) -> Self {
        if since.is_none() && until.is_none() {
            return self;
        }
        self.samples.retain(|sample| {
            let year = timestamp_year(sample.weather.timestamp);
            since.map_or(true, |y| year >= y) && until.map_or(true, |y| year <= y)
        });
        self
    }

    /// Estimate DHI for rows where the stored weather carries none.
    pub fn fill_missing_dhi(&mut self, latitude: f64, longitude: f64) {
        for sample in &mut self.samples {
            let weather = &mut sample.weather;
            if weather.dhi_wm2.is_none() {
                let elevation = solar::sun_elevation(weather.timestamp, latitude, longitude);
                weather.dhi_wm2 = Some(solar::estimate_dhi(
                    weather.ghi_wm2,
                    f64::from(weather.cloud_cover_pct),
                    elevation,
                ));
            }
        }
    }

    pub fn require_at_least(&self, required: usize) -> Result<(), DataError> {
        if self.samples.len() < required {
            return Err(DataError::Insufficient {
                actual: self.samples.len(),
                required,
            });
        }
        Ok(())
    }

    /// Positional split: the first `floor(fraction * len)` rows train, the
    /// rest test. Row order is taken exactly as given.
    pub fn split(&self, train_fraction: f64) -> (&[Sample], &[Sample]) {
        let boundary = (self.samples.len() as f64 * train_fraction).floor() as usize;
        self.samples.split_at(boundary)
    }

    pub fn weather_rows(&self) -> Vec<WeatherRecord> {
        self.samples.iter().map(|s| s.weather).collect()
    }

    pub fn targets(&self) -> Vec<f64> {
        self.samples.iter().map(|s| s.production_w as f64).collect()
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }
}

fn timestamp_year(timestamp: i64) -> i32 {
    use chrono::Datelike;
    DateTime::<Utc>::from_timestamp(timestamp, 0)
        .unwrap_or_default()
        .year()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn weather(timestamp: i64) -> WeatherRecord {
        WeatherRecord {
            timestamp,
            ghi_wm2: 200.0,
            cloud_cover_pct: 30,
            temperature_c: 15.0,
            wind_speed_ms: 2.0,
            humidity_pct: 60,
            dhi_wm2: Some(80.0),
            dni_wm2: 0.0,
        }
    }

    fn reading(timestamp: i64, production_w: i64) -> ProductionReading {
        ProductionReading {
            timestamp,
            production_w,
            curtailed: false,
        }
    }

    fn hourly(n: usize) -> (Vec<ProductionReading>, Vec<WeatherRecord>) {
        let production = (0..n).map(|i| reading(i as i64 * 3600, 100)).collect();
        let weather = (0..n).map(|i| weather(i as i64 * 3600)).collect();
        (production, weather)
    }

    #[test]
    fn test_inner_join_keeps_only_matching_hours() {
        let production = vec![reading(0, 50), reading(3600, 60), reading(7200, 70)];
        let weather = vec![weather(3600), weather(7200), weather(10800)];

        let dataset = Dataset::assemble(&production, &weather).unwrap();

        let timestamps: Vec<i64> =
            dataset.samples.iter().map(|s| s.weather.timestamp).collect();
        assert_eq!(timestamps, vec![3600, 7200]);
    }

    #[test]
    fn test_curtailed_and_negative_rows_are_dropped() {
        let mut curtailed = reading(0, 500);
        curtailed.curtailed = true;
        let production = vec![curtailed, reading(3600, -5), reading(7200, 300)];
        let weather = vec![weather(0), weather(3600), weather(7200)];

        let dataset = Dataset::assemble(&production, &weather).unwrap();

        assert_eq!(dataset.len(), 1);
        assert_eq!(dataset.samples[0].production_w, 300);
    }

    #[test]
    fn test_unsorted_input_is_rejected() {
        let production = vec![reading(3600, 10), reading(0, 20)];
        let weather = vec![weather(0), weather(3600)];

        let err = Dataset::assemble(&production, &weather).unwrap_err();
        assert!(matches!(err, DataError::Unsorted { collection: "production" }));
    }

    #[test]
    fn test_split_boundary_is_floor() {
        let (production, weather) = hourly(99);
        let dataset = Dataset::assemble(&production, &weather).unwrap();

        let (train, test) = dataset.split(TRAIN_FRACTION);

        // floor(0.8 * 99) = 79
        assert_eq!(train.len(), 79);
        assert_eq!(test.len(), 20);
    }

    #[test]
    fn test_split_takes_order_as_given() {
        // Split never re-sorts; a deliberately reordered dataset splits at
        // the same positional boundary.
        let samples: Vec<Sample> = [7200, 0, 3600, 10800, 14400]
            .iter()
            .map(|&ts| Sample {
                weather: weather(ts),
                production_w: 1,
            })
            .collect();
        let dataset = Dataset { samples };

        let (train, test) = dataset.split(TRAIN_FRACTION);

        assert_eq!(train.len(), 4);
        assert_eq!(test.len(), 1);
        assert_eq!(train[0].weather.timestamp, 7200);
        assert_eq!(test[0].weather.timestamp, 14400);
    }

    #[test]
    fn test_year_filter_inclusive() {
        let years = [2021, 2022, 2023, 2024];
        let production: Vec<ProductionReading> = years
            .iter()
            .map(|&y| {
                let ts = Utc.with_ymd_and_hms(y, 6, 1, 12, 0, 0).unwrap().timestamp();
                reading(ts, 100)
            })
            .collect();
        let rows: Vec<WeatherRecord> =
            production.iter().map(|r| weather(r.timestamp)).collect();

        let dataset = Dataset::assemble(&production, &rows)
            .unwrap()
            .filter_years(Some(2022), Some(2023));

        let kept: Vec<i32> = dataset
            .samples
            .iter()
            .map(|s| timestamp_year(s.weather.timestamp))
            .collect();
        assert_eq!(kept, vec![2022, 2023]);
    }

    #[test]
    fn test_minimum_row_gate() {
        let (production, weather) = hourly(99);
        let dataset = Dataset::assemble(&production, &weather).unwrap();

        let err = dataset.require_at_least(MIN_TRAIN_ROWS).unwrap_err();
        assert!(matches!(
            err,
            DataError::Insufficient {
                actual: 99,
                required: 100
            }
        ));

        let (production, weather) = hourly(100);
        let dataset = Dataset::assemble(&production, &weather).unwrap();
        assert!(dataset.require_at_least(MIN_TRAIN_ROWS).is_ok());
    }

    #[test]
    fn test_missing_dhi_is_estimated() {
        let noon = Utc.with_ymd_and_hms(2024, 6, 1, 11, 0, 0).unwrap().timestamp();
        let mut row = weather(noon);
        row.ghi_wm2 = 500.0;
        row.dhi_wm2 = None;

        let mut dataset =
            Dataset::assemble(&[reading(noon, 2000)], &[row]).unwrap();
        dataset.fill_missing_dhi(51.83, 7.28);

        let dhi = dataset.samples[0].weather.dhi_wm2.unwrap();
        assert!(dhi > 0.0 && dhi <= 500.0);
    }
}
