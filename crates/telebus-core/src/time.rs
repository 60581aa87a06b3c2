//! TAI time service backed by a swappable leap-second table.
//!
//! Message timestamps are TAI seconds since the unix epoch. Converting from
//! the UTC system clock needs the table of leap seconds; the table has an
//! expiry date and must be refreshed before it lapses. Readers take an `Arc`
//! snapshot of the table, so a refresh never blocks a conversion.

use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use arc_swap::ArcSwap;
use chrono::NaiveDate;
use tokio::task::JoinHandle;

use crate::error::{Error, Result};

/// Seconds per day.
pub const SECONDS_PER_DAY: f64 = 86_400.0;

/// Refresh the table this long before it expires.
pub const DEFAULT_REFRESH_MARGIN: Duration = Duration::from_secs(10 * 86_400);

/// TAI-UTC after each leap second since integer leap seconds began.
const BUILTIN_LEAP_SECONDS: &[(i32, u32, f64)] = &[
    (1972, 1, 10.0),
    (1972, 7, 11.0),
    (1973, 1, 12.0),
    (1974, 1, 13.0),
    (1975, 1, 14.0),
    (1976, 1, 15.0),
    (1977, 1, 16.0),
    (1978, 1, 17.0),
    (1979, 1, 18.0),
    (1980, 1, 19.0),
    (1981, 7, 20.0),
    (1982, 7, 21.0),
    (1983, 7, 22.0),
    (1985, 7, 23.0),
    (1988, 1, 24.0),
    (1990, 1, 25.0),
    (1991, 1, 26.0),
    (1992, 7, 27.0),
    (1993, 7, 28.0),
    (1994, 7, 29.0),
    (1996, 1, 30.0),
    (1997, 7, 31.0),
    (1999, 1, 32.0),
    (2006, 1, 33.0),
    (2009, 1, 34.0),
    (2012, 7, 35.0),
    (2015, 7, 36.0),
    (2017, 1, 37.0),
];

/// Expiry date of the built-in table.
const BUILTIN_EXPIRES: (i32, u32, u32) = (2028, 12, 28);

fn utc_unix_of(year: i32, month: u32, day: u32) -> Option<f64> {
    NaiveDate::from_ymd_opt(year, month, day)
        .and_then(|date| date.and_hms_opt(0, 0, 0))
        .map(|dt| dt.and_utc().timestamp() as f64)
}

/// Current UTC time in unix seconds.
pub fn utc_now_unix() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

/// One row of the leap-second table.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LeapSecond {
    /// UTC unix time at which `tai_minus_utc` takes effect.
    pub utc_unix: f64,
    /// TAI-UTC in seconds from then on.
    pub tai_minus_utc: f64,
}

/// Immutable leap-second table with an expiry date.
#[derive(Debug, Clone, PartialEq)]
pub struct LeapSecondTable {
    entries: Vec<LeapSecond>,
    expires_utc: f64,
}

impl LeapSecondTable {
    /// Build a table; entries must be non-empty and strictly increasing,
    /// and the expiry must follow the last entry.
    pub fn new(entries: Vec<LeapSecond>, expires_utc: f64) -> Result<Self> {
        let Some(last) = entries.last() else {
            return Err(Error::InvalidValue("leap second table is empty".into()));
        };
        if entries.windows(2).any(|w| w[0].utc_unix >= w[1].utc_unix) {
            return Err(Error::InvalidValue(
                "leap second table is not sorted".into(),
            ));
        }
        if expires_utc <= last.utc_unix {
            return Err(Error::InvalidValue(format!(
                "leap second table expires at {expires_utc}, before its last entry"
            )));
        }
        Ok(Self {
            entries,
            expires_utc,
        })
    }

    /// The table compiled into this crate.
    pub fn builtin() -> Self {
        let entries = BUILTIN_LEAP_SECONDS
            .iter()
            .filter_map(|&(year, month, tai_minus_utc)| {
                utc_unix_of(year, month, 1).map(|utc_unix| LeapSecond {
                    utc_unix,
                    tai_minus_utc,
                })
            })
            .collect();
        let (year, month, day) = BUILTIN_EXPIRES;
        Self {
            entries,
            expires_utc: utc_unix_of(year, month, day).unwrap_or(f64::MAX),
        }
    }

    pub fn entries(&self) -> &[LeapSecond] {
        &self.entries
    }

    /// Expiry date in UTC unix seconds.
    pub fn expires_utc(&self) -> f64 {
        self.expires_utc
    }

    /// TAI-UTC at `utc_unix`.
    ///
    /// Unix seconds are assumed to be smeared uniformly over the day before a
    /// leap second, so the offset ramps linearly across that day.
    pub fn tai_minus_utc(&self, utc_unix: f64) -> Result<f64> {
        if utc_unix > self.expires_utc - SECONDS_PER_DAY {
            return Err(Error::InvalidValue(format!(
                "{utc_unix} is within one day of the leap second table expiry {}",
                self.expires_utc
            )));
        }
        let i = self.entries.partition_point(|e| e.utc_unix <= utc_unix);
        if i == 0 {
            return Err(Error::InvalidValue(format!(
                "{utc_unix} precedes integer leap seconds"
            )));
        }
        let current = self.entries[i - 1];
        match self.entries.get(i) {
            Some(next) if utc_unix + SECONDS_PER_DAY > next.utc_unix => {
                let days = utc_unix / SECONDS_PER_DAY;
                let frac_day = days - days.floor();
                Ok(current.tai_minus_utc + (next.tai_minus_utc - current.tai_minus_utc) * frac_day)
            }
            _ => Ok(current.tai_minus_utc),
        }
    }
}

/// Provider of fresh leap-second tables.
pub trait LeapSecondSource: Send + Sync {
    fn load(&self) -> Result<LeapSecondTable>;
}

/// Converts UTC to TAI through an atomically replaceable table.
#[derive(Debug)]
pub struct TimeService {
    table: ArcSwap<LeapSecondTable>,
}

impl TimeService {
    pub fn new(table: LeapSecondTable) -> Self {
        Self {
            table: ArcSwap::from_pointee(table),
        }
    }

    /// Time service using [`LeapSecondTable::builtin`].
    pub fn builtin() -> Self {
        Self::new(LeapSecondTable::builtin())
    }

    /// Snapshot of the current table.
    pub fn table(&self) -> Arc<LeapSecondTable> {
        self.table.load_full()
    }

    /// Replace the table; conversions in flight keep their snapshot.
    pub fn replace(&self, table: LeapSecondTable) {
        self.table.store(Arc::new(table));
    }

    /// Load a table from `source` and install it.
    pub fn refresh(&self, source: &dyn LeapSecondSource) -> Result<()> {
        let table = source.load()?;
        tracing::info!(expires_utc = table.expires_utc(), "Leap second table refreshed");
        self.replace(table);
        Ok(())
    }

    /// TAI unix seconds for a UTC unix time.
    pub fn tai_from_utc_unix(&self, utc_unix: f64) -> Result<f64> {
        let table = self.table.load();
        Ok(utc_unix + table.tai_minus_utc(utc_unix)?)
    }

    /// Current TAI unix seconds.
    pub fn current_tai(&self) -> Result<f64> {
        self.tai_from_utc_unix(utc_now_unix())
    }

    /// TAI for message stamps: outside the table's range the nearest known
    /// offset is used instead of failing.
    pub fn stamp_tai(&self, utc_unix: f64) -> f64 {
        let table = self.table.load();
        match table.tai_minus_utc(utc_unix) {
            Ok(offset) => utc_unix + offset,
            Err(err) => {
                tracing::debug!(error = %err, "Extrapolating TAI outside the leap second table");
                let entries = table.entries();
                let nearest = if entries
                    .first()
                    .is_some_and(|first| utc_unix < first.utc_unix)
                {
                    entries.first()
                } else {
                    entries.last()
                };
                utc_unix + nearest.map(|e| e.tai_minus_utc).unwrap_or(0.0)
            }
        }
    }

    /// Current TAI for message stamps.
    pub fn stamp_now(&self) -> f64 {
        self.stamp_tai(utc_now_unix())
    }

    /// Refresh the table from `source` `margin` before each expiry, until the
    /// returned task is aborted.
    pub fn spawn_auto_refresh(
        self: &Arc<Self>,
        source: Arc<dyn LeapSecondSource>,
        margin: Duration,
    ) -> JoinHandle<()> {
        let service = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                let refresh_at = service.table().expires_utc() - margin.as_secs_f64();
                let delay = refresh_at - utc_now_unix();
                if delay > 0.0 {
                    tokio::time::sleep(Duration::from_secs_f64(delay)).await;
                }
                if let Err(e) = service.refresh(source.as_ref()) {
                    tracing::warn!(error = %e, "Failed to refresh leap second table");
                }
                let remaining = service.table().expires_utc() - margin.as_secs_f64() - utc_now_unix();
                if remaining <= 0.0 {
                    // The source has nothing newer yet; try again tomorrow.
                    tokio::time::sleep(Duration::from_secs_f64(SECONDS_PER_DAY)).await;
                }
            }
        })
    }
}

impl Default for TimeService {
    fn default() -> Self {
        Self::builtin()
    }
}
