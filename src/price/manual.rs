//! In-process feed whose answer is set by hand. Used by tests and dry runs.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

use super::{OracleFeed, OracleReading, PriceError};
use crate::units::PriceE8;

pub struct ManualFeed {
    name: String,
    answer: Mutex<Result<OracleReading, String>>,
    calls: AtomicUsize,
}

impl ManualFeed {
    /// New feed with no answer yet (reads fail until [`ManualFeed::set`]).
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            answer: Mutex::new(Err("no price published".to_string())),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn with_price(name: &str, value: PriceE8, updated_at: i64) -> Self {
        let feed = Self::new(name);
        feed.set(value, updated_at);
        feed
    }

    pub fn set(&self, value: PriceE8, updated_at: i64) {
        *self.answer.lock() = Ok(OracleReading { value, updated_at });
    }

    pub fn fail(&self, reason: &str) {
        *self.answer.lock() = Err(reason.to_string());
    }

    /// Number of `latest()` calls served so far.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl OracleFeed for ManualFeed {
    fn name(&self) -> &str {
        &self.name
    }

    fn latest(&self) -> Result<OracleReading, PriceError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.answer
            .lock()
            .clone()
            .map_err(|reason| PriceError::unavailable(&self.name, reason))
    }
}
