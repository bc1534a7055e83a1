//! Data source abstraction.
//!
//! Defines the traits the engine reads bars and universes through. Fetching
//! and parsing raw market data is the implementor's concern.

use async_trait::async_trait;
use chrono::NaiveDate;
use std::sync::Arc;

use super::{InstrumentBar, InstrumentRef};
use crate::error::FetchError;

// ============================================================================
// Indicator Source
// ============================================================================

/// Supplies a bounded window of daily bars for one instrument.
///
/// Implementations may fail, time out, or return fewer bars than requested;
/// the caller decides whether the window is usable.
#[async_trait]
pub trait IndicatorSource: Send + Sync {
    /// Get the source name (e.g., "snapshot")
    fn name(&self) -> &'static str;

    /// Fetch daily bars for `instrument_id` within `[start, end]`.
    async fn fetch(
        &self,
        instrument_id: &str,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<Vec<InstrumentBar>, FetchError>;
}

#[async_trait]
impl<S: IndicatorSource + ?Sized> IndicatorSource for Arc<S> {
    fn name(&self) -> &'static str {
        (**self).name()
    }

    async fn fetch(
        &self,
        instrument_id: &str,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<Vec<InstrumentBar>, FetchError> {
        (**self).fetch(instrument_id, start, end).await
    }
}

// ============================================================================
// Universe Provider
// ============================================================================

/// Lists the instruments of a market.
#[async_trait]
pub trait UniverseProvider: Send + Sync {
    /// List instruments for `market` ("ALL" for every market the provider knows).
    async fn list_instruments(&self, market: &str) -> Result<Vec<InstrumentRef>, FetchError>;
}

#[async_trait]
impl<P: UniverseProvider + ?Sized> UniverseProvider for Arc<P> {
    async fn list_instruments(&self, market: &str) -> Result<Vec<InstrumentRef>, FetchError> {
        (**self).list_instruments(market).await
    }
}
