use crate::{
    error::DataError,
    quote::{RawPricePayload, Timeframe},
};
use async_trait::async_trait;

/// Pull-based price tier of the fallback chain (e.g. a REST endpoint).
///
/// Implementations only deliver a raw payload or fail; timeouts are applied by the chain.
#[async_trait]
pub trait PriceSource: Send + Sync {
    async fn fetch(&self, timeframe: Timeframe) -> Result<RawPricePayload, DataError>;
}

#[async_trait]
impl<T> PriceSource for std::sync::Arc<T>
where
    T: PriceSource + ?Sized,
{
    async fn fetch(&self, timeframe: Timeframe) -> Result<RawPricePayload, DataError> {
        (**self).fetch(timeframe).await
    }
}
