//! REST pull tiers: the price source behind the fallback chain and the order book poller that
//! stands in for the live book socket while it is down.

use crate::{
    books::{BookEvent, BookMessage, RawBook},
    chain::{ConnectionStatus, PriceSource},
    error::DataError,
    quote::{RawPricePayload, Timeframe},
    source::DataSource,
};
use async_trait::async_trait;
use reqwest::Client;
use serde_json::Value;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};
use url::Url;

/// REST price endpoint returning a canonical payload (or a list whose first element is one)
/// carrying every timeframe's change fields.
#[derive(Debug, Clone)]
pub struct RestPriceSource {
    client: Client,
    url: Url,
}

impl RestPriceSource {
    /// `request_timeout` guards the connection itself; the chain applies its own tier timeout.
    pub fn new(url: Url, request_timeout: Duration) -> Result<Self, DataError> {
        let client = Client::builder().timeout(request_timeout).build()?;
        Ok(Self { client, url })
    }
}

#[async_trait]
impl PriceSource for RestPriceSource {
    async fn fetch(&self, timeframe: Timeframe) -> Result<RawPricePayload, DataError> {
        debug!(url = %self.url, %timeframe, "fetching REST price payload");

        let response = self.client.get(self.url.clone()).send().await?;
        if let Err(status_err) = response.error_for_status_ref() {
            return Err(DataError::Http(format!(
                "REST price poll failed ({}): {status_err}",
                self.url
            )));
        }

        let value = response.json::<Value>().await?;
        RawPricePayload::try_from(value)
    }
}

/// Polls a REST depth endpoint while the live book socket is not connected.
#[derive(Debug, Clone)]
pub struct RestBookPoller {
    client: Client,
    url: Url,
    interval: Duration,
}

impl RestBookPoller {
    pub fn new(url: Url, interval: Duration, request_timeout: Duration) -> Result<Self, DataError> {
        let client = Client::builder().timeout(request_timeout).build()?;
        Ok(Self {
            client,
            url,
            interval,
        })
    }

    pub async fn fetch(&self) -> Result<RawBook, DataError> {
        let response = self.client.get(self.url.clone()).send().await?;
        if let Err(status_err) = response.error_for_status_ref() {
            return Err(DataError::Http(format!(
                "REST depth poll failed ({}): {status_err}",
                self.url
            )));
        }

        Ok(response.json::<RawBook>().await?)
    }

    /// Run until the [`BookEvent`] receiver is dropped.
    ///
    /// Polls every `interval` while `live_status` is anything but
    /// [`ConnectionStatus::Connected`], and immediately whenever the live socket drops.
    pub async fn run(
        self,
        events: mpsc::Sender<BookEvent>,
        mut live_status: watch::Receiver<ConnectionStatus>,
    ) {
        info!(url = %self.url, "REST order book poller started");

        loop {
            let live_connected = *live_status.borrow_and_update() == ConnectionStatus::Connected;

            if !live_connected {
                match self.fetch().await {
                    Ok(book) => {
                        let event =
                            BookEvent::new(BookMessage::Snapshot(book), DataSource::RestFallback);
                        if events.send(event).await.is_err() {
                            break;
                        }
                    }
                    Err(error) => warn!(%error, "REST order book poll failed"),
                }
            }

            tokio::select! {
                _ = tokio::time::sleep(self.interval) => {}
                Ok(()) = live_status.changed() => {}
            }
        }

        info!("REST order book poller stopped, book feed dropped");
    }
}
