//! Remote (AMIE) service collaborator

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use reqwest::Client;
use serde::Deserialize;
use tracing::debug;

use crate::config::AmieConfig;
use crate::error::ServiceError;
use crate::packet::Packet;
use crate::retry::RetryingProxy;

/// The single proxy all remote service calls go through
pub type RemoteServiceProxy = RetryingProxy<dyn RemoteService>;

#[async_trait]
pub trait RemoteService: Send + Sync {
    /// Packets updated since `update_time_start`, or all active ones when `None`
    async fn list_packets(&self, update_time_start: Option<DateTime<Utc>>) -> Result<Vec<Packet>, ServiceError>;

    async fn send_packet(&self, packet: &Packet) -> Result<(), ServiceError>;
}

#[derive(Deserialize)]
struct PacketListing {
    #[serde(default)]
    result: Vec<Packet>,
}

/// AMIE REST client
pub struct AmieClient {
    site_name: String,
    api_key: String,
    base_url: String,
    http: Client,
}

impl AmieClient {
    /// Create a client from config; the API key comes from the environment
    pub fn from_config(config: &AmieConfig) -> Result<Self, ServiceError> {
        debug!(site_name = %config.site_name, base_url = %config.base_url, "AmieClient::from_config: called");
        let api_key = config
            .get_api_key()
            .map_err(|e| ServiceError::Internal(e.to_string()))?;
        let http = Client::builder()
            .timeout(Duration::from_millis(config.timeout_ms))
            .build()
            .map_err(ServiceError::from_http)?;

        Ok(Self {
            site_name: config.site_name.clone(),
            api_key,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            http,
        })
    }

    fn packets_url(&self) -> String {
        format!("{}/packets/{}/", self.base_url, self.site_name)
    }

    async fn check(response: reqwest::Response) -> Result<reqwest::Response, ServiceError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let text = response.text().await.unwrap_or_default();
        debug!(status = status.as_u16(), "AmieClient::check: error response");
        Err(ServiceError::from_status(status.as_u16(), text))
    }
}

#[async_trait]
impl RemoteService for AmieClient {
    async fn list_packets(&self, update_time_start: Option<DateTime<Utc>>) -> Result<Vec<Packet>, ServiceError> {
        debug!(?update_time_start, "AmieClient::list_packets: called");
        let mut request = self
            .http
            .get(self.packets_url())
            .header("XA-SITE", &self.site_name)
            .header("XA-API-KEY", &self.api_key);
        if let Some(start) = update_time_start {
            request = request.query(&[("update_time_start", start.to_rfc3339_opts(SecondsFormat::Secs, true))]);
        }

        let response = request.send().await.map_err(ServiceError::from_http)?;
        let listing: PacketListing = Self::check(response).await?.json().await.map_err(ServiceError::from_http)?;
        debug!(count = listing.result.len(), "AmieClient::list_packets: received");
        Ok(listing.result)
    }

    async fn send_packet(&self, packet: &Packet) -> Result<(), ServiceError> {
        debug!(packet = %packet.label(), "AmieClient::send_packet: called");
        let response = self
            .http
            .post(self.packets_url())
            .header("XA-SITE", &self.site_name)
            .header("XA-API-KEY", &self.api_key)
            .json(packet)
            .send()
            .await
            .map_err(ServiceError::from_http)?;
        Self::check(response).await?;
        Ok(())
    }
}

#[cfg(test)]
pub mod mock {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Remote service that replays queued listings and records sends
    pub struct MockRemoteService {
        listings: Mutex<VecDeque<Vec<Packet>>>,
        sent: Mutex<Vec<Packet>>,
        list_failures: AtomicUsize,
        list_count: AtomicUsize,
    }

    impl MockRemoteService {
        pub fn new() -> Self {
            debug!("MockRemoteService::new: called");
            Self {
                listings: Mutex::new(VecDeque::new()),
                sent: Mutex::new(Vec::new()),
                list_failures: AtomicUsize::new(0),
                list_count: AtomicUsize::new(0),
            }
        }

        /// Queue the result of one future `list_packets` call
        pub fn queue_listing(&self, packets: Vec<Packet>) {
            self.listings.lock().unwrap().push_back(packets);
        }

        /// Make the next `n` listings fail with a connection error
        pub fn fail_listings(&self, n: usize) {
            self.list_failures.store(n, Ordering::SeqCst);
        }

        pub fn sent(&self) -> Vec<Packet> {
            self.sent.lock().unwrap().clone()
        }

        pub fn list_count(&self) -> usize {
            self.list_count.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl RemoteService for MockRemoteService {
        async fn list_packets(&self, update_time_start: Option<DateTime<Utc>>) -> Result<Vec<Packet>, ServiceError> {
            debug!(?update_time_start, "MockRemoteService::list_packets: called");
            self.list_count.fetch_add(1, Ordering::SeqCst);
            let failures = self.list_failures.load(Ordering::SeqCst);
            if failures > 0 {
                self.list_failures.store(failures - 1, Ordering::SeqCst);
                return Err(ServiceError::Connection("connection reset".to_string()));
            }
            Ok(self.listings.lock().unwrap().pop_front().unwrap_or_default())
        }

        async fn send_packet(&self, packet: &Packet) -> Result<(), ServiceError> {
            debug!(packet = %packet.label(), "MockRemoteService::send_packet: called");
            self.sent.lock().unwrap().push(packet.clone());
            Ok(())
        }
    }
}
