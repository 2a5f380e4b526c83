//! Peer data node client
//!
//! Repair and replica comparison talk to other data nodes over their HTTP
//! API. Hosts are replica addresses (`ip:port`); the request goes to the same
//! ip on the configured HTTP port.

use async_trait::async_trait;
use bytes::Bytes;
use cubefs_common::{Error, ExtentInfo, HttpReply, PeerConfig, Result};
use reqwest::StatusCode;
use serde::Deserialize;
use serde::de::DeserializeOwned;

/// Response header carrying the crc32 of an `/extentData` body
pub const EXTENT_CRC_HEADER: &str = "x-extent-crc";

/// Offsets of the next data run of a tiny extent
#[derive(Clone, Copy, Debug, PartialEq, Eq, serde::Serialize, Deserialize)]
pub struct AvailRange {
    pub start: u64,
    pub end: u64,
}

#[async_trait]
pub trait PeerClient: Send + Sync {
    /// Info entry of an extent on `host`; `ExtentNotFound` if it has none
    async fn extent_info(&self, host: &str, partition_id: u64, extent_id: u64) -> Result<ExtentInfo>;

    /// Repair read of `[offset, offset + size)`; returns the bytes and their crc
    async fn read_extent(
        &self,
        host: &str,
        partition_id: u64,
        extent_id: u64,
        offset: u64,
        size: u64,
    ) -> Result<(Bytes, u32)>;

    /// Next data run of a tiny extent at or after `offset`
    async fn tiny_extent_avail_offset(
        &self,
        host: &str,
        partition_id: u64,
        extent_id: u64,
        offset: u64,
    ) -> Result<AvailRange>;
}

/// `ip` part of an `ip:port` replica address
pub fn host_ip(host: &str) -> &str {
    host.rsplit_once(':').map_or(host, |(ip, _)| ip)
}

pub struct HttpPeerClient {
    client: reqwest::Client,
    http_port: u16,
}

fn map_send_error(host: &str, e: &reqwest::Error) -> Error {
    if e.is_timeout() {
        Error::Timeout
    } else {
        Error::PeerUnreachable(format!("{host}: {e}"))
    }
}

impl HttpPeerClient {
    pub fn new(config: &PeerConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(config.connect_timeout())
            .timeout(config.request_timeout())
            .pool_idle_timeout(config.idle_timeout())
            .build()
            .map_err(|e| Error::Configuration(format!("peer http client: {e}")))?;
        Ok(Self {
            client,
            http_port: config.http_port,
        })
    }

    fn url(&self, host: &str, path: &str) -> String {
        format!("http://{}:{}{path}", host_ip(host), self.http_port)
    }

    async fn get(&self, host: &str, path: &str, query: &[(&str, String)]) -> Result<reqwest::Response> {
        let response = self
            .client
            .get(self.url(host, path))
            .query(query)
            .send()
            .await
            .map_err(|e| map_send_error(host, &e))?;
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        if status == StatusCode::NOT_FOUND {
            // the extent id is in the query; callers map it
            return Err(Error::ExtentNotFound(0));
        }
        Err(Error::PeerUnreachable(format!("{host}{path} returned {status}: {body}")))
    }

    async fn get_json<T: DeserializeOwned>(
        &self,
        host: &str,
        path: &str,
        query: &[(&str, String)],
    ) -> Result<T> {
        let reply: HttpReply<T> = self
            .get(host, path, query)
            .await?
            .json()
            .await
            .map_err(|e| Error::Deserialization(format!("{host}{path}: {e}")))?;
        if reply.code != HttpReply::<T>::CODE_OK {
            return Err(Error::PeerUnreachable(format!("{host}{path}: {}", reply.msg)));
        }
        reply
            .data
            .ok_or_else(|| Error::Deserialization(format!("{host}{path}: empty reply")))
    }
}

fn not_found_as(extent_id: u64) -> impl FnOnce(Error) -> Error {
    move |e| match e {
        Error::ExtentNotFound(_) => Error::ExtentNotFound(extent_id),
        other => other,
    }
}

#[async_trait]
impl PeerClient for HttpPeerClient {
    async fn extent_info(&self, host: &str, partition_id: u64, extent_id: u64) -> Result<ExtentInfo> {
        self.get_json(
            host,
            "/extentInfo",
            &[
                ("partition", partition_id.to_string()),
                ("extent", extent_id.to_string()),
            ],
        )
        .await
        .map_err(not_found_as(extent_id))
    }

    async fn read_extent(
        &self,
        host: &str,
        partition_id: u64,
        extent_id: u64,
        offset: u64,
        size: u64,
    ) -> Result<(Bytes, u32)> {
        let response = self
            .get(
                host,
                "/extentData",
                &[
                    ("partition", partition_id.to_string()),
                    ("extent", extent_id.to_string()),
                    ("offset", offset.to_string()),
                    ("size", size.to_string()),
                    ("repair", "1".to_string()),
                ],
            )
            .await
            .map_err(not_found_as(extent_id))?;
        let crc = response
            .headers()
            .get(EXTENT_CRC_HEADER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<u32>().ok())
            .ok_or_else(|| Error::Deserialization(format!("{host}: missing {EXTENT_CRC_HEADER}")))?;
        let data = response
            .bytes()
            .await
            .map_err(|e| map_send_error(host, &e))?;
        Ok((data, crc))
    }

    async fn tiny_extent_avail_offset(
        &self,
        host: &str,
        partition_id: u64,
        extent_id: u64,
        offset: u64,
    ) -> Result<AvailRange> {
        self.get_json(
            host,
            "/tinyExtentAvail",
            &[
                ("partition", partition_id.to_string()),
                ("extent", extent_id.to_string()),
                ("offset", offset.to_string()),
            ],
        )
        .await
        .map_err(not_found_as(extent_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_host_ip() {
        assert_eq!(host_ip("10.0.0.1:17310"), "10.0.0.1");
        assert_eq!(host_ip("node-a"), "node-a");
    }

    #[test]
    fn test_url_uses_http_port() {
        let config = PeerConfig {
            http_port: 9000,
            ..PeerConfig::default()
        };
        let client = HttpPeerClient::new(&config).unwrap();
        assert_eq!(
            client.url("10.0.0.1:17310", "/extentInfo"),
            "http://10.0.0.1:9000/extentInfo"
        );
    }

    #[tokio::test]
    async fn test_unreachable_peer() {
        let config = PeerConfig {
            http_port: 1,
            peer_connect: 200_000_000,
            ..PeerConfig::default()
        };
        let client = HttpPeerClient::new(&config).unwrap();
        let err = client.extent_info("127.0.0.1:1", 1, 1024).await.unwrap_err();
        assert!(err.is_retryable(), "{err}");
    }
}
