//! Data node backed source reader
//!
//! Cache blocks are filled from `/extentData` on the replicas listed in each
//! source, leader first. A source is buffered whole before it reaches the
//! block so a replica that fails halfway never leaves partial bytes behind.

use async_trait::async_trait;
use cubefs_cache::{BlockSink, SourceReader};
use cubefs_common::checksum::crc32;
use cubefs_common::{BLOCK_SIZE, DataSource, Error, PeerConfig, Result};
use cubefs_datanode::peer::{EXTENT_CRC_HEADER, host_ip};
use tracing::{debug, warn};

pub struct DataNodeSourceReader {
    client: reqwest::Client,
    http_port: u16,
}

impl DataNodeSourceReader {
    pub fn new(config: &PeerConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(config.connect_timeout())
            .timeout(config.request_timeout())
            .pool_idle_timeout(config.idle_timeout())
            .build()
            .map_err(|e| Error::Configuration(format!("origin http client: {e}")))?;
        Ok(Self {
            client,
            http_port: config.http_port,
        })
    }

    async fn read_chunk(&self, host: &str, source: &DataSource, offset: u64, size: u64) -> Result<Vec<u8>> {
        let url = format!("http://{}:{}/extentData", host_ip(host), self.http_port);
        let response = self
            .client
            .get(url)
            .query(&[
                ("partition", source.partition_id),
                ("extent", source.extent_id),
                ("offset", offset),
                ("size", size),
            ])
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    Error::Timeout
                } else {
                    Error::PeerUnreachable(format!("{host}: {e}"))
                }
            })?;
        let status = response.status();
        if !status.is_success() {
            return Err(Error::PeerUnreachable(format!(
                "{host}/extentData returned {status}"
            )));
        }
        let crc = response
            .headers()
            .get(EXTENT_CRC_HEADER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<u32>().ok())
            .ok_or_else(|| Error::Deserialization(format!("{host}: missing {EXTENT_CRC_HEADER}")))?;
        let data = response
            .bytes()
            .await
            .map_err(|e| Error::PeerUnreachable(format!("{host}: {e}")))?;
        if data.len() as u64 != size {
            return Err(Error::range_invalid(format!(
                "{host} returned {} of {size} bytes for extent {} at {offset}",
                data.len(),
                source.extent_id
            )));
        }
        if crc32(&data) != crc {
            return Err(Error::internal(format!(
                "{host} extent {} at {offset} failed crc check",
                source.extent_id
            )));
        }
        Ok(data.to_vec())
    }

    async fn read_from(&self, host: &str, source: &DataSource) -> Result<Vec<u8>> {
        let capacity = usize::try_from(source.size).map_err(|e| Error::range_invalid(e.to_string()))?;
        let mut buf = Vec::with_capacity(capacity);
        let end = source.extent_offset + source.size;
        let mut cursor = source.extent_offset;
        while cursor < end {
            let want = (end - cursor).min(BLOCK_SIZE);
            buf.extend_from_slice(&self.read_chunk(host, source, cursor, want).await?);
            cursor += want;
        }
        Ok(buf)
    }
}

#[async_trait]
impl SourceReader for DataNodeSourceReader {
    async fn read_source(&self, source: &DataSource, sink: &mut BlockSink<'_>) -> Result<u64> {
        let mut last_err = Error::PeerUnreachable(format!(
            "partition {} extent {} has no hosts",
            source.partition_id, source.extent_id
        ));
        for host in &source.hosts {
            match self.read_from(host, source).await {
                Ok(data) => {
                    sink.write(&data)?;
                    debug!(
                        partition_id = source.partition_id,
                        extent_id = source.extent_id,
                        size = source.size,
                        %host,
                        "source cached"
                    );
                    return Ok(source.size);
                }
                Err(e) => {
                    warn!(
                        partition_id = source.partition_id,
                        extent_id = source.extent_id,
                        %host,
                        error = %e,
                        "origin read failed"
                    );
                    last_err = e;
                }
            }
        }
        Err(last_err)
    }
}
