// Copyright PingCAP Inc. 2025.
//
// This program is free software; you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation; version 2 of the License.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License along
// with this program; if not, write to the Free Software Foundation, Inc.,
// 51 Franklin Street, Fifth Floor, Boston, MA 02110-1301 USA.

use crate::api::DownloadFileRequest;
use crate::bucket::BucketId;
use crate::tarstream::{self, TarStreamError};
use futures_util::TryStreamExt;
use std::io;
use std::path::Path;
use thiserror::Error;
use tokio_util::io::{StreamReader, SyncIoBridge};

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("request failed: {0}")]
    Http(#[from] reqwest::Error),
    /// Non-success status; carries the peer's response body text.
    #[error("{0}")]
    Remote(String),
    #[error(transparent)]
    Tar(#[from] TarStreamError),
    #[error("receive tar stream: {0}")]
    Io(#[from] io::Error),
}

/// HTTP client for pulling buckets (or single files) from a peer instance.
pub struct Client {
    endpoint: String,
    http: reqwest::Client,
}

impl Client {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            http: reqwest::Client::new(),
        }
    }

    /// Streams the peer's `GET /bucket` tar response into `dir`.
    pub async fn download_bucket(&self, id: &BucketId, dir: &Path) -> Result<(), ClientError> {
        let url = format!("{}/bucket?id={}", self.endpoint, id);
        let resp = self.http.get(&url).send().await?;
        receive_into(resp, dir).await
    }

    /// Streams the peer's `GET /file` tar response into `dir`.
    pub async fn download_file(
        &self,
        id: &BucketId,
        file: &str,
        dir: &Path,
    ) -> Result<(), ClientError> {
        let url = format!("{}/file?bucket-id={}", self.endpoint, id);
        let resp = self
            .http
            .get(&url)
            .json(&DownloadFileRequest {
                file: file.to_string(),
            })
            .send()
            .await?;
        receive_into(resp, dir).await
    }
}

async fn receive_into(resp: reqwest::Response, dir: &Path) -> Result<(), ClientError> {
    if !resp.status().is_success() {
        let body = resp.text().await.unwrap_or_default();
        return Err(ClientError::Remote(body));
    }

    let reader = StreamReader::new(resp.bytes_stream().map_err(io::Error::other));
    let dir = dir.to_path_buf();
    tokio::task::spawn_blocking(move || tarstream::receive(&dir, SyncIoBridge::new(reader)))
        .await
        .map_err(io::Error::other)??;

    Ok(())
}
