pub mod client;
pub mod handler;

use serde::{Deserialize, Serialize};

/// JSON body of `GET /file`, selecting one file inside a bucket.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DownloadFileRequest {
    pub file: String,
}
