//! Camera snapshot upload over HTTP (Prusa Connect style camera API)

use std::time::Duration;

use bytes::Bytes;
use reqwest::header::CONTENT_TYPE;
use reqwest::Client;

use super::{Credentials, PushError, RemotePush};

const SNAPSHOT_PATH: &str = "/c/snapshot";

/// PUTs each frame to `{base_url}/c/snapshot` with `Token` and `Fingerprint`
/// headers
pub struct HttpPush {
    client: Client,
    url: String,
}

impl HttpPush {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, PushError> {
        let client = Client::builder()
            .timeout(timeout)
            .user_agent(concat!("framecast/", env!("CARGO_PKG_VERSION")))
            .build()?;

        Ok(Self {
            client,
            url: snapshot_url(base_url),
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

impl RemotePush for HttpPush {
    async fn upload(&self, frame: Bytes, credentials: &Credentials) -> Result<(), PushError> {
        let response = self
            .client
            .put(&self.url)
            .header("Token", &credentials.token)
            .header("Fingerprint", &credentials.fingerprint)
            .header(CONTENT_TYPE, "image/jpg")
            .body(frame)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(PushError::Status {
                status: status.as_u16(),
            });
        }
        Ok(())
    }
}

fn snapshot_url(base_url: &str) -> String {
    let base = base_url.trim_end_matches('/');
    if base.ends_with(SNAPSHOT_PATH) {
        base.to_string()
    } else {
        format!("{base}{SNAPSHOT_PATH}")
    }
}
