//! Remote HTTP key-value store.
//!
//! Wire contract:
//! - `PUT {endpoint}/{key}` stores the request body
//! - `GET {endpoint}/{key}` returns the body, 404 when absent
//! - `HEAD {endpoint}/{key}` answers existence
//! - `DELETE {endpoint}/{key}` removes one key, `DELETE {endpoint}` removes all
//! - `GET {endpoint}` returns a JSON array of keys
//! - `GET {endpoint}/_stats` returns `{"used": u64, "limit": u64 | null}`

use crate::{validate_key, BackendKind, StorageBackend, StorageError, StorageResult, StorageStats};
use std::io::Read;
use std::time::Duration;

pub struct RemoteStore {
    endpoint: String,
    token: Option<String>,
    agent: ureq::Agent,
}

impl std::fmt::Debug for RemoteStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteStore")
            .field("endpoint", &self.endpoint)
            .field("authenticated", &self.token.is_some())
            .finish()
    }
}

impl RemoteStore {
    pub fn new(endpoint: &str, token: Option<String>, timeout: Duration) -> StorageResult<Self> {
        let endpoint = endpoint.trim().trim_end_matches('/').to_owned();
        if !(endpoint.starts_with("http://") || endpoint.starts_with("https://")) {
            return Err(StorageError::Misconfigured(format!(
                "remote endpoint must be an http(s) URL, got '{endpoint}'"
            )));
        }

        let agent = ureq::AgentBuilder::new().timeout(timeout).build();
        Ok(Self { endpoint, token, agent })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub fn key_url(&self, key: &str) -> String {
        format!("{}/{}", self.endpoint, key)
    }

    fn request(&self, method: &str, url: &str) -> ureq::Request {
        let request = self.agent.request(method, url);
        match &self.token {
            Some(token) => request.set("Authorization", &format!("Bearer {token}")),
            None => request,
        }
    }
}

/// Map a ureq outcome, turning 404 into `None`
fn not_found_as_none(
    result: Result<ureq::Response, ureq::Error>,
) -> StorageResult<Option<ureq::Response>> {
    match result {
        Ok(response) => Ok(Some(response)),
        Err(ureq::Error::Status(404, _)) => Ok(None),
        Err(err) => Err(map_error(err)),
    }
}

fn map_error(err: ureq::Error) -> StorageError {
    match err {
        ureq::Error::Status(507, _) | ureq::Error::Status(413, _) => {
            StorageError::QuotaExceeded { needed: 0, limit: 0 }
        }
        ureq::Error::Status(code, response) => {
            StorageError::InvalidResponse(format!("HTTP {code} from {}", response.get_url()))
        }
        ureq::Error::Transport(transport) => StorageError::Network(transport.to_string()),
    }
}

impl StorageBackend for RemoteStore {
    fn kind(&self) -> BackendKind {
        BackendKind::Remote
    }

    fn save(&self, key: &str, data: &[u8]) -> StorageResult<()> {
        validate_key(key)?;
        self.request("PUT", &self.key_url(key))
            .set("Content-Type", "application/octet-stream")
            .send_bytes(data)
            .map_err(map_error)?;
        Ok(())
    }

    fn load(&self, key: &str) -> StorageResult<Option<Vec<u8>>> {
        validate_key(key)?;
        let Some(response) = not_found_as_none(self.request("GET", &self.key_url(key)).call())?
        else {
            return Ok(None);
        };
        let mut body = Vec::new();
        response.into_reader().read_to_end(&mut body)?;
        Ok(Some(body))
    }

    fn delete(&self, key: &str) -> StorageResult<()> {
        validate_key(key)?;
        not_found_as_none(self.request("DELETE", &self.key_url(key)).call())?;
        Ok(())
    }

    fn exists(&self, key: &str) -> StorageResult<bool> {
        validate_key(key)?;
        Ok(not_found_as_none(self.request("HEAD", &self.key_url(key)).call())?.is_some())
    }

    fn list(&self) -> StorageResult<Vec<String>> {
        let response = self.request("GET", &self.endpoint).call().map_err(map_error)?;
        let mut keys: Vec<String> = response
            .into_json()
            .map_err(|e| StorageError::InvalidResponse(e.to_string()))?;
        keys.sort();
        Ok(keys)
    }

    fn clear(&self) -> StorageResult<()> {
        self.request("DELETE", &self.endpoint).call().map_err(map_error)?;
        Ok(())
    }

    fn stats(&self) -> StorageResult<StorageStats> {
        let response =
            self.request("GET", &format!("{}/_stats", self.endpoint)).call().map_err(map_error)?;
        response.into_json().map_err(|e| StorageError::InvalidResponse(e.to_string()))
    }
}
