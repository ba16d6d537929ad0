//! In-memory transport for fetcher and acquirer tests.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use bytes::Bytes;
use url::Url;

use super::{Transport, TransportResponse, Validators};
use scrapekit_core::Error;

/// Replays queued responses per URL and records every request it sees.
#[derive(Default)]
pub(crate) struct ScriptedTransport {
    routes: Mutex<HashMap<String, VecDeque<Result<TransportResponse, Error>>>>,
    calls: Mutex<Vec<(String, Validators)>>,
}

impl ScriptedTransport {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn push(&self, url: &str, response: Result<TransportResponse, Error>) {
        self.routes
            .lock()
            .unwrap()
            .entry(Url::parse(url).unwrap().to_string())
            .or_default()
            .push_back(response);
    }

    pub(crate) fn ok(&self, url: &str, body: &str, etag: Option<&str>) {
        self.push(
            url,
            Ok(TransportResponse::Modified {
                body: Bytes::from(body.to_string()),
                etag: etag.map(str::to_string),
                last_modified: None,
                content_type: None,
                final_url: Url::parse(url).unwrap(),
            }),
        );
    }

    pub(crate) fn not_modified(&self, url: &str) {
        self.push(url, Ok(TransportResponse::NotModified));
    }

    pub(crate) fn fail(&self, url: &str, reason: &str) {
        self.push(url, Err(Error::Network(reason.to_string())));
    }

    pub(crate) fn calls(&self) -> Vec<(String, Validators)> {
        self.calls.lock().unwrap().clone()
    }

    pub(crate) fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }
}

#[async_trait::async_trait]
impl Transport for ScriptedTransport {
    async fn get(&self, url: &Url, validators: &Validators) -> Result<TransportResponse, Error> {
        self.calls.lock().unwrap().push((url.to_string(), validators.clone()));
        self.routes
            .lock()
            .unwrap()
            .get_mut(url.as_str())
            .and_then(VecDeque::pop_front)
            .unwrap_or_else(|| Err(Error::Network(format!("no scripted response for {url}"))))
    }
}
