//! Scripted HTTP backend shared by unit tests.

use std::cell::RefCell;
use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use serde_json::Value;

use crate::http::{BackendHttp, FormBody, HttpFailure, HttpReply};

#[derive(Debug, Clone)]
pub(crate) struct StubCall {
    pub method: &'static str,
    pub url: String,
    pub form: Option<FormBody>,
    pub json: Option<Value>,
}

/// Replies are queued per URL; the last queued reply repeats. Unknown URLs refuse the connection.
#[derive(Default)]
pub(crate) struct StubHttp {
    routes: RefCell<HashMap<String, VecDeque<Result<HttpReply, HttpFailure>>>>,
    calls: RefCell<Vec<StubCall>>,
    post_delay: Option<Duration>,
}

impl StubHttp {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on(self, url: &str, reply: Result<HttpReply, HttpFailure>) -> Self {
        self.routes
            .borrow_mut()
            .entry(url.to_string())
            .or_default()
            .push_back(reply);
        self
    }

    /// Every POST sleeps for `delay` before answering.
    pub fn slow_posts(mut self, delay: Duration) -> Self {
        self.post_delay = Some(delay);
        self
    }

    pub fn healthy(self, base: &str) -> Self {
        self.on(&format!("{base}/health"), Ok(HttpReply::new(200, "ok")))
    }

    pub fn calls(&self) -> Vec<StubCall> {
        self.calls.borrow().clone()
    }

    /// URLs of POST calls only, in order.
    pub fn posted(&self) -> Vec<String> {
        self.calls
            .borrow()
            .iter()
            .filter(|call| call.method != "GET")
            .map(|call| call.url.clone())
            .collect()
    }

    fn reply(&self, url: &str) -> Result<HttpReply, HttpFailure> {
        let mut routes = self.routes.borrow_mut();
        match routes.get_mut(url) {
            Some(queue) if queue.len() > 1 => queue
                .pop_front()
                .unwrap_or_else(|| Err(HttpFailure::Other("empty queue".into()))),
            Some(queue) => queue
                .front()
                .cloned()
                .unwrap_or_else(|| Err(HttpFailure::Other("empty queue".into()))),
            None => Err(HttpFailure::Connect(format!("connection refused: {url}"))),
        }
    }

    fn pause(&self) {
        if let Some(delay) = self.post_delay {
            std::thread::sleep(delay);
        }
    }

    fn record(&self, method: &'static str, url: &str, form: Option<&FormBody>, json: Option<&Value>) {
        self.calls.borrow_mut().push(StubCall {
            method,
            url: url.to_string(),
            form: form.cloned(),
            json: json.cloned(),
        });
    }
}

impl BackendHttp for StubHttp {
    fn get(&self, url: &str, _timeout: Duration) -> Result<HttpReply, HttpFailure> {
        self.record("GET", url, None, None);
        self.reply(url)
    }

    fn post_form(
        &self,
        url: &str,
        form: &FormBody,
        _timeout: Duration,
    ) -> Result<HttpReply, HttpFailure> {
        self.record("FORM", url, Some(form), None);
        self.pause();
        self.reply(url)
    }

    fn post_json(
        &self,
        url: &str,
        body: &Value,
        _timeout: Duration,
    ) -> Result<HttpReply, HttpFailure> {
        self.record("JSON", url, None, Some(body));
        self.pause();
        self.reply(url)
    }
}
