//! Scripted transport shared by the integration tests.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use fhir_client::{
    ClientConfig, HttpRequest, HttpResponse, RecordingSleeper, ResourceClient, RetryPolicy, Transport,
    TransportFailure,
};

pub const BASE_URL: &str = "http://fhir.test/r4";

type Reply = Result<HttpResponse, TransportFailure>;

/// Transport that replays scripted replies and records every request.
///
/// When the script runs out the last reply is repeated, so a single
/// scripted 500 means "always 500".
#[derive(Default)]
pub struct StubTransport {
    replies: Mutex<VecDeque<Reply>>,
    last: Mutex<Option<Reply>>,
    requests: Mutex<Vec<(HttpRequest, Duration)>>,
}

impl StubTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn replying(replies: impl IntoIterator<Item = Reply>) -> Self {
        let stub = Self::new();
        stub.replies.lock().unwrap().extend(replies);
        stub
    }

    pub fn always(reply: Reply) -> Self {
        Self::replying([reply])
    }

    pub fn requests(&self) -> Vec<HttpRequest> {
        self.requests.lock().unwrap().iter().map(|(r, _)| r.clone()).collect()
    }

    pub fn timeouts(&self) -> Vec<Duration> {
        self.requests.lock().unwrap().iter().map(|(_, t)| *t).collect()
    }

    pub fn calls(&self) -> usize {
        self.requests.lock().unwrap().len()
    }
}

impl Transport for StubTransport {
    fn send(&self, request: &HttpRequest, timeout: Duration) -> Result<HttpResponse, TransportFailure> {
        self.requests.lock().unwrap().push((request.clone(), timeout));
        let next = self.replies.lock().unwrap().pop_front();
        let mut last = self.last.lock().unwrap();
        match next {
            Some(reply) => {
                *last = Some(reply.clone());
                reply
            }
            None => last.clone().expect("stub transport has no scripted reply"),
        }
    }
}

pub fn json(status: u16, body: serde_json::Value) -> Reply {
    Ok(HttpResponse::new(status).with_body(body.to_string()))
}

pub fn status(status: u16) -> Reply {
    Ok(HttpResponse::new(status))
}

pub fn policy_without_jitter() -> RetryPolicy {
    RetryPolicy {
        jitter: false,
        ..RetryPolicy::default()
    }
}

/// Client over `transport` whose backoff sleeps are recorded, not taken.
pub fn client(
    transport: Arc<StubTransport>,
    retry: RetryPolicy,
) -> (ResourceClient<Arc<StubTransport>>, Arc<RecordingSleeper>) {
    let sleeper = Arc::new(RecordingSleeper::new());
    let config = ClientConfig::new(BASE_URL).unwrap().with_retry(retry);
    let client = ResourceClient::new(config, transport).with_sleeper(sleeper.clone());
    (client, sleeper)
}
