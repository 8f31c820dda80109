use std::io;
use std::sync::{Arc, Mutex};

use futures::future::{self, BoxFuture, FutureExt};
use serde_json::Value;
use tracing_subscriber::fmt::MakeWriter;

use crate::request::{Fetch, FetchRequest, FetchResponse};
use crate::Result;

/// In-memory [`Fetch`] that answers every call with one canned response and
/// records the requests it saw.
pub(crate) struct RecordingFetch {
    response: FetchResponse,
    requests: Mutex<Vec<FetchRequest>>,
}

impl RecordingFetch {
    pub fn json(body: Value) -> Self {
        Self::new(FetchResponse {
            status: 200,
            status_text: "OK".into(),
            url: String::new(),
            content_type: Some("application/json".into()),
            body: body.to_string(),
        })
    }

    pub fn status(status: u16, status_text: &str) -> Self {
        Self::new(FetchResponse {
            status,
            status_text: status_text.into(),
            url: String::new(),
            content_type: Some("text/plain".into()),
            body: String::new(),
        })
    }

    fn new(response: FetchResponse) -> Self {
        Self {
            response,
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn requests(&self) -> Vec<FetchRequest> {
        self.requests.lock().unwrap().clone()
    }
}

impl Fetch for RecordingFetch {
    fn fetch(&self, request: FetchRequest) -> BoxFuture<'static, Result<FetchResponse>> {
        let mut response = self.response.clone();
        response.url = request.url.clone();
        self.requests.lock().unwrap().push(request);
        future::ready(Ok(response)).boxed()
    }
}

/// Collects formatted `tracing` output for assertions.
#[derive(Clone, Default)]
pub(crate) struct LogCapture {
    buf: Arc<Mutex<Vec<u8>>>,
}

impl LogCapture {
    /// Route events at `level` and above on this thread into the capture.
    pub fn install(&self, level: tracing::Level) -> tracing::subscriber::DefaultGuard {
        let subscriber = tracing_subscriber::fmt()
            .with_writer(self.clone())
            .with_ansi(false)
            .with_max_level(level)
            .finish();
        tracing::subscriber::set_default(subscriber)
    }

    pub fn contents(&self) -> String {
        String::from_utf8_lossy(&self.buf.lock().unwrap()).into_owned()
    }
}

impl<'a> MakeWriter<'a> for LogCapture {
    type Writer = LogWriter;

    fn make_writer(&'a self) -> Self::Writer {
        LogWriter {
            buf: Arc::clone(&self.buf),
        }
    }
}

pub(crate) struct LogWriter {
    buf: Arc<Mutex<Vec<u8>>>,
}

impl io::Write for LogWriter {
    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        self.buf.lock().unwrap().extend_from_slice(data);
        Ok(data.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}
