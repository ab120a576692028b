//! Network transfer tasks (HTTP GET/POST).
//!
//! In threaded mode the handler reads the response body in bounded chunks,
//! back to back on a worker. In cooperative mode socket I/O may stall a step
//! for the full socket timeout, so the transfer is offloaded to a helper
//! thread instead and each step only drains its event channel. Either way the
//! result buffer's ownership transfers to the completion callback.

use std::io::Read;
use std::sync::mpsc::{self, Receiver, Sender, TryRecvError};

use reqwest::blocking::{Client, RequestBuilder, Response};
use reqwest::Url;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::engine::TaskEngine;
use crate::error::{PushError, TaskError};
use crate::task::{
    Payload, Progress, StepOutcome, TaskContext, TaskHandler, TaskId, TaskKind, TaskOutcome,
    TaskReport, TaskSpec, TransferData,
};

/// Upper bound on bytes read from the socket per handler step.
const CHUNK_SIZE: usize = 64 * 1024;

enum HttpMethod {
    Get,
    Post(Vec<u8>),
}

/// What the transfer helper thread reports back to the handler.
enum TransferEvent {
    Started { total: Option<u64> },
    Chunk(Vec<u8>),
    Done,
    Failed(TaskError),
}

struct HttpTransferHandler {
    client: Client,
    url: Url,
    /// Taken on the first step, when the request is sent.
    method: Option<HttpMethod>,
    content_type: Option<String>,
    /// Offload socket I/O to a helper thread instead of blocking in-step.
    offload: bool,
    response: Option<Response>,
    scratch: Vec<u8>,
    events: Option<Receiver<TransferEvent>>,
    buf: Vec<u8>,
    total: Option<u64>,
}

impl HttpTransferHandler {
    fn new(
        client: Client,
        url: Url,
        method: HttpMethod,
        content_type: Option<&str>,
        offload: bool,
    ) -> Self {
        Self {
            client,
            url,
            method: Some(method),
            content_type: content_type.map(str::to_string),
            offload,
            response: None,
            scratch: vec![0u8; CHUNK_SIZE],
            events: None,
            buf: Vec::new(),
            total: None,
        }
    }

    fn request_builder(&self, method: HttpMethod) -> RequestBuilder {
        let builder = match method {
            HttpMethod::Get => self.client.get(self.url.clone()),
            HttpMethod::Post(body) => self.client.post(self.url.clone()).body(body),
        };
        match &self.content_type {
            Some(ct) => builder.header(reqwest::header::CONTENT_TYPE, ct.as_str()),
            None => builder,
        }
    }
}

/// Runs the whole blocking transfer, streaming events back to the handler.
/// Exits early when the task is cancelled or the handler is gone.
fn transfer_thread(
    builder: RequestBuilder,
    url: Url,
    cancel: CancellationToken,
    tx: Sender<TransferEvent>,
) {
    let response = match builder.send() {
        Ok(response) => response,
        Err(e) => {
            let _ = tx.send(TransferEvent::Failed(TaskError::msg(format!(
                "request to {url} failed: {e}"
            ))));
            return;
        }
    };
    if !response.status().is_success() {
        let _ = tx.send(TransferEvent::Failed(TaskError::msg(format!(
            "HTTP {} from {url}",
            response.status()
        ))));
        return;
    }
    let _ = tx.send(TransferEvent::Started {
        total: response.content_length(),
    });

    let mut response = response;
    let mut scratch = vec![0u8; CHUNK_SIZE];
    loop {
        if cancel.is_cancelled() {
            return;
        }
        match response.read(&mut scratch) {
            Ok(0) => {
                let _ = tx.send(TransferEvent::Done);
                return;
            }
            Ok(read) => {
                if tx.send(TransferEvent::Chunk(scratch[..read].to_vec())).is_err() {
                    return;
                }
            }
            Err(e) => {
                let _ = tx.send(TransferEvent::Failed(TaskError::msg(format!(
                    "read from {url} failed: {e}"
                ))));
                return;
            }
        }
    }
}

impl TaskHandler for HttpTransferHandler {
    fn step(&mut self, ctx: &TaskContext) -> Result<StepOutcome, TaskError> {
        if let Some(method) = self.method.take() {
            let builder = self.request_builder(method);
            if self.offload {
                let (tx, rx) = mpsc::channel();
                let url = self.url.clone();
                let cancel = ctx.cancel_token();
                std::thread::Builder::new()
                    .name("transfer-io".to_string())
                    .spawn(move || transfer_thread(builder, url, cancel, tx))?;
                self.events = Some(rx);
                ctx.set_progress(Progress::Indeterminate);
                return Ok(StepOutcome::Pending);
            }
            let response = builder
                .send()
                .map_err(|e| TaskError::msg(format!("request to {} failed: {e}", self.url)))?;
            if !response.status().is_success() {
                return Err(TaskError::msg(format!(
                    "HTTP {} from {}",
                    response.status(),
                    self.url
                )));
            }
            self.total = response.content_length();
            self.response = Some(response);
            ctx.set_progress(Progress::Indeterminate);
            return Ok(StepOutcome::Pending);
        }

        if let Some(events) = &self.events {
            loop {
                match events.try_recv() {
                    Ok(TransferEvent::Started { total }) => self.total = total,
                    Ok(TransferEvent::Chunk(chunk)) => {
                        ctx.add_bytes(chunk.len() as u64);
                        self.buf.extend_from_slice(&chunk);
                        if let Some(total) = self.total.filter(|t| *t > 0) {
                            let pct = (self.buf.len() as u64 * 100 / total).min(100) as u8;
                            ctx.set_progress(Progress::percent(pct));
                        }
                    }
                    Ok(TransferEvent::Done) => {
                        ctx.set_progress(Progress::percent(100));
                        let data = std::mem::take(&mut self.buf);
                        return Ok(StepOutcome::Finished(TaskOutcome::Transfer(TransferData {
                            data,
                        })));
                    }
                    Ok(TransferEvent::Failed(err)) => return Err(err),
                    Err(TryRecvError::Empty) => return Ok(StepOutcome::Pending),
                    Err(TryRecvError::Disconnected) => {
                        return Err(TaskError::msg(format!("transfer from {} aborted", self.url)))
                    }
                }
            }
        }

        let Some(response) = self.response.as_mut() else {
            return Err(TaskError::msg("transfer stepped after its response was consumed"));
        };
        let read = response.read(&mut self.scratch).map_err(|e| {
            TaskError::msg(format!("read from {} failed: {e}", self.url))
        })?;
        if read == 0 {
            ctx.set_progress(Progress::percent(100));
            let data = std::mem::take(&mut self.buf);
            return Ok(StepOutcome::Finished(TaskOutcome::Transfer(TransferData {
                data,
            })));
        }

        self.buf.extend_from_slice(&self.scratch[..read]);
        ctx.add_bytes(read as u64);
        if let Some(total) = self.total.filter(|t| *t > 0) {
            let pct = (self.buf.len() as u64 * 100 / total).min(100) as u8;
            ctx.set_progress(Progress::percent(pct));
        }
        Ok(StepOutcome::Pending)
    }
}

fn parse_url(url: &str) -> Result<Url, PushError> {
    let parsed = Url::parse(url).map_err(|e| PushError::MalformedUrl {
        url: url.to_string(),
        reason: e.to_string(),
    })?;
    match parsed.scheme() {
        "http" | "https" => Ok(parsed),
        other => Err(PushError::MalformedUrl {
            url: url.to_string(),
            reason: format!("unsupported scheme '{other}'"),
        }),
    }
}

impl TaskEngine {
    /// Push an HTTP GET transfer. The completion callback receives the
    /// response body as an owned byte buffer.
    pub fn push_http_transfer(
        &self,
        url: &str,
        mute: bool,
        content_type: Option<&str>,
        callback: impl FnOnce(TaskReport, Payload) + Send + 'static,
        user_data: Payload,
    ) -> Result<TaskId, PushError> {
        let parsed = parse_url(url)?;
        let handler = HttpTransferHandler::new(
            self.http.clone(),
            parsed,
            HttpMethod::Get,
            content_type,
            self.offload_io(),
        );
        let id = self.submit(
            TaskSpec::new(TaskKind::HttpTransfer, url, handler)
                .mute(mute)
                .callback(callback)
                .payload(user_data),
        )?;
        debug!("Pushed HTTP transfer {} for {}", id, url);
        Ok(id)
    }

    /// Push an HTTP POST transfer with a request body.
    pub fn push_http_post_transfer(
        &self,
        url: &str,
        body: Vec<u8>,
        mute: bool,
        content_type: Option<&str>,
        callback: impl FnOnce(TaskReport, Payload) + Send + 'static,
        user_data: Payload,
    ) -> Result<TaskId, PushError> {
        let parsed = parse_url(url)?;
        let handler = HttpTransferHandler::new(
            self.http.clone(),
            parsed,
            HttpMethod::Post(body),
            content_type,
            self.offload_io(),
        );
        let id = self.submit(
            TaskSpec::new(TaskKind::HttpTransfer, url, handler)
                .mute(mute)
                .callback(callback)
                .payload(user_data),
        )?;
        debug!("Pushed HTTP POST transfer {} for {}", id, url);
        Ok(id)
    }
}
