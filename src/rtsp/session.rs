//! Per-client session state machine.

use serde::Serialize;
use std::io;
use std::net::IpAddr;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader, Lines};
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use super::protocol::{
    path_matches, Feed, Method, Request, RequestAssembler, Response, StatusCode, PUBLIC_METHODS,
};
use super::{sdp, StreamStats};
use crate::camera::FramePool;
use crate::control::StreamToggle;
use crate::shutdown::StopSignal;
use crate::upload::codec;

const DEFAULT_TRANSPORT: &str = "RTP/AVP;unicast;client_port=8000-8001";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SessionState {
    AwaitRequest,
    Ready,
    Playing,
    Closed,
}

/// What every session on one responder shares
#[derive(Clone)]
pub struct SessionContext {
    pub pool: FramePool,
    pub toggle: StreamToggle,
    pub stats: Arc<StreamStats>,
    pub stream_path: String,
    pub frame_interval: Duration,
    /// Longest a single response or frame write may block
    pub write_timeout: Duration,
    pub stop: StopSignal,
}

pub struct StreamSession<R, W> {
    lines: Lines<BufReader<R>>,
    writer: W,
    assembler: RequestAssembler,
    state: SessionState,
    session_id: Option<String>,
    local: IpAddr,
    peer: String,
    frames_sent: u64,
    ctx: SessionContext,
}

impl<R, W> StreamSession<R, W>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    pub fn new(
        reader: R,
        writer: W,
        local: IpAddr,
        peer: impl Into<String>,
        ctx: SessionContext,
    ) -> Self {
        Self {
            lines: BufReader::new(reader).lines(),
            writer,
            assembler: RequestAssembler::default(),
            state: SessionState::AwaitRequest,
            session_id: None,
            local,
            peer: peer.into(),
            frames_sent: 0,
            ctx,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Serves the client until it disconnects, tears down, errs or the
    /// responder stops. Returns the number of frames pushed.
    pub async fn run(mut self) -> u64 {
        let stop = self.ctx.stop.clone();
        let mut ticker = tokio::time::interval(self.ctx.frame_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        while self.state != SessionState::Closed {
            if self.state == SessionState::Playing {
                tokio::select! {
                    line = self.lines.next_line() => self.on_line(line).await,
                    _ = ticker.tick() => self.push_frame().await,
                    _ = stop.stopped() => self.close(),
                }
            } else {
                tokio::select! {
                    line = self.lines.next_line() => self.on_line(line).await,
                    _ = stop.stopped() => self.close(),
                }
            }
        }

        match tokio::time::timeout(self.ctx.write_timeout, self.writer.shutdown()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => debug!(peer = %self.peer, error = %e, "Session shutdown failed"),
            Err(_) => debug!(peer = %self.peer, "Session shutdown timed out"),
        }
        self.frames_sent
    }

    async fn on_line(&mut self, line: io::Result<Option<String>>) {
        let line = match line {
            Ok(Some(line)) => line,
            Ok(None) => {
                debug!(peer = %self.peer, "Client closed connection");
                self.close();
                return;
            }
            Err(e) => {
                debug!(peer = %self.peer, error = %e, "Client read failed");
                self.close();
                return;
            }
        };

        match self.assembler.feed(&line) {
            Feed::Complete(request) => self.respond(request).await,
            Feed::Pending => {}
            Feed::Discarded => {
                if !line.trim().is_empty() {
                    debug!(
                        peer = %self.peer,
                        line = %line.trim(),
                        "Discarding malformed request line"
                    );
                }
            }
        }
    }

    async fn respond(&mut self, request: Request) {
        let Some(cseq) = request.cseq() else {
            self.reject(StatusCode::BadRequest, None).await;
            return;
        };
        if !request.line.version.starts_with("RTSP/1.") {
            self.reject(StatusCode::VersionNotSupported, Some(cseq)).await;
            return;
        }
        let Ok(method) = request.line.method.parse::<Method>() else {
            self.reject(StatusCode::NotImplemented, Some(cseq)).await;
            return;
        };
        if method != Method::Options && !path_matches(&request.line.path, &self.ctx.stream_path) {
            self.reject(StatusCode::NotFound, Some(cseq)).await;
            return;
        }

        debug!(peer = %self.peer, method = ?method, cseq, "Request");

        match method {
            Method::Options => {
                let response =
                    Response::new(StatusCode::Ok, Some(cseq)).header("Public", PUBLIC_METHODS);
                self.send(response).await;
            }
            Method::Describe => {
                let body = sdp::describe(self.local, "camnode stream");
                let response =
                    Response::new(StatusCode::Ok, Some(cseq)).body("application/sdp", body);
                self.send(response).await;
            }
            Method::Setup => {
                if let Some(mismatch) = self.session_mismatch(&request) {
                    self.reject(mismatch, Some(cseq)).await;
                    return;
                }
                let id = self
                    .session_id
                    .get_or_insert_with(|| format!("{:08X}", rand::random::<u32>()))
                    .clone();
                let transport = request
                    .header("Transport")
                    .unwrap_or(DEFAULT_TRANSPORT)
                    .to_string();
                let response = Response::new(StatusCode::Ok, Some(cseq))
                    .header("Transport", transport)
                    .header("Session", id.clone());
                if self.send(response).await && self.state == SessionState::AwaitRequest {
                    self.state = SessionState::Ready;
                    info!(peer = %self.peer, session = %id, "Session ready");
                }
            }
            Method::Play => {
                if self.state == SessionState::AwaitRequest {
                    self.reject(StatusCode::MethodNotValidInState, Some(cseq)).await;
                    return;
                }
                if let Some(mismatch) = self.session_mismatch(&request) {
                    self.reject(mismatch, Some(cseq)).await;
                    return;
                }
                let id = self.session_id.clone().unwrap_or_default();
                let response = Response::new(StatusCode::Ok, Some(cseq)).header("Session", id);
                if self.send(response).await && self.state != SessionState::Playing {
                    self.state = SessionState::Playing;
                    info!(peer = %self.peer, "Starting video stream");
                }
            }
            Method::Teardown => {
                let mut response = Response::new(StatusCode::Ok, Some(cseq));
                if let Some(id) = &self.session_id {
                    response = response.header("Session", id.clone());
                }
                self.send(response).await;
                info!(peer = %self.peer, "Session torn down");
                self.close();
            }
        }
    }

    /// A `Session` header that names some other session.
    fn session_mismatch(&self, request: &Request) -> Option<StatusCode> {
        match (request.session(), &self.session_id) {
            (Some(given), Some(ours)) if given != ours => Some(StatusCode::SessionNotFound),
            (Some(_), None) => Some(StatusCode::SessionNotFound),
            _ => None,
        }
    }

    async fn push_frame(&mut self) {
        if !self.ctx.toggle.is_enabled() {
            info!(peer = %self.peer, "Streaming disabled, ending session");
            self.close();
            return;
        }

        let frame = match self.ctx.pool.acquire() {
            Ok(frame) => frame,
            Err(e) => {
                self.ctx.stats.skipped.fetch_add(1, Ordering::Relaxed);
                debug!(peer = %self.peer, error = %e, "No frame this cycle");
                return;
            }
        };

        // the part owns a copy, so the slot goes back before any write can stall
        let part = codec::part(frame.data());
        let len = frame.len();
        frame.release();
        let result = self.write(&part).await;

        match result {
            Ok(()) => {
                self.frames_sent += 1;
                self.ctx.stats.frames_pushed.fetch_add(1, Ordering::Relaxed);
                debug!(peer = %self.peer, frame = self.frames_sent, bytes = len, "Frame pushed");
            }
            Err(e) => {
                debug!(peer = %self.peer, error = %e, "Frame write failed, ending session");
                self.close();
            }
        }
    }

    async fn reject(&mut self, status: StatusCode, cseq: Option<u32>) {
        warn!(peer = %self.peer, status = status.code(), "Rejecting request");
        self.send(Response::new(status, cseq)).await;
        self.close();
    }

    async fn send(&mut self, response: Response) -> bool {
        match self.write(response.encode().as_bytes()).await {
            Ok(()) => true,
            Err(e) => {
                debug!(peer = %self.peer, error = %e, "Response write failed");
                self.close();
                false
            }
        }
    }

    /// Writes and flushes `data`, giving up after the write timeout or as
    /// soon as the responder stops.
    async fn write(&mut self, data: &[u8]) -> io::Result<()> {
        let stop = self.ctx.stop.clone();
        let limit = self.ctx.write_timeout;
        let writer = &mut self.writer;
        let send = async {
            writer.write_all(data).await?;
            writer.flush().await
        };

        tokio::select! {
            result = tokio::time::timeout(limit, send) => match result {
                Ok(result) => result,
                Err(_) => Err(io::Error::new(io::ErrorKind::TimedOut, "client stopped reading")),
            },
            _ = stop.stopped() => {
                Err(io::Error::new(io::ErrorKind::Interrupted, "responder stopping"))
            }
        }
    }

    fn close(&mut self) {
        self.state = SessionState::Closed;
    }
}
