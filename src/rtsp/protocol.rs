//! Text protocol: request parsing and response encoding.

use std::fmt::Write as _;
use std::str::FromStr;

pub const VERSION: &str = "RTSP/1.0";

/// Methods listed in the OPTIONS response
pub const PUBLIC_METHODS: &str = "OPTIONS, DESCRIBE, SETUP, PLAY, TEARDOWN";

const MAX_HEADERS: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Options,
    Describe,
    Setup,
    Play,
    Teardown,
}

impl FromStr for Method {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "OPTIONS" => Ok(Method::Options),
            "DESCRIBE" => Ok(Method::Describe),
            "SETUP" => Ok(Method::Setup),
            "PLAY" => Ok(Method::Play),
            "TEARDOWN" => Ok(Method::Teardown),
            _ => Err(()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusCode {
    Ok,
    BadRequest,
    NotFound,
    SessionNotFound,
    MethodNotValidInState,
    NotImplemented,
    ServiceUnavailable,
    VersionNotSupported,
}

impl StatusCode {
    pub fn code(&self) -> u16 {
        match self {
            StatusCode::Ok => 200,
            StatusCode::BadRequest => 400,
            StatusCode::NotFound => 404,
            StatusCode::SessionNotFound => 454,
            StatusCode::MethodNotValidInState => 455,
            StatusCode::NotImplemented => 501,
            StatusCode::ServiceUnavailable => 503,
            StatusCode::VersionNotSupported => 505,
        }
    }

    pub fn reason(&self) -> &'static str {
        match self {
            StatusCode::Ok => "OK",
            StatusCode::BadRequest => "Bad Request",
            StatusCode::NotFound => "Not Found",
            StatusCode::SessionNotFound => "Session Not Found",
            StatusCode::MethodNotValidInState => "Method Not Valid in This State",
            StatusCode::NotImplemented => "Not Implemented",
            StatusCode::ServiceUnavailable => "Service Unavailable",
            StatusCode::VersionNotSupported => "RTSP Version Not Supported",
        }
    }
}

/// `METHOD PATH VERSION`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestLine {
    pub method: String,
    pub path: String,
    pub version: String,
}

impl RequestLine {
    /// Returns `None` when the line lacks three space-separated tokens.
    pub fn parse(line: &str) -> Option<Self> {
        let mut tokens = line.split_whitespace();
        let method = tokens.next()?;
        let path = tokens.next()?;
        let version = tokens.next()?;
        Some(Self {
            method: method.to_string(),
            path: path.to_string(),
            version: version.to_string(),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    pub line: RequestLine,
    pub headers: Vec<(String, String)>,
}

impl Request {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    pub fn cseq(&self) -> Option<u32> {
        self.header("CSeq")?.trim().parse().ok()
    }

    /// Session id without any `;timeout=` suffix.
    pub fn session(&self) -> Option<&str> {
        self.header("Session")
            .map(|value| value.split(';').next().unwrap_or(value).trim())
    }
}

/// Result of feeding one line to a [`RequestAssembler`]
#[derive(Debug, PartialEq, Eq)]
pub enum Feed {
    /// Garbled or blank line outside a request; nothing to answer
    Discarded,
    /// Request line or header consumed, more expected
    Pending,
    Complete(Request),
}

/// Builds requests line by line: a request line, headers, then a blank line.
#[derive(Debug, Default)]
pub struct RequestAssembler {
    line: Option<RequestLine>,
    headers: Vec<(String, String)>,
}

impl RequestAssembler {
    pub fn feed(&mut self, raw: &str) -> Feed {
        let text = raw.trim();

        if self.line.is_none() {
            if text.is_empty() {
                return Feed::Discarded;
            }
            return match RequestLine::parse(text) {
                Some(line) => {
                    self.line = Some(line);
                    Feed::Pending
                }
                None => Feed::Discarded,
            };
        }

        if text.is_empty() {
            let headers = std::mem::take(&mut self.headers);
            return match self.line.take() {
                Some(line) => Feed::Complete(Request { line, headers }),
                None => Feed::Discarded,
            };
        }

        if let Some((name, value)) = text.split_once(':') {
            if self.headers.len() < MAX_HEADERS {
                self.headers
                    .push((name.trim().to_string(), value.trim().to_string()));
            }
        }
        Feed::Pending
    }
}

#[derive(Debug, Clone)]
pub struct Response {
    status: StatusCode,
    cseq: Option<u32>,
    headers: Vec<(&'static str, String)>,
    body: Option<(&'static str, String)>,
}

impl Response {
    pub fn new(status: StatusCode, cseq: Option<u32>) -> Self {
        Self {
            status,
            cseq,
            headers: Vec::new(),
            body: None,
        }
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }

    pub fn header(mut self, name: &'static str, value: impl Into<String>) -> Self {
        self.headers.push((name, value.into()));
        self
    }

    pub fn body(mut self, content_type: &'static str, body: String) -> Self {
        self.body = Some((content_type, body));
        self
    }

    pub fn encode(&self) -> String {
        let mut out = format!(
            "{} {} {}\r\n",
            VERSION,
            self.status.code(),
            self.status.reason()
        );
        if let Some(cseq) = self.cseq {
            let _ = write!(out, "CSeq: {}\r\n", cseq);
        }
        for (name, value) in &self.headers {
            let _ = write!(out, "{}: {}\r\n", name, value);
        }
        match &self.body {
            Some((content_type, body)) => {
                let _ = write!(
                    out,
                    "Content-Type: {}\r\nContent-Length: {}\r\n\r\n{}",
                    content_type,
                    body.len(),
                    body
                );
            }
            None => out.push_str("\r\n"),
        }
        out
    }
}

/// Whether a request URL or path names the stream or one of its tracks.
pub fn path_matches(requested: &str, stream_path: &str) -> bool {
    let path = match requested.strip_prefix("rtsp://") {
        Some(rest) => rest.find('/').map_or("/", |at| &rest[at..]),
        None => requested,
    };
    let stream_path = stream_path.trim_end_matches('/');
    let path = path.trim_end_matches('/');

    match path.strip_prefix(stream_path) {
        Some("") => true,
        Some(rest) => rest.starts_with('/') && !rest[1..].contains('/'),
        None => false,
    }
}
