//! HTTP framing for frame uploads.
//!
//! Stream mode sends one `multipart/x-mixed-replace` request whose body is an
//! endless run of JPEG parts; per-frame mode sends one complete request per
//! frame. The streaming responder reuses the part framing for its payload.

use bytes::{BufMut, Bytes, BytesMut};
use std::io;
use tokio::io::{AsyncWrite, AsyncWriteExt};

/// Part delimiter, also announced verbatim as the multipart boundary.
pub const BOUNDARY: &str = "--frame";

pub fn stream_request_head(device_id: &str, host: &str) -> String {
    format!(
        "POST /video_stream/{} HTTP/1.1\r\n\
         Host: {}\r\n\
         Content-Type: multipart/x-mixed-replace; boundary={}\r\n\
         \r\n",
        device_id, host, BOUNDARY
    )
}

pub fn single_frame_head(device_id: &str, host: &str, len: usize) -> String {
    format!(
        "POST /video_frame/{} HTTP/1.1\r\n\
         Host: {}\r\n\
         Content-Type: image/jpeg\r\n\
         Content-Length: {}\r\n\
         Connection: close\r\n\
         \r\n",
        device_id, host, len
    )
}

pub fn part_header(len: usize) -> String {
    format!(
        "{}\r\nContent-Type: image/jpeg\r\nContent-Length: {}\r\n\r\n",
        BOUNDARY, len
    )
}

/// One complete multipart segment: header, payload, trailing CRLF.
pub fn part(frame: &[u8]) -> Bytes {
    let header = part_header(frame.len());
    let mut buf = BytesMut::with_capacity(header.len() + frame.len() + 2);
    buf.put_slice(header.as_bytes());
    buf.put_slice(frame);
    buf.put_slice(b"\r\n");
    buf.freeze()
}

/// Writes `data`, stopping early if the peer stops accepting bytes.
///
/// Returns the number of bytes actually written so callers can detect a
/// short write. An error is returned only when nothing was written.
pub async fn write_counted<W>(writer: &mut W, data: &[u8]) -> io::Result<usize>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    let mut written = 0;
    while written < data.len() {
        match writer.write(&data[written..]).await {
            Ok(0) => break,
            Ok(n) => written += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) if written == 0 => return Err(e),
            Err(_) => break,
        }
    }
    Ok(written)
}
