use std::io;
use std::time::Duration;

use bytes::{Buf, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::time::timeout;

/// Limit for any single read in a test.
const READ_TIMEOUT: Duration = Duration::from_secs(5);

/// A parsed HTTP/1.x response.
#[derive(Debug)]
pub struct RawResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
    pub trailers: Vec<(String, String)>,
}

impl RawResponse {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn body_str(&self) -> &str {
        std::str::from_utf8(&self.body).unwrap_or("<binary>")
    }
}

async fn fill<R: AsyncRead + Unpin>(io: &mut R, buf: &mut BytesMut) -> io::Result<usize> {
    buf.reserve(8192);
    match timeout(READ_TIMEOUT, io.read_buf(buf)).await {
        Ok(n) => n,
        Err(_) => Err(io::Error::new(io::ErrorKind::TimedOut, "read timed out")),
    }
}

async fn fill_some<R: AsyncRead + Unpin>(io: &mut R, buf: &mut BytesMut) -> io::Result<()> {
    if fill(io, buf).await? == 0 {
        return Err(io::ErrorKind::UnexpectedEof.into());
    }
    Ok(())
}

async fn read_line<R: AsyncRead + Unpin>(io: &mut R, buf: &mut BytesMut) -> io::Result<String> {
    loop {
        if let Some(pos) = buf.windows(2).position(|w| w == b"\r\n") {
            let line = String::from_utf8_lossy(&buf[..pos]).into_owned();
            buf.advance(pos + 2);
            return Ok(line);
        }
        fill_some(io, buf).await?;
    }
}

/// Read one response. `head_only` is set for answers to HEAD requests.
pub async fn read_response<R: AsyncRead + Unpin>(
    io: &mut R,
    buf: &mut BytesMut,
    head_only: bool,
) -> io::Result<RawResponse> {
    let (status, headers) = loop {
        let parsed = {
            let mut slots = [httparse::EMPTY_HEADER; 64];
            let mut response = httparse::Response::new(&mut slots);
            match response.parse(&buf[..]) {
                Ok(httparse::Status::Complete(n)) => {
                    let headers: Vec<(String, String)> = response
                        .headers
                        .iter()
                        .map(|h| {
                            (
                                h.name.to_ascii_lowercase(),
                                String::from_utf8_lossy(h.value).into_owned(),
                            )
                        })
                        .collect();
                    Some((n, response.code.unwrap_or(0), headers))
                }
                Ok(httparse::Status::Partial) => None,
                Err(e) => return Err(io::Error::new(io::ErrorKind::InvalidData, e.to_string())),
            }
        };
        match parsed {
            Some((n, status, headers)) => {
                buf.advance(n);
                break (status, headers);
            }
            None => fill_some(io, buf).await?,
        }
    };

    let mut response = RawResponse {
        status,
        headers,
        body: Vec::new(),
        trailers: Vec::new(),
    };
    if head_only || (100..200).contains(&status) || status == 204 || status == 304 {
        return Ok(response);
    }

    let chunked = response
        .header("transfer-encoding")
        .is_some_and(|v| v.eq_ignore_ascii_case("chunked"));
    if chunked {
        loop {
            let line = read_line(io, buf).await?;
            let size = usize::from_str_radix(line.split(';').next().unwrap_or("").trim(), 16)
                .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e.to_string()))?;
            if size == 0 {
                loop {
                    let line = read_line(io, buf).await?;
                    if line.is_empty() {
                        return Ok(response);
                    }
                    if let Some((name, value)) = line.split_once(':') {
                        response
                            .trailers
                            .push((name.trim().to_ascii_lowercase(), value.trim().to_string()));
                    }
                }
            }
            while buf.len() < size + 2 {
                fill_some(io, buf).await?;
            }
            response.body.extend_from_slice(&buf[..size]);
            buf.advance(size + 2);
        }
    }

    match response.header("content-length").map(|v| v.parse::<usize>()) {
        Some(Ok(len)) => {
            while buf.len() < len {
                fill_some(io, buf).await?;
            }
            response.body.extend_from_slice(&buf[..len]);
            buf.advance(len);
        }
        Some(Err(e)) => return Err(io::Error::new(io::ErrorKind::InvalidData, e.to_string())),
        None => {
            // delimited by connection close
            while fill(io, buf).await? > 0 {}
            response.body.extend_from_slice(buf);
            buf.clear();
        }
    }
    Ok(response)
}

/// True once the peer has closed its side.
pub async fn is_closed<R: AsyncRead + Unpin>(io: &mut R, buf: &mut BytesMut) -> bool {
    matches!(fill(io, buf).await, Ok(0)) && buf.is_empty()
}
