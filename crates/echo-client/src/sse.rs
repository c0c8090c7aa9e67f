//! Server-sent events over a streaming HTTP body.

use std::{io, time::Duration};

use async_trait::async_trait;
use bytes::BytesMut;
use echo_core::{
    EchoError, EchoErrorCategory, StreamChannel, classify_http_status,
    classify_stream_error_message,
};
use futures::{StreamExt, TryStreamExt, stream};
use reqwest::{Client, header};
use thiserror::Error;
use tokio::io::AsyncRead;
use tokio_util::{
    codec::{Decoder, FramedRead},
    io::StreamReader,
};
use tracing::debug;
use url::Url;

use crate::{
    graphql::map_reqwest_error,
    subscription::{EventConnector, MessageStream},
};

/// Longest line accepted before the stream is treated as broken.
const MAX_LINE_BYTES: usize = 256 * 1024;

/// One dispatched event.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SseFrame {
    pub event: Option<String>,
    pub data: String,
    pub id: Option<String>,
    pub retry_ms: Option<u64>,
}

impl SseFrame {
    /// Whether a plain `EventSource.onmessage` handler would see this frame.
    pub fn is_message(&self) -> bool {
        matches!(self.event.as_deref(), None | Some("message"))
    }
}

#[derive(Debug, Error)]
pub enum SseError {
    #[error("event stream I/O failed: {0}")]
    Io(#[from] io::Error),
    #[error("event stream line is not valid UTF-8")]
    InvalidUtf8,
    #[error("event stream line exceeds {MAX_LINE_BYTES} bytes")]
    LineTooLong,
}

/// Line-oriented `text/event-stream` decoder.
#[derive(Debug, Default)]
pub struct SseCodec {
    event: Option<String>,
    data: Option<String>,
    id: Option<String>,
    retry_ms: Option<u64>,
}

impl SseCodec {
    /// Latest reconnection time the server asked for, in milliseconds.
    pub fn retry_ms(&self) -> Option<u64> {
        self.retry_ms
    }

    fn process_line(&mut self, line: &str) -> Option<SseFrame> {
        if line.is_empty() {
            return self.dispatch();
        }
        if line.starts_with(':') {
            return None;
        }

        let (field, value) = match line.split_once(':') {
            Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
            None => (line, ""),
        };

        match field {
            "data" => match &mut self.data {
                Some(data) => {
                    data.push('\n');
                    data.push_str(value);
                }
                None => self.data = Some(value.to_owned()),
            },
            "event" => self.event = Some(value.to_owned()),
            "id" if !value.contains('\0') => self.id = Some(value.to_owned()),
            "retry" => {
                if let Ok(retry) = value.parse::<u64>() {
                    self.retry_ms = Some(retry);
                }
            }
            _ => {}
        }
        None
    }

    fn dispatch(&mut self) -> Option<SseFrame> {
        let event = self.event.take();
        let data = self.data.take()?;
        Some(SseFrame {
            event,
            data,
            id: self.id.clone(),
            retry_ms: self.retry_ms,
        })
    }

    fn reset(&mut self) {
        self.event = None;
        self.data = None;
    }
}

impl Decoder for SseCodec {
    type Item = SseFrame;
    type Error = SseError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        loop {
            let Some(newline) = src.iter().position(|byte| *byte == b'\n') else {
                if src.len() > MAX_LINE_BYTES {
                    return Err(SseError::LineTooLong);
                }
                return Ok(None);
            };

            let raw = src.split_to(newline + 1);
            let mut line = &raw[..newline];
            if let Some(stripped) = line.strip_suffix(b"\r") {
                line = stripped;
            }
            let line = std::str::from_utf8(line).map_err(|_| SseError::InvalidUtf8)?;

            if let Some(frame) = self.process_line(line) {
                return Ok(Some(frame));
            }
        }
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if let Some(frame) = self.decode(src)? {
            return Ok(Some(frame));
        }
        src.clear();
        self.reset();
        Ok(None)
    }
}

/// Opens `GET {base}/api/{channel}/events?token=...` and yields message payloads.
#[derive(Debug, Clone)]
pub struct HttpEventConnector {
    client: Client,
    server_url: Url,
}

impl HttpEventConnector {
    pub fn new(client: Client, server_url: Url) -> Self {
        Self { client, server_url }
    }

    pub fn events_url(&self, channel: StreamChannel, token: &str) -> Result<Url, EchoError> {
        let mut url = self.server_url.join(channel.path()).map_err(|err| {
            EchoError::new(
                EchoErrorCategory::Config,
                "invalid_server_url",
                format!("cannot derive {channel} stream URL: {err}"),
            )
        })?;
        url.query_pairs_mut().append_pair("token", token);
        Ok(url)
    }
}

#[async_trait]
impl EventConnector for HttpEventConnector {
    async fn connect(
        &self,
        channel: StreamChannel,
        token: &str,
    ) -> Result<MessageStream, EchoError> {
        let url = self.events_url(channel, token)?;
        let response = self
            .client
            .get(url)
            .header(header::ACCEPT, "text/event-stream")
            .header(header::CACHE_CONTROL, "no-cache")
            .send()
            .await
            .map_err(map_reqwest_error)?;

        let status = response.status();
        if !status.is_success() {
            return Err(EchoError::new(
                classify_http_status(status.as_u16()),
                "stream_http_status",
                format!("{channel} stream answered HTTP {status}"),
            ));
        }
        debug!(%channel, "event stream opened");

        let body = response.bytes_stream().map_err(io::Error::other).boxed();
        Ok(frame_messages(channel, StreamReader::new(body)))
    }
}

/// Message payloads of an event-stream body.
///
/// When the server sent a `retry:` field, the failure or end of the stream is
/// reported as an error carrying that delay so the reconnect waits for it.
pub fn frame_messages<R>(channel: StreamChannel, reader: R) -> MessageStream
where
    R: AsyncRead + Send + Unpin + 'static,
{
    let frames = FramedRead::new(reader, SseCodec::default());
    stream::unfold(Some(frames), move |frames| async move {
        let mut frames = frames?;
        loop {
            match frames.next().await {
                Some(Ok(frame)) if frame.is_message() => {
                    return Some((Ok(frame.data), Some(frames)));
                }
                Some(Ok(frame)) => {
                    debug!(%channel, event = ?frame.event, "ignoring named event");
                }
                Some(Err(err)) => {
                    let error = with_retry_hint(
                        classify_stream_error_message(err.to_string()),
                        frames.decoder(),
                    );
                    return Some((Err(error), None));
                }
                None => {
                    let retry_ms = frames.decoder().retry_ms()?;
                    let error = EchoError::new(
                        EchoErrorCategory::Network,
                        "stream_closed",
                        format!("{channel} stream closed by server"),
                    )
                    .with_retry_after(Duration::from_millis(retry_ms));
                    return Some((Err(error), None));
                }
            }
        }
    })
    .boxed()
}

fn with_retry_hint(error: EchoError, codec: &SseCodec) -> EchoError {
    match codec.retry_ms() {
        Some(retry_ms) => error.with_retry_after(Duration::from_millis(retry_ms)),
        None => error,
    }
}
