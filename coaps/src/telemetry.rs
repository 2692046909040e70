//! Periodic telemetry request and reply parsing

use std::{fmt::Write, time::Instant};

use proto::{
    message::content_format, BoundedBuf, Code, Message, OptionNumber, Type,
};
use serde::Serialize;
use tracing::debug;

use crate::platform::TelemetrySource;

/// Room left for header, token and options when sizing the payload
const HEADROOM: usize = 128;

pub(crate) struct Telemetry {
    path: String,
    query: Vec<String>,
    payload_limit: usize,
    sequence: u32,
    started: Instant,
    source: Box<dyn TelemetrySource>,
}

impl Telemetry {
    pub(crate) fn new(
        path: String,
        query: Vec<String>,
        max_message_size: usize,
        source: Box<dyn TelemetrySource>,
    ) -> Self {
        Self {
            path,
            query,
            payload_limit: max_message_size.saturating_sub(HEADROOM),
            sequence: 0,
            started: Instant::now(),
            source,
        }
    }

    /// Build the next telemetry POST
    ///
    /// The payload is status text; lines that don't fit are cut off.
    pub(crate) fn request(&mut self, now: Instant) -> Message {
        self.sequence = self.sequence.wrapping_add(1);
        let mut text = format!(
            "{}\n{}s",
            self.sequence,
            now.saturating_duration_since(self.started).as_secs()
        );
        for line in self.source.lines() {
            let _ = write!(text, "\n{line}");
        }

        let mut payload = BoundedBuf::new(self.payload_limit);
        let written = payload.put_status(&text);
        if written < text.len() {
            debug!(dropped = text.len() - written, "telemetry text clipped");
        }

        let mut msg = Message::new(Type::Confirmable, Code::POST);
        msg.set_uri_path(&self.path)
            .set_content_format(content_format::TEXT_PLAIN);
        for query in &self.query {
            msg.add_uri_query(query);
        }
        msg.payload = payload.freeze();
        msg
    }

    pub(crate) fn sequence(&self) -> u32 {
        self.sequence
    }
}

/// What the server sent back for a telemetry message
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Reply {
    /// Response code, e.g. `2.04`
    pub code: String,
    /// Server time in milliseconds since the epoch
    pub time: Option<u64>,
    /// Suggested send interval in seconds
    pub interval: Option<u32>,
    /// ETag of the read sub-resource, in hex
    pub read_etag: Option<String>,
    /// Response code of the read sub-resource
    pub read_code: Option<String>,
    /// Text body
    pub body: String,
}

impl Reply {
    /// Extract the vendor options and the body of `response`
    pub fn parse(response: &Message) -> Self {
        let options = &response.options;
        Self {
            code: response.code.to_string(),
            time: options.get(OptionNumber::TIME).and_then(|v| wide_uint(v)),
            interval: options.get_uint(OptionNumber::INTERVAL),
            read_etag: options.get(OptionNumber::READ_ETAG).map(|v| hex(v)),
            read_code: options
                .get_uint(OptionNumber::READ_RESPONSE_CODE)
                .and_then(|v| u8::try_from(v).ok())
                .map(|v| Code(v).to_string()),
            body: String::from_utf8_lossy(&response.payload).into_owned(),
        }
    }
}

fn wide_uint(bytes: &[u8]) -> Option<u64> {
    if bytes.len() > 8 {
        return None;
    }
    Some(bytes.iter().fold(0u64, |acc, &b| (acc << 8) | u64::from(b)))
}

fn hex(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        let _ = write!(out, "{b:02x}");
    }
    out
}
