//! Drivers behind the `probe` and `watch` subcommands.
//!
//! `probe` asks one server for errors of a fixed size and logs how much came
//! back. `watch` keeps calling whichever of several servers is reachable.

use crate::channel::MultiAddrChannel;
use crate::client::{Client, DialOptions};
use crate::config::{ProbeSettings, WatchSettings};
use crate::errrequest;
use crate::protocol;
use crate::status::{Code, Status};
use std::collections::HashMap;
use tracing::{info, warn};

/// Characters of an error message shown in logs
pub const DISPLAY_LIMIT: usize = 70;

const TRUNCATED_SUFFIX: &str = "...TRUNCATED FOR DISPLAY";

type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Size breakdown of one failed call
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorReport {
    pub code: Code,
    /// Bytes in the status message
    pub message_bytes: usize,
    /// Framing around the message in an error frame
    pub overhead_bytes: usize,
    /// Size of an error frame carrying this message
    pub total_bytes: usize,
    /// Message shortened for logging
    pub display: String,
}

impl ErrorReport {
    pub fn from_status(status: &Status) -> Self {
        let message_bytes = status.message().len();
        let total_bytes = protocol::error_frame_len(status.code(), message_bytes);

        ErrorReport {
            code: status.code(),
            message_bytes,
            overhead_bytes: total_bytes - message_bytes,
            total_bytes,
            display: display_message(status),
        }
    }
}

/// Shorten a status message for logging. `Unavailable` messages are never
/// cut.
pub fn display_message(status: &Status) -> String {
    let message = status.message();
    if status.code() == Code::Unavailable || message.len() <= DISPLAY_LIMIT {
        return message.to_string();
    }

    let mut end = DISPLAY_LIMIT;
    while !message.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}{}", &message[..end], TRUNCATED_SUFFIX)
}

/// What a probe run observed
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ProbeSummary {
    pub successes: usize,
    pub failures: Vec<ErrorReport>,
}

/// Dial one server and send `count` requests for errors of one size.
pub async fn run_probe(settings: ProbeSettings) -> Result<ProbeSummary, BoxError> {
    log_dial_options(&settings.dial);
    let client = Client::dial(&settings.addr, settings.dial.clone()).await?;

    let token = errrequest::encode(settings.err_length);
    info!(
        addr = %settings.addr,
        err_length = settings.err_length,
        count = settings.count,
        "Sending requests"
    );

    let mut summary = ProbeSummary::default();
    for i in 0..settings.count {
        if i > 0 && !settings.inter_request_sleep.is_zero() {
            tokio::time::sleep(settings.inter_request_sleep).await;
        }

        match client.call(&token).await {
            Ok(body) => {
                info!(bytes = body.len(), "SUCCESS");
                summary.successes += 1;
            }
            Err(status) => {
                let report = ErrorReport::from_status(&status);
                info!(
                    code = report.code.as_u32(),
                    code_name = %report.code,
                    message_bytes = report.message_bytes,
                    overhead_bytes = report.overhead_bytes,
                    total_bytes = report.total_bytes,
                    msg = %report.display,
                    "Call failed"
                );
                summary.failures.push(report);
            }
        }
    }

    // Keep the connection around long enough to observe keepalive behavior
    if !settings.linger.is_zero() {
        tokio::time::sleep(settings.linger).await;
    }

    if let Err(e) = client.close().await {
        warn!(error = %e, "Error closing connection");
    }
    Ok(summary)
}

fn log_dial_options(options: &DialOptions) {
    if options.with_block {
        info!("Blocking dial: connecting before the first request");
    }
    if let Some(size) = options.max_header_list_size {
        info!(max_header_list_size = size, "Setting max header list size");
    }
    if let Some(time) = options.keepalive_time {
        info!(keepalive_ms = time.as_millis() as u64, "Setting client keepalive time");
    }
    if let Some(timeout) = options.dial_timeout {
        info!(dial_timeout_ms = timeout.as_millis() as u64, "Setting dial timeout");
    }
}

/// Call counts gathered by a watch run
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct WatchSummary {
    pub calls: usize,
    /// Calls per server address
    pub by_addr: HashMap<String, usize>,
    /// Calls per result, `Code::Ok` for successful calls
    pub by_code: HashMap<Code, usize>,
}

impl WatchSummary {
    fn record(&mut self, addr: &str, code: Code) {
        self.calls += 1;
        *self.by_addr.entry(addr.to_string()).or_default() += 1;
        *self.by_code.entry(code).or_default() += 1;
    }
}

/// Call whichever configured server is ready, every interval.
pub async fn run_watch(settings: WatchSettings) -> Result<WatchSummary, BoxError> {
    info!(
        count = settings.addrs.len(),
        addrs = ?settings.addrs,
        "Connecting to addresses"
    );
    let channel =
        MultiAddrChannel::new(&settings.addrs, settings.dial.clone(), settings.connect_timeout)?;
    let token = errrequest::encode(settings.err_length);

    let mut summary = WatchSummary::default();
    loop {
        let client = channel.get().await;
        let code = match client.call(&token).await {
            Ok(_) => {
                info!(addr = %client.addr(), "Successful request");
                Code::Ok
            }
            Err(status) => {
                info!(
                    addr = %client.addr(),
                    code = %status.code(),
                    details = %display_message(&status),
                    "Failed request"
                );
                status.code()
            }
        };
        summary.record(client.addr(), code);

        if settings.count.is_some_and(|count| summary.calls >= count) {
            break;
        }
        tokio::time::sleep(settings.interval).await;
    }

    channel.close().await;
    Ok(summary)
}
