use std::{sync::Arc, time::Duration};

use crate::{
    driver::{ConnectionInfo, SqlDriver},
    record::CommandRecord,
};

/// User trace event id raised when a replayed command times out.
pub const EVENT_ID_TIMEOUT: i32 = 82;
/// User trace event id raised when a replayed command fails.
pub const EVENT_ID_ERROR: i32 = 83;

/// Hard cap on the trace payload, in bytes of UTF-16LE.
pub const MAX_PAYLOAD_BYTES: usize = 8000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TraceEventKind {
    Timeout,
    Error,
}

impl TraceEventKind {
    pub fn event_id(self) -> i32 {
        match self {
            Self::Timeout => EVENT_ID_TIMEOUT,
            Self::Error => EVENT_ID_ERROR,
        }
    }

    fn info(self) -> &'static str {
        match self {
            Self::Timeout => "replaysql command timeout",
            Self::Error => "replaysql command error",
        }
    }
}

/// Raises a user trace event on the target server describing a failed
/// replay command.
///
/// The event is emitted from a fresh connection, never the worker's own, so
/// that a failed command's transaction or session state cannot leak into the
/// tracing call; the connection's pool entry is cleared after use. Failures
/// of the tracing call itself are logged and swallowed.
pub async fn raise_event(
    driver: &Arc<dyn SqlDriver>,
    info: &ConnectionInfo,
    kind: TraceEventKind,
    command: &CommandRecord,
    error_message: &str,
    timeout: Duration,
) {
    let payload = encode_payload(&payload_text(command, error_message));

    let mut conn = match driver.open(info, &info.default_app_name, &command.database).await {
        Ok(conn) => conn,
        Err(err) => {
            tracing::warn!(
                session = command.session_id,
                "unable to open tracing connection: {err}"
            );
            return;
        }
    };

    if let Err(err) = conn
        .raise_trace_event(kind.event_id(), kind.info(), &payload, timeout)
        .await
    {
        tracing::warn!(
            session = command.session_id,
            event_id = kind.event_id(),
            "trace event call failed: {err}"
        );
    }
    conn.clear_pool().await;
}

fn payload_text(command: &CommandRecord, error_message: &str) -> String {
    format!(
        "database: {}\nevent sequence: {}\nerror: {}\ncommand:\n{}",
        command.database, command.event_sequence, error_message, command.text
    )
}

/// Encodes the payload as UTF-16LE, truncated at [`MAX_PAYLOAD_BYTES`] on a
/// code-unit boundary.
pub fn encode_payload(text: &str) -> Vec<u8> {
    let mut out = Vec::with_capacity(text.len().saturating_mul(2).min(MAX_PAYLOAD_BYTES));
    for unit in text.encode_utf16() {
        if out.len() + 2 > MAX_PAYLOAD_BYTES {
            break;
        }
        out.extend_from_slice(&unit.to_le_bytes());
    }
    out
}
