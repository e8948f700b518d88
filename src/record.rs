use std::time::SystemTime;

use serde::{Deserialize, Serialize};

/// A single captured command, as delivered to the replay engine.
///
/// Records are immutable once produced by a listener. `event_sequence` is
/// monotonic within a session; `replay_offset_ms` is the number of
/// milliseconds after the session's anchor time at which the command should
/// be re-executed, or `None` when the capture carried no timing information.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandRecord {
    pub session_id: i64,
    pub app_name: String,
    pub database: String,
    pub text: String,
    pub event_sequence: i64,
    pub replay_offset_ms: Option<u64>,
    pub original_start_time: Option<SystemTime>,
}
