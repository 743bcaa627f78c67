use chrono::{DateTime, Utc};

use crate::shell::temp_files::CommandFiles;

/// Bookkeeping for one in-flight command.
///
/// Holds by-value copies of everything it needs; no back-pointer to the
/// session. The completion/timeout winner removes the entry and cleans the
/// file set; anything left behind (client vanished mid-await) is reclaimed
/// by the temp sweeper through the file age floor.
#[derive(Debug)]
pub struct PendingCommand {
    pub command_id: String,
    pub files: CommandFiles,
    pub started_at: DateTime<Utc>,
    pub deadline: DateTime<Utc>,
    pub streaming: bool,
}

impl PendingCommand {
    pub fn new(command_id: &str, files: CommandFiles, timeout_ms: u64, streaming: bool) -> Self {
        let started_at = Utc::now();
        PendingCommand {
            command_id: command_id.to_string(),
            files,
            started_at,
            deadline: started_at + chrono::Duration::milliseconds(timeout_ms as i64),
            streaming,
        }
    }
}
