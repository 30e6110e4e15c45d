//! Read-only server snapshot.

use std::fmt;

use serde::Serialize;

/// Snapshot returned by [`super::ReplServer::status`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ServerStatus {
    /// Whether the listener is open and accepting.
    pub running: bool,
    /// Bound port while running, configured port otherwise.
    pub listen_port: u16,
    /// Number of registered sessions.
    pub session_count: usize,
    /// Units queued or running on the engine.
    pub pending_units: usize,
    /// Units the engine has completed since the server was created.
    pub completed_units: u64,
}

impl fmt::Display for ServerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = if self.running { "RUNNING" } else { "STOPPED" };
        write!(
            f,
            "{state} port={} sessions={} pending={} completed={}",
            self.listen_port, self.session_count, self.pending_units, self.completed_units
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_reports_state_and_counts() {
        let status = ServerStatus {
            running: true,
            listen_port: 9000,
            session_count: 2,
            pending_units: 1,
            completed_units: 14,
        };
        assert_eq!(
            status.to_string(),
            "RUNNING port=9000 sessions=2 pending=1 completed=14"
        );
    }

    #[test]
    fn stopped_display() {
        let status = ServerStatus {
            running: false,
            listen_port: 5051,
            session_count: 0,
            pending_units: 0,
            completed_units: 0,
        };
        assert!(status.to_string().starts_with("STOPPED"));
        assert!(status.to_string().contains("sessions=0"));
    }
}
