//! Cheap liveness probe for a single connection.

use crate::db::connection::Connection;
use std::time::Duration;
use tracing::debug;

/// Default upper bound on a single validation round trip.
pub const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_secs(5);

/// Confirms a connection is usable before it is trusted.
///
/// Never fails: an absent connection, a probe error or a probe that does not
/// answer within `probe_timeout` all yield `false`.
#[derive(Debug, Clone, Copy)]
pub struct ConnectionValidator {
    probe_timeout: Duration,
}

impl ConnectionValidator {
    pub fn new(probe_timeout: Duration) -> Self {
        Self { probe_timeout }
    }

    pub async fn is_valid<C: Connection>(&self, connection: Option<&mut C>) -> bool {
        let Some(connection) = connection else {
            return false;
        };

        match tokio::time::timeout(self.probe_timeout, connection.ping()).await {
            Ok(Ok(())) => true,
            Ok(Err(e)) => {
                debug!(error = %e, "Connection failed validation");
                false
            }
            Err(_) => {
                debug!(
                    timeout_ms = self.probe_timeout.as_millis() as u64,
                    "Connection validation timed out"
                );
                false
            }
        }
    }
}

impl Default for ConnectionValidator {
    fn default() -> Self {
        Self::new(DEFAULT_PROBE_TIMEOUT)
    }
}
