use std::fmt;

/// Everything that can go wrong inside the tracker.
///
/// Per-territory failures are isolated by the poller: one bad snapshot or one
/// failed batch never aborts reconciliation of sibling territories. The worst
/// outcome of any variant is "this cycle's update for one territory is
/// deferred to the next cycle".
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// A snapshot arrived without its identity fields (territory id, prime
    /// time). The whole snapshot is rejected and nothing is written.
    MalformedSnapshot {
        territory_id: String,
        reason: String,
    },

    /// An upstream request failed or returned an undecodable body. The
    /// affected batch is skipped for this cycle and retried naturally on the
    /// next poll.
    UpstreamFetch {
        endpoint: String,
        reason: String,
    },

    /// The persistent store rejected an operation.
    Database(String),

    /// The config file is unreadable or fails validation.
    Config(String),
}

impl Error {
    pub fn malformed<T: AsRef<str>, R: AsRef<str>>(territory_id: T, reason: R) -> Self {
        Self::MalformedSnapshot {
            territory_id: territory_id.as_ref().to_string(),
            reason: reason.as_ref().to_string(),
        }
    }

    pub fn fetch<E: AsRef<str>, R: AsRef<str>>(endpoint: E, reason: R) -> Self {
        Self::UpstreamFetch {
            endpoint: endpoint.as_ref().to_string(),
            reason: reason.as_ref().to_string(),
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MalformedSnapshot {
                territory_id,
                reason,
            } => {
                write!(f, "malformed snapshot for territory {territory_id:?} - {reason}")
            }
            Self::UpstreamFetch { endpoint, reason } => {
                write!(f, "upstream fetch failed for {endpoint} - {reason}")
            }
            Self::Database(reason) => write!(f, "database - {reason}"),
            Self::Config(reason) => write!(f, "config - {reason}"),
        }
    }
}

impl std::error::Error for Error {}

impl From<mysql_async::Error> for Error {
    fn from(e: mysql_async::Error) -> Self {
        Self::Database(e.to_string())
    }
}

impl From<reqwest::Error> for Error {
    fn from(e: reqwest::Error) -> Self {
        let endpoint = e
            .url()
            .map(|u| u.to_string())
            .unwrap_or_else(|| "<unknown endpoint>".to_string());

        Self::UpstreamFetch {
            endpoint,
            reason: e.to_string(),
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Self::Config(e.to_string())
    }
}

impl From<serde_yaml::Error> for Error {
    fn from(e: serde_yaml::Error) -> Self {
        Self::Config(e.to_string())
    }
}
