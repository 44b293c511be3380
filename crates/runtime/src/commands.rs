use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use beerbot_core::{MetricsSnapshot, UserProfile};
use beerbot_ledger::RankedUser;

use crate::supervisor::ConnectionState;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Health {
    Healthy,
    /// Connected according to the supervisor, but the liveness probe disagrees.
    Degraded,
    Disconnected,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonStatus {
    pub health: Health,
    pub connection: ConnectionState,
    pub degraded: bool,
    pub attempt: u32,
    pub last_activity: Option<DateTime<Utc>>,
    pub channel: String,
    pub ledger_path: String,
    pub uptime_secs: u64,
    pub metrics: MetricsSnapshot,
}

/// Read-side queries. Dates are UTC calendar dates, inclusive on both ends.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ClientCommand {
    GivenInRange {
        user: String,
        start: NaiveDate,
        end: NaiveDate,
    },
    ReceivedInRange {
        user: String,
        start: NaiveDate,
        end: NaiveDate,
    },
    ListGivers,
    ListRecipients,
    TopGivers {
        start: NaiveDate,
        end: NaiveDate,
        limit: usize,
    },
    TopReceivers {
        start: NaiveDate,
        end: NaiveDate,
        limit: usize,
    },
    /// Profile of one workspace member, looked up on the platform.
    UserInfo {
        user: String,
    },
    GetStatus,
    Ping,
    Shutdown,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ServerEvent {
    Total(u64),
    Users(Vec<String>),
    Ranking(Vec<RankedUser>),
    User(UserProfile),
    Status(DaemonStatus),
    Ack(String),
    Error(String),
}
