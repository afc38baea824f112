//! Accepted share record.

use std::net::IpAddr;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use time::OffsetDateTime;

/// One accepted submission, as handed to the persistence pipeline.
///
/// `difficulty` is what the connection was assigned when the job was
/// notified, not whatever it may have been retargeted to since.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Share {
    pub pool_id: String,
    pub miner: String,
    pub worker: Option<String>,
    pub user_agent: Option<String>,
    pub ip: IpAddr,
    pub difficulty: f64,
    pub block_height: u64,
    pub network_difficulty: f64,
    pub is_block_candidate: bool,

    /// Coin-specific verification data (block hex, hashes)
    pub payload: Value,

    #[serde(with = "time::serde::rfc3339")]
    pub created: OffsetDateTime,
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;

    pub fn share(miner: &str, height: u64) -> Share {
        Share {
            pool_id: "test".into(),
            miner: miner.into(),
            worker: Some("rig1".into()),
            user_agent: None,
            ip: IpAddr::from([127, 0, 0, 1]),
            difficulty: 8.0,
            block_height: height,
            network_difficulty: 1000.0,
            is_block_candidate: false,
            payload: Value::Null,
            created: OffsetDateTime::UNIX_EPOCH,
        }
    }
}
