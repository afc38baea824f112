//! Credential and share validation seams.
//!
//! Both checks are coin-specific and live outside the pool core. The core
//! calls [`AddressValidator`] on `mining.authorize` and [`ShareValidator`] on
//! `mining.submit`. The permissive implementations here let the daemon run
//! without a coin backend.

use std::collections::HashSet;
use std::net::IpAddr;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{json, Value};
use thiserror::Error;
use time::OffsetDateTime;

use crate::job_source::Job;
use crate::share::Share;
use crate::stratum::StratumErrorCode;

/// Checks miner credentials.
#[async_trait]
pub trait AddressValidator: Send + Sync {
    /// `miner` is the part of the worker name before the first '.'.
    async fn validate(&self, miner: &str, password: &str) -> bool;
}

/// Who submitted a share.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkerIdentity {
    pub pool_id: String,
    pub miner: String,
    pub worker: Option<String>,
    pub user_agent: Option<String>,
    pub ip: IpAddr,
    pub extranonce1: String,
}

/// A `mining.submit` resolved against its job.
#[derive(Debug, Clone)]
pub struct Submission {
    pub job: Arc<Job>,
    pub params: Vec<Value>,
}

/// Reasons a submission is refused.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ShareRejection {
    #[error("job not found")]
    JobNotFound,

    #[error("stale job")]
    Stale,

    #[error("duplicate share")]
    Duplicate,

    #[error("low difficulty share ({0})")]
    LowDifficulty(f64),

    #[error("malformed submission: {0}")]
    Malformed(String),
}

impl ShareRejection {
    pub fn code(&self) -> StratumErrorCode {
        match self {
            ShareRejection::JobNotFound | ShareRejection::Stale => StratumErrorCode::JobNotFound,
            ShareRejection::Duplicate => StratumErrorCode::DuplicateShare,
            ShareRejection::LowDifficulty(_) => StratumErrorCode::LowDifficultyShare,
            ShareRejection::Malformed(_) => StratumErrorCode::Other,
        }
    }
}

/// Verifies proof of work and builds the share record.
#[async_trait]
pub trait ShareValidator: Send + Sync {
    async fn validate(
        &self,
        worker: &WorkerIdentity,
        submission: &Submission,
        difficulty: f64,
    ) -> Result<Share, ShareRejection>;
}

/// Accepts any miner with a non-empty name.
#[derive(Debug, Default)]
pub struct PermissiveAddressValidator;

#[async_trait]
impl AddressValidator for PermissiveAddressValidator {
    async fn validate(&self, miner: &str, _password: &str) -> bool {
        !miner.trim().is_empty()
    }
}

/// Accepts well-formed, non-duplicate submissions without checking the hash.
///
/// Expects `[worker, job_id, extranonce2, ntime, nonce]` with hex fields.
#[derive(Debug)]
pub struct PermissiveShareValidator {
    extranonce2_size: usize,
    seen: Mutex<SeenShares>,
}

#[derive(Debug, Default)]
struct SeenShares {
    height: u64,
    keys: HashSet<String>,
}

impl PermissiveShareValidator {
    pub fn new(extranonce2_size: usize) -> Self {
        Self {
            extranonce2_size,
            seen: Mutex::new(SeenShares::default()),
        }
    }
}

fn hex_field<'a>(params: &'a [Value], index: usize, name: &str, len: usize) -> Result<&'a str, ShareRejection> {
    let value = params
        .get(index)
        .and_then(Value::as_str)
        .ok_or_else(|| ShareRejection::Malformed(format!("missing {}", name)))?;
    if value.len() != len || hex::decode(value).is_err() {
        return Err(ShareRejection::Malformed(format!("bad {}", name)));
    }
    Ok(value)
}

#[async_trait]
impl ShareValidator for PermissiveShareValidator {
    async fn validate(
        &self,
        worker: &WorkerIdentity,
        submission: &Submission,
        difficulty: f64,
    ) -> Result<Share, ShareRejection> {
        let params = &submission.params;
        let extranonce2 = hex_field(params, 2, "extranonce2", self.extranonce2_size * 2)?;
        let ntime = hex_field(params, 3, "ntime", 8)?;
        let nonce = hex_field(params, 4, "nonce", 8)?;

        let job = &submission.job;
        let key = format!("{}:{}:{}:{}:{}", job.id, worker.extranonce1, extranonce2, ntime, nonce);
        {
            let mut seen = self.seen.lock();
            if job.height > seen.height {
                seen.height = job.height;
                seen.keys.clear();
            } else if job.height < seen.height {
                return Err(ShareRejection::Stale);
            }
            if !seen.keys.insert(key) {
                return Err(ShareRejection::Duplicate);
            }
        }

        Ok(Share {
            pool_id: worker.pool_id.clone(),
            miner: worker.miner.clone(),
            worker: worker.worker.clone(),
            user_agent: worker.user_agent.clone(),
            ip: worker.ip,
            difficulty,
            block_height: job.height,
            network_difficulty: job.network_difficulty,
            is_block_candidate: false,
            payload: json!({
                "job_id": job.id,
                "extranonce1": worker.extranonce1,
                "extranonce2": extranonce2,
                "ntime": ntime,
                "nonce": nonce,
            }),
            created: OffsetDateTime::now_utc(),
        })
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;

    pub fn identity() -> WorkerIdentity {
        WorkerIdentity {
            pool_id: "test".into(),
            miner: "miner".into(),
            worker: Some("rig".into()),
            user_agent: None,
            ip: IpAddr::from([127, 0, 0, 1]),
            extranonce1: "00000001".into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job_source::test_support::job;
    use test_case::test_case;

    fn submission(height: u64, nonce: &str) -> Submission {
        Submission {
            job: job("1", height, true),
            params: vec![
                json!("miner.rig"),
                json!("1"),
                json!("00000000"),
                json!("5f5e1000"),
                json!(nonce),
            ],
        }
    }

    #[tokio::test]
    async fn test_accepts_and_credits_assigned_difficulty() {
        let validator = PermissiveShareValidator::new(4);
        let share = validator
            .validate(&test_support::identity(), &submission(10, "00000001"), 32.0)
            .await
            .unwrap();

        assert_eq!(share.difficulty, 32.0);
        assert_eq!(share.block_height, 10);
        assert_eq!(share.miner, "miner");
        assert_eq!(share.payload["nonce"], "00000001");
    }

    #[tokio::test]
    async fn test_duplicate_rejected() {
        let validator = PermissiveShareValidator::new(4);
        let id = test_support::identity();
        validator.validate(&id, &submission(10, "00000001"), 1.0).await.unwrap();

        let err = validator.validate(&id, &submission(10, "00000001"), 1.0).await.unwrap_err();
        assert_eq!(err, ShareRejection::Duplicate);
        assert_eq!(err.code(), StratumErrorCode::DuplicateShare);
    }

    #[tokio::test]
    async fn test_older_height_is_stale() {
        let validator = PermissiveShareValidator::new(4);
        let id = test_support::identity();
        validator.validate(&id, &submission(11, "00000001"), 1.0).await.unwrap();

        let err = validator.validate(&id, &submission(10, "00000002"), 1.0).await.unwrap_err();
        assert_eq!(err, ShareRejection::Stale);
    }

    #[test_case("0001" ; "short nonce")]
    #[test_case("zzzzzzzz" ; "non hex nonce")]
    #[tokio::test]
    async fn test_malformed(nonce: &str) {
        let validator = PermissiveShareValidator::new(4);
        let err = validator
            .validate(&test_support::identity(), &submission(10, nonce), 1.0)
            .await
            .unwrap_err();
        assert!(matches!(err, ShareRejection::Malformed(_)));
        assert_eq!(err.code(), StratumErrorCode::Other);
    }

    #[tokio::test]
    async fn test_address_validator() {
        let validator = PermissiveAddressValidator;
        assert!(validator.validate("bc1qminer", "x").await);
        assert!(!validator.validate("  ", "x").await);
    }
}
