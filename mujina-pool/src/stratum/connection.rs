//! Per-connection protocol engine.
//!
//! One task per accepted socket. The task reads newline-delimited requests,
//! answers them in arrival order, and receives job announcements from the
//! registry through a bounded command queue. It ends on EOF, transport
//! error, junk input, a ban, eviction (zombie, idle or stalled writes) or
//! shutdown, and always unregisters itself on the way out. Writes observe
//! cancellation, so a client that stops reading cannot pin the task.

use std::io;
use std::net::SocketAddr;
use std::sync::{Arc, LazyLock};
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use regex::Regex;
use serde::Serialize;
use serde_json::{json, Value};
use tokio::io::{AsyncRead, AsyncWrite, ReadHalf, WriteHalf};
use tokio::sync::mpsc;
use tokio::time::{self, Instant};
use tokio_util::codec::{FramedRead, FramedWrite, LinesCodec, LinesCodecError};
use tokio_util::sync::CancellationToken;

use super::context::ConnectionContext;
use super::messages::{
    parse_request, Notification, Request, Response, StratumErrorCode, StratumMethod,
};
use crate::banning::{BanManager, BanVerdict};
use crate::config::{BanningConfig, EndpointConfig, PoolSettings};
use crate::extranonce::ExtraNonceAllocator;
use crate::job_source::{ActiveJobs, Job};
use crate::persistence::ShareRecorder;
use crate::registry::{ConnectionCommand, ConnectionHandle, ConnectionRegistry, SEND_QUEUE_CAPACITY};
use crate::tracing::prelude::*;
use crate::validation::{AddressValidator, ShareRejection, ShareValidator, Submission};
use crate::vardiff::VarDiffManagers;

/// Longest request line accepted.
pub const MAX_REQUEST_LENGTH: usize = 0x8000;

/// Longest a single write may wait on a client that stopped reading.
pub const SEND_TIMEOUT: Duration = Duration::from_secs(30);

/// Ban applied to addresses sending unparseable input.
pub const JUNK_BAN_DURATION: Duration = Duration::from_secs(3 * 60);

// Static difficulty requested through the password, e.g. "x;d=512"
static STATIC_DIFFICULTY: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?:^|;)\s*d=(\d*(?:\.\d+)?)").expect("static difficulty pattern")
});

/// Everything a connection task needs from the pool.
pub struct ConnectionServices {
    pub settings: PoolSettings,
    pub banning: BanningConfig,
    pub extranonce: Arc<ExtraNonceAllocator>,
    pub jobs: Arc<ActiveJobs>,
    pub vardiff: Arc<VarDiffManagers>,
    pub bans: Arc<BanManager>,
    pub registry: Arc<ConnectionRegistry>,
    pub address_validator: Arc<dyn AddressValidator>,
    pub share_validator: Arc<dyn ShareValidator>,
    pub recorder: ShareRecorder,
}

enum Flow {
    Continue,
    Close,
}

type SendResult = Result<Flow, LinesCodecError>;

struct Connection<S> {
    reader: FramedRead<ReadHalf<S>, LinesCodec>,
    writer: FramedWrite<WriteHalf<S>, LinesCodec>,
    ctx: ConnectionContext,
    services: Arc<ConnectionServices>,
    commands: mpsc::Receiver<ConnectionCommand>,
    cancel: CancellationToken,
}

/// Serve one client until it disconnects, is evicted, or `shutdown` fires.
pub async fn serve_connection<S>(
    stream: S,
    remote: SocketAddr,
    endpoint: Arc<EndpointConfig>,
    services: Arc<ConnectionServices>,
    shutdown: CancellationToken,
) where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let registry = services.registry.clone();
    let id = registry.next_id();
    let (tx, commands) = mpsc::channel(SEND_QUEUE_CAPACITY);
    let cancel = shutdown.child_token();
    registry.register(ConnectionHandle::new(id, remote, endpoint.port, tx, cancel.clone()));

    let vardiff = endpoint
        .vardiff
        .as_ref()
        .map(|config| services.vardiff.get_or_create(endpoint.port, config));
    let ctx = ConnectionContext::new(id, remote, endpoint, vardiff, Instant::now());

    let (read, write) = tokio::io::split(stream);
    let connection = Connection {
        reader: FramedRead::new(read, LinesCodec::new_with_max_length(MAX_REQUEST_LENGTH)),
        writer: FramedWrite::new(write, LinesCodec::new()),
        ctx,
        services,
        commands,
        cancel,
    };

    debug!(conn = %id, addr = %remote, "Client connected.");
    connection.run().await;
    registry.unregister(id);
}

impl<S> Connection<S>
where
    S: AsyncRead + AsyncWrite + Send,
{
    async fn run(mut self) {
        let id = self.ctx.id;
        let zombie_deadline = self.ctx.created + self.services.settings.zombie_grace();

        loop {
            let flow = tokio::select! {
                _ = self.cancel.cancelled() => {
                    debug!(conn = %id, "Connection cancelled.");
                    break;
                }
                _ = time::sleep_until(zombie_deadline), if self.ctx.last_receive.is_none() => {
                    info!(conn = %id, addr = %self.ctx.remote, "Closing zombie connection.");
                    break;
                }
                command = self.commands.recv() => match command {
                    Some(ConnectionCommand::Notify(job)) => self.on_job(job).await,
                    None => break,
                },
                line = self.reader.next() => match line {
                    Some(Ok(line)) => self.on_line(&line).await,
                    Some(Err(LinesCodecError::MaxLineLengthExceeded)) => {
                        self.on_junk("request too long");
                        break;
                    }
                    Some(Err(e)) => {
                        debug!(conn = %id, error = %e, "Connection error.");
                        break;
                    }
                    None => {
                        debug!(conn = %id, "Client disconnected.");
                        break;
                    }
                },
            };

            match flow {
                Ok(Flow::Continue) => {}
                Ok(Flow::Close) => break,
                Err(e) => {
                    debug!(conn = %id, error = %e, "Failed to send.");
                    break;
                }
            }
        }

        info!(
            conn = %id,
            addr = %self.ctx.remote,
            valid = self.ctx.stats.valid,
            invalid = self.ctx.stats.invalid,
            "Connection closed."
        );
    }

    async fn on_line(&mut self, line: &str) -> SendResult {
        self.ctx.mark_receive(Instant::now());

        let ip = self.ctx.remote.ip();
        if self.services.bans.is_banned(&ip) {
            info!(conn = %self.ctx.id, addr = %ip, "Disconnecting banned client.");
            return Ok(Flow::Close);
        }

        let line = line.trim();
        if line.is_empty() {
            return Ok(Flow::Continue);
        }

        let request = match parse_request(line) {
            Ok(request) => request,
            Err(e) => {
                self.on_junk(&e.to_string());
                return Ok(Flow::Close);
            }
        };
        trace!(conn = %self.ctx.id, method = %request.method, "Request.");

        match request.known_method() {
            Some(StratumMethod::Subscribe) => self.on_subscribe(request).await,
            Some(StratumMethod::Authorize) => self.on_authorize(request).await,
            Some(StratumMethod::Submit) => self.on_submit(request).await,
            Some(StratumMethod::SuggestDifficulty) => self.on_suggest_difficulty(request).await,
            Some(StratumMethod::ExtranonceSubscribe) => {
                self.send(&Response::ok(request.id, json!(true))).await
            }
            _ => {
                debug!(conn = %self.ctx.id, method = %request.method, "Unsupported request.");
                let message = format!("Unsupported request {}", request.method);
                self.send(&Response::error(request.id, StratumErrorCode::Other, message))
                    .await
            }
        }
    }

    fn on_junk(&self, reason: &str) {
        let ip = self.ctx.remote.ip();
        warn!(conn = %self.ctx.id, addr = %ip, reason, "Junk received, disconnecting.");
        if self.banning().ban_on_junk_receive {
            self.services.bans.ban(ip, JUNK_BAN_DURATION);
        }
    }

    async fn on_subscribe(&mut self, request: Request) -> SendResult {
        let first = !self.ctx.subscribed;
        if first {
            self.ctx.extranonce1 = Some(self.services.extranonce.next());
            self.ctx.user_agent = request
                .str_param(0)
                .map(str::trim)
                .filter(|agent| !agent.is_empty())
                .map(str::to_owned);
            self.ctx.subscribed = true;
        }

        let result = json!([
            [["mining.notify", self.ctx.id.to_string()]],
            self.ctx.extranonce1,
            self.services.settings.extranonce2_size,
        ]);
        self.send(&Response::ok(request.id, result)).await?;

        if first {
            info!(
                conn = %self.ctx.id,
                agent = self.ctx.user_agent.as_deref().unwrap_or("-"),
                "Client subscribed."
            );
            self.ctx.apply_pending_difficulty();
            self.send(&Notification::set_difficulty(self.ctx.difficulty())).await?;
            if let Some(job) = self.services.jobs.current() {
                self.send_job(&job).await?;
            }
        }
        Ok(Flow::Continue)
    }

    async fn on_authorize(&mut self, request: Request) -> SendResult {
        let worker_value = request.str_param(0).unwrap_or_default().trim();
        let password = request.str_param(1).unwrap_or_default().trim();
        let (miner, worker) = split_worker(worker_value);

        let valid = self.services.address_validator.validate(miner, password).await;
        self.send(&Response::ok(request.id.clone(), json!(valid))).await?;

        if !valid {
            info!(conn = %self.ctx.id, miner, "Unauthorized worker.");
            return Ok(Flow::Continue);
        }

        self.ctx.authorized = true;
        self.ctx.miner = Some(miner.to_owned());
        self.ctx.worker = worker.map(str::to_owned);
        info!(
            conn = %self.ctx.id,
            miner,
            worker = worker.unwrap_or("-"),
            "Authorized worker."
        );

        if let Some(difficulty) = static_difficulty(password) {
            if self.accepts_static_difficulty(difficulty) {
                info!(conn = %self.ctx.id, difficulty, "Static difficulty requested.");
                self.ctx.set_static_difficulty(difficulty);
            }
        }
        Ok(Flow::Continue)
    }

    fn accepts_static_difficulty(&self, difficulty: f64) -> bool {
        match &self.ctx.endpoint.vardiff {
            Some(vardiff) => difficulty >= vardiff.min_diff,
            None => difficulty > self.ctx.endpoint.difficulty,
        }
    }

    async fn on_submit(&mut self, request: Request) -> SendResult {
        let outcome = self.validate_submit(&request).await;

        let valid = match outcome {
            Ok(share) => {
                self.send(&Response::ok(request.id, json!(true))).await?;
                self.ctx.stats.valid += 1;

                if share.is_block_candidate {
                    info!(conn = %self.ctx.id, height = share.block_height, "Block candidate found.");
                }
                let network_difficulty = share.network_difficulty;
                debug!(conn = %self.ctx.id, difficulty = share.difficulty, "Share accepted.");
                self.services.recorder.enqueue(share);

                if let Some(proposed) = self
                    .ctx
                    .update_vardiff(Some(network_difficulty), Instant::now())
                {
                    debug!(conn = %self.ctx.id, difficulty = proposed, "Vardiff retarget queued.");
                }
                true
            }
            Err((code, message)) => {
                self.send(&Response::error(request.id, code, &message)).await?;
                self.ctx.stats.invalid += 1;
                info!(conn = %self.ctx.id, reason = %message, "Share rejected.");
                false
            }
        };

        let verdict = self
            .services
            .bans
            .record_share(self.ctx.remote.ip(), valid, self.banning());
        if verdict == BanVerdict::Banned {
            return Ok(Flow::Close);
        }
        Ok(Flow::Continue)
    }

    async fn validate_submit(
        &self,
        request: &Request,
    ) -> Result<crate::share::Share, (StratumErrorCode, String)> {
        if !self.ctx.authorized {
            return Err((StratumErrorCode::UnauthorizedWorker, "unauthorized worker".into()));
        }
        if !self.ctx.subscribed {
            return Err((StratumErrorCode::NotSubscribed, "not subscribed".into()));
        }

        let reject = |r: ShareRejection| (r.code(), r.to_string());
        let job_id = request.str_param(1).ok_or_else(|| reject(ShareRejection::JobNotFound))?;
        let job = self
            .services
            .jobs
            .get(job_id)
            .ok_or_else(|| reject(ShareRejection::JobNotFound))?;

        let difficulty = self.ctx.difficulty_for_job(job_id);
        let submission = Submission {
            job,
            params: request.params.as_array().cloned().unwrap_or_default(),
        };
        let identity = self.ctx.identity(&self.services.settings.id);

        self.services
            .share_validator
            .validate(&identity, &submission, difficulty)
            .await
            .map_err(reject)
    }

    async fn on_suggest_difficulty(&mut self, request: Request) -> SendResult {
        self.send(&Response::ok(request.id.clone(), json!(true))).await?;

        if let Some(difficulty) = request.param(0).and_then(Value::as_f64) {
            if difficulty > self.ctx.endpoint.difficulty {
                debug!(conn = %self.ctx.id, difficulty, "Client suggested difficulty.");
                self.ctx.enqueue_difficulty(difficulty);
            }
        }
        Ok(Flow::Continue)
    }

    async fn on_job(&mut self, job: Arc<Job>) -> SendResult {
        if !(self.ctx.subscribed && self.ctx.authorized) {
            return Ok(Flow::Continue);
        }

        if let Some(timeout) = self.services.settings.client_connection_timeout() {
            if self.ctx.is_idle(Instant::now(), timeout) {
                info!(conn = %self.ctx.id, addr = %self.ctx.remote, "Closing idle connection.");
                return Ok(Flow::Close);
            }
        }

        if let Some(difficulty) = self.ctx.apply_pending_difficulty() {
            debug!(
                conn = %self.ctx.id,
                difficulty,
                previous = self.ctx.previous_difficulty(),
                "Applying difficulty."
            );
            self.send(&Notification::set_difficulty(difficulty)).await?;
        }
        self.send_job(&job).await
    }

    async fn send_job(&mut self, job: &Job) -> SendResult {
        self.ctx.record_notify(&job.id);
        self.send(&Notification::notify(job.notify_params())).await
    }

    /// Write one message, giving up on cancellation or a stalled reader.
    async fn send<T: Serialize>(&mut self, message: &T) -> SendResult {
        let line = match serde_json::to_string(message) {
            Ok(line) => line,
            Err(e) => {
                error!(conn = %self.ctx.id, error = %e, "Failed to encode message.");
                return Ok(Flow::Continue);
            }
        };

        tokio::select! {
            _ = self.cancel.cancelled() => {
                Err(io::Error::new(io::ErrorKind::Interrupted, "connection cancelled").into())
            }
            sent = time::timeout(SEND_TIMEOUT, self.writer.send(line)) => match sent {
                Ok(result) => result.map(|()| Flow::Continue),
                Err(_) => Err(io::Error::new(io::ErrorKind::TimedOut, "write timed out").into()),
            },
        }
    }

    fn banning(&self) -> &BanningConfig {
        self.ctx.endpoint.banning_or(&self.services.banning)
    }
}

/// Split "miner.worker" at the first dot.
fn split_worker(value: &str) -> (&str, Option<&str>) {
    match value.split_once('.') {
        Some((miner, worker)) if !worker.is_empty() => (miner, Some(worker)),
        Some((miner, _)) => (miner, None),
        None => (value, None),
    }
}

/// Difficulty requested via `d=<value>` in the password.
fn static_difficulty(password: &str) -> Option<f64> {
    let captures = STATIC_DIFFICULTY.captures(password)?;
    captures
        .get(1)?
        .as_str()
        .parse::<f64>()
        .ok()
        .filter(|d| *d > 0.0)
}
