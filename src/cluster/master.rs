//! Cluster master: an HTTP service handing out frame-render jobs in batches
//! and collecting compressed rasters back.
//!
//! Lifecycle: queue all jobs, start the server, let workers register, then
//! open the distribution gate. Jobs are not re-queued if a worker dies with
//! a batch in hand; run redundant workers only when that risk matters.

use std::collections::VecDeque;
use std::io::Read;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use crossbeam_channel::{bounded, Receiver, Sender};
use log::{error, info, warn};
use tiny_http::{Header, Method, Response, Server};

use crate::config::BATCH_SIZE;

use super::protocol::{self, FrameJob, FrameResult, JobConfig, WorkerInfo};

pub struct MasterState {
    pub config: JobConfig,
    jobs: Mutex<VecDeque<FrameJob>>,
    jobs_done: AtomicBool,
    running: AtomicBool,
    jobs_sent: AtomicU64,
    jobs_completed: AtomicU64,
    active_workers: AtomicU64,
    results: Sender<FrameResult>,
}

impl MasterState {
    /// Remove and return up to `n` queued jobs.
    fn take_batch(&self, n: usize) -> Vec<FrameJob> {
        let mut jobs = self.jobs.lock().expect("jobs mutex poisoned");
        let n = n.min(jobs.len());
        jobs.drain(..n).collect()
    }

    fn has_jobs(&self) -> bool {
        let jobs = self.jobs.lock().expect("jobs mutex poisoned");
        !jobs.is_empty() || !self.jobs_done.load(Ordering::Acquire)
    }

    fn pending(&self) -> usize {
        self.jobs.lock().expect("jobs mutex poisoned").len()
    }
}

pub struct Master {
    pub port: u16,
    state: Arc<MasterState>,
}

impl Master {
    /// Create a master plus the channel its ordered writer consumes.
    pub fn new(port: u16, config: JobConfig) -> (Self, Receiver<FrameResult>) {
        let (results_tx, results_rx) = bounded(BATCH_SIZE);
        let state = Arc::new(MasterState {
            config,
            jobs: Mutex::new(VecDeque::new()),
            jobs_done: AtomicBool::new(false),
            running: AtomicBool::new(false),
            jobs_sent: AtomicU64::new(0),
            jobs_completed: AtomicU64::new(0),
            active_workers: AtomicU64::new(0),
            results: results_tx,
        });
        (Master { port, state }, results_rx)
    }

    pub fn add_job(&self, job: FrameJob) {
        self.state
            .jobs
            .lock()
            .expect("jobs mutex poisoned")
            .push_back(job);
    }

    /// Mark the queue complete; an empty queue now means "done", not "wait".
    pub fn finish_adding_jobs(&self) {
        self.state.jobs_done.store(true, Ordering::Release);
    }

    /// Open the distribution gate. Until this is called, workers polling
    /// `/batch` get 202 and keep waiting, so late workers can still attach.
    pub fn start_distribution(&self) {
        self.state.running.store(true, Ordering::Release);
    }

    pub fn active_workers(&self) -> u64 {
        self.state.active_workers.load(Ordering::Relaxed)
    }

    /// Bind the HTTP server and serve requests on a background thread.
    pub fn start_async(&self) -> Result<()> {
        let server = Server::http(("0.0.0.0", self.port))
            .map_err(|e| anyhow::anyhow!("bind master port {}: {e}", self.port))?;
        info!("master listening on :{}", self.port);

        let state = Arc::clone(&self.state);
        std::thread::spawn(move || {
            for request in server.incoming_requests() {
                if let Err(e) = handle_request(&state, request) {
                    error!("master request failed: {e:#}");
                }
            }
        });
        Ok(())
    }
}

fn json_header() -> Header {
    Header::from_bytes(&b"Content-Type"[..], &b"application/json"[..]).expect("static header")
}

fn octet_header() -> Header {
    Header::from_bytes(&b"Content-Type"[..], &b"application/octet-stream"[..])
        .expect("static header")
}

fn handle_request(state: &MasterState, mut request: tiny_http::Request) -> Result<()> {
    let method = request.method().clone();
    let url = request.url().to_string();

    match (method, url.as_str()) {
        (Method::Get, "/config") => {
            let body = serde_json::to_vec(&state.config).context("encode config")?;
            request.respond(Response::from_data(body).with_header(json_header()))?;
        }

        (Method::Post, "/register") => {
            let mut body = Vec::new();
            request.as_reader().read_to_end(&mut body)?;
            match serde_json::from_slice::<WorkerInfo>(&body) {
                Ok(info) => {
                    let id = state.active_workers.fetch_add(1, Ordering::Relaxed) + 1;
                    info!(
                        "worker #{id} registered: {} ({}/{}, {} cores)",
                        info.hostname, info.os, info.arch, info.cpu_cores
                    );
                    request.respond(Response::from_string("ok"))?;
                }
                Err(_) => {
                    request.respond(Response::from_string("invalid worker info").with_status_code(400u16))?;
                }
            }
        }

        (Method::Get, "/batch") => {
            if !state.running.load(Ordering::Acquire) {
                request.respond(Response::empty(202u16))?;
                return Ok(());
            }
            let batch = state.take_batch(BATCH_SIZE);
            if batch.is_empty() {
                let code: u16 = if state.has_jobs() { 202 } else { 204 };
                request.respond(Response::empty(code))?;
                return Ok(());
            }
            state.jobs_sent.fetch_add(batch.len() as u64, Ordering::Relaxed);
            let body = protocol::encode_jobs(&batch);
            request.respond(Response::from_data(body).with_header(octet_header()))?;
        }

        (Method::Post, "/batch") => {
            let mut body = Vec::new();
            request.as_reader().read_to_end(&mut body)?;
            let results = match protocol::decode_results(&body) {
                Ok(results) => results,
                Err(e) => {
                    warn!("bad result batch: {e}");
                    request.respond(
                        Response::from_string(format!("decode error: {e}")).with_status_code(400u16),
                    )?;
                    return Ok(());
                }
            };
            let count = results.len();
            for result in results {
                state.jobs_completed.fetch_add(1, Ordering::Relaxed);
                // Blocking send: backpressure when the ordered writer lags.
                if state.results.send(result).is_err() {
                    request.respond(
                        Response::from_string("collector stopped").with_status_code(503u16),
                    )?;
                    return Ok(());
                }
            }
            request.respond(Response::from_string(format!("ok:{count}")))?;
        }

        (Method::Get, "/status") => {
            let body = format!(
                "{{\"sent\":{},\"completed\":{},\"pending\":{},\"workers\":{},\"total\":{}}}",
                state.jobs_sent.load(Ordering::Relaxed),
                state.jobs_completed.load(Ordering::Relaxed),
                state.pending(),
                state.active_workers.load(Ordering::Relaxed),
                state.config.total_frames,
            );
            request.respond(Response::from_string(body).with_header(json_header()))?;
        }

        (Method::Get, "/") => {
            let body = format!(
                "ncc master - {} active workers\n",
                state.active_workers.load(Ordering::Relaxed)
            );
            request.respond(Response::from_string(body))?;
        }

        _ => {
            request.respond(Response::from_string("not found").with_status_code(404u16))?;
        }
    }
    Ok(())
}
