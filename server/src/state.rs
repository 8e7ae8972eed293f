use std::{collections::HashMap, time::Instant};

use comms::msg::{Command, Message, Query, Reply, ServerStatus};
use log::{info, warn};

use crate::{
    launch::{LaunchRequest, WorkerHandle, WorkerLauncher},
    ServerConfig, SlotPool,
};

/// One granted slot request with a live worker behind it.
pub struct Job {
    pub slots: u32,
    pub port_offset: u16,
    pub userid: String,
    pub last_alive: Instant,
    handle: Box<dyn WorkerHandle>,
}

/// Everything the request handlers and the reaper share, guarded by one
/// mutex per server instance.
pub struct ServerState {
    cfg: ServerConfig,
    pool: SlotPool,
    jobs: HashMap<u32, Job>,
    next_worker_id: u32,
    launcher: Box<dyn WorkerLauncher>,
}

impl ServerState {
    pub fn new(cfg: ServerConfig, launcher: Box<dyn WorkerLauncher>) -> Self {
        Self {
            pool: SlotPool::new(cfg.num_slots),
            jobs: HashMap::new(),
            next_worker_id: 0,
            launcher,
            cfg,
        }
    }

    pub fn config(&self) -> &ServerConfig {
        &self.cfg
    }

    pub fn free_slots(&self) -> u32 {
        self.pool.free()
    }

    /// Dispatches one request and produces exactly one reply.
    pub fn handle_request(&mut self, msg: Message<'_>) -> Message<'static> {
        match msg {
            Message::Query(Query::ServerSlots { threads, userid }) => {
                self.grant_slots(threads, userid)
            }
            Message::Query(Query::ServerStatus) => Message::Reply(Reply::ServerStatus(
                ServerStatus {
                    total_slots: self.pool.total(),
                    free_slots: self.pool.free(),
                    ready: true,
                    users: self.jobs.values().map(|j| j.userid.clone()).collect(),
                },
            )),
            Message::Command(Command::WorkerAlive { worker_id }) => self.refresh(worker_id),
            Message::Command(Command::WorkerFinished { worker_id }) => self.finish(worker_id),
            Message::Command(Command::ClientClosing) => Message::Ack,
            other => {
                warn!("unhandled message: {}", other.kind());
                Message::not_ack(format!("unhandled message: {}", other.kind()))
            }
        }
    }

    fn grant_slots(&mut self, slots: u32, userid: String) -> Message<'static> {
        if slots == 0 {
            return Message::not_ack("at least one slot must be requested");
        }

        let offset = match self.pool.reserve(slots) {
            Ok(offset) => offset,
            Err(e) => {
                info!("refusing {slots} slots for {userid}: {e}");
                return Message::not_ack(e.to_string());
            }
        };

        let worker_id = self.next_worker_id;
        let req = LaunchRequest {
            worker_id,
            server_port: self.cfg.port,
            worker_port: self.cfg.port + offset,
            threads: slots,
        };

        // A failed launch must not leak the grant.
        let handle = match self.launcher.launch(req) {
            Ok(handle) => handle,
            Err(e) => {
                warn!("worker launch failed: {e}");
                self.pool.release(slots, offset);
                return Message::not_ack(format!("could not launch worker: {e}"));
            }
        };

        self.next_worker_id += 1;
        self.jobs.insert(
            worker_id,
            Job {
                slots,
                port_offset: offset,
                userid,
                last_alive: Instant::now(),
                handle,
            },
        );
        info!(
            "granted {slots} slots as worker {worker_id}, {} left",
            self.pool.free()
        );
        Message::Reply(Reply::ServerSlots {
            port_offset: offset,
        })
    }

    fn refresh(&mut self, worker_id: u32) -> Message<'static> {
        match self.jobs.get_mut(&worker_id) {
            Some(job) => {
                job.last_alive = Instant::now();
                Message::Ack
            }
            None => Message::not_ack(format!("unknown worker {worker_id}")),
        }
    }

    fn finish(&mut self, worker_id: u32) -> Message<'static> {
        match self.jobs.remove(&worker_id) {
            Some(job) => {
                self.pool.release(job.slots, job.port_offset);
                info!(
                    "worker {worker_id} finished, {} slots free",
                    self.pool.free()
                );
                Message::Ack
            }
            None => Message::not_ack(format!("unknown worker {worker_id}")),
        }
    }

    /// Jobs that have not reported in too long, as (worker id, worker port).
    pub fn stale_jobs(&self) -> Vec<(u32, u16)> {
        self.jobs
            .iter()
            .filter(|(_, job)| job.last_alive.elapsed() >= self.cfg.worker_stale_timeout)
            .map(|(&id, job)| (id, self.cfg.port + job.port_offset))
            .collect()
    }

    /// Kills a presumed-dead worker and reclaims its grant.
    pub fn reap(&mut self, worker_id: u32) {
        if let Some(mut job) = self.jobs.remove(&worker_id) {
            warn!("reaping unresponsive worker {worker_id}");
            job.handle.kill();
            self.pool.release(job.slots, job.port_offset);
        }
    }
}
