//! The worker control loop: one client connection, strict request/reply,
//! background tasks reaped between requests.

use std::{io, sync::Arc, time::Duration};

use comms::{
    msg::{Command, Message, Query, Reply},
    MsgReceiver, MsgSender,
};
use log::{debug, info, warn};
use tokio::{
    io::{AsyncRead, AsyncWrite},
    net::{
        tcp::{OwnedReadHalf, OwnedWriteHalf},
        TcpListener, TcpStream,
    },
    task::JoinSet,
    time::MissedTickBehavior,
};

use crate::{session::Background, state::SharedStatus, WorkerErr, WorkerSession};

/// How long a report to the server may wait for its acknowledgement.
const REPORT_TIMEOUT: Duration = Duration::from_secs(5);

/// Reporting channel back to the server that launched this worker.
///
/// A disabled link turns every report into a no-op, which is how the tests
/// (and a worker launched by hand) run.
pub struct ServerLink {
    worker_id: u32,
    conn: Option<(MsgReceiver<OwnedReadHalf>, MsgSender<OwnedWriteHalf>)>,
    buf: Vec<u8>,
    report_timeout: Duration,
}

impl ServerLink {
    pub async fn connect(addr: &str, worker_id: u32) -> io::Result<Self> {
        let stream = TcpStream::connect(addr).await?;
        let (rx, tx) = stream.into_split();
        let (rx, tx) = comms::channel(rx, tx);
        Ok(Self {
            worker_id,
            conn: Some((rx, tx)),
            buf: Vec::new(),
            report_timeout: REPORT_TIMEOUT,
        })
    }

    pub fn disabled(worker_id: u32) -> Self {
        Self {
            worker_id,
            conn: None,
            buf: Vec::new(),
            report_timeout: REPORT_TIMEOUT,
        }
    }

    pub fn with_report_timeout(mut self, timeout: Duration) -> Self {
        self.report_timeout = timeout;
        self
    }

    pub async fn worker_alive(&mut self) -> io::Result<()> {
        let worker_id = self.worker_id;
        self.report(Command::WorkerAlive { worker_id }).await
    }

    pub async fn worker_finished(&mut self) -> io::Result<()> {
        let worker_id = self.worker_id;
        self.report(Command::WorkerFinished { worker_id }).await
    }

    /// One report, one acknowledgement. The wait is bounded; a server that
    /// never answers must not wedge the control loop.
    async fn report(&mut self, cmd: Command) -> io::Result<()> {
        let Some((rx, tx)) = self.conn.as_mut() else {
            return Ok(());
        };
        tx.send(&Message::Command(cmd)).await?;
        let reply = match rx
            .recv_timeout_into::<Message>(&mut self.buf, self.report_timeout)
            .await
        {
            Ok(reply) => reply,
            Err(e) if e.kind() == io::ErrorKind::TimedOut => {
                warn!("server did not acknowledge a report in time");
                return Ok(());
            }
            Err(e) => return Err(e),
        };
        match reply {
            Message::Ack => Ok(()),
            Message::NotAck(reason) => {
                warn!("server rejected report: {reason}");
                Ok(())
            }
            other => Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("unexpected reply from server: {}", other.kind()),
            )),
        }
    }
}

/// Serves one client until it says goodbye, vanishes, or hangs up.
///
/// Waits for requests with a bounded timeout so client silence can be
/// accumulated; enough of it and the job is presumed abandoned. Silence is
/// not counted while a shell command executes, those may legitimately run
/// for a long time with nobody polling.
pub async fn serve_client<R, W>(
    mut session: WorkerSession,
    mut rx: MsgReceiver<R>,
    mut tx: MsgSender<W>,
    mut server: ServerLink,
) -> crate::Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let recv_timeout = session.config().client_recv_timeout;
    let dead_after = session.config().dead_client_timeout;
    let mut silent_for = Duration::ZERO;

    let mut alive = tokio::time::interval(session.config().alive_interval);
    alive.set_missed_tick_behavior(MissedTickBehavior::Delay);
    alive.tick().await;

    // Announce right away; the first interval tick is a full period out.
    if let Err(e) = server.worker_alive().await {
        warn!("could not announce to server: {e}");
    }

    let mut tasks: JoinSet<Background> = JoinSet::new();
    let mut buf = Vec::new();

    loop {
        if session.closing() && tasks.is_empty() {
            break;
        }

        tokio::select! {
            res = rx.recv_timeout_into::<Message>(&mut buf, recv_timeout) => {
                match res {
                    Ok(msg) => {
                        silent_for = Duration::ZERO;
                        // A finished task must be folded back in before the
                        // request runs: the status flags flip inside the task,
                        // so a client that saw "finished" may already be
                        // asking for the results.
                        while let Some(done) = tasks.try_join_next() {
                            match done {
                                Ok(bg) => session.absorb(bg),
                                Err(e) => return Err(WorkerErr::TaskFailed(e.to_string())),
                            }
                        }
                        // The run flag drops inside the task, a moment before
                        // the task itself becomes joinable. If the flag is
                        // already down but the model has not come back, wait
                        // the task out instead of refusing the request.
                        while session.simulation_outcome_pending()
                            && !session.status().sim_in_progress()
                        {
                            match tasks.join_next().await {
                                Some(Ok(bg)) => session.absorb(bg),
                                Some(Err(e)) => {
                                    return Err(WorkerErr::TaskFailed(e.to_string()))
                                }
                                None => break,
                            }
                        }
                        debug!("handling {}", msg.kind());
                        let reply = session.handle_request(msg, &mut tasks).await;
                        tx.send(&reply).await?;
                    }
                    Err(e) if e.kind() == io::ErrorKind::TimedOut => {
                        if !session.status().shell_in_progress() {
                            silent_for += recv_timeout;
                            if silent_for >= dead_after {
                                warn!(
                                    "client silent for {}s, presuming it is gone",
                                    silent_for.as_secs()
                                );
                                if session.status().sim_in_progress() {
                                    session.status().progress().request_stop();
                                }
                                session.mark_closing();
                            }
                        }
                    }
                    Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => {
                        info!("client hung up");
                        if session.status().sim_in_progress() {
                            session.status().progress().request_stop();
                        }
                        session.mark_closing();
                    }
                    Err(e) => return Err(e.into()),
                }
            }
            Some(done) = tasks.join_next(), if !tasks.is_empty() => {
                match done {
                    Ok(bg) => session.absorb(bg),
                    Err(e) => return Err(WorkerErr::TaskFailed(e.to_string())),
                }
            }
            _ = alive.tick() => {
                if let Err(e) = server.worker_alive().await {
                    warn!("could not report liveness to server: {e}");
                }
            }
        }
    }

    info!("worker session over");
    if let Err(e) = server.worker_finished().await {
        warn!("could not report completion to server: {e}");
    }
    Ok(())
}

/// Answers status probes on additional control connections.
///
/// The job client holds the first accepted connection; the launching server
/// may open further ones to check that a worker whose alive reports stopped
/// is still responsive before reaping it.
pub async fn serve_probes(listener: TcpListener, status: Arc<SharedStatus>) {
    loop {
        let (stream, peer) = match listener.accept().await {
            Ok(conn) => conn,
            Err(e) => {
                warn!("probe listener failed: {e}");
                return;
            }
        };
        debug!("probe connection from {peer}");

        let status = status.clone();
        tokio::spawn(async move {
            let (rx, tx) = stream.into_split();
            let (mut rx, mut tx) = comms::channel(rx, tx);
            let mut buf = Vec::new();
            loop {
                let reply = match rx.recv_into::<Message>(&mut buf).await {
                    Ok(Message::Query(Query::WorkerStatus)) => {
                        Message::Reply(Reply::WorkerStatus(status.snapshot()))
                    }
                    Ok(other) => Message::not_ack(format!(
                        "only status queries are answered here, not {}",
                        other.kind()
                    )),
                    Err(_) => return,
                };
                if tx.send(&reply).await.is_err() {
                    return;
                }
            }
        });
    }
}
