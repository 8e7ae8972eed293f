//! Connection handling, the stale-job sweep and directory registration.

use std::{io, sync::Arc, time::Duration};

use comms::{
    msg::{Command, Message, Query},
    MsgReceiver, MsgSender,
};
use log::{debug, info, warn};
use parking_lot::Mutex;
use tokio::{
    io::{AsyncRead, AsyncWrite},
    net::TcpListener,
    net::TcpStream,
    time::MissedTickBehavior,
};

use crate::ServerState;

/// Accepts connections forever, one task per peer.
pub async fn run(listener: TcpListener, state: Arc<Mutex<ServerState>>) -> io::Result<()> {
    loop {
        let (stream, peer) = listener.accept().await?;
        debug!("connection from {peer}");
        stream.set_nodelay(true)?;

        let state = state.clone();
        tokio::spawn(async move {
            let (rx, tx) = stream.into_split();
            let (rx, tx) = comms::channel(rx, tx);
            if let Err(e) = serve_connection(rx, tx, state).await {
                warn!("connection to {peer} failed: {e}");
            }
        });
    }
}

/// Strict request/reply until the peer says goodbye or hangs up. A decode
/// failure earns a NotAck and the connection survives.
pub async fn serve_connection<R, W>(
    mut rx: MsgReceiver<R>,
    mut tx: MsgSender<W>,
    state: Arc<Mutex<ServerState>>,
) -> io::Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = Vec::new();
    loop {
        let msg = match rx.recv_into::<Message>(&mut buf).await {
            Ok(msg) => msg,
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(()),
            Err(e) if e.kind() == io::ErrorKind::InvalidData => {
                warn!("undecodable request: {e}");
                tx.send(&Message::not_ack(format!("bad request: {e}")))
                    .await?;
                continue;
            }
            Err(e) => return Err(e),
        };

        let closing = matches!(msg, Message::Command(Command::ClientClosing));
        let reply = state.lock().handle_request(msg);
        tx.send(&reply).await?;

        if closing {
            return Ok(());
        }
    }
}

/// Periodically probes jobs that stopped reporting and reaps the ones that
/// no longer answer. Probing happens off-lock; a worker that reports in
/// while being probed is spared.
pub async fn sweep_stale_jobs(state: Arc<Mutex<ServerState>>) {
    let (interval, probe_timeout) = {
        let state = state.lock();
        (state.config().sweep_interval, state.config().probe_timeout)
    };
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker.tick().await;

    loop {
        ticker.tick().await;
        let stale = state.lock().stale_jobs();
        for (worker_id, port) in stale {
            if probe_worker(port, probe_timeout).await {
                info!("worker {worker_id} answered its probe");
                continue;
            }
            state.lock().reap(worker_id);
        }
    }
}

/// One status request against a quiet worker; true means it still answers.
async fn probe_worker(port: u16, timeout: Duration) -> bool {
    let attempt = async {
        let stream = TcpStream::connect(("127.0.0.1", port)).await?;
        let (rx, tx) = stream.into_split();
        let (mut rx, mut tx) = comms::channel(rx, tx);
        tx.send(&Message::Query(Query::WorkerStatus)).await?;
        let mut buf = Vec::new();
        rx.recv_into::<Message>(&mut buf).await?;
        Ok::<_, io::Error>(())
    };
    match tokio::time::timeout(timeout, attempt).await {
        Ok(Ok(())) => true,
        _ => false,
    }
}

/// Tells the directory server this machine is available, renewing the
/// registration on an interval so a restarted directory relearns it.
pub async fn announce_loop(state: Arc<Mutex<ServerState>>) {
    let (directory, address, description, num_slots, interval) = {
        let state = state.lock();
        let cfg = state.config();
        let Some(directory) = cfg.directory_address.clone() else {
            return;
        };
        (
            directory,
            cfg.external_address.clone(),
            cfg.description.clone(),
            cfg.num_slots,
            cfg.announce_interval,
        )
    };

    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        let cmd = Command::ServerAvailable {
            address: address.clone(),
            description: description.clone(),
            num_slots,
        };
        match exchange(&directory, Message::Command(cmd)).await {
            Ok(Message::Ack) => debug!("registered with directory at {directory}"),
            Ok(other) => warn!("directory rejected registration: {other:?}"),
            Err(e) => warn!("could not reach directory at {directory}: {e}"),
        }
    }
}

/// Tells the directory server this machine is going away.
pub async fn announce_closing(state: &Arc<Mutex<ServerState>>) {
    let (directory, address) = {
        let state = state.lock();
        let cfg = state.config();
        let Some(directory) = cfg.directory_address.clone() else {
            return;
        };
        (directory, cfg.external_address.clone())
    };
    let cmd = Command::ServerClosing { address };
    if let Err(e) = exchange(&directory, Message::Command(cmd)).await {
        warn!("could not deregister from directory: {e}");
    }
}

async fn exchange(addr: &str, msg: Message<'_>) -> io::Result<Message<'static>> {
    let stream = TcpStream::connect(addr).await?;
    let (rx, tx) = stream.into_split();
    let (mut rx, mut tx) = comms::channel(rx, tx);
    tx.send(&msg).await?;
    let mut buf = Vec::new();
    let reply: Message = rx.recv_into(&mut buf).await?;
    Ok(match reply {
        Message::Ack => Message::Ack,
        Message::NotAck(reason) => Message::not_ack(reason.into_owned()),
        other => {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("unexpected reply: {}", other.kind()),
            ))
        }
    })
}
