//! Connection handling and the expired-relay sweep.

use std::{io, sync::Arc};

use comms::{
    msg::{Command, Message},
    MsgReceiver, MsgSender,
};
use log::{debug, warn};
use parking_lot::Mutex;
use tokio::{
    io::{AsyncRead, AsyncWrite},
    net::TcpListener,
    time::MissedTickBehavior,
};

use crate::DirectoryState;

/// Accepts connections forever, one task per peer.
pub async fn run(listener: TcpListener, state: Arc<Mutex<DirectoryState>>) -> io::Result<()> {
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

/// Strict request/reply until the peer says goodbye or hangs up.
pub async fn serve_connection<R, W>(
    mut rx: MsgReceiver<R>,
    mut tx: MsgSender<W>,
    state: Arc<Mutex<DirectoryState>>,
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

/// Reclaims relay identities whose holders never released them.
pub async fn sweep_expired_relays(state: Arc<Mutex<DirectoryState>>) {
    let interval = state.lock().config().sweep_interval;
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker.tick().await;

    loop {
        ticker.tick().await;
        let purged = state.lock().purge_expired_relays();
        if purged > 0 {
            warn!("reclaimed {purged} expired relay identities");
        }
    }
}
