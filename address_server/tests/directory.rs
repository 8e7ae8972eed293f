use std::{io, sync::Arc};

use parking_lot::Mutex;
use tokio::{
    io as tokio_io,
    io::{DuplexStream, ReadHalf, WriteHalf},
};

use address_server::{directory::serve_connection, DirectoryConfig, DirectoryState};
use comms::{
    msg::{Command, MachineInfo, Message, Query, Reply},
    MsgReceiver, MsgSender,
};

const BUF_SIZE: usize = 1 << 16;

struct TestClient {
    rx: MsgReceiver<ReadHalf<DuplexStream>>,
    tx: MsgSender<WriteHalf<DuplexStream>>,
    buf: Vec<u8>,
}

impl TestClient {
    async fn is_acked(&mut self, msg: Message<'_>) -> io::Result<bool> {
        self.tx.send(&msg).await?;
        let reply: Message = self.rx.recv_into(&mut self.buf).await?;
        Ok(matches!(reply, Message::Ack))
    }

    async fn machines(&mut self, count: u32) -> io::Result<Vec<MachineInfo>> {
        self.tx
            .send(&Message::Query(Query::ServerMachines {
                count,
                max_benchmark_secs: 1e9,
            }))
            .await?;
        match self.rx.recv_into(&mut self.buf).await? {
            Message::Reply(Reply::ServerMachines { machines }) => Ok(machines),
            other => panic!("unexpected reply: {other:?}"),
        }
    }

    async fn relay_slot(&mut self, base_id: &str) -> io::Result<Result<String, String>> {
        self.tx
            .send(&Message::Query(Query::RelaySlot {
                base_id: base_id.to_string(),
                port: 23300,
            }))
            .await?;
        match self.rx.recv_into(&mut self.buf).await? {
            Message::Reply(Reply::RelaySlot { full_id }) => Ok(Ok(full_id)),
            Message::NotAck(reason) => Ok(Err(reason.into_owned())),
            other => panic!("unexpected reply: {other:?}"),
        }
    }
}

fn spawn_directory() -> TestClient {
    let state = Arc::new(Mutex::new(DirectoryState::new(DirectoryConfig::default())));

    let (client_stream, server_stream) = tokio_io::duplex(BUF_SIZE);
    let (cl_rx, cl_tx) = tokio_io::split(client_stream);
    let (cl_rx, cl_tx) = comms::channel(cl_rx, cl_tx);
    let (sv_rx, sv_tx) = tokio_io::split(server_stream);
    let (sv_rx, sv_tx) = comms::channel(sv_rx, sv_tx);
    tokio::spawn(serve_connection(sv_rx, sv_tx, state));

    TestClient {
        rx: cl_rx,
        tx: cl_tx,
        buf: Vec::new(),
    }
}

fn available(address: &str, num_slots: u32) -> Message<'static> {
    Message::Command(Command::ServerAvailable {
        address: address.to_string(),
        description: String::new(),
        num_slots,
    })
}

#[tokio::test]
async fn machines_come_and_go() -> io::Result<()> {
    let mut client = spawn_directory();

    assert!(client.is_acked(available("10.0.0.1:23300", 4)).await?);
    assert!(client.is_acked(available("10.0.0.2:23300", 8)).await?);

    let machines = client.machines(10).await?;
    assert_eq!(machines.len(), 2);

    assert!(
        client
            .is_acked(Message::Command(Command::ServerClosing {
                address: "10.0.0.1:23300".into(),
            }))
            .await?
    );
    let machines = client.machines(10).await?;
    assert_eq!(machines.len(), 1);
    assert_eq!(machines[0].address, "10.0.0.2:23300");

    // Closing twice is refused.
    assert!(
        !client
            .is_acked(Message::Command(Command::ServerClosing {
                address: "10.0.0.1:23300".into(),
            }))
            .await?
    );
    Ok(())
}

#[tokio::test]
async fn machine_listing_is_truncated() -> io::Result<()> {
    let mut client = spawn_directory();

    for i in 0..5 {
        assert!(client.is_acked(available(&format!("10.0.0.{i}:1"), 1)).await?);
    }
    assert_eq!(client.machines(3).await?.len(), 3);
    Ok(())
}

#[tokio::test]
async fn relay_identities_allocate_and_release() -> io::Result<()> {
    let mut client = spawn_directory();

    assert!(client.is_acked(available("10.0.0.1:23300", 4)).await?);
    let base = client.machines(1).await?[0].relay_base_id.clone();

    let first = client.relay_slot(&base).await?.unwrap();
    let second = client.relay_slot(&base).await?.unwrap();
    assert_ne!(first, second);
    assert!(first.starts_with(&format!("{base}.")));

    assert!(
        client
            .is_acked(Message::Command(Command::ReleaseRelaySlot {
                full_id: first.clone(),
            }))
            .await?
    );
    // Released identities are gone, not recycled.
    assert!(
        !client
            .is_acked(Message::Command(Command::ReleaseRelaySlot { full_id: first }))
            .await?
    );
    let third = client.relay_slot(&base).await?.unwrap();
    assert_ne!(third, second);
    Ok(())
}

#[tokio::test]
async fn unknown_relay_base_is_refused_immediately() -> io::Result<()> {
    let mut client = spawn_directory();

    let refusal = client.relay_slot("99").await?.unwrap_err();
    assert!(refusal.contains("unknown relay base"), "{refusal}");
    Ok(())
}
