use std::{borrow::Cow, io, path::Path, sync::Arc, time::Duration};

use tokio::{
    io as tokio_io,
    io::{DuplexStream, ReadHalf, WriteHalf},
    task::JoinHandle,
};

use comms::{
    msg::{Command, FileChunk, Message, Query, Reply, ResultVariable, WorkerStatus},
    MsgReceiver, MsgSender,
};
use engine::{DemoEngine, RunProgress};
use worker::{
    control::ServerLink, serve_client, serve_probes, state::SharedStatus, WorkerConfig,
    WorkerSession,
};

const BUF_SIZE: usize = 1 << 16;

/// A model that finishes in a few milliseconds.
const FAST_MODEL: &str = "start = 0\nstop = 0.1\nstep = 0.001\ngain = 2\n";

/// A model that takes around two seconds, so tests can observe it mid-run.
const SLOW_MODEL: &str = "start = 0\nstop = 1\nstep = 0.001\npace_us = 2000\n";

/// Client side of an in-memory worker connection.
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

    async fn status(&mut self) -> io::Result<WorkerStatus> {
        self.tx.send(&Message::Query(Query::WorkerStatus)).await?;
        match self.rx.recv_into(&mut self.buf).await? {
            Message::Reply(Reply::WorkerStatus(status)) => Ok(status),
            other => panic!("expected a status reply, got {other:?}"),
        }
    }

    async fn wait_until_finished(&mut self) -> io::Result<WorkerStatus> {
        loop {
            let status = self.status().await?;
            if status.simulation_finished {
                return Ok(status);
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    /// Ok(variables) on a results reply, Err(reason) on a refusal.
    async fn results(
        &mut self,
        filter: &str,
    ) -> io::Result<Result<Vec<ResultVariable>, String>> {
        self.tx
            .send(&Message::Query(Query::Results {
                filter: filter.to_string(),
            }))
            .await?;
        match self.rx.recv_into(&mut self.buf).await? {
            Message::Reply(Reply::Results { variables }) => Ok(Ok(variables)),
            Message::NotAck(reason) => Ok(Err(reason.into_owned())),
            other => panic!("expected results, got {other:?}"),
        }
    }

    async fn fetch_chunk(
        &mut self,
        path: &str,
        offset: u64,
    ) -> io::Result<Result<(Vec<u8>, bool), String>> {
        self.tx
            .send(&Message::Query(Query::File {
                path: path.to_string(),
                offset,
            }))
            .await?;
        match self.rx.recv_into(&mut self.buf).await? {
            Message::FileChunk(chunk) => Ok(Ok((chunk.data.into_owned(), chunk.is_last))),
            Message::NotAck(reason) => Ok(Err(reason.into_owned())),
            other => panic!("expected a file chunk, got {other:?}"),
        }
    }
}

fn spawn_worker(cfg: WorkerConfig) -> (TestClient, JoinHandle<worker::Result<()>>) {
    spawn_worker_with_link(cfg, ServerLink::disabled(0))
}

fn spawn_worker_with_link(
    cfg: WorkerConfig,
    link: ServerLink,
) -> (TestClient, JoinHandle<worker::Result<()>>) {
    let (client_stream, worker_stream) = tokio_io::duplex(BUF_SIZE);

    let (cl_rx, cl_tx) = tokio_io::split(client_stream);
    let (cl_rx, cl_tx) = comms::channel(cl_rx, cl_tx);

    let (wk_rx, wk_tx) = tokio_io::split(worker_stream);
    let (wk_rx, wk_tx) = comms::channel(wk_rx, wk_tx);

    let session = WorkerSession::new(cfg, Box::new(DemoEngine));
    let handle = tokio::spawn(serve_client(session, wk_rx, wk_tx, link));

    (
        TestClient {
            rx: cl_rx,
            tx: cl_tx,
            buf: Vec::new(),
        },
        handle,
    )
}

fn test_config(dir: &Path) -> WorkerConfig {
    WorkerConfig {
        work_dir: dir.to_path_buf(),
        ..WorkerConfig::default()
    }
}

fn set_model(model: &str) -> Message<'static> {
    Message::Command(Command::SetModel {
        model: model.to_string(),
    })
}

#[tokio::test]
async fn full_job_lifecycle() -> io::Result<()> {
    let dir = tempfile::tempdir()?;
    let (mut client, handle) = spawn_worker(test_config(dir.path()));

    assert!(
        client
            .is_acked(Message::Command(Command::IdentifyUser {
                username: "alice".into(),
                password: String::new(),
            }))
            .await?
    );
    assert!(client.is_acked(set_model(FAST_MODEL)).await?);
    assert!(
        client
            .is_acked(Message::Command(Command::SetParameter {
                name: "gain".into(),
                value: "3".into(),
            }))
            .await?
    );
    assert!(client.is_acked(Message::Command(Command::Simulate)).await?);

    let status = client.wait_until_finished().await?;
    assert!(status.simulation_success);
    assert!(status.model_loaded);
    assert_eq!(status.simulation_progress, 1.0);

    let variables = client.results("*").await?.unwrap();
    assert_eq!(variables[0].name, "Time");
    assert_eq!(variables[0].data.len(), variables[1].data.len());

    assert!(
        client
            .is_acked(Message::Command(Command::ClientClosing))
            .await?
    );
    handle.await.unwrap().unwrap();
    Ok(())
}

#[tokio::test]
async fn abort_stops_a_running_simulation() -> io::Result<()> {
    let dir = tempfile::tempdir()?;
    let (mut client, handle) = spawn_worker(test_config(dir.path()));

    assert!(client.is_acked(set_model(SLOW_MODEL)).await?);
    assert!(client.is_acked(Message::Command(Command::Simulate)).await?);
    assert!(client.is_acked(Message::Command(Command::Abort)).await?);

    let status = client.wait_until_finished().await?;
    assert!(!status.simulation_success);

    // Whatever was computed before the stop is still retrievable.
    let variables = client.results("*").await?.unwrap();
    assert!(!variables.is_empty());

    assert!(
        client
            .is_acked(Message::Command(Command::ClientClosing))
            .await?
    );
    handle.await.unwrap().unwrap();
    Ok(())
}

#[tokio::test]
async fn abort_without_a_run_is_refused() -> io::Result<()> {
    let dir = tempfile::tempdir()?;
    let (mut client, handle) = spawn_worker(test_config(dir.path()));

    assert!(!client.is_acked(Message::Command(Command::Abort)).await?);
    assert!(
        client
            .is_acked(Message::Command(Command::ClientClosing))
            .await?
    );
    handle.await.unwrap().unwrap();
    Ok(())
}

#[tokio::test]
async fn requests_refused_while_simulating() -> io::Result<()> {
    let dir = tempfile::tempdir()?;
    let (mut client, handle) = spawn_worker(test_config(dir.path()));

    assert!(client.is_acked(set_model(SLOW_MODEL)).await?);
    assert!(client.is_acked(Message::Command(Command::Simulate)).await?);

    // The worker stays responsive but refuses anything that would disturb
    // the run.
    assert!(!client.is_acked(set_model(FAST_MODEL)).await?);
    assert!(!client.is_acked(Message::Command(Command::Simulate)).await?);
    assert!(
        !client
            .is_acked(Message::Command(Command::SetParameter {
                name: "gain".into(),
                value: "2".into(),
            }))
            .await?
    );
    assert!(client.results("*").await?.is_err());

    // Saying goodbye mid-run is refused too, but remembered.
    assert!(
        !client
            .is_acked(Message::Command(Command::ClientClosing))
            .await?
    );

    let status = client.status().await?;
    assert!(status.simulation_in_progress);
    assert!(status.current_simulation_time >= 0.0);

    assert!(client.is_acked(Message::Command(Command::Abort)).await?);
    handle.await.unwrap().unwrap();
    Ok(())
}

#[tokio::test]
async fn file_upload_and_fetch_roundtrip() -> io::Result<()> {
    let dir = tempfile::tempdir()?;
    let (mut client, handle) = spawn_worker(test_config(dir.path()));

    assert!(
        client
            .is_acked(Message::Command(Command::IdentifyUser {
                username: "alice".into(),
                password: String::new(),
            }))
            .await?
    );

    for (data, is_last) in [(&b"hello "[..], false), (&b"world"[..], true)] {
        assert!(
            client
                .is_acked(Message::FileChunk(FileChunk {
                    path: Cow::Borrowed("assets/input.txt"),
                    is_last,
                    data: Cow::Borrowed(data),
                }))
                .await?
        );
    }

    let on_disk = std::fs::read(dir.path().join("alice/assets/input.txt"))?;
    assert_eq!(on_disk, b"hello world");

    let (data, is_last) = client.fetch_chunk("assets/input.txt", 0).await?.unwrap();
    assert_eq!(data, b"hello world");
    assert!(is_last);

    let (tail, is_last) = client.fetch_chunk("assets/input.txt", 6).await?.unwrap();
    assert_eq!(tail, b"world");
    assert!(is_last);

    assert!(client.fetch_chunk("../escape.txt", 0).await?.is_err());
    assert!(client.fetch_chunk("assets/missing.txt", 0).await?.is_err());

    assert!(
        client
            .is_acked(Message::Command(Command::ClientClosing))
            .await?
    );
    handle.await.unwrap().unwrap();
    Ok(())
}

#[tokio::test]
async fn shell_command_runs_in_the_user_directory() -> io::Result<()> {
    let dir = tempfile::tempdir()?;
    let (mut client, handle) = spawn_worker(test_config(dir.path()));

    assert!(
        client
            .is_acked(Message::Command(Command::IdentifyUser {
                username: "bob".into(),
                password: String::new(),
            }))
            .await?
    );
    assert!(
        client
            .is_acked(Message::Command(Command::ExecuteInShell {
                command: "echo output > produced.txt && pwd".into(),
            }))
            .await?
    );

    // Poll until the command is done.
    loop {
        let status = client.status().await?;
        if !status.shell_in_progress {
            assert!(status.shell_exit_ok);
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    let produced = dir.path().join("bob/produced.txt");
    assert!(produced.exists());

    client.tx.send(&Message::Query(Query::ShellOutput)).await?;
    match client.rx.recv_into(&mut client.buf).await? {
        Message::Reply(Reply::ShellOutput { output }) => {
            assert!(output.contains("bob"));
        }
        other => panic!("expected shell output, got {other:?}"),
    }

    assert!(
        client
            .is_acked(Message::Command(Command::ClientClosing))
            .await?
    );
    handle.await.unwrap().unwrap();
    Ok(())
}

#[tokio::test]
async fn repeated_status_queries_are_idempotent() -> io::Result<()> {
    let dir = tempfile::tempdir()?;
    let (mut client, handle) = spawn_worker(test_config(dir.path()));

    // Idle, nothing ever loaded.
    assert_eq!(client.status().await?, client.status().await?);

    // Model loaded, no run yet.
    assert!(client.is_acked(set_model(FAST_MODEL)).await?);
    let loaded = client.status().await?;
    assert_eq!(loaded, client.status().await?);
    assert!(loaded.model_loaded);
    assert_eq!(loaded.simulation_progress, -1.0);

    // Run finished; nothing moves any more.
    assert!(client.is_acked(Message::Command(Command::Simulate)).await?);
    client.wait_until_finished().await?;
    let finished = client.status().await?;
    assert_eq!(finished, client.status().await?);
    assert!(finished.simulation_finished);

    assert!(
        client
            .is_acked(Message::Command(Command::ClientClosing))
            .await?
    );
    handle.await.unwrap().unwrap();
    Ok(())
}

#[tokio::test]
async fn results_follow_immediately_after_the_finished_flag() -> io::Result<()> {
    let dir = tempfile::tempdir()?;
    let (mut client, handle) = spawn_worker(test_config(dir.path()));
    assert!(client.is_acked(set_model(FAST_MODEL)).await?);

    // Hammer the status until the finished flag shows, then demand the
    // results in the very next request. A results refusal here would mean
    // the worker showed the flag before it took the model back.
    for _ in 0..5 {
        assert!(client.is_acked(Message::Command(Command::Simulate)).await?);
        while !client.status().await?.simulation_finished {}
        let variables = client.results("*").await?.expect("results right after finish");
        assert!(!variables.is_empty());
    }

    assert!(
        client
            .is_acked(Message::Command(Command::ClientClosing))
            .await?
    );
    handle.await.unwrap().unwrap();
    Ok(())
}

#[tokio::test]
async fn worker_announces_itself_at_startup() -> io::Result<()> {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?.to_string();

    let (seen_tx, seen_rx) = tokio::sync::oneshot::channel();
    tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let (rx, tx) = stream.into_split();
        let (mut rx, mut tx) = comms::channel(rx, tx);
        let mut buf = Vec::new();
        if let Ok(Message::Command(Command::WorkerAlive { worker_id })) =
            rx.recv_into::<Message>(&mut buf).await
        {
            tx.send(&Message::Ack).await.unwrap();
            let _ = seen_tx.send(worker_id);
        }
    });

    let link = ServerLink::connect(&addr, 9).await?;
    let dir = tempfile::tempdir()?;
    let cfg = WorkerConfig {
        alive_interval: Duration::from_secs(3600),
        ..test_config(dir.path())
    };
    let (mut client, handle) = spawn_worker_with_link(cfg, link);

    // The report must arrive right away, not an alive interval from now.
    let worker_id = tokio::time::timeout(Duration::from_secs(2), seen_rx)
        .await
        .expect("the worker never announced itself")
        .unwrap();
    assert_eq!(worker_id, 9);

    assert!(
        client
            .is_acked(Message::Command(Command::ClientClosing))
            .await?
    );
    handle.await.unwrap().unwrap();
    Ok(())
}

#[tokio::test]
async fn silent_server_does_not_wedge_reports() -> io::Result<()> {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?.to_string();

    // Accepts the link and holds it open without ever replying.
    let hold = tokio::spawn(async move {
        let (_stream, _) = listener.accept().await.unwrap();
        tokio::time::sleep(Duration::from_secs(60)).await;
    });

    let mut link = ServerLink::connect(&addr, 7)
        .await?
        .with_report_timeout(Duration::from_millis(100));
    let report = tokio::time::timeout(Duration::from_secs(2), link.worker_alive()).await;
    assert!(report.expect("the report wait must be bounded").is_ok());

    hold.abort();
    Ok(())
}

#[tokio::test]
async fn status_probes_are_answered_on_extra_connections() -> io::Result<()> {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    let status = Arc::new(SharedStatus::new(Arc::new(RunProgress::new())));
    tokio::spawn(serve_probes(listener, status));

    // Several probes in a row; each one gets a fresh connection.
    for _ in 0..2 {
        let stream = tokio::net::TcpStream::connect(addr).await?;
        let (rx, tx) = stream.into_split();
        let (mut rx, mut tx) = comms::channel(rx, tx);
        tx.send(&Message::Query(Query::WorkerStatus)).await?;
        let mut buf = Vec::new();
        match rx.recv_into::<Message>(&mut buf).await? {
            Message::Reply(Reply::WorkerStatus(status)) => assert!(!status.model_loaded),
            other => panic!("expected a status reply, got {other:?}"),
        }
    }
    Ok(())
}

#[tokio::test]
async fn silent_client_is_presumed_gone() -> io::Result<()> {
    let dir = tempfile::tempdir()?;
    let cfg = WorkerConfig {
        client_recv_timeout: Duration::from_millis(50),
        dead_client_timeout: Duration::from_millis(150),
        ..test_config(dir.path())
    };
    let (_client, handle) = spawn_worker(cfg);

    // No requests at all: the worker gives up on its own.
    let joined = tokio::time::timeout(Duration::from_secs(5), handle).await;
    joined.expect("worker should exit").unwrap().unwrap();
    Ok(())
}
