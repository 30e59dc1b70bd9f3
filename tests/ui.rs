mod common;

use apa_winder::file_manager::FileManager;
use apa_winder::machine::{ControlLoop, Machine};
use apa_winder::motion::MotionQueue;
use apa_winder::plc::PlcStatusHandle;
use apa_winder::web::server::handle_connection;
use apa_winder::web::{MachineRequest, UiCommand, UiServer};
use std::fs;
use std::path::Path;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tempfile::tempdir;

fn control(root: &Path) -> (ControlLoop, mpsc::Sender<MachineRequest>, broadcast::Sender<()>) {
    common::data_dir(root, "ten.gc", &common::straight_lines(10));
    let config = common::config(root);
    let queue = MotionQueue::new(config.machine.queue_capacity);
    let machine = Machine::new(&config, FileManager::new(root), queue, PlcStatusHandle::new()).unwrap();
    let (mailbox_tx, mailbox_rx) = mpsc::channel(8);
    let (shutdown_tx, _) = broadcast::channel(4);
    let control = ControlLoop::new(machine, mailbox_rx, shutdown_tx.clone(), Duration::from_millis(10));
    (control, mailbox_tx, shutdown_tx)
}

/// Tick the control loop until `task` is done.
async fn serve_until<T>(control: &mut ControlLoop, task: JoinHandle<T>) -> T {
    for _ in 0..500 {
        if task.is_finished() {
            break;
        }
        control.tick().await.unwrap();
        tokio::time::sleep(Duration::from_millis(2)).await;
    }
    task.await.unwrap()
}

#[tokio::test]
async fn test_replies_in_order_and_skips_blank_lines() {
    let dir = tempdir().unwrap();
    let (mut control, mailbox, shutdown) = control(dir.path());
    let stream = tokio_test::io::Builder::new()
        .read(b"frobnicate\n")
        .write(b"error unknown command 'frobnicate'\n")
        .read(b"\n")
        .read(b"jog 1 2\n")
        .write(b"error usage: jog <x> <y> <z> [velocity]\n")
        .read(b"load ten.gc 2\n")
        .write(b"ok X 10 lines\n")
        .read(b"stop\n")
        .write(b"ok\n")
        .build();

    let connection = tokio::spawn(handle_connection(stream, mailbox, control.snapshot(), shutdown.subscribe()));
    serve_until(&mut control, connection).await.unwrap();

    let session = control.machine().handler().session().unwrap();
    assert_eq!(session.cursor, 2);
}

#[tokio::test]
async fn test_status_is_json() {
    let dir = tempdir().unwrap();
    let (control, mailbox, shutdown) = control(dir.path());
    let (client, server) = tokio::io::duplex(64 * 1024);
    let connection = tokio::spawn(handle_connection(server, mailbox, control.snapshot(), shutdown.subscribe()));

    let (reader, mut writer) = tokio::io::split(client);
    writer.write_all(b"status\n").await.unwrap();
    let mut lines = BufReader::new(reader).lines();
    let reply = lines.next_line().await.unwrap().unwrap();
    let status: serde_json::Value = serde_json::from_str(&reply).unwrap();
    assert_eq!(status["mode"], "stop");
    assert_eq!(status["handler_state"], "idle");
    assert_eq!(status["apa"]["name"], "APA-T");
    assert_eq!(status["queue"]["capacity"], 4);
    assert!(status["recipe"].is_null());

    drop(writer);
    drop(lines);
    connection.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_closed_mailbox_reports_unavailable() {
    let dir = tempdir().unwrap();
    let (control, mailbox, shutdown) = control(dir.path());
    let snapshot = control.snapshot();
    drop(control);

    let stream = tokio_test::io::Builder::new()
        .read(b"start\n")
        .write(b"error machine unavailable\n")
        .build();
    handle_connection(stream, mailbox, snapshot, shutdown.subscribe()).await.unwrap();
}

#[tokio::test]
async fn test_tcp_clients_share_the_machine() {
    let dir = tempdir().unwrap();
    let (mut control, mailbox, shutdown) = control(dir.path());
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let address = listener.local_addr().unwrap();
    let server = tokio::spawn(UiServer::new(listener, mailbox, control.snapshot()).run(shutdown.subscribe()));

    let client = tokio::spawn(async move {
        let stream = TcpStream::connect(address).await.unwrap();
        let (reader, mut writer) = stream.into_split();
        let mut lines = BufReader::new(reader).lines();
        let mut replies = Vec::new();
        for command in ["load ten.gc", "calibrate F2", "shutdown", "start"] {
            writer.write_all(format!("{}\n", command).as_bytes()).await.unwrap();
            replies.push(lines.next_line().await.unwrap().unwrap());
        }
        replies
    });
    let replies = serve_until(&mut control, client).await;
    assert_eq!(replies, vec!["ok X 10 lines", "ok", "ok shutting down", "error shutting down"]);
    assert!(control.machine().shutdown_requested());

    shutdown.send(()).unwrap();
    tokio::time::timeout(Duration::from_secs(1), server).await.unwrap().unwrap();
}

#[tokio::test]
async fn test_unsaveable_load_replies_and_ends_the_loop() {
    let dir = tempdir().unwrap();
    let (mut control, mailbox, _shutdown) = control(dir.path());
    let apa_dir = FileManager::new(dir.path()).apa_path("APA-T").parent().unwrap().to_path_buf();
    if apa_dir.exists() {
        fs::remove_dir_all(&apa_dir).unwrap();
    }
    fs::write(&apa_dir, b"").unwrap();

    let (request, reply) = MachineRequest::new(UiCommand::Load { recipe: "ten.gc".to_string(), line: None });
    mailbox.send(request).await.unwrap();
    assert!(control.tick().await.is_err());
    let reply = reply.await.unwrap();
    assert!(reply.starts_with("error Persistence error"), "{}", reply);
}
