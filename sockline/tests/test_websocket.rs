use std::io::{Read, Write};
use std::net::TcpStream;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, mpsc};
use std::thread;
use std::time::{Duration, Instant};

use sockline::{ErrorKind, IpAddress, SocketConfig, WebSocketClient, WebSocketServer};

const WAIT: Duration = Duration::from_secs(5);

fn init_tracing() {
  let _ = tracing_subscriber::fmt()
    .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
    .with_test_writer()
    .try_init();
}

const UPGRADE: &[u8] = b"GET / HTTP/1.1\r\n\
  Host: 127.0.0.1\r\n\
  Upgrade: websocket\r\n\
  Connection: Upgrade\r\n\
  Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\n\
  Sec-WebSocket-Version: 13\r\n\r\n";

/// Completes the upgrade by hand and returns the raw stream.
fn upgraded_stream(port: u16) -> TcpStream {
  let mut stream = TcpStream::connect(("127.0.0.1", port)).unwrap();
  stream.set_read_timeout(Some(WAIT)).unwrap();
  stream.write_all(UPGRADE).unwrap();

  let mut head = Vec::new();
  let mut byte = [0u8; 1];
  while !head.ends_with(b"\r\n\r\n") {
    stream.read_exact(&mut byte).unwrap();
    head.push(byte[0]);
  }
  assert!(head.starts_with(b"HTTP/1.1 101"), "{}", String::from_utf8_lossy(&head));
  stream
}

fn client_for(port: u16) -> WebSocketClient {
  let client = WebSocketClient::new().unwrap();
  assert!(client.is_websocket());
  client.set_server_addr(IpAddress::localhost(false)).unwrap();
  client.set_server_port(port).unwrap();
  client
}

#[test]
fn test_messages_round_trip() {
  init_tracing();
  let server = WebSocketServer::new().unwrap();
  let (srv_tx, srv_rx) = mpsc::channel();
  server.set_getting_callback(move |handle, data| {
    let _ = srv_tx.send((handle, data.to_vec()));
  });
  assert!(server.start(0, false).unwrap());
  assert!(server.is_websocket());
  let port = server.local_port().unwrap();

  let client = client_for(port);
  let (cli_tx, cli_rx) = mpsc::channel();
  client.set_getting_callback(move |data| {
    let _ = cli_tx.send(data.to_vec());
  });
  assert!(client.connect_server(0, false, |connected| connected).unwrap());

  assert_eq!(client.send(b"hello", false).unwrap(), 5);
  let (handle, data) = srv_rx.recv_timeout(WAIT).unwrap();
  assert_eq!(data, b"hello");

  // Messages arrive whole no matter how the stream splits them.
  let big: Vec<u8> = (0..60_000).map(|i| (i % 251) as u8).collect();
  assert_eq!(client.send(&big, true).unwrap(), 0);
  let (_, data) = srv_rx.recv_timeout(WAIT).unwrap();
  assert_eq!(data, big);

  assert_eq!(server.send(handle, b"world", false).unwrap(), 5);
  assert_eq!(cli_rx.recv_timeout(WAIT).unwrap(), b"world");
  assert_eq!(server.send(handle, b"again", true).unwrap(), 0);
  assert_eq!(cli_rx.recv_timeout(WAIT).unwrap(), b"again");

  assert!(client.disconnect_server(WAIT).unwrap());
  assert!(server.stop(WAIT).unwrap());
}

#[test]
fn test_async_connect_completes_handshake() {
  init_tracing();
  let server = WebSocketServer::new().unwrap();
  let (connected_tx, connected_rx) = mpsc::channel();
  server.set_connect_callback(move |handle| {
    let _ = connected_tx.send(handle);
    true
  });
  assert!(server.start(0, false).unwrap());

  let client = client_for(server.local_port().unwrap());
  let (tx, rx) = mpsc::channel();
  assert!(client.connect_server(0, true, move |connected| {
    let _ = tx.send(connected);
    true
  }).unwrap());
  assert!(rx.recv_timeout(WAIT).unwrap());
  assert_eq!(connected_rx.recv_timeout(WAIT).unwrap(), 0);
  assert!(client.is_connected());
}

#[test]
fn test_plain_http_is_rejected() {
  init_tracing();
  let server = WebSocketServer::new().unwrap();
  let connects = Arc::new(AtomicUsize::new(0));
  let counter = Arc::clone(&connects);
  server.set_connect_callback(move |_| {
    counter.fetch_add(1, Ordering::SeqCst);
    true
  });
  server.set_error_callback(|_, _, _, _| {});
  assert!(server.start(0, false).unwrap());
  let port = server.local_port().unwrap();

  let mut stream = TcpStream::connect(("127.0.0.1", port)).unwrap();
  stream.set_read_timeout(Some(WAIT)).unwrap();
  stream.write_all(b"GET / HTTP/1.1\r\nHost: localhost\r\n\r\n").unwrap();

  let mut response = Vec::new();
  let _ = stream.read_to_end(&mut response);
  let response = String::from_utf8_lossy(&response);
  assert!(response.starts_with("HTTP/1.1 400"), "unexpected response: {response}");

  thread::sleep(Duration::from_millis(50));
  assert_eq!(connects.load(Ordering::SeqCst), 0);
  assert_eq!(server.connection_count(), 0);
}

#[test]
fn test_given_up_client_receives_close() {
  init_tracing();
  let server = WebSocketServer::new().unwrap();
  let (tx, rx) = mpsc::channel();
  server.set_connect_callback(move |handle| {
    let _ = tx.send(handle);
    true
  });
  assert!(server.start(0, false).unwrap());

  let client = client_for(server.local_port().unwrap());
  let (lost_tx, lost_rx) = mpsc::channel();
  client.set_lost_callback(move || {
    let _ = lost_tx.send(());
  });
  client.set_error_callback(|_, _, _, _| {});
  assert!(client.connect_server(0, false, |connected| connected).unwrap());

  let handle = rx.recv_timeout(WAIT).unwrap();
  assert!(server.give_up_client(handle));
  lost_rx.recv_timeout(WAIT).unwrap();
  assert_eq!(server.connection_count(), 0);
}

#[test]
fn test_peer_that_stops_reading_does_not_stall_the_server() {
  init_tracing();
  let config = SocketConfig::default().with_send_buffer_size(64 * 1024);
  let server = WebSocketServer::with_config(config).unwrap();
  let (tx, rx) = mpsc::channel();
  server.set_connect_callback(move |handle| {
    let _ = tx.send(handle);
    true
  });
  server.set_error_callback(|_, _, _, _| {});
  assert!(server.start(0, false).unwrap());
  let port = server.local_port().unwrap();

  let _stalled = upgraded_stream(port);
  let handle = rx.recv_timeout(WAIT).unwrap();
  let bulk = vec![7u8; 32 * 1024 * 1024];
  assert_eq!(server.send(handle, &bulk, true).unwrap(), 0);

  let client = client_for(port);
  client.set_error_callback(|_, _, _, _| {});
  let (connected_tx, connected_rx) = mpsc::channel();
  assert!(client.connect_server(0, true, move |connected| {
    let _ = connected_tx.send(connected);
    true
  }).unwrap());
  assert!(connected_rx.recv_timeout(Duration::from_secs(3)).unwrap());
  assert_eq!(rx.recv_timeout(WAIT).unwrap(), 1);

  let start = Instant::now();
  assert!(server.stop(Duration::from_secs(1)).unwrap());
  assert!(start.elapsed() < Duration::from_secs(4));
}

#[test]
fn test_pending_upgrades_count_against_the_limit() {
  init_tracing();
  let server = WebSocketServer::with_config(SocketConfig::default().with_max_connections(1)).unwrap();
  let (err_tx, err_rx) = mpsc::channel();
  server.set_error_callback(move |err, _, _, op| {
    let _ = err_tx.send((err.kind(), op.to_owned()));
  });
  assert!(server.start(0, false).unwrap());
  let port = server.local_port().unwrap();

  // Connected but silent: holds the only slot while its upgrade is pending.
  let _silent = TcpStream::connect(("127.0.0.1", port)).unwrap();
  thread::sleep(Duration::from_millis(100));

  let client = client_for(port);
  client.set_error_callback(|_, _, _, _| {});
  assert!(!client.connect_server(0, false, |connected| connected).unwrap());

  let (kind, op) = err_rx.recv_timeout(WAIT).unwrap();
  assert_eq!(kind, ErrorKind::SocketState);
  assert_eq!(op, "accept");
  assert_eq!(server.connection_count(), 0);
}

#[test]
fn test_unfinished_upgrade_times_out() {
  init_tracing();
  let config = SocketConfig::default()
    .with_max_connections(1)
    .with_handshake_timeout(Duration::from_millis(200));
  let server = WebSocketServer::with_config(config).unwrap();
  let (err_tx, err_rx) = mpsc::channel();
  server.set_error_callback(move |_, _, _, op| {
    let _ = err_tx.send(op.to_owned());
  });
  assert!(server.start(0, false).unwrap());
  let port = server.local_port().unwrap();

  let mut stuck = TcpStream::connect(("127.0.0.1", port)).unwrap();
  stuck.set_read_timeout(Some(WAIT)).unwrap();
  stuck.write_all(b"GET / HTTP/1.1\r\nHost: 127.0.0.1\r\n").unwrap();

  let start = Instant::now();
  let mut buf = [0u8; 64];
  assert!(stuck.read(&mut buf).map_or(true, |n| n == 0));
  assert!(start.elapsed() < Duration::from_secs(3));
  assert_eq!(err_rx.recv_timeout(WAIT).unwrap(), "handshake");

  // The slot is free again.
  let client = client_for(port);
  assert!(client.connect_server(0, false, |connected| connected).unwrap());
  assert!(client.disconnect_server(WAIT).unwrap());
}
