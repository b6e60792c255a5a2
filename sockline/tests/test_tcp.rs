use std::net::TcpListener;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, mpsc};
use std::thread;
use std::time::{Duration, Instant};

use sockline::{ErrorKind, Handle, IpAddress, SocketConfig, TcpClient, TcpServer};

const WAIT: Duration = Duration::from_secs(5);

fn init_tracing() {
  let _ = tracing_subscriber::fmt()
    .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
    .with_test_writer()
    .try_init();
}

fn wait_until(mut cond: impl FnMut() -> bool) -> bool {
  let deadline = Instant::now() + WAIT;
  while Instant::now() < deadline {
    if cond() {
      return true;
    }
    thread::sleep(Duration::from_millis(5));
  }
  cond()
}

/// Reads chunks off `rx` until `len` bytes arrived.
fn collect(rx: &mpsc::Receiver<Vec<u8>>, len: usize) -> Vec<u8> {
  let mut out = Vec::new();
  while out.len() < len {
    out.extend(rx.recv_timeout(WAIT).expect("timed out waiting for data"));
  }
  out
}

fn start_server(server: &TcpServer, ipv6: bool) -> u16 {
  assert!(server.start(0, ipv6).unwrap());
  assert!(server.is_listening());
  server.local_port().unwrap()
}

fn client_for(port: u16, ipv6: bool) -> TcpClient {
  let client = TcpClient::new().unwrap();
  assert!(client.set_server_addr(IpAddress::localhost(ipv6)).unwrap());
  assert!(client.set_server_port(port).unwrap());
  client
}

fn ipv6_available() -> bool {
  TcpListener::bind("[::1]:0").is_ok()
}

fn hello_world(ipv6: bool) {
  init_tracing();
  if ipv6 && !ipv6_available() {
    return;
  }

  let server = TcpServer::new().unwrap();
  let (srv_tx, srv_rx) = mpsc::channel();
  server.set_getting_callback(move |handle, data| {
    let _ = srv_tx.send((handle, data.to_vec()));
  });
  let port = start_server(&server, ipv6);

  let client = client_for(port, ipv6);
  let (cli_tx, cli_rx) = mpsc::channel();
  client.set_getting_callback(move |data| {
    let _ = cli_tx.send(data.to_vec());
  });
  assert!(client.connect_server(0, false, |connected| connected).unwrap());
  assert!(client.is_connected());
  assert!(client.local_port().is_some());

  assert_eq!(client.send(b"hello", true).unwrap(), 0);

  let mut received = Vec::new();
  let mut handle = 0;
  while received.len() < 5 {
    let (h, data) = srv_rx.recv_timeout(WAIT).unwrap();
    handle = h;
    received.extend(data);
  }
  assert_eq!(received, b"hello");

  let info = server.client_info(handle).unwrap();
  assert_eq!(info.peer_port, client.local_port().unwrap());
  assert_eq!(server.handle_of(&info.peer_addr, info.peer_port), Some(handle));

  assert_eq!(server.send(handle, b"world", false).unwrap(), 5);
  assert_eq!(collect(&cli_rx, 5), b"world");

  assert!(client.disconnect_server(WAIT).unwrap());
  assert!(!client.is_connected());
  assert!(server.stop(WAIT).unwrap());
  assert!(!server.is_listening());
}

macro_rules! hello_world_tests {
  ($($family:ident => $ipv6:expr),* $(,)?) => {
    pastey::paste! {
      $(
        #[test]
        fn [<test_hello_world_ $family>]() {
          hello_world($ipv6);
        }
      )*
    }
  };
}

hello_world_tests!(ipv4 => false, ipv6 => true);

#[test]
fn test_rejected_connection_gets_no_data() {
  init_tracing();
  let server = TcpServer::new().unwrap();
  let gettings = Arc::new(AtomicUsize::new(0));
  let (tx, rx) = mpsc::channel();

  server.set_connect_callback(move |handle| {
    let _ = tx.send(handle);
    false
  });
  let counter = Arc::clone(&gettings);
  server.set_getting_callback(move |_, _| {
    counter.fetch_add(1, Ordering::SeqCst);
  });
  let port = start_server(&server, false);

  let client = client_for(port, false);
  client.set_error_callback(|_, _, _, _| {});
  assert!(client.connect_server(0, false, |connected| connected).unwrap());
  let _ = client.send(b"ignored", false);

  let handle = rx.recv_timeout(WAIT).unwrap();
  assert!(wait_until(|| server.client_info(handle).is_none()));
  thread::sleep(Duration::from_millis(100));
  assert_eq!(gettings.load(Ordering::SeqCst), 0);
  assert!(server.all_clients().is_empty());
  assert_eq!(server.connection_count(), 0);
}

#[test]
fn test_handles_are_reused() {
  init_tracing();
  let server = TcpServer::new().unwrap();
  let (tx, rx) = mpsc::channel();
  server.set_connect_callback(move |handle| {
    let _ = tx.send(handle);
    true
  });
  let port = start_server(&server, false);

  let mut clients = Vec::new();
  let mut connect = || -> Handle {
    let client = client_for(port, false);
    client.set_error_callback(|_, _, _, _| {});
    assert!(client.connect_server(0, false, |connected| connected).unwrap());
    clients.push(client);
    rx.recv_timeout(WAIT).unwrap()
  };

  assert_eq!(connect(), 0);
  assert_eq!(connect(), 1);
  assert_eq!(connect(), 2);

  assert!(server.give_up_client(1));
  assert!(!server.give_up_client(1));
  assert_eq!(connect(), 1);
  assert_eq!(connect(), 3);
  assert_eq!(server.connection_count(), 4);

  let handles: Vec<Handle> = server.all_clients().into_iter().map(|(h, _)| h).collect();
  assert_eq!(handles, vec![0, 1, 2, 3]);

  assert!(server.give_up_all_clients());
  assert_eq!(server.connection_count(), 0);
}

#[test]
fn test_peer_disconnect_calls_lost() {
  init_tracing();
  let server = TcpServer::new().unwrap();
  let (connected_tx, connected_rx) = mpsc::channel();
  let (lost_tx, lost_rx) = mpsc::channel();
  server.set_connect_callback(move |handle| {
    let _ = connected_tx.send(handle);
    true
  });
  server.set_lost_callback(move |handle| {
    let _ = lost_tx.send(handle);
  });
  server.set_error_callback(|_, _, _, _| {});
  let port = start_server(&server, false);

  let client = client_for(port, false);
  assert!(client.connect_server(0, false, |connected| connected).unwrap());
  let handle = connected_rx.recv_timeout(WAIT).unwrap();

  assert!(client.disconnect_server(WAIT).unwrap());
  assert_eq!(lost_rx.recv_timeout(WAIT).unwrap(), handle);
  assert!(wait_until(|| server.connection_count() == 0));
}

#[test]
fn test_given_up_client_sees_lost() {
  init_tracing();
  let server = TcpServer::new().unwrap();
  let (tx, rx) = mpsc::channel();
  server.set_connect_callback(move |handle| {
    let _ = tx.send(handle);
    true
  });
  let server_lost = Arc::new(AtomicUsize::new(0));
  let counter = Arc::clone(&server_lost);
  server.set_lost_callback(move |_| {
    counter.fetch_add(1, Ordering::SeqCst);
  });
  let port = start_server(&server, false);

  let client = client_for(port, false);
  let (lost_tx, lost_rx) = mpsc::channel();
  client.set_lost_callback(move || {
    let _ = lost_tx.send(());
  });
  assert!(client.connect_server(0, false, |connected| connected).unwrap());
  let handle = rx.recv_timeout(WAIT).unwrap();

  assert!(server.give_up_client(handle));
  lost_rx.recv_timeout(WAIT).unwrap();
  assert!(wait_until(|| !client.is_connected()));
  assert_eq!(server_lost.load(Ordering::SeqCst), 0);

  let err = client.send(b"late", false).unwrap_err();
  assert_eq!(err.kind(), ErrorKind::SocketState);
}

#[test]
fn test_async_connect_reports_outcome() {
  init_tracing();
  let server = TcpServer::new().unwrap();
  let port = start_server(&server, false);

  let client = client_for(port, false);
  let (tx, rx) = mpsc::channel();
  assert!(client.connect_server(0, true, move |connected| {
    let _ = tx.send(connected);
    true
  }).unwrap());
  assert!(rx.recv_timeout(WAIT).unwrap());
  assert!(wait_until(|| client.is_connected()));
  assert!(client.disconnect_server(WAIT).unwrap());

  let closed_port = {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap().port()
  };
  let refused = client_for(closed_port, false);
  let (err_tx, err_rx) = mpsc::channel();
  refused.set_error_callback(move |err, _, _, op| {
    let _ = err_tx.send((err.kind(), op.to_owned()));
  });
  let (tx, rx) = mpsc::channel();
  assert!(refused.connect_server(0, true, move |connected| {
    let _ = tx.send(connected);
    true
  }).unwrap());
  assert!(!rx.recv_timeout(WAIT).unwrap());
  let (kind, op) = err_rx.recv_timeout(WAIT).unwrap();
  assert_eq!(kind, ErrorKind::System);
  assert_eq!(op, "connect");
  assert!(!refused.is_connected());
}

#[test]
fn test_connect_callback_can_decline() {
  init_tracing();
  let server = TcpServer::new().unwrap();
  let port = start_server(&server, false);

  let client = client_for(port, false);
  assert!(!client.connect_server(0, false, |_| false).unwrap());
  assert!(!client.is_connected());
  assert!(client.connect_server(0, false, |connected| connected).unwrap());
  assert!(client.is_connected());
}

#[test]
fn test_state_errors() {
  init_tracing();
  let server = TcpServer::new().unwrap();
  start_server(&server, false);
  let err = server.start(0, false).unwrap_err();
  assert_eq!(err.kind(), ErrorKind::SocketState);
  assert!(!server.set_max_connections(10));
  assert!(!server.set_max_buffer_len(10));

  assert!(server.stop(WAIT).unwrap());
  assert_eq!(server.stop(WAIT).unwrap_err().kind(), ErrorKind::SocketState);
  assert!(server.set_max_connections(10));

  let client = TcpClient::new().unwrap();
  let err = client.send(b"x", false).unwrap_err();
  assert_eq!(err.kind(), ErrorKind::SocketState);
  let err = client.send(b"", false).unwrap_err();
  assert_eq!(err.kind(), ErrorKind::InvalidArgument);
  let err = client.connect_server(0, false, |ok| ok).unwrap_err();
  assert_eq!(err.kind(), ErrorKind::InvalidArgument);
  assert!(!client.set_server_port(0).unwrap());
  assert_eq!(client.disconnect_server(WAIT).unwrap_err().kind(), ErrorKind::SocketState);

  let (tx, rx) = mpsc::channel();
  client.set_error_callback(move |err, _, _, op| {
    let _ = tx.send((err.kind(), op.to_owned()));
  });
  assert_eq!(client.send(b"x", false).unwrap(), 0);
  assert_eq!(rx.recv_timeout(WAIT).unwrap(), (ErrorKind::SocketState, "send".to_owned()));
}

#[test]
fn test_connections_beyond_max_are_dropped() {
  init_tracing();
  let server = TcpServer::new().unwrap();
  assert!(server.set_max_connections(1));
  let (err_tx, err_rx) = mpsc::channel();
  server.set_error_callback(move |err, _, _, op| {
    let _ = err_tx.send((err.kind(), op.to_owned()));
  });
  let port = start_server(&server, false);

  let first = client_for(port, false);
  assert!(first.connect_server(0, false, |ok| ok).unwrap());
  assert!(wait_until(|| server.connection_count() == 1));

  let second = client_for(port, false);
  second.set_error_callback(|_, _, _, _| {});
  let (lost_tx, lost_rx) = mpsc::channel();
  second.set_lost_callback(move || {
    let _ = lost_tx.send(());
  });
  assert!(second.connect_server(0, false, |ok| ok).unwrap());

  let (kind, op) = err_rx.recv_timeout(WAIT).unwrap();
  assert_eq!(kind, ErrorKind::SocketState);
  assert_eq!(op, "accept");
  lost_rx.recv_timeout(WAIT).unwrap();
  assert_eq!(server.connection_count(), 1);
}

struct Progress {
  calls: Mutex<Vec<(usize, u32, usize)>>,
}

impl Progress {
  fn sent(&self) -> usize {
    self.calls.lock().unwrap().iter().map(|&(sent, _, _)| sent).sum()
  }
}

fn throttled_pair(keep_going: bool) -> (TcpServer, TcpClient, Arc<AtomicUsize>, Arc<Progress>) {
  init_tracing();
  let server = TcpServer::with_config(SocketConfig::default().with_recv_buffer_size(4096)).unwrap();
  let received = Arc::new(AtomicUsize::new(0));
  let counter = Arc::clone(&received);
  server.set_getting_callback(move |_, data| {
    counter.fetch_add(data.len(), Ordering::SeqCst);
  });
  let port = start_server(&server, false);

  let config = SocketConfig::default().with_send_buffer_size(4096);
  let client = TcpClient::with_config(config).unwrap();
  client.set_server_addr(IpAddress::localhost(false)).unwrap();
  client.set_server_port(port).unwrap();

  let progress = Arc::new(Progress { calls: Mutex::new(Vec::new()) });
  let recorder = Arc::clone(&progress);
  client.set_sending_callback(move |p| {
    recorder.calls.lock().unwrap().push((p.sent, p.retry, p.full_len()));
    keep_going
  });
  assert!(client.connect_server(0, false, |ok| ok).unwrap());
  (server, client, received, progress)
}

#[test]
fn test_async_send_retries_partial_writes() {
  let (_server, client, received, progress) = throttled_pair(true);
  let payload: Vec<u8> = (0..4 * 1024 * 1024).map(|_| fastrand::u8(..)).collect();
  let total = payload.len();

  assert_eq!(client.send(&payload, true).unwrap(), 0);
  assert!(wait_until(|| received.load(Ordering::SeqCst) == total));
  assert!(wait_until(|| progress.sent() == total));

  let calls = progress.calls.lock().unwrap();
  assert!(calls.len() > 1, "expected partial writes, got {calls:?}");
  assert!(calls.iter().all(|&(sent, _, full)| sent < full && full == total));
  let retries: Vec<u32> = calls.iter().map(|&(_, retry, _)| retry).collect();
  assert_eq!(retries, (0..calls.len() as u32).collect::<Vec<_>>());
}

#[test]
fn test_sending_callback_can_stop_retrying() {
  let (_server, client, received, progress) = throttled_pair(false);
  let payload = vec![7u8; 4 * 1024 * 1024];

  assert_eq!(client.send(&payload, true).unwrap(), 0);
  assert!(wait_until(|| progress.calls.lock().unwrap().len() == 1));
  let first = progress.sent();
  assert!(first < payload.len());
  assert!(wait_until(|| received.load(Ordering::SeqCst) == first));

  thread::sleep(Duration::from_millis(100));
  assert_eq!(progress.calls.lock().unwrap().len(), 1);
  assert_eq!(received.load(Ordering::SeqCst), first);
}

#[test]
fn test_sync_and_async_sends_keep_order() {
  init_tracing();
  let server = TcpServer::with_config(SocketConfig::default().with_recv_buffer_size(4096)).unwrap();
  let (tx, rx) = mpsc::channel();
  server.set_getting_callback(move |_, data| {
    let _ = tx.send(data.to_vec());
  });
  let port = start_server(&server, false);

  let client = TcpClient::with_config(SocketConfig::default().with_send_buffer_size(4096)).unwrap();
  client.set_server_addr(IpAddress::localhost(false)).unwrap();
  client.set_server_port(port).unwrap();
  assert!(client.connect_server(0, false, |ok| ok).unwrap());

  let mut expected = Vec::new();
  for round in 0..4u8 {
    let bulk = vec![b'a' + round; 256 * 1024];
    assert_eq!(client.send(&bulk, true).unwrap(), 0);
    assert_eq!(client.send(&[b'0' + round], false).unwrap(), 1);
    expected.extend(bulk);
    expected.push(b'0' + round);
  }

  assert_eq!(collect(&rx, expected.len()), expected);
}

#[test]
fn test_stop_is_bounded_while_a_callback_runs() {
  init_tracing();
  let server = TcpServer::new().unwrap();
  let (busy_tx, busy_rx) = mpsc::channel();
  server.set_getting_callback(move |_, _| {
    let _ = busy_tx.send(());
    thread::sleep(Duration::from_secs(2));
  });
  let (err_tx, err_rx) = mpsc::channel();
  server.set_error_callback(move |err, _, _, op| {
    let _ = err_tx.send((err.kind(), op.to_owned()));
  });
  let port = start_server(&server, false);

  let client = client_for(port, false);
  client.set_error_callback(|_, _, _, _| {});
  assert!(client.connect_server(0, false, |ok| ok).unwrap());
  assert_eq!(client.send(b"x", false).unwrap(), 1);
  busy_rx.recv_timeout(WAIT).unwrap();

  let start = Instant::now();
  assert!(!server.stop(Duration::from_millis(100)).unwrap());
  assert!(start.elapsed() < Duration::from_secs(1));
  assert!(!server.is_listening());
  assert_eq!(server.connection_count(), 0);

  let (kind, op) = err_rx.recv_timeout(WAIT).unwrap();
  assert_eq!(kind, ErrorKind::SocketState);
  assert_eq!(op, "stop");
}
