use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, mpsc};
use std::thread;
use std::time::{Duration, Instant};

use sockline::{ErrorKind, TcpClient, UdpEndpoint};

const WAIT: Duration = Duration::from_secs(5);

#[test]
fn test_concurrent_reports_are_all_delivered() {
  let client = Arc::new(TcpClient::new().unwrap());
  let delivered = Arc::new(AtomicUsize::new(0));
  let counter = Arc::clone(&delivered);
  client.set_error_callback(move |err, _, _, op| {
    assert_eq!(err.kind(), ErrorKind::SocketState);
    assert_eq!(op, "send");
    counter.fetch_add(1, Ordering::SeqCst);
  });

  let workers: Vec<_> = (0..10)
    .map(|_| {
      let client = Arc::clone(&client);
      thread::spawn(move || {
        for _ in 0..100 {
          assert_eq!(client.send(b"x", false).unwrap(), 0);
        }
      })
    })
    .collect();
  for worker in workers {
    worker.join().unwrap();
  }

  let deadline = Instant::now() + WAIT;
  while delivered.load(Ordering::SeqCst) < 1000 && Instant::now() < deadline {
    thread::sleep(Duration::from_millis(5));
  }
  assert_eq!(delivered.load(Ordering::SeqCst), 1000);
}

#[test]
fn test_slow_callback_does_not_block_callers() {
  let endpoint = UdpEndpoint::new().unwrap();
  let (tx, rx) = mpsc::channel();
  endpoint.set_error_callback(move |err, _, _, _| {
    thread::sleep(Duration::from_millis(200));
    let _ = tx.send(err.kind());
  });

  let start = Instant::now();
  for _ in 0..5 {
    assert!(!endpoint.stop_listening(WAIT).unwrap());
  }
  assert!(start.elapsed() < Duration::from_millis(200));

  for _ in 0..5 {
    assert_eq!(rx.recv_timeout(WAIT).unwrap(), ErrorKind::SocketState);
  }
}

#[test]
fn test_without_callback_errors_are_returned() {
  let client = TcpClient::new().unwrap();
  for _ in 0..10 {
    let err = client.send(b"x", false).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::SocketState);
    assert!(!err.message().is_empty());
  }
}
