mod common;

use std::{
    io::{Read, Write},
    sync::{atomic::Ordering, Arc},
    thread,
    time::Duration,
};

use pylon::{CloseReason, ServiceHandler, Work, WorkAllocator};

use common::*;

#[test]
fn idle_connection_times_out() {
    let stats = Arc::new(Stats::default());
    let server = pylon::Builder::new()
        .bind("127.0.0.1:18082")
        .unwrap()
        .preallocated_handler_count(2)
        .timeout_secs(2)
        .build(EchoAlloc(stats.clone()))
        .unwrap();
    let (server, handle, join) = spawn_server(server);

    let mut client = connect_retry("127.0.0.1:18082");
    client
        .set_read_timeout(Some(Duration::from_secs(6)))
        .unwrap();

    // Send nothing; the server must drop us with a timeout close.
    let mut buf = [0u8; 1];
    let n = client.read(&mut buf).unwrap_or(0);
    assert_eq!(n, 0);

    assert!(wait_until(Duration::from_secs(2), || stats.timeouts() == 1));
    assert_eq!(stats.closed(), 1);

    handle.stop(true);
    join.join().unwrap().unwrap();
    assert_eq!(server.load(), 0);
}

#[test]
fn zero_timeout_disables_timer() {
    let stats = Arc::new(Stats::default());
    let server = pylon::Builder::new()
        .bind("127.0.0.1:18083")
        .unwrap()
        .preallocated_handler_count(2)
        .timeout_secs(0)
        .build(EchoAlloc(stats.clone()))
        .unwrap();
    let (_server, handle, join) = spawn_server(server);

    let mut client = connect_retry("127.0.0.1:18083");
    thread::sleep(Duration::from_millis(1500));

    // Still alive and serving after sitting idle.
    client.write_all(b"Z").unwrap();
    let mut byte = [0u8; 1];
    client.read_exact(&mut byte).unwrap();
    assert_eq!(&byte, b"Z");
    assert_eq!(stats.timeouts(), 0);
    assert_eq!(stats.closed(), 0);

    drop(client);
    handle.stop(true);
    join.join().unwrap().unwrap();
}

#[test]
fn exhausted_pool_refuses_but_keeps_serving() {
    let stats = Arc::new(Stats::default());
    let server = pylon::Builder::new()
        .bind("127.0.0.1:18084")
        .unwrap()
        .preallocated_handler_count(2)
        .build(EchoAlloc(stats.clone()))
        .unwrap();
    let (server, handle, join) = spawn_server(server);

    let mut first = connect_retry("127.0.0.1:18084");
    let mut second = connect_retry("127.0.0.1:18084");
    let mut byte = [0u8; 1];

    // Occupy both handlers and prove they work.
    first.write_all(b"1").unwrap();
    first.read_exact(&mut byte).unwrap();
    second.write_all(b"2").unwrap();
    second.read_exact(&mut byte).unwrap();
    assert_eq!(server.load(), 2);

    // Third connection is accepted by the kernel but refused by the pool.
    let mut third = connect_retry("127.0.0.1:18084");
    third
        .set_read_timeout(Some(Duration::from_secs(3)))
        .unwrap();
    let refused = match third.read(&mut byte) {
        Ok(0) => true,
        Ok(_) => false,
        Err(_) => true,
    };
    assert!(refused);

    // The occupied handlers are unaffected.
    first.write_all(b"3").unwrap();
    first.read_exact(&mut byte).unwrap();
    assert_eq!(&byte, b"3");
    second.write_all(b"4").unwrap();
    second.read_exact(&mut byte).unwrap();
    assert_eq!(&byte, b"4");
    assert_eq!(stats.opened(), 2);

    drop(first);
    drop(second);
    handle.stop(true);
    join.join().unwrap().unwrap();
}

#[test]
fn graceful_stop_under_load_closes_everything() {
    let stats = Arc::new(Stats::default());
    let server = pylon::Builder::new()
        .bind("127.0.0.1:18085")
        .unwrap()
        .preallocated_handler_count(4)
        .read_buffer_size(4096)
        .build(EchoAlloc(stats.clone()))
        .unwrap();
    let (server, handle, join) = spawn_server(server);

    // Two clients pumping bulk data until their sockets die.
    let pumps: Vec<_> = (0..2)
        .map(|_| {
            let mut stream = connect_retry("127.0.0.1:18085");
            let mut reader = stream.try_clone().unwrap();
            let read_side = thread::spawn(move || {
                let mut sink = [0u8; 4096];
                while let Ok(n) = reader.read(&mut sink) {
                    if n == 0 {
                        break;
                    }
                }
            });
            let write_side = thread::spawn(move || {
                let chunk = [42u8; 4096];
                while stream.write_all(&chunk).is_ok() {}
            });
            (read_side, write_side)
        })
        .collect();

    assert!(wait_until(Duration::from_secs(3), || stats.opened() == 2));
    thread::sleep(Duration::from_millis(200));

    handle.stop(true);
    join.join().unwrap().unwrap();

    // Every connection observed on_close and recycled.
    assert_eq!(stats.closed(), stats.opened());
    assert_eq!(server.load(), 0);
    assert!(server.is_idle());

    for (read_side, write_side) in pumps {
        read_side.join().unwrap();
        write_side.join().unwrap();
    }
}

struct CloseSpamWork {
    stats: Arc<Stats>,
}

impl Work for CloseSpamWork {
    type Transport = tokio::net::TcpStream;

    fn on_open(&mut self, handler: &Arc<ServiceHandler<Self>>) {
        self.stats.opened.fetch_add(1, Ordering::SeqCst);
        handler.async_read_some();
    }

    fn on_read(&mut self, handler: &Arc<ServiceHandler<Self>>, _n: usize) {
        // Close is idempotent; only one on_close may result.
        handler.close();
        handler.close();
        handler.close_with(CloseReason::Timeout);
    }

    fn on_write(&mut self, _: &Arc<ServiceHandler<Self>>, _: usize) {}

    fn on_close(&mut self, _: &Arc<ServiceHandler<Self>>, reason: &CloseReason) {
        self.stats.record_close(reason);
    }
}

struct CloseSpamAlloc(Arc<Stats>);

impl WorkAllocator for CloseSpamAlloc {
    type Work = CloseSpamWork;

    fn allocate(&self) -> CloseSpamWork {
        CloseSpamWork {
            stats: self.0.clone(),
        }
    }
}

#[test]
fn close_is_idempotent() {
    let stats = Arc::new(Stats::default());
    let server = pylon::Builder::new()
        .bind("127.0.0.1:18086")
        .unwrap()
        .preallocated_handler_count(2)
        .build(CloseSpamAlloc(stats.clone()))
        .unwrap();
    let (_server, handle, join) = spawn_server(server);

    let mut client = connect_retry("127.0.0.1:18086");
    client.write_all(b"X").unwrap();

    assert!(wait_until(Duration::from_secs(3), || stats.closed() == 1));
    thread::sleep(Duration::from_millis(300));
    assert_eq!(stats.closed(), 1);
    // First close wins: the spammed Timeout reason arrived second.
    assert_eq!(stats.timeouts(), 0);

    handle.stop(true);
    join.join().unwrap().unwrap();
}

#[test]
fn open_close_recycle_balance() {
    let stats = Arc::new(Stats::default());
    let server = pylon::Builder::new()
        .bind("127.0.0.1:18087")
        .unwrap()
        .preallocated_handler_count(2)
        .build(EchoAlloc(stats.clone()))
        .unwrap();
    let (server, handle, join) = spawn_server(server);

    // More sequential connections than pool capacity forces recycling.
    for i in 0..5 {
        let mut client = connect_retry("127.0.0.1:18087");
        client.write_all(b"R").unwrap();
        let mut byte = [0u8; 1];
        client.read_exact(&mut byte).unwrap();
        drop(client);
        assert!(wait_until(Duration::from_secs(3), || stats.closed() == i + 1));
    }

    assert_eq!(stats.opened(), 5);
    assert_eq!(stats.closed(), 5);
    assert_eq!(server.load(), 0);

    handle.stop(true);
    join.join().unwrap().unwrap();
    assert!(server.is_idle());
}

struct PanicWork {
    stats: Arc<Stats>,
}

impl Work for PanicWork {
    type Transport = tokio::net::TcpStream;

    fn on_open(&mut self, handler: &Arc<ServiceHandler<Self>>) {
        self.stats.opened.fetch_add(1, Ordering::SeqCst);
        handler.async_read_some();
    }

    fn on_read(&mut self, _: &Arc<ServiceHandler<Self>>, _: usize) {
        panic!("defective work object");
    }

    fn on_write(&mut self, _: &Arc<ServiceHandler<Self>>, _: usize) {}

    fn on_close(&mut self, _: &Arc<ServiceHandler<Self>>, reason: &CloseReason) {
        self.stats.record_close(reason);
    }
}

struct PanicAlloc(Arc<Stats>);

impl WorkAllocator for PanicAlloc {
    type Work = PanicWork;

    fn allocate(&self) -> PanicWork {
        PanicWork {
            stats: self.0.clone(),
        }
    }
}

#[test]
fn callback_panic_closes_only_its_handler() {
    let stats = Arc::new(Stats::default());
    let server = pylon::Builder::new()
        .bind("127.0.0.1:18088")
        .unwrap()
        .preallocated_handler_count(2)
        .build(PanicAlloc(stats.clone()))
        .unwrap();
    let (server, handle, join) = spawn_server(server);

    let mut client = connect_retry("127.0.0.1:18088");
    client.write_all(b"X").unwrap();
    assert!(wait_until(Duration::from_secs(3), || stats.closed() == 1));

    // The executor survived the panic and keeps serving.
    let mut again = connect_retry("127.0.0.1:18088");
    again.write_all(b"Y").unwrap();
    assert!(wait_until(Duration::from_secs(3), || stats.closed() == 2));
    assert_eq!(stats.opened(), 2);

    drop(again);
    handle.stop(true);
    join.join().unwrap().unwrap();
    assert_eq!(server.load(), 0);
}
