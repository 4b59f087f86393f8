use std::cell::Cell;
use std::rc::Rc;
use std::time::Duration;

use rand::RngCore;
use threadlet::net::{TcpListener, TcpStream};
use threadlet::{Buffer, Error, EventLoop};

mod util;
use util::{any_local_address, init, long_timeout};

#[test]
fn echo_round_trip() {
    init();
    let event_loop = EventLoop::new().unwrap();
    let listener = Rc::new(TcpListener::bind(any_local_address(), 8).unwrap());
    let addr = listener.local_addr().unwrap();

    let server = Rc::clone(&listener);
    event_loop.spawn(move || {
        let stream = server.accept(long_timeout()).unwrap();
        let mut buf = stream.recv(false, long_timeout()).unwrap();
        stream
            .send(std::slice::from_mut(&mut buf), long_timeout())
            .unwrap();
    });

    let echoed = Rc::new(Cell::new(false));
    let saw = Rc::clone(&echoed);
    event_loop.spawn(move || {
        let stream = TcpStream::connect(addr, long_timeout()).unwrap();
        let mut msg = Buffer::from_slice(b"ping");
        stream
            .send(std::slice::from_mut(&mut msg), long_timeout())
            .unwrap();
        assert!(msg.is_empty());

        let reply = stream.recv(false, long_timeout()).unwrap();
        assert_eq!(reply.payload(), b"ping");
        assert_eq!(stream.peer_addr().unwrap(), addr);
        saw.set(true);
    });

    event_loop.run().unwrap();
    assert!(echoed.get());
}

#[test]
fn bulk_transfer_survives_partial_writes() {
    init();
    let event_loop = EventLoop::new().unwrap();
    let listener = Rc::new(TcpListener::bind(any_local_address(), 8).unwrap());
    let addr = listener.local_addr().unwrap();

    let mut payload = vec![0u8; 1 << 20];
    rand::rng().fill_bytes(&mut payload);
    let expected = payload.clone();

    let server = Rc::clone(&listener);
    let received = Rc::new(Cell::new(0usize));
    let counted = Rc::clone(&received);
    event_loop.spawn(move || {
        let stream = server.accept(long_timeout()).unwrap();
        let mut collected = Vec::new();
        loop {
            match stream.recv(true, long_timeout()) {
                Ok(buf) => collected.extend_from_slice(buf.payload()),
                Err(Error::Closed) => break,
                Err(err) => panic!("recv failed: {}", err),
            }
        }
        assert_eq!(collected, expected);
        counted.set(collected.len());
    });

    event_loop.spawn(move || {
        let stream = TcpStream::connect(addr, long_timeout()).unwrap();
        // Several buffers in one gather-write loop.
        let mut bufs: Vec<Buffer> = payload
            .chunks(256 * 1024)
            .map(Buffer::from_slice)
            .collect();
        stream.send(&mut bufs, long_timeout()).unwrap();
        for buf in &bufs {
            assert!(buf.is_empty());
        }
        stream.close();
    });

    event_loop.run().unwrap();
    assert_eq!(received.get(), 1 << 20);
}

#[test]
fn connect_to_a_closed_port_is_refused() {
    init();
    let event_loop = EventLoop::new().unwrap();

    // Learn a port that is certainly closed right now.
    let addr = {
        let throwaway = TcpListener::bind(any_local_address(), 1).unwrap();
        let addr = throwaway.local_addr().unwrap();
        throwaway.close();
        addr
    };

    let refused = Rc::new(Cell::new(false));
    let saw = Rc::clone(&refused);
    event_loop.spawn(move || {
        let err = TcpStream::connect(addr, long_timeout()).unwrap_err();
        assert!(matches!(err, Error::ConnectionRefused), "got {}", err);
        saw.set(true);
    });

    event_loop.run().unwrap();
    assert!(refused.get());
}

#[test]
fn accept_times_out() {
    init();
    let event_loop = EventLoop::new().unwrap();
    let listener = Rc::new(TcpListener::bind(any_local_address(), 8).unwrap());

    let timed_out = Rc::new(Cell::new(false));
    let saw = Rc::clone(&timed_out);
    let server = Rc::clone(&listener);
    event_loop.spawn(move || {
        let err = server
            .accept(Some(Duration::from_millis(50)))
            .unwrap_err();
        assert!(matches!(err, Error::Timeout));
        saw.set(true);
    });

    event_loop.run().unwrap();
    assert!(timed_out.get());
}

#[test]
fn closing_the_listener_aborts_a_parked_accept() {
    init();
    let event_loop = EventLoop::new().unwrap();
    let listener = Rc::new(TcpListener::bind(any_local_address(), 8).unwrap());

    let aborted = Rc::new(Cell::new(false));
    let saw = Rc::clone(&aborted);
    let server = Rc::clone(&listener);
    event_loop.spawn(move || {
        // No timeout: only cancellation can end this wait.
        let err = server.accept(None).unwrap_err();
        assert!(matches!(err, Error::Aborted));
        saw.set(true);
    });

    let closer = Rc::clone(&listener);
    event_loop.spawn(move || {
        threadlet::timer::sleep_ms(50).unwrap();
        closer.close();
        // Idempotent: closing again changes nothing.
        closer.close();
    });

    event_loop.run().unwrap();
    assert!(aborted.get());
}

#[test]
fn displaced_waiter_leaves_no_deadline_behind() {
    init();
    let event_loop = EventLoop::new().unwrap();
    let listener = Rc::new(TcpListener::bind(any_local_address(), 8).unwrap());

    // First parker carries a 100ms deadline; the second parker on the same
    // fd evicts it and waits with no deadline at all. The evicted deadline
    // must go with the evicted waiter: the survivor may only end by
    // cancellation, never by inheriting that timeout.
    let first = Rc::new(Cell::new(false));
    let saw_first = Rc::clone(&first);
    let server = Rc::clone(&listener);
    event_loop.spawn(move || {
        let err = server
            .accept(Some(Duration::from_millis(100)))
            .unwrap_err();
        assert!(matches!(err, Error::Aborted), "got {}", err);
        saw_first.set(true);
    });

    let second = Rc::new(Cell::new(false));
    let saw_second = Rc::clone(&second);
    let server = Rc::clone(&listener);
    event_loop.spawn(move || {
        let err = server.accept(None).unwrap_err();
        assert!(matches!(err, Error::Aborted), "got {}", err);
        saw_second.set(true);
    });

    let closer = Rc::clone(&listener);
    event_loop.spawn(move || {
        // Outlive the evicted waiter's 100ms deadline before cancelling.
        threadlet::timer::sleep_ms(250).unwrap();
        closer.close();
    });

    event_loop.run().unwrap();
    assert!(first.get());
    assert!(second.get());
}

#[test]
fn half_closed_peer_yields_prefix_then_closed() {
    init();
    let event_loop = EventLoop::new().unwrap();
    let listener = Rc::new(TcpListener::bind(any_local_address(), 8).unwrap());
    let addr = listener.local_addr().unwrap();

    let done = Rc::new(Cell::new(false));
    let saw = Rc::clone(&done);
    let server = Rc::clone(&listener);
    event_loop.spawn(move || {
        let stream = server.accept(long_timeout()).unwrap();
        // wait_all rides through the peer's close and hands the prefix
        // back first.
        let buf = stream.recv(true, long_timeout()).unwrap();
        assert_eq!(buf.payload(), b"abc");
        let err = stream.recv(true, long_timeout()).unwrap_err();
        assert!(matches!(err, Error::Closed));
        saw.set(true);
    });

    event_loop.spawn(move || {
        let stream = TcpStream::connect(addr, long_timeout()).unwrap();
        let mut msg = Buffer::from_slice(b"abc");
        stream
            .send(std::slice::from_mut(&mut msg), long_timeout())
            .unwrap();
        stream.close();
    });

    event_loop.run().unwrap();
    assert!(done.get());
}

#[test]
fn recv_with_wait_all_returns_partial_data_on_deadline() {
    init();
    let event_loop = EventLoop::new().unwrap();
    let listener = Rc::new(TcpListener::bind(any_local_address(), 8).unwrap());
    let addr = listener.local_addr().unwrap();

    let done = Rc::new(Cell::new(false));
    let saw = Rc::clone(&done);
    let server = Rc::clone(&listener);
    event_loop.spawn(move || {
        let stream = server.accept(long_timeout()).unwrap();
        // 5 bytes arrive but the 4KiB buffer never fills; the deadline
        // returns what accumulated.
        let buf = stream
            .recv(true, Some(Duration::from_millis(100)))
            .unwrap();
        assert_eq!(buf.payload(), b"hello");
        saw.set(true);
    });

    event_loop.spawn(move || {
        let stream = TcpStream::connect(addr, long_timeout()).unwrap();
        let mut msg = Buffer::from_slice(b"hello");
        stream
            .send(std::slice::from_mut(&mut msg), long_timeout())
            .unwrap();
        // Keep the stream open well past the server's deadline.
        threadlet::timer::sleep_ms(300).unwrap();
    });

    event_loop.run().unwrap();
    assert!(done.get());
}

#[test]
fn recv_with_no_data_times_out() {
    init();
    let event_loop = EventLoop::new().unwrap();
    let listener = Rc::new(TcpListener::bind(any_local_address(), 8).unwrap());
    let addr = listener.local_addr().unwrap();

    let timed_out = Rc::new(Cell::new(false));
    let saw = Rc::clone(&timed_out);
    let server = Rc::clone(&listener);
    event_loop.spawn(move || {
        let stream = server.accept(long_timeout()).unwrap();
        let err = stream
            .recv(false, Some(Duration::from_millis(50)))
            .unwrap_err();
        assert!(matches!(err, Error::Timeout));
        saw.set(true);
    });

    event_loop.spawn(move || {
        let stream = TcpStream::connect(addr, long_timeout()).unwrap();
        // Send nothing; just outlive the server's deadline.
        threadlet::timer::sleep_ms(200).unwrap();
        drop(stream);
    });

    event_loop.run().unwrap();
    assert!(timed_out.get());
}
