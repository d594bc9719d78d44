//! End-to-end loopback scenarios driving sockets through a real reactor.
#![cfg(unix)]

use std::cell::{Cell, RefCell};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::rc::Rc;
use std::time::{Duration, Instant};

use evsock::{Domain, Event, EventSet, Reactor, SockError, Socket, SocketConfig, Type};

/// Polls the reactor until `done` reports true or the deadline passes.
fn drive(reactor: &Reactor, deadline: Duration, mut done: impl FnMut() -> bool) -> bool {
    let start = Instant::now();
    while start.elapsed() < deadline {
        if done() {
            return true;
        }
        reactor
            .poll_once(Some(Duration::from_millis(10)))
            .expect("reactor poll failed");
    }
    done()
}

const DEADLINE: Duration = Duration::from_secs(5);

#[test]
fn tcp_connect_success() {
    let reactor = Reactor::new().unwrap();
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let target = listener.local_addr().unwrap();

    let socket = Socket::open(&reactor, Domain::Ipv4, Type::Stream).unwrap();
    let outcome: Rc<Cell<Option<Result<(), SockError>>>> = Rc::new(Cell::new(None));

    let sock = socket.clone();
    let seen = Rc::clone(&outcome);
    socket.install_event_handler(Event::Connect, move |_| {
        sock.disable_event(Event::Connect);
        seen.set(Some(sock.get_connect_result()));
    });

    match socket.connect(target) {
        Ok(()) => outcome.set(Some(Ok(()))),
        Err(SockError::InProgress) => {
            assert_eq!(socket.last_error(), Some(SockError::InProgress));
            socket.enable_event(Event::Connect);
            assert!(drive(&reactor, DEADLINE, || outcome.get().is_some()));
        }
        Err(err) => panic!("unexpected connect error: {err}"),
    }
    assert_eq!(outcome.get(), Some(Ok(())));
    assert_eq!(socket.peer_addr().unwrap(), target);

    // The connect machine is idle again, so a second attempt is legal (and
    // fails in the OS because the stream is already connected).
    assert!(socket.connect(target).is_err());

    socket.close();
}

#[test]
fn tcp_connect_refused() {
    let reactor = Reactor::new().unwrap();
    // Bind-then-drop to find a loopback port with no listener.
    let target = {
        let probe = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        probe.local_addr().unwrap()
    };

    let socket = Socket::open(&reactor, Domain::Ipv4, Type::Stream).unwrap();
    let outcome: Rc<Cell<Option<Result<(), SockError>>>> = Rc::new(Cell::new(None));

    let sock = socket.clone();
    let seen = Rc::clone(&outcome);
    socket.install_event_handler(Event::Connect, move |_| {
        sock.disable_event(Event::Connect);
        seen.set(Some(sock.get_connect_result()));
    });

    match socket.connect(target) {
        Err(SockError::ConnectionRefused) => {
            // The OS reported the refusal synchronously.
            socket.close();
            return;
        }
        Err(SockError::InProgress) => {
            socket.enable_event(Event::Connect);
            assert!(drive(&reactor, DEADLINE, || outcome.get().is_some()));
        }
        other => panic!("unexpected connect outcome: {other:?}"),
    }
    assert_eq!(outcome.get(), Some(Err(SockError::ConnectionRefused)));
    socket.close();
}

#[test]
fn accept_drain_reports_peer_and_closes() {
    let reactor = Reactor::new().unwrap();
    let listener = Socket::open(&reactor, Domain::Ipv4, Type::Stream).unwrap();
    listener.bind("127.0.0.1:0".parse().unwrap()).unwrap();
    listener.listen(8).unwrap();
    let addr = listener.local_addr().unwrap();

    let drained: Rc<Cell<Option<SocketAddr>>> = Rc::new(Cell::new(None));
    let acceptor = listener.clone();
    let seen = Rc::clone(&drained);
    listener.install_event_handler(Event::Accept, move |_| {
        seen.set(Some(acceptor.accept_discard().unwrap()));
    });
    listener.enable_event(Event::Accept);

    let client = std::net::TcpStream::connect(addr).unwrap();
    let client_addr = client.local_addr().unwrap();

    assert!(drive(&reactor, DEADLINE, || drained.get().is_some()));
    assert_eq!(drained.get(), Some(client_addr));

    listener.close();
}

#[test]
fn accept_returns_registered_socket() {
    let reactor = Reactor::new().unwrap();
    let listener = Socket::open(&reactor, Domain::Ipv4, Type::Stream).unwrap();
    listener.bind("127.0.0.1:0".parse().unwrap()).unwrap();
    listener.listen(-1).unwrap();
    let addr = listener.local_addr().unwrap();

    let accepted: Rc<RefCell<Option<(Socket, SocketAddr)>>> = Rc::new(RefCell::new(None));
    let acceptor = listener.clone();
    let slot = Rc::clone(&accepted);
    listener.install_event_handler(Event::Accept, move |_| {
        *slot.borrow_mut() = Some(acceptor.accept().unwrap());
    });
    listener.enable_event(Event::Accept);

    let mut client = std::net::TcpStream::connect(addr).unwrap();
    assert!(drive(&reactor, DEADLINE, || accepted.borrow().is_some()));

    let guard = accepted.borrow();
    let (conn, peer) = guard.as_ref().unwrap();
    assert_eq!(*peer, client.local_addr().unwrap());
    assert_eq!(conn.kind(), Type::Stream);
    assert!(!conn.pktinfo_enabled());

    // Stream data flows through the accepted socket.
    use std::io::Write;
    client.write_all(b"hello").unwrap();
    let got: Rc<RefCell<Vec<u8>>> = Rc::new(RefCell::new(Vec::new()));
    let reader = conn.clone();
    let sink = Rc::clone(&got);
    conn.install_event_handler(Event::Read, move |_| {
        let mut buf = [0u8; 64];
        if let Ok(n) = reader.recv(&mut buf) {
            sink.borrow_mut().extend_from_slice(&buf[..n]);
        }
    });
    conn.enable_event(Event::Read);
    assert!(drive(&reactor, DEADLINE, || !got.borrow().is_empty()));
    assert_eq!(&*got.borrow(), b"hello");

    conn.close();
    drop(guard);
    listener.close();
}

#[test]
fn udp_send_to_from_recv_from_to_loopback() {
    let reactor = Reactor::new().unwrap();

    let sender = Socket::open(&reactor, Domain::Ipv4, Type::Dgram).unwrap();
    sender.bind("0.0.0.0:0".parse().unwrap()).unwrap();
    let sender_port = sender.local_addr().unwrap().port();

    let receiver = Socket::open(&reactor, Domain::Ipv4, Type::Dgram).unwrap();
    receiver.bind("0.0.0.0:0".parse().unwrap()).unwrap();
    let receiver_port = receiver.local_addr().unwrap().port();
    assert!(receiver.pktinfo_enabled());

    type Received = (usize, SocketAddr, Option<IpAddr>);
    let received: Rc<Cell<Option<Received>>> = Rc::new(Cell::new(None));
    let reader = receiver.clone();
    let slot = Rc::clone(&received);
    receiver.install_event_handler(Event::Read, move |_| {
        let mut buf = [0u8; 64];
        if let Ok(result) = reader.recv_from_to(&mut buf) {
            assert_eq!(&buf[..result.0], b"x");
            slot.set(Some(result));
        }
    });
    receiver.enable_event(Event::Read);

    let local_hint = IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1));
    let dest: SocketAddr = format!("127.0.0.1:{receiver_port}").parse().unwrap();
    assert_eq!(sender.send_to_from(b"x", dest, Some(local_hint)).unwrap(), 1);

    assert!(drive(&reactor, DEADLINE, || received.get().is_some()));
    let (len, remote, local) = received.get().unwrap();
    assert_eq!(len, 1);
    assert_eq!(
        remote,
        format!("127.0.0.1:{sender_port}").parse::<SocketAddr>().unwrap()
    );
    assert_eq!(local, Some(local_hint));

    sender.close();
    receiver.close();
}

#[test]
fn udp_recv_from_to_degrades_without_pktinfo() {
    let reactor = Reactor::new().unwrap();

    let sender = Socket::open(&reactor, Domain::Ipv4, Type::Dgram).unwrap();
    sender.bind("0.0.0.0:0".parse().unwrap()).unwrap();

    let no_pktinfo = SocketConfig {
        request_pktinfo: false,
        ..Default::default()
    };
    let receiver =
        Socket::open_with(&reactor, Domain::Ipv4, Type::Dgram, &no_pktinfo).unwrap();
    receiver.bind("0.0.0.0:0".parse().unwrap()).unwrap();
    let receiver_port = receiver.local_addr().unwrap().port();
    assert!(!receiver.pktinfo_enabled());

    type Received = (usize, SocketAddr, Option<IpAddr>);
    let received: Rc<Cell<Option<Received>>> = Rc::new(Cell::new(None));
    let reader = receiver.clone();
    let slot = Rc::clone(&received);
    receiver.install_event_handler(Event::Read, move |_| {
        let mut buf = [0u8; 64];
        if let Ok(result) = reader.recv_from_to(&mut buf) {
            slot.set(Some(result));
        }
    });
    receiver.enable_event(Event::Read);

    let dest: SocketAddr = format!("127.0.0.1:{receiver_port}").parse().unwrap();
    sender.send_to(b"x", dest).unwrap();

    assert!(drive(&reactor, DEADLINE, || received.get().is_some()));
    let (len, _, local) = received.get().unwrap();
    assert_eq!(len, 1);
    assert_eq!(local, None);

    sender.close();
    receiver.close();
}

#[test]
fn close_in_read_handler_skips_write_handler() {
    let reactor = Reactor::new().unwrap();
    let socket = Socket::open(&reactor, Domain::Ipv4, Type::Dgram).unwrap();
    socket.bind("127.0.0.1:0".parse().unwrap()).unwrap();
    let addr = socket.local_addr().unwrap();

    // Queue a datagram to ourselves so the socket is readable and writable
    // in the same readiness notification.
    socket.send_to(b"ping", addr).unwrap();

    let write_ran = Rc::new(Cell::new(false));
    let closer = socket.clone();
    socket.install_event_handler(Event::Read, move |_| {
        closer.close();
    });
    let flag = Rc::clone(&write_ran);
    socket.install_event_handler(Event::Write, move |_| {
        flag.set(true);
    });
    socket.enable_event(Event::Read);
    socket.enable_event(Event::Write);

    assert!(drive(&reactor, DEADLINE, || !socket.is_open()));
    // Read runs first in dispatch order and destroyed the socket, so the
    // Write handler for the same notification must have been skipped.
    assert!(!write_ran.get());
}

#[test]
fn recv_quota_returns_later_with_data_pending() {
    let reactor = Reactor::new().unwrap();
    let socket = Socket::open(&reactor, Domain::Ipv4, Type::Dgram).unwrap();
    socket.bind("127.0.0.1:0".parse().unwrap()).unwrap();
    let addr = socket.local_addr().unwrap();

    // Loopback delivery is synchronous: all three datagrams are queued by
    // the time send_to returns.
    for _ in 0..3 {
        socket.send_to(b"q", addr).unwrap();
    }

    socket.set_recv_max(2);
    let mut buf = [0u8; 16];
    assert!(socket.recv_from(&mut buf).is_ok());
    assert!(socket.recv_from(&mut buf).is_ok());
    // Third call exceeds the quota and must yield even though a datagram
    // is still pending.
    assert_eq!(socket.recv_from(&mut buf), Err(SockError::Later));
    assert_eq!(socket.last_error(), Some(SockError::Later));

    // Lifting the cap proves the data was there all along.
    socket.set_recv_max(-1);
    assert!(socket.recv_from(&mut buf).is_ok());

    socket.close();
}

#[test]
fn global_handler_receives_full_event_set() {
    let reactor = Reactor::new().unwrap();
    let socket = Socket::open(&reactor, Domain::Ipv4, Type::Dgram).unwrap();
    socket.bind("127.0.0.1:0".parse().unwrap()).unwrap();
    let addr = socket.local_addr().unwrap();
    socket.send_to(b"ping", addr).unwrap();

    let seen: Rc<Cell<Option<EventSet>>> = Rc::new(Cell::new(None));
    let slot = Rc::clone(&seen);
    socket.install_global_handler(move |events| {
        slot.set(Some(events));
    });
    socket.set_global_events(Event::Read | Event::Write);

    assert!(drive(&reactor, DEADLINE, || seen.get().is_some()));
    let events = seen.get().unwrap();
    assert!(events.contains(Event::Read));
    assert!(events.contains(Event::Write));

    socket.close();
}

#[test]
fn remove_global_handler_clears_backend_mask() {
    let reactor = Reactor::new().unwrap();
    let socket = Socket::open(&reactor, Domain::Ipv4, Type::Dgram).unwrap();
    socket.bind("127.0.0.1:0".parse().unwrap()).unwrap();
    let addr = socket.local_addr().unwrap();

    let fired = Rc::new(Cell::new(0u32));
    let counter = Rc::clone(&fired);
    socket.install_global_handler(move |_| {
        counter.set(counter.get() + 1);
    });
    socket.set_global_events(EventSet::from(Event::Read));

    socket.send_to(b"ping", addr).unwrap();
    assert!(drive(&reactor, DEADLINE, || fired.get() > 0));

    // The datagram was never read, so the descriptor is still readable.
    // After removing the handler the backend mask must be cleared and the
    // reactor must stop delivering events for this socket.
    socket.remove_global_handler();
    for _ in 0..5 {
        let dispatched = reactor.poll_once(Some(Duration::from_millis(10))).unwrap();
        assert_eq!(dispatched, 0);
    }

    socket.close();
}
