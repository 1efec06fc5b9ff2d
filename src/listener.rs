use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr, TcpListener, TcpStream, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crossbeam_channel::{unbounded, Receiver, Sender};
use log::{debug, warn};
use serde::de::DeserializeOwned;

use crate::message::{self, CodecError};

/// Accepts connections on one port and turns each into one decoded message
/// on an unbounded queue. One instance per port role: commands and shuffle
/// words on a worker, statuses and results on the master.
pub struct Listener<T> {
    running: Arc<AtomicBool>,
    local_addr: SocketAddr,
    rx: Receiver<T>,
    handle: Option<JoinHandle<()>>,
}

impl<T: DeserializeOwned + Send + 'static> Listener<T> {
    /// Bind once and start the accept thread.
    pub fn start<A: ToSocketAddrs>(addr: A, name: &str) -> io::Result<Self> {
        let socket = TcpListener::bind(addr)?;
        let local_addr = socket.local_addr()?;
        let running = Arc::new(AtomicBool::new(true));
        let (tx, rx) = unbounded();

        let flag = Arc::clone(&running);
        let handle = thread::Builder::new()
            .name(format!("listen-{name}"))
            .spawn(move || accept_loop(socket, flag, tx))?;

        debug!("listening on {local_addr}");
        Ok(Listener {
            running,
            local_addr,
            rx,
            handle: Some(handle),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn port(&self) -> u16 {
        self.local_addr.port()
    }

    /// The dispatcher side of the queue. `recv` on it blocks until a
    /// message arrives and disconnects once the listener has stopped and
    /// every queued message has been taken, so a plain receive loop gives
    /// the "drain after stop" guarantee without polling.
    pub fn receiver(&self) -> Receiver<T> {
        self.rx.clone()
    }

    /// Clear the running flag and wake the blocked accept with a loopback
    /// connection. Messages already pending in the accept backlog are still
    /// delivered before the thread exits.
    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        let mut addr = self.local_addr;
        if addr.ip().is_unspecified() {
            addr.set_ip(IpAddr::V4(Ipv4Addr::LOCALHOST));
        }
        // The wake connection carries no bytes and is skipped on receipt.
        let _ = TcpStream::connect(addr);
    }

    /// Wait for the accept thread to exit. Call after `stop`.
    pub fn join(&mut self) {
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                warn!("listener thread on {} panicked", self.local_addr);
            }
        }
    }
}

fn accept_loop<T: DeserializeOwned>(socket: TcpListener, running: Arc<AtomicBool>, tx: Sender<T>) {
    while running.load(Ordering::SeqCst) {
        match socket.accept() {
            Ok((stream, peer)) => receive_one(stream, peer, &tx),
            Err(e) => warn!("accept failed: {e}"),
        }
    }
    drain_backlog(&socket, &tx);
}

/// Connections completed before `stop` may still sit in the kernel backlog.
/// Consume them all before dropping the queue sender, so a sender that saw
/// its connect succeed never loses its message.
fn drain_backlog<T: DeserializeOwned>(socket: &TcpListener, tx: &Sender<T>) {
    if let Err(e) = socket.set_nonblocking(true) {
        warn!("cannot drain accept backlog: {e}");
        return;
    }
    loop {
        match socket.accept() {
            Ok((stream, peer)) => {
                if stream.set_nonblocking(false).is_err() {
                    continue;
                }
                receive_one(stream, peer, tx);
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
            Err(e) => {
                warn!("accept failed while draining: {e}");
                break;
            }
        }
    }
}

fn receive_one<T: DeserializeOwned>(mut stream: TcpStream, peer: SocketAddr, tx: &Sender<T>) {
    match message::read_message::<T>(&mut stream) {
        Ok(msg) => {
            if tx.send(msg).is_err() {
                debug!("dispatcher gone, message from {peer} dropped");
            }
        }
        Err(CodecError::Empty) => debug!("empty connection from {peer}"),
        Err(e) => warn!("dropping undecodable message from {peer}: {e}"),
    }
}

/// Drain a queue on its own thread, handing each message to `handler` in
/// arrival order. Ends when the queue disconnects.
pub fn spawn_dispatcher<T, F>(name: &str, rx: Receiver<T>, mut handler: F) -> io::Result<JoinHandle<()>>
where
    T: Send + 'static,
    F: FnMut(T) + Send + 'static,
{
    thread::Builder::new()
        .name(format!("dispatch-{name}"))
        .spawn(move || {
            while let Ok(msg) = rx.recv() {
                handler(msg);
            }
        })
}
