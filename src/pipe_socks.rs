//! Readiness-driven relay between paired sockets. One dispatcher thread
//! owns every leg; other threads hand pairs over through a command queue
//! and wake the poller.

use std::collections::VecDeque;
use std::fmt;
use std::io::{self, Read, Write};
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc as std_mpsc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use arc_swap::ArcSwap;
use bytes::Bytes;
use mio::net::TcpStream;
use mio::{Events, Interest, Poll, Token, Waker};
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use socket2::{SockRef, Socket};
use tracing::{debug, error, info, warn};

use crate::config::Settings;
use crate::matcher::{DomainLists, is_private_ip};

const WAKE_TOKEN: Token = Token(0);
/// 单次读取上限
const RECV_CHUNK: usize = 64 * 1024;
const POLL_TIMEOUT: Duration = Duration::from_secs(1);
const TLS_HANDSHAKE: u8 = 0x16;

#[derive(Debug, Clone, Copy)]
pub struct PipeSettings {
    /// Output queue size above which the producing leg stops being read.
    pub buf_size: usize,
    pub split_sni: bool,
}

impl PipeSettings {
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            buf_size: settings.pipe_buf_size,
            split_sni: settings.split_sni,
        }
    }
}

impl Default for PipeSettings {
    fn default() -> Self {
        Self {
            buf_size: 16 * 1024,
            split_sni: false,
        }
    }
}

/// One side of a pair, with the host it was opened for (if any).
pub struct PipeLeg {
    stream: TcpStream,
    addr: Option<SocketAddr>,
    host: Option<String>,
}

impl PipeLeg {
    pub fn new(stream: std::net::TcpStream, host: Option<String>) -> io::Result<Self> {
        let addr = stream.peer_addr().ok();
        stream.set_nonblocking(true)?;
        Ok(Self {
            stream: TcpStream::from_std(stream),
            addr,
            host,
        })
    }
}

/// 待发送数据队列；空块是关闭标记
#[derive(Default)]
struct SendBuf {
    chunks: VecDeque<Bytes>,
    size: usize,
}

impl SendBuf {
    fn add(&mut self, data: Bytes) {
        self.size += data.len();
        self.chunks.push_back(data);
    }

    fn get(&mut self) -> Option<Bytes> {
        let data = self.chunks.pop_front()?;
        self.size -= data.len();
        Some(data)
    }

    fn restore(&mut self, data: Bytes) {
        self.size += data.len();
        self.chunks.push_front(data);
    }

    fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }
}

struct Leg {
    stream: TcpStream,
    peer: Token,
    addr: Option<SocketAddr>,
    host: Option<String>,
    created: Instant,
    recv_bytes: u64,
    recv_count: u64,
    sent_bytes: u64,
    send_count: u64,
    out: SendBuf,
    reading: bool,
    writing: bool,
    registered: bool,
}

impl Leg {
    fn new(leg: PipeLeg, peer: Token) -> Self {
        Self {
            stream: leg.stream,
            peer,
            addr: leg.addr,
            host: leg.host,
            created: Instant::now(),
            recv_bytes: 0,
            recv_count: 0,
            sent_bytes: 0,
            send_count: 0,
            out: SendBuf::default(),
            reading: true,
            writing: false,
            registered: false,
        }
    }

    fn is_local(&self) -> bool {
        self.addr.is_some_and(|a| is_private_ip(a.ip()))
    }

    fn port(&self) -> Option<u16> {
        self.addr.map(|a| a.port())
    }
}

/// Snapshot of one registered leg.
#[derive(Debug, Clone)]
pub struct LegStatus {
    pub token: usize,
    pub peer_token: usize,
    pub addr: Option<SocketAddr>,
    pub host: Option<String>,
    pub queued: usize,
    pub chunks: usize,
    pub reading: bool,
    pub writing: bool,
    pub recv_bytes: u64,
    pub recv_count: u64,
    pub sent_bytes: u64,
    pub send_count: u64,
    pub age: Duration,
}

#[derive(Debug, Clone)]
pub struct PipeStatus {
    pub buf_size: usize,
    pub running: bool,
    pub legs: Vec<LegStatus>,
}

impl fmt::Display for PipeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Pipe Sockets:")?;
        writeln!(f, "buf_size={}", self.buf_size)?;
        writeln!(f, "running={}", self.running)?;
        writeln!(f, "legs={}", self.legs.len())?;
        for leg in &self.legs {
            let addr = leg.addr.map(|a| a.to_string()).unwrap_or_else(|| "-".to_string());
            writeln!(
                f,
                " #{} -> #{} {} host={} queued={} ({} chunks) read={} write={} recv={}/{} sent={}/{} age={}s",
                leg.token,
                leg.peer_token,
                addr,
                leg.host.as_deref().unwrap_or("-"),
                leg.queued,
                leg.chunks,
                leg.reading as u8,
                leg.writing as u8,
                leg.recv_bytes,
                leg.recv_count,
                leg.sent_bytes,
                leg.send_count,
                leg.age.as_secs()
            )?;
        }
        Ok(())
    }
}

enum Command {
    Add(PipeLeg, PipeLeg),
    Snapshot(std_mpsc::Sender<Vec<LegStatus>>),
}

struct Shared {
    commands: Mutex<VecDeque<Command>>,
    running: AtomicBool,
}

pub struct PipeSocks {
    settings: PipeSettings,
    shared: Arc<Shared>,
    waker: Arc<Waker>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl PipeSocks {
    /// Starts the dispatcher thread. `lists` decides which hosts get their
    /// first TLS record split when `split_sni` is on.
    pub fn start(settings: PipeSettings, lists: Arc<ArcSwap<DomainLists>>) -> io::Result<Self> {
        let poll = Poll::new()?;
        let waker = Arc::new(Waker::new(poll.registry(), WAKE_TOKEN)?);
        let shared = Arc::new(Shared {
            commands: Mutex::new(VecDeque::new()),
            running: AtomicBool::new(true),
        });
        let dispatcher = Dispatcher {
            poll,
            shared: shared.clone(),
            legs: FxHashMap::default(),
            next_token: 1,
            settings,
            lists,
            read_buf: vec![0u8; RECV_CHUNK],
        };
        let handle = thread::Builder::new()
            .name("pipe-socks".to_string())
            .spawn(move || dispatcher.run())?;
        info!(target = "pipe_socks", buf_size = settings.buf_size, split_sni = settings.split_sni, "pipe started");
        Ok(Self {
            settings,
            shared,
            waker,
            thread: Mutex::new(Some(handle)),
        })
    }

    fn send(&self, command: Command) -> io::Result<()> {
        if !self.shared.running.load(Ordering::Acquire) {
            return Err(io::Error::new(io::ErrorKind::NotConnected, "pipe stopped"));
        }
        self.shared.commands.lock().push_back(command);
        self.waker.wake()
    }

    /// Hands a connected pair to the dispatcher. From here on every byte read
    /// from one leg is written to the other.
    pub fn add_socks(&self, local: PipeLeg, remote: PipeLeg) -> io::Result<()> {
        self.send(Command::Add(local, remote))
    }

    pub fn status(&self) -> PipeStatus {
        let running = self.shared.running.load(Ordering::Acquire);
        let (tx, rx) = std_mpsc::channel();
        let legs = match self.send(Command::Snapshot(tx)) {
            Ok(()) => rx.recv_timeout(Duration::from_secs(2)).unwrap_or_default(),
            Err(_) => Vec::new(),
        };
        PipeStatus {
            buf_size: self.settings.buf_size,
            running,
            legs,
        }
    }

    /// Closes every leg and joins the dispatcher thread.
    pub fn stop(&self) {
        self.shared.running.store(false, Ordering::Release);
        let _ = self.waker.wake();
        if let Some(handle) = self.thread.lock().take() {
            if handle.join().is_err() {
                error!(target = "pipe_socks", "dispatcher thread panicked");
            }
        }
    }
}

impl Drop for PipeSocks {
    fn drop(&mut self) {
        self.stop();
    }
}

struct Dispatcher {
    poll: Poll,
    shared: Arc<Shared>,
    legs: FxHashMap<Token, Leg>,
    next_token: usize,
    settings: PipeSettings,
    lists: Arc<ArcSwap<DomainLists>>,
    read_buf: Vec<u8>,
}

impl Dispatcher {
    fn run(mut self) {
        let mut events = Events::with_capacity(1024);
        while self.shared.running.load(Ordering::Acquire) {
            if let Err(err) = self.poll.poll(&mut events, Some(POLL_TIMEOUT)) {
                if err.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                error!(target = "pipe_socks", error = %err, "poll failed");
                break;
            }
            for event in events.iter() {
                let token = event.token();
                if token == WAKE_TOKEN {
                    continue;
                }
                if event.is_error() {
                    self.close(token, "socket error");
                    continue;
                }
                if event.is_readable() || event.is_read_closed() {
                    self.on_readable(token);
                }
                if event.is_writable() || event.is_write_closed() {
                    self.on_writable(token);
                }
            }
            self.drain_commands();
        }

        let tokens: Vec<Token> = self.legs.keys().copied().collect();
        for token in tokens {
            self.drop_leg(token);
        }
        self.drain_commands();
        info!(target = "pipe_socks", "pipe stopped");
    }

    fn drain_commands(&mut self) {
        let commands: Vec<Command> = self.shared.commands.lock().drain(..).collect();
        for command in commands {
            match command {
                Command::Add(local, remote) => self.add_pair(local, remote),
                Command::Snapshot(tx) => {
                    let _ = tx.send(self.snapshot());
                }
            }
        }
    }

    fn add_pair(&mut self, local: PipeLeg, remote: PipeLeg) {
        let t1 = Token(self.next_token);
        let t2 = Token(self.next_token + 1);
        self.next_token += 2;
        debug!(
            target = "pipe_socks",
            local = ?local.addr,
            remote = ?remote.addr,
            host = ?remote.host,
            "pipe pair added"
        );
        self.legs.insert(t1, Leg::new(local, t2));
        self.legs.insert(t2, Leg::new(remote, t1));
        self.update_interest(t1);
        self.update_interest(t2);
    }

    fn snapshot(&self) -> Vec<LegStatus> {
        let mut legs: Vec<LegStatus> = self
            .legs
            .iter()
            .map(|(token, leg)| LegStatus {
                token: token.0,
                peer_token: leg.peer.0,
                addr: leg.addr,
                host: leg.host.clone(),
                queued: leg.out.size,
                chunks: leg.out.chunks.len(),
                reading: leg.reading,
                writing: leg.writing,
                recv_bytes: leg.recv_bytes,
                recv_count: leg.recv_count,
                sent_bytes: leg.sent_bytes,
                send_count: leg.send_count,
                age: leg.created.elapsed(),
            })
            .collect();
        legs.sort_by_key(|l| l.token);
        legs
    }

    /// Registers, re-registers or deregisters to match the leg's flags.
    fn update_interest(&mut self, token: Token) {
        let Some(leg) = self.legs.get_mut(&token) else {
            return;
        };
        let interest = match (leg.reading, leg.writing) {
            (true, true) => Some(Interest::READABLE | Interest::WRITABLE),
            (true, false) => Some(Interest::READABLE),
            (false, true) => Some(Interest::WRITABLE),
            (false, false) => None,
        };
        let registry = self.poll.registry();
        let result = match (interest, leg.registered) {
            (Some(interest), false) => registry
                .register(&mut leg.stream, token, interest)
                .map(|_| leg.registered = true),
            (Some(interest), true) => registry.reregister(&mut leg.stream, token, interest),
            (None, true) => registry.deregister(&mut leg.stream).map(|_| leg.registered = false),
            (None, false) => Ok(()),
        };
        if let Err(err) = result {
            warn!(target = "pipe_socks", token = token.0, error = %err, "update interest failed");
            self.close(token, "register");
        }
    }

    fn on_readable(&mut self, token: Token) {
        loop {
            let Some(leg) = self.legs.get_mut(&token) else {
                return;
            };
            if !leg.reading {
                return;
            }
            let n = match leg.stream.read(&mut self.read_buf) {
                Ok(0) => {
                    self.close(token, "closed by peer");
                    return;
                }
                Ok(n) => n,
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => return,
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => {
                    debug!(target = "pipe_socks", token = token.0, error = %err, "recv failed");
                    self.close(token, "recv error");
                    return;
                }
            };
            leg.recv_bytes += n as u64;
            leg.recv_count += 1;
            let first = leg.recv_count == 1;
            let peer = leg.peer;
            let data = Bytes::copy_from_slice(&self.read_buf[..n]);
            self.forward(peer, data, first);

            // 对端积压超过上限时暂停读取
            let backlog = self.legs.get(&peer).map(|p| p.out.size).unwrap_or(0);
            if backlog > self.settings.buf_size {
                if let Some(leg) = self.legs.get_mut(&token) {
                    leg.reading = false;
                    self.update_interest(token);
                }
                return;
            }
        }
    }

    /// Sends straight to `to` when nothing is queued for it, otherwise
    /// appends. Data for a leg that is already gone is dropped.
    fn forward(&mut self, to: Token, mut data: Bytes, first: bool) {
        let split = if first { self.sni_split_point(to, &data) } else { None };
        let Some(peer) = self.legs.get_mut(&to) else {
            return;
        };

        if !peer.out.is_empty() {
            peer.out.add(data);
        } else {
            if let Some(at) = split {
                let prefix = data.split_to(at);
                if let Err(err) = write_blocking(&peer.stream, &prefix) {
                    warn!(target = "pipe_socks", host = ?peer.host, error = %err, "send split sni failed");
                    self.close(to, "split sni");
                    return;
                }
                peer.sent_bytes += prefix.len() as u64;
                peer.send_count += 1;
                debug!(target = "pipe_socks", host = ?peer.host, at, "first tls record split");
            }
            match peer.stream.write(&data) {
                Ok(n) => {
                    peer.sent_bytes += n as u64;
                    peer.send_count += 1;
                    if n < data.len() {
                        peer.out.add(data.slice(n..));
                    }
                }
                Err(err)
                    if err.kind() == io::ErrorKind::WouldBlock || err.kind() == io::ErrorKind::Interrupted =>
                {
                    peer.out.add(data);
                }
                Err(err) => {
                    debug!(target = "pipe_socks", token = to.0, error = %err, "send failed");
                    self.close(to, "send error");
                    return;
                }
            }
        }

        if !peer.out.is_empty() && !peer.writing {
            peer.writing = true;
            self.update_interest(to);
        }
    }

    fn sni_split_point(&self, to: Token, data: &[u8]) -> Option<usize> {
        if !self.settings.split_sni || data.first() != Some(&TLS_HANDSHAKE) {
            return None;
        }
        let peer = self.legs.get(&to)?;
        if peer.port() != Some(443) {
            return None;
        }
        let host = peer.host.as_deref()?;
        if !self.lists.load().in_block_list(host) {
            return None;
        }
        sni_split_point(data, host)
    }

    fn on_writable(&mut self, token: Token) {
        loop {
            let Some(leg) = self.legs.get_mut(&token) else {
                return;
            };
            let Some(chunk) = leg.out.get() else {
                if leg.writing {
                    leg.writing = false;
                    self.update_interest(token);
                }
                break;
            };
            if chunk.is_empty() {
                // 关闭标记：对端已关闭且数据已全部发出
                self.close(token, "flushed");
                return;
            }
            match leg.stream.write(&chunk) {
                Ok(n) => {
                    leg.sent_bytes += n as u64;
                    leg.send_count += 1;
                    if n < chunk.len() {
                        leg.out.restore(chunk.slice(n..));
                    }
                }
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                    leg.out.restore(chunk);
                    break;
                }
                Err(err) if err.kind() == io::ErrorKind::Interrupted => {
                    leg.out.restore(chunk);
                }
                Err(err) => {
                    debug!(target = "pipe_socks", token = token.0, error = %err, "send failed");
                    self.close(token, "send error");
                    return;
                }
            }
        }

        // 积压回落到上限以下，恢复对端读取
        let Some(leg) = self.legs.get(&token) else {
            return;
        };
        if leg.out.size >= self.settings.buf_size {
            return;
        }
        let peer = leg.peer;
        if let Some(peer_leg) = self.legs.get_mut(&peer) {
            if !peer_leg.reading {
                peer_leg.reading = true;
                self.update_interest(peer);
                // 边沿触发：重新注册后由下一次 poll 上报积压的数据
            }
        }
    }

    /// Closes `token` now. Its peer follows immediately when nothing is
    /// queued for it, otherwise after its queue drains.
    fn close(&mut self, token: Token, reason: &str) {
        let Some(mut leg) = self.legs.remove(&token) else {
            return;
        };
        if leg.registered {
            let _ = self.poll.registry().deregister(&mut leg.stream);
        }
        let peer_token = leg.peer;
        match self.legs.get(&peer_token) {
            Some(peer) => log_pair_close(&leg, peer, reason),
            None => debug!(
                target = "pipe_socks",
                token = token.0,
                addr = ?leg.addr,
                reason,
                sent = leg.sent_bytes,
                "pipe leg closed"
            ),
        }
        drop(leg);

        let Some(peer) = self.legs.get_mut(&peer_token) else {
            return;
        };
        if !peer.out.is_empty() {
            debug!(
                target = "pipe_socks",
                token = peer_token.0,
                pending = peer.out.size,
                "peer closed, flushing before close"
            );
            peer.out.add(Bytes::new());
            if !peer.writing {
                peer.writing = true;
                self.update_interest(peer_token);
            }
            return;
        }
        self.drop_leg(peer_token);
    }

    fn drop_leg(&mut self, token: Token) {
        if let Some(mut leg) = self.legs.remove(&token) {
            if leg.registered {
                let _ = self.poll.registry().deregister(&mut leg.stream);
            }
        }
    }
}

fn log_pair_close(closed: &Leg, other: &Leg, reason: &str) {
    let (local, remote) = if closed.is_local() { (closed, other) } else { (other, closed) };
    let by_remote = std::ptr::eq(closed, remote);
    let lifetime = remote.created.elapsed();
    debug!(
        target = "pipe_socks",
        local = ?local.addr,
        remote = ?remote.addr,
        host = ?remote.host,
        lifetime_secs = lifetime.as_secs(),
        upload_bytes = local.recv_bytes,
        upload_count = local.recv_count,
        download_bytes = remote.recv_bytes,
        download_count = remote.recv_count,
        by_remote,
        left = closed.out.size,
        reason,
        "pipe closed"
    );
    // 只发出了一次请求就断开的 443 连接，疑似 SNI 阻断
    if local.recv_bytes > 0
        && local.recv_count == 1
        && remote.port() == Some(443)
        && (by_remote || lifetime > Duration::from_secs(30))
    {
        debug!(target = "pipe_socks", host = ?remote.host, "sni blocking suspected");
    }
}

/// Where to cut a ClientHello so the host name straddles two segments.
/// Plain substring search; `None` leaves the data untouched.
pub fn sni_split_point(data: &[u8], host: &str) -> Option<usize> {
    let p1 = find(data, host.as_bytes())?;
    if p1 <= 1 {
        return None;
    }
    let p2 = if host.contains("google") {
        find(data, b"google")? + 3
    } else {
        (p1 + host.len()).checked_sub(6)?
    };
    (p2 > 0 && p2 < data.len()).then_some(p2)
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() || needle.len() > haystack.len() {
        return None;
    }
    haystack.windows(needle.len()).position(|w| w == needle)
}

/// 阻塞写出（1秒超时）后恢复非阻塞
fn write_blocking(stream: &TcpStream, data: &[u8]) -> io::Result<()> {
    let sock = SockRef::from(stream);
    sock.set_nonblocking(false)?;
    sock.set_write_timeout(Some(Duration::from_secs(1)))?;
    let mut writer: &Socket = &sock;
    let result = writer.write_all(data);
    sock.set_nonblocking(true)?;
    result
}
