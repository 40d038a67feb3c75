use std::{
    os::unix::net::{UnixListener, UnixStream},
    path::{Path, PathBuf},
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, Ordering},
    },
    thread,
    time::Duration,
};

use crossbeam_channel::Select;

use crate::{
    config::Role,
    dist::DistShared,
    protocol::{DistMsgType, Frame},
    queue::{WaitQueue, push_frame},
};

use super::{
    MAX_CONNECTIONS, TransportError, read_frame,
    shard::{Route, ShardRegistry},
    write_frame,
};

const WRITER_POLL: Duration = Duration::from_millis(100);

/// One accepted follower.
struct Conn {
    id: usize,
    stream: UnixStream,
    closed: AtomicBool,
    /// Set once the follower's HELLO has been handled.
    greeted: AtomicBool,
    /// Frames forwarded by other writers or replayed on HELLO.
    outbox: WaitQueue<Frame>,
}

impl Conn {
    /// Returns true for the call that actually closed the socket.
    fn close(&self) -> bool {
        if self.closed.swap(true, Ordering::AcqRel) {
            return false;
        }
        let _ = self.stream.shutdown(std::net::Shutdown::Both);
        true
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn is_greeted(&self) -> bool {
        self.greeted.load(Ordering::Acquire)
    }
}

struct Server {
    shared: Arc<DistShared>,
    registry: ShardRegistry,
    slots: Mutex<Vec<Option<Arc<Conn>>>>,
    shutdown: AtomicBool,
}

impl Server {
    fn claim_slot(&self, stream: UnixStream) -> Option<Arc<Conn>> {
        let Ok(mut slots) = self.slots.lock() else {
            return None;
        };
        let id = slots.iter().position(Option::is_none)?;
        let conn = Arc::new(Conn {
            id,
            stream,
            closed: AtomicBool::new(false),
            greeted: AtomicBool::new(false),
            outbox: WaitQueue::new(self.shared.channels.pass_out.capacity()),
        });
        slots[id] = Some(conn.clone());
        Some(conn)
    }

    fn conn(&self, id: usize) -> Option<Arc<Conn>> {
        self.slots.lock().ok()?.get(id)?.clone()
    }

    fn live(&self) -> usize {
        self.slots
            .lock()
            .map(|s| s.iter().flatten().count())
            .unwrap_or(0)
    }

    /// First closer releases the slot and the shards it served.
    fn drop_conn(&self, conn: &Conn, why: &str) {
        if !conn.close() {
            return;
        }
        let orphaned = self.registry.release(conn.id);
        if let Ok(mut slots) = self.slots.lock() {
            slots[conn.id] = None;
        }
        log::info!(
            "[transport] connection {} closed ({why}), orphaned splits {orphaned:?}",
            conn.id
        );
    }

    fn close_all(&self) {
        let conns: Vec<Arc<Conn>> = match self.slots.lock() {
            Ok(slots) => slots.iter().flatten().cloned().collect(),
            Err(_) => return,
        };
        for conn in conns {
            self.drop_conn(&conn, "shutdown");
        }
    }
}

/// Running authority socket. Dropping it without `shutdown` leaves threads running.
pub struct AuthorityHandle {
    server: Arc<Server>,
    path: PathBuf,
    accept: Option<thread::JoinHandle<()>>,
}

impl AuthorityHandle {
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn registry(&self) -> &ShardRegistry {
        &self.server.registry
    }

    pub fn live_connections(&self) -> usize {
        self.server.live()
    }

    pub fn shutdown(&mut self) {
        if self.server.shutdown.swap(true, Ordering::AcqRel) {
            return;
        }
        // Wake the accept loop.
        let _ = UnixStream::connect(&self.path);
        if let Some(handle) = self.accept.take() {
            let _ = handle.join();
        }
        self.server.close_all();
        let _ = std::fs::remove_file(&self.path);
        log::info!("[transport] authority on {} stopped", self.path.display());
    }
}

/// Binds `path` (removing a stale socket file first) and starts accepting followers.
pub fn spawn_authority(
    path: &Path,
    shared: Arc<DistShared>,
) -> Result<AuthorityHandle, TransportError> {
    if path.exists() {
        std::fs::remove_file(path)?;
    }
    let listener = UnixListener::bind(path)?;
    log::info!("[transport] authority listening on {}", path.display());

    let server = Arc::new(Server {
        shared,
        registry: ShardRegistry::new(),
        slots: Mutex::new(vec![None; MAX_CONNECTIONS]),
        shutdown: AtomicBool::new(false),
    });

    let accept_server = server.clone();
    let accept = thread::Builder::new()
        .name("dist-accept".to_string())
        .spawn(move || accept_loop(listener, accept_server))?;

    Ok(AuthorityHandle {
        server,
        path: path.to_path_buf(),
        accept: Some(accept),
    })
}

fn accept_loop(listener: UnixListener, server: Arc<Server>) {
    for stream in listener.incoming() {
        if server.shutdown.load(Ordering::Acquire) {
            break;
        }
        let stream = match stream {
            Ok(s) => s,
            Err(e) => {
                log::warn!("[transport] accept failed: {e}");
                continue;
            }
        };
        let Some(conn) = server.claim_slot(stream) else {
            log::warn!("[transport] {MAX_CONNECTIONS} connections live, refusing another");
            continue;
        };
        log::info!("[transport] follower connected in slot {}", conn.id);
        if let Err(e) = spawn_conn_threads(&server, &conn) {
            log::error!("[transport] cannot start threads for slot {}: {e}", conn.id);
            server.drop_conn(&conn, "spawn failed");
        }
    }
}

fn spawn_conn_threads(server: &Arc<Server>, conn: &Arc<Conn>) -> std::io::Result<()> {
    let (s, c) = (server.clone(), conn.clone());
    thread::Builder::new()
        .name(format!("dist-read-{}", conn.id))
        .spawn(move || {
            let why = reader_loop(&s, &c);
            s.drop_conn(&c, &why);
        })?;
    let (s, c) = (server.clone(), conn.clone());
    thread::Builder::new()
        .name(format!("dist-write-{}", conn.id))
        .spawn(move || {
            let why = writer_loop(&s, &c);
            s.drop_conn(&c, &why);
        })?;
    Ok(())
}

fn reader_loop(server: &Server, conn: &Conn) -> String {
    let shared = &server.shared;
    loop {
        let mut stream = &conn.stream;
        let frame = match read_frame(&mut stream) {
            Ok(f) => f,
            Err(e) if e.is_recoverable() => {
                log::warn!("[transport] slot {}: {e}, message skipped", conn.id);
                continue;
            }
            Err(e) => return e.to_string(),
        };
        shared.dump("recv", &frame);

        match frame.kind {
            DistMsgType::PassData => {
                let current = shared.ticket.current();
                if frame.ticket != current {
                    log::debug!(
                        "[transport] data ticket={} current={current} split={}, dropped",
                        frame.ticket,
                        frame.split.split_idx
                    );
                    continue;
                }
                if !server.registry.accept_data(&frame) {
                    log::debug!(
                        "[transport] duplicate data seq={} split={}, dropped",
                        frame.seq,
                        frame.split.split_idx
                    );
                    continue;
                }
                shared.channels.deliver_data(Role::Authority, frame);
            }
            DistMsgType::Debug => handle_debug(server, conn, &frame),
            DistMsgType::PassGraph => {
                log::warn!("[transport] slot {} sent a pass graph, ignored", conn.id);
            }
        }
    }
}

fn handle_debug(server: &Server, conn: &Conn, frame: &Frame) {
    let records = match frame.debug_records() {
        Ok(r) => r,
        Err(e) => {
            log::warn!("[transport] slot {}: bad debug message: {e}", conn.id);
            return;
        }
    };
    for record in records {
        if record.is_hello() {
            match server.registry.hello(conn.id, frame.ticket, frame.split) {
                Some((idx, replay)) => {
                    log::info!(
                        "[transport] slot {} serves split {idx} (follower ticket {})",
                        conn.id,
                        frame.ticket
                    );
                    if let Some(graph) = replay {
                        log::info!("[transport] replaying ticket {} to split {idx}", graph.ticket);
                        push_frame(&conn.outbox, graph, "outbox");
                    }
                }
                None => log::info!("[transport] slot {} waits for a split", conn.id),
            }
            conn.greeted.store(true, Ordering::Release);
        } else if record.is_ack() {
            server.registry.record_ack(frame.split.split_idx, frame.ticket);
            log::info!(
                "[transport] split {} acked ticket {}",
                frame.split.split_idx,
                frame.ticket
            );
        } else {
            log::debug!("[transport] slot {} says: {}", conn.id, record.text);
        }
    }
}

/// Next frame for this connection: its own outbox, then pass graphs, then its bound
/// shard's stash and data lane. A greeted connection without a shard adopts the graph
/// of an orphaned one.
fn next_outbound(server: &Server, conn: &Conn) -> Option<Frame> {
    if let Some(frame) = conn.outbox.try_pop() {
        return Some(frame);
    }
    if let Some(frame) = server.shared.channels.pass_out.try_pop() {
        return Some(frame);
    }
    let Some(idx) = server.registry.split_of(conn.id) else {
        if !conn.is_greeted() {
            return None;
        }
        let (idx, graph) = server.registry.adopt_orphan(conn.id)?;
        log::info!(
            "[transport] slot {} adopts split {idx} (ticket {})",
            conn.id,
            graph.ticket
        );
        return Some(graph);
    };
    if let Some(frame) = server.registry.take_stash(idx) {
        return Some(frame);
    }
    server.shared.channels.output.get(usize::from(idx))?.try_pop()
}

fn wait_outbound(server: &Server, conn: &Conn) {
    let channels = &server.shared.channels;
    let mut sel = Select::new();
    sel.recv(conn.outbox.receiver());
    sel.recv(channels.pass_out.receiver());
    if let Some(lane) = server
        .registry
        .split_of(conn.id)
        .and_then(|idx| channels.output.get(usize::from(idx)))
    {
        sel.recv(lane.receiver());
    }
    let _ = sel.ready_timeout(WRITER_POLL);
}

fn writer_loop(server: &Server, conn: &Conn) -> String {
    loop {
        if conn.is_closed() || server.shutdown.load(Ordering::Acquire) {
            return "writer stopped".to_string();
        }
        let Some(frame) = next_outbound(server, conn) else {
            wait_outbound(server, conn);
            continue;
        };

        if frame.kind == DistMsgType::PassGraph {
            match server.registry.route_graph(conn.id, &frame) {
                Route::Here => {}
                Route::Forward(owner) => {
                    match server.conn(owner) {
                        Some(other) => push_frame(&other.outbox, frame, "outbox"),
                        None => log::debug!("[transport] owner {owner} gone, graph cached"),
                    }
                    continue;
                }
                Route::Park => {
                    log::debug!(
                        "[transport] no follower for split {}, graph cached",
                        frame.split.split_idx
                    );
                    continue;
                }
            }
        }

        let mut stream = &conn.stream;
        if let Err(e) = write_frame(&mut stream, &frame) {
            if frame.kind == DistMsgType::PassData {
                server.registry.stash(frame);
            }
            return format!("write failed: {e}");
        }
        server.shared.dump("send", &frame);
        log::trace!(
            "[transport] slot {} sent {:?} ticket={} split={}",
            conn.id,
            frame.kind,
            frame.ticket,
            frame.split.split_idx
        );
    }
}
