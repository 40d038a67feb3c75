use std::{
    os::unix::net::UnixStream,
    path::{Path, PathBuf},
    sync::{
        Arc, Mutex, MutexGuard,
        atomic::{AtomicBool, Ordering},
    },
    thread,
    time::Duration,
};

use crossbeam_channel::Select;

use crate::{
    config::Role,
    dist::DistShared,
    protocol::{DebugRecord, DistMsgType, Frame, SplitInfo},
    queue::push_frame,
};

use super::{TransportError, read_frame, shard::Dedup, write_frame};

const WRITER_POLL: Duration = Duration::from_millis(100);

#[derive(Default)]
struct LinkState {
    /// Bumped on every successful connect.
    epoch: u64,
    stream: Option<Arc<UnixStream>>,
}

/// The follower's single connection, shared by its reader and writer threads.
struct Link {
    path: PathBuf,
    backoff: Duration,
    shared: Arc<DistShared>,
    state: Mutex<LinkState>,
    /// Ticket and split of the last pass graph received, announced in HELLO.
    known: Mutex<(u64, SplitInfo)>,
    dedup: Mutex<Dedup>,
    shutdown: AtomicBool,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    match m.lock() {
        Ok(g) => g,
        Err(poisoned) => poisoned.into_inner(),
    }
}

impl Link {
    fn stopped(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }

    /// Returns the live stream, connecting if there is none. The first thread in
    /// connects and says HELLO; the other adopts the result. On failure the caller
    /// sleeps the backoff and gets `None`.
    fn current(&self) -> Option<(u64, Arc<UnixStream>)> {
        {
            let mut state = lock(&self.state);
            if let Some(stream) = &state.stream {
                return Some((state.epoch, stream.clone()));
            }
            if self.stopped() {
                return None;
            }
            match self.connect() {
                Ok(stream) => {
                    state.epoch += 1;
                    state.stream = Some(stream.clone());
                    log::info!(
                        "[transport] connected to {} (epoch {})",
                        self.path.display(),
                        state.epoch
                    );
                    return Some((state.epoch, stream));
                }
                Err(e) => log::debug!("[transport] connect {} failed: {e}", self.path.display()),
            }
        }
        thread::sleep(self.backoff);
        None
    }

    fn connect(&self) -> Result<Arc<UnixStream>, TransportError> {
        let stream = UnixStream::connect(&self.path)?;
        let (ticket, split) = *lock(&self.known);
        let hello = Frame::debug(ticket, split, &[DebugRecord::hello()])?;
        let mut w = &stream;
        write_frame(&mut w, &hello)?;
        Ok(Arc::new(stream))
    }

    /// Tears the stream down if it is still the one from `epoch`.
    fn fail(&self, epoch: u64, why: &str) {
        let mut state = lock(&self.state);
        if state.epoch != epoch {
            return;
        }
        if let Some(stream) = state.stream.take() {
            let _ = stream.shutdown(std::net::Shutdown::Both);
            log::warn!("[transport] connection lost ({why}), reconnecting");
        }
    }
}

/// Running follower link.
pub struct FollowerHandle {
    link: Arc<Link>,
    threads: Vec<thread::JoinHandle<()>>,
}

impl FollowerHandle {
    pub fn is_connected(&self) -> bool {
        lock(&self.link.state).stream.is_some()
    }

    pub fn shutdown(&mut self) {
        if self.link.shutdown.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(stream) = lock(&self.link.state).stream.take() {
            let _ = stream.shutdown(std::net::Shutdown::Both);
        }
        for handle in self.threads.drain(..) {
            let _ = handle.join();
        }
        log::info!("[transport] follower link to {} stopped", self.link.path.display());
    }
}

pub fn spawn_follower(
    path: &Path,
    shared: Arc<DistShared>,
    backoff: Duration,
) -> Result<FollowerHandle, TransportError> {
    let link = Arc::new(Link {
        path: path.to_path_buf(),
        backoff,
        shared,
        state: Mutex::new(LinkState::default()),
        known: Mutex::new((0, SplitInfo::default())),
        dedup: Mutex::new(Dedup::default()),
        shutdown: AtomicBool::new(false),
    });

    let reader = {
        let link = link.clone();
        thread::Builder::new()
            .name("dist-follower-read".to_string())
            .spawn(move || reader_loop(&link))?
    };
    let writer = {
        let link = link.clone();
        thread::Builder::new()
            .name("dist-follower-write".to_string())
            .spawn(move || writer_loop(&link))?
    };

    Ok(FollowerHandle {
        link,
        threads: vec![reader, writer],
    })
}

fn reader_loop(link: &Link) {
    let shared = &link.shared;
    while !link.stopped() {
        let Some((epoch, stream)) = link.current() else {
            continue;
        };
        let mut r = &*stream;
        let frame = match read_frame(&mut r) {
            Ok(f) => f,
            Err(e) if e.is_recoverable() => {
                log::warn!("[transport] {e}, message skipped");
                continue;
            }
            Err(e) => {
                link.fail(epoch, &e.to_string());
                continue;
            }
        };
        shared.dump("recv", &frame);

        match frame.kind {
            DistMsgType::PassGraph => {
                log::info!(
                    "[transport] pass graph ticket={} split={}/{}",
                    frame.ticket,
                    frame.split.split_idx,
                    frame.split.split_cnt
                );
                *lock(&link.known) = (frame.ticket, frame.split);
                lock(&link.dedup).reset_all();
                match Frame::debug(frame.ticket, frame.split, &[DebugRecord::ack()]) {
                    Ok(ack) => push_frame(&shared.channels.control, ack, "control"),
                    Err(e) => log::warn!("[transport] cannot build ack: {e}"),
                }
                push_frame(&shared.channels.pass_in, frame, "pass_in");
            }
            DistMsgType::PassData => {
                if !lock(&link.dedup).accept(&frame) {
                    log::debug!("[transport] duplicate data seq={}, dropped", frame.seq);
                    continue;
                }
                shared.channels.deliver_data(Role::Follower, frame);
            }
            DistMsgType::Debug => {
                for record in frame.debug_records().unwrap_or_default() {
                    log::debug!("[transport] authority says: {}", record.text);
                }
            }
        }
    }
}

fn next_outbound(link: &Link) -> Option<Frame> {
    let channels = &link.shared.channels;
    channels
        .control
        .try_pop()
        .or_else(|| channels.input.iter().find_map(|q| q.try_pop()))
}

fn wait_outbound(link: &Link) {
    let channels = &link.shared.channels;
    let mut sel = Select::new();
    sel.recv(channels.control.receiver());
    for lane in &channels.input {
        sel.recv(lane.receiver());
    }
    let _ = sel.ready_timeout(WRITER_POLL);
}

fn writer_loop(link: &Link) {
    let mut cached: Option<Frame> = None;
    while !link.stopped() {
        let Some((epoch, stream)) = link.current() else {
            continue;
        };
        let frame = match cached.take().or_else(|| next_outbound(link)) {
            Some(f) => f,
            None => {
                wait_outbound(link);
                continue;
            }
        };

        let mut w = &*stream;
        match write_frame(&mut w, &frame) {
            Ok(()) => link.shared.dump("send", &frame),
            Err(e) => {
                cached = Some(frame);
                link.fail(epoch, &e.to_string());
            }
        }
    }
}
