//! The progress coordinator.
//!
//! One coordinator owns every bar. It runs two threads:
//!
//! - the **primary loop** takes requests off a single inbound channel, one
//!   at a time under the registry lock, and answers each on the
//!   requester's reply channel. Creations are answered immediately with a
//!   fresh [`BarId`]; mutations are queued for the render loop.
//! - the **secondary loop** wakes on a fixed interval, applies queued
//!   mutations, re-runs the ordering pass and redraws.
//!
//! Handles never touch bar state; every operation is a blocking round
//! trip, which throttles fast producers to the coordinator's pace.

use std::collections::VecDeque;
use std::sync::{Arc, Weak};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use rustc_hash::FxHashMap;

use super::board::Board;
use super::handle::{ProgressHandle, Transport};
use super::screen::Screen;
use super::types::{
    BarAttr, BarId, BarOptions, BarValue, ProgressOp, ProgressRequest, ProgressResponse,
    RequesterId,
};
use crate::config::ProgressConfig;
use crate::error::{Error, Result};

/// Requester id used for the coordinator's own messages. Never registered.
const INTERNAL_REQUESTER: RequesterId = RequesterId(0);

/// Handle to a running coordinator.
pub struct Coordinator {
    inbound: Sender<ProgressRequest>,
    shared: Arc<Shared>,
    primary: Option<JoinHandle<()>>,
    secondary: Option<JoinHandle<()>>,
}

struct Shared {
    registry: Mutex<Registry>,
    replies: Mutex<FxHashMap<RequesterId, Sender<ProgressResponse>>>,
    next_requester: AtomicU64,
    stop: Mutex<bool>,
    wake: Condvar,
    stats: Mutex<FxHashMap<&'static str, u64>>,
    interval: Duration,
}

impl Shared {
    fn reply(&self, requester: RequesterId, response: ProgressResponse) {
        if requester == INTERNAL_REQUESTER {
            return;
        }
        let replies = self.replies.lock();
        match replies.get(&requester) {
            Some(tx) => {
                if tx.send(response).is_err() {
                    tracing::debug!("Requester {:?} went away before its reply", requester);
                }
            }
            None => tracing::warn!("Reply for unregistered requester {:?} dropped", requester),
        }
    }

    fn request_stop(&self) {
        let mut stop = self.stop.lock();
        *stop = true;
        self.wake.notify_all();
    }
}

/// Bar state owned by the coordinator.
struct Registry {
    board: Board,
    /// Bars created but not yet instantiated by the render loop.
    pending: FxHashMap<BarId, (BarOptions, Instant)>,
    /// Mutations waiting for the next render tick, in arrival order.
    queue: VecDeque<(BarId, ProgressOp)>,
    next_bar: u64,
}

impl Registry {
    fn exists(&self, id: BarId) -> bool {
        self.pending.contains_key(&id) || self.board.contains(id)
    }

    /// Answer one request from the primary loop.
    fn handle(&mut self, bar: Option<BarId>, op: ProgressOp) -> ProgressResponse {
        match op {
            ProgressOp::Create(options) => {
                self.next_bar += 1;
                let id = BarId(self.next_bar);
                self.pending.insert(id, (options, Instant::now()));
                self.queue.push_back((id, ProgressOp::Create(BarOptions::default())));
                ProgressResponse::Created(id)
            }
            ProgressOp::Write(line) => match self.board.write_line(&line) {
                Ok(()) => ProgressResponse::Ack,
                Err(e) => ProgressResponse::Rejected(format!("write failed: {}", e)),
            },
            ProgressOp::Exit => ProgressResponse::Rejected("exit is handled by the loop".into()),
            op => {
                let Some(id) = bar else {
                    return ProgressResponse::Rejected(format!("'{}' needs a bar id", op.name()));
                };
                if !self.exists(id) {
                    // Closing twice is harmless.
                    if let ProgressOp::Close = op {
                        return ProgressResponse::Ack;
                    }
                    return ProgressResponse::UnknownBar(id);
                }
                match op {
                    ProgressOp::GetAttr(attr) => ProgressResponse::Value(self.read(id, attr)),
                    ProgressOp::SetAttr(BarValue::Position(_)) => ProgressResponse::Rejected(
                        "position is assigned by the ordering pass".into(),
                    ),
                    op => {
                        self.queue.push_back((id, op));
                        ProgressResponse::Ack
                    }
                }
            }
        }
    }

    /// Attribute read as of the last applied tick.
    fn read(&self, id: BarId, attr: BarAttr) -> BarValue {
        if let Some(value) = self.board.get(id, attr) {
            return value;
        }
        let options = self.pending.get(&id).map(|(o, _)| o);
        match (attr, options) {
            (BarAttr::Total, Some(o)) => BarValue::Total(o.total),
            (BarAttr::Description, Some(o)) => BarValue::Description(o.description.clone()),
            (BarAttr::Colour, Some(o)) => BarValue::Colour(o.colour),
            (BarAttr::Priority, Some(o)) => BarValue::Priority(o.priority),
            (BarAttr::Count, _) => BarValue::Count(0),
            (BarAttr::Position, _) => BarValue::Position(None),
            (BarAttr::Total, None) => BarValue::Total(None),
            (BarAttr::Description, None) => BarValue::Description(String::new()),
            (BarAttr::Colour, None) => BarValue::Colour(None),
            (BarAttr::Priority, None) => BarValue::Priority(f64::INFINITY),
        }
    }

    /// One render pass: apply the queue, re-order, redraw.
    fn tick(&mut self) {
        while let Some((id, op)) = self.queue.pop_front() {
            if let ProgressOp::Create(_) = op {
                if let Some((options, created_at)) = self.pending.remove(&id) {
                    self.board.create(id, options, created_at);
                }
                continue;
            }
            if let Err(message) = self.board.apply(id, op) {
                tracing::debug!("Ignored progress operation on {}: {}", id, message);
            }
        }

        self.board.redraw(false);
    }
}

/// Snapshot of how many requests of each kind the coordinator has served.
#[derive(Debug, Clone, Default)]
pub struct CoordinatorStats {
    counts: FxHashMap<&'static str, u64>,
}

impl CoordinatorStats {
    /// Requests seen for an operation name such as `"update"`.
    pub fn count(&self, op: &str) -> u64 {
        self.counts.get(op).copied().unwrap_or(0)
    }

    pub fn total(&self) -> u64 {
        self.counts.values().sum()
    }
}

/// Sets the stop flag and wakes the other loop when a loop exits, even by panic.
struct LoopGuard {
    shared: Arc<Shared>,
    name: &'static str,
    /// The render loop pushes an exit request so the primary loop stops too.
    inbound: Option<Sender<ProgressRequest>>,
}

impl Drop for LoopGuard {
    fn drop(&mut self) {
        if thread::panicking() {
            tracing::error!("Progress {} loop panicked; tearing down coordinator", self.name);
        }
        self.shared.request_stop();
        if let Some(inbound) = self.inbound.take() {
            let _ = inbound.send(ProgressRequest {
                requester: INTERNAL_REQUESTER,
                bar: None,
                op: ProgressOp::Exit,
            });
        } else {
            // Nobody will answer any more; waiting handles must see a disconnect.
            self.shared.replies.lock().clear();
        }
    }
}

impl Coordinator {
    /// Start the coordinator threads.
    pub fn spawn(config: &ProgressConfig) -> Result<Self> {
        let (inbound, requests) = mpsc::channel();
        let shared = Arc::new(Shared {
            registry: Mutex::new(Registry {
                board: Board::new(Screen::new(&config.target, config.width)),
                pending: FxHashMap::default(),
                queue: VecDeque::new(),
                next_bar: 0,
            }),
            replies: Mutex::new(FxHashMap::default()),
            next_requester: AtomicU64::new(1),
            stop: Mutex::new(false),
            wake: Condvar::new(),
            stats: Mutex::new(FxHashMap::default()),
            interval: config.render_interval,
        });

        let primary = {
            let shared = Arc::clone(&shared);
            thread::Builder::new()
                .name("mpdriver-progress-primary".into())
                .spawn(move || primary_loop(shared, requests))?
        };
        let secondary = {
            let shared = Arc::clone(&shared);
            let inbound = inbound.clone();
            thread::Builder::new()
                .name("mpdriver-progress-render".into())
                .spawn(move || secondary_loop(shared, inbound))?
        };

        tracing::debug!("Progress coordinator started");

        Ok(Self {
            inbound,
            shared,
            primary: Some(primary),
            secondary: Some(secondary),
        })
    }

    /// Register a new requester with its own reply channel.
    pub fn register(&self) -> HostTransport {
        let (tx, rx) = mpsc::channel();
        let requester = RequesterId(self.shared.next_requester.fetch_add(1, Ordering::Relaxed));
        self.shared.replies.lock().insert(requester, tx);
        HostTransport {
            requester,
            inbound: self.inbound.clone(),
            replies: Mutex::new(rx),
            shared: Arc::downgrade(&self.shared),
        }
    }

    /// A host-side handle with a freshly registered reply channel.
    pub fn handle(&self) -> ProgressHandle {
        ProgressHandle::host(Arc::new(self.register()))
    }

    pub fn stats(&self) -> CoordinatorStats {
        CoordinatorStats {
            counts: self.shared.stats.lock().clone(),
        }
    }

    /// Screen positions of live bars after the last render pass.
    pub fn positions(&self) -> Vec<(BarId, usize)> {
        self.shared.registry.lock().board.positions()
    }

    /// Number of live (instantiated) bars.
    pub fn live_bars(&self) -> usize {
        self.shared.registry.lock().board.len()
    }

    /// Number of handles with a live reply channel.
    pub fn registered_requesters(&self) -> usize {
        self.shared.replies.lock().len()
    }

    /// Whether both loops are still running.
    pub fn is_running(&self) -> bool {
        !*self.shared.stop.lock()
    }

    /// Stop both loops, close every remaining bar and clear the region.
    pub fn shutdown(&mut self) {
        if self.primary.is_none() && self.secondary.is_none() {
            return;
        }

        let _ = self.inbound.send(ProgressRequest {
            requester: INTERNAL_REQUESTER,
            bar: None,
            op: ProgressOp::Exit,
        });
        for handle in [self.primary.take(), self.secondary.take()].into_iter().flatten() {
            if handle.join().is_err() {
                tracing::error!("Progress coordinator thread panicked");
            }
        }

        let mut registry = self.shared.registry.lock();
        registry.tick();
        registry.board.close_all();
        tracing::debug!("Progress coordinator stopped");
    }
}

impl Drop for Coordinator {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn primary_loop(shared: Arc<Shared>, requests: Receiver<ProgressRequest>) {
    let _guard = LoopGuard {
        shared: Arc::clone(&shared),
        name: "primary",
        inbound: None,
    };

    while let Ok(request) = requests.recv() {
        *shared.stats.lock().entry(request.op.name()).or_insert(0) += 1;

        if let ProgressOp::Exit = request.op {
            shared.reply(request.requester, ProgressResponse::Ack);
            break;
        }

        let response = shared.registry.lock().handle(request.bar, request.op);
        shared.reply(request.requester, response);
    }
}

fn secondary_loop(shared: Arc<Shared>, inbound: Sender<ProgressRequest>) {
    let _guard = LoopGuard {
        shared: Arc::clone(&shared),
        name: "render",
        inbound: Some(inbound),
    };

    loop {
        shared.registry.lock().tick();

        let mut stop = shared.stop.lock();
        if *stop {
            break;
        }
        shared.wake.wait_for(&mut stop, shared.interval);
    }
}

/// Host-side transport: an inbound sender plus this requester's reply channel.
pub struct HostTransport {
    requester: RequesterId,
    inbound: Sender<ProgressRequest>,
    replies: Mutex<Receiver<ProgressResponse>>,
    shared: Weak<Shared>,
}

impl Transport for HostTransport {
    fn requester(&self) -> RequesterId {
        self.requester
    }

    fn call(&self, bar: Option<BarId>, op: ProgressOp) -> Result<ProgressResponse> {
        // Holding the receiver for the whole round trip keeps replies paired.
        let replies = self.replies.lock();
        self.inbound
            .send(ProgressRequest {
                requester: self.requester,
                bar,
                op,
            })
            .map_err(|_| Error::CoordinationLost("coordinator is not accepting requests".into()))?;
        replies
            .recv()
            .map_err(|_| Error::CoordinationLost("coordinator stopped before replying".into()))
    }
}

impl Drop for HostTransport {
    fn drop(&mut self) {
        if let Some(shared) = self.shared.upgrade() {
            shared.replies.lock().remove(&self.requester);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::progress::screen::RenderTarget;

    fn config() -> ProgressConfig {
        ProgressConfig {
            render_interval: Duration::from_millis(10),
            target: RenderTarget::Hidden,
            ..ProgressConfig::default()
        }
    }

    /// Wait until the render loop has instantiated `n` bars.
    fn settle(coordinator: &Coordinator, n: usize) {
        for _ in 0..500 {
            if coordinator.positions().len() == n {
                return;
            }
            thread::sleep(Duration::from_millis(5));
        }
        panic!("layout did not settle to {} bars", n);
    }

    #[test]
    fn test_priorities_order_positions() {
        let coordinator = Coordinator::spawn(&config()).unwrap();
        let handle = coordinator.handle();

        let third = handle.bar(BarOptions::new("p3").priority(3.0)).unwrap();
        let first = handle.bar(BarOptions::new("p1").priority(1.0)).unwrap();
        let second = handle.bar(BarOptions::new("p2").priority(2.0)).unwrap();
        settle(&coordinator, 3);

        let positions = coordinator.positions();
        assert_eq!(
            positions,
            vec![(first.id(), 0), (second.id(), 1), (third.id(), 2)]
        );
    }

    #[test]
    fn test_positions_contiguous_after_closes() {
        let coordinator = Coordinator::spawn(&config()).unwrap();
        let handle = coordinator.handle();

        let mut bars: Vec<_> = (0..5)
            .map(|i| handle.bar(BarOptions::new(format!("b{i}")).priority(i as f64)).unwrap())
            .collect();
        settle(&coordinator, 5);

        bars.remove(3).close().unwrap();
        bars.remove(0).close().unwrap();
        settle(&coordinator, 3);

        let positions: Vec<usize> = coordinator.positions().iter().map(|(_, p)| *p).collect();
        assert_eq!(positions, vec![0, 1, 2]);
        assert_eq!(coordinator.live_bars(), 3);
    }

    #[test]
    fn test_mutations_on_pending_bar_are_replayed() {
        let coordinator = Coordinator::spawn(&config()).unwrap();
        let handle = coordinator.handle();

        let bar = handle.bar(BarOptions::new("fresh").total(10)).unwrap();
        bar.update(4).unwrap();
        bar.set_description("renamed").unwrap();
        settle(&coordinator, 1);

        // Reads reflect the last applied tick, which may trail the settle.
        let deadline = Instant::now() + Duration::from_secs(5);
        while bar.count().unwrap() != 4 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(bar.count().unwrap(), 4);
        assert_eq!(
            bar.get(BarAttr::Description).unwrap(),
            BarValue::Description("renamed".into())
        );
    }

    #[test]
    fn test_unknown_bar_and_rejected_position() {
        let coordinator = Coordinator::spawn(&config()).unwrap();
        let transport = coordinator.register();

        let response = transport
            .call(Some(BarId(999)), ProgressOp::Update { delta: 1 })
            .unwrap();
        assert_eq!(response, ProgressResponse::UnknownBar(BarId(999)));

        let Ok(ProgressResponse::Created(id)) =
            transport.call(None, ProgressOp::Create(BarOptions::default()))
        else {
            panic!("expected a created bar");
        };
        let response = transport
            .call(Some(id), ProgressOp::SetAttr(BarValue::Position(Some(0))))
            .unwrap();
        assert!(matches!(response, ProgressResponse::Rejected(_)));
    }

    #[test]
    fn test_bar_ids_are_not_reused() {
        let coordinator = Coordinator::spawn(&config()).unwrap();
        let handle = coordinator.handle();

        let a = handle.bar(BarOptions::default()).unwrap();
        let a_id = a.id();
        a.close().unwrap();
        let b = handle.bar(BarOptions::default()).unwrap();
        assert!(b.id() > a_id);
    }

    #[test]
    fn test_handles_fail_after_shutdown() {
        let mut coordinator = Coordinator::spawn(&config()).unwrap();
        let handle = coordinator.handle();
        coordinator.shutdown();

        let err = handle.bar(BarOptions::default()).unwrap_err();
        assert!(err.is_coordination_lost(), "{err}");
        assert!(!coordinator.is_running());
    }

    #[test]
    fn test_dropped_handles_unregister() {
        let coordinator = Coordinator::spawn(&config()).unwrap();
        let before = coordinator.registered_requesters();

        for _ in 0..10 {
            let handle = coordinator.handle();
            handle.write("x").unwrap();
        }
        let transport = coordinator.register();
        assert_eq!(coordinator.registered_requesters(), before + 1);

        drop(transport);
        assert_eq!(coordinator.registered_requesters(), before);
    }

    #[test]
    fn test_write_reaches_screen() {
        let buffer = crate::progress::screen::SharedBuffer::new();
        let config = ProgressConfig {
            target: RenderTarget::Buffer(buffer.clone()),
            ..config()
        };
        let coordinator = Coordinator::spawn(&config).unwrap();
        coordinator.handle().write("skip at /tmp/a").unwrap();

        assert!(buffer.contents().contains("skip at /tmp/a"));
    }
}
