use std::collections::HashMap;
use std::net::TcpStream;
use std::path::PathBuf;
use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use std::time::Duration;

use log::{debug, info, warn};

use crate::listener::{spawn_dispatcher, Listener};
use crate::message::{self, Command, StatusReport};
use crate::phase::Phase;
use crate::results::ResultAggregator;

/// One worker as the master sees it.
#[derive(Debug, Clone)]
pub struct WorkerSpec {
    pub id: String,
    /// Where commands for this worker are sent, `host:port`.
    pub command_addr: String,
    /// Whether an input shard was assigned to it.
    pub has_shard: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct WorkerEntry {
    phase: Phase,
    has_shard: bool,
}

struct ViewInner {
    workers: HashMap<String, WorkerEntry>,
    /// Cleared by `inhibit`, after which barriers stop blocking.
    waiting_enabled: bool,
}

impl ViewInner {
    fn all_at_least(&self, target: Phase) -> bool {
        self.workers.values().all(|e| e.phase.rank() >= target.rank())
    }
}

/// The master's view of every worker's last reported phase. Written only
/// by the status dispatcher, read by the barrier; each mutation wakes the
/// barrier so it never has to poll.
pub struct ClusterView {
    inner: Mutex<ViewInner>,
    barrier: Condvar,
}

impl ClusterView {
    pub fn new(workers: &[WorkerSpec]) -> Self {
        let workers = workers
            .iter()
            .map(|w| {
                (
                    w.id.clone(),
                    WorkerEntry {
                        phase: Phase::Idle,
                        has_shard: w.has_shard,
                    },
                )
            })
            .collect();
        ClusterView {
            inner: Mutex::new(ViewInner {
                workers,
                waiting_enabled: true,
            }),
            barrier: Condvar::new(),
        }
    }

    /// Apply a status report. Reports from unknown workers and reports
    /// that do not move the phase forward are discarded; per-worker phase
    /// monotonicity is enforced here, on the only mutation path.
    pub fn update(&self, report: &StatusReport) -> bool {
        let mut inner = self.inner.lock().unwrap();
        match inner.workers.get_mut(&report.sender) {
            Some(entry) if report.phase.rank() > entry.phase.rank() => {
                debug!("{} reached {:?}", report.sender, report.phase);
                entry.phase = report.phase;
                self.barrier.notify_all();
                true
            }
            Some(entry) => {
                debug!(
                    "discarding stale report {:?} from {} (at {:?})",
                    report.phase, report.sender, entry.phase
                );
                false
            }
            None => {
                warn!("status report from unknown worker {}", report.sender);
                false
            }
        }
    }

    /// Block until every tracked worker has reported a phase of rank at
    /// least `target`'s, or until `inhibit` releases all barriers. There
    /// is no timeout; a worker that never reports stalls the run.
    pub fn wait_for_global_status(&self, target: Phase) {
        let mut inner = self.inner.lock().unwrap();
        while inner.waiting_enabled && !inner.all_at_least(target) {
            inner = self.barrier.wait(inner).unwrap();
        }
        if inner.all_at_least(target) {
            info!("all workers at least at {target:?}");
        }
    }

    /// Permanently disable barrier blocking. Called once every phase is
    /// known complete, so no later check can hang.
    pub fn inhibit(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.waiting_enabled = false;
        self.barrier.notify_all();
    }

    pub fn phase_of(&self, id: &str) -> Option<Phase> {
        self.inner.lock().unwrap().workers.get(id).map(|e| e.phase)
    }

    /// Workers that were assigned an input shard, the only ones that take
    /// part in shuffle and map.
    pub fn shard_holders(&self) -> Vec<String> {
        self.inner
            .lock()
            .unwrap()
            .workers
            .iter()
            .filter(|(_, e)| e.has_shard)
            .map(|(id, _)| id.clone())
            .collect()
    }
}

#[derive(Debug, Clone)]
pub struct MasterConfig {
    /// Interface the status and result listeners bind on.
    pub bind_ip: String,
    /// Address workers dial back to, pushed in `MasterInfo`.
    pub advertised_ip: String,
    /// 0 picks an ephemeral port.
    pub status_port: u16,
    pub result_port: u16,
    /// Domain suffix workers append to bare roster hostnames.
    pub domain: String,
    pub workers: Vec<WorkerSpec>,
    pub output_path: PathBuf,
}

/// Sequences the run: handshake, then one command broadcast per phase,
/// each followed by a barrier on the matching status.
pub struct Master {
    cfg: MasterConfig,
    view: Arc<ClusterView>,
    status_port: u16,
}

impl Master {
    fn send_command(&self, spec: &WorkerSpec, command: &Command) {
        debug!("sending {command:?} to {}", spec.id);
        if let Err(e) = message::send_message(spec.command_addr.as_str(), command) {
            warn!("command to {} ({}) failed: {e}", spec.id, spec.command_addr);
        }
    }

    fn broadcast(&self, command: &Command) {
        for spec in &self.cfg.workers {
            self.send_command(spec, command);
        }
    }

    /// Retry until the worker's command port accepts a connection. The
    /// probe connection carries no message and is skipped by the worker's
    /// listener.
    fn wait_for_socket_open(&self, spec: &WorkerSpec) {
        loop {
            match TcpStream::connect(spec.command_addr.as_str()) {
                Ok(_) => return,
                Err(e) => {
                    debug!("{} not reachable yet: {e}", spec.id);
                    thread::sleep(Duration::from_millis(100));
                }
            }
        }
    }

    /// Handshake: master info, per-worker identity and role, full roster.
    /// Each step is barriered before the next one depends on its effects,
    /// so rosters and resolved addresses are written before any later
    /// phase reads them.
    fn set_up_connections(&self) {
        for spec in &self.cfg.workers {
            info!("connecting with {}", spec.id);
            self.wait_for_socket_open(spec);
        }

        self.broadcast(&Command::MasterInfo {
            address: self.cfg.advertised_ip.clone(),
            status_port: self.status_port,
        });
        self.view.wait_for_global_status(Phase::MasterInfoReceived);

        for spec in &self.cfg.workers {
            self.send_command(
                spec,
                &Command::SelfInfo {
                    worker_id: spec.id.clone(),
                    has_shard: spec.has_shard,
                    domain: self.cfg.domain.clone(),
                },
            );
        }
        self.view.wait_for_global_status(Phase::MyInfoReceived);

        let roster: Vec<String> = self.cfg.workers.iter().map(|w| w.id.clone()).collect();
        self.broadcast(&Command::WorkerList { workers: roster });
        self.view.wait_for_global_status(Phase::SlavesInfoReceived);
    }

    fn interconnect(&self) {
        self.broadcast(&Command::Interconnect);
        // Workers without a shard report WaitingReduce here, whose rank is
        // higher, so the real predicate is "Interconnected or later".
        self.view.wait_for_global_status(Phase::Interconnected);
    }

    fn begin_shuffle(&self) {
        let holders = self.view.shard_holders();
        for spec in self.cfg.workers.iter().filter(|w| holders.contains(&w.id)) {
            self.send_command(spec, &Command::ShuffleOn);
        }
        self.view.wait_for_global_status(Phase::ShuffleOn);
    }

    /// Mapping and shuffling overlap; a shard holder reaches WaitingReduce
    /// only once both have finished, so this barrier covers the whole
    /// map+shuffle stage.
    fn begin_map(&self) {
        self.broadcast(&Command::Map);
        self.view.wait_for_global_status(Phase::WaitingReduce);
    }

    fn begin_reduce(&self) {
        self.broadcast(&Command::Reduce);
        self.view.wait_for_global_status(Phase::ReduceDone);
    }

    fn request_results(&self, result_port: u16) {
        self.broadcast(&Command::SendResults { result_port });
        self.view.wait_for_global_status(Phase::Terminated);
    }
}

/// Drive a full run and return the aggregated word counts.
pub fn run(cfg: MasterConfig) -> anyhow::Result<HashMap<String, u64>> {
    let status_listener: Listener<StatusReport> =
        Listener::start((cfg.bind_ip.as_str(), cfg.status_port), "status")?;
    info!("master receiving statuses on {}", status_listener.local_addr());

    let view = Arc::new(ClusterView::new(&cfg.workers));
    let updates = Arc::clone(&view);
    let dispatcher = spawn_dispatcher("status", status_listener.receiver(), move |report| {
        updates.update(&report);
    })?;

    let master = Master {
        status_port: status_listener.port(),
        view: Arc::clone(&view),
        cfg,
    };

    master.set_up_connections();
    master.interconnect();
    master.begin_shuffle();
    master.begin_map();
    master.begin_reduce();

    let aggregator = ResultAggregator::start(
        &master.cfg.bind_ip,
        master.cfg.result_port,
        &master.cfg.output_path,
    )?;
    master.request_results(aggregator.port());

    // Every phase is complete: release the barrier for good and shut the
    // status path down, draining whatever is still queued.
    view.inhibit();
    status_listener.stop();
    if dispatcher.join().is_err() {
        warn!("status dispatcher panicked");
    }

    aggregator.finish()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossbeam_channel::unbounded;

    fn spec(id: &str, has_shard: bool) -> WorkerSpec {
        WorkerSpec {
            id: id.to_string(),
            command_addr: "127.0.0.1:0".to_string(),
            has_shard,
        }
    }

    fn report(sender: &str, phase: Phase) -> StatusReport {
        StatusReport {
            sender: sender.to_string(),
            phase,
        }
    }

    #[test]
    fn update_is_monotonic_per_worker() {
        let view = ClusterView::new(&[spec("a", true)]);
        assert!(view.update(&report("a", Phase::Reducing)));
        assert!(view.update(&report("a", Phase::ReduceDone)));
        // Duplicate and regression are both no-ops.
        assert!(!view.update(&report("a", Phase::ReduceDone)));
        assert!(!view.update(&report("a", Phase::Reducing)));
        assert_eq!(view.phase_of("a"), Some(Phase::ReduceDone));
    }

    #[test]
    fn unknown_sender_is_discarded() {
        let view = ClusterView::new(&[spec("a", true)]);
        assert!(!view.update(&report("stranger", Phase::Mapping)));
        assert_eq!(view.phase_of("stranger"), None);
    }

    #[test]
    fn barrier_releases_only_after_the_last_worker() {
        let view = Arc::new(ClusterView::new(&[spec("a", true), spec("b", false)]));
        let (done_tx, done_rx) = unbounded();

        let waiter = Arc::clone(&view);
        thread::spawn(move || {
            waiter.wait_for_global_status(Phase::ReduceDone);
            done_tx.send(()).unwrap();
        });

        view.update(&report("a", Phase::ReduceDone));
        // One worker below target: the barrier must still hold.
        assert!(done_rx.recv_timeout(Duration::from_millis(200)).is_err());

        view.update(&report("b", Phase::ReduceDone));
        assert!(done_rx.recv_timeout(Duration::from_secs(5)).is_ok());
    }

    #[test]
    fn higher_rank_satisfies_the_barrier() {
        // A no-shard worker sitting at WaitingReduce passes a barrier on
        // Interconnected.
        let view = ClusterView::new(&[spec("a", false)]);
        view.update(&report("a", Phase::WaitingReduce));
        view.wait_for_global_status(Phase::Interconnected); // must not block
    }

    #[test]
    fn inhibit_releases_a_blocked_barrier() {
        let view = Arc::new(ClusterView::new(&[spec("a", true)]));
        let (done_tx, done_rx) = unbounded();

        let waiter = Arc::clone(&view);
        thread::spawn(move || {
            waiter.wait_for_global_status(Phase::Terminated);
            done_tx.send(()).unwrap();
        });

        view.inhibit();
        assert!(done_rx.recv_timeout(Duration::from_secs(5)).is_ok());
    }
}
