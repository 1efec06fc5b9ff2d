use std::collections::HashMap;
use std::fs;
use std::io::{self, BufRead, BufReader};
use std::net::{SocketAddr, ToSocketAddrs};
use std::path::{Path, PathBuf};
use std::thread;

use crossbeam_channel::{select, unbounded, Receiver, Sender};
use log::{debug, error, info, warn};

use crate::listener::Listener;
use crate::message::{self, Command, StatusReport, WordRecord};
use crate::phase::Phase;
use crate::WORKER_SHUFFLE_PORT;

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Identity used in status reports until the master assigns one via
    /// `SelfInfo`. The launcher passes the same string it keeps in its
    /// roster, so the handshake barrier can account for this worker from
    /// the very first report.
    pub id: String,
    /// Interface to bind the command and shuffle listeners on.
    pub bind_ip: String,
    /// Port for commands from the master. 0 picks an ephemeral port.
    pub status_port: u16,
    /// Port for shuffle payloads from peers. 0 picks an ephemeral port.
    pub shuffle_port: u16,
    /// Directory holding this worker's shard files (`S*.txt`).
    pub splits_dir: PathBuf,
}

/// Completion signals from the phase threads back into the command loop,
/// so all phase transitions happen on one thread.
enum LocalEvent {
    MappingDone,
    ShuffleDrained,
    ReduceDone(HashMap<String, u64>),
    ResultsSent,
}

/// Per-worker state machine. Reacts to each command from the master,
/// advances its phase monotonically and reports every applied transition.
pub struct Worker {
    cfg: WorkerConfig,
    phase: Phase,
    id: String,
    has_shard: bool,
    domain: String,
    master: Option<(String, u16)>,
    roster: Vec<String>,
    peers: HashMap<String, SocketAddr>,
    counts: HashMap<String, u64>,
    /// Producer half of the mapped-word queue, handed to the mapping
    /// thread. Dropping it is the mapping-done signal the shuffle drain
    /// quiesces on.
    mapped_tx: Option<Sender<String>>,
    mapped_rx: Option<Receiver<String>>,
    shuffle_listener: Option<Listener<WordRecord>>,
    events: Sender<LocalEvent>,
}

impl Worker {
    fn new(cfg: WorkerConfig, events: Sender<LocalEvent>) -> Self {
        let (mapped_tx, mapped_rx) = unbounded();
        Worker {
            id: cfg.id.clone(),
            cfg,
            phase: Phase::Idle,
            has_shard: false,
            domain: String::new(),
            master: None,
            roster: Vec::new(),
            peers: HashMap::new(),
            counts: HashMap::new(),
            mapped_tx: Some(mapped_tx),
            mapped_rx: Some(mapped_rx),
            shuffle_listener: None,
            events,
        }
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// Apply a transition only if it moves forward. Out-of-order
    /// completions (a late `MappingDone` after the shuffle already
    /// reported `WaitingReduce`) are dropped here.
    fn set_phase(&mut self, phase: Phase) -> bool {
        if phase.rank() <= self.phase.rank() {
            debug!(
                "{}: ignoring stale transition to {phase:?} at {:?}",
                self.id, self.phase
            );
            return false;
        }
        info!("{}: {:?} -> {:?}", self.id, self.phase, phase);
        self.phase = phase;
        true
    }

    fn advance(&mut self, phase: Phase) {
        if self.set_phase(phase) {
            self.send_status();
        }
    }

    fn send_status(&self) {
        let Some((addr, port)) = &self.master else {
            debug!("{}: master unknown, status not reported", self.id);
            return;
        };
        let report = StatusReport {
            sender: self.id.clone(),
            phase: self.phase,
        };
        if let Err(e) = message::send_message((addr.as_str(), *port), &report) {
            warn!("{}: status report failed: {e}", self.id);
        }
    }

    fn handle_command(&mut self, command: Command) {
        match command {
            Command::MasterInfo {
                address,
                status_port,
            } => {
                self.master = Some((address, status_port));
                self.advance(Phase::MasterInfoReceived);
            }
            Command::SelfInfo {
                worker_id,
                has_shard,
                domain,
            } => {
                self.id = worker_id;
                self.has_shard = has_shard;
                self.domain = domain;
                self.advance(Phase::MyInfoReceived);
            }
            Command::WorkerList { workers } => {
                self.roster = workers;
                self.resolve_peers();
                self.advance(Phase::SlavesInfoReceived);
            }
            Command::Interconnect => {
                self.start_shuffle_listener();
                if self.has_shard {
                    self.advance(Phase::Interconnected);
                } else {
                    self.advance(Phase::WaitingReduce);
                }
            }
            Command::ShuffleOn => {
                if self.has_shard {
                    self.start_shuffling();
                    self.advance(Phase::ShuffleOn);
                } else {
                    self.advance(Phase::WaitingReduce);
                }
            }
            Command::Map => {
                if self.has_shard {
                    self.start_mapping();
                    self.advance(Phase::Mapping);
                } else {
                    self.advance(Phase::WaitingReduce);
                }
            }
            Command::Reduce => {
                self.start_reducing();
                self.advance(Phase::Reducing);
            }
            Command::SendResults { result_port } => {
                self.start_sending_results(result_port);
                self.advance(Phase::SendingResults);
            }
        }
    }

    fn handle_event(&mut self, event: LocalEvent) {
        match event {
            LocalEvent::MappingDone => self.advance(Phase::MappingDone),
            LocalEvent::ShuffleDrained => self.advance(Phase::WaitingReduce),
            LocalEvent::ReduceDone(counts) => {
                self.counts = counts;
                self.advance(Phase::ReduceDone);
            }
            LocalEvent::ResultsSent => self.advance(Phase::Terminated),
        }
    }

    /// Resolve every roster entry's shuffle address up front. A peer that
    /// does not resolve stays absent from the map: every word hashed to it
    /// will be dropped at shuffle time, so shout now.
    fn resolve_peers(&mut self) {
        for id in &self.roster {
            match resolve_worker_addr(id, &self.domain) {
                Some(addr) => {
                    self.peers.insert(id.clone(), addr);
                }
                None => error!(
                    "{}: cannot resolve shuffle address of {id}; words routed to it will be lost",
                    self.id
                ),
            }
        }
    }

    fn start_shuffle_listener(&mut self) {
        if self.shuffle_listener.is_some() {
            return;
        }
        match Listener::start((self.cfg.bind_ip.as_str(), self.cfg.shuffle_port), "shuffle") {
            Ok(listener) => self.shuffle_listener = Some(listener),
            Err(e) => error!("{}: cannot open shuffle port: {e}", self.id),
        }
    }

    /// Drain the mapped-word queue to the designated reducers. Runs until
    /// the mapping thread drops its sender and the queue is empty, then
    /// reports WaitingReduce.
    fn start_shuffling(&mut self) {
        let Some(words) = self.mapped_rx.take() else {
            warn!("{}: shuffle already running", self.id);
            return;
        };
        let router = crate::shuffle::ShuffleRouter::new(self.roster.clone(), self.peers.clone());
        let events = self.events.clone();
        let spawned = thread::Builder::new().name("shuffle".into()).spawn(move || {
            router.drain(words);
            let _ = events.send(LocalEvent::ShuffleDrained);
        });
        if let Err(e) = spawned {
            error!("{}: cannot start shuffle thread: {e}", self.id);
        }
    }

    /// Read the local shard files and push every word onto the mapped
    /// queue. The sender is moved into the thread so its drop marks
    /// mapping completion for the shuffle drain.
    fn start_mapping(&mut self) {
        let Some(out) = self.mapped_tx.take() else {
            warn!("{}: mapping already started", self.id);
            return;
        };
        let dir = self.cfg.splits_dir.clone();
        let id = self.id.clone();
        let events = self.events.clone();
        let spawned = thread::Builder::new().name("mapping".into()).spawn(move || {
            if let Err(e) = map_shard_files(&dir, &out) {
                // Fatal for this worker's mapping: its words are gone.
                error!("{id}: failed to read shards in {}: {e}", dir.display());
            }
            drop(out);
            let _ = events.send(LocalEvent::MappingDone);
        });
        if let Err(e) = spawned {
            error!("{}: cannot start mapping thread: {e}", self.id);
        }
    }

    /// Consume every shuffle payload and fold it into the count table.
    /// The master only issues Reduce once every worker passed
    /// WaitingReduce, so all peer sends have completed; stopping the
    /// listener drains its backlog and then disconnects the queue, which
    /// is the quiescence signal.
    fn start_reducing(&mut self) {
        let Some(mut listener) = self.shuffle_listener.take() else {
            warn!("{}: no shuffle listener to reduce from", self.id);
            let _ = self.events.send(LocalEvent::ReduceDone(HashMap::new()));
            return;
        };
        // Words still sitting in the local mapped queue were never shuffled
        // (no-shard workers never start the drain); count them as well.
        let leftovers = self.mapped_rx.take();
        let events = self.events.clone();
        let spawned = thread::Builder::new().name("reducing".into()).spawn(move || {
            listener.stop();
            let mut counts: HashMap<String, u64> = HashMap::new();
            for record in listener.receiver().iter() {
                *counts.entry(record.word).or_insert(0) += record.count;
            }
            listener.join();
            if let Some(rx) = leftovers {
                for word in rx.try_iter() {
                    *counts.entry(word).or_insert(0) += 1;
                }
            }
            let _ = events.send(LocalEvent::ReduceDone(counts));
        });
        if let Err(e) = spawned {
            error!("{}: cannot start reduce thread: {e}", self.id);
        }
    }

    /// One WordRecord per aggregated entry, delivered to the master's
    /// result port, then Terminated.
    fn start_sending_results(&mut self, result_port: u16) {
        let Some((address, _)) = self.master.clone() else {
            error!("{}: asked for results before MasterInfo", self.id);
            return;
        };
        let counts = std::mem::take(&mut self.counts);
        let id = self.id.clone();
        let events = self.events.clone();
        let spawned = thread::Builder::new().name("results".into()).spawn(move || {
            for (word, count) in counts {
                let record = WordRecord { word, count };
                if let Err(e) = message::send_message((address.as_str(), result_port), &record) {
                    warn!("{id}: result for {:?} lost: {e}", record.word);
                }
            }
            let _ = events.send(LocalEvent::ResultsSent);
        });
        if let Err(e) = spawned {
            error!("{}: cannot start result thread: {e}", self.id);
        }
    }
}

/// Shuffle address of a roster entry. Entries carrying an explicit
/// `host:port` are used as-is; bare hostnames get the run's domain suffix
/// and the default shuffle port, as the deployed cluster names its nodes.
pub fn resolve_worker_addr(id: &str, domain: &str) -> Option<SocketAddr> {
    let target = if id.contains(':') {
        id.to_string()
    } else {
        format!("{id}{domain}:{WORKER_SHUFFLE_PORT}")
    };
    match target.to_socket_addrs() {
        Ok(mut addrs) => addrs.next(),
        Err(e) => {
            warn!("lookup of {target} failed: {e}");
            None
        }
    }
}

fn map_shard_files(dir: &Path, out: &Sender<String>) -> io::Result<()> {
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        let is_shard = path.is_file()
            && path
                .file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|n| n.starts_with('S'));
        if !is_shard {
            continue;
        }
        let reader = BufReader::new(fs::File::open(&path)?);
        for line in reader.lines() {
            for word in line?.split_whitespace() {
                if out.send(word.to_string()).is_err() {
                    return Ok(()); // shuffle side is gone, nothing left to feed
                }
            }
        }
    }
    Ok(())
}

/// Run a worker process to completion: listen for commands, feed the state
/// machine, exit once Terminated.
pub fn run(cfg: WorkerConfig) -> anyhow::Result<()> {
    let command_listener: Listener<Command> =
        Listener::start((cfg.bind_ip.as_str(), cfg.status_port), "commands")?;
    info!(
        "worker {} accepting commands on {}",
        cfg.id,
        command_listener.local_addr()
    );
    let commands = command_listener.receiver();

    let (event_tx, event_rx) = unbounded();
    let mut worker = Worker::new(cfg, event_tx);

    loop {
        select! {
            recv(commands) -> msg => match msg {
                Ok(command) => worker.handle_command(command),
                Err(_) => break,
            },
            recv(event_rx) -> event => {
                if let Ok(event) = event {
                    worker.handle_event(event);
                }
            }
        }
        if worker.phase() == Phase::Terminated {
            break;
        }
    }

    command_listener.stop();
    info!("worker {} terminated", worker.id);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config() -> WorkerConfig {
        WorkerConfig {
            id: "w0".to_string(),
            bind_ip: "127.0.0.1".to_string(),
            status_port: 0,
            shuffle_port: 0,
            splits_dir: PathBuf::from("."),
        }
    }

    fn test_worker() -> (Worker, Receiver<LocalEvent>) {
        let (tx, rx) = unbounded();
        (Worker::new(test_config(), tx), rx)
    }

    #[test]
    fn phase_only_moves_forward() {
        let (mut worker, _events) = test_worker();
        assert!(worker.set_phase(Phase::MasterInfoReceived));
        assert!(worker.set_phase(Phase::SlavesInfoReceived));
        // Same rank and lower rank are both rejected.
        assert!(!worker.set_phase(Phase::SlavesInfoReceived));
        assert!(!worker.set_phase(Phase::MasterInfoReceived));
        assert_eq!(worker.phase(), Phase::SlavesInfoReceived);
    }

    #[test]
    fn late_mapping_done_is_a_no_op() {
        let (mut worker, _events) = test_worker();
        assert!(worker.set_phase(Phase::WaitingReduce));
        worker.handle_event(LocalEvent::MappingDone);
        assert_eq!(worker.phase(), Phase::WaitingReduce);
    }

    #[test]
    fn worker_without_shard_skips_map_and_shuffle() {
        // A stand-in master inbox so status sends have somewhere to go.
        let master: Listener<StatusReport> = Listener::start("127.0.0.1:0", "status").unwrap();
        let (mut worker, events) = test_worker();

        worker.handle_command(Command::MasterInfo {
            address: "127.0.0.1".to_string(),
            status_port: master.port(),
        });
        worker.handle_command(Command::SelfInfo {
            worker_id: "w0".to_string(),
            has_shard: false,
            domain: String::new(),
        });
        worker.handle_command(Command::WorkerList {
            workers: vec!["w0".to_string()],
        });

        worker.handle_command(Command::Interconnect);
        assert_eq!(worker.phase(), Phase::WaitingReduce);
        worker.handle_command(Command::ShuffleOn);
        worker.handle_command(Command::Map);
        assert_eq!(worker.phase(), Phase::WaitingReduce);
        // No mapping or shuffle thread was started.
        assert!(events.is_empty());

        // The master saw a strictly increasing prefix of the lifecycle.
        let inbox = master.receiver();
        let mut last_rank = 0;
        for _ in 0..4 {
            let report = inbox.recv().unwrap();
            assert_eq!(report.sender, "w0");
            assert!(report.phase.rank() > last_rank);
            last_rank = report.phase.rank();
        }
    }

    #[test]
    fn reduce_folds_shuffle_payloads_and_duplicates() {
        let (mut worker, events) = test_worker();
        worker.handle_command(Command::Interconnect);
        let shuffle_addr = worker.shuffle_listener.as_ref().unwrap().local_addr();

        for record in [
            WordRecord::single("the"),
            WordRecord::single("cat"),
            WordRecord::single("the"),
        ] {
            message::send_message(shuffle_addr, &record).unwrap();
        }
        // Wait until all three made it into the queue before reducing.
        while worker.shuffle_listener.as_ref().unwrap().receiver().len() < 3 {
            thread::yield_now();
        }

        worker.handle_command(Command::Reduce);
        assert_eq!(worker.phase(), Phase::Reducing);
        match events.recv().unwrap() {
            LocalEvent::ReduceDone(counts) => {
                assert_eq!(counts.get("the"), Some(&2));
                assert_eq!(counts.get("cat"), Some(&1));
                assert_eq!(counts.len(), 2);
            }
            _ => panic!("expected ReduceDone"),
        }
    }

    #[test]
    fn roster_entries_with_ports_resolve_directly() {
        let addr = resolve_worker_addr("127.0.0.1:4000", ".example.org").unwrap();
        assert_eq!(addr.port(), 4000);
    }

    #[test]
    fn mapping_splits_shards_into_words() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("S0.txt"), "the cat\nthe dog\n").unwrap();
        fs::write(dir.path().join("ignored.txt"), "not a shard").unwrap();

        let (tx, rx) = unbounded();
        map_shard_files(dir.path(), &tx).unwrap();
        drop(tx);

        let mut words: Vec<String> = rx.iter().collect();
        words.sort();
        assert_eq!(words, ["cat", "dog", "the", "the"]);
    }
}
