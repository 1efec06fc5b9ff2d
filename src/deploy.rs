use std::collections::VecDeque;
use std::fs::{self, File};
use std::io::{self, BufRead, BufReader, BufWriter, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::path::Path;
use std::process::{Command, ExitStatus};
use std::thread;
use std::time::{Duration, Instant};

use log::{info, warn};

/// At most this many external commands (probes, ssh, scp) per window.
pub const MAX_COMMANDS_PER_WINDOW: usize = 10;
pub const COMMAND_WINDOW: Duration = Duration::from_millis(61_000);

const PROBE_TIMEOUT: Duration = Duration::from_secs(5);
const SSH_PORT: u16 = 22;

/// Rolling-window limiter for externally executed commands. Callers over
/// the budget sleep until the oldest timestamp leaves the window.
pub struct RateLimiter {
    max: usize,
    window: Duration,
    stamps: VecDeque<Instant>,
}

impl RateLimiter {
    pub fn new(max: usize, window: Duration) -> Self {
        RateLimiter {
            max,
            window,
            stamps: VecDeque::new(),
        }
    }

    pub fn acquire(&mut self) {
        let now = Instant::now();
        while self
            .stamps
            .front()
            .is_some_and(|&t| now.duration_since(t) >= self.window)
        {
            self.stamps.pop_front();
        }
        if self.stamps.len() >= self.max {
            if let Some(oldest) = self.stamps.pop_front() {
                let wait = self.window.saturating_sub(oldest.elapsed());
                if !wait.is_zero() {
                    info!("command budget exhausted, waiting {}ms", wait.as_millis());
                    thread::sleep(wait);
                }
            }
        }
        self.stamps.push_back(Instant::now());
    }
}

/// Probe a host's SSH port, through the limiter. The only timed connect in
/// the system; everything past provisioning waits forever.
pub fn is_machine_reachable(limiter: &mut RateLimiter, host: &str) -> bool {
    limiter.acquire();
    let target = format!("{host}:{SSH_PORT}");
    let Some(addr) = target.to_socket_addrs().ok().and_then(|mut a| a.next()) else {
        warn!("cannot resolve {target}");
        return false;
    };
    TcpStream::connect_timeout(&addr, PROBE_TIMEOUT).is_ok()
}

/// Read candidate hostnames (one per line) and keep the first `max`
/// reachable ones.
pub fn load_reachable_hosts(
    path: &Path,
    domain: &str,
    max: usize,
    limiter: &mut RateLimiter,
) -> io::Result<Vec<String>> {
    let mut hosts = Vec::new();
    let reader = BufReader::new(File::open(path)?);
    for line in reader.lines() {
        if hosts.len() >= max {
            break;
        }
        let host = line?.trim().to_string();
        if host.is_empty() {
            continue;
        }
        if is_machine_reachable(limiter, &format!("{host}{domain}")) {
            info!("machine {host} - OK");
            hosts.push(host);
        } else {
            info!("skipping {host} - not reachable");
        }
    }
    Ok(hosts)
}

/// Split the input into up to `max_shards` files named `S<i>.txt`, dealing
/// whole lines round-robin. Fewer lines than workers means fewer shards.
/// Existing shard files are removed first. Returns how many shards were
/// written.
pub fn split_input(input: &Path, splits_dir: &Path, max_shards: usize) -> io::Result<usize> {
    fs::create_dir_all(splits_dir)?;
    for entry in fs::read_dir(splits_dir)? {
        let path = entry?.path();
        if path.is_file() {
            fs::remove_file(path)?;
        }
    }

    let reader = BufReader::new(File::open(input)?);
    let mut writers: Vec<BufWriter<File>> = Vec::new();
    for (i, line) in reader.lines().enumerate() {
        let line = line?;
        if writers.len() < max_shards {
            let path = splits_dir.join(format!("S{}.txt", writers.len()));
            writers.push(BufWriter::new(File::create(path)?));
        }
        let slot = i % writers.len();
        writeln!(writers[slot], "{line}")?;
    }
    for writer in &mut writers {
        writer.flush()?;
    }
    info!("{} splits used", writers.len());
    Ok(writers.len())
}

/// Pushes shards and the worker binary to remote machines over ssh/scp and
/// launches them. Best-effort: a failed step is logged and skipped; the
/// protocol will stall on a worker that never came up, which is the
/// documented failure mode.
pub struct Deployer {
    pub user: String,
    pub domain: String,
    pub limiter: RateLimiter,
}

impl Deployer {
    fn remote(&self, host: &str) -> String {
        format!("{}@{}{}", self.user, host, self.domain)
    }

    fn work_dir(&self) -> String {
        format!("/tmp/{}/distwc", self.user)
    }

    fn execute(&mut self, command: &mut Command) -> io::Result<ExitStatus> {
        self.limiter.acquire();
        command.status()
    }

    fn ssh(&mut self, host: &str, remote_cmd: &str) -> bool {
        let remote = self.remote(host);
        let status = self.execute(
            Command::new("ssh")
                .args(["-o", "StrictHostKeyChecking=no"])
                .arg(&remote)
                .arg(remote_cmd),
        );
        match status {
            Ok(s) if s.success() => true,
            Ok(s) => {
                warn!("ssh to {remote} exited with {s}: {remote_cmd}");
                false
            }
            Err(e) => {
                warn!("ssh to {remote} failed: {e}");
                false
            }
        }
    }

    fn scp(&mut self, local: &Path, host: &str, remote_path: &str) -> bool {
        let destination = format!("{}:{remote_path}", self.remote(host));
        let status = self.execute(
            Command::new("scp")
                .args(["-o", "StrictHostKeyChecking=no"])
                .arg(local)
                .arg(&destination),
        );
        match status {
            Ok(s) if s.success() => true,
            Ok(s) => {
                warn!("scp {} to {destination} exited with {s}", local.display());
                false
            }
            Err(e) => {
                warn!("scp {} to {destination} failed: {e}", local.display());
                false
            }
        }
    }

    /// Recreate the remote work directory.
    pub fn clean_worker_dir(&mut self, host: &str) -> bool {
        let dir = self.work_dir();
        self.ssh(host, &format!("rm -rf {dir} && mkdir -p {dir}/splits"))
    }

    pub fn send_shard(&mut self, host: &str, shard: &Path) -> bool {
        let dir = self.work_dir();
        self.scp(shard, host, &format!("{dir}/splits/"))
    }

    pub fn send_binary(&mut self, host: &str, binary: &Path) -> bool {
        let dir = self.work_dir();
        self.scp(binary, host, &format!("{dir}/distwc"))
    }

    /// Launch the worker in the background with the identity the master
    /// keeps in its roster.
    pub fn launch_worker(&mut self, host: &str) -> bool {
        let dir = self.work_dir();
        self.ssh(
            host,
            &format!(
                "cd {dir} && nohup ./distwc worker --id {host} --splits-dir splits \
                 >worker.log 2>&1 &"
            ),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rate_limiter_delays_once_budget_is_spent() {
        let window = Duration::from_millis(150);
        let mut limiter = RateLimiter::new(2, window);
        let start = Instant::now();
        limiter.acquire();
        limiter.acquire();
        limiter.acquire(); // third must wait for the first to expire
        assert!(start.elapsed() >= window - Duration::from_millis(10));
    }

    #[test]
    fn rate_limiter_is_free_under_budget() {
        let mut limiter = RateLimiter::new(3, Duration::from_secs(60));
        let start = Instant::now();
        limiter.acquire();
        limiter.acquire();
        assert!(start.elapsed() < Duration::from_millis(100));
    }

    #[test]
    fn split_deals_lines_round_robin() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("input.txt");
        fs::write(&input, "one\ntwo\nthree\nfour\nfive\n").unwrap();
        let splits = dir.path().join("splits");

        let used = split_input(&input, &splits, 2).unwrap();
        assert_eq!(used, 2);
        assert_eq!(
            fs::read_to_string(splits.join("S0.txt")).unwrap(),
            "one\nthree\nfive\n"
        );
        assert_eq!(
            fs::read_to_string(splits.join("S1.txt")).unwrap(),
            "two\nfour\n"
        );
    }

    #[test]
    fn fewer_lines_than_workers_means_fewer_shards() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("input.txt");
        fs::write(&input, "only\n").unwrap();
        let used = split_input(&input, &dir.path().join("splits"), 4).unwrap();
        assert_eq!(used, 1);
    }

    #[test]
    fn split_replaces_previous_shards() {
        let dir = tempfile::tempdir().unwrap();
        let splits = dir.path().join("splits");
        fs::create_dir_all(&splits).unwrap();
        fs::write(splits.join("S5.txt"), "stale").unwrap();

        let input = dir.path().join("input.txt");
        fs::write(&input, "fresh\n").unwrap();
        split_input(&input, &splits, 1).unwrap();

        assert!(!splits.join("S5.txt").exists());
        assert!(splits.join("S0.txt").exists());
    }
}
