use anyhow::Context as _;
use std::{
  collections,
  io::{Read as _, Write as _},
  net::{self, ToSocketAddrs as _},
  process, thread, time,
};

pub mod history;
pub mod linux;
#[cfg(test)]
pub(crate) mod testing;

/// The host refused or couldn't answer: a `/proc` entry is missing or empty,
/// a probe timed out, a user is unknown.
#[derive(Debug, PartialEq, thiserror::Error)]
#[error("{0}")]
pub struct HostError(pub String);

#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct InterfaceStats {
  pub in_bytes: u64,
  pub in_packets: u64,
  pub in_errors: u64,
  pub in_dropped: u64,
  pub out_bytes: u64,
  pub out_packets: u64,
  pub out_errors: u64,
  pub out_dropped: u64,
  pub collisions: u64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ProcessState {
  Run,
  Sleep,
  Zombie,
}

impl ProcessState {
  pub fn mode(self) -> &'static str {
    match self {
      Self::Run => "run",
      Self::Sleep => "sleep",
      Self::Zombie => "zomb",
    }
  }
}

#[derive(Clone, Debug, PartialEq)]
pub struct Process {
  pub name: String,
  /// Effective UID.
  pub uid: u32,
  pub state: ProcessState,
  pub command_line: String,
  pub virtual_size: u64,
}

#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct DiskStats {
  pub read_operations: u64,
  pub read_sectors: u64,
  pub write_operations: u64,
  pub write_sectors: u64,
}

pub const CPU_STATES: &[&str] = &["user", "nice", "system", "idle", "iowait", "irq", "softirq"];

#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct CpuTimes {
  pub user: u64,
  pub nice: u64,
  pub system: u64,
  pub idle: u64,
  pub iowait: u64,
  pub irq: u64,
  pub softirq: u64,
}

impl CpuTimes {
  pub fn state(&self, state: &str) -> Option<u64> {
    Some(match state {
      "user" => self.user,
      "nice" => self.nice,
      "system" => self.system,
      "idle" => self.idle,
      "iowait" => self.iowait,
      "irq" => self.irq,
      "softirq" => self.softirq,
      _ => return None,
    })
  }

  pub fn total(&self) -> u64 {
    self.user + self.nice + self.system + self.idle + self.iowait + self.irq + self.softirq
  }
}

#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct LoadAverages {
  pub avg1: f64,
  pub avg5: f64,
  pub avg15: f64,
}

impl LoadAverages {
  pub fn window(&self, window: &str) -> Option<f64> {
    Some(match window {
      "avg1" => self.avg1,
      "avg5" => self.avg5,
      "avg15" => self.avg15,
      _ => return None,
    })
  }
}

#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct MemoryInfo {
  pub total: u64,
  pub free: u64,
  pub buffers: u64,
  pub cached: u64,
  pub available: u64,
}

#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct SwapActivity {
  pub pages_in: u64,
  pub pages_out: u64,
}

/// What the items consume from the operating system: point-in-time queries,
/// plus the sampler histories that make windowed rates cheap at request time.
///
/// Free and total pairs are `(free, total)` in base units (bytes, inodes).
pub trait HostOs: Send + Sync {
  fn fs_size(&self, filesystem: &str) -> anyhow::Result<(u64, u64)>;
  fn fs_inodes(&self, filesystem: &str) -> anyhow::Result<(u64, u64)>;

  fn interface_names(&self) -> anyhow::Result<collections::HashSet<String>>;
  fn interface_stats(&self, interface: &str) -> anyhow::Result<InterfaceStats>;

  fn processes(&self) -> anyhow::Result<Vec<Process>>;
  fn uid(&self, user: &str) -> anyhow::Result<u32>;

  fn memory(&self) -> anyhow::Result<MemoryInfo>;

  fn disk_names(&self) -> anyhow::Result<collections::HashSet<String>>;
  fn disk_stats(&self, device: &str) -> anyhow::Result<DiskStats>;
  fn disk_stats_shifted(&self, device: &str, shift: u64, now: u64) -> Option<(DiskStats, u64)>;

  fn cpu_count(&self) -> anyhow::Result<usize>;
  fn cpu_times(&self, cpu: usize) -> anyhow::Result<CpuTimes>;
  fn cpu_times_shifted(&self, cpu: usize, shift: u64) -> Option<CpuTimes>;

  /// One sampler tick: record the current counters of every disk device.
  fn sample_disks(&self) -> anyhow::Result<()>;
  /// One sampler tick: record the current time buckets of every cpu.
  fn sample_cpus(&self) -> anyhow::Result<()>;

  fn hostname(&self) -> anyhow::Result<String>;
  fn uname(&self) -> anyhow::Result<Vec<String>>;
  fn uptime(&self) -> anyhow::Result<u64>;
  fn max_processes(&self) -> anyhow::Result<u64>;
  fn load_averages(&self) -> anyhow::Result<LoadAverages>;

  fn swap_size(&self, device: &str) -> anyhow::Result<(u64, u64)>;
  fn swap_device_names(&self) -> anyhow::Result<collections::HashSet<String>>;
  fn swap_activity(&self) -> anyhow::Result<SwapActivity>;

  /// Runs a shell command, returning its stdout with the trailing newline
  /// stripped. The child is killed once the deadline passes.
  fn run_command(&self, command: &str, timeout: time::Duration) -> anyhow::Result<String> {
    run_with_deadline(command, timeout)
  }

  /// Opens a TCP connection and plays a scripted exchange: optionally read a
  /// greeting first, then one response per request sent.
  fn exchange(
    &self,
    address: &str,
    port: u16,
    timeout: time::Duration,
    receive_first: bool,
    requests: &[&[u8]],
  ) -> anyhow::Result<Vec<Vec<u8>>> {
    let address = (address, port)
      .to_socket_addrs()?
      .next()
      .with_context(|| format!("couldn't resolve {address}:{port}"))?;
    log::debug!("connecting to {address:?} with timeout {timeout:?}");
    let mut stream = net::TcpStream::connect_timeout(&address, timeout)?;
    stream.set_read_timeout(Some(timeout))?;
    stream.set_write_timeout(Some(timeout))?;
    let mut responses = Vec::new();
    let mut buffer = [0; 1024];
    if receive_first {
      let received = stream.read(&mut buffer)?;
      responses.push(buffer[..received].to_vec());
    }
    for request in requests {
      stream.write_all(request)?;
      let received = stream.read(&mut buffer)?;
      responses.push(buffer[..received].to_vec());
    }
    Ok(responses)
  }
}

// The child is polled rather than waited on: std has no wait-with-deadline
// and the granularity only matters when a probe wedges.
const WAIT_STEP: time::Duration = time::Duration::from_millis(10);

pub fn run_with_deadline(command: &str, timeout: time::Duration) -> anyhow::Result<String> {
  let mut child = process::Command::new("sh")
    .arg("-c")
    .arg(command)
    .stdin(process::Stdio::null())
    .stdout(process::Stdio::piped())
    .stderr(process::Stdio::piped())
    .spawn()
    .with_context(|| format!("couldn't spawn {command:?}"))?;
  let deadline = time::Instant::now() + timeout;
  loop {
    match child.try_wait()? {
      Some(_) => break,
      None if time::Instant::now() >= deadline => {
        // kill can lose the race with the exit, reap either way.
        let _ = child.kill();
        child.wait()?;
        return Err(HostError(format!("{command:?} didn't complete within {timeout:?}")).into());
      }
      None => thread::sleep(WAIT_STEP),
    }
  }
  let output = child.wait_with_output()?;
  if !output.stderr.is_empty() {
    log::warn!("{command:?}: {}", String::from_utf8_lossy(&output.stderr).trim_end());
  }
  let stdout =
    String::from_utf8(output.stdout).with_context(|| format!("{command:?} didn't output UTF-8"))?;
  Ok(stdout.trim_end_matches('\n').to_string())
}

pub fn empty_file_error(path: &std::path::Path) -> anyhow::Error {
  HostError(format!("{path:?} is unexpectedly empty")).into()
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn run_command_strips_the_trailing_newline() {
    let stdout = run_with_deadline("echo hello", time::Duration::from_secs(10)).unwrap();
    assert_eq!("hello", stdout);
  }

  #[test]
  fn run_command_keeps_inner_newlines() {
    let stdout = run_with_deadline("printf 'a\\nb\\n'", time::Duration::from_secs(10)).unwrap();
    assert_eq!("a\nb", stdout);
  }

  #[test]
  fn run_command_kills_on_deadline() {
    let started = time::Instant::now();
    let error = run_with_deadline("sleep 10", time::Duration::from_millis(50)).unwrap_err();
    assert!(error.downcast_ref::<HostError>().is_some());
    assert!(started.elapsed() < time::Duration::from_secs(5));
  }

  #[test]
  fn cpu_times_states_are_complete() {
    let times = CpuTimes {
      user: 1,
      nice: 2,
      system: 3,
      idle: 4,
      iowait: 5,
      irq: 6,
      softirq: 7,
    };
    for state in CPU_STATES {
      assert!(times.state(state).is_some());
    }
    assert_eq!(None, times.state("steal"));
    assert_eq!(28, times.total());
  }
}
