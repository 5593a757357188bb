// Almost everything comes from procfs (see `man 5 proc` for the layouts);
// the rest goes through the libc wrappers (statvfs(3), getpwnam(3),
// gethostname(2), uname(2)).

use crate::hostos::{
  self, history, CpuTimes, DiskStats, HostOs, InterfaceStats, LoadAverages, MemoryInfo, Process,
  ProcessState, SwapActivity,
};
use anyhow::Context as _;
use std::{collections, fs, io, path, str};

#[derive(Debug)]
pub struct Linux {
  procfs: path::PathBuf,
  disks: history::SubjectHistory<String, DiskStats>,
  cpus: history::SubjectHistory<usize, CpuTimes>,
}

impl Default for Linux {
  fn default() -> Self {
    Self::new()
  }
}

impl Linux {
  pub fn new() -> Self {
    Self::with_procfs("/proc")
  }

  /// The procfs root is a parameter so tests can point at a fixture tree.
  pub fn with_procfs(procfs: impl Into<path::PathBuf>) -> Self {
    Self {
      procfs: procfs.into(),
      disks: history::SubjectHistory::new(history::MAX_SHIFT),
      cpus: history::SubjectHistory::new(history::MAX_SHIFT),
    }
  }

  fn lines(&self, path: impl AsRef<path::Path>) -> anyhow::Result<Vec<String>> {
    let path = self.procfs.join(path);
    let contents =
      fs::read_to_string(&path).with_context(|| format!("couldn't read {path:?}"))?;
    if contents.is_empty() {
      return Err(hostos::empty_file_error(&path));
    }
    Ok(contents.lines().map(str::to_string).collect())
  }

  fn interfaces(&self) -> anyhow::Result<collections::HashMap<String, InterfaceStats>> {
    let mut interfaces = collections::HashMap::new();
    // Two header lines, then one interface per line; the colon can touch the
    // first counter when the name fills its column.
    for line in self.lines("net/dev")?.iter().skip(2) {
      let (name, counters) = line
        .split_once(':')
        .with_context(|| format!("unseparated interface line {line:?}"))?;
      let counters = counters
        .split_whitespace()
        .map(|counter| parsed(counter))
        .collect::<anyhow::Result<Vec<u64>>>()?;
      anyhow::ensure!(16 <= counters.len(), "truncated interface line {line:?}");
      interfaces.insert(
        name.trim().to_string(),
        InterfaceStats {
          in_bytes: counters[0],
          in_packets: counters[1],
          in_errors: counters[2],
          in_dropped: counters[3],
          out_bytes: counters[8],
          out_packets: counters[9],
          out_errors: counters[10],
          out_dropped: counters[11],
          collisions: counters[13],
        },
      );
    }
    Ok(interfaces)
  }

  fn process(&self, pid: &str) -> anyhow::Result<Option<Process>> {
    let command_line = match fs::read(self.procfs.join(pid).join("cmdline")) {
      Ok(command_line) => command_line,
      // The process exited while we were walking procfs.
      Err(error) if error.kind() == io::ErrorKind::NotFound => return Ok(None),
      Err(error) => Err(error).with_context(|| format!("couldn't read cmdline of {pid}"))?,
    };
    if command_line.is_empty() {
      // Kernel threads have no command line and are of no interest.
      return Ok(None);
    }
    let command_line: Vec<u8> = command_line
      .iter()
      .map(|byte| if *byte == 0 { b' ' } else { *byte })
      .collect();
    let command_line = String::from_utf8_lossy(&command_line);
    let status = match self.lines(path::Path::new(pid).join("status")) {
      Ok(status) => status,
      Err(error)
        if error
          .downcast_ref::<io::Error>()
          .map_or(false, |error| error.kind() == io::ErrorKind::NotFound) =>
      {
        return Ok(None)
      }
      Err(error) => return Err(error),
    };
    let mut fields = collections::HashMap::new();
    for line in &status {
      if let Some((key, value)) = line.split_once(':') {
        fields.insert(key.to_string(), value.trim().to_string());
      }
    }
    let field = |name: &str| {
      fields
        .get(name)
        .with_context(|| format!("{name} is missing from the status of {pid}"))
    };
    let uid = field("Uid")?
      .split_whitespace()
      .nth(1) // Real, *effective*, saved, filesystem.
      .with_context(|| format!("truncated Uid line for {pid}"))?;
    let state = match field("State")?.chars().next() {
      Some('R') => ProcessState::Run,
      Some('Z') => ProcessState::Zombie,
      _ => ProcessState::Sleep,
    };
    // Zombies and some short-lived processes carry no VmSize.
    let virtual_size = match fields.get("VmSize") {
      Some(size) => sized_field(size)?,
      None => 0,
    };
    Ok(Some(Process {
      name: field("Name")?.clone(),
      uid: parsed(uid)?,
      state,
      command_line: command_line.trim_end().to_string(),
      virtual_size,
    }))
  }

  fn meminfo(&self) -> anyhow::Result<collections::HashMap<String, u64>> {
    let mut meminfo = collections::HashMap::new();
    for line in self.lines("meminfo")? {
      if let Some((key, value)) = line.split_once(':') {
        meminfo.insert(key.to_string(), sized_field(value)?);
      }
    }
    Ok(meminfo)
  }

  fn diskstats(&self) -> anyhow::Result<collections::HashMap<String, DiskStats>> {
    let mut disks = collections::HashMap::new();
    for line in self.lines("diskstats")? {
      let columns: Vec<&str> = line.split_whitespace().collect();
      anyhow::ensure!(10 <= columns.len(), "truncated diskstats line {line:?}");
      disks.insert(
        columns[2].to_string(),
        DiskStats {
          read_operations: parsed(columns[3])?,
          read_sectors: parsed(columns[5])?,
          write_operations: parsed(columns[7])?,
          write_sectors: parsed(columns[9])?,
        },
      );
    }
    Ok(disks)
  }

  /// Swap devices by short name, e.g. sda4 for /dev/sda4. File-backed swap
  /// has no disk counters and is left out.
  fn swaps(&self) -> anyhow::Result<collections::HashMap<String, (u64, u64)>> {
    let mut swaps = collections::HashMap::new();
    for line in self.lines("swaps")?.iter().skip(1) {
      let columns: Vec<&str> = line.split_whitespace().collect();
      anyhow::ensure!(4 <= columns.len(), "truncated swaps line {line:?}");
      let device = match columns[0].strip_prefix("/dev/") {
        Some(device) => device,
        None => continue,
      };
      let total: u64 = parsed(columns[2])?;
      let used: u64 = parsed(columns[3])?;
      swaps.insert(device.to_string(), ((total - used) * 1024, total * 1024));
    }
    Ok(swaps)
  }

  fn vmstat_counter(&self, counter: &str) -> anyhow::Result<u64> {
    for line in self.lines("vmstat")? {
      if let Some(value) = line.strip_prefix(counter) {
        return parsed(value.trim());
      }
    }
    Err(hostos::HostError(format!("{counter} is missing from vmstat")).into())
  }
}

impl HostOs for Linux {
  fn fs_size(&self, filesystem: &str) -> anyhow::Result<(u64, u64)> {
    let stat = nix::sys::statvfs::statvfs(filesystem)
      .with_context(|| format!("couldn't statvfs {filesystem:?}"))?;
    // f_blocks and f_bavail are in f_frsize units.
    let fragment = stat.fragment_size();
    Ok((stat.blocks_available() * fragment, stat.blocks() * fragment))
  }

  fn fs_inodes(&self, filesystem: &str) -> anyhow::Result<(u64, u64)> {
    let stat = nix::sys::statvfs::statvfs(filesystem)
      .with_context(|| format!("couldn't statvfs {filesystem:?}"))?;
    Ok((stat.files_free(), stat.files()))
  }

  fn interface_names(&self) -> anyhow::Result<collections::HashSet<String>> {
    Ok(self.interfaces()?.into_keys().collect())
  }

  fn interface_stats(&self, interface: &str) -> anyhow::Result<InterfaceStats> {
    self
      .interfaces()?
      .remove(interface)
      .ok_or_else(|| hostos::HostError(format!("unknown interface {interface:?}")).into())
  }

  fn processes(&self) -> anyhow::Result<Vec<Process>> {
    let mut processes = Vec::new();
    for entry in fs::read_dir(&self.procfs)? {
      let entry = entry?;
      let name = entry.file_name();
      let pid = match name.to_str() {
        Some(pid) if pid.bytes().all(|byte| byte.is_ascii_digit()) => pid.to_string(),
        _ => continue,
      };
      if let Some(process) = self.process(&pid)? {
        processes.push(process);
      }
    }
    Ok(processes)
  }

  fn uid(&self, user: &str) -> anyhow::Result<u32> {
    match nix::unistd::User::from_name(user)? {
      Some(user) => Ok(user.uid.as_raw()),
      None => Err(hostos::HostError(format!("unknown user {user:?}")).into()),
    }
  }

  fn memory(&self) -> anyhow::Result<MemoryInfo> {
    let meminfo = self.meminfo()?;
    let field = |name: &str| {
      meminfo
        .get(name)
        .copied()
        .with_context(|| format!("{name} is missing from meminfo"))
    };
    let free = field("MemFree")?;
    Ok(MemoryInfo {
      total: field("MemTotal")?,
      free,
      buffers: field("Buffers")?,
      cached: field("Cached")?,
      // Absent before Linux 3.14.
      available: meminfo.get("MemAvailable").copied().unwrap_or(free),
    })
  }

  fn disk_names(&self) -> anyhow::Result<collections::HashSet<String>> {
    Ok(self.diskstats()?.into_keys().collect())
  }

  fn disk_stats(&self, device: &str) -> anyhow::Result<DiskStats> {
    self
      .diskstats()?
      .remove(device)
      .ok_or_else(|| hostos::HostError(format!("unknown disk device {device:?}")).into())
  }

  fn disk_stats_shifted(&self, device: &str, shift: u64, now: u64) -> Option<(DiskStats, u64)> {
    self.disks.shifted(&device.to_string(), shift, now)
  }

  fn cpu_count(&self) -> anyhow::Result<usize> {
    Ok(
      self
        .lines("stat")?
        .iter()
        .filter(|line| line.starts_with("cpu") && !line.starts_with("cpu "))
        .count(),
    )
  }

  fn cpu_times(&self, cpu: usize) -> anyhow::Result<CpuTimes> {
    let prefix = format!("cpu{cpu} ");
    for line in self.lines("stat")? {
      if let Some(buckets) = line.strip_prefix(&prefix) {
        let buckets = buckets
          .split_whitespace()
          .map(parsed)
          .collect::<anyhow::Result<Vec<u64>>>()?;
        anyhow::ensure!(7 <= buckets.len(), "truncated cpu line {line:?}");
        return Ok(CpuTimes {
          user: buckets[0],
          nice: buckets[1],
          system: buckets[2],
          idle: buckets[3],
          iowait: buckets[4],
          irq: buckets[5],
          softirq: buckets[6],
        });
      }
    }
    Err(hostos::HostError(format!("cpu {cpu} is missing from stat")).into())
  }

  fn cpu_times_shifted(&self, cpu: usize, shift: u64) -> Option<CpuTimes> {
    self.cpus.at_offset(&cpu, shift as usize)
  }

  fn sample_disks(&self) -> anyhow::Result<()> {
    let now = history::now();
    for (device, stats) in self.diskstats()? {
      self.disks.push(&device, stats, now);
    }
    Ok(())
  }

  fn sample_cpus(&self) -> anyhow::Result<()> {
    let now = history::now();
    for cpu in 0..self.cpu_count()? {
      let times = self.cpu_times(cpu)?;
      self.cpus.push(&cpu, times, now);
    }
    Ok(())
  }

  fn hostname(&self) -> anyhow::Result<String> {
    let hostname = nix::unistd::gethostname()?;
    hostname
      .into_string()
      .map_err(|hostname| anyhow::anyhow!("hostname {hostname:?} isn't UTF-8"))
  }

  fn uname(&self) -> anyhow::Result<Vec<String>> {
    let uname = nix::sys::utsname::uname()?;
    [
      uname.sysname(),
      uname.nodename(),
      uname.release(),
      uname.version(),
      uname.machine(),
    ]
    .iter()
    .map(|part| {
      part
        .to_str()
        .map(str::to_string)
        .with_context(|| format!("uname part {part:?} isn't UTF-8"))
    })
    .collect()
  }

  fn uptime(&self) -> anyhow::Result<u64> {
    let line = self
      .lines("uptime")?
      .into_iter()
      .next()
      .ok_or_else(|| hostos::empty_file_error(&self.procfs.join("uptime")))?;
    let seconds = line
      .split_whitespace()
      .next()
      .with_context(|| format!("malformed uptime line {line:?}"))?;
    let seconds: f64 = parsed(seconds)?;
    Ok(seconds as u64)
  }

  fn max_processes(&self) -> anyhow::Result<u64> {
    let lines = self.lines("sys/kernel/pid_max")?;
    parsed(lines[0].trim())
  }

  fn load_averages(&self) -> anyhow::Result<LoadAverages> {
    let lines = self.lines("loadavg")?;
    let columns: Vec<&str> = lines[0].split_whitespace().collect();
    anyhow::ensure!(3 <= columns.len(), "truncated loadavg line {:?}", lines[0]);
    Ok(LoadAverages {
      avg1: parsed(columns[0])?,
      avg5: parsed(columns[1])?,
      avg15: parsed(columns[2])?,
    })
  }

  fn swap_size(&self, device: &str) -> anyhow::Result<(u64, u64)> {
    if device == "all" {
      let meminfo = self.meminfo()?;
      let field = |name: &str| {
        meminfo
          .get(name)
          .copied()
          .with_context(|| format!("{name} is missing from meminfo"))
      };
      return Ok((field("SwapFree")?, field("SwapTotal")?));
    }
    self
      .swaps()?
      .remove(device)
      .ok_or_else(|| hostos::HostError(format!("unknown swap device {device:?}")).into())
  }

  fn swap_device_names(&self) -> anyhow::Result<collections::HashSet<String>> {
    Ok(self.swaps()?.into_keys().collect())
  }

  fn swap_activity(&self) -> anyhow::Result<SwapActivity> {
    Ok(SwapActivity {
      pages_in: self.vmstat_counter("pswpin ")?,
      pages_out: self.vmstat_counter("pswpout ")?,
    })
  }
}

fn parsed<T>(token: &str) -> anyhow::Result<T>
where
  T: str::FromStr,
  T::Err: std::error::Error + Send + Sync + 'static,
{
  token.parse().with_context(|| format!("couldn't parse {token:?}"))
}

/// "123 kB" and friends to bytes. Bare values are already bytes.
fn sized_field(field: &str) -> anyhow::Result<u64> {
  let mut columns = field.split_whitespace();
  let value: u64 = parsed(columns.next().with_context(|| format!("empty size {field:?}"))?)?;
  let factor = match columns.next() {
    None | Some("B") => 1,
    Some("kB") | Some("KB") => 1024,
    Some("mB") | Some("MB") => 1024 * 1024,
    Some("gB") | Some("GB") => 1024 * 1024 * 1024,
    Some(unit) => anyhow::bail!("unknown size unit {unit:?}"),
  };
  Ok(value * factor)
}
