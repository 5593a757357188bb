// An in-memory provider for item tests: everything is preloaded by the test,
// nothing touches the host.

use crate::hostos::{
  history, CpuTimes, DiskStats, HostOs, InterfaceStats, LoadAverages, MemoryInfo, Process,
  SwapActivity,
};
use std::{collections, time};

pub enum Exchange {
  Refused,
  Greeting(Vec<u8>),
}

pub struct FakeOs {
  pub fs: collections::HashMap<String, (u64, u64)>,
  pub inodes: collections::HashMap<String, (u64, u64)>,
  pub interfaces: collections::HashMap<String, InterfaceStats>,
  pub processes: Vec<Process>,
  pub users: collections::HashMap<String, u32>,
  pub memory: MemoryInfo,
  pub disks: collections::HashMap<String, DiskStats>,
  pub disk_history: history::SubjectHistory<String, DiskStats>,
  pub cpus: Vec<CpuTimes>,
  pub cpu_history: history::SubjectHistory<usize, CpuTimes>,
  pub hostname: String,
  pub uname: Vec<String>,
  pub uptime: u64,
  pub max_processes: u64,
  pub load: LoadAverages,
  pub swaps: collections::HashMap<String, (u64, u64)>,
  pub swap_all: (u64, u64),
  pub swap_activity: SwapActivity,
  pub exchange: Exchange,
}

impl Default for FakeOs {
  fn default() -> Self {
    Self {
      fs: collections::HashMap::new(),
      inodes: collections::HashMap::new(),
      interfaces: collections::HashMap::new(),
      processes: Vec::new(),
      users: collections::HashMap::new(),
      memory: MemoryInfo::default(),
      disks: collections::HashMap::new(),
      disk_history: history::SubjectHistory::new(history::MAX_SHIFT),
      cpus: Vec::new(),
      cpu_history: history::SubjectHistory::new(history::MAX_SHIFT),
      hostname: "fake".to_string(),
      uname: vec!["Linux".to_string(), "fake".to_string()],
      uptime: 0,
      max_processes: 0,
      load: LoadAverages::default(),
      swaps: collections::HashMap::new(),
      swap_all: (0, 0),
      swap_activity: SwapActivity::default(),
      exchange: Exchange::Refused,
    }
  }
}

fn missing(what: &str, which: &str) -> anyhow::Error {
  crate::hostos::HostError(format!("unknown {what} {which:?}")).into()
}

impl HostOs for FakeOs {
  fn fs_size(&self, filesystem: &str) -> anyhow::Result<(u64, u64)> {
    self.fs.get(filesystem).copied().ok_or_else(|| missing("filesystem", filesystem))
  }

  fn fs_inodes(&self, filesystem: &str) -> anyhow::Result<(u64, u64)> {
    self.inodes.get(filesystem).copied().ok_or_else(|| missing("filesystem", filesystem))
  }

  fn interface_names(&self) -> anyhow::Result<collections::HashSet<String>> {
    Ok(self.interfaces.keys().cloned().collect())
  }

  fn interface_stats(&self, interface: &str) -> anyhow::Result<InterfaceStats> {
    self.interfaces.get(interface).copied().ok_or_else(|| missing("interface", interface))
  }

  fn processes(&self) -> anyhow::Result<Vec<Process>> {
    Ok(self.processes.clone())
  }

  fn uid(&self, user: &str) -> anyhow::Result<u32> {
    self.users.get(user).copied().ok_or_else(|| missing("user", user))
  }

  fn memory(&self) -> anyhow::Result<MemoryInfo> {
    Ok(self.memory)
  }

  fn disk_names(&self) -> anyhow::Result<collections::HashSet<String>> {
    Ok(self.disks.keys().cloned().collect())
  }

  fn disk_stats(&self, device: &str) -> anyhow::Result<DiskStats> {
    self.disks.get(device).copied().ok_or_else(|| missing("disk device", device))
  }

  fn disk_stats_shifted(&self, device: &str, shift: u64, now: u64) -> Option<(DiskStats, u64)> {
    self.disk_history.shifted(&device.to_string(), shift, now)
  }

  fn cpu_count(&self) -> anyhow::Result<usize> {
    Ok(self.cpus.len())
  }

  fn cpu_times(&self, cpu: usize) -> anyhow::Result<CpuTimes> {
    self.cpus.get(cpu).copied().ok_or_else(|| missing("cpu", &cpu.to_string()))
  }

  fn cpu_times_shifted(&self, cpu: usize, shift: u64) -> Option<CpuTimes> {
    self.cpu_history.at_offset(&cpu, shift as usize)
  }

  fn sample_disks(&self) -> anyhow::Result<()> {
    let now = history::now();
    for (device, stats) in &self.disks {
      self.disk_history.push(device, *stats, now);
    }
    Ok(())
  }

  fn sample_cpus(&self) -> anyhow::Result<()> {
    let now = history::now();
    for (cpu, times) in self.cpus.iter().enumerate() {
      self.cpu_history.push(&cpu, *times, now);
    }
    Ok(())
  }

  fn hostname(&self) -> anyhow::Result<String> {
    Ok(self.hostname.clone())
  }

  fn uname(&self) -> anyhow::Result<Vec<String>> {
    Ok(self.uname.clone())
  }

  fn uptime(&self) -> anyhow::Result<u64> {
    Ok(self.uptime)
  }

  fn max_processes(&self) -> anyhow::Result<u64> {
    Ok(self.max_processes)
  }

  fn load_averages(&self) -> anyhow::Result<LoadAverages> {
    Ok(self.load)
  }

  fn swap_size(&self, device: &str) -> anyhow::Result<(u64, u64)> {
    if device == "all" {
      return Ok(self.swap_all);
    }
    self.swaps.get(device).copied().ok_or_else(|| missing("swap device", device))
  }

  fn swap_device_names(&self) -> anyhow::Result<collections::HashSet<String>> {
    Ok(self.swaps.keys().cloned().collect())
  }

  fn swap_activity(&self) -> anyhow::Result<SwapActivity> {
    Ok(self.swap_activity)
  }

  fn run_command(&self, command: &str, _timeout: time::Duration) -> anyhow::Result<String> {
    Ok(format!("ran {command}"))
  }

  fn exchange(
    &self,
    _address: &str,
    _port: u16,
    _timeout: time::Duration,
    _receive_first: bool,
    _requests: &[&[u8]],
  ) -> anyhow::Result<Vec<Vec<u8>>> {
    match &self.exchange {
      Exchange::Refused => anyhow::bail!("connection refused"),
      Exchange::Greeting(greeting) => Ok(vec![greeting.clone()]),
    }
  }
}
