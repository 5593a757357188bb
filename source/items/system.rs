use crate::dispatch::{Value, WrongArgument};
use crate::hostos::{self, HostOs};
use crate::items;
use std::collections;

/// Average share of time the cpus spent in a state over the window,
/// percent. The sampler keeps one time-bucket vector per cpu per second, so
/// the window boils down to one pair of vectors per cpu.
pub fn cpu_util<H>(host: &H, arguments: &[String]) -> anyhow::Result<Value>
where
  H: HostOs + ?Sized,
{
  items::ensure_arity(arguments, 3)?;
  let cpu = items::argument(arguments, 0, "all");
  let state = items::argument(arguments, 1, "user");
  items::ensure_mode(state, hostos::CPU_STATES)?;
  let window = items::argument(arguments, 2, "avg1");
  let shift = items::window_seconds(window)?;

  let count = host.cpu_count()?;
  let cpus: Vec<usize> = if cpu == "all" {
    (0..count).collect()
  } else {
    let cpu = cpu
      .parse()
      .ok()
      .filter(|cpu| *cpu < count)
      .ok_or_else(|| WrongArgument(format!("unknown cpu {cpu:?}, {count} are known")))?;
    vec![cpu]
  };

  let (mut in_state, mut total) = (0, 0);
  for cpu in cpus {
    let past = match host.cpu_times_shifted(cpu, shift) {
      Some(past) => past,
      // The sampler hasn't covered this cpu yet.
      None => continue,
    };
    let current = host.cpu_times(cpu)?;
    let bucket = |times: &hostos::CpuTimes| {
      times.state(state).unwrap() // Guaranteed by ensure_mode.
    };
    in_state += bucket(&current).saturating_sub(bucket(&past));
    total += current.total().saturating_sub(past.total());
  }
  Ok(Value::Float(if total != 0 {
    in_state as f64 * 100.0 / total as f64
  } else {
    0.0
  }))
}

pub fn cpu_load<H>(host: &H, arguments: &[String]) -> anyhow::Result<Value>
where
  H: HostOs + ?Sized,
{
  items::ensure_arity(arguments, 2)?;
  let cpu = items::argument(arguments, 0, "all");
  items::ensure_mode(cpu, &["all", "percpu"])?;
  let window = items::argument(arguments, 1, "avg1");
  items::ensure_mode(window, items::AVERAGE_MODES)?;
  let averages = host.load_averages()?;
  let mut load = averages.window(window).unwrap(); // Guaranteed by ensure_mode.
  if cpu == "percpu" {
    let count = host.cpu_count()?;
    anyhow::ensure!(0 < count, "no cpus reported");
    load /= count as f64;
  }
  Ok(Value::Float(load))
}

// The only hostname flavor there is. The enum exists so new flavors are
// rejected instead of silently treated as this one.
pub const HOSTNAME_MODES: &[&str] = &["host"];

pub fn hostname<H>(host: &H, arguments: &[String]) -> anyhow::Result<Value>
where
  H: HostOs + ?Sized,
{
  items::ensure_arity(arguments, 1)?;
  items::ensure_mode(items::argument(arguments, 0, "host"), HOSTNAME_MODES)?;
  Ok(Value::Text(host.hostname()?))
}

pub fn uname<H>(host: &H, arguments: &[String]) -> anyhow::Result<Value>
where
  H: HostOs + ?Sized,
{
  items::ensure_arity(arguments, 0)?;
  Ok(Value::Text(host.uname()?.join(" ")))
}

pub fn uptime<H>(host: &H, arguments: &[String]) -> anyhow::Result<Value>
where
  H: HostOs + ?Sized,
{
  items::ensure_arity(arguments, 0)?;
  items::integer(host.uptime()?)
}

pub fn swap_size<H>(host: &H, arguments: &[String]) -> anyhow::Result<Value>
where
  H: HostOs + ?Sized,
{
  items::ensure_arity(arguments, 2)?;
  let device = items::argument(arguments, 0, "all");
  let mode = items::argument(arguments, 1, "free");
  items::ensure_mode(mode, items::SIZE_MODES)?;
  let (free, total) = host.swap_size(device)?;
  items::sized(free, total, mode)
}

// count and sectors come from the disk counters of the swap devices (reads
// swap in, writes swap out); pages comes from the vm accounting and exists
// only host-wide.
pub const SWAP_MODES: &[&str] = &["count", "sectors", "pages"];

#[derive(Clone, Copy)]
enum Direction {
  In,
  Out,
}

fn swap<H>(host: &H, direction: Direction, arguments: &[String]) -> anyhow::Result<Value>
where
  H: HostOs + ?Sized,
{
  items::ensure_arity(arguments, 2)?;
  let device = items::argument(arguments, 0, "all");
  let mode = items::argument(arguments, 1, "count");
  items::ensure_mode(mode, SWAP_MODES)?;

  if mode == "pages" {
    if device != "all" {
      Err(WrongArgument("pages are only accounted for device \"all\"".to_string()))?
    }
    let activity = host.swap_activity()?;
    return items::integer(match direction {
      Direction::In => activity.pages_in,
      Direction::Out => activity.pages_out,
    });
  }

  let names = host.swap_device_names()?;
  let devices = if device == "all" {
    names
  } else {
    if !names.contains(device) {
      Err(WrongArgument(format!("unknown swap device {device:?}")))?
    }
    collections::HashSet::from([device.to_string()])
  };
  let mut total = 0;
  for device in &devices {
    let stats = host.disk_stats(device)?;
    total += match (direction, mode) {
      (Direction::In, "count") => stats.read_operations,
      (Direction::In, "sectors") => stats.read_sectors,
      (Direction::Out, "count") => stats.write_operations,
      (Direction::Out, "sectors") => stats.write_sectors,
      _ => unreachable!("{mode} slipped through ensure_mode"),
    };
  }
  items::integer(total)
}

pub fn swap_in<H>(host: &H, arguments: &[String]) -> anyhow::Result<Value>
where
  H: HostOs + ?Sized,
{
  swap(host, Direction::In, arguments)
}

pub fn swap_out<H>(host: &H, arguments: &[String]) -> anyhow::Result<Value>
where
  H: HostOs + ?Sized,
{
  swap(host, Direction::Out, arguments)
}
