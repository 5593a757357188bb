use crate::dispatch::{Value, WrongArgument};
use crate::hostos::{history, DiskStats, HostOs};
use crate::items;
use anyhow::Context as _;
use md5::Digest as _;
use std::{collections, fs, io};

pub fn fs_size<H>(host: &H, arguments: &[String]) -> anyhow::Result<Value>
where
  H: HostOs + ?Sized,
{
  items::ensure_arity(arguments, 2)?;
  let filesystem = items::required(arguments, 0, "filesystem")?;
  let mode = items::argument(arguments, 1, "total");
  items::ensure_mode(mode, items::SIZE_MODES)?;
  let (free, total) = host.fs_size(filesystem)?;
  items::sized(free, total, mode)
}

pub fn fs_inodes<H>(host: &H, arguments: &[String]) -> anyhow::Result<Value>
where
  H: HostOs + ?Sized,
{
  items::ensure_arity(arguments, 2)?;
  let filesystem = items::required(arguments, 0, "filesystem")?;
  let mode = items::argument(arguments, 1, "total");
  items::ensure_mode(mode, items::SIZE_MODES)?;
  let (free, total) = host.fs_inodes(filesystem)?;
  items::sized(free, total, mode)
}

// Cumulative counters are summed as-is; the avg1/avg5/avg15 rates divide the
// counter movement by the wall time actually covered by the sampler history.
pub const DEVICE_STATS: &[&str] = &["operations", "sectors", "ops", "sps", "bps"];

const SECTOR_SIZE: u64 = 512;

#[derive(Clone, Copy)]
enum Direction {
  Read,
  Write,
}

fn stat(stats: &DiskStats, direction: Direction, counter: &str) -> u64 {
  match (direction, counter) {
    (Direction::Read, "operations" | "ops") => stats.read_operations,
    (Direction::Read, "sectors" | "sps" | "bps") => stats.read_sectors,
    (Direction::Write, "operations" | "ops") => stats.write_operations,
    (Direction::Write, "sectors" | "sps" | "bps") => stats.write_sectors,
    _ => unreachable!("{counter} slipped through ensure_mode"),
  }
}

fn devices<H>(host: &H, device: &str) -> anyhow::Result<collections::HashSet<String>>
where
  H: HostOs + ?Sized,
{
  let names = host.disk_names()?;
  if device == "all" {
    return Ok(names);
  }
  if !names.contains(device) {
    Err(WrongArgument(format!("unknown device {device:?}")))?
  }
  Ok(collections::HashSet::from([device.to_string()]))
}

fn dev<H>(host: &H, direction: Direction, arguments: &[String], now: u64) -> anyhow::Result<Value>
where
  H: HostOs + ?Sized,
{
  items::ensure_arity(arguments, 3)?;
  let device = items::argument(arguments, 0, "all");
  let counter = items::argument(arguments, 1, "operations");
  items::ensure_mode(counter, DEVICE_STATS)?;
  let window = items::argument(arguments, 2, "avg1");
  let devices = devices(host, device)?;

  if let "operations" | "sectors" = counter {
    let mut total = 0;
    for device in &devices {
      total += stat(&host.disk_stats(device)?, direction, counter);
    }
    return items::integer(total);
  }

  let shift = items::window_seconds(window)?;
  let mut rate = 0.0;
  for device in &devices {
    let (past, timestamp) = match host.disk_stats_shifted(device, shift, now) {
      Some(shifted) => shifted,
      // The sampler hasn't seen this device yet.
      None => continue,
    };
    let elapsed = now.saturating_sub(timestamp);
    if elapsed == 0 {
      continue;
    }
    let current = host.disk_stats(device)?;
    let delta = stat(&current, direction, counter).saturating_sub(stat(&past, direction, counter));
    let unit = if counter == "bps" { SECTOR_SIZE } else { 1 };
    rate += (delta * unit) as f64 / elapsed as f64;
  }
  Ok(Value::Float(rate))
}

pub fn dev_read<H>(host: &H, arguments: &[String]) -> anyhow::Result<Value>
where
  H: HostOs + ?Sized,
{
  dev(host, Direction::Read, arguments, history::now())
}

pub fn dev_write<H>(host: &H, arguments: &[String]) -> anyhow::Result<Value>
where
  H: HostOs + ?Sized,
{
  dev(host, Direction::Write, arguments, history::now())
}

const CHECKSUM_BLOCK: usize = 8192;

pub fn file_md5sum(arguments: &[String]) -> anyhow::Result<Value> {
  items::ensure_arity(arguments, 1)?;
  let path = items::required(arguments, 0, "path")?;
  let file = fs::File::open(path).with_context(|| format!("couldn't open {path:?}"))?;
  let mut reader = io::BufReader::with_capacity(CHECKSUM_BLOCK, file);
  let mut hasher = md5::Md5::new();
  io::copy(&mut reader, &mut hasher)?;
  Ok(Value::Text(hex::encode(hasher.finalize())))
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::hostos::testing::FakeOs;
  use std::io::Write as _;

  fn arguments(arguments: &[&str]) -> Vec<String> {
    arguments.iter().map(|argument| argument.to_string()).collect()
  }

  fn sized_host() -> FakeOs {
    FakeOs {
      fs: collections::HashMap::from([("/".to_string(), (50, 100))]),
      inodes: collections::HashMap::from([("/".to_string(), (25, 100))]),
      ..FakeOs::default()
    }
  }

  #[test]
  fn fs_size_converts() {
    let host = sized_host();
    assert_eq!(Value::Integer(100), fs_size(&host, &arguments(&["/"])).unwrap());
    assert_eq!(Value::Float(50.0), fs_size(&host, &arguments(&["/", "pfree"])).unwrap());
    assert_eq!(Value::Integer(50), fs_size(&host, &arguments(&["/", "used"])).unwrap());
    assert_eq!(Value::Float(75.0), fs_inodes(&host, &arguments(&["/", "pused"])).unwrap());
  }

  #[test]
  fn fs_size_requires_a_filesystem() {
    let error = fs_size(&sized_host(), &[]).unwrap_err();
    assert!(error.downcast_ref::<WrongArgument>().is_some());
  }

  #[test]
  fn fs_size_refuses_unknown_modes() {
    let error = fs_size(&sized_host(), &arguments(&["/", "wrong"])).unwrap_err();
    assert!(error.downcast_ref::<WrongArgument>().is_some());
  }

  #[test]
  fn fs_size_propagates_host_errors() {
    let error = fs_size(&sized_host(), &arguments(&["/nowhere"])).unwrap_err();
    assert!(error.downcast_ref::<WrongArgument>().is_none());
  }

  fn disk_host() -> FakeOs {
    FakeOs {
      disks: collections::HashMap::from([
        (
          "sda".to_string(),
          DiskStats {
            read_operations: 3430,
            read_sectors: 100,
            write_operations: 2277,
            write_sectors: 200,
          },
        ),
        (
          "sdb".to_string(),
          DiskStats {
            read_operations: 70,
            read_sectors: 10,
            write_operations: 23,
            write_sectors: 20,
          },
        ),
      ]),
      ..FakeOs::default()
    }
  }

  #[test]
  fn cumulative_counters_sum_over_all_devices() {
    let host = disk_host();
    assert_eq!(Value::Integer(3500), dev_read(&host, &[]).unwrap());
    assert_eq!(Value::Integer(110), dev_read(&host, &arguments(&["all", "sectors"])).unwrap());
    assert_eq!(Value::Integer(2300), dev_write(&host, &[]).unwrap());
    assert_eq!(
      Value::Integer(2277),
      dev_write(&host, &arguments(&["sda", "operations"])).unwrap()
    );
  }

  #[test]
  fn unknown_devices_and_counters_are_refused() {
    let host = disk_host();
    for arguments in [arguments(&["sdz"]), arguments(&["sda", "wrong"])] {
      let error = dev_read(&host, &arguments).unwrap_err();
      assert!(error.downcast_ref::<WrongArgument>().is_some());
    }
  }

  #[test]
  fn rates_without_history_are_zero() {
    let host = disk_host();
    assert_eq!(Value::Float(0.0), dev_read(&host, &arguments(&["sda", "ops"])).unwrap());
  }

  #[test]
  fn rates_divide_by_the_covered_wall_time() {
    let host = disk_host();
    let now = 1000;
    // 60 seconds ago the counters were lower.
    host.disk_history.push(
      &"sda".to_string(),
      DiskStats {
        read_operations: 3430 - 120,
        read_sectors: 100 - 60,
        write_operations: 2277 - 60,
        write_sectors: 200 - 120,
      },
      now - 60,
    );
    let rated = |arguments: &[&str]| {
      let arguments: Vec<String> = arguments.iter().map(|argument| argument.to_string()).collect();
      match dev(&host, Direction::Read, &arguments, now).unwrap() {
        Value::Float(rate) => rate,
        value => panic!("{value:?} isn't a rate"),
      }
    };
    assert!((rated(&["sda", "ops", "avg1"]) - 2.0).abs() < 1e-9);
    assert!((rated(&["sda", "sps", "avg1"]) - 1.0).abs() < 1e-9);
    match dev(&host, Direction::Write, &arguments(&["sda", "bps", "avg1"]), now).unwrap() {
      Value::Float(rate) => assert!((rate - 1024.0).abs() < 1e-9, "{rate}"),
      value => panic!("{value:?} isn't a rate"),
    }
  }

  #[test]
  fn rates_refuse_unknown_windows() {
    let error = dev_read(&disk_host(), &arguments(&["sda", "ops", "wrong"])).unwrap_err();
    assert!(error.downcast_ref::<WrongArgument>().is_some());
  }

  #[test]
  fn md5sum_of_a_file() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    file.write_all(b"hello").unwrap();
    let path = file.path().to_str().unwrap().to_string();
    // md5("hello")
    assert_eq!(
      Value::Text("5d41402abc4b2a76b9719d911017c592".to_string()),
      file_md5sum(&[path]).unwrap()
    );
  }

  #[test]
  fn md5sum_of_a_missing_file_is_a_host_failure() {
    let error = file_md5sum(&["/definitely/not/a/file".to_string()]).unwrap_err();
    assert!(error.downcast_ref::<WrongArgument>().is_none());
  }
}
