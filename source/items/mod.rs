use crate::dispatch::{Handler, Registry, Value, WrongArgument};
use crate::hostos::HostOs;
use anyhow::Context as _;
use std::{sync, time};

pub mod agent;
pub mod kernel;
pub mod net;
pub mod proc;
pub mod system;
pub mod vfs;
pub mod vm;

/// Every bundled item key. Each resolves through `builtin`.
pub const BUILTINS: &[&str] = &[
  "agent.ping",
  "agent.version",
  "kernel.maxproc",
  "net.if.in",
  "net.if.out",
  "net.tcp.service",
  "proc.num",
  "system.cpu.load",
  "system.cpu.util",
  "system.hostname",
  "system.swap.in",
  "system.swap.out",
  "system.swap.size",
  "system.uname",
  "system.uptime",
  "vfs.dev.read",
  "vfs.dev.write",
  "vfs.file.md5sum",
  "vfs.fs.inode",
  "vfs.fs.size",
  "vm.memory.size",
];

/// The handler for one bundled item, bound to a provider.
pub fn builtin<H>(name: &str, host: &sync::Arc<H>) -> Option<Handler>
where
  H: HostOs + 'static,
{
  let host = sync::Arc::clone(host);
  Some(match name {
    "agent.ping" => Box::new(|arguments: &[String]| agent::ping(arguments)),
    "agent.version" => Box::new(|arguments: &[String]| agent::version(arguments)),
    "kernel.maxproc" => Box::new(move |arguments: &[String]| kernel::maxproc(&*host, arguments)),
    "net.if.in" => Box::new(move |arguments: &[String]| net::if_in(&*host, arguments)),
    "net.if.out" => Box::new(move |arguments: &[String]| net::if_out(&*host, arguments)),
    "net.tcp.service" => {
      Box::new(move |arguments: &[String]| net::tcp_service(&*host, arguments))
    }
    "proc.num" => Box::new(move |arguments: &[String]| proc::num(&*host, arguments)),
    "system.cpu.load" => Box::new(move |arguments: &[String]| system::cpu_load(&*host, arguments)),
    "system.cpu.util" => Box::new(move |arguments: &[String]| system::cpu_util(&*host, arguments)),
    "system.hostname" => Box::new(move |arguments: &[String]| system::hostname(&*host, arguments)),
    "system.swap.in" => Box::new(move |arguments: &[String]| system::swap_in(&*host, arguments)),
    "system.swap.out" => Box::new(move |arguments: &[String]| system::swap_out(&*host, arguments)),
    "system.swap.size" => {
      Box::new(move |arguments: &[String]| system::swap_size(&*host, arguments))
    }
    "system.uname" => Box::new(move |arguments: &[String]| system::uname(&*host, arguments)),
    "system.uptime" => Box::new(move |arguments: &[String]| system::uptime(&*host, arguments)),
    "vfs.dev.read" => Box::new(move |arguments: &[String]| vfs::dev_read(&*host, arguments)),
    "vfs.dev.write" => Box::new(move |arguments: &[String]| vfs::dev_write(&*host, arguments)),
    "vfs.file.md5sum" => Box::new(|arguments: &[String]| vfs::file_md5sum(arguments)),
    "vfs.fs.inode" => Box::new(move |arguments: &[String]| vfs::fs_inodes(&*host, arguments)),
    "vfs.fs.size" => Box::new(move |arguments: &[String]| vfs::fs_size(&*host, arguments)),
    "vm.memory.size" => Box::new(move |arguments: &[String]| vm::memory_size(&*host, arguments)),
    _ => return None,
  })
}

/// The registry every configuration starts from: all bundled items.
pub fn standard<H>(host: &sync::Arc<H>) -> Registry
where
  H: HostOs + 'static,
{
  let mut registry = Registry::new();
  for name in BUILTINS {
    match builtin(name, host) {
      Some(handler) => registry.insert(name, handler),
      None => unreachable!("{name} has no constructor"),
    }
  }
  registry
}

/// A user-defined item running a shell command; `{0}`-style placeholders are
/// substituted with the key's arguments.
pub fn shell<H>(host: &sync::Arc<H>, command: &str, timeout: time::Duration) -> Handler
where
  H: HostOs + 'static,
{
  let host = sync::Arc::clone(host);
  let command = command.to_string();
  Box::new(move |arguments: &[String]| {
    let command = substituted(&command, arguments)?;
    Ok(Value::Text(host.run_command(&command, timeout)?))
  })
}

fn substituted(template: &str, arguments: &[String]) -> anyhow::Result<String> {
  let mut command = template.to_string();
  for index in 0..10 {
    let placeholder = format!("{{{index}}}");
    if !command.contains(&placeholder) {
      continue;
    }
    match arguments.get(index) {
      Some(argument) => command = command.replace(&placeholder, argument),
      None => Err(WrongArgument(format!("{template:?} wants an argument at {index}")))?,
    }
  }
  Ok(command)
}

// Argument plumbing shared by the items. An empty argument selects the
// default, so a later position can be set without spelling out the earlier
// ones: `proc.num[,root]`.

pub(crate) fn argument<'a>(arguments: &'a [String], index: usize, default: &'a str) -> &'a str {
  optional(arguments, index).unwrap_or(default)
}

pub(crate) fn optional(arguments: &[String], index: usize) -> Option<&str> {
  arguments
    .get(index)
    .map(String::as_str)
    .filter(|argument| !argument.is_empty())
}

pub(crate) fn required<'a>(
  arguments: &'a [String],
  index: usize,
  name: &str,
) -> anyhow::Result<&'a str> {
  arguments
    .get(index)
    .map(String::as_str)
    .ok_or_else(|| WrongArgument(format!("{name} is required")).into())
}

pub(crate) fn ensure_arity(arguments: &[String], most: usize) -> anyhow::Result<()> {
  if arguments.len() > most {
    Err(WrongArgument(format!(
      "expected at most {most} argument(s), got {}",
      arguments.len()
    )))?
  }
  Ok(())
}

pub(crate) fn ensure_mode(mode: &str, available: &[&str]) -> anyhow::Result<()> {
  if !available.contains(&mode) {
    Err(WrongArgument(format!("unknown mode {mode:?}, expected one of {available:?}")))?
  }
  Ok(())
}

pub(crate) fn integer(value: u64) -> anyhow::Result<Value> {
  Ok(Value::Integer(
    i64::try_from(value).context("counter overflows a signed integer")?,
  ))
}

pub const SIZE_MODES: &[&str] = &["free", "total", "used", "pfree", "pused"];

/// free/total into the requested representation. A zero total yields zero
/// whatever free says; better to alert the authorities than to divide.
pub(crate) fn sized(free: u64, total: u64, mode: &str) -> anyhow::Result<Value> {
  if total == 0 {
    return Ok(Value::Integer(0));
  }
  Ok(match mode {
    "free" => integer(free)?,
    "total" => integer(total)?,
    "used" => integer(total - free)?,
    "pfree" => Value::Float(free as f64 / total as f64 * 100.0),
    "pused" => Value::Float((total - free) as f64 / total as f64 * 100.0),
    _ => unreachable!("{mode} slipped through ensure_mode"),
  })
}

pub const AVERAGE_MODES: &[&str] = &["avg1", "avg5", "avg15"];

/// The window behind a moving-average mode, in seconds.
pub(crate) fn window_seconds(window: &str) -> anyhow::Result<u64> {
  ensure_mode(window, AVERAGE_MODES)?;
  Ok(match window {
    "avg1" => 60,
    "avg5" => 300,
    "avg15" => 900,
    _ => unreachable!(),
  })
}
