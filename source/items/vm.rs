use crate::dispatch::Value;
use crate::hostos::HostOs;
use crate::items;

pub const MEMORY_MODES: &[&str] =
  &["total", "free", "used", "pfree", "pused", "buffers", "cached", "available"];

pub fn memory_size<H>(host: &H, arguments: &[String]) -> anyhow::Result<Value>
where
  H: HostOs + ?Sized,
{
  items::ensure_arity(arguments, 1)?;
  let mode = items::argument(arguments, 0, "total");
  items::ensure_mode(mode, MEMORY_MODES)?;
  let memory = host.memory()?;
  match mode {
    "buffers" => items::integer(memory.buffers),
    "cached" => items::integer(memory.cached),
    "available" => items::integer(memory.available),
    _ => items::sized(memory.free, memory.total, mode),
  }
}
