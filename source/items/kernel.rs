use crate::dispatch::Value;
use crate::hostos::HostOs;
use crate::items;

pub fn maxproc<H>(host: &H, arguments: &[String]) -> anyhow::Result<Value>
where
  H: HostOs + ?Sized,
{
  items::ensure_arity(arguments, 0)?;
  items::integer(host.max_processes()?)
}
