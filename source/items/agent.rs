use crate::dispatch::Value;
use crate::items;

/// The liveness probe the server polls.
pub fn ping(arguments: &[String]) -> anyhow::Result<Value> {
  items::ensure_arity(arguments, 0)?;
  Ok(Value::Integer(1))
}

pub fn version(arguments: &[String]) -> anyhow::Result<Value> {
  items::ensure_arity(arguments, 0)?;
  Ok(Value::Text(env!("CARGO_PKG_VERSION").to_string()))
}
