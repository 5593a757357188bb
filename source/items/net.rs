use crate::dispatch::{Value, WrongArgument};
use crate::hostos::HostOs;
use crate::items;
use std::time;

pub const INTERFACE_MODES: &[&str] = &["bytes", "packets", "errors", "dropped"];

#[derive(Clone, Copy)]
enum Direction {
  In,
  Out,
}

fn interface<H>(host: &H, direction: Direction, arguments: &[String]) -> anyhow::Result<Value>
where
  H: HostOs + ?Sized,
{
  items::ensure_arity(arguments, 2)?;
  let interface = items::required(arguments, 0, "interface")?;
  let mode = items::argument(arguments, 1, "bytes");
  items::ensure_mode(mode, INTERFACE_MODES)?;
  if !host.interface_names()?.contains(interface) {
    Err(WrongArgument(format!("unknown interface {interface:?}")))?
  }
  let stats = host.interface_stats(interface)?;
  items::integer(match (direction, mode) {
    (Direction::In, "bytes") => stats.in_bytes,
    (Direction::In, "packets") => stats.in_packets,
    (Direction::In, "errors") => stats.in_errors,
    (Direction::In, "dropped") => stats.in_dropped,
    (Direction::Out, "bytes") => stats.out_bytes,
    (Direction::Out, "packets") => stats.out_packets,
    (Direction::Out, "errors") => stats.out_errors,
    (Direction::Out, "dropped") => stats.out_dropped,
    _ => unreachable!("{mode} slipped through ensure_mode"),
  })
}

pub fn if_in<H>(host: &H, arguments: &[String]) -> anyhow::Result<Value>
where
  H: HostOs + ?Sized,
{
  interface(host, Direction::In, arguments)
}

pub fn if_out<H>(host: &H, arguments: &[String]) -> anyhow::Result<Value>
where
  H: HostOs + ?Sized,
{
  interface(host, Direction::Out, arguments)
}

// ssh is the only scripted service so far: the server talks first and its
// greeting starts with an identification line.
// https://www.rfc-editor.org/rfc/rfc4253#section-4.2
pub const SERVICES: &[&str] = &["ssh"];

const SSH_PORT: u16 = 22;

static SSH_GREETING: once_cell::sync::Lazy<regex::Regex> =
  once_cell::sync::Lazy::new(|| regex::Regex::new("^SSH-[0-9-. ]+-").unwrap());

/// 1 when the service answers and behaves as expected, 0 otherwise. A dead
/// or misbehaving service is an answer, not an error.
pub fn tcp_service<H>(host: &H, arguments: &[String]) -> anyhow::Result<Value>
where
  H: HostOs + ?Sized,
{
  items::ensure_arity(arguments, 4)?;
  let service = items::required(arguments, 0, "service")?;
  items::ensure_mode(service, SERVICES)?;
  let address = items::argument(arguments, 1, "127.0.0.1");
  // An empty port means the service default, but a malformed one is refused.
  let port = match items::optional(arguments, 2) {
    Some(port) => port.parse().map_err(|_| {
      WrongArgument(format!("port must be an integer in [0,65535], got {port:?}"))
    })?,
    None => SSH_PORT,
  };
  let timeout = match items::optional(arguments, 3) {
    Some(timeout) => timeout
      .parse()
      .ok()
      .filter(|timeout: &f64| timeout.is_finite() && *timeout >= 0.0)
      .ok_or_else(|| {
        WrongArgument(format!("timeout must be a non-negative float, got {timeout:?}"))
      })?,
    None => 1.0,
  };
  let running = match host.exchange(address, port, time::Duration::from_secs_f64(timeout), true, &[])
  {
    Ok(responses) => match responses.first().map(|greeting| String::from_utf8_lossy(greeting)) {
      Some(greeting) if SSH_GREETING.is_match(&greeting) => true,
      Some(greeting) => {
        log::debug!("greeting doesn't match expectations: {greeting:?}");
        false
      }
      None => false,
    },
    Err(error) => {
      log::debug!("ssh service isn't running: {error:#}");
      false
    }
  };
  Ok(Value::Integer(running.into()))
}
