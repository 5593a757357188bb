use crate::dispatch::{Value, WrongArgument};
use crate::hostos::{HostOs, Process};
use crate::items;

pub const STATES: &[&str] = &["all", "run", "sleep", "zomb"];

/// Counts userspace processes matching the filters. An absent or empty
/// filter matches everything.
pub fn num<H>(host: &H, arguments: &[String]) -> anyhow::Result<Value>
where
  H: HostOs + ?Sized,
{
  items::ensure_arity(arguments, 4)?;
  let name = items::optional(arguments, 0);
  let user = items::optional(arguments, 1);
  let state = items::argument(arguments, 2, "all");
  items::ensure_mode(state, STATES)?;
  let command_line = items::optional(arguments, 3);

  let uid = match user {
    Some(user) => Some(host.uid(user)?),
    None => None,
  };
  let pattern = match command_line {
    Some(command_line) => Some(regex::Regex::new(command_line).map_err(|error| {
      WrongArgument(format!("unusable command line pattern {command_line:?}: {error}"))
    })?),
    None => None,
  };

  let matches = |process: &Process| {
    name.map_or(true, |name| process.name == name)
      && uid.map_or(true, |uid| process.uid == uid)
      && (state == "all" || process.state.mode() == state)
      && pattern.as_ref().map_or(true, |pattern| pattern.is_match(&process.command_line))
  };
  let count = host.processes()?.iter().filter(|process| matches(process)).count();
  items::integer(count as u64)
}
