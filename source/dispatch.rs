use crate::protocol;
use std::{collections, fmt};

/// A scalar produced by an item function. The codec picks the wire formatter
/// from the tag.
#[derive(Clone, Debug, PartialEq)]
pub enum Value {
  Integer(i64),
  Float(f64),
  Text(String),
}

#[derive(Clone, Debug, PartialEq)]
pub enum Response {
  Value(Value),
  NotSupported,
}

/// An argument the item refused: unknown mode, bad arity, out-of-range
/// number, malformed key. The dispatcher turns it into `ZBX_NOTSUPPORTED`
/// with a warning instead of an error.
#[derive(Debug, PartialEq, thiserror::Error)]
#[error("{0}")]
pub struct WrongArgument(pub String);

pub type Handler = Box<dyn Fn(&[String]) -> anyhow::Result<Value> + Send + Sync>;

/// The key-to-item mapping. Built once from configuration and replaced
/// wholesale on reload; request workers keep the snapshot they started with.
#[derive(Default)]
pub struct Registry {
  items: collections::HashMap<String, Handler>,
}

impl fmt::Debug for Registry {
  fn fmt(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
    formatter.debug_struct("Registry").field("items", &self.keys()).finish()
  }
}

impl Registry {
  pub fn new() -> Self {
    Self::default()
  }

  /// Registers an item, replacing any previous holder of the key. Later item
  /// files deliberately shadow earlier ones.
  pub fn insert(&mut self, key: &str, handler: Handler) {
    self.items.insert(key.to_string(), handler);
  }

  pub fn contains(&self, key: &str) -> bool {
    self.items.contains_key(key)
  }

  pub fn len(&self) -> usize {
    self.items.len()
  }

  pub fn is_empty(&self) -> bool {
    self.items.is_empty()
  }

  pub fn keys(&self) -> Vec<&str> {
    let mut keys: Vec<&str> = self.items.keys().map(String::as_str).collect();
    keys.sort_unstable();
    keys
  }

  /// Answers one raw key. Every failure collapses to the unsupported
  /// sentinel; only the logs distinguish an unknown key, a refused argument
  /// and a provider blowing up. Raw error text never reaches the wire.
  pub fn process(&self, raw_key: &str) -> Response {
    let (key, arguments) = match protocol::parse_key(raw_key) {
      Ok(parsed) => parsed,
      Err(error) => {
        log::warn!("{error}");
        return Response::NotSupported;
      }
    };
    log::debug!("request for {key:?} with arguments {arguments:?}");
    let handler = match self.items.get(&key) {
      Some(handler) => handler,
      None => {
        log::warn!("unknown key {key:?}");
        return Response::NotSupported;
      }
    };
    let response = match handler(&arguments) {
      Ok(value) => Response::Value(value),
      Err(error) => {
        match error.downcast_ref::<WrongArgument>() {
          Some(wrong) => log::warn!("wrong arguments {arguments:?} for key {key:?}: {wrong}"),
          None => log::error!("couldn't evaluate {key:?} with {arguments:?}: {error:#}"),
        }
        Response::NotSupported
      }
    };
    log::debug!("responding to {key:?} with {response:?}");
    response
  }
}
