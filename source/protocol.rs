// https://www.zabbix.com/documentation/2.2/manual/appendix/items/activepassive - passive checks
// https://www.zabbix.com/documentation/2.2/manual/config/items/item/key - item key format
//
// Two request dialects share the listening port: the framed one ("ZBXD" plus a
// version byte and a little-endian length) and the bare newline-terminated one
// that ancient senders still use. Responses are always framed.

use crate::dispatch::{Response, Value, WrongArgument};
use std::io;
use std::io::Read;

pub const HEADER: &[u8; 5] = b"ZBXD\x01";
pub const NOT_SUPPORTED: &str = "ZBX_NOTSUPPORTED";

// The newer protocol revision raised the line-dialect cap from 1024; senders
// are cut off past this.
const LINE_LIMIT: usize = 64 * 1024;
const LENGTH_SIZE: usize = 8;

#[derive(Debug, PartialEq, thiserror::Error)]
pub enum FrameError {
  #[error("end of stream before a complete request")]
  Truncated,
  // The length field was declared signed historically, so the top bit is
  // never legitimate.
  #[error("malformed frame length {0:#018x}")]
  Length(u64),
  #[error("request is not valid UTF-8")]
  Encoding,
}

/// Reads one request key from the stream, detecting the dialect from the
/// first bytes: an exact `ZBXD\x01` prefix selects the framed dialect,
/// anything else is a line.
pub fn receive_key<R>(reader: &mut R) -> anyhow::Result<String>
where
  R: io::Read,
{
  let mut probe = [0; HEADER.len()];
  let received = reader.read(&mut probe)?;
  if received == 0 {
    return Err(FrameError::Truncated.into());
  }
  if received == HEADER.len() && probe == *HEADER {
    return framed_key(reader);
  }
  line_key(reader, &probe[..received])
}

fn framed_key<R>(reader: &mut R) -> anyhow::Result<String>
where
  R: io::Read,
{
  let mut length = [0; LENGTH_SIZE];
  match reader.read_exact(&mut length) {
    Ok(()) => (),
    Err(error) if error.kind() == io::ErrorKind::UnexpectedEof => {
      return Err(FrameError::Truncated.into())
    }
    Err(error) => return Err(error.into()),
  }
  let length = u64::from_le_bytes(length);
  if length > i64::MAX as u64 {
    return Err(FrameError::Length(length).into());
  }
  let mut key = Vec::new();
  // A hostile length should fail the request, not abort the agent.
  key
    .try_reserve_exact(usize::try_from(length).map_err(|_| FrameError::Length(length))?)
    .map_err(|_| FrameError::Length(length))?;
  reader.by_ref().take(length).read_to_end(&mut key)?;
  if (key.len() as u64) < length {
    return Err(FrameError::Truncated.into());
  }
  Ok(String::from_utf8(key).map_err(|_| FrameError::Encoding)?)
}

fn line_key<R>(reader: &mut R, probe: &[u8]) -> anyhow::Result<String>
where
  R: io::Read,
{
  let mut key = probe.to_vec();
  let mut buffer = [0; 1024];
  while memchr::memchr(b'\n', &key).is_none() && key.len() < LINE_LIMIT {
    match reader.read(&mut buffer)? {
      // Some senders close the connection instead of terminating the line.
      0 => break,
      received => key.extend_from_slice(&buffer[..received]),
    }
  }
  if let Some(newline) = memchr::memchr(b'\n', &key) {
    key.truncate(newline + 1);
  }
  key.truncate(LINE_LIMIT);
  Ok(String::from_utf8(key).map_err(|_| FrameError::Encoding)?)
}

/// Formats the response payload: integers in decimal, floats in fixed point
/// with four fractional digits (the server rejects exponent forms), text and
/// the unsupported sentinel as-is.
pub fn render(response: &Response) -> String {
  match response {
    Response::NotSupported => NOT_SUPPORTED.to_string(),
    Response::Value(Value::Integer(integer)) => integer.to_string(),
    Response::Value(Value::Float(float)) => format!("{float:.4}"),
    Response::Value(Value::Text(text)) => text.clone(),
  }
}

/// Frames and sends a response. `write_all` keeps retrying partial writes, so
/// either the whole message is delivered or the connection fails.
pub fn send_response<W>(writer: &mut W, response: &Response) -> anyhow::Result<()>
where
  W: io::Write,
{
  let payload = render(response);
  let payload = payload.as_bytes();
  let mut message = Vec::with_capacity(HEADER.len() + LENGTH_SIZE + payload.len());
  message.extend_from_slice(HEADER);
  message.extend_from_slice(&(payload.len() as u64).to_le_bytes());
  message.extend_from_slice(payload);
  writer.write_all(&message)?;
  writer.flush()?;
  Ok(())
}

peg::parser! {
  // raw_key := name [ '[' arglist ']' ]
  // arglist := arg (',' arg)*
  // arg     := quoted | bare
  // quoted  := '"' (escaped_quote | any_char_but_quote)* '"'
  // bare    := any_char_but_comma*
  //
  // Arguments are stripped of surrounding whitespace and of their surrounding
  // quotes; backslash escapes a double quote and nothing else.
  grammar key() for str {
    rule name() -> &'input str
      = $([^ '[' | ']' | ',' | '"']+)

    // The terminating bracket is the last character of the raw key; a ']'
    // anywhere else is an ordinary argument byte.
    rule close() = "]" ![_]

    rule _() = [' ' | '\t']*

    rule escaped_quote() -> char
      = "\\\"" { '"' }
    rule quoted_char() -> char
      = escaped_quote() / c:[^ '"'] { c }
    rule quoted() -> String
      = "\"" q:quoted_char()* "\"" _()
      { q.into_iter().collect() }

    rule bare() -> String
      = !(_() "\"") b:$((!close() [^ ','])*)
      { b.trim().to_string() }

    // A quoted argument must terminate; falling back to bare would silently
    // keep the opening quote.
    rule argument() -> String
      = _() a:(quoted() / bare())
      { a }

    rule arguments() -> Vec<String>
      = "[" a:(argument() ** ",") "]" ![_]
      { a }

    pub rule item() -> (&'input str, Option<Vec<String>>)
      = n:name() a:arguments()? ![_]
      { (n, a) }
  }
}

/// Splits a raw key into its name and ordered argument list.
///
/// Trailing whitespace (the line dialect leaves a newline behind) is stripped
/// before parsing. Every malformed shape, an unterminated quote or a missing
/// bracket included, is a wrong-argument error.
pub fn parse_key(raw_key: &str) -> anyhow::Result<(String, Vec<String>)> {
  let raw_key = raw_key.trim_end();
  match key::item(raw_key) {
    Ok((name, arguments)) => Ok((name.to_string(), arguments.unwrap_or_default())),
    Err(error) => Err(WrongArgument(format!("unparsable key {raw_key:?}: {error}")).into()),
  }
}
