use anyhow::Context as _;
use std::{
  fs,
  io::{Read, Write as _},
  net, path, sync, thread, time,
};

/// One agent on a loopback port, serving the real host, plus a tiny client
/// for both request dialects.
pub struct Runner {
  // Owns the configuration tree for the lifetime of the test.
  _directory: tempfile::TempDir,
  server: sync::Arc<zmon::server::Server<zmon::hostos::linux::Linux>>,
  address: net::SocketAddr,
  items_path: path::PathBuf,
}

impl Drop for Runner {
  fn drop(&mut self) {
    self.server.stop();
  }
}

impl Runner {
  fn new(items: &str) -> anyhow::Result<Self> {
    let directory = tempfile::tempdir()?;
    let config_path = directory.path().join("config.toml");
    let items_path = directory.path().join("items.toml");
    fs::File::create(&items_path)?.write_all(items.as_bytes())?;
    let port = portpicker::pick_unused_port().with_context(|| "no free port")?;
    fs::File::create(&config_path)?.write_all(
      format!(
        "listen_host = \"127.0.0.1\"\nlisten_port = {port}\nitem_files = [\"items.toml\"]\ntimeout = 10.0\n",
      )
      .as_bytes(),
    )?;

    let config = zmon::config::load(&config_path)?;
    let host = sync::Arc::new(zmon::hostos::linux::Linux::new());
    let server = sync::Arc::new(zmon::server::Server::bind(&config, &config_path, host)?);
    let address = server.local_addr()?;
    {
      let server = sync::Arc::clone(&server);
      thread::spawn(move || {
        if let Err(error) = server.serve() {
          log::error!("server: {error:#}");
        }
      });
    }
    Ok(Self {
      _directory: directory,
      server,
      address,
      items_path,
    })
  }

  /// Replaces the item file and makes the next request see the new registry.
  pub fn rewrite_items(&self, items: &str) -> anyhow::Result<()> {
    fs::File::create(&self.items_path)?.write_all(items.as_bytes())?;
    self.server.request_reload();
    // The accept loop applies the reload after waking for one connection,
    // and before accepting the next one.
    self.framed("agent.ping")?;
    Ok(())
  }

  fn connect(&self) -> anyhow::Result<net::TcpStream> {
    let stream = net::TcpStream::connect_timeout(&self.address, time::Duration::from_secs(10))?;
    stream.set_read_timeout(Some(time::Duration::from_secs(10)))?;
    stream.set_write_timeout(Some(time::Duration::from_secs(10)))?;
    Ok(stream)
  }

  /// One framed request; the raw response payload comes back.
  pub fn framed(&self, key: &str) -> anyhow::Result<Vec<u8>> {
    let mut stream = self.connect()?;
    let mut request = b"ZBXD\x01".to_vec();
    request.extend_from_slice(&(key.len() as u64).to_le_bytes());
    request.extend_from_slice(key.as_bytes());
    stream.write_all(&request)?;
    response(&mut stream)
  }

  /// One newline-terminated request on the fallback dialect.
  pub fn line(&self, key: &str) -> anyhow::Result<Vec<u8>> {
    let mut stream = self.connect()?;
    stream.write_all(key.as_bytes())?;
    stream.write_all(b"\n")?;
    response(&mut stream)
  }

  /// The whole response message, header included.
  pub fn raw(&self, key: &str) -> anyhow::Result<Vec<u8>> {
    let mut stream = self.connect()?;
    let mut request = b"ZBXD\x01".to_vec();
    request.extend_from_slice(&(key.len() as u64).to_le_bytes());
    request.extend_from_slice(key.as_bytes());
    stream.write_all(&request)?;
    let mut message = Vec::new();
    stream.read_to_end(&mut message)?;
    Ok(message)
  }

  pub fn text(&self, key: &str) -> anyhow::Result<String> {
    Ok(String::from_utf8(self.framed(key)?)?)
  }
}

fn response<R>(stream: &mut R) -> anyhow::Result<Vec<u8>>
where
  R: Read,
{
  let mut header = [0; 5];
  stream.read_exact(&mut header)?;
  anyhow::ensure!(b"ZBXD\x01" == &header, "unexpected header {header:?}");
  let mut length = [0; 8];
  stream.read_exact(&mut length)?;
  let mut payload = vec![0; u64::from_le_bytes(length) as usize];
  stream.read_exact(&mut payload)?;
  // The response is exactly one frame, then the server closes.
  let mut rest = Vec::new();
  stream.read_to_end(&mut rest)?;
  anyhow::ensure!(rest.is_empty(), "trailing bytes {rest:?}");
  Ok(payload)
}

pub fn setup<B>(body: B)
where
  B: Fn(&Runner) -> anyhow::Result<()>,
{
  with_items("", body)
}

pub fn with_items<B>(items: &str, body: B)
where
  B: Fn(&Runner) -> anyhow::Result<()>,
{
  let runner = Runner::new(items).unwrap();
  body(&runner).unwrap()
}
