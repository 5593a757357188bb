use crate::{config, dispatch, protocol};
use crate::hostos::{history, HostOs};
use std::{
  io, net, path,
  sync::{self, atomic},
  thread, time,
};

/// The accept loop plus everything a request needs: the current registry
/// snapshot, the provider, and the deadline. One long-lived thread per
/// sampler, one detached thread per connection.
pub struct Server<H> {
  listener: net::TcpListener,
  registry: sync::RwLock<sync::Arc<dispatch::Registry>>,
  host: sync::Arc<H>,
  timeout: time::Duration,
  config_path: path::PathBuf,
  stopped: atomic::AtomicBool,
  reload: atomic::AtomicBool,
}

impl<H> Server<H>
where
  H: HostOs + 'static,
{
  /// Binds the listen address and builds the initial registry. The std
  /// listener enables address reuse on its own.
  pub fn bind(
    config: &config::Config,
    config_path: &path::Path,
    host: sync::Arc<H>,
  ) -> anyhow::Result<Self> {
    let registry = config::registry(config, config_path, &host)?;
    let listener = net::TcpListener::bind((config.listen_host.as_str(), config.listen_port))?;
    log::info!(
      "listening on {}:{} with {} item(s)",
      config.listen_host,
      config.listen_port,
      registry.len()
    );
    Ok(Self {
      listener,
      registry: sync::RwLock::new(sync::Arc::new(registry)),
      host,
      timeout: time::Duration::from_secs_f64(config.timeout),
      config_path: config_path.to_path_buf(),
      stopped: atomic::AtomicBool::new(false),
      reload: atomic::AtomicBool::new(false),
    })
  }

  pub fn local_addr(&self) -> anyhow::Result<net::SocketAddr> {
    Ok(self.listener.local_addr()?)
  }

  /// The registry snapshot for one request; a racing reload doesn't affect
  /// requests already dispatched.
  pub fn registry(&self) -> sync::Arc<dispatch::Registry> {
    sync::Arc::clone(&self.registry.read().unwrap())
  }

  /// Makes the accept loop re-read the configuration before the next
  /// connection.
  pub fn request_reload(&self) {
    self.reload.store(true, atomic::Ordering::SeqCst);
  }

  /// Stops the accept loop and the samplers. In-flight connections are
  /// detached and complete on their own.
  pub fn stop(&self) {
    self.stopped.store(true, atomic::Ordering::SeqCst);
    // Unblock the accept loop.
    if let Ok(address) = self.listener.local_addr() {
      let _ = net::TcpStream::connect_timeout(&address, time::Duration::from_secs(1));
    }
  }

  /// Swaps in a freshly built registry; a failing reload keeps the previous
  /// configuration in effect.
  fn reload(&self) {
    log::info!("reloading {:?}", self.config_path);
    let registry = config::load(&self.config_path)
      .and_then(|config| {
        let address = (config.listen_host.as_str(), config.listen_port);
        match self.listener.local_addr() {
          Ok(previous) if previous.port() != config.listen_port => {
            log::warn!("the listen address {address:?} only changes on restart")
          }
          _ => (),
        }
        config::registry(&config, &self.config_path, &self.host)
      });
    match registry {
      Ok(registry) => {
        log::info!("reloaded with {} item(s)", registry.len());
        *self.registry.write().unwrap() = sync::Arc::new(registry);
      }
      Err(error) => log::error!("reload failed, keeping the previous registry: {error}"),
    }
  }

  fn sample(&self, name: &str, tick: impl Fn(&H) -> anyhow::Result<()>) {
    log::debug!("{name} sampler started");
    while !self.stopped.load(atomic::Ordering::SeqCst) {
      if let Err(error) = tick(&self.host) {
        log::warn!("{name} sampler: {error:#}");
      }
      thread::sleep(history::INTERVAL);
    }
    log::debug!("{name} sampler stopped");
  }

  /// Serves until `stop`. Sampler threads are joined on the way out, request
  /// workers are not.
  pub fn serve(self: sync::Arc<Self>) -> anyhow::Result<()> {
    crossbeam_utils::thread::scope(|scope| {
      scope.spawn(|_| self.sample("disk", |host| host.sample_disks()));
      scope.spawn(|_| self.sample("cpu", |host| host.sample_cpus()));
      Self::accept(&self);
      Ok(())
    })
    .map_err(|_| anyhow::anyhow!("a sampler panicked"))?
  }

  fn accept(server: &sync::Arc<Self>) {
    loop {
      if server.stopped.load(atomic::Ordering::SeqCst) {
        break;
      }
      if server.reload.swap(false, atomic::Ordering::SeqCst) {
        server.reload();
      }
      match server.listener.accept() {
        Ok((stream, peer)) => {
          let server = sync::Arc::clone(server);
          thread::spawn(move || {
            if let Err(error) = server.handle(stream) {
              // A misbehaving client never takes the server down, and never
              // gets an error frame either.
              log::warn!("{peer}: {error:#}");
            }
          });
        }
        // A signal landed; the loop re-checks the flags.
        Err(error) if error.kind() == io::ErrorKind::Interrupted => continue,
        Err(error) => log::warn!("accept: {error}"),
      }
    }
  }

  fn handle(&self, mut stream: net::TcpStream) -> anyhow::Result<()> {
    let deadline = time::Instant::now() + self.timeout;
    stream.set_read_timeout(Some(self.timeout))?;
    let key = protocol::receive_key(&mut stream)?;
    let response = self.registry().process(&key);
    // Decoding or dispatch may have used up the deadline already.
    let remaining = deadline
      .checked_duration_since(time::Instant::now())
      .filter(|remaining| !remaining.is_zero())
      .ok_or_else(|| anyhow::anyhow!("deadline expired"))?;
    stream.set_write_timeout(Some(remaining))?;
    protocol::send_response(&mut stream, &response)
  }
}
