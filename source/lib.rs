// A passive monitoring agent: the server connects, sends an item key, gets
// one framed scalar back. See protocol.rs for the wire format, dispatch.rs
// for the containment rules and hostos/ for where the numbers come from.

use anyhow::Context as _;
use std::{
  fs, io,
  os::fd::AsRawFd as _,
  path, process,
  sync::{self, atomic},
  thread, time,
};

pub mod config;
pub mod dispatch;
pub mod hostos;
pub mod items;
pub mod protocol;
pub mod server;

#[derive(clap::Args)]
#[group(skip)]
pub struct Arguments {
  #[arg(
    short = 'c',
    long = "config",
    help = "Absolute path to the configuration file",
    default_value_t = String::from("/etc/zmon/config.toml")
  )]
  pub config: String,

  #[arg(
    short = 'd',
    long = "daemonize",
    help = "Detach and run as an independent process",
    default_value_t = false
  )]
  pub daemonize: bool,
  #[arg(
    long = "pid-file",
    help = "Where to store the pid when daemonized",
    default_value_t = String::from("/var/run/zmon/zmon.pid")
  )]
  pub pid_file: String,
  #[arg(
    long = "error-log",
    help = "Where stdout and stderr go when daemonized",
    default_value_t = String::from("/var/log/zmon/zmon.err")
  )]
  pub error_log: String,
}

static STOP: atomic::AtomicBool = atomic::AtomicBool::new(false);
static RELOAD: atomic::AtomicBool = atomic::AtomicBool::new(false);

extern "C" fn on_stop(_signal: i32) {
  STOP.store(true, atomic::Ordering::SeqCst);
}

extern "C" fn on_reload(_signal: i32) {
  RELOAD.store(true, atomic::Ordering::SeqCst);
}

fn install_signal_handlers() -> anyhow::Result<()> {
  use nix::sys::signal;
  for (signal, handler) in [
    (signal::Signal::SIGTERM, on_stop as extern "C" fn(i32)),
    (signal::Signal::SIGINT, on_stop),
    (signal::Signal::SIGHUP, on_reload),
  ] {
    let action = signal::SigAction::new(
      signal::SigHandler::Handler(handler),
      // No SA_RESTART: accept must come back with EINTR.
      signal::SaFlags::empty(),
      signal::SigSet::empty(),
    );
    unsafe { signal::sigaction(signal, &action) }?;
  }
  Ok(())
}

/// Removes the pid file once the daemon winds down.
struct PidFile(path::PathBuf);

impl Drop for PidFile {
  fn drop(&mut self) {
    if let Err(error) = fs::remove_file(&self.0) {
      log::warn!("couldn't remove {:?}: {error}", self.0);
    }
  }
}

/// Classic double fork: detach from the shell, lose the controlling
/// terminal, point the standard streams away, record the pid.
fn daemonize(pid_file: &path::Path, error_log: &path::Path) -> anyhow::Result<PidFile> {
  anyhow::ensure!(
    !pid_file.exists(),
    "pid file {pid_file:?} already exists, is another agent running?"
  );
  let fork_exit_parent = || -> anyhow::Result<()> {
    match unsafe { nix::unistd::fork() }? {
      nix::unistd::ForkResult::Parent { .. } => process::exit(0),
      nix::unistd::ForkResult::Child => Ok(()),
    }
  };
  fork_exit_parent()?;
  nix::unistd::setsid()?;
  fork_exit_parent()?;

  let devnull = fs::File::open("/dev/null")?;
  nix::unistd::dup2(devnull.as_raw_fd(), io::stdin().as_raw_fd())?;
  let error_log = fs::OpenOptions::new()
    .create(true)
    .append(true)
    .open(error_log)
    .with_context(|| format!("couldn't open {error_log:?}"))?;
  nix::unistd::dup2(error_log.as_raw_fd(), io::stdout().as_raw_fd())?;
  nix::unistd::dup2(error_log.as_raw_fd(), io::stderr().as_raw_fd())?;

  fs::write(pid_file, format!("{}\n", process::id()))?;
  Ok(PidFile(pid_file.to_path_buf()))
}

/// Relays the signal flags to the server: the handlers themselves may only
/// flip atomics.
fn relay_signals<H>(server: &sync::Arc<server::Server<H>>)
where
  H: hostos::HostOs + 'static,
{
  let server = sync::Arc::clone(server);
  thread::spawn(move || loop {
    if STOP.load(atomic::Ordering::SeqCst) {
      log::info!("stopping");
      server.stop();
      break;
    }
    if RELOAD.swap(false, atomic::Ordering::SeqCst) {
      server.request_reload();
    }
    thread::sleep(time::Duration::from_millis(100));
  });
}

pub fn run(arguments: &Arguments, config: config::Config) -> anyhow::Result<()> {
  // Fork before any thread exists.
  let _pid_file = match arguments.daemonize {
    true => Some(daemonize(
      path::Path::new(&arguments.pid_file),
      path::Path::new(&arguments.error_log),
    )?),
    false => None,
  };

  let host = sync::Arc::new(hostos::linux::Linux::new());
  let server = sync::Arc::new(server::Server::bind(
    &config,
    path::Path::new(&arguments.config),
    host,
  )?);
  install_signal_handlers()?;
  relay_signals(&server);
  server.serve()
}
