use clap::Parser as _;
use std::path;

#[derive(clap::Parser)]
struct Arguments {
  #[clap(flatten)]
  arguments: zmon::Arguments,
  #[clap(flatten)]
  verbose: clap_verbosity_flag::Verbosity<clap_verbosity_flag::InfoLevel>,
}

fn main() -> anyhow::Result<()> {
  let arguments = Arguments::parse();

  let config_path = path::Path::new(&arguments.arguments.config);
  let config = zmon::config::load(config_path)?;

  match &config.logging_conf {
    Some(logging_conf) => {
      // Relative to the configuration file, like the item files.
      let logging_conf = config_path
        .parent()
        .unwrap_or(path::Path::new("."))
        .join(logging_conf);
      log4rs::init_file(logging_conf, Default::default())?
    }
    None => {
      log4rs::init_config(
        log4rs::config::Config::builder()
          .appender(
            log4rs::config::Appender::builder()
              .filter(Box::new(log4rs::filter::threshold::ThresholdFilter::new(
                arguments.verbose.log_level_filter(),
              )))
              .build(
                "console",
                Box::new(
                  log4rs::append::console::ConsoleAppender::builder()
                    .encoder(Box::new(log4rs::encode::pattern::PatternEncoder::new(
                      "{d(%F %T)} {l} {t} - {m}{n}",
                    )))
                    .build(),
                ),
              ),
          )
          .build(
            log4rs::config::Root::builder()
              .appenders(["console"])
              .build(log::LevelFilter::Trace),
          )?,
      )?;
    }
  }

  zmon::run(&arguments.arguments, config)
}
