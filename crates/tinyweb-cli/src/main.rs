use clap::Parser;
use mimalloc::MiMalloc;
use std::path::PathBuf;
use std::process::ExitCode;
use tinyweb::{ActorModel, Config, Server};

#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

/// Flags override the TINYWEB_* environment (and .env) settings.
#[derive(Parser, Debug)]
#[command(name = "tinyweb")]
#[command(about = "Epoll HTTP/1.1 server with a fixed worker pool")]
#[command(version)]
struct Args {
    /// Listen port
    #[arg(short = 'p', long)]
    port: Option<u16>,

    /// Listen host
    #[arg(long)]
    host: Option<String>,

    /// Trigger combination: 0 LT+LT, 1 LT+ET, 2 ET+LT, 3 ET+ET (listener+connection)
    #[arg(short = 'm', long = "trig-mode", value_parser = clap::value_parser!(u8).range(0..=3))]
    trig_mode: Option<u8>,

    /// Graceful close with SO_LINGER (0 off, 1 on)
    #[arg(short = 'o', long = "linger", value_parser = clap::value_parser!(u8).range(0..=1))]
    linger: Option<u8>,

    /// Credential store handles
    #[arg(short = 's', long = "store-pool")]
    store_pool: Option<usize>,

    /// Worker threads
    #[arg(short = 't', long)]
    threads: Option<usize>,

    /// Disable logging (0 keep, 1 close)
    #[arg(short = 'c', long = "close-log", value_parser = clap::value_parser!(u8).range(0..=1))]
    close_log: Option<u8>,

    /// Actor model: 0 proactor, 1 reactor
    #[arg(short = 'a', long = "actor")]
    actor: Option<ActorModel>,

    /// Document root
    #[arg(long)]
    root: Option<PathBuf>,

    /// JSON account file
    #[arg(long)]
    credentials: Option<PathBuf>,
}

impl Args {
    fn apply(self, config: &mut Config) {
        if let Some(port) = self.port {
            config.port = port;
        }
        if let Some(host) = self.host {
            config.host = host;
        }
        if let Some(combo) = self.trig_mode {
            config.set_trigger_combo(combo);
        }
        if let Some(linger) = self.linger {
            config.opt_linger = linger == 1;
        }
        if let Some(size) = self.store_pool {
            config.store_pool_size = size;
        }
        if let Some(threads) = self.threads {
            config.workers = threads;
        }
        if let Some(close) = self.close_log {
            config.close_log = close == 1;
        }
        if let Some(actor) = self.actor {
            config.actor_model = actor;
        }
        if let Some(root) = self.root {
            config.doc_root = root;
        }
        if self.credentials.is_some() {
            config.credentials_path = self.credentials;
        }
    }
}

fn run(args: Args) -> tinyweb::ServerResult<()> {
    let mut config = Config::from_env()?;
    args.apply(&mut config);
    config.validate()?;
    tinyweb::init_logging(&config);

    let handle = Server::new(config).start()?;
    let trigger = handle.shutdown_trigger();
    if let Err(e) = ctrlc::set_handler(move || {
        tracing::info!("received shutdown signal");
        trigger.fire();
    }) {
        tracing::warn!(error = %e, "could not install Ctrl-C handler");
    }
    handle.join()
}

fn main() -> ExitCode {
    let args = Args::parse();
    match run(args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("tinyweb: {e}");
            ExitCode::FAILURE
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tinyweb::TriggerMode;

    #[test]
    fn flags_override_config() {
        let args = Args::parse_from([
            "tinyweb", "-p", "8080", "-m", "3", "-o", "1", "-t", "4", "-c", "1", "-a", "1",
            "--root", "/srv/www",
        ]);
        let mut config = Config::default();
        args.apply(&mut config);
        assert_eq!(config.port, 8080);
        assert_eq!(config.listen_trigger, TriggerMode::Edge);
        assert_eq!(config.conn_trigger, TriggerMode::Edge);
        assert!(config.opt_linger);
        assert_eq!(config.workers, 4);
        assert!(config.close_log);
        assert_eq!(config.actor_model, ActorModel::Reactor);
        assert_eq!(config.doc_root, PathBuf::from("/srv/www"));
    }

    #[test]
    fn unset_flags_keep_config() {
        let args = Args::parse_from(["tinyweb"]);
        let mut config = Config::default();
        args.apply(&mut config);
        assert_eq!(config.port, 9006);
        assert_eq!(config.actor_model, ActorModel::Proactor);
    }

    #[test]
    fn out_of_range_trigger_is_rejected() {
        assert!(Args::try_parse_from(["tinyweb", "-m", "4"]).is_err());
    }
}
