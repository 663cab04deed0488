use std::path::PathBuf;
use std::process::exit;
use std::sync::Arc;

use clap::Parser;

use cbs_config::Config;
use cloud_backup::datastore::DataStore;
use cloud_backup::exitcode;
use cloud_backup::server::reactor::SetupError;
use cloud_backup::server::Server;
use cloud_backup::tools::daemon::daemonize;

#[derive(Parser)]
#[command(name = "cloud-backup-server", about = "Cloud backup server")]
struct Args {
    /// Configuration file path.
    #[arg(short, long, default_value = cbs_config::DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Detach from the terminal and log to syslog.
    #[arg(short, long)]
    daemon: bool,

    /// Working directory after daemonizing.
    #[arg(short, long, default_value = ".")]
    workdir: PathBuf,
}

fn main() {
    let args = Args::parse();

    if args.daemon {
        if let Err(err) = daemonize(&args.workdir) {
            eprintln!("unable to daemonize: {}", err);
            exit(exitcode::DAEMONIZE_ERROR);
        }
        if let Err(err) = syslog::init(
            syslog::Facility::LOG_DAEMON,
            log::LevelFilter::Info,
            Some("cloud-backup-server"),
        ) {
            // stderr points at /dev/null by now, but there is nothing
            // better left to report to
            eprintln!("unable to initialize syslog: {}", err);
            exit(exitcode::LOGGER_INIT_ERROR);
        }
    } else {
        let logger = env_logger::Builder::from_env(
            env_logger::Env::default().default_filter_or("info"),
        )
        .try_init();
        if let Err(err) = logger {
            eprintln!("unable to initialize logger: {}", err);
            exit(exitcode::LOGGER_INIT_ERROR);
        }
    }

    let config = match Config::load(&args.config, true) {
        Ok(config) => Arc::new(config),
        Err(err) => {
            log::error!("{:#}", err);
            exit(exitcode::LOAD_CONFIG_ERROR);
        }
    };

    let store = match DataStore::open(
        &config.backup_file_dir,
        &config.data_manager_filepath,
        config.lru_file_capacity,
        config.lru_file_content_size,
    ) {
        Ok(store) => store,
        Err(err) => {
            log::error!("datastore initialization failed: {:#}", err);
            exit(exitcode::DATASTORE_INIT_ERROR);
        }
    };

    let server = match Server::bind(Arc::clone(&config), store) {
        Ok(server) => server,
        Err(err) => {
            log::error!("{}", err);
            exit(match err {
                SetupError::Pipe(_) => exitcode::PIPE_INIT_ERROR,
                SetupError::SocketCreate(_) => exitcode::SOCKET_INIT_ERROR,
                SetupError::SocketBind(..) => exitcode::SOCKET_BIND_ERROR,
                SetupError::SocketListen(_) => exitcode::SOCKET_LISTEN_ERROR,
                SetupError::EpollCreate(_) => exitcode::EPOLL_CREATE_ERROR,
                SetupError::Spawn(_) => exitcode::ALLOCATION_ERROR,
            });
        }
    };

    log::info!("listening on port {}", config.server_port);
    if let Err(err) = server.run() {
        log::error!("server failed: {:#}", err);
        exit(exitcode::SERVER_START_ERROR);
    }
}
