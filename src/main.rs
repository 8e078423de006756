mod connection;
mod connection_state;
mod engine_config;
mod error;
mod log_writer;
mod process_log;
mod profile;
mod profile_store;
mod settings;
mod share_link;
mod supervisor;
mod system;

use std::{
    io::{BufRead, Read},
    path::{Path, PathBuf},
    process::ExitCode,
    sync::{Arc, Mutex},
};

use clap::{Parser, Subcommand};

use crate::{
    connection::{
        ConnectionEvent, ConnectionManager, ConnectionOptions, ConnectionServices, EnginePaths,
    },
    log_writer::LogFile,
    process_log::{EngineLog, LogLevel, LogSink, LogSource},
    profile::Profile,
    profile_store::ProfileStore,
    settings::{RoutingMode, SettingsChange, SettingsStore, to_sorted_json},
    supervisor::ProcessSupervisor,
    system::proxy::{NoopProxy, ProxyToggle, SystemProxy},
};

type CliResult = Result<(), Box<dyn std::error::Error>>;

#[derive(Parser)]
#[command(name = "v2rayctl", version, about = "Import share links and run a v2ray/Xray engine")]
struct Cli {
    /// Directory holding profiles, settings and engine files.
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    /// Engine executable to run instead of searching for xray or v2ray.
    #[arg(long, global = true)]
    engine: Option<PathBuf>,

    /// Leave the OS proxy configuration untouched.
    #[arg(long, global = true)]
    no_system_proxy: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Import a vmess/vless/trojan/ss link or profile JSON; `-` reads stdin.
    Import { text: String },
    /// List stored profiles; `*` marks the selected one.
    List,
    /// Print a profile as JSON.
    Show { profile: String },
    Select { profile: String },
    Rename { profile: String, name: String },
    Remove { profile: String },
    Duplicate { profile: String },
    /// Check a profile against the protocol rules.
    Validate { profile: String },
    /// Print the engine configuration for a profile (default: selected).
    Config {
        profile: Option<String>,
        /// Also write it to the engine configuration path.
        #[arg(long)]
        write: bool,
    },
    Settings {
        #[command(subcommand)]
        command: SettingsCommand,
    },
    /// Show the persisted app and engine log.
    Logs {
        #[arg(long)]
        level: Option<LogLevel>,
        #[arg(long)]
        source: Option<LogSource>,
        #[arg(long)]
        clear: bool,
    },
    /// Connect and read commands from stdin: r reconnect, s status,
    /// m <mode> change routing mode, q quit.
    Connect { profile: Option<String> },
    /// Locate the engine and print its version.
    Version,
}

#[derive(Subcommand)]
enum SettingsCommand {
    Show,
    Mode {
        mode: RoutingMode,
    },
    Ports {
        #[arg(long)]
        socks_host: Option<String>,
        #[arg(long)]
        socks_port: Option<u16>,
        #[arg(long)]
        udp: Option<bool>,
        #[arg(long)]
        http_host: Option<String>,
        #[arg(long)]
        http_port: Option<u16>,
    },
    /// Replace custom rules; each flag may repeat, one rule per value.
    Rules {
        #[arg(long)]
        proxy: Vec<String>,
        #[arg(long)]
        direct: Vec<String>,
        #[arg(long)]
        block: Vec<String>,
        /// Empty every rule list not given on this call.
        #[arg(long)]
        reset: bool,
    },
    LogLevel {
        level: String,
    },
    DomainStrategy {
        strategy: String,
    },
    AutoConnect {
        #[arg(action = clap::ArgAction::Set)]
        enabled: bool,
    },
    LogSize {
        megabytes: u32,
    },
    Reset,
}

fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("v2rayctl=info"))
        .init();

    let cli = Cli::parse();
    log::debug!(
        "v2rayctl v{} (RUST_LOG={})",
        env!("CARGO_PKG_VERSION"),
        std::env::var("RUST_LOG").unwrap_or_else(|_| "<default: info>".into()),
    );

    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(error) => {
            eprintln!("error: {error}");
            ExitCode::FAILURE
        }
    }
}

fn data_directory(configured: Option<PathBuf>) -> PathBuf {
    let directory = configured.unwrap_or_else(|| {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("v2rayctl")
    });
    if let Err(error) = std::fs::create_dir_all(&directory) {
        log::warn!(
            "[startup] failed to create data directory {}: {error}",
            directory.display()
        );
    }
    directory
}

fn configuration_path(data_directory: &Path) -> PathBuf {
    data_directory.join("engine").join("config.json")
}

fn log_file(data_directory: &Path, settings: &SettingsStore) -> LogFile {
    LogFile::new(
        data_directory.join("engine").join("engine_logs.json"),
        u64::from(settings.settings().max_log_file_size_mb),
    )
}

fn run(cli: Cli) -> CliResult {
    let data_directory = data_directory(cli.data_dir);
    log::debug!("[startup] data directory: {}", data_directory.display());

    match cli.command {
        Command::Import { text } => {
            let text = if text == "-" {
                let mut buffer = String::new();
                std::io::stdin().read_to_string(&mut buffer)?;
                buffer
            } else {
                text
            };
            let mut store = ProfileStore::load(data_directory);
            let id = store.import(&text)?;
            if let Some(profile) = store.get(id) {
                println!("imported '{}' ({id})", profile.name);
            }
        }
        Command::List => {
            let store = ProfileStore::load(data_directory);
            let selected = store.selected().map(|profile| profile.id);
            for profile in store.profiles() {
                let marker = if Some(profile.id) == selected { '*' } else { ' ' };
                println!(
                    "{marker} {:<24} {:<12} {:<32} {}",
                    profile.name,
                    profile.protocol.as_str(),
                    profile.endpoint(),
                    profile.id
                );
            }
        }
        Command::Show { profile } => {
            let store = ProfileStore::load(data_directory);
            println!("{}", to_sorted_json(store.resolve(&profile)?)?);
        }
        Command::Select { profile } => {
            let mut store = ProfileStore::load(data_directory);
            let id = store.resolve(&profile)?.id;
            store.select(Some(id))?;
        }
        Command::Rename { profile, name } => {
            let mut store = ProfileStore::load(data_directory);
            let renamed = Profile {
                name,
                ..store.resolve(&profile)?.clone()
            };
            store.update(renamed)?;
        }
        Command::Remove { profile } => {
            let mut store = ProfileStore::load(data_directory);
            let id = store.resolve(&profile)?.id;
            let removed = store.delete(id)?;
            println!("removed '{}'", removed.name);
        }
        Command::Duplicate { profile } => {
            let mut store = ProfileStore::load(data_directory);
            let id = store.resolve(&profile)?.id;
            let copy = store.duplicate(id)?;
            if let Some(profile) = store.get(copy) {
                println!("created '{}' ({copy})", profile.name);
            }
        }
        Command::Validate { profile } => {
            let store = ProfileStore::load(data_directory);
            let errors = store.resolve(&profile)?.validate();
            if errors.is_empty() {
                println!("ok");
            } else {
                for error in &errors {
                    println!("- {error}");
                }
                return Err(format!("{} validation errors", errors.len()).into());
            }
        }
        Command::Config { profile, write } => {
            let store = ProfileStore::load(data_directory.clone());
            let settings = SettingsStore::load(SettingsStore::settings_file_path(&data_directory));
            let profile = pick_profile(&store, profile.as_deref())?;
            let document = engine_config::build(profile, settings.routing());
            println!("{}", document.to_json()?);
            if write {
                let path = configuration_path(&data_directory);
                connection::write_configuration(&path, &document)?;
                eprintln!("wrote {}", path.display());
            }
        }
        Command::Settings { command } => {
            let mut settings =
                SettingsStore::load(SettingsStore::settings_file_path(&data_directory));
            run_settings(&mut settings, command)?;
        }
        Command::Logs {
            level,
            source,
            clear,
        } => {
            let settings = SettingsStore::load(SettingsStore::settings_file_path(&data_directory));
            let log = EngineLog::persistent(log_file(&data_directory, &settings));
            if clear {
                log.clear();
                println!("log cleared");
            } else {
                for entry in log.entries(level, source) {
                    println!("{entry}");
                }
            }
            log.shutdown();
        }
        Command::Connect { profile } => {
            connect(&data_directory, cli.engine, cli.no_system_proxy, profile)?;
        }
        Command::Version => {
            let (path, found) = system::find_engine_binary(&data_directory, cli.engine.as_deref());
            if !found {
                return Err(format!("no engine found (looked for {})", path.display()).into());
            }
            match system::engine_version(&path) {
                Some(version) => println!("{version}\n{}", path.display()),
                None => return Err(format!("{} did not report a version", path.display()).into()),
            }
        }
    }
    Ok(())
}

fn pick_profile<'a>(
    store: &'a ProfileStore,
    key: Option<&str>,
) -> Result<&'a Profile, Box<dyn std::error::Error>> {
    match key {
        Some(key) => Ok(store.resolve(key)?),
        None => store
            .selected()
            .ok_or_else(|| "no profile selected; pass a name or run `select`".into()),
    }
}

fn run_settings(settings: &mut SettingsStore, command: SettingsCommand) -> CliResult {
    let change = match command {
        SettingsCommand::Show => {
            println!("{}", to_sorted_json(settings.settings())?);
            return Ok(());
        }
        SettingsCommand::Mode { mode } => settings.set_mode(mode)?,
        SettingsCommand::Ports {
            socks_host,
            socks_port,
            udp,
            http_host,
            http_port,
        } => {
            let socks = settings.set_socks_listener(socks_host, socks_port, udp)?;
            let http = settings.set_http_listener(http_host, http_port)?;
            SettingsChange {
                requires_reconnect: socks.requires_reconnect || http.requires_reconnect,
            }
        }
        SettingsCommand::Rules {
            proxy,
            direct,
            block,
            reset,
        } => {
            let joined = |rules: Vec<String>| {
                (reset || !rules.is_empty()).then(|| rules.join("\n"))
            };
            settings.set_rules(joined(proxy), joined(direct), joined(block))?
        }
        SettingsCommand::LogLevel { level } => settings.set_log_level(&level)?,
        SettingsCommand::DomainStrategy { strategy } => settings.set_domain_strategy(&strategy)?,
        SettingsCommand::AutoConnect { enabled } => settings.set_auto_connect(enabled)?,
        SettingsCommand::LogSize { megabytes } => settings.set_max_log_file_size_mb(megabytes)?,
        SettingsCommand::Reset => settings.reset()?,
    };
    if change.requires_reconnect {
        println!("saved; reconnect a running session to apply");
    } else {
        println!("saved");
    }
    Ok(())
}

/// Mirrors every log entry to the terminal.
struct ConsoleSink {
    log: Arc<EngineLog>,
}

impl LogSink for ConsoleSink {
    fn add_log(&self, message: &str, level: LogLevel, source: LogSource) {
        println!("[{level}] {source}: {message}");
        self.log.add_log(message, level, source);
    }
}

fn connect(
    data_directory: &Path,
    engine: Option<PathBuf>,
    no_system_proxy: bool,
    key: Option<String>,
) -> CliResult {
    let mut store = ProfileStore::load(data_directory.to_path_buf());
    let profile = pick_profile(&store, key.as_deref())?.clone();
    if store.selected().map(|selected| selected.id) != Some(profile.id) {
        store.select(Some(profile.id))?;
    }

    let settings = SettingsStore::load(SettingsStore::settings_file_path(data_directory));
    let log = Arc::new(EngineLog::persistent(log_file(data_directory, &settings)));
    let settings = Arc::new(Mutex::new(settings));

    let (executable, found) = system::find_engine_binary(data_directory, engine.as_deref());
    if found && let Some(version) = system::engine_version(&executable) {
        println!("engine: {version}");
    }

    let proxy: Arc<dyn SystemProxy> = if no_system_proxy {
        Arc::new(NoopProxy)
    } else {
        Arc::new(ProxyToggle::detect())
    };

    let manager = ConnectionManager::new(
        ConnectionServices {
            supervisor: Arc::new(ProcessSupervisor),
            proxy,
            sink: Arc::new(ConsoleSink { log: log.clone() }),
            settings: settings.clone(),
        },
        EnginePaths {
            executable: executable.clone(),
            configuration: configuration_path(data_directory),
        },
        ConnectionOptions::default(),
    );

    let events = manager.subscribe();
    std::thread::spawn(move || {
        for event in events {
            match event {
                ConnectionEvent::StateChanged(state) => match state.error_message() {
                    Some(message) => eprintln!("connection error: {message}"),
                    None => println!("state: {state}"),
                },
                ConnectionEvent::SystemProxy { enabled, detail } => {
                    println!("system proxy {}: {detail}", if enabled { "on" } else { "off" })
                }
            }
        }
    });

    manager.connect(profile);

    for line in std::io::stdin().lock().lines() {
        let line = line?;
        let mut words = line.split_whitespace();
        match words.next() {
            None => {}
            Some("q") => break,
            Some("r") => {
                if !manager.reconnect() {
                    println!("not connected");
                }
            }
            Some("s") => {
                let profile = manager.current_profile();
                println!(
                    "{} | {} | engine {} | config {}",
                    manager.state(),
                    profile
                        .map(|profile| format!("{} ({})", profile.name, profile.endpoint()))
                        .unwrap_or_else(|| "no profile".into()),
                    executable.display(),
                    manager.configuration_path().display()
                );
            }
            Some("m") => match words.next().map(str::parse::<RoutingMode>) {
                Some(Ok(mode)) => {
                    let change = settings
                        .lock()
                        .unwrap_or_else(|poisoned| poisoned.into_inner())
                        .set_mode(mode)?;
                    manager.settings_changed(change);
                }
                Some(Err(error)) => println!("{error}"),
                None => println!("usage: m <global|direct|bypass-local-region>"),
            },
            Some(other) => println!("unknown command '{other}' (r, s, m <mode>, q)"),
        }
    }

    manager.shutdown();
    log.shutdown();
    Ok(())
}
