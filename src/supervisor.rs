use std::{
    io::{BufRead, BufReader, ErrorKind, Read},
    path::Path,
    process::{Child, Command, Stdio},
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, Ordering},
    },
    thread::JoinHandle,
    time::{Duration, Instant},
};

use crate::{
    error::StartError,
    system::{ChildExit, terminate_process},
};

pub const GRACEFUL_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(3);
const POLL_INTERVAL: Duration = Duration::from_millis(100);

pub type OutputCallback = Arc<dyn Fn(&str) + Send + Sync>;
pub type ExitCallback = Box<dyn FnOnce(ChildExit) + Send>;

/// Callbacks a started engine reports through. `on_exit` runs once, on a
/// background thread, whether the engine crashed or was stopped.
pub struct EngineHooks {
    pub on_output: OutputCallback,
    pub on_exit: ExitCallback,
}

pub trait EngineHandle: Send {
    fn id(&self) -> u32;
    fn is_running(&self) -> bool;
    /// Asks the engine to exit, force-killing it after `timeout`. The wait
    /// happens on the returned thread.
    fn stop(self: Box<Self>, timeout: Duration) -> JoinHandle<()>;
}

pub trait Supervisor: Send + Sync {
    fn start(
        &self,
        executable: &Path,
        configuration_path: &Path,
        hooks: EngineHooks,
    ) -> Result<Box<dyn EngineHandle>, StartError>;
}

/// Runs the engine as `<executable> -config <configuration_path>`.
pub struct ProcessSupervisor;

impl Supervisor for ProcessSupervisor {
    fn start(
        &self,
        executable: &Path,
        configuration_path: &Path,
        hooks: EngineHooks,
    ) -> Result<Box<dyn EngineHandle>, StartError> {
        if !executable.is_file() {
            return Err(StartError::ExecutableNotFound(executable.to_path_buf()));
        }
        if !configuration_path.is_file() {
            return Err(StartError::ConfigFileNotFound(
                configuration_path.to_path_buf(),
            ));
        }

        log::info!(
            "[connect] spawning: {} -config {}",
            executable.display(),
            configuration_path.display(),
        );
        let mut child = Command::new(executable)
            .arg("-config")
            .arg(configuration_path)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(StartError::Spawn)?;

        let process_id = child.id();
        log::info!("[connect] engine started, pid={process_id}");

        if let Some(stdout) = child.stdout.take() {
            start_output_reader("stdout", stdout, hooks.on_output.clone());
        }
        if let Some(stderr) = child.stderr.take() {
            start_output_reader("stderr", stderr, hooks.on_output.clone());
        }

        let child = Arc::new(Mutex::new(child));
        let exited = Arc::new(AtomicBool::new(false));
        start_exit_monitor(process_id, child.clone(), exited.clone(), hooks.on_exit);

        Ok(Box::new(ProcessHandle {
            process_id,
            child,
            exited,
        }))
    }
}

fn start_output_reader(
    stream: &'static str,
    source: impl Read + Send + 'static,
    on_output: OutputCallback,
) {
    std::thread::spawn(move || {
        let mut reader = BufReader::new(source);
        let mut buffer = Vec::new();
        loop {
            buffer.clear();
            match reader.read_until(b'\n', &mut buffer) {
                Ok(0) => break,
                // Engines may print bytes that are not UTF-8; keep reading past them.
                Ok(_) => {
                    let line = String::from_utf8_lossy(&buffer);
                    on_output(line.trim_end_matches(['\r', '\n']));
                }
                Err(error) if error.kind() == ErrorKind::Interrupted => continue,
                Err(error) => {
                    log::debug!("[logs] {stream} read error: {error}");
                    break;
                }
            }
        }
        log::debug!("[logs] {stream} reader finished");
    });
}

fn start_exit_monitor(
    process_id: u32,
    child: Arc<Mutex<Child>>,
    exited: Arc<AtomicBool>,
    on_exit: ExitCallback,
) {
    std::thread::spawn(move || {
        let exit = loop {
            let status = {
                let mut child = child.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
                child.try_wait()
            };
            match status {
                Ok(Some(status)) => break ChildExit { code: status.code() },
                Ok(None) => std::thread::sleep(POLL_INTERVAL),
                Err(error) => {
                    log::warn!("[monitor] wait failed for pid={process_id}: {error}");
                    break ChildExit { code: None };
                }
            }
        };

        exited.store(true, Ordering::SeqCst);
        if exit.success() {
            log::info!("[monitor] engine pid={process_id} exited ({exit})");
        } else {
            log::warn!("[monitor] engine pid={process_id} exited ({exit})");
        }
        on_exit(exit);
    });
}

struct ProcessHandle {
    process_id: u32,
    child: Arc<Mutex<Child>>,
    exited: Arc<AtomicBool>,
}

impl EngineHandle for ProcessHandle {
    fn id(&self) -> u32 {
        self.process_id
    }

    fn is_running(&self) -> bool {
        !self.exited.load(Ordering::SeqCst)
    }

    fn stop(self: Box<Self>, timeout: Duration) -> JoinHandle<()> {
        let Self {
            process_id,
            child,
            exited,
        } = *self;

        std::thread::spawn(move || {
            if exited.load(Ordering::SeqCst) {
                log::debug!("[terminate] pid={process_id} already exited");
                return;
            }
            if terminate_process(process_id) {
                log::info!("[terminate] sent SIGTERM to pid={process_id}");
            } else {
                log::info!("[terminate] SIGTERM failed for pid={process_id}");
            }

            let started = Instant::now();
            while started.elapsed() < timeout {
                if exited.load(Ordering::SeqCst) {
                    log::info!(
                        "[terminate] engine exited gracefully after {:?}",
                        started.elapsed()
                    );
                    return;
                }
                std::thread::sleep(POLL_INTERVAL);
            }

            log::warn!("[terminate] graceful shutdown timed out for pid={process_id}");
            let mut child = child.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            match child.kill() {
                Ok(()) => log::info!("[terminate] killed pid={process_id}"),
                Err(error) => log::warn!("[terminate] kill failed for pid={process_id}: {error}"),
            }
        })
    }
}
