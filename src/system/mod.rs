use std::{
    fmt,
    path::{Path, PathBuf},
    process::{Command, Stdio},
};

pub mod proxy;

#[cfg(target_os = "linux")]
mod linux;

#[cfg(any(target_os = "macos", test))]
mod macos;

const ENGINE_NAMES: [&str; 2] = ["xray", "v2ray"];
const SYSTEM_DIRECTORIES: [&str; 3] = ["/usr/local/bin", "/opt/homebrew/bin", "/usr/bin"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChildExit {
    pub code: Option<i32>,
}

impl ChildExit {
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }
}

impl fmt::Display for ChildExit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.code {
            Some(code) => write!(f, "exit code: {code}"),
            None => write!(f, "terminated by signal"),
        }
    }
}

pub fn run_silent_with_output(program: &str, arguments: &[&str]) -> (bool, String) {
    log::debug!("[cmd] {} {}", program, arguments.join(" "));
    let output = Command::new(program)
        .args(arguments)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .output();

    match output {
        Ok(output) => {
            let success = output.status.success();
            let stdout = String::from_utf8_lossy(&output.stdout).to_string();
            if !success {
                log::debug!(
                    "[cmd] FAILED (exit {}): {} {}\n  stdout: {}\n  stderr: {}",
                    output.status.code().unwrap_or(-1),
                    program,
                    arguments.join(" "),
                    stdout.trim(),
                    String::from_utf8_lossy(&output.stderr).trim(),
                );
            } else {
                log::trace!(
                    "[cmd] OK: {} {} -> stdout={}",
                    program,
                    arguments.join(" "),
                    stdout.trim(),
                );
            }
            (success, stdout)
        }
        Err(error) => {
            log::debug!("[cmd] spawn error for {program}: {error}");
            (false, error.to_string())
        }
    }
}

pub fn run_silent(program: &str, arguments: &[&str]) -> bool {
    run_silent_with_output(program, arguments).0
}

/// Asks a process to exit with SIGTERM.
pub fn terminate_process(process_id: u32) -> bool {
    let process_id_string = process_id.to_string();
    run_silent("kill", &["-TERM", &process_id_string])
}

#[cfg(unix)]
pub fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;

    std::fs::metadata(path)
        .map(|metadata| metadata.is_file() && metadata.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

#[cfg(not(unix))]
pub fn is_executable(path: &Path) -> bool {
    path.is_file()
}

/// Returns the engine to run and whether it was actually found. An explicit
/// path is returned as is so that a missing file surfaces as a start error.
pub fn find_engine_binary(data_directory: &Path, configured: Option<&Path>) -> (PathBuf, bool) {
    if let Some(configured) = configured {
        let found = is_executable(configured);
        if !found {
            log::warn!(
                "[binary] configured engine {} is not executable",
                configured.display()
            );
        }
        return (configured.to_path_buf(), found);
    }

    let bundled = data_directory.join("engine");
    for name in ENGINE_NAMES {
        let candidate = bundled.join(name);
        if is_executable(&candidate) {
            log::info!("[binary] found bundled engine: {}", candidate.display());
            return (candidate, true);
        }
    }

    for name in ENGINE_NAMES {
        let (success, output) = run_silent_with_output("which", &[name]);
        let path = output.trim();
        if success && !path.is_empty() {
            log::info!("[binary] found via which: {name} -> {path}");
            return (PathBuf::from(path), true);
        }
    }

    for directory in SYSTEM_DIRECTORIES {
        for name in ENGINE_NAMES {
            let candidate = Path::new(directory).join(name);
            if is_executable(&candidate) {
                log::info!("[binary] found on disk: {}", candidate.display());
                return (candidate, true);
            }
        }
    }

    log::warn!("[binary] no xray or v2ray engine found in search paths");
    (bundled.join(ENGINE_NAMES[0]), false)
}

/// First line of `<engine> -version`, e.g. `Xray 1.8.4 (Xray, Penetrates Everything.)`.
pub fn engine_version(binary: &Path) -> Option<String> {
    let output = Command::new(binary)
        .arg("-version")
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .output();

    match output {
        Ok(output) => {
            let stdout = String::from_utf8_lossy(&output.stdout);
            let stderr = String::from_utf8_lossy(&output.stderr);
            let first_line = stdout
                .lines()
                .chain(stderr.lines())
                .map(str::trim)
                .find(|line| !line.is_empty())
                .map(str::to_string);
            match first_line {
                Some(ref line) => log::info!("[preflight] engine OK: {line}"),
                None => log::warn!("[preflight] engine produced no version output"),
            }
            first_line
        }
        Err(error) => {
            log::error!("[preflight] cannot run '{}': {error}", binary.display());
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn child_exit_describes_signal_termination() {
        assert_eq!(ChildExit { code: Some(3) }.to_string(), "exit code: 3");
        assert_eq!(ChildExit { code: None }.to_string(), "terminated by signal");
        assert!(ChildExit { code: Some(0) }.success());
    }

    #[cfg(unix)]
    fn write_script(path: &Path, body: &str) {
        use std::os::unix::fs::PermissionsExt;

        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, format!("#!/bin/sh\n{body}\n")).unwrap();
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o755)).unwrap();
    }

    #[cfg(unix)]
    #[test]
    fn bundled_engine_is_preferred_and_reports_version() {
        let directory =
            std::env::temp_dir().join(format!("v2rayctl-system-{}", uuid::Uuid::new_v4()));
        let engine = directory.join("engine").join("v2ray");
        write_script(&engine, "echo 'V2Ray 5.10.0 (V2Fly)'");

        let (path, found) = find_engine_binary(&directory, None);
        assert!(found);
        assert_eq!(path, engine);
        assert_eq!(engine_version(&path).as_deref(), Some("V2Ray 5.10.0 (V2Fly)"));

        std::fs::remove_dir_all(directory).ok();
    }

    #[test]
    fn configured_engine_is_returned_even_when_missing() {
        let missing = Path::new("/nonexistent/v2rayctl/xray");
        let (path, found) = find_engine_binary(Path::new("/nonexistent"), Some(missing));
        assert_eq!(path, missing);
        assert!(!found);
    }
}
