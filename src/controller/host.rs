//! Where the flight software runs: a local child process or a remote host reached over SSH.

use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::{Duration, SystemTime};

use chrono::{DateTime, Local};
use tokio::process::{Child, Command};
use tracing::{debug, error, info, warn};

use crate::config::TargetConfig;
use crate::error::ControllerError;

/// Copy regular files in `source` modified at or after `since` into `dest`.
pub fn copy_modified_since(source: &Path, dest: &Path, since: SystemTime) -> Result<usize, ControllerError> {
    fs::create_dir_all(dest)?;
    let mut copied = 0;
    for entry in fs::read_dir(source)? {
        let entry = entry?;
        let metadata = entry.metadata()?;
        if !metadata.is_file() {
            continue;
        }
        if metadata.modified()? >= since {
            let target = dest.join(entry.file_name());
            fs::copy(entry.path(), &target)?;
            info!("Copied {} to {}", entry.file_name().to_string_lossy(), dest.display());
            copied += 1;
        }
    }
    Ok(copied)
}

fn append_log(path: &Path) -> Result<File, ControllerError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    Ok(OpenOptions::new().create(true).append(true).open(path)?)
}

/// Flight software running as a child process of this machine.
#[derive(Debug, Default)]
pub struct LocalHost {
    child: Option<Child>,
}

impl LocalHost {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn pid(&self) -> Option<u32> {
        self.child.as_ref().and_then(Child::id)
    }

    pub async fn build(&self, config: &TargetConfig, log_dir: &Path) -> Result<bool, ControllerError> {
        info!("Building Mission FSW in {}", config.cfs_build_dir.display());
        let output = Command::new("sh")
            .arg("-c")
            .arg(&config.cfs_build_cmd)
            .current_dir(&config.cfs_build_dir)
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|e| ControllerError::Spawn {
                command: config.cfs_build_cmd.clone(),
                reason: e.to_string(),
            })?;

        let log_path = log_dir.join(format!("{}_build_cfs_output.txt", config.name));
        let mut log = append_log(&log_path)?;
        log.write_all(&output.stdout)?;
        log.write_all(&output.stderr)?;

        if !output.status.success() {
            error!("Failed to build CFS Project: {}", output.status);
            return Ok(false);
        }
        Ok(true)
    }

    pub async fn start(
        &mut self,
        config: &TargetConfig,
        run_args: &str,
        log_dir: &Path,
    ) -> Result<u32, ControllerError> {
        if !config.cfs_run_dir.is_dir() {
            return Err(ControllerError::Spawn {
                command: config.run_command(run_args),
                reason: format!("run directory {} does not exist", config.cfs_run_dir.display()),
            });
        }

        let command = config.run_command(run_args);
        let stdout_path = log_dir.join(format!("{}_{}", config.name, config.cfs_output_file));
        let stdout = append_log(&stdout_path)?;
        let stderr = stdout.try_clone()?;
        debug!("Starting CFS executable: {} (output to {})", command, stdout_path.display());

        let mut cmd = Command::new("sh");
        cmd.arg("-c")
            .arg(&command)
            .current_dir(&config.cfs_run_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::from(stdout))
            .stderr(Stdio::from(stderr))
            .kill_on_drop(false);
        #[cfg(unix)]
        cmd.process_group(0);

        let mut child = cmd.spawn().map_err(|e| ControllerError::Spawn {
            command: command.clone(),
            reason: e.to_string(),
        })?;
        let pid = child.id().ok_or_else(|| ControllerError::Spawn {
            command: command.clone(),
            reason: "failed to get process ID".to_string(),
        })?;

        tokio::time::sleep(Duration::from_millis(100)).await;
        if let Some(status) = child.try_wait()? {
            return Err(ControllerError::Spawn {
                command,
                reason: format!("process exited immediately with {}", status),
            });
        }
        self.child = Some(child);
        Ok(pid)
    }

    /// Kill the whole process group, then the shell itself. A second call does nothing.
    pub async fn stop(&mut self) -> bool {
        let Some(mut child) = self.child.take() else {
            return true;
        };
        #[cfg(unix)]
        {
            use nix::sys::signal::{killpg, Signal};
            use nix::unistd::Pid;

            if let Some(pid) = child.id() {
                #[allow(clippy::cast_possible_wrap)]
                let group = Pid::from_raw(pid as i32);
                if let Err(e) = killpg(group, Signal::SIGKILL) {
                    debug!("Failed to kill process group {}: {}", pid, e);
                }
            }
        }
        if let Err(e) = child.kill().await {
            debug!("Failed to close parent process: {}", e);
        }
        true
    }
}

/// Flight software on a remote machine, driven through the `ssh` and `scp` clients.
#[derive(Debug)]
pub struct SshHost {
    destination: String,
    pids: Vec<u32>,
    stdout_path: Option<String>,
}

impl SshHost {
    pub fn new(destination: impl Into<String>) -> Self {
        Self {
            destination: destination.into(),
            pids: Vec::new(),
            stdout_path: None,
        }
    }

    pub fn destination(&self) -> &str {
        &self.destination
    }

    fn remote_error(&self, reason: impl Into<String>) -> ControllerError {
        ControllerError::Remote {
            destination: self.destination.clone(),
            reason: reason.into(),
        }
    }

    /// Run `command` on the remote host, optionally from `cwd`. Returns stdout on success.
    pub async fn run(&self, command: &str, cwd: Option<&Path>) -> Result<String, ControllerError> {
        let remote = match cwd {
            Some(dir) => format!("cd {} && {}", dir.display(), command),
            None => command.to_string(),
        };
        debug!("Running on {}: {}", self.destination, remote);
        let output = Command::new("ssh")
            .arg("-o")
            .arg("BatchMode=yes")
            .arg(&self.destination)
            .arg(&remote)
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|e| ControllerError::Spawn {
                command: format!("ssh {}", self.destination),
                reason: e.to_string(),
            })?;
        if !output.status.success() {
            return Err(self.remote_error(format!(
                "`{}` exited with {}: {}",
                remote,
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    /// Copy a remote file to a local path.
    pub async fn fetch(&self, remote: &str, local: &Path) -> Result<(), ControllerError> {
        if let Some(parent) = local.parent() {
            fs::create_dir_all(parent)?;
        }
        let status = Command::new("scp")
            .arg("-q")
            .arg("-o")
            .arg("BatchMode=yes")
            .arg(format!("{}:{}", self.destination, remote))
            .arg(local)
            .status()
            .await
            .map_err(|e| ControllerError::Spawn {
                command: "scp".to_string(),
                reason: e.to_string(),
            })?;
        if status.success() {
            Ok(())
        } else {
            Err(self.remote_error(format!("scp of {} exited with {}", remote, status)))
        }
    }

    pub async fn build(&self, config: &TargetConfig, log_dir: &Path) -> Result<bool, ControllerError> {
        info!("Building Remote CFS on {}", self.destination);
        let remote_log = format!("/tmp/{}_build_cfs_output.txt", config.name);
        let command = format!("{} > {} 2>&1", config.cfs_build_cmd, remote_log);
        let result = self.run(&command, Some(&config.cfs_build_dir)).await;

        let local_log = log_dir.join(format!("{}_build_cfs_output.txt", config.name));
        if let Err(e) = self.fetch(&remote_log, &local_log).await {
            warn!("Cannot move CFS build output file to script log directory: {}", e);
        }

        match result {
            Ok(_) => Ok(true),
            Err(e) => {
                error!("Failed to build Remote CFS: {}", e);
                Ok(false)
            }
        }
    }

    pub async fn start(&mut self, config: &TargetConfig, run_args: &str) -> Result<u32, ControllerError> {
        let stdout_path = format!("/tmp/{}_{}", config.name, config.cfs_output_file);
        let command = format!(
            "nohup {} >> {} 2>&1 < /dev/null & echo $!",
            config.run_command(run_args),
            stdout_path
        );
        let output = self.run(&command, Some(&config.cfs_run_dir)).await?;
        let pid = output
            .lines()
            .last()
            .and_then(|line| line.trim().parse::<u32>().ok())
            .ok_or_else(|| self.remote_error(format!("no PID in output {:?}", output)))?;

        tokio::time::sleep(Duration::from_secs(1)).await;
        self.run(&format!("ps -p {} > /dev/null 2>&1", pid), None).await?;

        self.pids.push(pid);
        self.stdout_path = Some(stdout_path);
        Ok(pid)
    }

    pub async fn stop(&mut self) -> bool {
        let mut result = true;
        for pid in std::mem::take(&mut self.pids) {
            if let Err(e) = self.run(&format!("kill -SIGINT {}", pid), None).await {
                error!("Failed to kill process with PID {}: {}", pid, e);
                result = false;
            }
        }
        result
    }

    /// Copy the remote stdout log into `log_dir` and remove the remote copy.
    pub async fn collect_output(&mut self, log_dir: &Path) {
        let Some(remote) = self.stdout_path.take() else {
            return;
        };
        let file_name = Path::new(&remote)
            .file_name()
            .map_or_else(|| PathBuf::from("cfs_stdout.txt"), PathBuf::from);
        let local = log_dir.join(file_name);
        match self.fetch(&remote, &local).await {
            Ok(()) => {
                info!("Copied CFS stdout file from remote SSH target");
                if let Err(e) = self.run(&format!("rm {}", remote), None).await {
                    debug!("Failed to remove {}: {}", remote, e);
                }
            }
            Err(e) => info!("Cannot move CFS stdout file to script log directory: {}", e),
        }
    }

    pub async fn archive(&self, source: &Path, dest: &Path, since: SystemTime) -> Result<usize, ControllerError> {
        fs::create_dir_all(dest)?;
        let since: DateTime<Local> = since.into();
        let find = format!(
            "find . -maxdepth 1 -type f -newermt '{}'",
            since.format("%Y-%m-%d %H:%M:%S")
        );
        let listing = self.run(&find, Some(source)).await?;
        let mut copied = 0;
        for name in listing.lines().map(str::trim).filter(|line| !line.is_empty()) {
            let name = name.trim_start_matches("./");
            let remote = format!("{}/{}", source.display(), name);
            self.fetch(&remote, &dest.join(name)).await?;
            info!("Copied {} to {}", name, dest.display());
            copied += 1;
        }
        Ok(copied)
    }
}

/// The process host of one target.
#[derive(Debug)]
pub enum TargetHost {
    Local(LocalHost),
    Remote(SshHost),
}

impl TargetHost {
    pub async fn build(&self, config: &TargetConfig, log_dir: &Path) -> Result<bool, ControllerError> {
        match self {
            TargetHost::Local(host) => host.build(config, log_dir).await,
            TargetHost::Remote(host) => host.build(config, log_dir).await,
        }
    }

    pub async fn start(
        &mut self,
        config: &TargetConfig,
        run_args: &str,
        log_dir: &Path,
    ) -> Result<u32, ControllerError> {
        match self {
            TargetHost::Local(host) => host.start(config, run_args, log_dir).await,
            TargetHost::Remote(host) => host.start(config, run_args).await,
        }
    }

    pub async fn stop(&mut self) -> bool {
        match self {
            TargetHost::Local(host) => host.stop().await,
            TargetHost::Remote(host) => host.stop().await,
        }
    }

    pub async fn archive(&self, source: &Path, dest: &Path, since: SystemTime) -> Result<usize, ControllerError> {
        match self {
            TargetHost::Local(_) => copy_modified_since(source, dest, since),
            TargetHost::Remote(host) => host.archive(source, dest, since).await,
        }
    }

    /// Final cleanup at plugin shutdown: fetch remote logs.
    pub async fn finish(&mut self, log_dir: &Path) {
        if let TargetHost::Remote(host) = self {
            host.collect_output(log_dir).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;

    fn local_config(run_dir: &Path, exe: &str, build_cmd: &str) -> TargetConfig {
        let toml = format!(
            "[cfs]\nccsds_data_dir = \"{dir}\"\ncfs_run_dir = \"{dir}\"\ncfs_build_dir = \"{dir}\"\ncfs_exe = \"{exe}\"\ncfs_build_cmd = \"{build}\"\n",
            dir = run_dir.display(),
            exe = exe,
            build = build_cmd
        );
        Config::from_toml(&toml).unwrap().target("cfs").unwrap()
    }

    #[test]
    fn test_copy_modified_since() {
        let source = tempfile::tempdir().unwrap();
        let dest = tempfile::tempdir().unwrap();
        std::fs::write(source.path().join("old.dat"), b"x").unwrap();
        let since = SystemTime::now() + Duration::from_secs(3600);
        assert_eq!(copy_modified_since(source.path(), dest.path(), since).unwrap(), 0);

        let copied = copy_modified_since(source.path(), dest.path(), SystemTime::UNIX_EPOCH).unwrap();
        assert_eq!(copied, 1);
        assert!(dest.path().join("old.dat").exists());
        assert!(source.path().join("old.dat").exists());
    }

    #[tokio::test]
    async fn test_build_captures_output_and_status() {
        let dir = tempfile::tempdir().unwrap();
        let host = LocalHost::new();

        let ok = local_config(dir.path(), "core", "echo built");
        assert!(host.build(&ok, dir.path()).await.unwrap());
        assert!(host.build(&ok, dir.path()).await.unwrap());
        let log = std::fs::read_to_string(dir.path().join("cfs_build_cfs_output.txt")).unwrap();
        assert!(log.contains("built"));

        let failing = local_config(dir.path(), "core", "exit 3");
        assert!(!host.build(&failing, dir.path()).await.unwrap());
    }

    #[tokio::test]
    async fn test_start_and_stop_local_process() {
        let dir = tempfile::tempdir().unwrap();
        let exe = dir.path().join("fsw.sh");
        std::fs::write(&exe, "#!/bin/sh\necho started\nsleep 30\n").unwrap();
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&exe, std::fs::Permissions::from_mode(0o755)).unwrap();
        }

        let config = local_config(dir.path(), "fsw.sh", "true");
        let mut host = LocalHost::new();
        let pid = host.start(&config, "", dir.path()).await.unwrap();
        assert!(pid > 0);
        assert_eq!(host.pid(), Some(pid));

        assert!(host.stop().await);
        assert!(host.stop().await);
        assert_eq!(host.pid(), None);
    }

    #[tokio::test]
    async fn test_start_fails_without_run_dir() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = local_config(dir.path(), "fsw", "true");
        config.cfs_run_dir = dir.path().join("missing");
        let mut host = LocalHost::new();
        assert!(matches!(
            host.start(&config, "", dir.path()).await,
            Err(ControllerError::Spawn { .. })
        ));
    }
}
