// src/daemon.rs
use anyhow::{Context, Result};
use std::fs::{self, File};
use std::path::Path;
use std::process::{Command, Stdio};
use tracing::{error, warn};

use crate::config::DaemonSettings;

/// Start the scheduler as a background process running `run`
pub async fn start_daemon(settings: &DaemonSettings, config_path: Option<&Path>) -> Result<()> {
    // Check if daemon is already running
    if is_daemon_running(settings)? {
        println!("Candle sync is already running.");
        return Ok(());
    }

    let log_file = File::create(&settings.log_file)
        .with_context(|| format!("Failed to create log file {}", settings.log_file))?;

    let mut cmd = Command::new(std::env::current_exe()?);
    if let Some(path) = config_path {
        cmd.arg("--config").arg(path);
    }
    cmd.arg("run")
        .stdout(Stdio::from(log_file.try_clone()?))
        .stderr(Stdio::from(log_file))
        .stdin(Stdio::null());

    if std::env::var_os("RUST_LOG").is_none() {
        cmd.env("RUST_LOG", "info");
    }

    let child = cmd.spawn().context("Failed to spawn scheduler process")?;
    let pid = child.id();

    fs::write(&settings.pid_file, pid.to_string())
        .with_context(|| format!("Failed to write PID file {}", settings.pid_file))?;

    println!("Candle sync daemon started with PID {}.", pid);
    println!("Logs are being written to {}", settings.log_file);

    #[cfg(not(unix))]
    {
        println!("Note: On Windows, the process may terminate when you log out.");
    }

    Ok(())
}

/// Stop the daemon, escalating to a forced kill if it does not exit
pub async fn stop_daemon(settings: &DaemonSettings) -> Result<()> {
    let Some(pid) = read_pid(settings)? else {
        println!("Candle sync is not running.");
        return Ok(());
    };

    if !process_alive(pid)? {
        warn!("Process with PID {} is not running, removing stale PID file", pid);
        fs::remove_file(&settings.pid_file)?;
        println!("Removed stale PID file.");
        return Ok(());
    }

    #[cfg(unix)]
    {
        // SIGTERM lets the scheduler finish its current write
        let kill_status = Command::new("kill").arg(pid.to_string()).status()?;

        if !kill_status.success() {
            error!("Failed to terminate process with PID {}", pid);
            return Err(anyhow::anyhow!("Failed to terminate process with PID {}", pid));
        }

        println!("Sent termination signal to candle sync daemon (PID {}).", pid);

        // Shutdown timeout plus some slack
        for _ in 0..14 {
            if !process_alive(pid)? {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(500)).await;
        }

        if process_alive(pid)? {
            println!("Process still running, attempting force kill...");
            let force_kill_status = Command::new("kill").arg("-9").arg(pid.to_string()).status()?;

            if force_kill_status.success() {
                println!("Force killed candle sync daemon (PID {}).", pid);
            } else {
                return Err(anyhow::anyhow!("Failed to terminate process with PID {}", pid));
            }
        }
    }

    #[cfg(not(unix))]
    {
        let status = Command::new("taskkill")
            .arg("/PID")
            .arg(pid.to_string())
            .arg("/F")
            .status()?;

        if !status.success() {
            println!("Failed to terminate process. The process may have already exited.");
        }
    }

    if Path::new(&settings.pid_file).exists() {
        fs::remove_file(&settings.pid_file)?;
    }
    println!("Candle sync daemon stopped.");

    Ok(())
}

fn read_pid(settings: &DaemonSettings) -> Result<Option<u32>> {
    if !Path::new(&settings.pid_file).exists() {
        return Ok(None);
    }

    let pid_str = fs::read_to_string(&settings.pid_file)?;
    let pid = pid_str.trim().parse::<u32>().context("Invalid PID in PID file")?;
    Ok(Some(pid))
}

fn process_alive(pid: u32) -> Result<bool> {
    #[cfg(unix)]
    {
        let status = Command::new("ps")
            .arg("-p")
            .arg(pid.to_string())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()?;

        Ok(status.success())
    }

    #[cfg(not(unix))]
    {
        let output = Command::new("tasklist")
            .arg("/FI")
            .arg(format!("PID eq {}", pid))
            .arg("/NH")
            .output()?;

        let output_str = String::from_utf8_lossy(&output.stdout);
        Ok(output_str.contains(&pid.to_string()))
    }
}

/// Check if the daemon is running
fn is_daemon_running(settings: &DaemonSettings) -> Result<bool> {
    match read_pid(settings)? {
        Some(pid) => process_alive(pid),
        None => Ok(false),
    }
}

/// Get the last few lines of the log file
fn get_recent_logs(log_file: &str, lines: usize) -> Result<String> {
    if !Path::new(log_file).exists() {
        return Ok("No log file found. The daemon may have just started or no logs have been written yet.".to_string());
    }

    let content = fs::read_to_string(log_file)?;
    if content.trim().is_empty() {
        return Ok("Log file exists but is empty.".to_string());
    }

    let tail: Vec<&str> = content.lines().rev().take(lines).collect();
    Ok(tail.into_iter().rev().collect::<Vec<_>>().join("\n"))
}

/// Check the status of the daemon
pub async fn check_daemon_status(settings: &DaemonSettings) -> Result<()> {
    let pid = match read_pid(settings)? {
        Some(pid) if process_alive(pid)? => pid,
        _ => {
            println!("Candle sync daemon is not running.");
            return Ok(());
        }
    };

    println!("Candle sync daemon is running (PID {}).", pid);

    #[cfg(unix)]
    {
        let uptime = Command::new("ps")
            .arg("-p")
            .arg(pid.to_string())
            .arg("-o")
            .arg("etime=")
            .output()?;

        let uptime_str = String::from_utf8_lossy(&uptime.stdout).trim().to_string();
        if !uptime_str.is_empty() {
            println!("Uptime: {}", uptime_str);
        }
    }

    println!("\nRecent logs:");
    println!("{}", get_recent_logs(&settings.log_file, 10)?);

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_settings(name: &str) -> DaemonSettings {
        let dir = std::env::temp_dir();
        DaemonSettings {
            pid_file: dir.join(format!("{}-{}.pid", name, std::process::id())).display().to_string(),
            log_file: dir.join(format!("{}-{}.log", name, std::process::id())).display().to_string(),
        }
    }

    #[test]
    fn missing_pid_file_means_not_running() {
        let settings = temp_settings("candle-sync-missing");
        assert!(!is_daemon_running(&settings).unwrap());
    }

    #[test]
    fn garbage_pid_file_is_an_error() {
        let settings = temp_settings("candle-sync-garbage");
        fs::write(&settings.pid_file, "not-a-pid").unwrap();
        assert!(read_pid(&settings).is_err());
        fs::remove_file(&settings.pid_file).unwrap();
    }

    #[test]
    fn recent_logs_returns_tail() {
        let settings = temp_settings("candle-sync-logs");
        fs::write(&settings.log_file, "one\ntwo\nthree\nfour\n").unwrap();
        assert_eq!(get_recent_logs(&settings.log_file, 2).unwrap(), "three\nfour");
        fs::remove_file(&settings.log_file).unwrap();
    }
}
