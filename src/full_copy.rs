use crate::export::ExportSession;
use crate::status::ProgressSink;
use crate::{MigrateError, Result, log_debug, log_info};
use async_trait::async_trait;
use std::path::Path;
use std::process::Stdio;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio::process::Command;

/// Streams a whole export onto a target path.
#[async_trait]
pub trait BulkCopier: Send + Sync {
    async fn copy(
        &self,
        session: &ExportSession,
        target_path: &Path,
        target_is_zeroed: bool,
        progress: &mut dyn ProgressSink,
    ) -> Result<()>;
}

/// Parse one `--progress=FD` line (`N/100`).
pub fn parse_progress(line: &str) -> Option<u32> {
    let (done, total) = line.trim().split_once('/')?;
    let done: u32 = done.trim().parse().ok()?;
    let total: u32 = total.trim().parse().ok()?;
    if total == 0 {
        return None;
    }
    Some((done.min(total) * 100) / total)
}

pub struct Nbdcopy {
    pub binary: String,
}

impl Nbdcopy {
    pub fn new(binary: &str) -> Self {
        Self {
            binary: binary.to_string(),
        }
    }

    pub fn build_command(
        &self,
        session: &ExportSession,
        target_path: &Path,
        target_is_zeroed: bool,
    ) -> Command {
        let mut cmd = Command::new(&self.binary);
        if target_is_zeroed {
            cmd.arg("--destination-is-zero");
        }
        cmd.arg("--progress=1")
            .arg(session.uri())
            .arg(target_path)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        cmd
    }
}

#[async_trait]
impl BulkCopier for Nbdcopy {
    async fn copy(
        &self,
        session: &ExportSession,
        target_path: &Path,
        target_is_zeroed: bool,
        progress: &mut dyn ProgressSink,
    ) -> Result<()> {
        let label = session.disk.label.clone();
        log_info!(
            "Full copy of '{}' to {} (destination zeroed: {})",
            label,
            target_path.display(),
            target_is_zeroed
        );

        let mut cmd = self.build_command(session, target_path, target_is_zeroed);
        log_debug!("Copy command: {}", crate::command::describe(&cmd));
        let mut child = cmd
            .spawn()
            .map_err(|e| MigrateError::Copy(format!("spawn {}: {}", self.binary, e)))?;

        let stderr_task = child.stderr.take().map(|mut stderr| {
            tokio::spawn(async move {
                let mut text = String::new();
                let _ = stderr.read_to_string(&mut text).await;
                text
            })
        });

        progress.report(format!("Copying disk {}: 0%", label), true);
        if let Some(stdout) = child.stdout.take() {
            let mut lines = BufReader::new(stdout).lines();
            let mut last = 0;
            while let Some(line) = lines.next_line().await? {
                if let Some(percent) = parse_progress(&line) {
                    if percent != last {
                        last = percent;
                        progress.report(format!("Copying disk {}: {}%", label, percent), false);
                    }
                }
            }
        }

        let status = child.wait().await?;
        let stderr = match stderr_task {
            Some(task) => task.await.unwrap_or_default(),
            None => String::new(),
        };
        if !status.success() {
            return Err(MigrateError::Copy(format!(
                "{} exited with {}: {}",
                self.binary,
                status,
                stderr.trim()
            )));
        }

        progress.report(format!("Copied disk {}: 100%", label), true);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::disk::{DiskDescriptor, DiskMode, SharingMode};
    use std::path::PathBuf;

    #[derive(Default)]
    struct Collect(Vec<(String, bool)>);

    impl ProgressSink for Collect {
        fn report(&mut self, message: String, important: bool) {
            self.0.push((message, important));
        }
    }

    fn session() -> ExportSession {
        ExportSession::detached(
            DiskDescriptor {
                key: 2000,
                label: "Hard disk 1".to_string(),
                capacity_bytes: 4096,
                backing_file: "[ds1] a.vmdk".to_string(),
                snapshot_chain: vec![],
                sharing: SharingMode::NoSharing,
                disk_mode: DiskMode::Persistent,
                change_id: None,
            },
            PathBuf::from("/run/vmshift/a.sock"),
        )
    }

    #[test]
    fn progress_lines() {
        assert_eq!(parse_progress("0/100"), Some(0));
        assert_eq!(parse_progress("42/100\n"), Some(42));
        assert_eq!(parse_progress("150/100"), Some(100));
        assert_eq!(parse_progress("nbdcopy: warning"), None);
        assert_eq!(parse_progress("1/0"), None);
    }

    #[test]
    fn zero_hint_only_for_fresh_targets() {
        let copier = Nbdcopy::new("nbdcopy");
        let args = |zeroed| -> Vec<String> {
            copier
                .build_command(&session(), Path::new("/dev/vdb"), zeroed)
                .as_std()
                .get_args()
                .map(|a| a.to_string_lossy().into_owned())
                .collect()
        };
        assert_eq!(
            args(true),
            vec![
                "--destination-is-zero",
                "--progress=1",
                "nbd+unix:///?socket=/run/vmshift/a.sock",
                "/dev/vdb"
            ]
        );
        assert!(!args(false).contains(&"--destination-is-zero".to_string()));
    }

    #[tokio::test]
    async fn streams_progress_and_reports_failure() {
        let dir = tempfile::TempDir::new().unwrap();
        let script = dir.path().join("fake-nbdcopy");
        std::fs::write(
            &script,
            "#!/bin/sh\necho 10/100\necho 10/100\necho 55/100\necho 'disk on fire' >&2\nexit 1\n",
        )
        .unwrap();
        let mut perms = std::fs::metadata(&script).unwrap().permissions();
        std::os::unix::fs::PermissionsExt::set_mode(&mut perms, 0o755);
        std::fs::set_permissions(&script, perms).unwrap();

        let copier = Nbdcopy::new(&script.to_string_lossy());
        let mut sink = Collect::default();
        let err = copier
            .copy(&session(), Path::new("/dev/null"), true, &mut sink)
            .await
            .unwrap_err();

        assert!(err.to_string().contains("disk on fire"));
        let messages: Vec<&str> = sink.0.iter().map(|(m, _)| m.as_str()).collect();
        assert_eq!(
            messages,
            vec![
                "Copying disk Hard disk 1: 0%",
                "Copying disk Hard disk 1: 10%",
                "Copying disk Hard disk 1: 55%"
            ]
        );
    }
}
