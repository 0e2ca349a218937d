//! yt-dlp wrapper.
//!
//! Runs the external downloader as a child process bound to configured
//! binary paths and a fixed format policy, and reports the produced file.
//! Every invocation writes to its own file name, so concurrent requests for
//! the same video never share a local file.

use crate::config::Settings;
use async_trait::async_trait;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use thiserror::Error;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Best mp4 video muxed with the best m4a audio.
pub const FORMAT_POLICY: &str = "bestvideo[ext=mp4]+bestaudio[ext=m4a]";

/// Output file name template for one invocation, relative to the download
/// directory.
fn output_template(tag: &str) -> String {
    format!("%(id)s-{tag}.%(ext)s")
}

fn invocation_tag() -> String {
    Uuid::new_v4().simple().to_string().chars().take(8).collect()
}

/// Errors produced by a downloader invocation
#[derive(Error, Debug)]
pub enum DownloadError {
    /// The downloader process could not be started
    #[error("failed to start yt-dlp: {0}")]
    Spawn(#[from] std::io::Error),
    /// The downloader exited unsuccessfully; `detail` is its raw error output
    #[error("{detail}")]
    Failed {
        /// Raw error text reported by the tool
        detail: String,
    },
    /// The downloader succeeded but did not report an output file
    #[error("yt-dlp finished without reporting an output file")]
    MissingOutput,
    /// The invocation was aborted by the cancellation token
    #[error("download cancelled")]
    Cancelled,
}

/// Something that can fetch a media URL into a local file.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait MediaDownloader: Send + Sync {
    /// Download `url` and return the path of the produced local file.
    async fn download(
        &self,
        url: &str,
        cancellation_token: &CancellationToken,
    ) -> Result<PathBuf, DownloadError>;
}

/// yt-dlp bound to binary paths, an output directory and a format policy
#[derive(Debug, Clone)]
pub struct YtDlp {
    ytdlp_path: PathBuf,
    ffmpeg_path: PathBuf,
    output_dir: PathBuf,
    format: String,
}

impl YtDlp {
    /// Create a downloader using [`FORMAT_POLICY`].
    #[must_use]
    pub fn new(
        ytdlp_path: impl Into<PathBuf>,
        ffmpeg_path: impl Into<PathBuf>,
        output_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            ytdlp_path: ytdlp_path.into(),
            ffmpeg_path: ffmpeg_path.into(),
            output_dir: output_dir.into(),
            format: FORMAT_POLICY.to_string(),
        }
    }

    /// Create a downloader from application settings.
    #[must_use]
    pub fn from_settings(settings: &Settings) -> Self {
        Self::new(
            &settings.ytdlp_path,
            &settings.ffmpeg_path,
            settings.download_dir(),
        )
    }

    /// Path of the yt-dlp binary.
    #[must_use]
    pub fn binary(&self) -> &Path {
        &self.ytdlp_path
    }

    /// Command line arguments for downloading `url`; `tag` makes the output
    /// file name unique to this invocation.
    #[must_use]
    pub fn download_args(&self, url: &str, tag: &str) -> Vec<OsString> {
        let output = self.output_dir.join(output_template(tag));
        vec![
            "--no-playlist".into(),
            "--no-progress".into(),
            "--ffmpeg-location".into(),
            self.ffmpeg_path.clone().into_os_string(),
            "-f".into(),
            self.format.clone().into(),
            "-o".into(),
            output.into_os_string(),
            "--no-simulate".into(),
            "--print".into(),
            "after_move:filepath".into(),
            // Keep URLs starting with '-' from being read as options
            "--".into(),
            url.into(),
        ]
    }

    /// Query `yt-dlp --version`.
    ///
    /// # Errors
    ///
    /// Returns an error if the binary cannot be run or exits unsuccessfully.
    pub async fn version(&self) -> Result<String, DownloadError> {
        let output = Command::new(&self.ytdlp_path)
            .arg("--version")
            .stdin(Stdio::null())
            .output()
            .await?;

        if !output.status.success() {
            return Err(DownloadError::Failed {
                detail: failure_detail(&output.stdout, &output.stderr, output.status),
            });
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }
}

#[async_trait]
impl MediaDownloader for YtDlp {
    async fn download(
        &self,
        url: &str,
        cancellation_token: &CancellationToken,
    ) -> Result<PathBuf, DownloadError> {
        debug!(url = %url, binary = %self.ytdlp_path.display(), "Starting yt-dlp");

        let child = Command::new(&self.ytdlp_path)
            .args(self.download_args(url, &invocation_tag()))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        let output = tokio::select! {
            biased;
            () = cancellation_token.cancelled() => {
                // Dropping the wait future kills the child
                warn!(url = %url, "yt-dlp cancelled, killing process");
                return Err(DownloadError::Cancelled);
            }
            res = child.wait_with_output() => res?,
        };

        if !output.status.success() {
            let detail = failure_detail(&output.stdout, &output.stderr, output.status);
            info!(url = %url, status = %output.status, "yt-dlp failed");
            return Err(DownloadError::Failed { detail });
        }

        let path = reported_path(&String::from_utf8_lossy(&output.stdout))
            .ok_or(DownloadError::MissingOutput)?;
        debug!(path = %path.display(), "yt-dlp finished");
        Ok(path)
    }
}

/// Final file path printed by `--print after_move:filepath`.
fn reported_path(stdout: &str) -> Option<PathBuf> {
    stdout
        .lines()
        .map(str::trim)
        .rfind(|line| !line.is_empty())
        .map(PathBuf::from)
}

fn failure_detail(stdout: &[u8], stderr: &[u8], status: std::process::ExitStatus) -> String {
    let stderr = String::from_utf8_lossy(stderr);
    let stderr = stderr.trim();
    if !stderr.is_empty() {
        return stderr.to_string();
    }
    let stdout = String::from_utf8_lossy(stdout);
    let stdout = stdout.trim();
    if !stdout.is_empty() {
        return stdout.to_string();
    }
    format!("yt-dlp exited with {status}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn args_carry_policy_paths_and_url_last() {
        let ytdlp = YtDlp::new("/usr/bin/yt-dlp", "/usr/bin/ffmpeg", "/data");
        let args = ytdlp.download_args("https://example.com/video", "1a2b3c4d");

        let pos = |flag: &str| args.iter().position(|a| a == flag);
        let Some(format) = pos("-f") else {
            panic!("missing -f in {args:?}");
        };
        assert_eq!(args[format + 1], OsString::from(FORMAT_POLICY));

        let Some(ffmpeg) = pos("--ffmpeg-location") else {
            panic!("missing --ffmpeg-location in {args:?}");
        };
        assert_eq!(args[ffmpeg + 1], OsString::from("/usr/bin/ffmpeg"));

        let Some(output) = pos("-o") else {
            panic!("missing -o in {args:?}");
        };
        assert_eq!(args[output + 1], OsString::from("/data/%(id)s-1a2b3c4d.%(ext)s"));

        assert_eq!(args[args.len() - 2], OsString::from("--"));
        assert_eq!(
            args.last(),
            Some(&OsString::from("https://example.com/video"))
        );
    }

    #[test]
    fn reported_path_takes_last_line() {
        assert_eq!(
            reported_path("[info] something\n/data/abc.mp4\n\n"),
            Some(PathBuf::from("/data/abc.mp4"))
        );
        assert_eq!(reported_path("  \n"), None);
    }

    #[cfg(unix)]
    #[test]
    fn failure_detail_prefers_stderr() {
        use std::os::unix::process::ExitStatusExt;

        let status = std::process::ExitStatus::from_raw(1 << 8);
        assert_eq!(
            failure_detail(b"out", b"  ERROR: network unreachable\n", status),
            "ERROR: network unreachable"
        );
        assert_eq!(failure_detail(b"only stdout\n", b"", status), "only stdout");
        assert!(failure_detail(b"", b"", status).starts_with("yt-dlp exited with"));
    }

    #[tokio::test]
    async fn missing_binary_is_a_spawn_error() {
        let ytdlp = YtDlp::new("/nonexistent/yt-dlp", "/nonexistent/ffmpeg", "/tmp");
        let token = CancellationToken::new();
        let result = ytdlp.download("https://example.com/video", &token).await;
        assert!(matches!(result, Err(DownloadError::Spawn(_))), "{result:?}");
    }

    #[test]
    fn each_invocation_gets_its_own_tag() {
        let (a, b) = (invocation_tag(), invocation_tag());
        assert_eq!(a.len(), 8);
        assert_ne!(a, b);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn cancelled_token_skips_download() {
        let ytdlp = YtDlp::new("/bin/sh", "/nonexistent/ffmpeg", "/tmp");
        let token = CancellationToken::new();
        token.cancel();
        let result = ytdlp.download("https://example.com/video", &token).await;
        assert!(matches!(result, Err(DownloadError::Cancelled)), "{result:?}");
    }

    #[cfg(unix)]
    fn scratch_dir() -> std::io::Result<PathBuf> {
        let dir = std::env::temp_dir().join(format!("ytdlp-test-{}", Uuid::new_v4().simple()));
        std::fs::create_dir_all(&dir)?;
        Ok(dir)
    }

    /// Write an executable shell script standing in for yt-dlp.
    #[cfg(unix)]
    fn fake_ytdlp(dir: &Path, body: &str) -> std::io::Result<PathBuf> {
        use std::os::unix::fs::PermissionsExt;

        let path = dir.join("yt-dlp");
        std::fs::write(&path, format!("#!/bin/sh\n{body}\n"))?;
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755))?;
        Ok(path)
    }

    /// Resolves every URL to the same video id and honours `-o`.
    #[cfg(unix)]
    const SAME_ID_SCRIPT: &str = r#"
while [ $# -gt 0 ]; do
  if [ "$1" = "-o" ]; then out="$2"; fi
  shift
done
path=$(printf '%s' "$out" | sed -e 's/%(id)s/dQw4w9WgXcQ/' -e 's/%(ext)s/mp4/')
printf 'video' > "$path"
echo "$path"
"#;

    #[cfg(unix)]
    #[tokio::test]
    async fn same_video_downloads_get_separate_files() -> Result<(), Box<dyn std::error::Error>> {
        let dir = scratch_dir()?;
        let script = fake_ytdlp(&dir, SAME_ID_SCRIPT)?;
        let ytdlp = YtDlp::new(&script, "/nonexistent/ffmpeg", &dir);
        let token = CancellationToken::new();

        let (first, second) = tokio::join!(
            ytdlp.download("https://youtu.be/dQw4w9WgXcQ", &token),
            ytdlp.download("https://youtu.be/dQw4w9WgXcQ", &token),
        );
        let (first, second) = (first?, second?);

        assert_ne!(first, second);
        assert!(first.starts_with(&dir));
        // Cleaning up one request leaves the other's file in place
        std::fs::remove_file(&first)?;
        assert!(second.exists());

        std::fs::remove_dir_all(&dir)?;
        Ok(())
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn cancellation_kills_running_download() -> Result<(), Box<dyn std::error::Error>> {
        let dir = scratch_dir()?;
        let started = dir.join("started");
        let finished = dir.join("finished");
        let script = fake_ytdlp(
            &dir,
            &format!(
                "touch '{}'\nsleep 2\ntouch '{}'",
                started.display(),
                finished.display()
            ),
        )?;
        let ytdlp = YtDlp::new(&script, "/nonexistent/ffmpeg", &dir);
        let token = CancellationToken::new();

        let task = tokio::spawn({
            let token = token.clone();
            async move { ytdlp.download("https://example.com/video", &token).await }
        });

        let deadline = tokio::time::Instant::now() + std::time::Duration::from_secs(5);
        while !started.exists() {
            assert!(
                tokio::time::Instant::now() < deadline,
                "fake yt-dlp never started"
            );
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        }

        token.cancel();
        let result = tokio::time::timeout(std::time::Duration::from_secs(1), task).await??;
        assert!(matches!(result, Err(DownloadError::Cancelled)), "{result:?}");

        // The script would have finished by now had it not been killed
        tokio::time::sleep(std::time::Duration::from_millis(2500)).await;
        assert!(!finished.exists());

        std::fs::remove_dir_all(&dir)?;
        Ok(())
    }
}
