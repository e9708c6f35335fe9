//! Running a single plugin to completion, isolated from the host.
//!
//! A run never fails from the caller's perspective: spawn errors, timeouts and crashes are all
//! reported through the returned [`ExecutionResult`].

use std::{process::Stdio, sync::Arc, time::Duration};

use chrono::{DateTime, Utc};
use crossbar_shared_util::PluginId;
use futures::future::{BoxFuture, FutureExt};
use nix::{
    sys::signal::{self, Signal},
    unistd::{setpgid, Pid},
};
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::config::PluginDescriptor;

/// Exit code reported when the plugin could not be started at all.
pub const SPAWN_FAILURE_EXIT_CODE: i32 = -1;
/// Exit code reported when the plugin was killed for exceeding its timeout.
pub const TIMEOUT_EXIT_CODE: i32 = 124;

/// How long to wait for a killed plugin to actually go away.
const KILL_GRACE: Duration = Duration::from_millis(500);

const READ_CHUNK_SIZE: usize = 8 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SandboxLimits {
    pub max_output_bytes: usize,
}

/// Everything that is known about a single run of a plugin.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionResult {
    pub plugin: PluginId,
    pub exit_code: i32,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub stdout_truncated: bool,
    pub stderr_truncated: bool,
    pub duration: Duration,
    pub timestamp: DateTime<Utc>,
    pub timed_out: bool,
}

impl ExecutionResult {
    pub fn is_success(&self) -> bool {
        self.exit_code == 0 && !self.timed_out
    }

    pub fn spawn_failed(&self) -> bool {
        self.exit_code == SPAWN_FAILURE_EXIT_CODE
    }

    /// The last non-empty line of stderr, for diagnostics.
    pub fn stderr_summary(&self) -> Option<String> {
        String::from_utf8_lossy(&self.stderr).lines().rev().map(str::trim).find(|line| !line.is_empty()).map(str::to_string)
    }
}

/// Something that can run plugins. The scheduler only talks to plugins through this.
pub trait PluginRunner: Send + Sync {
    fn run(&self, descriptor: Arc<PluginDescriptor>) -> BoxFuture<'static, ExecutionResult>;
}

/// Runs plugins as child processes.
#[derive(Debug, Clone)]
pub struct Sandbox {
    limits: SandboxLimits,
}

impl Sandbox {
    pub fn new(limits: SandboxLimits) -> Self {
        Sandbox { limits }
    }
}

impl PluginRunner for Sandbox {
    fn run(&self, descriptor: Arc<PluginDescriptor>) -> BoxFuture<'static, ExecutionResult> {
        let limits = self.limits;
        async move { run(&descriptor, limits).await }.boxed()
    }
}

/// Run a plugin once.
///
/// The plugin is started in its own process group, with the host environment plus the descriptors overrides,
/// from the directory it lives in. Once its timeout expires, the whole process group is killed.
pub async fn run(descriptor: &PluginDescriptor, limits: SandboxLimits) -> ExecutionResult {
    let timestamp = Utc::now();
    let started = tokio::time::Instant::now();
    let deadline = started + descriptor.timeout;

    let mut command = tokio::process::Command::new(&descriptor.path);
    command
        .current_dir(&descriptor.working_dir)
        .envs(&descriptor.env)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    unsafe {
        command.pre_exec(|| {
            let _ = setpgid(Pid::from_raw(0), Pid::from_raw(0));
            Ok(())
        });
    }

    let mut child = match command.spawn() {
        Ok(child) => child,
        Err(err) => {
            log::warn!("Failed to start plugin {}: {}", descriptor.id, err);
            return ExecutionResult {
                plugin: descriptor.id.clone(),
                exit_code: SPAWN_FAILURE_EXIT_CODE,
                stdout: Vec::new(),
                stderr: format!("Failed to start {}: {}", descriptor.path.display(), err).into_bytes(),
                stdout_truncated: false,
                stderr_truncated: false,
                duration: started.elapsed(),
                timestamp,
                timed_out: false,
            };
        }
    };
    let mut group = ProcessGroupGuard(child.id().map(|id| Pid::from_raw(id as i32)));

    let mut stdout_pipe = child.stdout.take();
    let mut stderr_pipe = child.stderr.take();
    let mut stdout = BoundedBuffer::new(limits.max_output_bytes);
    let mut stderr = BoundedBuffer::new(limits.max_output_bytes);
    let mut stdout_chunk = vec![0u8; READ_CHUNK_SIZE];
    let mut stderr_chunk = vec![0u8; READ_CHUNK_SIZE];
    let mut status = None;

    let timeout = tokio::time::sleep_until(deadline);
    tokio::pin!(timeout);

    // The run is over once the process exited and both pipes are closed, or when the deadline passes.
    let timed_out = loop {
        if status.is_some() && stdout_pipe.is_none() && stderr_pipe.is_none() {
            break false;
        }
        tokio::select! {
            _ = &mut timeout => break true,
            read = read_pipe(&mut stdout_pipe, &mut stdout_chunk) => match read {
                Ok(0) | Err(_) => stdout_pipe = None,
                Ok(n) => stdout.push(&stdout_chunk[..n]),
            },
            read = read_pipe(&mut stderr_pipe, &mut stderr_chunk) => match read {
                Ok(0) | Err(_) => stderr_pipe = None,
                Ok(n) => stderr.push(&stderr_chunk[..n]),
            },
            exit = child.wait(), if status.is_none() => status = Some(exit),
        }
    };

    let exit_code = if timed_out {
        log::warn!("Plugin {} timed out after {:?}, killing it", descriptor.id, descriptor.timeout);
        group.kill();
        let _ = child.start_kill();
        if tokio::time::timeout(KILL_GRACE, child.wait()).await.is_err() {
            log::error!("Plugin {} did not terminate after being killed", descriptor.id);
        }
        TIMEOUT_EXIT_CODE
    } else {
        group.disarm();
        match status {
            Some(Ok(status)) => exit_code_of(status),
            Some(Err(err)) => {
                log::warn!("Failed to wait for plugin {}: {}", descriptor.id, err);
                stderr.push(format!("\nFailed to wait for plugin: {}", err).as_bytes());
                SPAWN_FAILURE_EXIT_CODE
            }
            None => unreachable!("the loop only ends without a timeout once the process has exited"),
        }
    };

    let result = ExecutionResult {
        plugin: descriptor.id.clone(),
        exit_code,
        stdout_truncated: stdout.truncated,
        stderr_truncated: stderr.truncated,
        stdout: stdout.bytes,
        stderr: stderr.bytes,
        duration: started.elapsed(),
        timestamp,
        timed_out,
    };
    if result.stdout_truncated {
        log::warn!("Output of plugin {} exceeded {} bytes and was truncated", descriptor.id, limits.max_output_bytes);
    }
    log::debug!("Plugin {} finished with exit code {} in {:?}", descriptor.id, result.exit_code, result.duration);
    result
}

/// Read from a pipe, or never resolve if the pipe is already closed.
async fn read_pipe<R: AsyncRead + Unpin>(pipe: &mut Option<R>, buf: &mut [u8]) -> std::io::Result<usize> {
    match pipe {
        Some(pipe) => pipe.read(buf).await,
        None => std::future::pending().await,
    }
}

#[cfg(unix)]
fn exit_code_of(status: std::process::ExitStatus) -> i32 {
    use std::os::unix::process::ExitStatusExt;
    status.code().unwrap_or_else(|| 128 + status.signal().unwrap_or(0))
}

/// Collects bytes up to a limit. Everything beyond the limit is dropped, so the pipe keeps getting drained.
struct BoundedBuffer {
    bytes: Vec<u8>,
    limit: usize,
    truncated: bool,
}

impl BoundedBuffer {
    fn new(limit: usize) -> Self {
        BoundedBuffer { bytes: Vec::new(), limit, truncated: false }
    }

    fn push(&mut self, data: &[u8]) {
        if self.truncated {
            return;
        }
        let remaining = self.limit.saturating_sub(self.bytes.len());
        self.bytes.extend_from_slice(&data[..data.len().min(remaining)]);
        if data.len() > remaining {
            self.truncated = true;
            // a character cut in half would make the whole output undecodable
            self.bytes.truncate(complete_utf8_prefix_len(&self.bytes));
        }
    }
}

/// Length of `bytes` without a trailing, incomplete UTF-8 sequence.
fn complete_utf8_prefix_len(bytes: &[u8]) -> usize {
    for back in 1..=bytes.len().min(4) {
        let byte = bytes[bytes.len() - back];
        if byte & 0b1100_0000 == 0b1000_0000 {
            continue;
        }
        let width = match byte {
            0x00..=0x7F => 1,
            0xC0..=0xDF => 2,
            0xE0..=0xEF => 3,
            0xF0..=0xF7 => 4,
            _ => return bytes.len(),
        };
        return if width > back { bytes.len() - back } else { bytes.len() };
    }
    bytes.len()
}

/// Kills the process group of a plugin when dropped, unless disarmed.
/// This makes sure a cancelled run doesn't leave anything the plugin started behind.
struct ProcessGroupGuard(Option<Pid>);

impl ProcessGroupGuard {
    fn kill(&mut self) {
        if let Some(pgid) = self.0.take() {
            log::debug!("Killing process group {}", pgid);
            let _ = signal::killpg(pgid, Signal::SIGKILL);
        }
    }

    fn disarm(&mut self) {
        self.0 = None;
    }
}

impl Drop for ProcessGroupGuard {
    fn drop(&mut self) {
        self.kill();
    }
}

#[cfg(test)]
pub(crate) mod test {
    use super::*;
    use crate::config::plugin_descriptor::test::write_script;
    use maplit::btreemap;
    use pretty_assertions::assert_eq;
    use std::{collections::BTreeMap, path::Path};

    pub(crate) fn descriptor(path: &Path, timeout: Duration) -> PluginDescriptor {
        let id = path.file_name().unwrap().to_string_lossy().to_string();
        PluginDescriptor {
            name: id.split('.').next().unwrap().to_string(),
            id: PluginId(id),
            interval: Duration::from_secs(1),
            path: path.to_path_buf(),
            working_dir: path.parent().unwrap().to_path_buf(),
            timeout,
            env: BTreeMap::new(),
        }
    }

    const LIMITS: SandboxLimits = SandboxLimits { max_output_bytes: 64 * 1024 };

    #[tokio::test]
    async fn test_captures_output_and_exit_code() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_script(dir.path(), "test.1s.sh", "echo hello\necho oops >&2\nexit 3");

        let result = run(&descriptor(&path, Duration::from_secs(10)), LIMITS).await;
        assert_eq!(3, result.exit_code);
        assert_eq!(b"hello\n".to_vec(), result.stdout);
        assert_eq!(Some("oops".to_string()), result.stderr_summary());
        assert!(!result.timed_out);
        assert!(!result.is_success());
    }

    #[tokio::test]
    async fn test_successful_run() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_script(dir.path(), "ok.1s.sh", "printf 'title\\n---\\nitem'");

        let result = run(&descriptor(&path, Duration::from_secs(10)), LIMITS).await;
        assert!(result.is_success());
        assert_eq!(b"title\n---\nitem".to_vec(), result.stdout);
    }

    #[tokio::test]
    async fn test_timeout_kills_plugin() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_script(dir.path(), "slow.1s.sh", "echo partial\nsleep 30\necho never");

        let started = std::time::Instant::now();
        let result = run(&descriptor(&path, Duration::from_millis(300)), LIMITS).await;
        assert!(result.timed_out);
        assert_eq!(TIMEOUT_EXIT_CODE, result.exit_code);
        assert!(started.elapsed() < Duration::from_secs(3), "took {:?}", started.elapsed());
        assert_eq!(b"partial\n".to_vec(), result.stdout);
    }

    #[tokio::test]
    async fn test_timeout_kills_whole_process_group() {
        let dir = tempfile::tempdir().unwrap();
        // the background sleep keeps stdout open, so the run only ends once the group is gone
        let path = write_script(dir.path(), "forks.1s.sh", "sleep 30 &\nsleep 30");

        let started = std::time::Instant::now();
        let result = run(&descriptor(&path, Duration::from_millis(300)), LIMITS).await;
        assert!(result.timed_out);
        assert!(started.elapsed() < Duration::from_secs(3), "took {:?}", started.elapsed());
    }

    #[tokio::test]
    async fn test_environment_and_working_dir() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_script(dir.path(), "env.1s.sh", "echo \"$CROSSBAR_PLUGIN_CITY\"\npwd -P\ntest -n \"$PATH\" && echo has-path");
        let mut descriptor = descriptor(&path, Duration::from_secs(10));
        descriptor.env = btreemap! { "CROSSBAR_PLUGIN_CITY".to_string() => "Berlin".to_string() };

        let result = run(&descriptor, LIMITS).await;
        let stdout = String::from_utf8(result.stdout).unwrap();
        let lines: Vec<&str> = stdout.lines().collect();
        assert_eq!("Berlin", lines[0]);
        assert_eq!(dir.path().canonicalize().unwrap().to_string_lossy(), lines[1]);
        assert_eq!("has-path", lines[2]);
    }

    #[tokio::test]
    async fn test_output_is_bounded() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_script(dir.path(), "big.1s.sh", "head -c 200000 /dev/zero\necho done >&2");

        let result = run(&descriptor(&path, Duration::from_secs(10)), SandboxLimits { max_output_bytes: 1000 }).await;
        assert_eq!(0, result.exit_code);
        assert_eq!(1000, result.stdout.len());
        assert!(result.stdout_truncated);
        assert!(!result.stderr_truncated);
        assert_eq!(Some("done".to_string()), result.stderr_summary());
    }

    #[tokio::test]
    async fn test_truncated_multibyte_output_stays_parseable() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_script(dir.path(), "euro.1s.sh", "i=0\nwhile [ $i -lt 500 ]; do printf '€'; i=$((i+1)); done");

        let result = run(&descriptor(&path, Duration::from_secs(10)), SandboxLimits { max_output_bytes: 1000 }).await;
        assert_eq!(0, result.exit_code);
        assert!(result.stdout_truncated);
        assert_eq!(999, result.stdout.len());

        let cache = crate::cache::ResultCache::new();
        let outcome = cache.record(&result, crate::config::PartialOutputPolicy::Discard);
        assert_eq!(crate::cache::RunOutcome::Success, outcome);
        let title = cache.get(&result.plugin).unwrap().model.unwrap().title.text;
        assert_eq!(333, title.chars().count());
        assert!(title.chars().all(|c| c == '€'));
    }

    #[test]
    fn test_complete_utf8_prefix_len() {
        assert_eq!(0, complete_utf8_prefix_len(b""));
        assert_eq!(3, complete_utf8_prefix_len(b"abc"));
        assert_eq!(3, complete_utf8_prefix_len("€".as_bytes()));
        assert_eq!(1, complete_utf8_prefix_len(&"a€".as_bytes()[..2]));
        assert_eq!(1, complete_utf8_prefix_len(&"a€".as_bytes()[..3]));
        assert_eq!(0, complete_utf8_prefix_len(&"🔋".as_bytes()[..3]));
        // not UTF-8 at all, left to the parser to reject
        assert_eq!(2, complete_utf8_prefix_len(&[0xff, 0xfe]));
    }

    #[tokio::test]
    async fn test_spawn_failure() {
        let dir = tempfile::tempdir().unwrap();
        let result = run(&descriptor(&dir.path().join("missing.1s.sh"), Duration::from_secs(10)), LIMITS).await;
        assert!(result.spawn_failed());
        assert!(!result.timed_out);
        assert!(String::from_utf8_lossy(&result.stderr).starts_with("Failed to start"));
    }

    #[tokio::test]
    async fn test_signal_exit_code() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_script(dir.path(), "crash.1s.sh", "kill -9 $$");

        let result = run(&descriptor(&path, Duration::from_secs(10)), LIMITS).await;
        assert_eq!(128 + 9, result.exit_code);
    }

    #[tokio::test]
    async fn test_runner_trait() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_script(dir.path(), "trait.1s.sh", "echo via-trait");
        let sandbox: Arc<dyn PluginRunner> = Arc::new(Sandbox::new(LIMITS));

        let result = sandbox.run(Arc::new(descriptor(&path, Duration::from_secs(10)))).await;
        assert_eq!(b"via-trait\n".to_vec(), result.stdout);
    }
}
