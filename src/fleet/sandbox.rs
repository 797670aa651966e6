//! Docker-backed collaborators: instruction execution, output tail and
//! resource sampling for agent containers.

use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use bollard::Docker;
use bollard::container::{LogOutput, LogsOptions, Stats, StatsOptions};
use bollard::errors::Error as DockerError;
use bollard::exec::{CreateExecOptions, StartExecResults};
use chrono::{DateTime, Utc};
use fleet_common::{
    ExecutorError, InstructionExecutor, Job, JobOutput, LogStream, OutputLine, ProgressReporter,
};
use futures::StreamExt;
use futures::stream::BoxStream;

use super::logs::OutputSource;
use super::metrics::{ContainerMetrics, MetricsSource};

/// Configuration for running instructions inside agent containers.
#[derive(Debug, Clone)]
pub struct SandboxConfig {
    pub enabled: bool,
    /// Command run via `docker exec`; the instruction text is appended as the
    /// final argument.
    pub agent_command: Vec<String>,
    pub working_dir: Option<String>,
    /// Wall-clock limit for one instruction.
    pub timeout: Duration,
    /// Time between TERM and KILL once the timeout fires.
    pub kill_grace: Duration,
    /// Per-stream cap on captured output.
    pub max_output_bytes: usize,
    pub metrics_interval: Duration,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            agent_command: vec!["claude".to_string(), "--print".to_string()],
            working_dir: None,
            timeout: Duration::from_secs(1800),
            kill_grace: Duration::from_secs(10),
            max_output_bytes: 1024 * 1024,
            metrics_interval: Duration::from_secs(2),
        }
    }
}

/// Handle to the local Docker daemon.
#[derive(Clone)]
pub struct DockerSandbox {
    docker: Docker,
    config: SandboxConfig,
}

impl DockerSandbox {
    /// Connect to the local daemon and check it responds.
    pub async fn connect(config: SandboxConfig) -> Result<Self> {
        let docker =
            Docker::connect_with_local_defaults().context("Failed to connect to Docker")?;
        docker.ping().await.context("Docker daemon is not responding")?;
        Ok(Self { docker, config })
    }

    pub fn config(&self) -> &SandboxConfig {
        &self.config
    }

    fn command_for(&self, job: &Job) -> Vec<String> {
        let mut cmd = self.config.agent_command.clone();
        cmd.push(job.text.clone());
        cmd
    }

    async fn run_exec(
        &self,
        job: &Job,
        progress: &ProgressReporter,
    ) -> Result<JobOutput, ExecutorError> {
        let env = vec![
            format!("FLEET_JOB_ID={}", job.id),
            format!("FLEET_INSTRUCTION_MODE={}", job.mode.as_str()),
        ];
        let options = CreateExecOptions {
            cmd: Some(self.command_for(job)),
            env: Some(env),
            working_dir: self.config.working_dir.clone(),
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            ..Default::default()
        };
        let exec = self
            .docker
            .create_exec(&job.container_id, options)
            .await
            .map_err(|e| classify(&job.container_id, "create exec", e))?;
        let started = self
            .docker
            .start_exec(&exec.id, None)
            .await
            .map_err(|e| classify(&job.container_id, "start exec", e))?;
        progress.report(5, "agent started");

        let mut output = BoundedOutput::new(self.config.max_output_bytes);
        if let StartExecResults::Attached { output: mut stream, .. } = started {
            while let Some(msg) = stream.next().await {
                match msg {
                    Ok(LogOutput::StdOut { message }) | Ok(LogOutput::Console { message }) => {
                        output.push(LogStream::Stdout, &message);
                    }
                    Ok(LogOutput::StdErr { message }) => output.push(LogStream::Stderr, &message),
                    Ok(_) => {}
                    Err(e) => {
                        return Err(ExecutorError::retryable(format!("exec stream failed: {}", e))
                            .with_output(output.finish(None)));
                    }
                }
            }
        }

        let inspect = self
            .docker
            .inspect_exec(&exec.id)
            .await
            .map_err(|e| classify(&job.container_id, "inspect exec", e))?;
        let exit_code = exit_code_from(inspect.exit_code);
        let result = output.finish(exit_code);
        progress.report(100, "agent finished");

        match exit_code {
            Some(0) => Ok(result),
            Some(code) => Err(
                ExecutorError::retryable(format!("agent exited with code {}", code))
                    .with_output(result),
            ),
            None => Err(ExecutorError::retryable("agent exit code unavailable").with_output(result)),
        }
    }

    /// TERM the agent process, then KILL it if it is still around after the
    /// grace period.
    async fn escalate(&self, container_id: &str) {
        let Some(program) = self.config.agent_command.first() else {
            return;
        };
        for (signal, wait) in [("-TERM", self.config.kill_grace), ("-KILL", Duration::ZERO)] {
            let options = CreateExecOptions {
                cmd: Some(vec![
                    "pkill".to_string(),
                    signal.to_string(),
                    "-f".to_string(),
                    program.clone(),
                ]),
                ..Default::default()
            };
            let sent = match self.docker.create_exec(container_id, options).await {
                Ok(exec) => self.docker.start_exec(&exec.id, None).await.map(|_| ()),
                Err(e) => Err(e),
            };
            if let Err(e) = sent {
                tracing::warn!(container_id, signal, error = %e, "failed to signal agent process");
            }
            if !wait.is_zero() {
                tokio::time::sleep(wait).await;
            }
        }
    }

    async fn sample_stats(&self, container_id: &str) -> Result<Stats> {
        let options = StatsOptions {
            stream: false,
            one_shot: false,
        };
        let mut stream = Box::pin(self.docker.stats(container_id, Some(options)));
        stream
            .next()
            .await
            .context("Docker returned no stats")?
            .with_context(|| format!("Failed to read stats for {}", container_id))
    }
}

#[async_trait]
impl InstructionExecutor for DockerSandbox {
    async fn execute(
        &self,
        job: &Job,
        progress: ProgressReporter,
    ) -> Result<JobOutput, ExecutorError> {
        tracing::info!(container_id = %job.container_id, job_id = %job.id, "executing instruction");
        match tokio::time::timeout(self.config.timeout, self.run_exec(job, &progress)).await {
            Ok(result) => result,
            Err(_) => {
                tracing::warn!(
                    container_id = %job.container_id,
                    job_id = %job.id,
                    timeout_secs = self.config.timeout.as_secs(),
                    "instruction timed out, stopping agent"
                );
                self.escalate(&job.container_id).await;
                Err(ExecutorError::retryable(format!(
                    "instruction timed out after {}s",
                    self.config.timeout.as_secs()
                )))
            }
        }
    }
}

#[async_trait]
impl OutputSource for DockerSandbox {
    async fn follow(
        &self,
        container_id: &str,
        since: DateTime<Utc>,
    ) -> Result<BoxStream<'static, Result<OutputLine>>> {
        let options = LogsOptions::<String> {
            follow: true,
            stdout: true,
            stderr: true,
            since: since.timestamp(),
            timestamps: false,
            ..Default::default()
        };
        let stream = self
            .docker
            .logs(container_id, Some(options))
            .flat_map(|item| {
                let lines: Vec<Result<OutputLine>> = match item {
                    Ok(LogOutput::StdOut { message }) | Ok(LogOutput::Console { message }) => {
                        split_lines(LogStream::Stdout, &message).into_iter().map(Ok).collect()
                    }
                    Ok(LogOutput::StdErr { message }) => {
                        split_lines(LogStream::Stderr, &message).into_iter().map(Ok).collect()
                    }
                    Ok(_) => Vec::new(),
                    Err(e) => vec![Err(anyhow::anyhow!("log stream error: {}", e))],
                };
                futures::stream::iter(lines)
            });
        Ok(stream.boxed())
    }
}

#[async_trait]
impl MetricsSource for DockerSandbox {
    async fn sample(&self, container_id: &str) -> Result<ContainerMetrics> {
        let stats = self.sample_stats(container_id).await?;
        Ok(metrics_from_stats(&stats))
    }
}

/// Map a Docker error to an executor error: a missing container will not
/// come back by retrying.
fn classify(container_id: &str, action: &str, err: DockerError) -> ExecutorError {
    match err {
        DockerError::DockerResponseServerError {
            status_code: 404,
            message,
        } => ExecutorError::terminal(format!(
            "container {} not found ({}): {}",
            container_id, action, message
        )),
        DockerError::DockerResponseServerError {
            status_code: 409,
            message,
        } => ExecutorError::terminal(format!(
            "container {} is not running ({}): {}",
            container_id, action, message
        )),
        other => ExecutorError::retryable(format!("failed to {}: {}", action, other)),
    }
}

fn metrics_from_stats(stats: &Stats) -> ContainerMetrics {
    let cpu_percent = cpu_percent(
        stats.precpu_stats.cpu_usage.total_usage,
        stats.cpu_stats.cpu_usage.total_usage,
        stats.precpu_stats.system_cpu_usage.unwrap_or(0),
        stats.cpu_stats.system_cpu_usage.unwrap_or(0),
        stats.cpu_stats.online_cpus.unwrap_or(1),
    );
    ContainerMetrics::new(
        cpu_percent,
        stats.memory_stats.usage.unwrap_or(0),
        stats.memory_stats.limit.unwrap_or(0),
    )
}

/// CPU usage across all online cores, as `docker stats` reports it.
fn cpu_percent(prev_total: u64, total: u64, prev_system: u64, system: u64, cpus: u64) -> f64 {
    let cpu_delta = total.saturating_sub(prev_total) as f64;
    let system_delta = system.saturating_sub(prev_system) as f64;
    if system_delta > 0.0 {
        cpu_delta / system_delta * cpus.max(1) as f64 * 100.0
    } else {
        0.0
    }
}

fn split_lines(stream: LogStream, message: &[u8]) -> Vec<OutputLine> {
    String::from_utf8_lossy(message)
        .lines()
        .filter(|line| !line.is_empty())
        .map(|line| OutputLine {
            stream,
            content: line.to_string(),
            timestamp: None,
        })
        .collect()
}

/// Captures stdout/stderr up to a byte cap per stream.
struct BoundedOutput {
    limit: usize,
    stdout: Vec<u8>,
    stderr: Vec<u8>,
    truncated: bool,
}

impl BoundedOutput {
    fn new(limit: usize) -> Self {
        Self {
            limit,
            stdout: Vec::new(),
            stderr: Vec::new(),
            truncated: false,
        }
    }

    fn push(&mut self, stream: LogStream, chunk: &[u8]) {
        let buf = match stream {
            LogStream::Stdout => &mut self.stdout,
            LogStream::Stderr => &mut self.stderr,
        };
        let room = self.limit.saturating_sub(buf.len());
        if chunk.len() > room {
            self.truncated = true;
        }
        buf.extend_from_slice(&chunk[..chunk.len().min(room)]);
    }

    fn finish(&mut self, exit_code: Option<i32>) -> JobOutput {
        let mut stdout = String::from_utf8_lossy(&std::mem::take(&mut self.stdout)).into_owned();
        let stderr = String::from_utf8_lossy(&std::mem::take(&mut self.stderr)).into_owned();
        if self.truncated {
            stdout.push_str("\n[output truncated]");
        }
        JobOutput {
            stdout,
            stderr,
            exit_code,
        }
    }
}

/// Docker reports exit codes as `i64`; anything outside `i32` is treated as
/// unavailable rather than wrapped.
fn exit_code_from(code: Option<i64>) -> Option<i32> {
    code.and_then(|c| i32::try_from(c).ok())
}
