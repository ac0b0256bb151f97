//! Face-presence capability: something that, given a camera frame, answers
//! present or absent. The detection model itself is a black box.

use std::{
    collections::VecDeque,
    process::Stdio,
    sync::{
        atomic::{AtomicU32, Ordering},
        Arc, Mutex,
    },
};

use async_trait::async_trait;
use tokio::{
    io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines},
    process::{Child, ChildStdin, ChildStdout, Command},
};

use crate::error::CapabilityError;

const ENABLE_LOGS: bool = true;

use crate::{log_info, log_warn};

#[async_trait]
pub trait PresenceCapability: Send + Sync {
    /// Brings up the camera and detection model.
    async fn acquire(&self) -> Result<Box<dyn PresenceSensor>, CapabilityError>;
}

#[async_trait]
pub trait PresenceSensor: Send {
    /// Grabs one frame and reports whether a face is in it.
    async fn probe(&mut self) -> Result<bool, CapabilityError>;

    /// Stops the camera stream. Called exactly once before the sensor is dropped.
    async fn release(&mut self);
}

fn classify_error(line: &str) -> CapabilityError {
    let detail = line.trim_start_matches("error:").trim();
    if detail.starts_with("camera-denied") {
        CapabilityError::PermissionDenied(detail.to_string())
    } else {
        CapabilityError::ModelUnavailable(detail.to_string())
    }
}

/// External detector process speaking a line protocol on stdin/stdout.
///
/// The process prints `ready` once camera and model are up, then answers each
/// `probe` line with `present` or `absent`. `error: <reason>` at any point is
/// fatal; `error: camera-denied` maps to a permission failure.
#[derive(Debug, Clone)]
pub struct CommandPresenceCapability {
    program: String,
    args: Vec<String>,
}

impl CommandPresenceCapability {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }

    /// Builds from `[program, args...]`; `None` when the list is empty.
    pub fn from_command_line(command: &[String]) -> Option<Self> {
        let (program, args) = command.split_first()?;
        Some(Self::new(program.clone(), args.to_vec()))
    }
}

#[async_trait]
impl PresenceCapability for CommandPresenceCapability {
    async fn acquire(&self) -> Result<Box<dyn PresenceSensor>, CapabilityError> {
        let mut child = Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|err| {
                CapabilityError::ModelUnavailable(format!("failed to start {}: {err}", self.program))
            })?;

        let (Some(stdin), Some(stdout)) = (child.stdin.take(), child.stdout.take()) else {
            return Err(CapabilityError::ModelUnavailable(
                "detector pipes unavailable".into(),
            ));
        };

        let mut sensor = CommandPresenceSensor {
            child,
            stdin,
            stdout: BufReader::new(stdout).lines(),
        };

        match sensor.read_line().await? {
            line if line == "ready" => {
                log_info!("presence detector {} ready", self.program);
                Ok(Box::new(sensor))
            }
            line if line.starts_with("error:") => {
                sensor.release().await;
                Err(classify_error(&line))
            }
            other => {
                sensor.release().await;
                Err(CapabilityError::ModelUnavailable(format!(
                    "unexpected detector handshake: {other}"
                )))
            }
        }
    }
}

struct CommandPresenceSensor {
    child: Child,
    stdin: ChildStdin,
    stdout: Lines<BufReader<ChildStdout>>,
}

impl CommandPresenceSensor {
    async fn read_line(&mut self) -> Result<String, CapabilityError> {
        match self.stdout.next_line().await {
            Ok(Some(line)) => Ok(line.trim().to_string()),
            Ok(None) => Err(CapabilityError::ModelUnavailable(
                "detector exited".into(),
            )),
            Err(err) => Err(CapabilityError::ModelUnavailable(err.to_string())),
        }
    }
}

#[async_trait]
impl PresenceSensor for CommandPresenceSensor {
    async fn probe(&mut self) -> Result<bool, CapabilityError> {
        self.stdin
            .write_all(b"probe\n")
            .await
            .map_err(|err| CapabilityError::ModelUnavailable(err.to_string()))?;
        self.stdin
            .flush()
            .await
            .map_err(|err| CapabilityError::ModelUnavailable(err.to_string()))?;

        let line = self.read_line().await?;
        match line.as_str() {
            "present" => Ok(true),
            "absent" => Ok(false),
            other if other.starts_with("error:") => Err(classify_error(other)),
            other => Err(CapabilityError::ModelUnavailable(format!(
                "unexpected detector reply: {other}"
            ))),
        }
    }

    async fn release(&mut self) {
        let _ = self.stdin.write_all(b"quit\n").await;
        if let Err(err) = self.child.kill().await {
            log_warn!("failed to stop presence detector: {err}");
        }
    }
}

/// Scripted capability for tests and demos.
///
/// Probes replay the script in order and then keep repeating the last answer.
#[derive(Clone)]
pub struct ScriptedPresenceCapability {
    script: Arc<Mutex<VecDeque<Result<bool, CapabilityError>>>>,
    acquire_error: Option<CapabilityError>,
    acquisitions: Arc<AtomicU32>,
    releases: Arc<AtomicU32>,
}

impl ScriptedPresenceCapability {
    pub fn new(script: impl IntoIterator<Item = bool>) -> Self {
        Self {
            script: Arc::new(Mutex::new(script.into_iter().map(Ok).collect())),
            acquire_error: None,
            acquisitions: Arc::new(AtomicU32::new(0)),
            releases: Arc::new(AtomicU32::new(0)),
        }
    }

    /// Capability whose acquisition always fails with `error`.
    pub fn failing(error: CapabilityError) -> Self {
        Self {
            acquire_error: Some(error),
            ..Self::new([])
        }
    }

    /// Appends a probe failure after the scripted answers.
    pub fn then_fail(self, error: CapabilityError) -> Self {
        self.lock_script().push_back(Err(error));
        self
    }

    pub fn push(&self, present: bool) {
        self.lock_script().push_back(Ok(present));
    }

    pub fn acquisitions(&self) -> u32 {
        self.acquisitions.load(Ordering::SeqCst)
    }

    pub fn releases(&self) -> u32 {
        self.releases.load(Ordering::SeqCst)
    }

    fn lock_script(&self) -> std::sync::MutexGuard<'_, VecDeque<Result<bool, CapabilityError>>> {
        match self.script.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

#[async_trait]
impl PresenceCapability for ScriptedPresenceCapability {
    async fn acquire(&self) -> Result<Box<dyn PresenceSensor>, CapabilityError> {
        if let Some(error) = &self.acquire_error {
            return Err(error.clone());
        }
        self.acquisitions.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(ScriptedSensor {
            capability: self.clone(),
            last: true,
        }))
    }
}

struct ScriptedSensor {
    capability: ScriptedPresenceCapability,
    last: bool,
}

#[async_trait]
impl PresenceSensor for ScriptedSensor {
    async fn probe(&mut self) -> Result<bool, CapabilityError> {
        let next = self.capability.lock_script().pop_front();
        match next {
            Some(Ok(present)) => {
                self.last = present;
                Ok(present)
            }
            Some(Err(error)) => Err(error),
            None => Ok(self.last),
        }
    }

    async fn release(&mut self) {
        self.capability.releases.fetch_add(1, Ordering::SeqCst);
    }
}
