use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use runledger::runtime::{AuxiliaryService, Confirmation, ProcessProbe};

/// A scripted operator reply.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Answer {
    Yes,
    No,
    /// Never answer, so the coordinator's timeout fires.
    Silent,
    /// Fail to read an answer.
    Broken,
}

/// Confirmation that replays scripted answers and records every prompt.
///
/// Once the script runs out every further prompt is answered with `No`.
#[derive(Clone, Default)]
pub struct ScriptedConfirmation {
    answers: Arc<Mutex<VecDeque<Answer>>>,
    prompts: Arc<Mutex<Vec<String>>>,
}

impl ScriptedConfirmation {
    pub fn new(answers: impl IntoIterator<Item = Answer>) -> Self {
        Self {
            answers: Arc::new(Mutex::new(answers.into_iter().collect())),
            prompts: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn prompts(&self) -> Vec<String> {
        self.prompts.lock().clone()
    }

    pub fn assert_prompt_count_eq(&self, expected: usize) {
        let actual = self.prompts.lock().len();
        assert_eq!(actual, expected, "Expected {expected} prompts, got {actual}");
    }
}

#[async_trait]
impl Confirmation for ScriptedConfirmation {
    async fn confirm(&self, prompt: &str) -> anyhow::Result<bool> {
        self.prompts.lock().push(prompt.to_string());
        let answer = self.answers.lock().pop_front().unwrap_or(Answer::No);
        match answer {
            Answer::Yes => Ok(true),
            Answer::No => Ok(false),
            Answer::Silent => {
                std::future::pending::<()>().await;
                Ok(false)
            }
            Answer::Broken => Err(anyhow::anyhow!("stdin closed")),
        }
    }
}

/// Auxiliary service that counts stop requests.
#[derive(Clone)]
pub struct RecordingAuxService {
    name: String,
    fail: bool,
    stops: Arc<Mutex<u32>>,
}

impl RecordingAuxService {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            fail: false,
            stops: Arc::new(Mutex::new(0)),
        }
    }

    /// A service whose `stop` always fails.
    pub fn failing(name: impl Into<String>) -> Self {
        Self {
            fail: true,
            ..Self::new(name)
        }
    }

    pub fn stop_count(&self) -> u32 {
        *self.stops.lock()
    }
}

#[async_trait]
impl AuxiliaryService for RecordingAuxService {
    fn name(&self) -> &str {
        &self.name
    }

    async fn stop(&self) -> anyhow::Result<()> {
        *self.stops.lock() += 1;
        if self.fail {
            return Err(anyhow::anyhow!("{} refused to stop", self.name));
        }
        Ok(())
    }
}

/// Probe with a fixed set of live PIDs.
#[derive(Clone, Default)]
pub struct FakeProbe {
    alive: Arc<Mutex<HashMap<u32, bool>>>,
}

impl FakeProbe {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_alive(&self, pid: u32, alive: bool) {
        self.alive.lock().insert(pid, alive);
    }
}

impl ProcessProbe for FakeProbe {
    fn is_alive(&self, pid: u32) -> bool {
        self.alive.lock().get(&pid).copied().unwrap_or(false)
    }
}
