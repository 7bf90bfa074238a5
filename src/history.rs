//! Durable per-step history for inspection and resume.
//!
//! Every run writes under one root:
//!
//! ```text
//! <root>/conversation/conversation_<seq>.json   transcript as of step <seq>
//! <root>/recording/step_<seq>.png               screenshot frame
//! <root>/history/history_step_<seq>.json        all steps up to <seq>
//! <root>/history/latest_history.json            rewritten after every step
//! ```
//!
//! Each history file is self-contained, so any of them can seed a resume.

use std::fs;
use std::path::{Path, PathBuf};

use chrono::Local;
use serde::{Deserialize, Serialize};
use serde::de::DeserializeOwned;
use tracing::{debug, info, warn};

use crate::error::HistoryError;
use crate::types::{Message, Step, Task};

pub const LATEST_FILE: &str = "latest_history.json";

/// Directory layout of one run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunLayout {
    pub root: PathBuf,
}

impl RunLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// A fresh `run_YYYYMMDD_HHMMSS` root under `base`.
    pub fn fresh(base: &Path) -> Self {
        let name = format!("run_{}", Local::now().format("%Y%m%d_%H%M%S"));
        Self::new(base.join(name))
    }

    /// The run that wrote `history_file` (its grandparent directory).
    pub fn of_history_file(history_file: &Path) -> Self {
        let root = history_file
            .parent()
            .and_then(Path::parent)
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        Self::new(root)
    }

    pub fn conversation_dir(&self) -> PathBuf {
        self.root.join("conversation")
    }

    pub fn recording_dir(&self) -> PathBuf {
        self.root.join("recording")
    }

    pub fn history_dir(&self) -> PathBuf {
        self.root.join("history")
    }

    pub fn history_file(&self, seq: u64) -> PathBuf {
        self.history_dir().join(format!("history_step_{seq}.json"))
    }

    pub fn latest_file(&self) -> PathBuf {
        self.history_dir().join(LATEST_FILE)
    }

    pub fn frame_file(&self, seq: u64) -> PathBuf {
        self.recording_dir().join(format!("step_{seq}.png"))
    }

    pub fn conversation_file(&self, seq: u64) -> PathBuf {
        self.conversation_dir().join(format!("conversation_{seq}.json"))
    }

    /// Files already on disk for step `seq`, left by an earlier run in the
    /// same root.
    pub fn existing_step_files(&self, seq: u64) -> Vec<PathBuf> {
        [
            self.history_file(seq),
            self.conversation_file(seq),
            self.frame_file(seq),
        ]
        .into_iter()
        .filter(|path| path.exists())
        .collect()
    }

    fn create(&self) -> Result<(), HistoryError> {
        for dir in [
            self.conversation_dir(),
            self.recording_dir(),
            self.history_dir(),
        ] {
            fs::create_dir_all(&dir).map_err(|source| HistoryError::Io { path: dir, source })?;
        }
        Ok(())
    }
}

/// Side outputs captured for a step.
#[derive(Debug, Clone, Default)]
pub struct StepArtifacts {
    /// PNG screenshot taken after the step's actions.
    pub frame: Option<Vec<u8>>,
    pub transcript: Vec<Message>,
}

/// One step as stored on disk, with the paths of its artifacts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryRecord {
    pub step: Step,
    #[serde(default)]
    pub frame: Option<PathBuf>,
    #[serde(default)]
    pub conversation: Option<PathBuf>,
}

/// Contents of a history file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryDump {
    pub task: Task,
    pub records: Vec<HistoryRecord>,
}

impl HistoryDump {
    /// Recorded steps in ascending sequence order, rejecting duplicates.
    pub fn replay_plan(&self) -> Result<Vec<Step>, HistoryError> {
        let mut steps: Vec<Step> = self.records.iter().map(|r| r.step.clone()).collect();
        steps.sort_by_key(|step| step.seq);
        for pair in steps.windows(2) {
            if pair[1].seq <= pair[0].seq {
                return Err(HistoryError::OutOfOrder {
                    previous: pair[0].seq,
                    next: pair[1].seq,
                });
            }
        }
        Ok(steps)
    }

    pub fn last_seq(&self) -> Option<u64> {
        self.records.iter().map(|r| r.step.seq).max()
    }
}

pub struct HistoryStore {
    layout: RunLayout,
    task: Task,
    records: Vec<HistoryRecord>,
}

impl HistoryStore {
    pub fn create(layout: RunLayout, task: &Task) -> Result<Self, HistoryError> {
        layout.create()?;
        info!(root = %layout.root.display(), "history store ready");
        Ok(Self {
            layout,
            task: task.clone(),
            records: Vec::new(),
        })
    }

    pub fn layout(&self) -> &RunLayout {
        &self.layout
    }

    pub fn records(&self) -> &[HistoryRecord] {
        &self.records
    }

    pub fn last_seq(&self) -> Option<u64> {
        self.records.last().map(|r| r.step.seq)
    }

    /// Carry the records of a resumed run so later dumps stay complete.
    pub fn seed(&mut self, dump: &HistoryDump) -> Result<(), HistoryError> {
        let steps = dump.replay_plan()?;
        let mut records = dump.records.clone();
        records.sort_by_key(|r| r.step.seq);
        debug!(steps = steps.len(), "seeded history from previous run");
        let next = dump.last_seq().unwrap_or(0) + 1;
        if !self.layout.existing_step_files(next).is_empty() {
            warn!(
                root = %self.layout.root.display(),
                from_step = next,
                "resuming mid-run; files of later steps will be overwritten"
            );
        }
        self.records = records;
        Ok(())
    }

    /// Persist a completed step and refresh the latest alias.
    pub fn record(
        &mut self,
        step: &Step,
        artifacts: StepArtifacts,
    ) -> Result<&HistoryRecord, HistoryError> {
        if let Some(previous) = self.last_seq() {
            if step.seq <= previous {
                return Err(HistoryError::OutOfOrder {
                    previous,
                    next: step.seq,
                });
            }
        }

        for path in self.layout.existing_step_files(step.seq) {
            warn!(step = step.seq, path = %path.display(), "overwriting file from an earlier run");
        }

        let frame = match artifacts.frame {
            Some(bytes) => {
                let path = self.layout.frame_file(step.seq);
                write_atomic(&path, &bytes)?;
                Some(path)
            }
            None => None,
        };

        let conversation = self.layout.conversation_file(step.seq);
        write_json(&conversation, &artifacts.transcript)?;

        self.records.push(HistoryRecord {
            step: step.clone(),
            frame,
            conversation: Some(conversation),
        });

        let dump = HistoryDump {
            task: self.task.clone(),
            records: self.records.clone(),
        };
        write_json(&self.layout.history_file(step.seq), &dump)?;
        write_json(&self.layout.latest_file(), &dump)?;
        info!(step = step.seq, "saved data for step");

        match self.records.last() {
            Some(record) => Ok(record),
            None => Err(HistoryError::Empty(self.layout.latest_file())),
        }
    }

    /// The most recent completed step, read back through the latest alias.
    pub fn latest(&self) -> Result<HistoryRecord, HistoryError> {
        let path = self.layout.latest_file();
        let dump = Self::load(&path)?;
        dump.records
            .into_iter()
            .max_by_key(|r| r.step.seq)
            .ok_or(HistoryError::Empty(path))
    }

    pub fn load(path: &Path) -> Result<HistoryDump, HistoryError> {
        read_json(path)
    }

    /// Steps recorded in the history file at `path`, ready to be replayed.
    pub fn replay_plan(path: &Path) -> Result<Vec<Step>, HistoryError> {
        Self::load(path)?.replay_plan()
    }
}

fn write_json<T: Serialize + ?Sized>(path: &Path, value: &T) -> Result<(), HistoryError> {
    let bytes = serde_json::to_vec_pretty(value).map_err(|source| HistoryError::Format {
        path: path.to_path_buf(),
        source,
    })?;
    write_atomic(path, &bytes)
}

/// Write through a sibling temp file so readers never see a partial file.
fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), HistoryError> {
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);
    fs::write(&tmp, bytes).map_err(|source| HistoryError::Io {
        path: tmp.clone(),
        source,
    })?;
    fs::rename(&tmp, path).map_err(|source| HistoryError::Io {
        path: path.to_path_buf(),
        source,
    })
}

fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T, HistoryError> {
    let file = fs::File::open(path).map_err(|source| HistoryError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let reader = std::io::BufReader::new(file);
    serde_json::from_reader(reader).map_err(|source| HistoryError::Format {
        path: path.to_path_buf(),
        source,
    })
}
