//! Append-only JSON-lines journal with snapshot compaction.
//!
//! One journal file backs one collection. Records are replayed in order on
//! bind: first the snapshot (if any), then the journal tail.

use std::{
    fs::{OpenOptions, create_dir_all, rename},
    io::{BufRead, BufReader, Write},
    path::{Path, PathBuf},
};

use serde::{Deserialize, Serialize};

use crate::{StoreError, engine::Document};

const SNAPSHOT_HEADER: &str = "SNAP\t1";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "lowercase")]
pub enum JournalRecord {
    Put { doc: Document },
    Delete { id: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JournalPolicy {
    pub sync_every_records: usize,
    /// Compact into a snapshot once the tail reaches this many records.
    pub max_journal_records: Option<usize>,
}

impl Default for JournalPolicy {
    fn default() -> Self {
        Self {
            sync_every_records: 1,
            max_journal_records: Some(10_000),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JournalCheckpointStats {
    pub snapshot_records: usize,
    pub truncated_journal_records: usize,
}

#[derive(Debug)]
pub struct FileJournal {
    path: PathBuf,
    journal_records: usize,
    unsynced_records: usize,
    policy: JournalPolicy,
}

impl FileJournal {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        Self::open_with_policy(path, JournalPolicy::default())
    }

    pub fn open_with_policy(
        path: impl AsRef<Path>,
        policy: JournalPolicy,
    ) -> Result<Self, StoreError> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            create_dir_all(parent)?;
        }
        OpenOptions::new().create(true).append(true).open(&path)?;
        let journal_records = count_non_empty_lines(&path)?;
        Ok(Self {
            path,
            journal_records,
            unsynced_records: 0,
            policy: JournalPolicy {
                sync_every_records: policy.sync_every_records.max(1),
                ..policy
            },
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn snapshot_path(&self) -> PathBuf {
        let mut path = self.path.clone().into_os_string();
        path.push(".snapshot");
        PathBuf::from(path)
    }

    pub fn journal_record_count(&self) -> usize {
        self.journal_records
    }

    pub fn unsynced_record_count(&self) -> usize {
        self.unsynced_records
    }

    pub fn append_put(&mut self, document: &Document) -> Result<(), StoreError> {
        self.append_record(&JournalRecord::Put {
            doc: document.clone(),
        })
    }

    pub fn append_delete(&mut self, id: &str) -> Result<(), StoreError> {
        self.append_record(&JournalRecord::Delete { id: id.to_string() })
    }

    pub fn should_checkpoint(&self) -> bool {
        self.policy
            .max_journal_records
            .is_some_and(|threshold| threshold > 0 && self.journal_records >= threshold)
    }

    fn append_record(&mut self, record: &JournalRecord) -> Result<(), StoreError> {
        let line = serde_json::to_string(record)?;
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        writeln!(file, "{line}")?;
        self.journal_records += 1;
        self.unsynced_records += 1;
        if self.unsynced_records >= self.policy.sync_every_records {
            file.sync_data()?;
            self.unsynced_records = 0;
        }
        Ok(())
    }

    pub fn flush_pending_sync(&mut self) -> Result<(), StoreError> {
        if self.unsynced_records == 0 {
            return Ok(());
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        file.sync_data()?;
        self.unsynced_records = 0;
        Ok(())
    }

    pub fn replay(&self) -> Result<Vec<JournalRecord>, StoreError> {
        let mut out = self.replay_snapshot_records()?;
        out.extend(read_records(&self.path)?);
        Ok(out)
    }

    fn replay_snapshot_records(&self) -> Result<Vec<JournalRecord>, StoreError> {
        let snapshot_path = self.snapshot_path();
        if !snapshot_path.exists() {
            return Ok(Vec::new());
        }
        let file = OpenOptions::new().read(true).open(&snapshot_path)?;
        let mut lines = BufReader::new(file).lines();
        let header = loop {
            match lines.next() {
                Some(line) => {
                    let line = line?;
                    if line.trim().is_empty() {
                        continue;
                    }
                    break line;
                }
                None => return Err(StoreError::Parse("snapshot file is empty".to_string())),
            }
        };
        if header != SNAPSHOT_HEADER {
            return Err(StoreError::Parse(
                "snapshot file has invalid header".to_string(),
            ));
        }
        let mut out = Vec::new();
        for line in lines {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            out.push(serde_json::from_str(&line)?);
        }
        Ok(out)
    }

    /// Writes `documents` as the new snapshot and truncates the journal tail.
    pub fn checkpoint<'a>(
        &mut self,
        documents: impl IntoIterator<Item = &'a Document>,
    ) -> Result<JournalCheckpointStats, StoreError> {
        let truncated_journal_records = self.journal_records;
        self.flush_pending_sync()?;

        let snapshot_path = self.snapshot_path();
        let mut tmp_path = snapshot_path.clone().into_os_string();
        tmp_path.push(".tmp");
        let tmp_path = PathBuf::from(tmp_path);

        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&tmp_path)?;
        writeln!(file, "{SNAPSHOT_HEADER}")?;
        let mut snapshot_records = 0usize;
        for document in documents {
            let line = serde_json::to_string(&JournalRecord::Put {
                doc: document.clone(),
            })?;
            writeln!(file, "{line}")?;
            snapshot_records += 1;
        }
        file.sync_all()?;
        rename(tmp_path, snapshot_path)?;

        OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&self.path)?;
        self.journal_records = 0;
        self.unsynced_records = 0;

        Ok(JournalCheckpointStats {
            snapshot_records,
            truncated_journal_records,
        })
    }
}

impl Drop for FileJournal {
    fn drop(&mut self) {
        let _ = self.flush_pending_sync();
    }
}

fn read_records(path: &Path) -> Result<Vec<JournalRecord>, StoreError> {
    let file = OpenOptions::new().read(true).open(path)?;
    let mut out = Vec::new();
    for line in BufReader::new(file).lines() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        out.push(serde_json::from_str(&line)?);
    }
    Ok(out)
}

fn count_non_empty_lines(path: &Path) -> Result<usize, StoreError> {
    let file = OpenOptions::new().read(true).open(path)?;
    let mut count = 0usize;
    for line in BufReader::new(file).lines() {
        if !line?.trim().is_empty() {
            count += 1;
        }
    }
    Ok(count)
}
