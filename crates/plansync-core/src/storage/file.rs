//! Directory-backed checkpoint store.
//!
//! One file per checkpoint, named by [`super::checkpoint_file_name`]. Writes
//! go to a temporary sibling first and are renamed into place, so a crash
//! mid-write never leaves a truncated checkpoint under the final name.

use std::{
    fs,
    io::{self, Write},
    path::{Path, PathBuf},
    sync::Arc,
};

use plansync_proto::{ScenarioId, UndoNumber};

use super::{CheckpointStore, StorageError, checkpoint_file_name, parse_checkpoint_file_name};

/// Checkpoint store rooted at a directory.
#[derive(Clone, Debug)]
pub struct FileCheckpointStore {
    dir: Arc<PathBuf>,
}

impl FileCheckpointStore {
    /// Open (creating if needed) a checkpoint directory.
    pub fn open(dir: impl AsRef<Path>) -> Result<Self, StorageError> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;
        Ok(Self { dir: Arc::new(dir) })
    }

    /// Root directory.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path(&self, scenario: ScenarioId, undo_number: UndoNumber) -> PathBuf {
        self.dir.join(checkpoint_file_name(scenario, undo_number))
    }
}

impl CheckpointStore for FileCheckpointStore {
    fn write(
        &self,
        scenario: ScenarioId,
        undo_number: UndoNumber,
        bytes: &[u8],
    ) -> Result<(), StorageError> {
        let path = self.path(scenario, undo_number);
        let tmp = path.with_extension("tmp");
        {
            let mut file = fs::File::create(&tmp)?;
            file.write_all(bytes)?;
            file.sync_all()?;
        }
        fs::rename(&tmp, &path)?;
        Ok(())
    }

    fn read(
        &self,
        scenario: ScenarioId,
        undo_number: UndoNumber,
    ) -> Result<Vec<u8>, StorageError> {
        match fs::read(self.path(scenario, undo_number)) {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                Err(StorageError::NotFound { scenario, undo_number })
            },
            Err(e) => Err(e.into()),
        }
    }

    fn delete(&self, scenario: ScenarioId, undo_number: UndoNumber) -> Result<(), StorageError> {
        match fs::remove_file(self.path(scenario, undo_number)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn list(&self) -> Result<Vec<(ScenarioId, UndoNumber)>, StorageError> {
        let mut found = Vec::new();
        for entry in fs::read_dir(self.dir.as_path())? {
            let entry = entry?;
            if let Some(key) = entry.file_name().to_str().and_then(parse_checkpoint_file_name) {
                found.push(key);
            }
        }
        found.sort_unstable();
        Ok(found)
    }

    fn exists(&self, scenario: ScenarioId, undo_number: UndoNumber) -> Result<bool, StorageError> {
        Ok(self.path(scenario, undo_number).is_file())
    }
}
