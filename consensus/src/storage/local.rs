use std::io;
use std::marker::PhantomData;

use camino::{Utf8Path, Utf8PathBuf};
use tokio::io::AsyncWriteExt;

use super::{LogStore, Recovered};
use crate::error::{StorageError, StorageErrorKind};
use crate::types::{Command, Entry, HardState, LogIndex, Snapshot};

const HARD_STATE: &str = "hard-state.json";
const SNAPSHOT: &str = "snapshot.json";
const JOURNAL: &str = "journal.log";

/// A log store on the local filesystem.
///
/// The directory holds three files:
///
/// - `hard-state.json`: term, vote and commit index, replaced atomically.
/// - `snapshot.json`: the latest snapshot, replaced atomically.
/// - `journal.log`: one JSON entry per line, appended and fsynced.
///
/// A torn or undecodable record at the end of the journal is dropped on
/// load; everything before it is kept.
#[derive(Debug)]
pub struct LocalStore<C> {
    root: Utf8PathBuf,
    snapshot_index: LogIndex,
    journal: Option<Journal>,
    _command: PhantomData<fn() -> C>,
}

#[derive(Debug)]
struct Journal {
    file: tokio::fs::File,
    first_index: LogIndex,
    offsets: Vec<u64>,
    len: u64,
}

impl<C: Command> LocalStore<C> {
    /// A store rooted at `root`. The directory is created on first use.
    pub fn new(root: impl Into<Utf8PathBuf>) -> Self {
        Self {
            root: root.into(),
            snapshot_index: 0,
            journal: None,
            _command: PhantomData,
        }
    }

    /// Directory holding the store's files.
    pub fn root(&self) -> &Utf8Path {
        &self.root
    }

    fn path(&self, name: &str) -> Utf8PathBuf {
        self.root.join(name)
    }

    async fn read_json<T: serde::de::DeserializeOwned>(
        &self,
        name: &str,
    ) -> Result<Option<T>, StorageError> {
        let path = self.path(name);
        let bytes = match tokio::fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(StorageError::at(StorageErrorKind::Io, "read", path)(err)),
        };
        serde_json::from_slice(&bytes)
            .map(Some)
            .map_err(StorageError::at(StorageErrorKind::Corrupt, "decode", path))
    }

    async fn write_json<T: serde::Serialize>(&self, name: &str, value: &T) -> Result<(), StorageError> {
        let path = self.path(name);
        let bytes = serde_json::to_vec(value).map_err(StorageError::at(
            StorageErrorKind::Serialization,
            "encode",
            path.clone(),
        ))?;
        write_atomic(&path, &bytes).await
    }

    /// Read the journal, drop any torn tail, and open it for appending.
    async fn open_journal(&mut self) -> Result<Vec<Entry<C>>, StorageError> {
        let path = self.path(JOURNAL);
        let bytes = match tokio::fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == io::ErrorKind::NotFound => Vec::new(),
            Err(err) => return Err(StorageError::at(StorageErrorKind::Io, "read journal", path)(err)),
        };

        let mut entries: Vec<Entry<C>> = Vec::new();
        let mut offsets = Vec::new();
        let mut valid = 0u64;
        for line in bytes.split_inclusive(|b| *b == b'\n') {
            let Some(record) = line.strip_suffix(b"\n") else {
                tracing::warn!(offset = valid, "dropping torn journal record");
                break;
            };
            let entry = match serde_json::from_slice::<Entry<C>>(record) {
                Ok(entry) => entry,
                Err(err) => {
                    tracing::warn!(offset = valid, %err, "dropping undecodable journal tail");
                    break;
                }
            };
            if let Some(last) = entries.last() {
                if entry.index != last.index + 1 {
                    tracing::warn!(offset = valid, index = entry.index, "dropping out of order journal tail");
                    break;
                }
            }
            offsets.push(valid);
            entries.push(entry);
            valid += line.len() as u64;
        }

        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await
            .map_err(StorageError::at(StorageErrorKind::Io, "open journal", path.clone()))?;

        if valid < bytes.len() as u64 {
            file.set_len(valid)
                .await
                .map_err(StorageError::at(StorageErrorKind::Io, "repair journal", path.clone()))?;
            file.sync_all()
                .await
                .map_err(StorageError::at(StorageErrorKind::Io, "repair journal", path))?;
        }

        self.journal = Some(Journal {
            file,
            first_index: entries
                .first()
                .map(|e| e.index)
                .unwrap_or(self.snapshot_index + 1),
            offsets,
            len: valid,
        });
        Ok(entries)
    }

    async fn journal(&mut self) -> Result<&mut Journal, StorageError> {
        if self.journal.is_none() {
            self.create_root().await?;
            self.open_journal().await?;
        }
        self.journal.as_mut().ok_or_else(|| {
            StorageError::new(StorageErrorKind::Io, "open journal", "journal unavailable")
        })
    }

    async fn create_root(&self) -> Result<(), StorageError> {
        tokio::fs::create_dir_all(&self.root)
            .await
            .map_err(StorageError::at(StorageErrorKind::Io, "create directory", self.root.clone()))
    }
}

async fn write_atomic(path: &Utf8Path, bytes: &[u8]) -> Result<(), StorageError> {
    let tmp = path.with_extension("tmp");

    let mut file = tokio::fs::File::create(&tmp)
        .await
        .map_err(StorageError::at(StorageErrorKind::Io, "create", tmp.clone()))?;
    file.write_all(bytes)
        .await
        .map_err(StorageError::at(StorageErrorKind::Io, "write", tmp.clone()))?;
    file.sync_all()
        .await
        .map_err(StorageError::at(StorageErrorKind::Io, "sync", tmp.clone()))?;
    tokio::fs::rename(&tmp, path)
        .await
        .map_err(StorageError::at(StorageErrorKind::Io, "rename", path.to_owned()))
}

#[async_trait::async_trait]
impl<C: Command> LogStore<C> for LocalStore<C> {
    fn name(&self) -> &'static str {
        "local"
    }

    #[tracing::instrument(skip(self), fields(root = %self.root))]
    async fn load(&mut self) -> Result<Recovered<C>, StorageError> {
        self.create_root().await?;
        let hard_state = self.read_json::<HardState>(HARD_STATE).await?.unwrap_or_default();
        let snapshot = self.read_json::<Snapshot>(SNAPSHOT).await?;
        self.snapshot_index = snapshot.as_ref().map(|s| s.index).unwrap_or(0);
        let entries = self.open_journal().await?;

        tracing::debug!(
            term = hard_state.current_term,
            snapshot = self.snapshot_index,
            entries = entries.len(),
            "recovered log"
        );
        Ok(Recovered {
            hard_state,
            snapshot,
            entries,
        })
    }

    async fn save_hard_state(&mut self, state: &HardState) -> Result<(), StorageError> {
        self.create_root().await?;
        self.write_json(HARD_STATE, state).await
    }

    async fn append(&mut self, entries: &[Entry<C>]) -> Result<(), StorageError> {
        let Some(first) = entries.first() else {
            return Ok(());
        };
        let path = self.path(JOURNAL);
        let journal = self.journal().await?;

        let mut buf = Vec::new();
        let mut offsets = Vec::with_capacity(entries.len());
        for entry in entries {
            offsets.push(journal.len + buf.len() as u64);
            serde_json::to_writer(&mut buf, entry).map_err(StorageError::at(
                StorageErrorKind::Serialization,
                "encode entry",
                path.clone(),
            ))?;
            buf.push(b'\n');
        }

        if journal.offsets.is_empty() {
            journal.first_index = first.index;
        }
        journal
            .file
            .write_all(&buf)
            .await
            .map_err(StorageError::at(StorageErrorKind::Io, "append", path.clone()))?;
        journal
            .file
            .flush()
            .await
            .map_err(StorageError::at(StorageErrorKind::Io, "append", path.clone()))?;
        journal
            .file
            .sync_data()
            .await
            .map_err(StorageError::at(StorageErrorKind::Io, "sync journal", path))?;

        journal.offsets.extend(offsets);
        journal.len += buf.len() as u64;
        Ok(())
    }

    async fn truncate_from(&mut self, index: LogIndex) -> Result<(), StorageError> {
        let path = self.path(JOURNAL);
        let journal = self.journal().await?;

        let cut = if index <= journal.first_index {
            journal.offsets.clear();
            0
        } else {
            let pos = (index - journal.first_index) as usize;
            match journal.offsets.get(pos) {
                Some(offset) => {
                    let offset = *offset;
                    journal.offsets.truncate(pos);
                    offset
                }
                None => return Ok(()),
            }
        };

        journal
            .file
            .set_len(cut)
            .await
            .map_err(StorageError::at(StorageErrorKind::Io, "truncate journal", path.clone()))?;
        journal
            .file
            .sync_data()
            .await
            .map_err(StorageError::at(StorageErrorKind::Io, "sync journal", path))?;
        journal.len = cut;
        Ok(())
    }

    async fn save_snapshot(&mut self, snapshot: &Snapshot) -> Result<(), StorageError> {
        self.create_root().await?;
        self.write_json(SNAPSHOT, snapshot).await?;
        self.snapshot_index = snapshot.index;

        let path = self.path(JOURNAL);
        let keep_from = snapshot.index + 1;
        let journal = self.journal().await?;
        if journal.offsets.is_empty() {
            journal.first_index = keep_from;
            return Ok(());
        }
        if keep_from <= journal.first_index {
            return Ok(());
        }

        let pos = (keep_from - journal.first_index) as usize;
        let cut = journal.offsets.get(pos).copied().unwrap_or(journal.len);
        let bytes = tokio::fs::read(&path)
            .await
            .map_err(StorageError::at(StorageErrorKind::Io, "read journal", path.clone()))?;
        let tail = bytes.get(cut as usize..).unwrap_or_default();
        write_atomic(&path, tail).await?;

        let file = tokio::fs::OpenOptions::new()
            .append(true)
            .open(&path)
            .await
            .map_err(StorageError::at(StorageErrorKind::Io, "open journal", path))?;

        let offsets = journal
            .offsets
            .iter()
            .skip(pos)
            .map(|offset| offset - cut)
            .collect();
        *journal = Journal {
            file,
            first_index: keep_from,
            offsets,
            len: tail.len() as u64,
        };
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::membership::{Member, Membership};
    use crate::types::EntryPayload;

    fn entry(index: LogIndex, term: u64, value: u32) -> Entry<u32> {
        Entry::new(index, term, EntryPayload::Command(value))
    }

    fn tempdir() -> (tempfile::TempDir, Utf8PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let root = Utf8Path::from_path(dir.path()).expect("utf-8 path").join("raft");
        (dir, root)
    }

    #[tokio::test]
    async fn round_trips_state() {
        let (_dir, root) = tempdir();
        let mut store = LocalStore::<u32>::new(root.clone());
        assert!(store.load().await.unwrap().entries.is_empty());

        let hard_state = HardState {
            current_term: 3,
            voted_for: Some(2),
            commit_index: 2,
        };
        store.save_hard_state(&hard_state).await.unwrap();
        store
            .append(&[entry(1, 1, 10), entry(2, 1, 20), entry(3, 3, 30)])
            .await
            .unwrap();
        store.truncate_from(3).await.unwrap();
        store.append(&[entry(3, 3, 31)]).await.unwrap();

        let mut reopened = LocalStore::<u32>::new(root);
        let recovered = reopened.load().await.unwrap();
        assert_eq!(recovered.hard_state, hard_state);
        assert_eq!(
            recovered.entries,
            vec![entry(1, 1, 10), entry(2, 1, 20), entry(3, 3, 31)]
        );
    }

    #[tokio::test]
    async fn drops_torn_tail() {
        let (_dir, root) = tempdir();
        let mut store = LocalStore::<u32>::new(root.clone());
        store.load().await.unwrap();
        store.append(&[entry(1, 1, 10), entry(2, 1, 20)]).await.unwrap();
        drop(store);

        let journal = root.join(JOURNAL);
        let mut bytes = std::fs::read(&journal).unwrap();
        bytes.extend_from_slice(br#"{"index":3,"term":1,"payl"#);
        std::fs::write(&journal, &bytes).unwrap();

        let mut reopened = LocalStore::<u32>::new(root.clone());
        let recovered = reopened.load().await.unwrap();
        assert_eq!(recovered.entries.len(), 2);

        reopened.append(&[entry(3, 2, 30)]).await.unwrap();
        let recovered = LocalStore::<u32>::new(root).load().await.unwrap();
        assert_eq!(recovered.entries.last(), Some(&entry(3, 2, 30)));
    }

    #[tokio::test]
    async fn snapshot_compacts_journal() {
        let (_dir, root) = tempdir();
        let mut store = LocalStore::<u32>::new(root.clone());
        store.load().await.unwrap();
        store
            .append(&(1..=5).map(|i| entry(i, 1, i as u32)).collect::<Vec<_>>())
            .await
            .unwrap();

        let snapshot = Snapshot {
            index: 3,
            term: 1,
            membership: Membership::new([Member::voter(1, "a")]),
            data: b"state".to_vec(),
        };
        store.save_snapshot(&snapshot).await.unwrap();
        store.append(&[entry(6, 2, 6)]).await.unwrap();
        store.truncate_from(6).await.unwrap();

        let recovered = LocalStore::<u32>::new(root).load().await.unwrap();
        assert_eq!(recovered.snapshot, Some(snapshot));
        assert_eq!(
            recovered.entries.iter().map(|e| e.index).collect::<Vec<_>>(),
            vec![4, 5]
        );
    }
}
