use std::{
    collections::{HashMap, HashSet},
    path::{Path, PathBuf},
    sync::Arc,
};
use tokio::{fs, sync::{Mutex, RwLock}};

#[derive(thiserror::Error, Debug)]
pub enum StoreError {

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid filename: {0:?}")]
    InvalidName(String),

}

pub type Result<T> = std::result::Result<T, StoreError>;

// Owns one flat directory of file bodies. The filename is the identity;
// content is opaque bytes.
#[derive(Debug)]
pub struct FileStore {

    dir: PathBuf,

    // One lock per filename: readers share, writers exclude.
    locks: Mutex<HashMap<String, Arc<RwLock<()>>>>,

}

impl FileStore {

    pub async fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        if !dir.is_dir() {
            fs::create_dir_all(&dir).await?;
            tracing::info!("created files directory {:?}", dir);
        }
        Ok(Self {
            dir,
            locks: Mutex::new(HashMap::new()),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    // Current set of stored names.
    pub async fn scan(&self) -> Result<HashSet<String>> {
        let mut names = HashSet::new();
        let mut entries = fs::read_dir(&self.dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            if entry.file_type().await?.is_file() {
                if let Some(name) = entry.file_name().to_str() {
                    names.insert(name.to_owned());
                }
            }
        }
        Ok(names)
    }

    pub async fn read(&self, name: &str) -> Result<Vec<u8>> {
        let path = self.path_for(name)?;
        let lock = self.lock_for(name).await;
        let _guard = lock.read().await;
        Ok(fs::read(path).await?)
    }

    pub async fn write(&self, name: &str, data: &[u8]) -> Result<()> {
        let path = self.path_for(name)?;
        let lock = self.lock_for(name).await;
        let _guard = lock.write().await;
        fs::write(path, data).await?;
        Ok(())
    }

    // Removes the named file; Ok(false) if it wasn't there.
    pub async fn remove(&self, name: &str) -> Result<bool> {
        let path = self.path_for(name)?;
        let lock = self.lock_for(name).await;
        let _guard = lock.write().await;
        match fs::remove_file(path).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    async fn lock_for(&self, name: &str) -> Arc<RwLock<()>> {
        let mut locks = self.locks.lock().await;
        Arc::clone(locks.entry(name.to_owned()).or_default())
    }

    // Names come in off the network; never let one escape the directory.
    fn path_for(&self, name: &str) -> Result<PathBuf> {
        if name.is_empty()
            || name == "."
            || name == ".."
            || name.contains('/')
            || name.contains('\\')
        {
            return Err(StoreError::InvalidName(name.to_owned()));
        }
        Ok(self.dir.join(name))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_store_round_trip() -> anyhow::Result<()> {
        let dir = tempfile::TempDir::new()?;
        let store = FileStore::open(dir.path()).await?;

        assert!(store.scan().await?.is_empty());

        store.write("x.bin", b"hello").await?;
        store.write("y.bin", b"world").await?;
        let names = store.scan().await?;
        assert_eq!(names.len(), 2);
        assert!(names.contains("x.bin"));

        assert_eq!(store.read("x.bin").await?, b"hello");

        assert!(store.remove("x.bin").await?);
        assert!(!store.remove("x.bin").await?);
        assert!(!store.scan().await?.contains("x.bin"));

        Ok(())
    }

    #[tokio::test]
    async fn test_store_overwrite() -> anyhow::Result<()> {
        let dir = tempfile::TempDir::new()?;
        let store = FileStore::open(dir.path()).await?;
        store.write("f", b"one").await?;
        store.write("f", b"two").await?;
        assert_eq!(store.read("f").await?, b"two");
        Ok(())
    }

    #[tokio::test]
    async fn test_store_rejects_escaping_names() -> anyhow::Result<()> {
        let dir = tempfile::TempDir::new()?;
        let store = FileStore::open(dir.path()).await?;
        for name in ["", ".", "..", "../evil", "a/b", "a\\b"] {
            assert!(
                matches!(store.read(name).await, Err(StoreError::InvalidName(_))),
                "name {:?} should be rejected",
                name,
            );
        }
        Ok(())
    }

    #[tokio::test]
    async fn test_store_creates_missing_dir() -> anyhow::Result<()> {
        let dir = tempfile::TempDir::new()?;
        let nested = dir.path().join("peer_7");
        let store = FileStore::open(&nested).await?;
        store.write("a", b"a").await?;
        assert!(nested.join("a").is_file());
        Ok(())
    }
}
