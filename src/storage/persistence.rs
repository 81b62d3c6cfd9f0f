//! JSON file persistence
//!
//! Small helper for state that lives in a single JSON document inside the
//! node's data directory (the address book's `peers.json`). Writes go to a
//! temporary sibling first and are renamed into place.

use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fs;
use std::io::{self, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Storage errors
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("IO error: {0}")]
    IoError(#[from] io::Error),
    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),
    #[error("Invalid data: {0}")]
    InvalidData(String),
}

/// A JSON document at a fixed path
#[derive(Debug, Clone)]
pub struct JsonFile {
    path: PathBuf,
}

impl JsonFile {
    pub fn new(data_dir: &Path, file_name: &str) -> Self {
        Self {
            path: data_dir.join(file_name),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn temp_path(&self) -> PathBuf {
        let mut name = self.path.as_os_str().to_owned();
        name.push(".new");
        PathBuf::from(name)
    }

    /// Write `value`, replacing the previous document atomically
    pub fn save<T: Serialize>(&self, value: &T) -> Result<(), StorageError> {
        if let Some(dir) = self.path.parent() {
            fs::create_dir_all(dir)?;
        }

        let temp_path = self.temp_path();
        {
            let file = fs::File::create(&temp_path)?;
            let mut writer = BufWriter::new(file);
            serde_json::to_writer(&mut writer, value)?;
            writer.flush()?;
        }

        fs::rename(&temp_path, &self.path)?;
        Ok(())
    }

    /// Read the document; `Ok(None)` when it does not exist yet
    pub fn load<T: DeserializeOwned>(&self) -> Result<Option<T>, StorageError> {
        if !self.path.exists() {
            return Ok(None);
        }

        let file = fs::File::open(&self.path)?;
        let reader = BufReader::new(file);
        Ok(Some(serde_json::from_reader(reader)?))
    }

    pub fn exists(&self) -> bool {
        self.path.exists()
    }

    /// Delete the document if present
    pub fn delete(&self) -> Result<(), StorageError> {
        if self.path.exists() {
            fs::remove_file(&self.path)?;
        }
        Ok(())
    }

    /// Size of the document on disk, 0 when missing
    pub fn file_size(&self) -> Result<u64, StorageError> {
        if !self.path.exists() {
            return Ok(0);
        }
        Ok(fs::metadata(&self.path)?.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use tempfile::tempdir;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Doc {
        version: u32,
        items: Vec<String>,
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempdir().unwrap();
        let file = JsonFile::new(dir.path(), "doc.json");

        assert!(file.load::<Doc>().unwrap().is_none());

        let doc = Doc {
            version: 1,
            items: vec!["a".to_string(), "b".to_string()],
        };
        file.save(&doc).unwrap();

        assert!(file.exists());
        assert!(!file.temp_path().exists());
        assert!(file.file_size().unwrap() > 0);
        assert_eq!(file.load::<Doc>().unwrap(), Some(doc));
    }

    #[test]
    fn test_corrupt_document() {
        let dir = tempdir().unwrap();
        let file = JsonFile::new(dir.path(), "doc.json");
        fs::write(file.path(), b"{not json").unwrap();

        assert!(matches!(
            file.load::<Doc>(),
            Err(StorageError::SerializationError(_))
        ));

        file.delete().unwrap();
        assert!(!file.exists());
        assert_eq!(file.file_size().unwrap(), 0);
    }
}
