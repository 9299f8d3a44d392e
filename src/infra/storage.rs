//! Filesystem-backed object storage.

use std::{
    io::{ErrorKind, Write},
    path::{Component, Path, PathBuf},
};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::fs;

use crate::application::repos::{ObjectMeta, ObjectStore, RepoError, StoredObject};

const TEMP_PREFIX: &str = ".stave-";

/// Objects stored as plain files under a root directory, one file per key.
///
/// Writes go to a temporary file in the target directory and are renamed into
/// place, so readers only ever see complete objects. Content types are derived
/// from the key's extension.
#[derive(Debug, Clone)]
pub struct FsObjectStore {
    root: PathBuf,
}

impl FsObjectStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Create the root directory if it does not exist yet.
    pub async fn ensure_root(&self) -> Result<(), std::io::Error> {
        fs::create_dir_all(&self.root).await
    }

    fn resolve(&self, key: &str) -> Result<PathBuf, RepoError> {
        let relative = Path::new(key);
        if relative.is_absolute()
            || relative.components().any(|component| {
                matches!(
                    component,
                    Component::ParentDir | Component::Prefix(_) | Component::RootDir
                )
            })
        {
            return Err(RepoError::invalid_input(format!("invalid object key `{key}`")));
        }

        Ok(self.root.join(relative))
    }
}

fn content_type_for(key: &str) -> String {
    mime_guess::from_path(key)
        .first_or_octet_stream()
        .essence_str()
        .to_string()
}

#[async_trait]
impl ObjectStore for FsObjectStore {
    async fn get(&self, key: &str) -> Result<Option<StoredObject>, RepoError> {
        let absolute = self.resolve(key)?;
        match fs::read(&absolute).await {
            Ok(data) => Ok(Some(StoredObject {
                bytes: Bytes::from(data),
                content_type: content_type_for(key),
            })),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
            Err(err) => Err(RepoError::from_persistence(err)),
        }
    }

    async fn put(&self, key: &str, bytes: Bytes, _content_type: &str) -> Result<(), RepoError> {
        let absolute = self.resolve(key)?;
        let parent = absolute
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| self.root.clone());

        tokio::task::spawn_blocking(move || -> Result<(), std::io::Error> {
            std::fs::create_dir_all(&parent)?;
            let mut staged = tempfile::Builder::new()
                .prefix(TEMP_PREFIX)
                .suffix(".tmp")
                .tempfile_in(&parent)?;
            staged.write_all(&bytes)?;
            staged.flush()?;
            staged.persist(&absolute).map_err(|err| err.error)?;
            Ok(())
        })
        .await
        .map_err(RepoError::from_persistence)?
        .map_err(RepoError::from_persistence)
    }

    async fn head(&self, key: &str) -> Result<Option<ObjectMeta>, RepoError> {
        let absolute = self.resolve(key)?;
        match fs::metadata(&absolute).await {
            Ok(metadata) if metadata.is_file() => Ok(Some(ObjectMeta {
                key: key.to_string(),
                size: metadata.len(),
                content_type: content_type_for(key),
            })),
            Ok(_) => Ok(None),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
            Err(err) => Err(RepoError::from_persistence(err)),
        }
    }

    /// Lists one directory level: the directory part of `prefix` is walked and
    /// file names are matched against the remainder.
    async fn list(&self, prefix: &str) -> Result<Vec<String>, RepoError> {
        let (directory, file_prefix) = match prefix.rsplit_once('/') {
            Some((directory, rest)) => (directory, rest),
            None => ("", prefix),
        };
        let absolute = if directory.is_empty() {
            self.root.clone()
        } else {
            self.resolve(directory)?
        };

        let mut entries = match fs::read_dir(&absolute).await {
            Ok(entries) => entries,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(RepoError::from_persistence(err)),
        };

        let mut keys = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(RepoError::from_persistence)?
        {
            let Some(name) = entry.file_name().to_str().map(str::to_string) else {
                continue;
            };
            if name.starts_with(TEMP_PREFIX) || !name.starts_with(file_prefix) {
                continue;
            }
            let file_type = entry
                .file_type()
                .await
                .map_err(RepoError::from_persistence)?;
            if !file_type.is_file() {
                continue;
            }
            keys.push(if directory.is_empty() {
                name
            } else {
                format!("{directory}/{name}")
            });
        }
        keys.sort();
        Ok(keys)
    }

    async fn delete_prefix(&self, prefix: &str) -> Result<usize, RepoError> {
        let mut removed = 0;
        for key in self.list(prefix).await? {
            let absolute = self.resolve(&key)?;
            match fs::remove_file(&absolute).await {
                Ok(()) => removed += 1,
                Err(err) if err.kind() == ErrorKind::NotFound => {}
                Err(err) => return Err(RepoError::from_persistence(err)),
            }
        }
        Ok(removed)
    }
}
