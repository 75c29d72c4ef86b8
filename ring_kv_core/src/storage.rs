//! Flat-file storage engine.
//!
//! One text file per node, one `key value` line per entry. The value is
//! everything after the first space. There is no index: lookups and range
//! scans read the whole file and rehash keys as needed. Rewrites go through
//! a temporary file that is renamed over the original.

use crate::error::Result;
use crate::hash::HashRange;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tokio::fs::{self, OpenOptions};
use tokio::io::{AsyncWriteExt, BufWriter};

#[derive(Debug, Clone)]
pub struct FileStorage {
    path: PathBuf,
}

impl FileStorage {
    /// Open (creating if needed) `<dir>/<host>_<port>.txt`.
    pub async fn open(dir: impl AsRef<Path>, host: &str, port: u16) -> Result<Self> {
        let file_name = format!("{}_{}.txt", host.replace(['/', '\\', ':'], "_"), port);
        Self::open_path(dir.as_ref().join(file_name)).await
    }

    pub async fn open_path(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).await?;
            }
        }
        OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await?;
        Ok(Self { path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn entries(&self) -> Result<Vec<(String, String)>> {
        let contents = match fs::read_to_string(&self.path).await {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => String::new(),
            Err(e) => return Err(e.into()),
        };
        Ok(contents.lines().filter_map(parse_line).collect())
    }

    async fn rewrite(&self, entries: &[(String, String)]) -> Result<()> {
        let mut temp_path = self.path.clone();
        temp_path.set_extension("tmp");

        let file = fs::File::create(&temp_path).await?;
        let mut writer = BufWriter::new(file);
        for (key, value) in entries {
            writer.write_all(format_line(key, value).as_bytes()).await?;
        }
        writer.flush().await?;
        drop(writer);

        fs::rename(&temp_path, &self.path).await?;
        Ok(())
    }

    async fn append(&self, key: &str, value: &str) -> Result<()> {
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        file.write_all(format_line(key, value).as_bytes()).await?;
        file.flush().await?;
        Ok(())
    }

    pub async fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self
            .entries()
            .await?
            .into_iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v))
    }

    pub async fn contains(&self, key: &str) -> Result<bool> {
        Ok(self.get(key).await?.is_some())
    }

    /// Insert or overwrite. Returns true if the key was already stored.
    pub async fn put(&self, key: &str, value: &str) -> Result<bool> {
        let mut entries = self.entries().await?;
        match entries.iter_mut().find(|(k, _)| k == key) {
            Some(entry) => {
                entry.1 = value.to_string();
                self.rewrite(&entries).await?;
                Ok(true)
            }
            None => {
                self.append(key, value).await?;
                Ok(false)
            }
        }
    }

    /// Overwrite an existing key only.
    pub async fn update(&self, key: &str, value: &str) -> Result<bool> {
        let mut entries = self.entries().await?;
        match entries.iter_mut().find(|(k, _)| k == key) {
            Some(entry) => {
                entry.1 = value.to_string();
                self.rewrite(&entries).await?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    pub async fn delete(&self, key: &str) -> Result<bool> {
        let mut entries = self.entries().await?;
        let before = entries.len();
        entries.retain(|(k, _)| k != key);
        if entries.len() == before {
            return Ok(false);
        }
        self.rewrite(&entries).await?;
        Ok(true)
    }

    /// Merge a batch in one rewrite; later pairs win over earlier ones.
    pub async fn upsert_many(&self, batch: &[(String, String)]) -> Result<()> {
        if batch.is_empty() {
            return Ok(());
        }
        let mut entries = self.entries().await?;
        let mut positions: HashMap<String, usize> = entries
            .iter()
            .enumerate()
            .map(|(i, (k, _))| (k.clone(), i))
            .collect();
        for (key, value) in batch {
            match positions.get(key) {
                Some(&i) => entries[i].1 = value.clone(),
                None => {
                    positions.insert(key.clone(), entries.len());
                    entries.push((key.clone(), value.clone()));
                }
            }
        }
        self.rewrite(&entries).await
    }

    pub async fn entries_in_range(&self, range: &HashRange) -> Result<Vec<(String, String)>> {
        Ok(self
            .entries()
            .await?
            .into_iter()
            .filter(|(k, _)| range.contains_key(k))
            .collect())
    }

    /// Drop every entry whose key hashes into `range`. Returns how many.
    pub async fn remove_range(&self, range: &HashRange) -> Result<usize> {
        let entries = self.entries().await?;
        let before = entries.len();
        let kept: Vec<_> = entries
            .into_iter()
            .filter(|(k, _)| !range.contains_key(k))
            .collect();
        let removed = before - kept.len();
        if removed > 0 {
            self.rewrite(&kept).await?;
        }
        Ok(removed)
    }

    pub async fn len(&self) -> Result<usize> {
        Ok(self.entries().await?.len())
    }

    pub async fn is_empty(&self) -> Result<bool> {
        Ok(self.len().await? == 0)
    }

    pub async fn clear(&self) -> Result<()> {
        fs::write(&self.path, b"").await?;
        Ok(())
    }
}

fn parse_line(line: &str) -> Option<(String, String)> {
    let line = line.trim_end_matches('\r');
    if line.is_empty() {
        return None;
    }
    match line.split_once(' ') {
        Some((key, value)) => Some((key.to_string(), value.to_string())),
        None => Some((line.to_string(), String::new())),
    }
}

fn format_line(key: &str, value: &str) -> String {
    format!("{} {}\n", key, value)
}
