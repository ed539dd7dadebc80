//! I/O managers for different storage backends

use crate::error::{Result, VdsError};
use async_trait::async_trait;
use bytes::Bytes;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;

/// Storage backend types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageBackend {
    /// Local file system
    FileSystem,
    /// AWS S3
    S3,
    /// Azure Blob Storage
    Azure,
    /// Google Cloud Storage
    GCS,
    /// OSDU/DELFI Seismic DMS
    SeismicDMS,
}

impl StorageBackend {
    /// Parse storage backend from URL scheme
    pub fn from_url(url: &str) -> Result<Self> {
        match url.split_once("://") {
            Some((scheme, _)) => match scheme {
                "file" => Ok(StorageBackend::FileSystem),
                "s3" => Ok(StorageBackend::S3),
                "azure" | "azureSAS" => Ok(StorageBackend::Azure),
                "gs" => Ok(StorageBackend::GCS),
                "sd" => Ok(StorageBackend::SeismicDMS),
                _ => Err(VdsError::InvalidUrl(format!("Unknown scheme: {}", scheme))),
            },
            // Assume file system if no scheme
            None => Ok(StorageBackend::FileSystem),
        }
    }
}

/// Trait for I/O operations with cloud storage or file systems
#[async_trait]
pub trait IOManager: Send + Sync {
    /// Read data from a path
    async fn read(&self, path: &str) -> Result<Bytes>;

    /// Write data to a path, replacing any previous content
    async fn write(&self, path: &str, data: &[u8]) -> Result<()>;

    /// Check if a path exists
    async fn exists(&self, path: &str) -> Result<bool>;

    /// Delete data at a path
    async fn delete(&self, path: &str) -> Result<()>;

    /// List items with a given prefix
    async fn list(&self, prefix: &str) -> Result<Vec<String>>;

    /// Get the backend type
    fn backend(&self) -> StorageBackend;
}

/// File system I/O manager
pub struct FileSystemIOManager {
    base_path: PathBuf,
}

impl FileSystemIOManager {
    /// Create a new file system I/O manager
    pub fn new(base_path: impl AsRef<Path>) -> Self {
        Self {
            base_path: base_path.as_ref().to_path_buf(),
        }
    }

    /// Get the full path for a relative path
    fn full_path(&self, path: &str) -> PathBuf {
        self.base_path.join(path)
    }
}

#[async_trait]
impl IOManager for FileSystemIOManager {
    async fn read(&self, path: &str) -> Result<Bytes> {
        let full_path = self.full_path(path);
        match fs::read(&full_path).await {
            Ok(data) => Ok(Bytes::from(data)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(VdsError::NotFound(full_path.display().to_string()))
            }
            Err(e) => Err(VdsError::Io(e)),
        }
    }

    async fn write(&self, path: &str, data: &[u8]) -> Result<()> {
        let full_path = self.full_path(path);

        // Create parent directories if they don't exist
        if let Some(parent) = full_path.parent() {
            fs::create_dir_all(parent).await?;
        }

        // Write next to the target and rename, so readers never see half a file
        let staging = full_path.with_extension("partial");
        let mut file = fs::File::create(&staging).await?;
        file.write_all(data).await?;
        file.sync_all().await?;
        drop(file);
        fs::rename(&staging, &full_path).await?;
        Ok(())
    }

    async fn exists(&self, path: &str) -> Result<bool> {
        Ok(fs::try_exists(self.full_path(path)).await?)
    }

    async fn delete(&self, path: &str) -> Result<()> {
        fs::remove_file(self.full_path(path)).await?;
        Ok(())
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>> {
        let full_path = self.full_path(prefix);
        let mut entries = Vec::new();

        if full_path.is_dir() {
            let mut read_dir = fs::read_dir(&full_path).await?;
            while let Some(entry) = read_dir.next_entry().await? {
                if let Some(name) = entry.file_name().to_str() {
                    entries.push(name.to_string());
                }
            }
        }

        entries.sort();
        Ok(entries)
    }

    fn backend(&self) -> StorageBackend {
        StorageBackend::FileSystem
    }
}

/// Parse URL and create appropriate I/O manager
///
/// Only filesystem URLs are supported. For cloud storage (S3, Azure, GCS, OSDU),
/// implement the `IOManager` trait and a `VolumeStore` on top of it.
pub fn create_io_manager(url: &str) -> Result<Box<dyn IOManager>> {
    let backend = StorageBackend::from_url(url)?;

    match backend {
        StorageBackend::FileSystem => {
            // Extract path from file:// URL or use as-is
            let path = url.strip_prefix("file://").unwrap_or(url);
            Ok(Box::new(FileSystemIOManager::new(path)))
        }
        StorageBackend::S3
        | StorageBackend::Azure
        | StorageBackend::GCS
        | StorageBackend::SeismicDMS => Err(VdsError::Configuration(format!(
            "Cloud backend {:?} is not supported by the local store",
            backend
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_file_system_io() {
        let temp_dir = TempDir::new().unwrap();
        let io = FileSystemIOManager::new(temp_dir.path());

        // Write
        let data = b"Hello, OpenVDS!";
        io.write("bricks/ch0/test.dat", data).await.unwrap();

        // Read
        let read_data = io.read("bricks/ch0/test.dat").await.unwrap();
        assert_eq!(&read_data[..], data);

        // Overwrite
        io.write("bricks/ch0/test.dat", b"again").await.unwrap();
        assert_eq!(&io.read("bricks/ch0/test.dat").await.unwrap()[..], b"again");

        // Exists and list
        assert!(io.exists("bricks/ch0/test.dat").await.unwrap());
        assert!(!io.exists("nonexistent.dat").await.unwrap());
        assert_eq!(io.list("bricks/ch0").await.unwrap(), vec!["test.dat"]);

        // Delete
        io.delete("bricks/ch0/test.dat").await.unwrap();
        assert!(!io.exists("bricks/ch0/test.dat").await.unwrap());
    }

    #[tokio::test]
    async fn test_missing_file_is_not_found() {
        let temp_dir = TempDir::new().unwrap();
        let io = FileSystemIOManager::new(temp_dir.path());
        assert!(matches!(
            io.read("metadata.json").await,
            Err(VdsError::NotFound(_))
        ));
    }

    #[test]
    fn test_backend_from_url() {
        assert_eq!(
            StorageBackend::from_url("file:///data/volume").unwrap(),
            StorageBackend::FileSystem
        );
        assert_eq!(
            StorageBackend::from_url("/data/volume").unwrap(),
            StorageBackend::FileSystem
        );
        assert_eq!(
            StorageBackend::from_url("s3://bucket/volume").unwrap(),
            StorageBackend::S3
        );
        assert_eq!(
            StorageBackend::from_url("azure://container/volume").unwrap(),
            StorageBackend::Azure
        );
        assert!(StorageBackend::from_url("ftp://host/volume").is_err());
    }

    #[test]
    fn test_cloud_backends_are_rejected() {
        assert!(matches!(
            create_io_manager("gs://bucket/volume"),
            Err(VdsError::Configuration(_))
        ));
        assert_eq!(
            create_io_manager("file:///tmp/volume").unwrap().backend(),
            StorageBackend::FileSystem
        );
    }
}
