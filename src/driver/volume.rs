//! Directory-backed volume driver

use super::{archive_digest, LocalVolume, VolumeDriver, VolumeSnapshot};
use crate::error::{Result, RuneError};
use crate::model::deployment::validate_name;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use std::fs::File;
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use tracing::{debug, info};
use uuid::Uuid;

/// Directory under the volume root holding partially received volumes
pub const STAGING_DIR: &str = ".incoming";

/// Directory under the volume root holding snapshot archives in transit
pub const SPOOL_DIR: &str = ".spool";

/// Volume driver storing each volume as a directory under a base path
///
/// Incoming transfers are unpacked into a hidden staging directory and
/// published with a rename, so a volume is only listed once complete.
pub struct FilesystemVolumeDriver {
    /// Base path for volume storage
    base_path: PathBuf,
}

impl FilesystemVolumeDriver {
    /// Create a new volume driver
    pub fn new(base_path: PathBuf) -> Result<Self> {
        std::fs::create_dir_all(base_path.join(STAGING_DIR))?;
        std::fs::create_dir_all(base_path.join(SPOOL_DIR))?;
        Ok(Self { base_path })
    }

    /// Path a volume is published at
    pub fn volume_path(&self, name: &str) -> PathBuf {
        self.base_path.join(name)
    }

    fn unpack(archive: &Path, target: &Path) -> Result<()> {
        std::fs::create_dir_all(target)?;
        let reader = BufReader::new(File::open(archive)?);
        let mut archive = tar::Archive::new(GzDecoder::new(reader));
        archive
            .unpack(target)
            .map_err(|e| RuneError::Transfer(format!("Failed to unpack snapshot: {}", e)))
    }
}

impl VolumeDriver for FilesystemVolumeDriver {
    fn list_volumes(&self) -> Result<Vec<LocalVolume>> {
        let mut volumes = Vec::new();

        for entry in std::fs::read_dir(&self.base_path)? {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().to_string();
            if name.starts_with('.') || !entry.file_type()?.is_dir() {
                continue;
            }
            volumes.push(LocalVolume {
                path: entry.path(),
                name,
            });
        }

        volumes.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(volumes)
    }

    fn create_from_local(&self, name: &str) -> Result<LocalVolume> {
        validate_name(name)?;
        let path = self.volume_path(name);
        if path.exists() {
            return Err(RuneError::VolumeExists(name.to_string()));
        }

        std::fs::create_dir_all(&path)?;
        info!("Created volume {}", name);

        Ok(LocalVolume {
            name: name.to_string(),
            path,
        })
    }

    fn spool(&self) -> Result<NamedTempFile> {
        Ok(NamedTempFile::new_in(self.base_path.join(SPOOL_DIR))?)
    }

    fn create_from_transfer(&self, snapshot: VolumeSnapshot) -> Result<LocalVolume> {
        validate_name(&snapshot.volume)?;

        let (digest, size) = archive_digest(&snapshot.archive)?;
        if size != snapshot.size || digest != snapshot.checksum {
            return Err(RuneError::Transfer(format!(
                "Checksum mismatch for volume {}: expected {}, got {}",
                snapshot.volume, snapshot.checksum, digest
            )));
        }

        let path = self.volume_path(&snapshot.volume);
        if path.exists() {
            return Err(RuneError::VolumeExists(snapshot.volume.clone()));
        }

        let staging = self.base_path.join(STAGING_DIR).join(format!(
            "{}-{}",
            snapshot.volume,
            Uuid::new_v4().simple()
        ));

        debug!(
            "Unpacking {} bytes for volume {} into {}",
            size,
            snapshot.volume,
            staging.display()
        );

        if let Err(e) = Self::unpack(&snapshot.archive, &staging) {
            let _ = std::fs::remove_dir_all(&staging);
            return Err(e);
        }

        if let Err(e) = std::fs::rename(&staging, &path) {
            let _ = std::fs::remove_dir_all(&staging);
            return Err(e.into());
        }

        info!("Published received volume {}", snapshot.volume);
        Ok(LocalVolume {
            name: snapshot.volume,
            path,
        })
    }

    fn export_snapshot(&self, name: &str) -> Result<VolumeSnapshot> {
        let path = self.volume_path(name);
        if !path.is_dir() {
            return Err(RuneError::VolumeNotFound(name.to_string()));
        }

        let (file, archive) = self.spool()?.into_parts();
        let encoder = GzEncoder::new(BufWriter::new(file), Compression::default());
        let mut builder = tar::Builder::new(encoder);
        builder.follow_symlinks(false);
        builder.append_dir_all(".", &path)?;
        builder.into_inner()?.finish()?.flush()?;

        let snapshot = VolumeSnapshot::from_archive(name, archive)?;
        debug!("Exported volume {} ({} bytes)", name, snapshot.size);
        Ok(snapshot)
    }

    fn delete(&self, name: &str) -> Result<()> {
        validate_name(name)?;
        let path = self.volume_path(name);
        if !path.exists() {
            return Err(RuneError::VolumeNotFound(name.to_string()));
        }

        std::fs::remove_dir_all(&path)?;
        info!("Deleted volume {}", name);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::{tempdir, TempPath};

    fn spooled(driver: &FilesystemVolumeDriver, bytes: &[u8]) -> TempPath {
        let mut file = driver.spool().unwrap();
        file.write_all(bytes).unwrap();
        file.into_temp_path()
    }

    fn entries(dir: PathBuf) -> usize {
        std::fs::read_dir(dir).unwrap().count()
    }

    #[test]
    fn test_create_and_list() {
        let temp = tempdir().unwrap();
        let driver = FilesystemVolumeDriver::new(temp.path().to_path_buf()).unwrap();

        driver.create_from_local("db").unwrap();
        driver.create_from_local("cache").unwrap();

        let names: Vec<String> = driver
            .list_volumes()
            .unwrap()
            .into_iter()
            .map(|v| v.name)
            .collect();
        assert_eq!(names, vec!["cache", "db"]);
        assert!(matches!(
            driver.create_from_local("db"),
            Err(RuneError::VolumeExists(_))
        ));
    }

    #[test]
    fn test_transfer_between_drivers() {
        let source_dir = tempdir().unwrap();
        let target_dir = tempdir().unwrap();
        let source = FilesystemVolumeDriver::new(source_dir.path().to_path_buf()).unwrap();
        let target = FilesystemVolumeDriver::new(target_dir.path().to_path_buf()).unwrap();

        let volume = source.create_from_local("db").unwrap();
        std::fs::create_dir_all(volume.path.join("base")).unwrap();
        std::fs::write(volume.path.join("base/table"), b"rows").unwrap();

        let snapshot = source.export_snapshot("db").unwrap();
        assert!(snapshot.checksum.starts_with("sha256:"));
        assert_eq!(snapshot.size, std::fs::metadata(&snapshot.archive).unwrap().len());
        assert_eq!(entries(source_dir.path().join(SPOOL_DIR)), 1);

        let received = target.create_from_transfer(snapshot).unwrap();
        assert_eq!(
            std::fs::read(received.path.join("base/table")).unwrap(),
            b"rows"
        );

        // The archive is removed once the snapshot is consumed
        assert_eq!(entries(source_dir.path().join(SPOOL_DIR)), 0);
    }

    #[test]
    fn test_corrupt_transfer_not_published() {
        let temp = tempdir().unwrap();
        let driver = FilesystemVolumeDriver::new(temp.path().to_path_buf()).unwrap();

        let mut mismatched =
            VolumeSnapshot::from_archive("db", spooled(&driver, b"not a tarball")).unwrap();
        mismatched.checksum = "sha256:0000".to_string();
        assert!(matches!(
            driver.create_from_transfer(mismatched),
            Err(RuneError::Transfer(_))
        ));

        let garbage = VolumeSnapshot::from_archive("db", spooled(&driver, b"not a tarball")).unwrap();
        assert!(driver.create_from_transfer(garbage).is_err());

        assert!(driver.list_volumes().unwrap().is_empty());
        assert_eq!(entries(temp.path().join(STAGING_DIR)), 0);
        assert_eq!(entries(temp.path().join(SPOOL_DIR)), 0);
    }

    #[test]
    fn test_delete() {
        let temp = tempdir().unwrap();
        let driver = FilesystemVolumeDriver::new(temp.path().to_path_buf()).unwrap();

        driver.create_from_local("db").unwrap();
        driver.delete("db").unwrap();
        assert!(driver.list_volumes().unwrap().is_empty());
        assert!(matches!(
            driver.delete("db"),
            Err(RuneError::VolumeNotFound(_))
        ));
    }
}
