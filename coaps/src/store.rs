//! File-backed firmware staging area

use std::{
    fs::{self, File, OpenOptions},
    io::{self, BufRead, BufReader, Read, Seek, SeekFrom, Write},
    path::{Path, PathBuf},
};

use crc::{Crc, Digest, CRC_32_ISO_HDLC};
use proto::{FirmwareStore, ImageInfo};
use tracing::{debug, info, warn};

static CRC32: Crc<u32> = Crc::<u32>::new(&CRC_32_ISO_HDLC);

const IMAGE: &str = "staging.bin";
const UPGRADE: &str = "upgrade";
const CONFIRMED: &str = "confirmed";
const MAX_HEADER: u64 = 64;

/// Stages images in a directory
///
/// The image version is its first line. Staging an upgrade writes the image's size and CRC-32 to
/// an `upgrade` marker for the boot-loader to pick up; confirming the running image creates a
/// `confirmed` marker.
pub struct FileStore {
    dir: PathBuf,
    file: Option<File>,
    digest: Option<Digest<'static, u32>>,
    written: u64,
    finished: Option<(u64, u32)>,
}

impl FileStore {
    /// Use `dir`, creating it if needed
    pub fn open(dir: impl Into<PathBuf>) -> io::Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Ok(Self {
            dir,
            file: None,
            digest: None,
            written: 0,
            finished: None,
        })
    }

    /// Path of the staged image
    pub fn image_path(&self) -> PathBuf {
        self.dir.join(IMAGE)
    }

    fn marker(&self, name: &str) -> PathBuf {
        self.dir.join(name)
    }
}

impl FirmwareStore for FileStore {
    fn erase(&mut self) -> io::Result<()> {
        remove_if_exists(&self.marker(UPGRADE))?;
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(true)
            .open(self.image_path())?;
        self.file = Some(file);
        self.digest = Some(CRC32.digest());
        self.written = 0;
        self.finished = None;
        debug!(dir = %self.dir.display(), "staging area erased");
        Ok(())
    }

    fn write(&mut self, data: &[u8]) -> io::Result<()> {
        let (file, digest) = match (self.file.as_mut(), self.digest.as_mut()) {
            (Some(file), Some(digest)) => (file, digest),
            _ => return Err(io::Error::new(io::ErrorKind::Other, "staging area not erased")),
        };
        file.write_all(data)?;
        digest.update(data);
        self.written += data.len() as u64;
        Ok(())
    }

    fn finish(&mut self) -> io::Result<ImageInfo> {
        let mut file = self
            .file
            .take()
            .ok_or_else(|| io::Error::new(io::ErrorKind::Other, "no image written"))?;
        file.sync_all()?;
        let crc = self.digest.take().map_or(0, |digest| digest.finalize());

        file.seek(SeekFrom::Start(0))?;
        let mut header = String::new();
        BufReader::new(file.take(MAX_HEADER)).read_line(&mut header)?;
        let version = header.trim_end().to_owned();
        self.finished = Some((self.written, crc));
        info!(%version, size = self.written, crc = format_args!("{crc:08x}"), "image written");
        Ok(ImageInfo {
            version,
            size: self.written,
        })
    }

    fn abort(&mut self) {
        self.file = None;
        self.digest = None;
        self.finished = None;
        for path in [self.marker(UPGRADE), self.image_path()] {
            if let Err(e) = remove_if_exists(&path) {
                warn!(path = %path.display(), "discarding image failed: {}", e);
            }
        }
    }

    fn request_upgrade(&mut self) -> io::Result<()> {
        let (size, crc) = self
            .finished
            .ok_or_else(|| io::Error::new(io::ErrorKind::Other, "no finished image"))?;
        fs::write(self.marker(UPGRADE), format!("{size} {crc:08x}\n"))
    }

    fn is_confirmed(&self) -> bool {
        self.marker(CONFIRMED).exists()
    }

    fn confirm(&mut self) -> io::Result<()> {
        fs::write(self.marker(CONFIRMED), b"")
    }
}

fn remove_if_exists(path: &Path) -> io::Result<()> {
    match fs::remove_file(path) {
        Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn staged_image_carries_crc() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = FileStore::open(dir.path()).unwrap();
        assert!(store.write(b"early").is_err());
        store.erase().unwrap();
        store.write(b"box-1.0.0\n").unwrap();
        store.write(&[0x5a; 100]).unwrap();
        let info = store.finish().unwrap();
        assert_eq!(info.version, "box-1.0.0");
        assert_eq!(info.size, 110);

        store.request_upgrade().unwrap();
        let mut all = b"box-1.0.0\n".to_vec();
        all.extend_from_slice(&[0x5a; 100]);
        let marker = fs::read_to_string(dir.path().join(UPGRADE)).unwrap();
        assert_eq!(marker, format!("110 {:08x}\n", CRC32.checksum(&all)));

        assert!(!store.is_confirmed());
        store.confirm().unwrap();
        assert!(store.is_confirmed());
    }

    #[test]
    fn abort_discards_image() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = FileStore::open(dir.path()).unwrap();
        store.erase().unwrap();
        store.write(b"partial").unwrap();
        store.abort();
        assert!(!store.image_path().exists());
        assert!(store.request_upgrade().is_err());
    }

    #[test]
    fn abort_withdraws_upgrade() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = FileStore::open(dir.path()).unwrap();
        store.erase().unwrap();
        store.write(b"box-1.1.0\n").unwrap();
        store.finish().unwrap();
        store.request_upgrade().unwrap();
        assert!(dir.path().join(UPGRADE).exists());

        store.abort();
        assert!(!dir.path().join(UPGRADE).exists());
        assert!(!store.image_path().exists());
    }
}
