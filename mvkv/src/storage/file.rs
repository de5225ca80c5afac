//! The locked file backend.
//!
//! All chunk and header I/O goes through this layer: positioned reads and
//! writes over a single advisory-locked file, size tracking, the free-space
//! interval list, and the optional transparent block cipher. Writes under a
//! cipher must be block-aligned; reads of unaligned spans are widened to
//! block boundaries internally.

use std::fs::File;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use fs4::FileExt;

use crate::error::{CResult, Error};
use crate::storage::crypt::BlockCipher;
use crate::storage::freelist::FreeSpace;
use crate::storage::BLOCK_SIZE;

pub struct FileStore {
    path: PathBuf,
    file: Mutex<File>,
    read_only: bool,
    size: AtomicU64,
    free: Mutex<FreeSpace>,
    cipher: Option<Box<dyn BlockCipher>>,
    read_count: AtomicU64,
    write_count: AtomicU64,
}

impl std::fmt::Display for FileStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.path.display())
    }
}

impl FileStore {
    /// Opens or creates the store file and takes the advisory lock:
    /// exclusive for writable opens, shared for read-only ones.
    pub fn open(
        path: &Path,
        read_only: bool,
        cipher: Option<Box<dyn BlockCipher>>,
    ) -> CResult<Self> {
        if let Some(dir) = path.parent() {
            if !read_only && !dir.as_os_str().is_empty() {
                std::fs::create_dir_all(dir).map_err(|err| {
                    Error::Internal(format!("{}: {:?}", err, dir.to_str()))
                })?;
            }
        }

        let file = std::fs::OpenOptions::new()
            .read(true)
            .write(!read_only)
            .create(!read_only)
            .open(path)?;

        if read_only {
            file.try_lock_shared()?;
        } else {
            file.try_lock_exclusive()?;
        }

        let size = file.metadata()?.len();
        Ok(Self {
            path: path.to_path_buf(),
            file: Mutex::new(file),
            read_only,
            size: AtomicU64::new(size),
            free: Mutex::new(FreeSpace::new()),
            cipher,
            read_count: AtomicU64::new(0),
            write_count: AtomicU64::new(0),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    pub fn size(&self) -> u64 {
        self.size.load(Ordering::Acquire)
    }

    pub fn read_count(&self) -> u64 {
        self.read_count.load(Ordering::Relaxed)
    }

    pub fn write_count(&self) -> u64 {
        self.write_count.load(Ordering::Relaxed)
    }

    /// Reads exactly `len` bytes at `pos`.
    pub fn read_fully(&self, pos: u64, len: usize) -> CResult<Vec<u8>> {
        if pos + len as u64 > self.size() {
            return Err(Error::FileCorrupt(format!(
                "read of {} bytes at {} past end of file ({})",
                len,
                pos,
                self.size()
            )));
        }
        self.read_count.fetch_add(1, Ordering::Relaxed);
        match &self.cipher {
            None => {
                let mut buf = vec![0u8; len];
                let mut file = self.file.lock().unwrap();
                file.seek(SeekFrom::Start(pos))?;
                file.read_exact(&mut buf)
                    .map_err(|e| Error::FileCorrupt(format!("short read at {}: {}", pos, e)))?;
                Ok(buf)
            }
            Some(cipher) => {
                // widen to block boundaries, decrypt, slice out the span
                let astart = pos / BLOCK_SIZE * BLOCK_SIZE;
                let aend = (pos + len as u64).div_ceil(BLOCK_SIZE) * BLOCK_SIZE;
                let aend = aend.min(self.size());
                let mut buf = vec![0u8; (aend - astart) as usize];
                {
                    let mut file = self.file.lock().unwrap();
                    file.seek(SeekFrom::Start(astart))?;
                    file.read_exact(&mut buf).map_err(|e| {
                        Error::FileCorrupt(format!("short read at {}: {}", astart, e))
                    })?;
                }
                for (i, block) in buf.chunks_exact_mut(BLOCK_SIZE as usize).enumerate() {
                    cipher.decrypt_block(astart / BLOCK_SIZE + i as u64, block);
                }
                let from = (pos - astart) as usize;
                if from + len > buf.len() {
                    return Err(Error::FileCorrupt(format!(
                        "read of {} bytes at {} past end of file",
                        len, pos
                    )));
                }
                Ok(buf[from..from + len].to_vec())
            }
        }
    }

    /// Writes `buf` at `pos`, extending the file as needed. Under a cipher
    /// both `pos` and the length must be multiples of the block size.
    pub fn write_fully(&self, pos: u64, buf: &[u8]) -> CResult<()> {
        if self.read_only {
            return Err(Error::ReadOnly(format!("{}", self.path.display())));
        }
        self.write_count.fetch_add(1, Ordering::Relaxed);
        let data: Vec<u8>;
        let out: &[u8] = match &self.cipher {
            None => buf,
            Some(cipher) => {
                if pos % BLOCK_SIZE != 0 || buf.len() as u64 % BLOCK_SIZE != 0 {
                    return Err(Error::Internal(format!(
                        "unaligned encrypted write at {} len {}",
                        pos,
                        buf.len()
                    )));
                }
                let mut enc = buf.to_vec();
                for (i, block) in enc.chunks_exact_mut(BLOCK_SIZE as usize).enumerate() {
                    cipher.encrypt_block(pos / BLOCK_SIZE + i as u64, block);
                }
                data = enc;
                &data
            }
        };
        {
            let mut file = self.file.lock().unwrap();
            file.seek(SeekFrom::Start(pos))?;
            file.write_all(out)?;
        }
        let end = pos + buf.len() as u64;
        self.size.fetch_max(end, Ordering::AcqRel);
        Ok(())
    }

    pub fn truncate(&self, len: u64) -> CResult<()> {
        if self.read_only {
            return Err(Error::ReadOnly(format!("{}", self.path.display())));
        }
        let file = self.file.lock().unwrap();
        file.set_len(len)?;
        self.size.store(len, Ordering::Release);
        Ok(())
    }

    pub fn sync(&self) -> CResult<()> {
        let file = self.file.lock().unwrap();
        Ok(file.sync_all()?)
    }

    /// Takes `len` bytes from the first fitting free interval.
    pub fn allocate(&self, len: u64) -> u64 {
        self.free.lock().unwrap().allocate(len)
    }

    pub fn mark_used(&self, pos: u64, len: u64) {
        self.free.lock().unwrap().mark_used(pos, len);
    }

    pub fn free(&self, pos: u64, len: u64) {
        self.free.lock().unwrap().free(pos, len);
    }

    pub fn first_free(&self) -> u64 {
        self.free.lock().unwrap().first_free()
    }

    /// Everything at or past this offset is free.
    pub fn free_tail_start(&self) -> u64 {
        self.free.lock().unwrap().tail_start()
    }

    pub fn fill_rate(&self) -> u8 {
        self.free.lock().unwrap().fill_rate(self.size())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::crypt::XteaCipher;

    fn temp_path(name: &str) -> PathBuf {
        tempdir::TempDir::new("mvkv").unwrap().into_path().join(name)
    }

    #[test]
    fn read_write_round_trip() -> CResult<()> {
        let path = temp_path("plain");
        let fs = FileStore::open(&path, false, None)?;
        fs.write_fully(0, &[1, 2, 3, 4])?;
        fs.write_fully(8192, &[9; 16])?;
        assert_eq!(fs.read_fully(0, 4)?, vec![1, 2, 3, 4]);
        assert_eq!(fs.read_fully(8192 + 4, 4)?, vec![9; 4]);
        assert_eq!(fs.size(), 8192 + 16);
        assert!(fs.read_count() >= 2);
        assert!(fs.write_count() >= 2);
        Ok(())
    }

    #[test]
    fn lock_is_exclusive() -> CResult<()> {
        let path = temp_path("locked");
        let fs = FileStore::open(&path, false, None)?;
        assert!(FileStore::open(&path, false, None).is_err());
        drop(fs);
        assert!(FileStore::open(&path, false, None).is_ok());
        Ok(())
    }

    #[test]
    fn read_past_end() -> CResult<()> {
        let path = temp_path("short");
        let fs = FileStore::open(&path, false, None)?;
        fs.write_fully(0, &[0; 16])?;
        assert!(fs.read_fully(8, 16).is_err());
        Ok(())
    }

    #[test]
    fn encrypted_round_trip() -> CResult<()> {
        let path = temp_path("enc");
        let block: Vec<u8> = (0..BLOCK_SIZE as usize).map(|i| (i % 251) as u8).collect();
        {
            let cipher = Box::new(XteaCipher::from_password(&mut b"007".to_vec()));
            let fs = FileStore::open(&path, false, Some(cipher))?;
            fs.write_fully(0, &block)?;
            fs.write_fully(BLOCK_SIZE, &block)?;
        }
        // on-disk bytes differ from the plaintext
        let raw = std::fs::read(&path).unwrap();
        assert_ne!(&raw[..BLOCK_SIZE as usize], &block[..]);

        let cipher = Box::new(XteaCipher::from_password(&mut b"007".to_vec()));
        let fs = FileStore::open(&path, false, Some(cipher))?;
        assert_eq!(fs.read_fully(0, BLOCK_SIZE as usize)?, block);
        // unaligned read spans a block boundary
        assert_eq!(fs.read_fully(BLOCK_SIZE - 8, 16)?, {
            let mut v = block[block.len() - 8..].to_vec();
            v.extend_from_slice(&block[..8]);
            v
        });

        // the wrong key produces different plaintext
        drop(fs);
        let cipher = Box::new(XteaCipher::from_password(&mut b"008".to_vec()));
        let fs = FileStore::open(&path, false, Some(cipher))?;
        assert_ne!(fs.read_fully(0, BLOCK_SIZE as usize)?, block);
        Ok(())
    }

    #[test]
    fn truncate_shrinks() -> CResult<()> {
        let path = temp_path("trunc");
        let fs = FileStore::open(&path, false, None)?;
        fs.write_fully(0, &[7; 8192])?;
        fs.truncate(4096)?;
        assert_eq!(fs.size(), 4096);
        assert!(fs.read_fully(4096, 1).is_err());
        Ok(())
    }
}
