//! 单例文件锁
//!
//! 同一时刻只允许一个服务端进程持有机器人会话

use fs4::fs_std::FileExt;
use std::fs::{File, OpenOptions};
use std::io::{self, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

/// 单例文件锁
///
/// 进程崩溃时操作系统会自动释放锁。
pub struct SingletonLock {
    file: File,
    path: PathBuf,
}

impl SingletonLock {
    /// 尝试获取单例锁（非阻塞）
    ///
    /// 锁已被其他进程持有时返回 `AlreadyExists`。
    pub fn try_lock(lock_path: impl AsRef<Path>) -> io::Result<Self> {
        let path = lock_path.as_ref();
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)?;
        }

        // 拿到锁之前不能截断
        let mut file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .read(true)
            .open(path)?;

        if !file.try_lock_exclusive()? {
            return Err(io::Error::new(
                io::ErrorKind::AlreadyExists,
                "spot-server is already running (locked)",
            ));
        }

        file.set_len(0)?;
        file.seek(SeekFrom::Start(0))?;
        writeln!(&file, "{}", std::process::id())?;
        file.sync_all()?;

        Ok(Self {
            file,
            path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for SingletonLock {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.file);
    }
}
