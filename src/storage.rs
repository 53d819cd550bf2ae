use std::{
    collections::HashMap,
    fmt, fs,
    io::{self, Write},
    path::{Path, PathBuf},
    sync::{Arc, RwLock},
};

use thiserror::Error;

/// 儲存操作可能發生的錯誤類型。
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("IO error on {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: io::Error,
    },
    #[error("Key is invalid: {0}")]
    InvalidKey(String),
    #[error("Key not found: {0}")]
    NotFound(String),
    #[error("Lock poisoned")]
    LockPoisoned,
}

/// 儲存操作的結果類型，封裝 [`StorageError`]。
pub type Result<T> = std::result::Result<T, StorageError>;

/// 定義持久化所需的最小 API：把位元組寫到某個路徑，或從某個路徑讀回。
///
/// key 即為呼叫端提供的路徑字串，實作可以選擇直接對應到檔案系統或保存在記憶體中。
pub trait Storage: Send + Sync + fmt::Debug {
    /// 讀取指定 key 所對應檔案的內容。
    fn read_file(&self, key: &str) -> Result<Vec<u8>>;

    /// 將資料寫入指定 key 所對應的檔案中，必要時自動建立父目錄。
    fn write_file(&self, key: &str, value: &[u8]) -> Result<()>;

    /// 刪除指定 key 所對應的檔案；不存在時視為成功。
    fn remove(&self, key: &str) -> Result<()>;

    /// 檢查指定 key 是否存在於儲存系統中。
    fn exists(&self, key: &str) -> Result<bool>;

    /// 讀取檔案並以 UTF-8 字串回傳，去除前後空白。
    fn read_string(&self, key: &str) -> Result<String> {
        let data = self.read_file(key)?;
        String::from_utf8(data)
            .map(|s| s.trim().to_owned())
            .map_err(|_| StorageError::InvalidKey(format!("{} is not valid UTF-8", key)))
    }
}

fn verify_key(key: &str) -> Result<()> {
    if key.is_empty() {
        return Err(StorageError::InvalidKey("Empty key".to_string()));
    }
    if key.contains('\0') || key.contains('\n') || key.contains('\r') {
        return Err(StorageError::InvalidKey(format!(
            "Invalid characters in key: {}",
            key
        )));
    }
    if key.ends_with('/') {
        return Err(StorageError::InvalidKey(format!(
            "File key cannot end with '/': {}",
            key
        )));
    }
    Ok(())
}

/// 直接對應到檔案系統的儲存實作。
///
/// 可選擇設定根目錄，所有 key 會被視為相對於該目錄的路徑；未設定時 key 即為實際路徑。
/// 在 Unix 平台上新建立的檔案會套用 `mode`（預設 `0o600`，僅擁有者可讀寫）。
#[derive(Debug, Clone)]
pub struct FsStorage {
    root: Option<PathBuf>,
    mode: u32,
}

impl Default for FsStorage {
    fn default() -> Self {
        Self::new()
    }
}

impl FsStorage {
    /// 私密檔案的預設權限。
    pub const PRIVATE_MODE: u32 = 0o600;

    pub fn new() -> Self {
        Self {
            root: None,
            mode: Self::PRIVATE_MODE,
        }
    }

    /// 以指定目錄作為根目錄。
    pub fn rooted(root: impl Into<PathBuf>) -> Self {
        Self {
            root: Some(root.into()),
            mode: Self::PRIVATE_MODE,
        }
    }

    /// 設定新檔案的權限位元（僅 Unix 有效）。
    pub fn with_mode(mut self, mode: u32) -> Self {
        self.mode = mode;
        self
    }

    fn resolve(&self, key: &str) -> Result<PathBuf> {
        verify_key(key)?;
        let path = Path::new(key);
        match &self.root {
            Some(root) => {
                if path.is_absolute()
                    || path
                        .components()
                        .any(|c| matches!(c, std::path::Component::ParentDir))
                {
                    return Err(StorageError::InvalidKey(format!(
                        "Key escapes storage root: {}",
                        key
                    )));
                }
                Ok(root.join(path))
            }
            None => Ok(path.to_path_buf()),
        }
    }

    fn io_err(path: &Path) -> impl FnOnce(io::Error) -> StorageError + '_ {
        move |source| StorageError::Io {
            path: path.display().to_string(),
            source,
        }
    }

    fn open_for_write(&self, path: &Path) -> io::Result<fs::File> {
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            fs::OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(true)
                .mode(self.mode)
                .open(path)
        }
        #[cfg(not(unix))]
        {
            fs::OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(true)
                .open(path)
        }
    }
}

impl Storage for FsStorage {
    fn read_file(&self, key: &str) -> Result<Vec<u8>> {
        let path = self.resolve(key)?;
        match fs::read(&path) {
            Ok(data) => Ok(data),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                Err(StorageError::NotFound(key.to_string()))
            }
            Err(e) => Err(Self::io_err(&path)(e)),
        }
    }

    fn write_file(&self, key: &str, value: &[u8]) -> Result<()> {
        let path = self.resolve(key)?;
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(Self::io_err(parent))?;
        }
        let mut file = self.open_for_write(&path).map_err(Self::io_err(&path))?;
        file.write_all(value).map_err(Self::io_err(&path))?;
        file.sync_all().map_err(Self::io_err(&path))
    }

    fn remove(&self, key: &str) -> Result<()> {
        let path = self.resolve(key)?;
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Self::io_err(&path)(e)),
        }
    }

    fn exists(&self, key: &str) -> Result<bool> {
        let path = self.resolve(key)?;
        Ok(path.is_file())
    }
}

/// 基於記憶體的儲存實作，適合測試或不需落地的情境。
#[derive(Debug, Default, Clone)]
pub struct MemStorage {
    data: Arc<RwLock<HashMap<String, Vec<u8>>>>,
}

impl MemStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Storage for MemStorage {
    fn read_file(&self, key: &str) -> Result<Vec<u8>> {
        verify_key(key)?;
        self.data
            .read()
            .map_err(|_| StorageError::LockPoisoned)?
            .get(key)
            .cloned()
            .ok_or_else(|| StorageError::NotFound(key.to_string()))
    }

    fn write_file(&self, key: &str, value: &[u8]) -> Result<()> {
        verify_key(key)?;
        self.data
            .write()
            .map_err(|_| StorageError::LockPoisoned)?
            .insert(key.to_string(), value.to_vec());
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<()> {
        verify_key(key)?;
        self.data
            .write()
            .map_err(|_| StorageError::LockPoisoned)?
            .remove(key);
        Ok(())
    }

    fn exists(&self, key: &str) -> Result<bool> {
        verify_key(key)?;
        Ok(self
            .data
            .read()
            .map_err(|_| StorageError::LockPoisoned)?
            .contains_key(key))
    }
}
