//! # Spot Program Store
//!
//! 命名程序（有序命令列表）的持久化存储。
//!
//! - 程序名大小写不敏感（ASCII 折叠）：`write("Foo")` 之后 `write("foo")` 是更新而不是插入，
//!   更新时保留第一次写入的拼写
//! - 每个存储实例内部持有一把互斥锁，所有读写串行化
//!
//! 提供两种实现：
//!
//! - [`MemoryProgramStore`]：进程内存储（测试 / 无持久化部署）
//! - [`JsonFileProgramStore`]：单个 JSON 文件，每次修改后整体落盘

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use spot_protocol::Command;
use thiserror::Error;
use tracing::{debug, info};

/// 存储层错误类型
#[derive(Error, Debug)]
pub enum StoreError {
    /// 程序不存在
    #[error("Program not found: {0}")]
    NotFound(String),

    /// 程序名为空
    #[error("Program name must not be empty")]
    EmptyName,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// 文件内容无法解析
    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

/// 一个命名程序
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Program {
    pub name: String,
    #[serde(rename = "program")]
    pub commands: Vec<Command>,
}

/// 程序存储接口
pub trait ProgramStore: Send + Sync {
    /// 写入程序：同名（大小写不敏感）存在则更新，否则插入
    fn write(&self, name: &str, commands: Vec<Command>) -> Result<(), StoreError>;

    /// 删除程序，返回是否存在
    fn delete(&self, name: &str) -> Result<bool, StoreError>;

    /// 读取程序，不存在时返回 [`StoreError::NotFound`]
    fn get(&self, name: &str) -> Result<Program, StoreError>;

    /// 按插入顺序返回全部程序
    fn get_all(&self) -> Result<Vec<Program>, StoreError>;

    fn exists(&self, name: &str) -> Result<bool, StoreError> {
        match self.get(name) {
            Ok(_) => Ok(true),
            Err(StoreError::NotFound(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }
}

/// 两种实现共用的程序表
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
#[serde(transparent)]
struct ProgramTable {
    programs: Vec<Program>,
}

impl ProgramTable {
    fn position(&self, name: &str) -> Option<usize> {
        self.programs
            .iter()
            .position(|p| p.name.eq_ignore_ascii_case(name))
    }

    fn write(&mut self, name: &str, commands: Vec<Command>) -> Result<(), StoreError> {
        if name.trim().is_empty() {
            return Err(StoreError::EmptyName);
        }
        match self.position(name) {
            Some(index) => {
                debug!("Updating program '{}'", self.programs[index].name);
                self.programs[index].commands = commands;
            },
            None => {
                debug!("Inserting program '{}'", name);
                self.programs.push(Program {
                    name: name.to_string(),
                    commands,
                });
            },
        }
        Ok(())
    }

    fn delete(&mut self, name: &str) -> bool {
        match self.position(name) {
            Some(index) => {
                self.programs.remove(index);
                true
            },
            None => false,
        }
    }

    fn get(&self, name: &str) -> Result<Program, StoreError> {
        self.position(name)
            .map(|index| self.programs[index].clone())
            .ok_or_else(|| StoreError::NotFound(name.to_string()))
    }
}

/// 进程内程序存储
#[derive(Debug, Default)]
pub struct MemoryProgramStore {
    table: Mutex<ProgramTable>,
}

impl MemoryProgramStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ProgramStore for MemoryProgramStore {
    fn write(&self, name: &str, commands: Vec<Command>) -> Result<(), StoreError> {
        self.table.lock().write(name, commands)
    }

    fn delete(&self, name: &str) -> Result<bool, StoreError> {
        Ok(self.table.lock().delete(name))
    }

    fn get(&self, name: &str) -> Result<Program, StoreError> {
        self.table.lock().get(name)
    }

    fn get_all(&self) -> Result<Vec<Program>, StoreError> {
        Ok(self.table.lock().programs.clone())
    }
}

/// JSON 文件程序存储
///
/// 打开时整体读入内存；每次修改后先写临时文件再重命名，避免写到一半的文件。
#[derive(Debug)]
pub struct JsonFileProgramStore {
    path: PathBuf,
    table: Mutex<ProgramTable>,
}

impl JsonFileProgramStore {
    /// 打开（或创建）程序文件
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref().to_path_buf();
        let table = if path.exists() {
            let content = fs::read_to_string(&path)?;
            if content.trim().is_empty() {
                ProgramTable::default()
            } else {
                serde_json::from_str(&content)?
            }
        } else {
            ProgramTable::default()
        };
        info!(
            "Opened program store {} ({} programs)",
            path.display(),
            table.programs.len()
        );
        Ok(Self {
            path,
            table: Mutex::new(table),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn persist(&self, table: &ProgramTable) -> Result<(), StoreError> {
        if let Some(parent) = self.path.parent()
            && !parent.as_os_str().is_empty()
        {
            fs::create_dir_all(parent)?;
        }
        let content = serde_json::to_string_pretty(table)?;
        let tmp_path = self.path.with_extension("json.tmp");
        {
            let mut file = fs::File::create(&tmp_path)?;
            file.write_all(content.as_bytes())?;
            file.sync_all()?;
        }
        fs::rename(&tmp_path, &self.path)?;
        Ok(())
    }

    /// 在锁内修改程序表；落盘失败时回滚内存中的修改
    fn modify<T>(
        &self,
        f: impl FnOnce(&mut ProgramTable) -> Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        let mut table = self.table.lock();
        let snapshot = table.clone();
        let result = f(&mut *table)?;
        if let Err(e) = self.persist(&*table) {
            *table = snapshot;
            return Err(e);
        }
        Ok(result)
    }
}

impl ProgramStore for JsonFileProgramStore {
    fn write(&self, name: &str, commands: Vec<Command>) -> Result<(), StoreError> {
        self.modify(|table| table.write(name, commands))
    }

    fn delete(&self, name: &str) -> Result<bool, StoreError> {
        self.modify(|table| Ok(table.delete(name)))
    }

    fn get(&self, name: &str) -> Result<Program, StoreError> {
        self.table.lock().get(name)
    }

    fn get_all(&self) -> Result<Vec<Program>, StoreError> {
        Ok(self.table.lock().programs.clone())
    }
}
