//! 博客索引目录：每个博客一个 JSON 文件，`<name>.<kind>`。

use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use tempfile::NamedTempFile;
use thiserror::Error;
use tracing::{debug, info, warn};

use super::blog::{Blog, BlogKind, BlogUrlError};
use crate::base_system::context::Config;

#[derive(Debug, Error)]
pub enum IndexError {
    #[error("index io error at {path}: {source}")]
    Io { path: PathBuf, source: io::Error },
    #[error("index file {path} is not valid: {source}")]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },
    #[error(transparent)]
    Url(#[from] BlogUrlError),
    #[error("blog {0} already exists")]
    AlreadyExists(String),
    #[error("blog {0} not found")]
    NotFound(String),
}

fn io_err(path: &Path) -> impl FnOnce(io::Error) -> IndexError + '_ {
    move |source| IndexError::Io {
        path: path.to_path_buf(),
        source,
    }
}

#[derive(Debug, Clone)]
pub struct BlogIndex {
    dir: PathBuf,
}

impl BlogIndex {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(config.index_dir())
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path_of(&self, blog: &Blog) -> PathBuf {
        self.dir.join(blog.index_file_name())
    }

    /// 读取目录下全部博客；`_files` 数据库与无法解析的文件被跳过。
    pub fn load_all(&self) -> Result<Vec<Blog>, IndexError> {
        if !self.dir.exists() {
            return Ok(Vec::new());
        }
        let mut blogs = Vec::new();
        for entry in fs::read_dir(&self.dir).map_err(io_err(&self.dir))? {
            let path = entry.map_err(io_err(&self.dir))?.path();
            let Some(file_name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            if file_name.contains("_files") {
                continue;
            }
            let Some(ext) = path.extension().and_then(|e| e.to_str()) else {
                continue;
            };
            if BlogKind::from_extension(ext).is_none() {
                continue;
            }
            match self.load(&path) {
                Ok(blog) => blogs.push(blog),
                Err(e) => warn!(target: "library", error = %e, "跳过无法读取的索引文件"),
            }
        }
        blogs.sort_by(|a, b| a.name.cmp(&b.name));
        debug!(target: "library", count = blogs.len(), dir = %self.dir.display(), "索引加载完成");
        Ok(blogs)
    }

    pub fn load(&self, path: &Path) -> Result<Blog, IndexError> {
        let text = fs::read_to_string(path).map_err(io_err(path))?;
        serde_json::from_str(&text).map_err(|source| IndexError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// 先写临时文件再原子替换。
    pub fn save(&self, blog: &Blog) -> Result<PathBuf, IndexError> {
        fs::create_dir_all(&self.dir).map_err(io_err(&self.dir))?;
        let path = self.path_of(blog);
        let json = serde_json::to_vec_pretty(blog).map_err(|source| IndexError::Parse {
            path: path.clone(),
            source,
        })?;
        let mut tmp = NamedTempFile::new_in(&self.dir).map_err(io_err(&self.dir))?;
        tmp.write_all(&json).map_err(io_err(&path))?;
        tmp.persist(&path)
            .map_err(|e| IndexError::Io {
                path: path.clone(),
                source: e.error,
            })?;
        Ok(path)
    }

    pub fn contains(&self, blog: &Blog) -> bool {
        self.path_of(blog).exists()
    }

    /// 新增博客。同名同类型的条目已存在时拒绝。
    pub fn add_from_url(&self, url: &str, config: &Config) -> Result<Blog, IndexError> {
        let mut blog = Blog::from_url(url)?;
        if self.contains(&blog) {
            return Err(IndexError::AlreadyExists(blog.name));
        }
        blog.apply_defaults(config);
        self.save(&blog)?;
        info!(target: "library", blog = %blog.name, kind = %blog.kind, "已添加博客");
        Ok(blog)
    }

    /// 删除索引文件；`delete_files` 时连同下载目录一起删除。
    pub fn delete(
        &self,
        blog: &Blog,
        download_root: &Path,
        delete_files: bool,
    ) -> Result<(), IndexError> {
        if delete_files {
            let dir = blog.download_dir(download_root);
            if dir.exists() {
                fs::remove_dir_all(&dir).map_err(io_err(&dir))?;
            }
        }
        let path = self.path_of(blog);
        match fs::remove_file(&path) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(IndexError::NotFound(blog.name.clone()));
            }
            Err(e) => return Err(io_err(&path)(e)),
        }
        info!(target: "library", blog = %blog.name, files = delete_files, "已移除博客");
        Ok(())
    }
}
