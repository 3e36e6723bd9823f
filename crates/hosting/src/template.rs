/// 系统盘模板缓存
///
/// 模板按文件名缓存在本地目录中，旁边的 `<文件名>.info` 记录 ETag、长度和压缩标记。
/// 只有缓存文件的实际长度与记录的长度一致时才认为缓存有效，否则重新下载。
/// 下载先写入临时文件，完成后再依次替换镜像文件和 `.info`，中断的下载不会留下
/// 可信的缓存记录。
///
/// 多个进程共享同一缓存目录时没有文件锁，`.info` 以最后写入者为准。

use common::models::constants::TEMPLATE_INFO_EXTENSION;
use common::utils::format_bytes;
use common::{Error, Result};
use flate2::read::GzDecoder;
use futures_util::StreamExt;
use reqwest::header::{HeaderName, CONTENT_ENCODING, ETAG};
use serde::{Deserialize, Serialize};
use std::io::Write;
use std::path::{Path, PathBuf};
use tempfile::TempPath;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

/// 模板缓存的元数据（`.info` 文件）
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct DriveTemplateInfo {
    #[serde(rename = "ETag")]
    pub etag: Option<String>,
    pub length: i64,
    pub compressed: bool,
}

/// 已缓存的模板
#[derive(Debug, Clone)]
pub struct CachedTemplate {
    pub path: PathBuf,
    pub info: DriveTemplateInfo,
    /// 本次是否发生了下载
    pub downloaded: bool,
}

/// 可以直接导入的（已解压）模板文件
///
/// 解压产生的临时文件在离开作用域时删除。
#[derive(Debug)]
pub struct PreparedTemplate {
    path: PathBuf,
    _staging: Option<TempPath>,
}

impl PreparedTemplate {
    pub fn path(&self) -> &Path {
        &self.path
    }
}

pub struct TemplateCache {
    directory: PathBuf,
    client: reqwest::Client,
}

impl TemplateCache {
    pub fn new(directory: impl Into<PathBuf>) -> Self {
        Self {
            directory: directory.into(),
            client: reqwest::Client::new(),
        }
    }

    pub fn with_client(mut self, client: reqwest::Client) -> Self {
        self.client = client;
        self
    }

    pub fn directory(&self) -> &Path {
        &self.directory
    }

    /// 模板的本地缓存路径（按 URI 中的文件名）
    pub fn cache_path(&self, uri: &str) -> Result<PathBuf> {
        let url = reqwest::Url::parse(uri)
            .map_err(|e| Error::InvalidArgument(format!("无效的模板地址 '{}': {}", uri, e)))?;

        let file_name = url
            .path_segments()
            .and_then(|mut segments| segments.next_back())
            .filter(|name| !name.is_empty())
            .ok_or_else(|| Error::InvalidArgument(format!("模板地址中没有文件名: {}", uri)))?;

        Ok(self.directory.join(file_name))
    }

    /// `.info` 文件路径
    pub fn info_path(path: &Path) -> PathBuf {
        let mut name = path.as_os_str().to_owned();
        name.push(".");
        name.push(TEMPLATE_INFO_EXTENSION);
        PathBuf::from(name)
    }

    /// 读取有效的缓存记录；记录缺失、损坏或长度不符时返回 `None`
    pub async fn load_valid_info(path: &Path) -> Result<Option<DriveTemplateInfo>> {
        let info_path = Self::info_path(path);

        let text = match tokio::fs::read_to_string(&info_path).await {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        let info: DriveTemplateInfo = match serde_json::from_str(&text) {
            Ok(info) => info,
            Err(e) => {
                warn!("⚠️ 模板缓存记录损坏 {}: {}", info_path.display(), e);
                return Ok(None);
            }
        };

        let actual = match tokio::fs::metadata(path).await {
            Ok(metadata) => metadata.len() as i64,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        if actual != info.length {
            warn!(
                "⚠️ 模板缓存长度不符 {} (记录 {}, 实际 {})，重新下载",
                path.display(),
                info.length,
                actual
            );
            return Ok(None);
        }

        Ok(Some(info))
    }

    /// 获取模板：缓存有效时直接使用，否则下载
    pub async fn acquire(&self, uri: &str) -> Result<CachedTemplate> {
        let path = self.cache_path(uri)?;

        if let Some(info) = Self::load_valid_info(&path).await? {
            info!("📦 使用已缓存的模板: {}", path.display());
            return Ok(CachedTemplate {
                path,
                info,
                downloaded: false,
            });
        }

        tokio::fs::create_dir_all(&self.directory).await?;
        let info = self.download(uri, &path).await?;

        Ok(CachedTemplate {
            path,
            info,
            downloaded: true,
        })
    }

    async fn download(&self, uri: &str, path: &Path) -> Result<DriveTemplateInfo> {
        info!("⬇️ 下载模板: {}", uri);

        let response = self
            .client
            .get(uri)
            .send()
            .await
            .map_err(|e| Error::Download(format!("请求 {} 失败: {}", uri, e)))?;

        if !response.status().is_success() {
            return Err(Error::Download(format!("下载 {} 失败: HTTP {}", uri, response.status())));
        }

        let header = |name: HeaderName| {
            response
                .headers()
                .get(name)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string)
        };
        let etag = header(ETAG);
        let encoding = header(CONTENT_ENCODING);
        let expected = response.content_length();

        let compressed = encoding.is_some_and(|e| e.to_ascii_lowercase().contains("gzip"))
            || path.extension().is_some_and(|ext| ext == "gz");

        let staging = tempfile::Builder::new()
            .prefix(".download-")
            .tempfile_in(&self.directory)?;
        let (file, staging_path) = staging.into_parts();
        let mut file = tokio::fs::File::from_std(file);

        let mut length: u64 = 0;
        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| Error::Download(format!("下载 {} 中断: {}", uri, e)))?;
            file.write_all(&chunk).await?;
            length += chunk.len() as u64;
        }
        file.flush().await?;
        drop(file);

        if let Some(expected) = expected {
            if expected != length {
                return Err(Error::Download(format!(
                    "下载 {} 不完整: 期望 {} 字节, 实际 {} 字节",
                    uri, expected, length
                )));
            }
        }

        let info = DriveTemplateInfo {
            etag,
            length: length as i64,
            compressed,
        };

        // 先删除旧记录，再替换镜像，最后写入新记录
        let info_path = Self::info_path(path);
        match tokio::fs::remove_file(&info_path).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }

        staging_path.persist(path).map_err(|e| Error::Io(e.error))?;
        self.write_info(&info_path, &info)?;

        info!("✅ 模板下载完成: {} ({})", path.display(), format_bytes(length));
        Ok(info)
    }

    /// 原子写入 `.info`
    fn write_info(&self, info_path: &Path, info: &DriveTemplateInfo) -> Result<()> {
        let mut staging = tempfile::Builder::new()
            .prefix(".info-")
            .tempfile_in(&self.directory)?;
        staging.write_all(serde_json::to_string(info)?.as_bytes())?;
        staging.flush()?;
        staging.persist(info_path).map_err(|e| Error::Io(e.error))?;
        Ok(())
    }

    /// 准备可导入的模板文件，压缩的模板解压到临时文件
    pub async fn prepare(&self, template: &CachedTemplate) -> Result<PreparedTemplate> {
        if !template.info.compressed {
            return Ok(PreparedTemplate {
                path: template.path.clone(),
                _staging: None,
            });
        }

        info!("🗜️ 解压模板: {}", template.path.display());
        let source = template.path.clone();
        let directory = self.directory.clone();

        let staging = tokio::task::spawn_blocking(move || -> Result<TempPath> {
            let input = std::fs::File::open(&source)?;
            let mut decoder = GzDecoder::new(std::io::BufReader::new(input));
            let mut output = tempfile::Builder::new()
                .prefix(".unpacked-")
                .tempfile_in(&directory)?;

            let written = std::io::copy(&mut decoder, &mut output)
                .map_err(|e| Error::Storage(format!("解压模板 {} 失败: {}", source.display(), e)))?;
            output.flush()?;
            debug!("解压后大小: {}", format_bytes(written));

            Ok(output.into_temp_path())
        })
        .await
        .map_err(|e| Error::Internal(format!("解压任务异常终止: {}", e)))??;

        Ok(PreparedTemplate {
            path: staging.to_path_buf(),
            _staging: Some(staging),
        })
    }
}
