/// 工具函数集合

use std::future::Future;
use std::time::Duration;

use tracing::warn;
use uuid::Uuid;

use crate::{Error, Result};

/// 生成唯一 ID
pub fn generate_id() -> String {
    Uuid::new_v4().to_string()
}

/// 格式化字节大小
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: &[&str] = &["B", "KB", "MB", "GB", "TB", "PB"];
    let mut size = bytes as f64;
    let mut unit_index = 0;

    while size >= 1024.0 && unit_index < UNITS.len() - 1 {
        size /= 1024.0;
        unit_index += 1;
    }

    format!("{:.2} {}", size, UNITS[unit_index])
}

/// 解析容量字符串，例如 `4GiB`、`512MB`、`64G`、`1073741824`
///
/// 统一按 1024 进制处理，`GB` 与 `GiB` 含义相同。
pub fn parse_size(input: &str) -> Result<u64> {
    let trimmed = input.trim();
    let split = trimmed
        .find(|c: char| !c.is_ascii_digit() && c != '.')
        .unwrap_or(trimmed.len());
    let (number, unit) = trimmed.split_at(split);

    let value: f64 = number
        .parse()
        .map_err(|_| Error::InvalidArgument(format!("无效的容量: {}", input)))?;

    let multiplier: u64 = match unit.trim().to_ascii_uppercase().as_str() {
        "" | "B" => 1,
        "K" | "KB" | "KIB" => 1 << 10,
        "M" | "MB" | "MIB" => 1 << 20,
        "G" | "GB" | "GIB" => 1 << 30,
        "T" | "TB" | "TIB" => 1 << 40,
        other => {
            return Err(Error::InvalidArgument(format!(
                "无效的容量单位 '{}': {}",
                other, input
            )))
        }
    };

    if value < 0.0 {
        return Err(Error::InvalidArgument(format!("容量不能为负数: {}", input)));
    }

    Ok((value * multiplier as f64).round() as u64)
}

/// 验证 MAC 地址格式
pub fn validate_mac_address(mac: &str) -> bool {
    let parts: Vec<&str> = mac.split(':').collect();
    if parts.len() != 6 {
        return false;
    }

    parts.iter().all(|part| {
        part.len() == 2 && part.chars().all(|c| c.is_ascii_hexdigit())
    })
}

/// 验证 DNS 标签（节点名、集群名）
pub fn validate_dns_label(name: &str) -> bool {
    !name.is_empty()
        && name.len() <= 63
        && !name.starts_with('-')
        && !name.ends_with('-')
        && name
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
}

/// 以固定间隔重试异步操作
///
/// 只有瞬时错误（见 [`Error::is_transient`]）会被重试，其余错误直接返回。
pub async fn retry_fixed<T, F, Fut>(
    operation: &str,
    attempts: usize,
    delay: Duration,
    mut f: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let attempts = attempts.max(1);
    let mut attempt = 1;

    loop {
        match f().await {
            Ok(value) => return Ok(value),
            Err(e) if attempt < attempts && e.is_transient() => {
                warn!("⚠️ {} 失败 (第 {}/{} 次): {}", operation, attempt, attempts, e);
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_generate_id() {
        let id1 = generate_id();
        let id2 = generate_id();
        assert_ne!(id1, id2);
        assert_eq!(id1.len(), 36); // UUID v4 格式
    }

    #[test]
    fn test_format_bytes() {
        assert_eq!(format_bytes(0), "0.00 B");
        assert_eq!(format_bytes(1024), "1.00 KB");
        assert_eq!(format_bytes(1048576), "1.00 MB");
        assert_eq!(format_bytes(1073741824), "1.00 GB");
    }

    #[test]
    fn test_parse_size() {
        assert_eq!(parse_size("1024").unwrap(), 1024);
        assert_eq!(parse_size("4GiB").unwrap(), 4 * 1024 * 1024 * 1024);
        assert_eq!(parse_size("4GB").unwrap(), 4 * 1024 * 1024 * 1024);
        assert_eq!(parse_size("512 MiB").unwrap(), 512 * 1024 * 1024);
        assert_eq!(parse_size("1.5G").unwrap(), 3 * 512 * 1024 * 1024);
        assert!(parse_size("ten").is_err());
        assert!(parse_size("4XB").is_err());
    }

    #[test]
    fn test_validate_mac_address() {
        assert!(validate_mac_address("52:54:00:12:34:56"));
        assert!(validate_mac_address("00:11:22:33:44:55"));
        assert!(!validate_mac_address("52:54:00:12:34"));
        assert!(!validate_mac_address("52:54:00:12:34:5g"));
        assert!(!validate_mac_address("invalid"));
    }

    #[test]
    fn test_validate_dns_label() {
        assert!(validate_dns_label("master-0"));
        assert!(validate_dns_label("worker1"));
        assert!(!validate_dns_label("Master"));
        assert!(!validate_dns_label("-worker"));
        assert!(!validate_dns_label(""));
        assert!(!validate_dns_label("node_1"));
    }

    #[tokio::test]
    async fn test_retry_fixed_retries_transient_errors() {
        let calls = AtomicUsize::new(0);
        let result = retry_fixed("resize", 3, Duration::from_millis(1), || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err(Error::Remote("connection reset".to_string()))
                } else {
                    Ok(n)
                }
            }
        })
        .await
        .unwrap();

        assert_eq!(result, 2);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_retry_fixed_stops_on_permanent_error() {
        let calls = AtomicUsize::new(0);
        let result: Result<()> = retry_fixed("resize", 5, Duration::from_millis(1), || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(Error::Validation("bad".to_string())) }
        })
        .await;

        assert!(matches!(result, Err(Error::Validation(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_retry_fixed_gives_up_after_attempts() {
        let calls = AtomicUsize::new(0);
        let result: Result<()> = retry_fixed("resize", 3, Duration::from_millis(1), || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(Error::Timeout("slow".to_string())) }
        })
        .await;

        assert!(matches!(result, Err(Error::Timeout(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }
}
