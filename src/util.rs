//! 提供工具函数：文件名推导、本地落盘任务与默认请求头。

use bytes::Bytes;
use faststr::FastStr;
use log::{debug, error, info};
use regex::bytes::Regex;
use tokio::fs::OpenOptions;
use tokio::io::AsyncWriteExt;
use tokio::spawn;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// 默认 User-Agent，源请求与未显式配置请求头的上传请求共用。
pub(crate) const DEFAULT_USER_AGENT: &str =
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/110.0.0.0 Safari/537.36";

/// 本地落盘任务的信道容量。
const WRITER_QUEUE_CAPACITY: usize = 128;

/// 从 Content-Disposition 头里提取文件名。
///
/// 头的原始字节可能是 Latin-1，因此直接在字节层面匹配；
/// 提取结果再经由旧式解码管线还原成 UTF-8。
pub(crate) fn extract_file_name(disposition: &[u8]) -> Option<FastStr> {
    let re = Regex::new(r#"(?i-u)filename\*?=(?:UTF-8|ISO-8859-2)?['"]?([^'";\n]+)"#).ok()?;
    let captured = re.captures(disposition)?.get(1)?.as_bytes();
    Some(legacy_percent_decode(captured))
}

/// 旧式解码管线：先做百分号解码，再把得到的 Latin-1 字节序列按 UTF-8 重新解释。
/// 解码出的字节不是合法 UTF-8 时退回 Latin-1 读法。
pub(crate) fn legacy_percent_decode(raw: &[u8]) -> FastStr {
    let decoded = urlencoding::decode_binary(raw);
    match std::str::from_utf8(&decoded) {
        Ok(text) => FastStr::new(text),
        Err(_) => decoded.iter().map(|&b| b as char).collect::<String>().into(),
    }
}

/// 取下载地址路径部分的最后一段作为文件名兜底。
pub(crate) fn file_name_from_url(url: &str) -> FastStr {
    reqwest::Url::parse(url)
        .ok()
        .and_then(|u| {
            u.path_segments()
                .and_then(|segments| segments.filter(|s| !s.is_empty()).last().map(FastStr::new))
        })
        .unwrap_or_default()
}

/// 创建并运行本地落盘任务。
///
/// 任务从信道按源顺序接收数据块并顺序写入目标文件；
/// 信道关闭后刷新文件并返回实际写入的字节数。
/// 打开或写入失败不会波及转存本身，任务会继续排空信道，
/// 只把已成功写入的字节数报告出去。
pub(crate) fn local_writer_task(path: FastStr) -> (mpsc::Sender<Bytes>, JoinHandle<u64>) {
    let (tx, mut rx) = mpsc::channel::<Bytes>(WRITER_QUEUE_CAPACITY);

    let handle = spawn(async move {
        let mut file = match OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&*path)
            .await
        {
            Ok(file) => file,
            Err(e) => {
                error!("[LocalWriter] 打开文件 {path} 失败: {e}");
                // 排空信道，避免生产者被堵死
                while rx.recv().await.is_some() {}
                return 0;
            }
        };
        info!("[LocalWriter] 进入主写入循环: {path}");

        let mut written: u64 = 0;
        while let Some(data) = rx.recv().await {
            if let Err(e) = file.write_all(&data).await {
                error!("[LocalWriter] 写入文件失败: {e}");
                while rx.recv().await.is_some() {}
                break;
            }
            written += data.len() as u64;
        }

        if let Err(e) = file.flush().await {
            error!("[LocalWriter] 刷新文件失败: {e}");
        }
        debug!("[LocalWriter] 写入完成，共 {written} 字节。");
        written
    });

    (tx, handle)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extract_quoted_filename() {
        let value = b"attachment; filename=\"report.zip\"";
        assert_eq!(extract_file_name(value).unwrap(), "report.zip");
    }

    #[test]
    fn test_extract_bare_filename() {
        let value = b"attachment; filename=report.zip";
        assert_eq!(extract_file_name(value).unwrap(), "report.zip");
    }

    #[test]
    fn test_extract_percent_encoded_filename() {
        let value = b"attachment; filename=%E4%BD%A0%E5%A5%BD.zip";
        assert_eq!(extract_file_name(value).unwrap(), "\u{4f60}\u{597d}.zip");
    }

    #[test]
    fn test_extract_latin1_filename_falls_back() {
        // 0xE9 不是合法 UTF-8，应按 Latin-1 读出 é
        let value = b"attachment; filename=caf\xe9.zip";
        assert_eq!(extract_file_name(value).unwrap(), "caf\u{e9}.zip");
    }

    #[test]
    fn test_extract_missing_filename() {
        assert!(extract_file_name(b"inline").is_none());
    }

    #[test]
    fn test_file_name_from_url() {
        assert_eq!(
            file_name_from_url("http://host/files/5MB.zip?token=1"),
            "5MB.zip"
        );
        assert_eq!(file_name_from_url("http://host/"), "");
        assert_eq!(file_name_from_url("not a url"), "");
    }

    #[tokio::test]
    async fn test_local_writer_task_writes_in_order() {
        let path = std::env::temp_dir().join(format!("transload_writer_{}.bin", std::process::id()));
        let path_str = FastStr::new(path.to_string_lossy());

        let (tx, handle) = local_writer_task(path_str);
        tx.send(Bytes::from_static(b"hello ")).await.unwrap();
        tx.send(Bytes::from_static(b"world")).await.unwrap();
        drop(tx);

        let written = handle.await.unwrap();
        assert_eq!(written, 11);
        let content = tokio::fs::read(&path).await.unwrap();
        assert_eq!(content, b"hello world");
        let _ = tokio::fs::remove_file(&path).await;
    }
}
