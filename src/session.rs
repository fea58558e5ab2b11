//! 转存会话：公共入口，负责组装各组件并汇聚最终结果。

use crate::buffer::BUFFER_CAP;
use crate::fanout::FanoutCoordinator;
use crate::leg::Leg;
use crate::source::{open_source, pump, source_meta};
use crate::types::{
    LocalSaveResult, Result, TransloadConfig, TransloadResult, UploadConfig, UploadResult,
};
use crate::util::local_writer_task;
use faststr::FastStr;
use futures_util::stream::{FuturesUnordered, StreamExt};
use log::{error, info};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::spawn;
use tokio::sync::mpsc;
use tokio::time::interval;
use tokio_util::sync::CancellationToken;

/// 转存器：把一份 HTTP 下载同时流式送往多个上传目标。
///
/// 整个过程不在内存或磁盘里缓存完整载荷；最慢的上传目标通过
/// 背压决定下载速度。所有支路落定后返回一份聚合结果，单条
/// 支路的失败只体现在它自己的结果里。
pub struct Transloader {
    download_url: FastStr,
    uploads: Vec<UploadConfig>,
    config: TransloadConfig,
}

impl Transloader {
    /// 创建一个新的 `Transloader` 实例。
    ///
    /// # 参数
    ///
    /// * `download_url`: 源文件的下载地址。
    /// * `uploads`: 上传目标列表，结果顺序与之保持一致。
    /// * `config`: 会话级配置（本地落盘、MD5、客户端等）。
    pub fn new(
        download_url: impl Into<FastStr>,
        uploads: Vec<UploadConfig>,
        config: TransloadConfig,
    ) -> Self {
        Self {
            download_url: download_url.into(),
            uploads,
            config,
        }
    }

    /// 执行转存，直到源流和所有上传支路全部落定。
    ///
    /// 只有打开源下载失败时才返回错误；支路的失败、源流中途
    /// 中断等情况都会体现在返回的聚合结果里。
    pub async fn transload(self) -> Result<TransloadResult> {
        let client = match &self.config.client {
            Some(client) => client.clone(),
            None => reqwest::Client::builder().build()?,
        };
        let root = CancellationToken::new();
        let (signal_tx, mut signal_rx) = mpsc::unbounded_channel();

        info!(
            "[Transloader] 启动转存: '{}' -> {} 个上传目标。",
            self.download_url,
            self.uploads.len()
        );

        // 1. 构造支路与协调器
        let legs: Vec<Leg> = self
            .uploads
            .iter()
            .enumerate()
            .map(|(index, upload)| {
                Leg::new(
                    index,
                    upload.clone(),
                    self.config.calculate_md5,
                    root.child_token(),
                    BUFFER_CAP,
                )
            })
            .collect();
        let coordinator = Arc::new(FanoutCoordinator::new(legs, signal_tx.clone()));

        // 2. 并发调度每条支路的上传任务与排空监听
        let mut upload_tasks = FuturesUnordered::new();
        for leg in coordinator.legs() {
            spawn(leg.clone().drain_loop(signal_tx.clone()));

            let leg = leg.clone();
            let leg_client = leg
                .config()
                .client
                .clone()
                .unwrap_or_else(|| client.clone());
            let coordinator = coordinator.clone();
            upload_tasks.push(spawn(async move {
                let index = leg.index();
                let result = leg.run(leg_client).await;
                if result.error.is_some() {
                    coordinator.report_dead(index);
                } else {
                    coordinator.report_settled(index);
                }
                (index, result)
            }));
        }

        // 3. 打开源下载（唯一的致命路径）
        let response = match open_source(&client, self.download_url.as_str()).await {
            Ok(response) => response,
            Err(e) => {
                root.cancel();
                while upload_tasks.next().await.is_some() {}
                return Err(e);
            }
        };
        let meta = source_meta(self.download_url.as_str(), &response);
        info!(
            "[Transloader] 源已打开，大小: {:?}，文件名: '{}'。",
            meta.content_length, meta.file_name
        );
        coordinator.set_filename(&meta.file_name);
        coordinator.set_size(meta.content_length);

        // 4. 可选的本地落盘任务
        let (writer_tx, writer_handle) = match &self.config.save_to_local_path {
            Some(path) => {
                let (tx, handle) = local_writer_task(path.clone());
                (Some(tx), Some(handle))
            }
            None => (None, None),
        };

        // 5. 进度日志任务
        let bytes_downloaded = Arc::new(AtomicU64::new(0));
        let progress = spawn(progress_log_task(
            bytes_downloaded.clone(),
            meta.content_length,
            self.config.progress_interval,
        ));

        // 6. 泵：源 -> {支路们, 本地}
        let outcome = pump(
            response,
            &coordinator,
            &mut signal_rx,
            writer_tx,
            &bytes_downloaded,
            self.config.calculate_md5,
            &root,
        )
        .await;
        progress.abort();

        // 7. 等全部支路落定
        let mut upload_results: Vec<Option<UploadResult>> = vec![None; self.uploads.len()];
        while let Some(joined) = upload_tasks.next().await {
            match joined {
                Ok((index, result)) => upload_results[index] = Some(result),
                Err(e) => error!("[Transloader] 一个上传任务 panicked: {e}"),
            }
        }

        // 8. 本地落盘收尾
        let local = match (writer_handle, &self.config.save_to_local_path) {
            (Some(handle), Some(path)) => match handle.await {
                Ok(size) => Some(LocalSaveResult {
                    path: path.clone(),
                    size,
                }),
                Err(e) => {
                    error!("[Transloader] 本地写入任务 panicked: {e}");
                    Some(LocalSaveResult {
                        path: path.clone(),
                        size: 0,
                    })
                }
            },
            _ => None,
        };

        // 9. 汇总
        let uploads = upload_results
            .into_iter()
            .enumerate()
            .map(|(index, result)| {
                result.unwrap_or_else(|| {
                    coordinator.legs()[index]
                        .make_result(None, Some("上传任务异常退出".to_string()))
                })
            })
            .collect();

        info!("[Transloader] 转存结束。");
        Ok(TransloadResult {
            url: self.download_url,
            size: meta.content_length.unwrap_or(0),
            filename: meta.file_name,
            md5: outcome.md5,
            local,
            uploads,
        })
    }
}

/// 周期性输出下载进度。由会话在泵结束后中止。
async fn progress_log_task(
    bytes_downloaded: Arc<AtomicU64>,
    content_length: Option<u64>,
    every: Duration,
) {
    let mut ticker = interval(every);
    // 第一次 tick 立即完成，跳过
    ticker.tick().await;
    loop {
        ticker.tick().await;
        let downloaded = bytes_downloaded.load(Ordering::Relaxed);
        match content_length {
            Some(total) if total > 0 => info!(
                "[Transloader] 下载进度: {downloaded}/{total} ({:.1}%)。",
                downloaded as f64 / total as f64 * 100.0
            ),
            _ => info!("[Transloader] 已下载 {downloaded} 字节。"),
        }
    }
}
