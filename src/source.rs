//! 源读取器：打开下载、推导元信息并把响应体泵入协调器。

use crate::fanout::FanoutCoordinator;
use crate::types::{FanoutSignal, Result};
use crate::util::{extract_file_name, file_name_from_url, DEFAULT_USER_AGENT};
use bytes::Bytes;
use faststr::FastStr;
use futures_util::StreamExt;
use log::{debug, error, info, warn};
use md5::Context as Md5Context;
use reqwest::header::{CONTENT_DISPOSITION, CONTENT_LENGTH, USER_AGENT};
use reqwest::{Client, Response};
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// 从源响应头推导出的元信息。
pub(crate) struct SourceMeta {
    pub content_length: Option<u64>,
    pub file_name: FastStr,
}

/// 泵循环的结局。
pub(crate) struct PumpOutcome {
    /// 源流是否完整走完。
    pub completed: bool,
    /// 会话级摘要；只在源流完整走完时给出。
    pub md5: Option<String>,
}

/// 打开源下载。这是会话中唯一允许让整个调用失败的一步；
/// 只要响应到达，无论状态码如何都照常转存其载荷。
pub(crate) async fn open_source(client: &Client, url: &str) -> Result<Response> {
    info!("[Source] 打开源下载: {url}");
    let response = client
        .get(url)
        .header(USER_AGENT, DEFAULT_USER_AGENT)
        .send()
        .await?;
    Ok(response)
}

/// 从响应头提取内容长度与文件名。
/// 文件名优先取 Content-Disposition，取不到时退回地址路径的最后一段。
pub(crate) fn source_meta(url: &str, response: &Response) -> SourceMeta {
    let content_length = response
        .headers()
        .get(CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.trim().parse::<u64>().ok());
    let file_name = response
        .headers()
        .get(CONTENT_DISPOSITION)
        .and_then(|v| extract_file_name(v.as_bytes()))
        .unwrap_or_else(|| file_name_from_url(url));
    SourceMeta {
        content_length,
        file_name,
    }
}

/// 泵循环：把源响应体逐块送进协调器和可选的本地落盘信道。
///
/// 背压是水平语义：只要还有支路处于 Stalled 就不读下一块，
/// 在信号信道上等支路排空或退出。所有支路都退出后，若配置了
/// 本地保存则继续写盘，否则放弃下载。
pub(crate) async fn pump(
    response: Response,
    coordinator: &FanoutCoordinator,
    signal_rx: &mut mpsc::UnboundedReceiver<FanoutSignal>,
    mut writer_tx: Option<mpsc::Sender<Bytes>>,
    bytes_downloaded: &AtomicU64,
    calculate_md5: bool,
    cancel: &CancellationToken,
) -> PumpOutcome {
    let mut hash = calculate_md5.then(Md5Context::new);
    let mut stream = response.bytes_stream();
    let mut completed = false;

    'pump: loop {
        // 背压：任何一条支路报满都暂停读取，等它排空或退出
        while coordinator.any_stalled() {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    coordinator.abort_all("任务已取消");
                    break 'pump;
                }
                signal = signal_rx.recv() => match signal {
                    Some(FanoutSignal::Unusable) | None => break,
                    Some(signal) => {
                        debug!("[Source] 收到信号: {signal:?}");
                    }
                }
            }
        }

        if !coordinator.any_alive() && writer_tx.is_none() {
            debug!("[Source] 所有上传支路均已退出且未配置本地保存，放弃下载。");
            break 'pump;
        }

        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                coordinator.abort_all("任务已取消");
                break 'pump;
            }
            next = stream.next() => match next {
                Some(Ok(chunk)) => {
                    bytes_downloaded.fetch_add(chunk.len() as u64, Ordering::Relaxed);
                    if let Some(ctx) = hash.as_mut() {
                        ctx.consume(&chunk);
                    }
                    coordinator.broadcast(&chunk);
                    if let Some(tx) = &writer_tx {
                        if tx.send(chunk).await.is_err() {
                            warn!("[Source] 本地写入任务已退出，停止落盘。");
                            writer_tx = None;
                        }
                    }
                }
                Some(Err(e)) => {
                    let msg = format!("源下载中断: {e}");
                    error!("[Source] {msg}");
                    coordinator.abort_all(&msg);
                    // 源未完整走完，不给出会话摘要
                    hash = None;
                    break 'pump;
                }
                None => {
                    info!(
                        "[Source] 源流结束，共 {} 字节。",
                        bytes_downloaded.load(Ordering::Relaxed)
                    );
                    coordinator.finalize_all();
                    completed = true;
                    break 'pump;
                }
            }
        }
    }

    // 关闭落盘信道，让写入任务收尾
    drop(writer_tx);

    PumpOutcome {
        completed,
        md5: if completed {
            hash.map(|ctx| format!("{:x}", ctx.compute()))
        } else {
            None
        },
    }
}
