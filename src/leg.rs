//! 单条上传支路（Leg）的状态机与上传执行逻辑。
//!
//! 每条支路拥有自己的有界字节队列、运行中的 MD5、字节计数、
//! 空闲计时器和取消句柄。协调器把源数据块写进队列，
//! `run` 任务把队列作为请求体流式送往上传端。

use crate::buffer::ByteQueue;
use crate::types::{FanoutSignal, UploadConfig, UploadMethod, UploadResult};
use crate::util::DEFAULT_USER_AGENT;
use bytes::Bytes;
use faststr::FastStr;
use log::{debug, warn};
use md5::Context as Md5Context;
use rand::RngCore;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, CONTENT_LENGTH, USER_AGENT};
use reqwest::multipart::{Form, Part};
use reqwest::{Body, Client};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::{mpsc, watch, Notify};
use tokio::time::{sleep_until, Instant};
use tokio_util::sync::CancellationToken;

/// 单条支路的空闲超时：超过该时长没有任何推进即判定上传端已僵死。
pub(crate) const IDLE_TIMEOUT: Duration = Duration::from_secs(60);

/// 支路的生命周期状态。
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum LegState {
    /// 已创建，等待源侧的长度信息。
    Preparing,
    /// 正常收流。
    Active,
    /// 缓冲越限，等待排空；此时空闲计时器被清除。
    Stalled,
    /// 源侧已结束，缓冲排空中。
    Finalizing,
    /// 终态；`Some` 为失败原因，`None` 表示成功。
    Done(Option<String>),
}

/// 60 秒单发空闲计时器。写入方通过 watch 信道重置或清除期限。
struct IdleTimer {
    deadline_tx: watch::Sender<Option<Instant>>,
}

impl IdleTimer {
    fn new() -> Self {
        let (deadline_tx, _) = watch::channel(None);
        Self { deadline_tx }
    }

    fn arm(&self) {
        let _ = self.deadline_tx.send(Some(Instant::now() + IDLE_TIMEOUT));
    }

    fn clear(&self) {
        let _ = self.deadline_tx.send(None);
    }

    /// 挂起直到计时器到期。被清除时继续等待下一次武装。
    async fn expired(&self) {
        let mut rx = self.deadline_tx.subscribe();
        loop {
            let deadline = *rx.borrow_and_update();
            match deadline {
                Some(at) => {
                    tokio::select! {
                        _ = sleep_until(at) => return,
                        changed = rx.changed() => {
                            if changed.is_err() {
                                std::future::pending::<()>().await;
                            }
                        }
                    }
                }
                None => {
                    if rx.changed().await.is_err() {
                        std::future::pending::<()>().await;
                    }
                }
            }
        }
    }
}

struct LegShared {
    index: usize,
    config: UploadConfig,
    state: Mutex<LegState>,
    queue: ByteQueue,
    uploaded_bytes: AtomicU64,
    /// 向上传端声明的长度（源长度加随机尾缀），至多写入一次。
    declared_size: Mutex<Option<u64>>,
    file_name: Mutex<Option<FastStr>>,
    /// 运行中的摘要；finalize 时取出固化到 `md5_hex`。
    hash: Mutex<Option<Md5Context>>,
    md5_hex: Mutex<Option<String>>,
    idle: IdleTimer,
    cancel: CancellationToken,
    /// set_size 之后放行 run()。
    size_ready: Notify,
}

/// 一条上传支路。克隆是廉价的句柄复制。
#[derive(Clone)]
pub(crate) struct Leg {
    shared: Arc<LegShared>,
}

impl Leg {
    /// 创建支路：建好缓冲、摘要与取消句柄，不做任何 I/O。
    pub fn new(
        index: usize,
        config: UploadConfig,
        calculate_md5: bool,
        cancel: CancellationToken,
        queue_capacity: usize,
    ) -> Self {
        let file_name = config.file_name.clone();
        Self {
            shared: Arc::new(LegShared {
                index,
                config,
                state: Mutex::new(LegState::Preparing),
                queue: ByteQueue::with_capacity(queue_capacity),
                uploaded_bytes: AtomicU64::new(0),
                declared_size: Mutex::new(None),
                file_name: Mutex::new(file_name),
                hash: Mutex::new(calculate_md5.then(Md5Context::new)),
                md5_hex: Mutex::new(None),
                idle: IdleTimer::new(),
                cancel,
                size_ready: Notify::new(),
            }),
        }
    }

    pub fn index(&self) -> usize {
        self.shared.index
    }

    pub fn config(&self) -> &UploadConfig {
        &self.shared.config
    }

    fn state(&self) -> MutexGuard<'_, LegState> {
        self.shared.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn lock<'a, T>(&self, mutex: &'a Mutex<T>) -> MutexGuard<'a, T> {
        mutex.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn is_alive(&self) -> bool {
        !matches!(*self.state(), LegState::Done(_))
    }

    pub fn is_stalled(&self) -> bool {
        *self.state() == LegState::Stalled
    }

    /// 源侧长度已知：记下声明长度，武装空闲计时器并放行上传任务。
    pub fn set_size(&self, content_length: Option<u64>) {
        let mut state = self.state();
        if *state != LegState::Preparing {
            return;
        }
        *self.lock(&self.shared.declared_size) =
            content_length.map(|n| n + u64::from(self.shared.config.random_bytes_count));
        *state = LegState::Active;
        drop(state);
        self.shared.idle.arm();
        self.shared.size_ready.notify_one();
        debug!(
            "[Leg {}] 进入 Active，声明大小: {:?}。",
            self.shared.index,
            self.lock(&self.shared.declared_size)
        );
    }

    /// 采纳会话推导出的文件名；配置里已有文件名时不覆盖。
    pub fn set_filename(&self, name: &FastStr) {
        let mut file_name = self.lock(&self.shared.file_name);
        if file_name.is_none() {
            *file_name = Some(name.clone());
        }
    }

    /// 把一个数据块写进这条支路。
    ///
    /// 返回写入后缓冲占用是否仍在容量之内；`false` 表示支路进入
    /// Stalled，生产者应当暂停。终态或未激活的支路忽略写入。
    pub fn write(&self, chunk: &Bytes) -> bool {
        let mut state = self.state();
        if !matches!(*state, LegState::Active | LegState::Stalled) {
            return true;
        }
        let accepted = self.shared.queue.push(chunk.clone());
        self.shared
            .uploaded_bytes
            .fetch_add(chunk.len() as u64, Ordering::Relaxed);
        if let Some(ctx) = self.lock(&self.shared.hash).as_mut() {
            ctx.consume(chunk);
        }
        if accepted {
            if *state == LegState::Active {
                self.shared.idle.arm();
            }
        } else if *state != LegState::Stalled {
            *state = LegState::Stalled;
            // 刻意等待不等于僵死：Stalled 期间不计空闲
            self.shared.idle.clear();
            debug!("[Leg {}] 缓冲越限，进入 Stalled。", self.shared.index);
        }
        accepted
    }

    /// 源侧已正常结束：追加随机尾缀、固化摘要并关闭缓冲。
    pub fn finalize(&self) {
        let mut state = self.state();
        if !matches!(*state, LegState::Active | LegState::Stalled) {
            return;
        }
        let count = self.shared.config.random_bytes_count;
        if count > 0 {
            let mut suffix = vec![0u8; count as usize];
            rand::rng().fill_bytes(&mut suffix);
            let suffix = Bytes::from(suffix);
            self.shared.queue.push(suffix.clone());
            self.shared
                .uploaded_bytes
                .fetch_add(u64::from(count), Ordering::Relaxed);
            if let Some(ctx) = self.lock(&self.shared.hash).as_mut() {
                ctx.consume(&suffix);
            }
        }
        if let Some(ctx) = self.lock(&self.shared.hash).take() {
            *self.lock(&self.shared.md5_hex) = Some(format!("{:x}", ctx.compute()));
        }
        self.shared.queue.close();
        self.shared.idle.clear();
        *state = LegState::Finalizing;
        debug!("[Leg {}] 进入 Finalizing，等待缓冲排空。", self.shared.index);
    }

    /// 以错误终结这条支路：触发取消、销毁缓冲、清除计时器。
    /// 已到终态的支路不再改写（第一个错误为准）。
    pub fn fail(&self, error: impl Into<String>) {
        let msg = error.into();
        let mut state = self.state();
        if matches!(*state, LegState::Done(_)) {
            return;
        }
        debug!("[Leg {}] 以错误终结: {msg}", self.shared.index);
        *state = LegState::Done(Some(msg.clone()));
        drop(state);
        self.shared.cancel.cancel();
        self.shared.queue.fail(msg);
        self.shared.idle.clear();
    }

    /// 尝试以成功终结；返回是否真的占据了终态。
    fn complete(&self) -> bool {
        let mut state = self.state();
        if matches!(*state, LegState::Done(_)) {
            return false;
        }
        *state = LegState::Done(None);
        drop(state);
        self.shared.idle.clear();
        // 上传端可能没读完就给出了响应，丢掉缓冲里剩下的数据
        self.shared.queue.discard();
        true
    }

    /// 终态里的失败原因。
    fn terminal_error(&self) -> Option<String> {
        match &*self.state() {
            LegState::Done(error) => error.clone(),
            _ => None,
        }
    }

    /// 监听缓冲排空事件：Stalled 的支路恢复 Active 并发出 Unstuck；
    /// Active 的支路只重置空闲计时器（消费侧也算推进）。
    pub async fn drain_loop(self, signal_tx: mpsc::UnboundedSender<FanoutSignal>) {
        while let Some(()) = self.shared.queue.drained().await {
            let mut state = self.state();
            match *state {
                LegState::Stalled => {
                    *state = LegState::Active;
                    drop(state);
                    self.shared.idle.arm();
                    debug!("[Leg {}] 缓冲已排空，恢复 Active。", self.shared.index);
                    let _ = signal_tx.send(FanoutSignal::Unstuck(self.shared.index));
                }
                LegState::Active => {
                    drop(state);
                    self.shared.idle.arm();
                }
                _ => {}
            }
        }
    }

    /// 执行上传请求并等待完成，返回这条支路的最终结果。
    pub async fn run(self, client: Client) -> UploadResult {
        // 等源侧把长度送达；会话也可能在此之前就被取消
        tokio::select! {
            biased;
            _ = self.shared.cancel.cancelled() => {
                self.fail("任务已取消");
                return self.make_result(None, self.terminal_error());
            }
            _ = self.shared.size_ready.notified() => {}
        }

        match self.execute(client).await {
            Ok(response) => {
                if self.complete() {
                    self.make_result(Some(response), None)
                } else {
                    // 响应虽到，支路已被先行终结，以先到的错误为准
                    self.make_result(None, self.terminal_error())
                }
            }
            Err(msg) => {
                self.fail(msg);
                self.make_result(None, self.terminal_error())
            }
        }
    }

    /// 构造并发送上传请求，把响应体读成文本后尽量解析为 JSON。
    async fn execute(&self, client: Client) -> std::result::Result<Value, String> {
        let config = &self.shared.config;
        let declared = *self.lock(&self.shared.declared_size);
        let file_name = self.lock(&self.shared.file_name).clone();
        let body = Body::wrap_stream(self.shared.queue.stream());

        let mut request = match config.method {
            UploadMethod::Put => {
                let mut builder = client.put(config.upload_url.as_str());
                if let Some(size) = declared {
                    builder = builder.header(CONTENT_LENGTH, size);
                }
                builder.body(body)
            }
            UploadMethod::Post => {
                let part = match declared {
                    Some(size) => Part::stream_with_length(body, size),
                    None => Part::stream(body),
                };
                let part = part
                    .file_name(file_name.clone().unwrap_or_default().to_string())
                    .mime_str("application/octet-stream")
                    .map_err(|e| format!("构建 multipart 表单失败: {e}"))?;
                let form = Form::new().part("file", part);
                client.post(config.upload_url.as_str()).multipart(form)
            }
        };
        request = match &config.headers {
            Some(headers) => request.headers(build_header_map(headers)),
            None => request.header(USER_AGENT, DEFAULT_USER_AGENT),
        };

        debug!(
            "[Leg {}] 发起 {:?} 上传: {}",
            self.shared.index, config.method, config.upload_url
        );

        let response = tokio::select! {
            biased;
            _ = self.shared.cancel.cancelled() => return Err("任务已取消".to_string()),
            _ = self.shared.idle.expired() => {
                return Err(format!("上传空闲超过 {} 秒，已取消", IDLE_TIMEOUT.as_secs()));
            }
            result = request.send() => {
                result.map_err(|e| format!("上传请求失败: {e}"))?
            }
        };

        let status = response.status();
        let text = tokio::select! {
            biased;
            _ = self.shared.cancel.cancelled() => return Err("任务已取消".to_string()),
            result = response.text() => {
                result.map_err(|e| format!("读取上传响应失败: {e}"))?
            }
        };
        debug!(
            "[Leg {}] 上传端响应: status={status}, body={} 字节。",
            self.shared.index,
            text.len()
        );

        // 任何能拿到的响应都视作这条支路成功，原文记录
        Ok(match serde_json::from_str(&text) {
            Ok(value) => value,
            Err(_) => Value::String(text),
        })
    }

    /// 由当前状态拼出结果记录。
    pub fn make_result(&self, response: Option<Value>, error: Option<String>) -> UploadResult {
        let config = &self.shared.config;
        UploadResult {
            upload_url: config.upload_url.clone(),
            file_name: self.lock(&self.shared.file_name).clone(),
            size: self.lock(&self.shared.declared_size).unwrap_or(0),
            uploaded_byes: self.shared.uploaded_bytes.load(Ordering::Relaxed),
            random_bytes_count: (config.random_bytes_count > 0).then_some(config.random_bytes_count),
            md5: if error.is_none() {
                self.lock(&self.shared.md5_hex).clone()
            } else {
                None
            },
            response,
            error,
        }
    }

    #[cfg(test)]
    pub(crate) fn queue(&self) -> &ByteQueue {
        &self.shared.queue
    }

    #[cfg(test)]
    pub(crate) fn state_snapshot(&self) -> LegState {
        self.state().clone()
    }

    #[cfg(test)]
    pub(crate) fn uploaded_bytes(&self) -> u64 {
        self.shared.uploaded_bytes.load(Ordering::Relaxed)
    }
}

/// 把用户提供的请求头转换成 `HeaderMap`，非法项跳过并告警。
fn build_header_map(headers: &HashMap<String, String>) -> HeaderMap {
    let mut map = HeaderMap::new();
    for (name, value) in headers {
        match (
            HeaderName::try_from(name.as_str()),
            HeaderValue::from_str(value),
        ) {
            (Ok(name), Ok(value)) => {
                map.insert(name, value);
            }
            _ => warn!("[Leg] 跳过非法请求头: {name}"),
        }
    }
    map
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::StreamExt;
    use tokio::time::{timeout, Duration};

    fn init_logger() {
        let _ = env_logger::builder().is_test(true).try_init();
    }

    fn make_leg(random_bytes_count: u32, queue_capacity: usize) -> Leg {
        let mut config = UploadConfig::new("http://upload.example/slot");
        config.random_bytes_count = random_bytes_count;
        Leg::new(0, config, true, CancellationToken::new(), queue_capacity)
    }

    fn md5_of(data: &[u8]) -> String {
        let mut ctx = Md5Context::new();
        ctx.consume(data);
        format!("{:x}", ctx.compute())
    }

    #[tokio::test]
    async fn test_state_flow_and_watermark() {
        init_logger();
        let leg = make_leg(0, 8);
        assert_eq!(leg.state_snapshot(), LegState::Preparing);
        assert!(leg.is_alive());

        leg.set_size(Some(100));
        assert_eq!(leg.state_snapshot(), LegState::Active);

        assert!(leg.write(&Bytes::from_static(b"12345")), "容量之内应接受而不报满");
        assert!(
            !leg.write(&Bytes::from_static(b"67890")),
            "越过容量上限应返回 false"
        );
        assert_eq!(leg.state_snapshot(), LegState::Stalled);
        assert_eq!(leg.uploaded_bytes(), 10);
    }

    #[tokio::test]
    async fn test_drain_recovers_and_emits_unstuck() {
        init_logger();
        let leg = make_leg(0, 4);
        leg.set_size(Some(16));
        assert!(!leg.write(&Bytes::from_static(b"abcdef")));
        assert_eq!(leg.state_snapshot(), LegState::Stalled);

        let (signal_tx, mut signal_rx) = mpsc::unbounded_channel();
        tokio::spawn(leg.clone().drain_loop(signal_tx));

        let mut stream = leg.queue().stream();
        let _ = stream.next().await;

        let signal = timeout(Duration::from_secs(1), signal_rx.recv())
            .await
            .expect("排空后应及时收到信号")
            .expect("信号信道不应关闭");
        assert_eq!(signal, FanoutSignal::Unstuck(0));
        assert_eq!(leg.state_snapshot(), LegState::Active);
    }

    #[tokio::test]
    async fn test_finalize_without_suffix_keeps_source_md5() {
        init_logger();
        let leg = make_leg(0, 1024);
        leg.set_size(Some(9));
        leg.write(&Bytes::from_static(b"transload"));
        leg.finalize();

        assert_eq!(leg.state_snapshot(), LegState::Finalizing);
        let result = leg.make_result(None, None);
        assert_eq!(result.md5.unwrap(), md5_of(b"transload"));
        assert_eq!(result.uploaded_byes, 9);
        assert_eq!(result.size, 9);
    }

    #[tokio::test]
    async fn test_finalize_with_suffix_changes_md5_and_counts() {
        init_logger();
        let leg = make_leg(12, 1024);
        leg.set_size(Some(9));
        leg.write(&Bytes::from_static(b"transload"));
        leg.finalize();

        let result = leg.make_result(None, None);
        assert_eq!(result.uploaded_byes, 21, "随机尾缀应计入字节数");
        assert_eq!(result.size, 21, "声明大小应包含随机尾缀");
        assert_eq!(result.random_bytes_count, Some(12));
        assert_ne!(
            result.md5.unwrap(),
            md5_of(b"transload"),
            "追加随机尾缀后摘要应当改变"
        );

        // 尾缀也要按源顺序流出
        let mut stream = leg.queue().stream();
        let mut total = 0;
        while let Some(chunk) = stream.next().await {
            total += chunk.unwrap().len();
        }
        assert_eq!(total, 21);
    }

    #[tokio::test]
    async fn test_first_error_wins() {
        init_logger();
        let leg = make_leg(0, 1024);
        leg.set_size(Some(4));
        leg.fail("上传端断开");
        leg.fail("后到的错误");

        assert!(!leg.is_alive());
        let result = leg.make_result(None, leg.terminal_error());
        assert_eq!(result.error.unwrap(), "上传端断开");
        assert!(result.md5.is_none(), "失败的支路不应给出摘要");
    }

    #[tokio::test]
    async fn test_write_ignored_after_done() {
        init_logger();
        let leg = make_leg(0, 1024);
        leg.set_size(Some(4));
        leg.fail("已退出");

        assert!(leg.write(&Bytes::from_static(b"data")));
        assert_eq!(leg.uploaded_bytes(), 0, "终态后的写入不应计数");
    }

    #[tokio::test]
    async fn test_set_filename_does_not_override_config() {
        init_logger();
        let mut config = UploadConfig::new("http://upload.example/slot");
        config.file_name = Some("fixed.bin".into());
        let leg = Leg::new(0, config, false, CancellationToken::new(), 1024);

        leg.set_filename(&"derived.bin".into());
        let result = leg.make_result(None, None);
        assert_eq!(result.file_name.unwrap(), "fixed.bin");
    }
}
