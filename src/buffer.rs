//! 每条上传支路独享的有界字节队列，背压信号的来源。
//!
//! 写入永远被接受，返回值只是容量水位信号：协调器据此判断
//! 生产者是否应当暂停。读端是一个可以直接交给
//! `reqwest::Body::wrap_stream` 的字节流，严格按 FIFO 顺序出队。

use bytes::Bytes;
use futures_util::Stream;
use log::trace;
use std::collections::VecDeque;
use std::io;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard};
use std::task::{Context, Poll, Waker};
use tokio::sync::Notify;

/// 队列的默认容量上限：20 MiB。
pub(crate) const BUFFER_CAP: usize = 20 * 1024 * 1024;

struct QueueInner {
    chunks: VecDeque<Bytes>,
    /// 当前占用的字节数。
    occupied: usize,
    /// 写端是否已正常关闭（流结束标记）。
    closed: bool,
    /// 销毁原因；Some 表示队列已失效。
    error: Option<String>,
    /// 读端挂起时注册的唤醒器。
    read_waker: Option<Waker>,
}

impl QueueInner {
    /// 队列是否已进入终态：被销毁，或已关闭且排空。
    fn terminated(&self) -> bool {
        self.error.is_some() || (self.closed && self.chunks.is_empty())
    }
}

/// 单生产者单消费者的字节队列。
#[derive(Clone)]
pub(crate) struct ByteQueue {
    inner: Arc<Mutex<QueueInner>>,
    /// 占用归零（或进入终态）时通知排空观察者。
    drain: Arc<Notify>,
    capacity: usize,
}

impl ByteQueue {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            inner: Arc::new(Mutex::new(QueueInner {
                chunks: VecDeque::new(),
                occupied: 0,
                closed: false,
                error: None,
                read_waker: None,
            })),
            drain: Arc::new(Notify::new()),
            capacity,
        }
    }

    fn lock(&self) -> MutexGuard<'_, QueueInner> {
        // 持锁期间不会 panic，中毒只可能来自已经崩溃的任务
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// 入队一个数据块，返回写入后占用是否仍在容量之内。
    /// 队列终止后写入被忽略并返回 `true`。
    pub fn push(&self, chunk: Bytes) -> bool {
        let mut inner = self.lock();
        if inner.closed || inner.error.is_some() {
            return true;
        }
        inner.occupied += chunk.len();
        inner.chunks.push_back(chunk);
        let accepted = inner.occupied <= self.capacity;
        if let Some(waker) = inner.read_waker.take() {
            waker.wake();
        }
        accepted
    }

    /// 标记流结束；读端把剩余数据出队后返回 `None`。
    pub fn close(&self) {
        let mut inner = self.lock();
        inner.closed = true;
        if let Some(waker) = inner.read_waker.take() {
            waker.wake();
        }
        if inner.chunks.is_empty() {
            drop(inner);
            self.drain.notify_one();
        }
    }

    /// 带错误销毁队列：丢弃未出队的数据，读端得到一个 I/O 错误。
    pub fn fail(&self, error: impl Into<String>) {
        let mut inner = self.lock();
        if inner.error.is_some() {
            return;
        }
        inner.chunks.clear();
        inner.occupied = 0;
        inner.error = Some(error.into());
        if let Some(waker) = inner.read_waker.take() {
            waker.wake();
        }
        drop(inner);
        self.drain.notify_one();
    }

    /// 终止队列并丢弃剩余数据。
    ///
    /// 用于消费端已不再读取的场合（例如上传端提前给出了响应），
    /// 让排空观察者得以退出。
    pub fn discard(&self) {
        let mut inner = self.lock();
        inner.chunks.clear();
        inner.occupied = 0;
        inner.closed = true;
        if let Some(waker) = inner.read_waker.take() {
            waker.wake();
        }
        drop(inner);
        self.drain.notify_one();
    }

    /// 当前占用的字节数。
    #[cfg(test)]
    pub fn occupied(&self) -> usize {
        self.lock().occupied
    }

    /// 等待一次排空事件。
    ///
    /// 占用从非零回落到零时返回 `Some(())`；队列进入终态后返回 `None`。
    pub async fn drained(&self) -> Option<()> {
        loop {
            if self.lock().terminated() {
                return None;
            }
            self.drain.notified().await;
            let inner = self.lock();
            if inner.terminated() {
                return None;
            }
            if inner.chunks.is_empty() {
                return Some(());
            }
            // 唤醒时队列又有了数据，继续等下一次排空
        }
    }

    /// 取出读端字节流。单消费者：同一时刻只应存在一个。
    pub fn stream(&self) -> QueueStream {
        QueueStream {
            queue: self.clone(),
        }
    }
}

/// `ByteQueue` 的读端，按 FIFO 顺序产出字节块。
pub(crate) struct QueueStream {
    queue: ByteQueue,
}

impl Stream for QueueStream {
    type Item = io::Result<Bytes>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let mut inner = self.queue.lock();
        if let Some(chunk) = inner.chunks.pop_front() {
            inner.occupied -= chunk.len();
            let emptied = inner.chunks.is_empty();
            drop(inner);
            if emptied {
                trace!("[ByteQueue] 占用归零，通知排空观察者。");
                self.queue.drain.notify_one();
            }
            return Poll::Ready(Some(Ok(chunk)));
        }
        if let Some(msg) = &inner.error {
            return Poll::Ready(Some(Err(io::Error::new(io::ErrorKind::Other, msg.clone()))));
        }
        if inner.closed {
            return Poll::Ready(None);
        }
        inner.read_waker = Some(cx.waker().clone());
        Poll::Pending
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::StreamExt;

    #[tokio::test]
    async fn test_fifo_order_and_watermark() {
        let queue = ByteQueue::with_capacity(8);

        assert!(queue.push(Bytes::from_static(b"aaaaa")), "容量之内的写入应返回 true");
        assert!(
            !queue.push(Bytes::from_static(b"bbbb")),
            "越过容量上限的写入应返回 false"
        );
        assert_eq!(queue.occupied(), 9);

        let mut stream = queue.stream();
        assert_eq!(stream.next().await.unwrap().unwrap(), Bytes::from_static(b"aaaaa"));
        assert_eq!(stream.next().await.unwrap().unwrap(), Bytes::from_static(b"bbbb"));
        assert_eq!(queue.occupied(), 0, "全部出队后占用应归零");
    }

    #[tokio::test]
    async fn test_drain_event_then_terminal() {
        let queue = ByteQueue::with_capacity(4);
        queue.push(Bytes::from_static(b"xxxxxx"));

        let mut stream = queue.stream();
        let _ = stream.next().await;
        assert_eq!(
            queue.drained().await,
            Some(()),
            "占用归零后应观察到一次排空事件"
        );

        queue.close();
        assert_eq!(queue.drained().await, None, "队列终态后排空等待应结束");
    }

    #[tokio::test]
    async fn test_close_ends_stream_after_remaining() {
        let queue = ByteQueue::with_capacity(BUFFER_CAP);
        queue.push(Bytes::from_static(b"tail"));
        queue.close();
        assert!(queue.push(Bytes::from_static(b"late")), "关闭后的写入应被忽略");
        assert_eq!(queue.occupied(), 4);

        let mut stream = queue.stream();
        assert_eq!(stream.next().await.unwrap().unwrap(), Bytes::from_static(b"tail"));
        assert!(stream.next().await.is_none(), "关闭后排空的流应以 None 结束");
    }

    #[tokio::test]
    async fn test_fail_destroys_queue() {
        let queue = ByteQueue::with_capacity(BUFFER_CAP);
        queue.push(Bytes::from_static(b"data"));
        queue.fail("上传端异常");
        assert_eq!(queue.occupied(), 0, "销毁时应丢弃未出队的数据");

        let mut stream = queue.stream();
        let err = stream.next().await.unwrap().unwrap_err();
        assert!(err.to_string().contains("上传端异常"));
        assert_eq!(queue.drained().await, None);
    }
}
