//! 扇出协调器：把源数据块转发给所有存活支路并汇聚背压信号。

use crate::leg::Leg;
use crate::types::FanoutSignal;
use bytes::Bytes;
use faststr::FastStr;
use log::{debug, info};
use tokio::sync::mpsc;

/// 一份源流、多条支路的协调器。
///
/// 数据块按输入顺序写入每条存活支路；任何支路报满都会向
/// 源读取器发出 `Stuck`，支路排空或退出时由支路自己补回
/// `Unstuck`。所有支路退出后宣告 `Unusable`。
pub(crate) struct FanoutCoordinator {
    legs: Vec<Leg>,
    signal_tx: mpsc::UnboundedSender<FanoutSignal>,
}

impl FanoutCoordinator {
    pub fn new(legs: Vec<Leg>, signal_tx: mpsc::UnboundedSender<FanoutSignal>) -> Self {
        Self { legs, signal_tx }
    }

    pub fn legs(&self) -> &[Leg] {
        &self.legs
    }

    /// 把源侧长度告知每条支路。
    pub fn set_size(&self, content_length: Option<u64>) {
        for leg in &self.legs {
            leg.set_size(content_length);
        }
    }

    /// 把会话推导出的文件名告知每条支路。
    pub fn set_filename(&self, name: &FastStr) {
        for leg in &self.legs {
            leg.set_filename(name);
        }
    }

    /// 按输入顺序把一个数据块写入每条存活支路。
    ///
    /// 报满的支路触发一次 `Stuck`；重复的暂停请求对源读取器
    /// 是幂等的，这里不做去重。
    pub fn broadcast(&self, chunk: &Bytes) {
        for leg in &self.legs {
            if !leg.is_alive() {
                continue;
            }
            if !leg.write(chunk) {
                let _ = self.signal_tx.send(FanoutSignal::Stuck(leg.index()));
            }
        }
    }

    /// 源流正常结束：让每条存活支路收尾。
    pub fn finalize_all(&self) {
        for leg in &self.legs {
            leg.finalize();
        }
    }

    /// 以同一个错误终结所有支路。
    pub fn abort_all(&self, error: &str) {
        for leg in &self.legs {
            leg.fail(error);
        }
    }

    pub fn any_alive(&self) -> bool {
        self.legs.iter().any(|leg| leg.is_alive())
    }

    pub fn any_stalled(&self) -> bool {
        self.legs.iter().any(|leg| leg.is_stalled())
    }

    /// 某条支路的上传任务以失败告终后的收尾。
    ///
    /// 无人存活则宣告 `Unusable`；否则补发一个 `Unstuck`，
    /// 防止源读取器还在等这条支路排空。
    pub fn report_dead(&self, index: usize) {
        if !self.any_alive() {
            info!("[Fanout] 所有上传支路均已退出。");
            let _ = self.signal_tx.send(FanoutSignal::Unusable);
        } else {
            debug!("[Fanout] 支路 {index} 已退出，补发 Unstuck。");
            let _ = self.signal_tx.send(FanoutSignal::Unstuck(index));
        }
    }

    /// 某条支路成功落定后的收尾。
    ///
    /// 上传端可能在这条支路还处于 Stalled 时就提前给出响应，
    /// 此时不会再有排空事件，补发一个 `Unstuck` 让源读取器重查水位。
    pub fn report_settled(&self, index: usize) {
        let _ = self.signal_tx.send(FanoutSignal::Unstuck(index));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::UploadConfig;
    use futures_util::StreamExt;
    use tokio_util::sync::CancellationToken;

    fn init_logger() {
        let _ = env_logger::builder().is_test(true).try_init();
    }

    fn make_coordinator(
        count: usize,
        queue_capacity: usize,
    ) -> (FanoutCoordinator, mpsc::UnboundedReceiver<FanoutSignal>) {
        let (signal_tx, signal_rx) = mpsc::unbounded_channel();
        let legs = (0..count)
            .map(|i| {
                Leg::new(
                    i,
                    UploadConfig::new(format!("http://upload.example/{i}")),
                    false,
                    CancellationToken::new(),
                    queue_capacity,
                )
            })
            .collect();
        (FanoutCoordinator::new(legs, signal_tx), signal_rx)
    }

    #[tokio::test]
    async fn test_broadcast_preserves_order_per_leg() {
        init_logger();
        let (coordinator, _signal_rx) = make_coordinator(2, 1024);
        coordinator.set_size(Some(6));

        coordinator.broadcast(&Bytes::from_static(b"ab"));
        coordinator.broadcast(&Bytes::from_static(b"cd"));
        coordinator.broadcast(&Bytes::from_static(b"ef"));
        coordinator.finalize_all();

        for leg in coordinator.legs() {
            let mut stream = leg.queue().stream();
            let mut seen = Vec::new();
            while let Some(chunk) = stream.next().await {
                seen.extend_from_slice(&chunk.unwrap());
            }
            assert_eq!(seen, b"abcdef", "每条支路看到的字节序列应与源一致");
        }
    }

    #[tokio::test]
    async fn test_overflow_emits_stuck() {
        init_logger();
        let (coordinator, mut signal_rx) = make_coordinator(2, 4);
        coordinator.set_size(None);

        coordinator.broadcast(&Bytes::from_static(b"123456"));
        assert!(coordinator.any_stalled());
        assert_eq!(signal_rx.recv().await.unwrap(), FanoutSignal::Stuck(0));
        assert_eq!(signal_rx.recv().await.unwrap(), FanoutSignal::Stuck(1));
    }

    #[tokio::test]
    async fn test_dead_leg_is_skipped() {
        init_logger();
        let (coordinator, _signal_rx) = make_coordinator(2, 1024);
        coordinator.set_size(Some(4));
        coordinator.legs()[0].fail("提前退出");

        coordinator.broadcast(&Bytes::from_static(b"data"));
        assert_eq!(coordinator.legs()[0].uploaded_bytes(), 0);
        assert_eq!(coordinator.legs()[1].uploaded_bytes(), 4);
        assert!(coordinator.any_alive());
    }

    #[tokio::test]
    async fn test_report_dead_announces_unusable() {
        init_logger();
        let (coordinator, mut signal_rx) = make_coordinator(2, 1024);
        coordinator.set_size(Some(4));

        coordinator.legs()[0].fail("第一条退出");
        coordinator.report_dead(0);
        assert_eq!(signal_rx.recv().await.unwrap(), FanoutSignal::Unstuck(0));

        coordinator.legs()[1].fail("第二条退出");
        coordinator.report_dead(1);
        assert_eq!(signal_rx.recv().await.unwrap(), FanoutSignal::Unusable);
    }
}
