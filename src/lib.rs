//! 一个把单个 HTTP 下载同时流式转存（transload）到多个上传目标的库。
//!
//! # 核心特性
//!
//! - **一源多汇**：一次下载同时送往 N 个上传目标，可选同步落盘到本地。
//! - **流式背压**：完整载荷从不在内存或磁盘里缓存；每条支路有 20 MiB
//!   的有界缓冲，最慢的上传目标决定下载速度。
//! - **故障隔离**：单条支路失败只记录在它自己的结果里，其余支路照常
//!   完成；只有打开源下载失败才会让整个调用报错。
//! - **逐流摘要**：可选为源流和每条支路计算 MD5；支路还可以追加随机
//!   尾缀来改变自己的内容摘要。
//! - **异步 IO**：完全基于 `tokio` 构建，提供高并发、低开销的 IO 操作。
//! - **自定义客户端**：允许用户为会话或单条支路提供自定义的
//!   `reqwest::Client`（例如，设置代理、超时、自定义头等）。
//!
//! # 架构
//!
//! 系统是一条单生产者、多消费者的流水线，控制流沿数据流反向传递：
//!
//! - **`Transloader`**: 作为系统的入口和监督者，负责组装组件、等待
//!   所有支路落定并汇总最终结果。
//! - **源读取器**: 打开下载、推导长度与文件名，把响应体逐块泵入
//!   协调器；任何支路报满时暂停，排空后恢复。
//! - **扇出协调器**: 把每个数据块按输入顺序转发给所有存活支路，
//!   汇聚 `Stuck`/`Unstuck`/`Unusable` 信号。
//! - **上传支路（Leg）**: 独立的上传单元，拥有自己的有界缓冲、运行中
//!   摘要、空闲计时器与取消句柄，把缓冲作为请求体流式送往上传端。

mod buffer;
mod fanout;
mod leg;
mod session;
mod source;
mod types;
mod util;

// --- 公共 API 导出 ---

// 导出核心的 `Transloader`，它是用户的主要入口点。
pub use session::Transloader;
// 重新导出 `reqwest`，允许用户提供自定义的 `Client`。
pub use reqwest;
// 导出公共类型，方便用户在类型注解和模式匹配中使用。
pub use types::{
    LocalSaveResult, Result, TransloadConfig, TransloadError, TransloadResult, UploadConfig,
    UploadMethod, UploadResult,
};
