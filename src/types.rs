/// 定义库中使用的公共类型、错误、配置和内部信号。
use faststr::FastStr;
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::io;
use std::time::Duration;
use thiserror::Error;

// --- 公共类型 ---

/// 库中通用的 `Result` 类型别名，错误类型为 `TransloadError`。
pub type Result<T> = std::result::Result<T, TransloadError>;

/// 定义了库中可能发生的所有公共错误类型。
///
/// 只有打开源下载的阶段会以错误结束整个会话；
/// 之后发生的任何单条支路的失败都只记录在聚合结果里。
#[derive(Debug, Error)]
pub enum TransloadError {
    /// 网络请求失败，包装了来自 `reqwest` 的错误。
    #[error("网络请求失败: {0}")]
    Request(#[from] reqwest::Error),
    /// 文件 I/O 错误，例如创建或写入本地文件失败。
    #[error("文件 I/O 错误: {0}")]
    Io(#[from] io::Error),
    /// 并发任务执行失败（例如，任务 panic）。
    #[error("并发任务执行失败: {0}")]
    Join(#[from] tokio::task::JoinError),
}

/// 上传请求使用的 HTTP 方法。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum UploadMethod {
    /// multipart/form-data 表单上传（默认）。
    #[default]
    Post,
    /// 原始请求体直传。
    Put,
}

/// 单个上传目标的配置。
#[derive(Debug, Clone, Default)]
pub struct UploadConfig {
    /// 上传目标地址。
    pub upload_url: FastStr,
    /// 上传使用的 HTTP 方法。
    pub method: UploadMethod,
    /// 上传时使用的文件名；缺省时采用会话从源推导出的文件名。
    pub file_name: Option<FastStr>,
    /// 在流末尾追加的随机字节数量，用于改变这条支路的内容摘要。
    pub random_bytes_count: u32,
    /// 自定义请求头；缺省时只带默认的 User-Agent。
    pub headers: Option<HashMap<String, String>>,
    /// 本条支路专用的 HTTP 客户端；缺省时复用会话客户端。
    pub client: Option<reqwest::Client>,
}

impl UploadConfig {
    /// 创建一个指向 `upload_url` 的默认配置。
    pub fn new(upload_url: impl Into<FastStr>) -> Self {
        Self {
            upload_url: upload_url.into(),
            ..Default::default()
        }
    }
}

/// 转存会话的全局配置。
#[derive(Debug, Clone)]
pub struct TransloadConfig {
    /// 同时把源数据落盘到该路径。
    pub save_to_local_path: Option<FastStr>,
    /// 是否为源流和每条支路计算 MD5。
    pub calculate_md5: bool,
    /// 进度日志的输出间隔。
    pub progress_interval: Duration,
    /// 会话级 HTTP 客户端；缺省时自动构建一个。
    pub client: Option<reqwest::Client>,
}

impl Default for TransloadConfig {
    /// 提供一组合理的默认配置。
    fn default() -> Self {
        Self {
            save_to_local_path: None,
            calculate_md5: false,
            progress_interval: Duration::from_secs(5),
            client: None,
        }
    }
}

/// 整个转存会话的聚合结果。
#[derive(Debug, Clone, Serialize)]
pub struct TransloadResult {
    /// 原始下载地址。
    pub url: FastStr,
    /// 源响应头声明的内容长度；未知时为 0。
    pub size: u64,
    /// 会话推导出的文件名。
    pub filename: FastStr,
    /// 源流的 MD5；只在开启计算且源流完整走完时给出。
    #[serde(skip_serializing_if = "Option::is_none")]
    pub md5: Option<String>,
    /// 本地落盘记录；只在配置了保存路径时给出。
    #[serde(skip_serializing_if = "Option::is_none")]
    pub local: Option<LocalSaveResult>,
    /// 每个上传目标的结果，顺序与输入一致。
    pub uploads: Vec<UploadResult>,
}

/// 本地落盘的结果记录。
#[derive(Debug, Clone, Serialize)]
pub struct LocalSaveResult {
    /// 落盘路径。
    pub path: FastStr,
    /// 实际写入的字节数。
    pub size: u64,
}

/// 单个上传目标的结果记录。
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadResult {
    /// 上传目标地址，与输入一致。
    pub upload_url: FastStr,
    /// 这条支路最终使用的文件名。
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file_name: Option<FastStr>,
    /// 向上传端声明的长度（含随机尾缀）；从未知晓时为 0。
    pub size: u64,
    /// 实际送入这条支路的字节数。
    /// 字段名沿用旧接口的拼写（uploadedByes），外部依赖该名字。
    #[serde(rename = "uploadedByes")]
    pub uploaded_byes: u64,
    /// 追加的随机字节数量；只在大于零时给出。
    #[serde(skip_serializing_if = "Option::is_none")]
    pub random_bytes_count: Option<u32>,
    /// 这条支路送出内容的 MD5；失败的支路不给出。
    #[serde(skip_serializing_if = "Option::is_none")]
    pub md5: Option<String>,
    /// 上传端的响应：能解析为 JSON 时是解析结果，否则是原始文本。
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response: Option<Value>,
    /// 失败原因；成功时不存在。
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

// --- 内部信号 ---

/// 扇出协调器发往源读取器的背压与存活信号。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum FanoutSignal {
    /// 某条支路的缓冲越过容量上限，生产者应当暂停。
    Stuck(usize),
    /// 某条支路已排空或退出，生产者可以再次尝试推进。
    Unstuck(usize),
    /// 所有支路均已退出。
    Unusable,
}
