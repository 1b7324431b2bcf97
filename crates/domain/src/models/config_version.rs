use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// 配置版本快照，创建后不可变
///
/// 同一config_name下有多个版本，只有最新版本是"当前"配置。
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ConfigVersion {
    pub config_name: String,
    /// 单调递增的版本号
    pub version: u64,
    /// 原始文件内容的十六进制SHA-256
    pub checksum: String,
    pub updated_at: DateTime<Utc>,
    pub content: serde_json::Value,
}

/// 配置更新通知，通过存储的pub/sub频道广播
///
/// 推送只携带名称和版本号，接收方自行拉取内容；错过通知的
/// 进程在下一次get时惰性对齐——最终一致而非即时一致。
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ConfigUpdateNotice {
    pub config_name: String,
    pub version: u64,
    pub timestamp: DateTime<Utc>,
}
