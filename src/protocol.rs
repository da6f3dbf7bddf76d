//! 双工通道消息协议
//!
//! 信封为 JSON 对象：`{url, response, websocket_session_id, ...payload}`。
//! `url` 指定远端操作，`response` 指定通用回复端点，`websocket_session_id` 是回复必须回显的关联 ID。

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

pub const AGENT_REGISTER: &str = "/agent/register";
pub const AGENT_UPDATE_PERFORMANCE: &str = "/agent/update/performance";
pub const AGENT_UPDATE_PLUGINS: &str = "/agent/update/plugins";
pub const AGENT_LIST: &str = "/agent/list";
pub const AGENT_INSTALL_PACKAGE: &str = "/agent/install/package";
pub const AGENT_CLIENT_RUN: &str = "/agent/client/run";
pub const AGENT_CLIENT_INSTALL_PACKAGE: &str = "/agent/client/install/package";
pub const TASK_RUN: &str = "/task/run";
pub const TASK_RUN_ASYNC: &str = "/task/run/async";
pub const TASK_QUERY: &str = "/task/query";
pub const TASK_PLUGIN_RUN_ASYNC: &str = "/task/plugin/run/async";
pub const TASK_UPDATE_PROGRESS: &str = "/task/update/progress";
pub const TASK_SUBSCRIBE_PROGRESS: &str = "/task/subscribe/progress";
pub const RESPONSE: &str = "/response";

/// 在连接读循环内按到达顺序处理的端点：都是不阻塞的短操作，且顺序有意义
/// （进度、关联回复、注册与更新）。其余操作可能运行很久，派生独立任务处理。
pub fn is_ordered(url: &str) -> bool {
    matches!(
        url,
        RESPONSE
            | TASK_UPDATE_PROGRESS
            | TASK_SUBSCRIBE_PROGRESS
            | TASK_QUERY
            | AGENT_REGISTER
            | AGENT_UPDATE_PERFORMANCE
            | AGENT_UPDATE_PLUGINS
            | AGENT_LIST
    )
}

#[derive(Deserialize)]
struct Route {
    #[serde(default)]
    url: String,
}

/// 只解析帧的 `url` 字段；无法解析时返回 None
pub fn peek_url(text: &str) -> Option<String> {
    serde_json::from_str::<Route>(text).ok().map(|r| r.url)
}

/// 通道信封
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    /// 远端操作
    #[serde(default)]
    pub url: String,
    /// 回复端点（请求方填写，通常为 `/response`）
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response: Option<String>,
    /// 关联 ID
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub websocket_session_id: Option<String>,
    /// 其余字段
    #[serde(flatten)]
    pub payload: Map<String, Value>,
}

impl Envelope {
    /// 单向消息（无需回复）
    pub fn new(url: &str) -> Self {
        Self {
            url: url.to_string(),
            ..Default::default()
        }
    }

    /// 需要回复的请求：填入通用回复端点与关联 ID
    pub fn request(url: &str, correlation_id: &str) -> Self {
        Self {
            url: url.to_string(),
            response: Some(RESPONSE.to_string()),
            websocket_session_id: Some(correlation_id.to_string()),
            payload: Map::new(),
        }
    }

    /// 针对本请求构造回复信封；请求未指定回复端点时返回 None
    pub fn reply(&self) -> Option<Envelope> {
        let url = self.response.clone()?;
        Some(Envelope {
            url,
            response: None,
            websocket_session_id: self.websocket_session_id.clone(),
            payload: Map::new(),
        })
    }

    pub fn with(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.payload.insert(key.to_string(), value.into());
        self
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.payload.get(key)
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.payload.get(key).and_then(|v| v.as_str())
    }

    pub fn parse(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }

    pub fn to_text(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }

    /// 回复的有效载荷（去掉路由字段后的对象）
    pub fn into_payload(self) -> Value {
        Value::Object(self.payload)
    }
}
