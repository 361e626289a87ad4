use serde::Serialize;
use simd_json::owned::{Object, Value};

/// 消息段 (Segment)
#[derive(Debug, Serialize, Clone)]
pub struct Segment {
    #[serde(rename = "type")]
    pub type_: String,
    pub data: Object,
}

impl Segment {
    pub fn new(type_: &str, data: Object) -> Self {
        Self {
            type_: type_.to_string(),
            data,
        }
    }

    fn into_value(self) -> Value {
        let mut obj = Object::new();
        obj.insert("type".into(), Value::from(self.type_));
        obj.insert("data".into(), Value::from(self.data));
        Value::from(obj)
    }
}

/// 消息链 (Message Chain)
#[derive(Debug, Serialize, Clone, Default)]
pub struct Message(Vec<Segment>);

impl Message {
    pub fn new() -> Self {
        Self::default()
    }

    /// 通用添加方法：手动构建 Segment
    pub fn add(mut self, type_: &str, data: Object) -> Self {
        self.0.push(Segment::new(type_, data));
        self
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn segments(&self) -> &[Segment] {
        &self.0
    }

    /// 转为 OneBot 消息数组
    pub fn into_value(self) -> Value {
        Value::from(
            self.0
                .into_iter()
                .map(Segment::into_value)
                .collect::<Vec<_>>(),
        )
    }

    /// 纯文本
    pub fn text(self, text: impl Into<String>) -> Self {
        let mut data = Object::new();
        data.insert("text".into(), Value::from(text.into()));
        self.add("text", data)
    }

    // ================== 媒体资源类 ==================

    /// 图片
    /// - `file`: URL、`base64://`、data URI 或 `file://` 路径
    pub fn image(self, file: impl Into<String>) -> Self {
        self.add_file("image", file.into())
    }

    /// 语音
    pub fn record(self, file: impl Into<String>) -> Self {
        self.add_file("record", file.into())
    }

    /// 视频
    pub fn video(self, file: impl Into<String>) -> Self {
        self.add_file("video", file.into())
    }

    fn add_file(self, type_: &str, file: String) -> Self {
        let mut data = Object::new();
        data.insert("file".into(), Value::from(file));
        self.add(type_, data)
    }

    // ================== 互动/艾特类 ==================

    /// @某人
    pub fn at(self, user_id: impl ToString) -> Self {
        let mut data = Object::new();
        data.insert("qq".into(), Value::from(user_id.to_string()));
        self.add("at", data)
    }

    /// 回复消息
    pub fn reply(self, message_id: impl ToString) -> Self {
        let mut data = Object::new();
        data.insert("id".into(), Value::from(message_id.to_string()));
        self.add("reply", data)
    }

    // ================== 转发节点类 ==================

    /// 转发消息节点 - 自定义内容
    /// - `user_id`: 发送者 QQ
    /// - `nickname`: 发送者昵称
    /// - `content`: 消息内容 (Message 链)
    pub fn node_custom(
        self,
        user_id: impl ToString,
        nickname: impl Into<String>,
        content: Message,
    ) -> Self {
        let mut data = Object::new();
        data.insert("user_id".into(), Value::from(user_id.to_string()));
        data.insert("nickname".into(), Value::from(nickname.into()));
        data.insert("content".into(), content.into_value());
        self.add("node", data)
    }
}

// 允许直接从字符串字面量转换为纯文本消息
impl From<&str> for Message {
    fn from(s: &str) -> Self {
        Message::new().text(s)
    }
}

impl From<String> for Message {
    fn from(s: String) -> Self {
        Message::new().text(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use simd_json::derived::{ValueObjectAccess, ValueObjectAccessAsScalar};
    use simd_json::base::ValueAsArray;

    #[test]
    fn chain_serializes_as_segment_array() {
        let msg = Message::new().reply(42).at(10001).text(" hi");
        let value = msg.into_value();
        let arr = value.as_array().unwrap();
        assert_eq!(arr.len(), 3);
        assert_eq!(arr[0].get_str("type"), Some("reply"));
        assert_eq!(arr[0].get("data").and_then(|d| d.get_str("id")), Some("42"));
        assert_eq!(arr[1].get("data").and_then(|d| d.get_str("qq")), Some("10001"));
    }

    #[test]
    fn forward_node_embeds_content() {
        let inner = Message::new().image("https://a/b.png");
        let node = Message::new().node_custom(1, "bot", inner).into_value();
        let content = node.as_array().unwrap()[0]
            .get("data")
            .and_then(|d| d.get("content"))
            .and_then(|c| c.as_array())
            .unwrap();
        assert_eq!(content[0].get_str("type"), Some("image"));
    }
}
