use serde::{Deserialize, Serialize};

/**
 * \brief 角色（Character）配置模型。
 */
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Character {
    /** \brief 自增主键 */
    pub id: i64,
    /** \brief 角色显示名称，历史消息按该名称匹配归属 */
    pub name: String,
    /** \brief 系统提示词 */
    pub system_prompt: String,
    /** \brief Ollama 服务地址 */
    pub ollama_url: String,
    /** \brief Ollama API Key（可选，明文存储，M1 阶段可接受） */
    pub ollama_api_key: Option<String>,
    /** \brief 模型名 */
    pub ollama_model: String,
}

/**
 * \brief 持久化的聊天消息。
 */
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    /** \brief 自增主键 */
    pub id: i64,
    /** \brief 消息正文 */
    pub content: String,
    /** \brief 发送者名称（自由文本，与角色名按字符串匹配归属） */
    pub sender_name: String,
    /** \brief 创建时间（RFC 3339） */
    pub created_at: String,
    /** \brief 最后更新时间（RFC 3339） */
    pub updated_at: String,
}

/**
 * \brief 对话消息结构，与 Ollama Chat 消息格式对齐。
 */
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    /** \brief 角色：system/user/assistant */
    pub role: String,
    /** \brief 内容 */
    pub content: String,
}

impl ChatMessage {
    pub fn new(role: &str, content: impl Into<String>) -> Self {
        Self {
            role: role.to_string(),
            content: content.into(),
        }
    }
}
