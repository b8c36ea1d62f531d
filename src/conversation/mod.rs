//! 会话规整：把客户端传来的历史 + 新消息整理成上游需要的有序消息列表。

mod normalize;
mod types;

pub use normalize::normalize;
pub use types::{ConversationTurn, HistoryEntry, HistoryPart, Role};
