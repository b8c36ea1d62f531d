use super::types::{ConversationTurn, HistoryEntry, Role};
use crate::error::PreconditionError;

/// 规整会话：
/// 1. 过滤掉 `user` / `model` 以外的角色；
/// 2. 丢弃开头的 `model` 轮次（上游要求对话以 user 开头）；
/// 3. 追加新消息作为 `user` 轮次。
///
/// 新消息为空时直接报错，不会进入任何网络请求。
pub fn normalize(
    history: &[HistoryEntry],
    new_message: &str,
) -> Result<Vec<ConversationTurn>, PreconditionError> {
    if new_message.is_empty() {
        return Err(PreconditionError::EmptyMessage);
    }

    let mut out: Vec<ConversationTurn> = Vec::with_capacity(history.len() + 1);
    for entry in history {
        let Some(role) = Role::parse(&entry.role) else {
            continue;
        };
        if out.is_empty() && role == Role::Model {
            continue;
        }
        out.push(ConversationTurn::new(role, entry.text()));
    }

    out.push(ConversationTurn::user(new_message));
    Ok(out)
}
