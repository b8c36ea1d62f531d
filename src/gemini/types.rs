use crate::conversation::ConversationTurn;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerateRequest {
    pub contents: Vec<Content>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system_instruction: Option<SystemInstruction>,
}

impl GenerateRequest {
    pub fn new(messages: &[ConversationTurn], system_instruction: &str) -> Self {
        let contents = messages
            .iter()
            .map(|m| Content {
                role: m.role.as_str().to_string(),
                parts: vec![Part {
                    text: m.text.clone(),
                }],
            })
            .collect();
        let system_instruction = (!system_instruction.trim().is_empty()).then(|| {
            SystemInstruction {
                parts: vec![Part {
                    text: system_instruction.to_string(),
                }],
            }
        });
        Self {
            contents,
            system_instruction,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Content {
    #[serde(skip_serializing_if = "String::is_empty", default)]
    pub role: String,
    #[serde(default)]
    pub parts: Vec<Part>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Part {
    #[serde(default)]
    pub text: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct SystemInstruction {
    pub parts: Vec<Part>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerateResponse {
    #[serde(default)]
    pub candidates: Vec<Candidate>,
    #[serde(default)]
    pub prompt_feedback: Option<PromptFeedback>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Candidate {
    #[serde(default)]
    pub content: Option<Content>,
    #[serde(default)]
    pub finish_reason: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PromptFeedback {
    #[serde(default)]
    pub block_reason: Option<String>,
}

impl GenerateResponse {
    /// 仅认 `candidates[0].content.parts[0].text`，其余形态一律视为无回复。
    pub fn reply_text(&self) -> Option<&str> {
        let text = self
            .candidates
            .first()?
            .content
            .as_ref()?
            .parts
            .first()?
            .text
            .as_str();
        if text.is_empty() { None } else { Some(text) }
    }

    /// 无回复时给出的诊断原因（拦截原因或结束原因）。
    pub fn empty_reason(&self) -> String {
        if let Some(r) = self
            .prompt_feedback
            .as_ref()
            .and_then(|f| f.block_reason.as_deref())
        {
            return format!("blockReason={r}");
        }
        if let Some(r) = self
            .candidates
            .first()
            .and_then(|c| c.finish_reason.as_deref())
        {
            return format!("finishReason={r}");
        }
        "empty response".to_string()
    }
}
