use std::fmt;

/// 一个上游 API Key。
///
/// `index` 是它在凭据池中的位置，用作用量统计的键；`secret` 只在发起请求时使用，
/// 任何日志/调试输出都只展示 `masked()` 的结果。
#[derive(Clone, PartialEq, Eq)]
pub struct Credential {
    pub index: usize,
    secret: String,
}

impl Credential {
    pub fn new(index: usize, secret: impl Into<String>) -> Self {
        Self {
            index,
            secret: secret.into(),
        }
    }

    pub fn secret(&self) -> &str {
        &self.secret
    }

    /// 仅保留末尾 4 个字符，例如 `***a1b2`。
    pub fn masked(&self) -> String {
        let chars: Vec<char> = self.secret.chars().collect();
        if chars.len() <= 4 {
            return "***".to_string();
        }
        let tail: String = chars[chars.len() - 4..].iter().collect();
        format!("***{tail}")
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("index", &self.index)
            .field("secret", &self.masked())
            .finish()
    }
}
