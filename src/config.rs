use figment::Figment;
use figment::providers::Env;
use serde::Deserialize;
use std::path::{Path, PathBuf};

const DEFAULT_HOST: &str = "0.0.0.0";
const DEFAULT_PORT: u16 = 3000;
const DEFAULT_TIMEOUT_MS: u64 = 120_000;
const DEFAULT_ATTEMPT_TIMEOUT_MS: u64 = 60_000;
const DEFAULT_USER_AGENT: &str = "gemini-relay/0.1";
const DEFAULT_BASE_URL: &str = "https://generativelanguage.googleapis.com";
/// Gemini 免费额度按太平洋时间零点重置。
const DEFAULT_QUOTA_RESET_UTC_OFFSET: i32 = -8;

pub const DEFAULT_SYSTEM_INSTRUCTION: &str = "You are a helpful assistant. Answer clearly and concisely, and use Markdown when it improves readability.";

/// 默认模型目录：顺序即回退优先级。
pub const DEFAULT_MODELS: &[(&str, u32)] = &[
    ("gemini-2.5-flash", 20),
    ("gemini-2.5-flash-lite", 20),
    ("gemini-2.0-flash", 200),
    ("gemini-2.0-flash-lite", 200),
];

#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,

    pub api_keys: Vec<String>,
    pub models: Vec<(String, u32)>,

    pub base_url: String,
    pub system_instruction: String,
    pub api_user_agent: String,
    pub timeout_ms: u64,
    pub attempt_timeout_ms: u64,
    pub proxy: String,

    pub quota_reset_utc_offset: i32,

    pub debug: String,
}

#[derive(Debug, Default, Deserialize)]
struct RawEnv {
    #[serde(alias = "HOST")]
    host: Option<String>,
    #[serde(alias = "PORT")]
    port: Option<u16>,

    #[serde(alias = "GEMINI_API_KEYS")]
    gemini_api_keys: Option<String>,
    #[serde(alias = "GEMINI_API_KEY")]
    gemini_api_key: Option<String>,
    #[serde(alias = "MODELS")]
    models: Option<String>,

    #[serde(alias = "GEMINI_BASE_URL")]
    gemini_base_url: Option<String>,
    #[serde(alias = "SYSTEM_INSTRUCTION")]
    system_instruction: Option<String>,
    #[serde(alias = "API_USER_AGENT")]
    api_user_agent: Option<String>,
    #[serde(alias = "TIMEOUT")]
    timeout: Option<u64>,
    #[serde(alias = "ATTEMPT_TIMEOUT")]
    attempt_timeout: Option<u64>,
    #[serde(alias = "PROXY")]
    proxy: Option<String>,

    #[serde(alias = "QUOTA_RESET_UTC_OFFSET")]
    quota_reset_utc_offset: Option<i32>,

    #[serde(alias = "DEBUG")]
    debug: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: DEFAULT_HOST.to_string(),
            port: DEFAULT_PORT,
            api_keys: Vec::new(),
            models: default_models(),
            base_url: DEFAULT_BASE_URL.to_string(),
            system_instruction: DEFAULT_SYSTEM_INSTRUCTION.to_string(),
            api_user_agent: DEFAULT_USER_AGENT.to_string(),
            timeout_ms: DEFAULT_TIMEOUT_MS,
            attempt_timeout_ms: DEFAULT_ATTEMPT_TIMEOUT_MS,
            proxy: String::new(),
            quota_reset_utc_offset: DEFAULT_QUOTA_RESET_UTC_OFFSET,
            debug: String::new(),
        }
    }
}

impl Config {
    pub fn load() -> Self {
        load_dotenv();

        let raw = Figment::from(Env::raw())
            .extract::<RawEnv>()
            .unwrap_or_default();

        let mut api_keys = parse_api_keys(raw.gemini_api_keys.as_deref());
        api_keys.extend(parse_api_keys(raw.gemini_api_key.as_deref()));

        let models = parse_models(raw.models.as_deref()).unwrap_or_else(default_models);

        let mut cfg = Self {
            host: raw.host.unwrap_or_else(|| DEFAULT_HOST.to_string()),
            port: raw.port.unwrap_or(DEFAULT_PORT),
            api_keys,
            models,
            base_url: raw
                .gemini_base_url
                .map(|s| s.trim().trim_end_matches('/').to_string())
                .filter(|s| !s.is_empty())
                .unwrap_or_else(|| DEFAULT_BASE_URL.to_string()),
            system_instruction: raw
                .system_instruction
                .filter(|s| !s.trim().is_empty())
                .unwrap_or_else(|| DEFAULT_SYSTEM_INSTRUCTION.to_string()),
            api_user_agent: raw
                .api_user_agent
                .filter(|s| !s.trim().is_empty())
                .unwrap_or_else(|| DEFAULT_USER_AGENT.to_string()),
            timeout_ms: raw.timeout.unwrap_or(DEFAULT_TIMEOUT_MS),
            attempt_timeout_ms: raw.attempt_timeout.unwrap_or(DEFAULT_ATTEMPT_TIMEOUT_MS),
            proxy: raw.proxy.unwrap_or_default(),
            quota_reset_utc_offset: raw
                .quota_reset_utc_offset
                .unwrap_or(DEFAULT_QUOTA_RESET_UTC_OFFSET)
                .clamp(-14, 14),
            debug: raw.debug.unwrap_or_default(),
        };

        // 命令行覆盖：-debug <level>
        let mut args = std::env::args().skip(1);
        while let Some(arg) = args.next() {
            if arg == "-debug"
                && let Some(v) = args.next()
            {
                cfg.debug = v;
            }
        }

        cfg
    }

    pub fn log_level(&self) -> crate::logging::LogLevel {
        crate::logging::LogLevel::parse(&self.debug)
    }
}

fn default_models() -> Vec<(String, u32)> {
    DEFAULT_MODELS
        .iter()
        .map(|(id, limit)| (id.to_string(), *limit))
        .collect()
}

/// 解析 API Key 列表：逗号、空白、换行均可作为分隔符，保持原有顺序并去重。
fn parse_api_keys(value: Option<&str>) -> Vec<String> {
    let Some(value) = value else {
        return Vec::new();
    };
    let mut out: Vec<String> = Vec::new();
    for part in value.split(|c: char| c == ',' || c.is_whitespace()) {
        let p = part.trim();
        if p.is_empty() || out.iter().any(|k| k == p) {
            continue;
        }
        out.push(p.to_string());
    }
    out
}

/// 解析模型目录：`id:limit,id:limit`，格式非法的条目跳过。
fn parse_models(value: Option<&str>) -> Option<Vec<(String, u32)>> {
    let value = value?;
    let mut out = Vec::new();
    for part in value.split(',') {
        let p = part.trim();
        if p.is_empty() {
            continue;
        }
        let Some((id, limit)) = p.rsplit_once(':') else {
            continue;
        };
        let id = id.trim();
        let Ok(limit) = limit.trim().parse::<u32>() else {
            continue;
        };
        if id.is_empty() {
            continue;
        }
        out.push((id.to_string(), limit));
    }
    if out.is_empty() { None } else { Some(out) }
}

fn load_dotenv() {
    let Some(dotenv_path) = find_dotenv_path() else {
        return;
    };

    let Ok(file) = std::fs::File::open(&dotenv_path) else {
        return;
    };

    let reader = std::io::BufReader::new(file);
    for line in std::io::BufRead::lines(reader).map_while(Result::ok) {
        let Some((key, value)) = parse_dotenv_line(&line) else {
            continue;
        };
        // 已存在的进程环境变量优先于 .env。
        if std::env::var_os(&key).is_some() {
            continue;
        }
        // Rust 2024：修改进程环境变量在并发场景下可能触发 UB，因此 API 为 unsafe。
        // 这里在启动阶段、运行时尚未派生其他线程前加载 .env，符合使用前提。
        unsafe {
            std::env::set_var(key, value);
        }
    }
}

fn find_dotenv_path() -> Option<PathBuf> {
    let cwd = std::env::current_dir().ok()?;
    let mut dir: &Path = cwd.as_path();

    loop {
        let candidate = dir.join(".env");
        if candidate.is_file() {
            return Some(candidate);
        }

        // 避免跨越仓库根目录：发现 Cargo.toml 或 .git 即停止向上寻找。
        if dir.join("Cargo.toml").is_file() || dir.join(".git").is_dir() {
            return None;
        }

        let Some(parent) = dir.parent() else {
            break;
        };
        if parent == dir {
            break;
        }
        dir = parent;
    }

    None
}

fn parse_dotenv_line(line: &str) -> Option<(String, String)> {
    let mut line = line.trim();
    if line.is_empty() || line.starts_with('#') {
        return None;
    }

    if let Some(rest) = line.strip_prefix("export ") {
        line = rest.trim_start();
    }

    let eq_idx = line.find('=')?;
    if eq_idx == 0 {
        return None;
    }

    let key = line[..eq_idx].trim();
    if key.is_empty() {
        return None;
    }

    let raw = line[eq_idx + 1..].trim();
    if raw.is_empty() {
        return Some((key.to_string(), String::new()));
    }

    let bytes = raw.as_bytes();
    if bytes.len() >= 2 {
        let first = bytes[0];
        let last = bytes[bytes.len() - 1];
        if (first == b'"' && last == b'"') || (first == b'\'' && last == b'\'') {
            return Some((key.to_string(), raw[1..raw.len() - 1].to_string()));
        }
    }

    Some((key.to_string(), strip_inline_comment(raw).trim().to_string()))
}

fn strip_inline_comment(value: &str) -> &str {
    let bytes = value.as_bytes();
    for i in 0..bytes.len() {
        if bytes[i] != b'#' {
            continue;
        }
        if i == 0 || bytes[i - 1] == b' ' || bytes[i - 1] == b'\t' {
            return value[..i].trim_end();
        }
    }
    value
}
