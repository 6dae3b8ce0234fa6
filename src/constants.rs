// Wire-level constants shared across the proxy.

pub const UPSTREAM_BASE_URL: &str = "https://www.k2think.ai";
pub const DEFAULT_CHAT_URL: &str = "https://www.k2think.ai/api/chat/completions";
pub const DEFAULT_LOGIN_URL: &str = "https://www.k2think.ai/api/v1/auths/signin";

pub const DEFAULT_MODEL_ID: &str = "MBZUAI-IFM/K2-Think";
pub const MODEL_OWNER: &str = "MBZUAI";
// Requesting "<model>-nothink" suppresses thinking output for that request.
pub const NOTHINK_SUFFIX: &str = "-nothink";

pub const THINK_OPEN: &str = "<think>";
pub const THINK_CLOSE: &str = "</think>";
pub const ANSWER_OPEN: &str = "<answer>";
pub const ANSWER_CLOSE: &str = "</answer>";

// The upstream fingerprints browsers on login; this UA matches the web
// client the service expects.
pub const USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/140.0.0.0 Safari/537.36 Edg/140.0.0.0";
