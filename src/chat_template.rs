//! Chat Template Engine for Model-Specific Formatting
//!
//! Turns a raw user message into the exact prompt text a conversational model
//! expects, with the assistant generation prompt appended and reasoning
//! ("thinking") output disabled.
//!
//! # Sources
//!
//! - **HuggingFace**: the Jinja2 `chat_template` from the model's
//!   `tokenizer_config.json`, rendered with `minijinja`
//! - **ChatML**: built-in fallback (`<|im_start|>role\ncontent<|im_end|>`)
//!
//! # Example
//!
//! ```
//! use infergate::chat_template::{ChatMLTemplate, ChatTemplateEngine};
//!
//! let template = ChatMLTemplate::new();
//! let prompt = template.format_user("Hello!").expect("render");
//! assert_eq!(prompt, "<|im_start|>user\nHello!<|im_end|>\n<|im_start|>assistant\n");
//! ```

use std::{fs, path::Path};

use minijinja::{
    context,
    value::{from_args, Value},
    Environment, ErrorKind, State,
};
use serde::{Deserialize, Serialize};

use crate::error::{GatewayError, Result};

// ============================================================================
// Constants - Template Limits
// ============================================================================

/// Maximum template size in bytes (100KB)
pub const MAX_TEMPLATE_SIZE: usize = 100 * 1024;

/// File holding the model's chat template
pub const TOKENIZER_CONFIG_FILE: &str = "tokenizer_config.json";

/// Empty reasoning block emitted when thinking is disabled
const EMPTY_THINK_BLOCK: &str = "<think>\n\n</think>\n\n";

// ============================================================================
// Core Types
// ============================================================================

/// Chat message structure
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChatMessage {
    /// Role: "system", "user", "assistant", or custom
    pub role: String,
    /// Message content
    pub content: String,
}

impl ChatMessage {
    /// Create a new chat message
    #[must_use]
    pub fn new(role: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: role.into(),
            content: content.into(),
        }
    }

    /// Create a system message
    #[must_use]
    pub fn system(content: impl Into<String>) -> Self {
        Self::new("system", content)
    }

    /// Create a user message
    #[must_use]
    pub fn user(content: impl Into<String>) -> Self {
        Self::new("user", content)
    }
}

/// Template format enumeration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum TemplateFormat {
    /// ChatML format (Qwen, OpenHermes, Yi)
    #[default]
    ChatML,
    /// Jinja2 template shipped with the model
    Custom,
}

/// Special tokens exposed to templates
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpecialTokens {
    /// Beginning of sequence token
    pub bos_token: Option<String>,
    /// End of sequence token
    pub eos_token: Option<String>,
}

/// Chat template engine trait
pub trait ChatTemplateEngine: Send + Sync {
    /// Format a complete conversation, ending with the generation prompt
    ///
    /// # Errors
    ///
    /// Returns `TemplateError` if rendering fails
    fn format_conversation(&self, messages: &[ChatMessage]) -> Result<String>;

    /// Format a single user message
    ///
    /// # Errors
    ///
    /// Returns `TemplateError` if rendering fails
    fn format_user(&self, content: &str) -> Result<String> {
        self.format_conversation(&[ChatMessage::user(content)])
    }

    /// Get special tokens for this template
    fn special_tokens(&self) -> &SpecialTokens;

    /// Get the template format
    fn format(&self) -> TemplateFormat;
}

// ============================================================================
// HuggingFace Template (Jinja2-based)
// ============================================================================

/// `chat_template` is either one string or a list of named templates
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum ChatTemplateField {
    Single(String),
    Named(Vec<NamedTemplate>),
}

#[derive(Debug, Deserialize)]
struct NamedTemplate {
    name: String,
    template: String,
}

/// Special tokens are either plain strings or `AddedToken` objects
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum TokenField {
    Text(String),
    Added { content: String },
}

impl TokenField {
    fn into_content(self) -> String {
        match self {
            Self::Text(text) => text,
            Self::Added { content } => content,
        }
    }
}

/// HuggingFace tokenizer_config.json structure
#[derive(Debug, Deserialize)]
struct TokenizerConfig {
    chat_template: Option<ChatTemplateField>,
    bos_token: Option<TokenField>,
    eos_token: Option<TokenField>,
}

/// Jinja2-based Chat Template Engine
pub struct HuggingFaceTemplate {
    env: Environment<'static>,
    template_str: String,
    special_tokens: SpecialTokens,
    enable_thinking: bool,
}

impl std::fmt::Debug for HuggingFaceTemplate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HuggingFaceTemplate")
            .field("template_len", &self.template_str.len())
            .field("special_tokens", &self.special_tokens)
            .field("enable_thinking", &self.enable_thinking)
            .finish_non_exhaustive()
    }
}

impl HuggingFaceTemplate {
    /// Compile a Jinja2 chat template
    ///
    /// # Errors
    ///
    /// Returns `TemplateError` if the template is too large or does not parse
    pub fn new(template_str: String, special_tokens: SpecialTokens) -> Result<Self> {
        if template_str.len() > MAX_TEMPLATE_SIZE {
            return Err(GatewayError::TemplateError {
                reason: format!(
                    "Template is {} bytes, limit is {MAX_TEMPLATE_SIZE}",
                    template_str.len()
                ),
            });
        }

        let mut env = Environment::new();
        env.set_unknown_method_callback(python_string_method);
        env.add_function("raise_exception", raise_exception);
        env.add_template_owned("chat", template_str.clone())
            .map_err(|e| GatewayError::TemplateError {
                reason: format!("Invalid template syntax: {e}"),
            })?;

        Ok(Self {
            env,
            template_str,
            special_tokens,
            enable_thinking: false,
        })
    }

    /// Create from tokenizer_config.json content
    ///
    /// # Errors
    ///
    /// Returns `FormatError` for invalid JSON and `TemplateError` when no
    /// usable template is present
    pub fn from_json(json: &str) -> Result<Self> {
        Self::from_json_if_present(json)?.ok_or_else(|| GatewayError::TemplateError {
            reason: "No 'chat_template' found in config".to_string(),
        })
    }

    /// Like [`Self::from_json`], but `Ok(None)` when the config has no
    /// `chat_template` key
    ///
    /// # Errors
    ///
    /// Returns `FormatError` for invalid JSON and `TemplateError` for an
    /// empty template list or a template that does not compile
    pub fn from_json_if_present(json: &str) -> Result<Option<Self>> {
        let config: TokenizerConfig =
            serde_json::from_str(json).map_err(|e| GatewayError::FormatError {
                reason: format!("Invalid tokenizer config: {e}"),
            })?;

        let template_str = match config.chat_template {
            Some(ChatTemplateField::Single(template)) => template,
            Some(ChatTemplateField::Named(named)) => {
                let mut named = named.into_iter();
                let first = named.next();
                named
                    .find(|t| t.name == "default")
                    .or(first)
                    .map(|t| t.template)
                    .ok_or_else(|| GatewayError::TemplateError {
                        reason: "Empty 'chat_template' list in config".to_string(),
                    })?
            },
            None => return Ok(None),
        };

        let special_tokens = SpecialTokens {
            bos_token: config.bos_token.map(TokenField::into_content),
            eos_token: config.eos_token.map(TokenField::into_content),
        };

        Self::new(template_str, special_tokens).map(Some)
    }

    /// Toggle the template's `enable_thinking` flag
    #[must_use]
    pub fn with_thinking(mut self, enable: bool) -> Self {
        self.enable_thinking = enable;
        self
    }
}

impl ChatTemplateEngine for HuggingFaceTemplate {
    fn format_conversation(&self, messages: &[ChatMessage]) -> Result<String> {
        let tmpl = self
            .env
            .get_template("chat")
            .map_err(|e| GatewayError::TemplateError {
                reason: format!("Template error: {e}"),
            })?;

        let bos = self.special_tokens.bos_token.as_deref().unwrap_or("");
        let eos = self.special_tokens.eos_token.as_deref().unwrap_or("");

        tmpl.render(context!(
            messages => messages,
            add_generation_prompt => true,
            enable_thinking => self.enable_thinking,
            bos_token => bos,
            eos_token => eos
        ))
        .map_err(|e| GatewayError::TemplateError {
            reason: format!("Render error: {e}"),
        })
    }

    fn special_tokens(&self) -> &SpecialTokens {
        &self.special_tokens
    }

    fn format(&self) -> TemplateFormat {
        TemplateFormat::Custom
    }
}

fn raise_exception(message: String) -> std::result::Result<Value, minijinja::Error> {
    Err(minijinja::Error::new(ErrorKind::InvalidOperation, message))
}

/// Python `str` methods that HuggingFace templates call
fn python_string_method(
    _state: &State,
    value: &Value,
    method: &str,
    args: &[Value],
) -> std::result::Result<Value, minijinja::Error> {
    let Some(s) = value.as_str() else {
        return Err(minijinja::Error::from(ErrorKind::UnknownMethod));
    };

    match method {
        "startswith" => {
            let (prefix,): (&str,) = from_args(args)?;
            Ok(Value::from(s.starts_with(prefix)))
        },
        "endswith" => {
            let (suffix,): (&str,) = from_args(args)?;
            Ok(Value::from(s.ends_with(suffix)))
        },
        "strip" | "lstrip" | "rstrip" => {
            let (chars,): (Option<&str>,) = from_args(args)?;
            let matches = |c: char| chars.map_or(c.is_whitespace(), |set| set.contains(c));
            let out = match method {
                "lstrip" => s.trim_start_matches(matches),
                "rstrip" => s.trim_end_matches(matches),
                _ => s.trim_matches(matches),
            };
            Ok(Value::from(out))
        },
        "split" => {
            let (sep, maxsplit): (Option<&str>, Option<i64>) = from_args(args)?;
            let parts: Vec<Value> = match (sep, maxsplit) {
                (None, _) => s.split_whitespace().map(Value::from).collect(),
                (Some(sep), Some(max)) if max >= 0 => s
                    .splitn(usize::try_from(max).unwrap_or(usize::MAX).saturating_add(1), sep)
                    .map(Value::from)
                    .collect(),
                (Some(sep), _) => s.split(sep).map(Value::from).collect(),
            };
            Ok(Value::from(parts))
        },
        "upper" => Ok(Value::from(s.to_uppercase())),
        "lower" => Ok(Value::from(s.to_lowercase())),
        "replace" => {
            let (old, new): (&str, &str) = from_args(args)?;
            Ok(Value::from(s.replace(old, new)))
        },
        _ => Err(minijinja::Error::from(ErrorKind::UnknownMethod)),
    }
}

// ============================================================================
// Built-in ChatML
// ============================================================================

/// ChatML Template (Qwen, OpenHermes, Yi)
///
/// Format: `<|im_start|>{role}\n{content}<|im_end|>\n`
#[derive(Debug, Clone)]
pub struct ChatMLTemplate {
    special_tokens: SpecialTokens,
    empty_think_block: bool,
}

impl ChatMLTemplate {
    /// Create a new ChatML template with default tokens
    #[must_use]
    pub fn new() -> Self {
        Self {
            special_tokens: SpecialTokens {
                bos_token: Some("<|endoftext|>".to_string()),
                eos_token: Some("<|im_end|>".to_string()),
            },
            empty_think_block: false,
        }
    }

    /// ChatML for reasoning models with thinking disabled
    ///
    /// Appends an empty `<think>` block after the generation prompt.
    #[must_use]
    pub fn without_thinking() -> Self {
        Self {
            empty_think_block: true,
            ..Self::new()
        }
    }
}

impl Default for ChatMLTemplate {
    fn default() -> Self {
        Self::new()
    }
}

impl ChatTemplateEngine for ChatMLTemplate {
    fn format_conversation(&self, messages: &[ChatMessage]) -> Result<String> {
        use std::fmt::Write;
        let mut result = String::new();

        for msg in messages {
            let _ = write!(
                result,
                "<|im_start|>{}\n{}<|im_end|>\n",
                msg.role, msg.content
            );
        }

        result.push_str("<|im_start|>assistant\n");
        if self.empty_think_block {
            result.push_str(EMPTY_THINK_BLOCK);
        }

        Ok(result)
    }

    fn special_tokens(&self) -> &SpecialTokens {
        &self.special_tokens
    }

    fn format(&self) -> TemplateFormat {
        TemplateFormat::ChatML
    }
}

// ============================================================================
// Loading
// ============================================================================

/// Load the chat template for a local model directory
///
/// Uses `tokenizer_config.json` when it carries a `chat_template`; otherwise
/// falls back to built-in ChatML (with thinking disabled for Qwen3 models).
///
/// # Errors
///
/// Returns `IoError` if the config exists but cannot be read, and
/// `FormatError`/`TemplateError` if it is malformed
pub fn load_model_template(model_dir: &Path) -> Result<Box<dyn ChatTemplateEngine>> {
    let config_path = model_dir.join(TOKENIZER_CONFIG_FILE);
    if config_path.is_file() {
        let json = fs::read_to_string(&config_path).map_err(|e| GatewayError::IoError {
            message: format!("Failed to read {}: {e}", config_path.display()),
        })?;
        if let Some(template) = HuggingFaceTemplate::from_json_if_present(&json)? {
            tracing::info!(path = %config_path.display(), "Loaded model chat template");
            return Ok(Box::new(template.with_thinking(false)));
        }
        tracing::warn!(path = %config_path.display(), "Tokenizer config has no chat template");
    }

    let name = model_dir.to_string_lossy().to_lowercase();
    if name.contains("qwen3") {
        tracing::info!("Using built-in ChatML template (thinking disabled)");
        Ok(Box::new(ChatMLTemplate::without_thinking()))
    } else {
        tracing::info!("Using built-in ChatML template");
        Ok(Box::new(ChatMLTemplate::new()))
    }
}

// ============================================================================
// Tests
// ============================================================================
