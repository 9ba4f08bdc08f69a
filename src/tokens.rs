//! Token counting for working-memory budgets
//!
//! Uses tiktoken-rs for accurate counts with explicit error handling: an
//! unknown model with no encoding override is an error, never a silent
//! chars/4 fallback.

use tiktoken_rs::CoreBPE;

use crate::error::{BraidError, Result};

/// Supported encoding types for token counting
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenEncoding {
    /// cl100k_base - GPT-4, GPT-4-turbo, text-embedding-3-*
    Cl100kBase,
    /// o200k_base - GPT-4o, GPT-4o-mini
    O200kBase,
}

impl TokenEncoding {
    pub fn as_str(&self) -> &'static str {
        match self {
            TokenEncoding::Cl100kBase => "cl100k_base",
            TokenEncoding::O200kBase => "o200k_base",
        }
    }
}

/// Detect the appropriate encoding for a model name
pub fn detect_encoding(model: &str) -> Option<TokenEncoding> {
    let model_lower = model.to_lowercase();

    if model_lower.contains("gpt-4o") {
        return Some(TokenEncoding::O200kBase);
    }

    if model_lower.contains("gpt-4") || model_lower.contains("gpt-3.5") {
        return Some(TokenEncoding::Cl100kBase);
    }

    // Claude's actual tokenizer is different but cl100k is close enough
    // for budgeting
    if model_lower.contains("claude") {
        return Some(TokenEncoding::Cl100kBase);
    }

    if let Some(stripped) = model_lower.strip_prefix("openai/") {
        return detect_encoding(stripped);
    }
    if model_lower.starts_with("anthropic/") {
        return Some(TokenEncoding::Cl100kBase);
    }

    None
}

/// Parse encoding string to TokenEncoding
pub fn parse_encoding(encoding: &str) -> Option<TokenEncoding> {
    match encoding.to_lowercase().as_str() {
        "cl100k_base" | "cl100k" => Some(TokenEncoding::Cl100kBase),
        "o200k_base" | "o200k" => Some(TokenEncoding::O200kBase),
        _ => None,
    }
}

/// Resolve the encoding from an optional override plus a model name
pub fn resolve_encoding(model: &str, encoding: Option<&str>) -> Result<TokenEncoding> {
    if let Some(enc) = encoding {
        parse_encoding(enc).ok_or_else(|| {
            BraidError::Config(format!(
                "Unknown encoding '{}'. Supported: cl100k_base, o200k_base",
                enc
            ))
        })
    } else {
        detect_encoding(model).ok_or_else(|| {
            BraidError::Config(format!(
                "Unknown model '{}'. Provide an encoding override (cl100k_base or o200k_base) \
                 or use a known model (gpt-4, gpt-4o, claude-*).",
                model
            ))
        })
    }
}

/// A reusable token counter bound to one encoding
pub struct TokenCounter {
    bpe: CoreBPE,
    encoding: TokenEncoding,
}

impl TokenCounter {
    /// Build a counter for the given model/encoding pair
    pub fn new(model: &str, encoding: Option<&str>) -> Result<Self> {
        let token_encoding = resolve_encoding(model, encoding)?;

        let bpe = match token_encoding {
            TokenEncoding::Cl100kBase => tiktoken_rs::cl100k_base(),
            TokenEncoding::O200kBase => tiktoken_rs::o200k_base(),
        }
        .map_err(|e| BraidError::Internal(format!("Failed to initialize tokenizer: {}", e)))?;

        Ok(Self {
            bpe,
            encoding: token_encoding,
        })
    }

    /// Count tokens in a piece of text
    pub fn count(&self, text: &str) -> i64 {
        self.bpe.encode_with_special_tokens(text).len() as i64
    }

    pub fn encoding(&self) -> TokenEncoding {
        self.encoding
    }
}
