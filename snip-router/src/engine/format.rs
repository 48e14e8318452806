//! Labelling and cleaning of AI responses, plus the output-format
//! instructions appended to AI requests.

use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use crate::ai::AiResponse;
use crate::types::ResultType;

lazy_static! {
    static ref FENCED_BLOCK: Regex =
        Regex::new(r"^```(?:katex|md|markdown|html|xml|json|text)?\n([\s\S]*?)\n```$").unwrap();
    static ref LEADING_TAG: Regex = Regex::new(r"^\s*<[^>]+>").unwrap();
    static ref INDENTED: Regex = Regex::new(r"^\s{4,}").unwrap();
    static ref HTML_TAG: Regex = Regex::new(r"<[a-zA-Z][^>]*>").unwrap();
    static ref MARKDOWN_PATTERNS: Vec<Regex> = vec![
        Regex::new(r"^---[\s\S]+?---").unwrap(),
        Regex::new(r"(?m)^#{1,6}\s+.+$").unwrap(),
        Regex::new(r"(?m)^\s*[-*+]\s+\S+").unwrap(),
        Regex::new(r"(?m)^\s*\d+\.\s+\S+").unwrap(),
        Regex::new(r"`{1,3}[^`]*`{1,3}").unwrap(),
        Regex::new(r"\[([^\]]+)\]\(([^)]+)\)").unwrap(),
        Regex::new(r"!\[([^\]]+)\]\(([^)]+)\)").unwrap(),
    ];
}

/// Response fields that mark a structured recognition payload
const STRUCTURED_FIELDS: [&str; 6] = [
    "recognized_data",
    "verbose_data",
    "keywords_and_tags",
    "confidence",
    "suggested_type",
    "using_ready",
];

/// Output format requested from recognition
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RecognitionFormat {
    #[default]
    Auto,
    MostSuitable,
    MostOptimized,
    MostLegibility,
    Markdown,
    Html,
    Text,
    Json,
}

impl RecognitionFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            RecognitionFormat::Auto => "auto",
            RecognitionFormat::MostSuitable => "most-suitable",
            RecognitionFormat::MostOptimized => "most-optimized",
            RecognitionFormat::MostLegibility => "most-legibility",
            RecognitionFormat::Markdown => "markdown",
            RecognitionFormat::Html => "html",
            RecognitionFormat::Text => "text",
            RecognitionFormat::Json => "json",
        }
    }

    pub fn instruction(&self) -> &'static str {
        match self {
            RecognitionFormat::Auto => "Output the content in the most appropriate format (markdown is preferred for structured content).",
            RecognitionFormat::MostSuitable => "Analyze the content and output it in the most suitable format for its type and structure. Choose the format that best represents the content's nature and purpose.",
            RecognitionFormat::MostOptimized => "Output the content in the most optimized format for storage and transmission efficiency. Prefer compact representations while maintaining essential information.",
            RecognitionFormat::MostLegibility => "Output the content in the most human-readable and legible format. Prioritize clarity, readability, and ease of understanding over compactness.",
            RecognitionFormat::Markdown => "Output the recognized content in Markdown format.",
            RecognitionFormat::Html => "Output the recognized content in HTML format.",
            RecognitionFormat::Text => "Output the recognized content as plain text.",
            RecognitionFormat::Json => "Output the recognized content as structured JSON data.",
        }
    }
}

/// Output format requested from processing
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProcessingFormat {
    #[default]
    Markdown,
    Html,
    Json,
    Text,
    Xml,
    Yaml,
    Typescript,
    Javascript,
    Python,
    Java,
    Cpp,
    Csharp,
    Php,
    Ruby,
    Go,
    Rust,
    Css,
    Scss,
}

impl ProcessingFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProcessingFormat::Markdown => "markdown",
            ProcessingFormat::Html => "html",
            ProcessingFormat::Json => "json",
            ProcessingFormat::Text => "text",
            ProcessingFormat::Xml => "xml",
            ProcessingFormat::Yaml => "yaml",
            ProcessingFormat::Typescript => "typescript",
            ProcessingFormat::Javascript => "javascript",
            ProcessingFormat::Python => "python",
            ProcessingFormat::Java => "java",
            ProcessingFormat::Cpp => "cpp",
            ProcessingFormat::Csharp => "csharp",
            ProcessingFormat::Php => "php",
            ProcessingFormat::Ruby => "ruby",
            ProcessingFormat::Go => "go",
            ProcessingFormat::Rust => "rust",
            ProcessingFormat::Css => "css",
            ProcessingFormat::Scss => "scss",
        }
    }

    /// Display name of code-output formats
    fn language_name(&self) -> Option<&'static str> {
        Some(match self {
            ProcessingFormat::Typescript => "TypeScript",
            ProcessingFormat::Javascript => "JavaScript",
            ProcessingFormat::Python => "Python",
            ProcessingFormat::Java => "Java",
            ProcessingFormat::Cpp => "C++",
            ProcessingFormat::Csharp => "C#",
            ProcessingFormat::Php => "PHP",
            ProcessingFormat::Ruby => "Ruby",
            ProcessingFormat::Go => "Go",
            ProcessingFormat::Rust => "Rust",
            ProcessingFormat::Css => "CSS",
            ProcessingFormat::Scss => "SCSS",
            _ => return None,
        })
    }

    pub fn instruction(&self) -> String {
        if let Some(language) = self.language_name() {
            return format!("Output the processed result as {} code.", language);
        }
        match self {
            ProcessingFormat::Html => "Output the processed result in HTML format.",
            ProcessingFormat::Xml => "Output the processed result in XML format.",
            ProcessingFormat::Yaml => "Output the processed result in YAML format.",
            ProcessingFormat::Json => "Output the processed result as structured JSON data.",
            ProcessingFormat::Text => "Output the processed result as plain text.",
            _ => "Output the processed result in Markdown format.",
        }
        .to_string()
    }
}

fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::String(s) => !s.is_empty(),
        Value::Number(n) => n.as_f64().map_or(false, |f| f != 0.0),
        Value::Array(_) | Value::Object(_) => true,
    }
}

/// The payload to inspect: `data` when present, else the whole response
fn effective_payload(response: &AiResponse) -> Value {
    if is_truthy(&response.data) {
        response.data.clone()
    } else {
        serde_json::to_value(response).unwrap_or(Value::Null)
    }
}

/// Label a response payload without re-parsing it downstream
pub fn detect_result_format(response: &AiResponse) -> ResultType {
    detect_value_format(&effective_payload(response))
}

pub fn detect_value_format(data: &Value) -> ResultType {
    match data {
        Value::Object(map) => {
            if STRUCTURED_FIELDS.iter().any(|f| map.contains_key(*f)) {
                return ResultType::Json;
            }
            let has_generic = ["content", "text", "message"]
                .iter()
                .any(|f| map.get(*f).map_or(false, is_truthy));
            if has_generic {
                ResultType::Markdown
            } else {
                ResultType::Json
            }
        }
        Value::String(s) => {
            if s.contains('\n') || s.contains('#') || s.contains('*') || s.contains('`') {
                ResultType::Markdown
            } else {
                ResultType::Text
            }
        }
        _ => ResultType::Json,
    }
}

/// Extract displayable text from a response and strip incidental fences
pub fn format_ai_result(response: &AiResponse) -> String {
    let content = if is_truthy(&response.data) {
        match &response.data {
            Value::String(s) => s.clone(),
            data => match data.get("recognized_data").filter(|v| is_truthy(v)) {
                Some(Value::Array(items)) => items
                    .iter()
                    .map(value_to_plain)
                    .collect::<Vec<_>>()
                    .join("\n\n"),
                Some(other) => value_to_plain(other),
                None => pretty(data),
            },
        }
    } else {
        pretty(&effective_payload(response))
    };

    unwrap_unwanted_code_blocks(&content)
}

fn value_to_plain(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn pretty(value: &Value) -> String {
    serde_json::to_string_pretty(value).unwrap_or_else(|_| value.to_string())
}

/// Remove a single outer fence around non-code content
pub fn unwrap_unwanted_code_blocks(content: &str) -> String {
    let Some(caps) = FENCED_BLOCK.captures(content.trim()) else {
        return content.to_string();
    };

    let unwrapped = caps[1].trim();
    let lines: Vec<&str> = unwrapped.split('\n').collect();

    let looks_like_markup = unwrapped.contains("<math")
        || unwrapped.contains("<span class=\"katex")
        || unwrapped.contains("<content")
        || (unwrapped.starts_with('<') && unwrapped.ends_with('>'))
        || LEADING_TAG.is_match(unwrapped);

    if lines.len() == 1 || looks_like_markup {
        debug!("Unwrapped unwanted code block formatting");
        return unwrapped.to_string();
    }

    let looks_like_code = lines.len() > 3
        || lines.iter().any(|line| {
            INDENTED.is_match(line)
                || line.contains("function")
                || line.contains("const ")
                || line.contains("let ")
        });
    if looks_like_code {
        return content.to_string();
    }

    debug!("Unwrapped unwanted code block formatting");
    unwrapped.to_string()
}

/// Whether shared text should be shown as markdown rather than analyzed
pub fn is_markdown_content(text: &str) -> bool {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return false;
    }
    if trimmed.starts_with('<') && trimmed.ends_with('>') {
        return false;
    }
    if HTML_TAG.is_match(trimmed) {
        return false;
    }
    MARKDOWN_PATTERNS.iter().any(|p| p.is_match(text))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn response(data: Value) -> AiResponse {
        AiResponse::success(data, Some("resp_1".into()))
    }

    #[test]
    fn test_detect_result_format() {
        assert_eq!(
            detect_result_format(&response(json!({"recognized_data": ["a"]}))),
            ResultType::Json
        );
        assert_eq!(
            detect_result_format(&response(json!({"content": "hello"}))),
            ResultType::Markdown
        );
        assert_eq!(
            detect_result_format(&response(json!({"other": 1}))),
            ResultType::Json
        );
        assert_eq!(
            detect_result_format(&response(json!("# Title"))),
            ResultType::Markdown
        );
        assert_eq!(
            detect_result_format(&response(json!("plain words"))),
            ResultType::Text
        );
        // Empty data falls back to the whole response object
        assert_eq!(detect_result_format(&response(json!(""))), ResultType::Json);
    }

    #[test]
    fn test_format_joins_recognized_data() {
        let result = response(json!({"recognized_data": ["first", "second"]}));
        assert_eq!(format_ai_result(&result), "first\n\nsecond");

        let single = response(json!({"recognized_data": "only"}));
        assert_eq!(format_ai_result(&single), "only");

        let other = response(json!({"a": 1}));
        assert_eq!(format_ai_result(&other), "{\n  \"a\": 1\n}");
    }

    #[test]
    fn test_unwraps_short_fenced_text() {
        let wrapped = "```markdown\nHello world\n```";
        assert_eq!(unwrap_unwanted_code_blocks(wrapped), "Hello world");

        let two_lines = "```text\nfirst line\nsecond line\n```";
        assert_eq!(unwrap_unwanted_code_blocks(two_lines), "first line\nsecond line");

        let markup = "```html\n<div>\n<p>x</p>\n</div>\n<br>\n```";
        assert_eq!(unwrap_unwanted_code_blocks(markup), "<div>\n<p>x</p>\n</div>\n<br>");
    }

    #[test]
    fn test_keeps_fenced_code() {
        let code = "```\nfunction add(a, b) {\n  return a + b;\n}\n```";
        assert_eq!(unwrap_unwanted_code_blocks(code), code);

        let rust = "```rust\nfn main() {}\n```";
        assert_eq!(unwrap_unwanted_code_blocks(rust), rust);

        let long = "```text\na\nb\nc\nd\n```";
        assert_eq!(unwrap_unwanted_code_blocks(long), long);
    }

    #[test]
    fn test_markdown_content_detection() {
        assert!(is_markdown_content("# Heading\nbody"));
        assert!(is_markdown_content("- item one\n- item two"));
        assert!(is_markdown_content("see [docs](https://example.com)"));
        assert!(!is_markdown_content("<div>hello</div>"));
        assert!(!is_markdown_content("text with <b>tags</b> inside"));
        assert!(!is_markdown_content("just a sentence"));
        assert!(!is_markdown_content("   "));
    }

    #[test]
    fn test_format_instructions() {
        assert!(RecognitionFormat::Auto
            .instruction()
            .starts_with("Output the content in the most appropriate format"));
        assert_eq!(
            ProcessingFormat::Cpp.instruction(),
            "Output the processed result as C++ code."
        );
        assert_eq!(
            ProcessingFormat::Yaml.instruction(),
            "Output the processed result in YAML format."
        );
        assert_eq!(
            ProcessingFormat::default().instruction(),
            "Output the processed result in Markdown format."
        );
    }
}
