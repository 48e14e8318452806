//! Built-in rule table.
//!
//! Within each source context, "text files used as-is" outranks "recognize"
//! which outranks "analyze". The chrome-extension and launch-queue source
//! rules sit above everything else so files handed over by the browser or
//! the OS never go through recognition when they are already text.

use async_trait::async_trait;
use std::sync::Arc;
use tracing::warn;

use super::format::{detect_result_format, format_ai_result, is_markdown_content};
use super::rules::{ExecutionRule, RuleProcessor, RuleRequest};
use super::EngineError;
use crate::ai::{AiInput, AiMessage, AiOptions, AiResponse, ContentPart, IntermediateRecognition};
use crate::types::{
    generate_id, ActionContext, ActionInput, DataCategory, InputFile, InputKind, ProcessedResult,
    ResultType, SourceContext,
};

/// Text that means "no instruction given" when it arrives as the analyze prompt
pub const DEFAULT_ANALYZE_PROMPT: &str = "Analyze and process the provided content intelligently";

/// The closed set of rules registered at startup
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BuiltinRule {
    WorkcenterTextFilesSource,
    WorkcenterFilesRecognize,
    WorkcenterTextAnalyze,
    ShareTargetTextFilesSource,
    ShareTargetImagesRecognize,
    ShareTargetMarkdownView,
    ShareTargetUrlAnalyze,
    ChromeExtensionTextFilesSource,
    ChromeExtensionScreenshotRecognize,
    LaunchQueueTextFilesSource,
    LaunchQueueFilesProcess,
}

/// Static description of a built-in rule
struct Descriptor {
    id: &'static str,
    name: &'static str,
    source: SourceContext,
    input_types: Vec<InputKind>,
    action: &'static str,
    priority: i32,
    auto_copy: bool,
}

impl BuiltinRule {
    pub const ALL: [BuiltinRule; 11] = [
        BuiltinRule::WorkcenterTextFilesSource,
        BuiltinRule::WorkcenterFilesRecognize,
        BuiltinRule::WorkcenterTextAnalyze,
        BuiltinRule::ShareTargetTextFilesSource,
        BuiltinRule::ShareTargetImagesRecognize,
        BuiltinRule::ShareTargetMarkdownView,
        BuiltinRule::ShareTargetUrlAnalyze,
        BuiltinRule::ChromeExtensionTextFilesSource,
        BuiltinRule::ChromeExtensionScreenshotRecognize,
        BuiltinRule::LaunchQueueTextFilesSource,
        BuiltinRule::LaunchQueueFilesProcess,
    ];

    fn descriptor(&self) -> Descriptor {
        use BuiltinRule::*;
        use InputKind::*;
        use SourceContext::*;

        let (id, name, source, input_types, action, priority, auto_copy) = match self {
            WorkcenterTextFilesSource => ("workcenter-text-files-source", "Work Center Text File Source", Workcenter, vec![Files], "source", 11, false),
            WorkcenterFilesRecognize => ("workcenter-files-recognize", "Work Center File Recognition", Workcenter, vec![Files, Image], "recognize", 10, false),
            WorkcenterTextAnalyze => ("workcenter-text-analyze", "Work Center Text Analysis", Workcenter, vec![Text, Markdown], "analyze", 9, false),
            ShareTargetTextFilesSource => ("share-target-text-files-source", "Share Target Text File Source", ShareTarget, vec![Files], "source", 16, false),
            ShareTargetImagesRecognize => ("share-target-images-recognize", "Share Target Image Recognition", ShareTarget, vec![Image, Files], "recognize", 15, true),
            ShareTargetMarkdownView => ("share-target-markdown-view", "Share Target Markdown View", ShareTarget, vec![Text, Markdown], "view", 14, false),
            ShareTargetUrlAnalyze => ("share-target-url-analyze", "Share Target URL Analysis", ShareTarget, vec![Url], "analyze", 13, true),
            ChromeExtensionTextFilesSource => ("chrome-extension-text-files-source", "Chrome Extension Text File Source", ChromeExtension, vec![Files], "source", 26, true),
            ChromeExtensionScreenshotRecognize => ("chrome-extension-screenshot-recognize", "Chrome Extension Screenshot Recognition", ChromeExtension, vec![Image], "recognize", 20, true),
            LaunchQueueTextFilesSource => ("launch-queue-text-files-source", "Launch Queue Text File Source", LaunchQueue, vec![Files], "source", 21, true),
            LaunchQueueFilesProcess => ("launch-queue-files-process", "Launch Queue File Processing", LaunchQueue, vec![Files, Mixed], "process", 12, true),
        };

        Descriptor {
            id,
            name,
            source,
            input_types,
            action,
            priority,
            auto_copy,
        }
    }

    pub fn id(&self) -> &'static str {
        self.descriptor().id
    }

    pub fn priority(&self) -> i32 {
        self.descriptor().priority
    }

    /// Applicability check evaluated after source and input kind match
    pub fn condition(&self, input: &ActionInput, _context: &ActionContext) -> bool {
        use BuiltinRule::*;
        match self {
            WorkcenterTextFilesSource
            | ShareTargetTextFilesSource
            | ChromeExtensionTextFilesSource
            | LaunchQueueTextFilesSource => input.text_files().next().is_some(),
            WorkcenterFilesRecognize => !input.files.is_empty(),
            WorkcenterTextAnalyze => {
                non_empty(input.text.as_deref()) || non_empty(input.recognized_content.as_deref())
            }
            ShareTargetImagesRecognize => input.has_images(),
            ShareTargetMarkdownView => is_markdown_content(input.text.as_deref().unwrap_or("")),
            ShareTargetUrlAnalyze
            | ChromeExtensionScreenshotRecognize
            | LaunchQueueFilesProcess => true,
        }
    }

    /// Build the registrable rule
    pub fn into_rule(self) -> ExecutionRule {
        let d = self.descriptor();
        ExecutionRule::new(
            d.id,
            d.source,
            d.input_types,
            d.action,
            Arc::new(self),
        )
        .with_description(d.name, format!("Built-in {} rule for {}", d.action, d.source))
        .with_priority(d.priority)
        .with_auto_copy(d.auto_copy)
        .with_condition(move |input, context| self.condition(input, context))
    }
}

/// All built-in rules, ready to register
pub fn default_rules() -> Vec<ExecutionRule> {
    BuiltinRule::ALL.iter().map(|r| r.into_rule()).collect()
}

#[async_trait]
impl RuleProcessor for BuiltinRule {
    async fn process(&self, request: RuleRequest<'_>) -> Result<ProcessedResult, EngineError> {
        use BuiltinRule::*;
        match self {
            WorkcenterTextFilesSource => text_files_source(request.input, "source"),
            ShareTargetTextFilesSource => text_files_source(request.input, "share_source"),
            ChromeExtensionTextFilesSource => text_files_source(request.input, "crx_source"),
            LaunchQueueTextFilesSource => text_files_source(request.input, "launch_source"),
            WorkcenterFilesRecognize => workcenter_recognize(request).await,
            WorkcenterTextAnalyze => workcenter_analyze(request).await,
            ShareTargetImagesRecognize => share_target_recognize(request).await,
            ShareTargetMarkdownView => {
                let text = request.input.text.clone().unwrap_or_default();
                Ok(ProcessedResult::new(ResultType::Markdown, text))
            }
            ShareTargetUrlAnalyze => share_target_url_analyze(request).await,
            ChromeExtensionScreenshotRecognize => screenshot_recognize(request).await,
            LaunchQueueFilesProcess => launch_queue_process(request).await,
        }
    }
}

fn non_empty(text: Option<&str>) -> bool {
    text.map_or(false, |t| !t.is_empty())
}

/// Concatenate text-like files, blank-line separated
fn text_files_source(input: &ActionInput, id_prefix: &str) -> Result<ProcessedResult, EngineError> {
    let mut combined = String::new();
    for file in input.text_files() {
        match file.text() {
            Some(text) => {
                combined.push_str(text);
                combined.push_str("\n\n");
            }
            None => warn!("Failed to read text file {}: not valid UTF-8", file.name),
        }
    }

    Ok(ProcessedResult::new(ResultType::Markdown, combined.trim())
        .with_category(DataCategory::Recognized)
        .with_response_id(generate_id(id_prefix)))
}

/// How each file is embedded in a multi-file message
#[derive(Clone, Copy)]
enum Embed {
    /// Images inline, everything else as text
    ImageOrText,
    /// Every file inline as an image
    ImageOnly,
}

/// One user message: intro text, then a header and a body per file
fn multi_file_message(intro: String, label: &str, files: &[&InputFile], embed: Embed) -> AiInput {
    let mut content = vec![ContentPart::text(intro)];
    for (index, file) in files.iter().enumerate() {
        content.push(ContentPart::text(format!(
            "\n--- {} {}: {} ---\n",
            label,
            index + 1,
            file.name
        )));
        let body = match embed {
            Embed::ImageOnly => ContentPart::image(file.to_data_url()),
            Embed::ImageOrText if file.is_image() => ContentPart::image(file.to_data_url()),
            Embed::ImageOrText => match file.text() {
                Some(text) => ContentPart::text(text),
                None => {
                    warn!("Failed to read file {}", file.name);
                    ContentPart::text(format!("[Failed to read file: {}]", file.name))
                }
            },
        };
        content.push(body);
    }
    AiInput::Messages(vec![AiMessage::user(content)])
}

/// Wrap an AI response as a processed result, failing on `ok: false`
fn ai_result(response: AiResponse, category: DataCategory) -> Result<ProcessedResult, EngineError> {
    if !response.ok {
        return Err(EngineError::Ai(
            response
                .error
                .unwrap_or_else(|| "AI request failed".to_string()),
        ));
    }

    let mut result =
        ProcessedResult::new(detect_result_format(&response), format_ai_result(&response))
            .with_category(category);
    result.response_id = response.response_id.clone();
    result.raw_data = serde_json::to_value(&response).ok();
    Ok(result)
}

fn recognition_options(request: &RuleRequest<'_>, instruction: String) -> AiOptions {
    let format = request.options.recognition_format.unwrap_or_default();
    AiOptions::new(instruction, format.as_str())
}

fn first_file<'a>(files: &[&'a InputFile]) -> Result<&'a InputFile, EngineError> {
    files.first().copied().ok_or(EngineError::NoFiles)
}

async fn workcenter_recognize(request: RuleRequest<'_>) -> Result<ProcessedResult, EngineError> {
    let format = request.options.recognition_format.unwrap_or_default();
    let format_instruction = format.instruction();
    let files: Vec<&InputFile> = request.input.files.iter().collect();

    let (input, instruction) = if files.len() > 1 {
        let intro = format!(
            "Analyze and recognize content from the following {} files. {}",
            files.len(),
            format_instruction
        );
        (
            multi_file_message(intro, "File", &files, Embed::ImageOrText),
            format!(
                "Analyze and recognize content from the provided files. {}",
                format_instruction
            ),
        )
    } else {
        let file = first_file(&files)?;
        if file.is_image() {
            (
                AiInput::DataUrl(file.to_data_url()),
                format!(
                    "Analyze and recognize content from the provided image. {}",
                    format_instruction
                ),
            )
        } else {
            (
                AiInput::File(file.clone()),
                "Analyze and recognize content from the provided file".to_string(),
            )
        }
    };

    let options = recognition_options(&request, instruction);
    let response = request.ai.recognize(input, options).await;
    ai_result(response, DataCategory::Recognized)
}

async fn workcenter_analyze(request: RuleRequest<'_>) -> Result<ProcessedResult, EngineError> {
    let input = request.input;
    let content = input
        .recognized_content
        .clone()
        .filter(|c| !c.is_empty())
        .or_else(|| {
            input
                .recognized_data
                .as_ref()
                .map(|d| d.content.clone())
                .filter(|c| !c.is_empty())
        })
        .or_else(|| input.text.clone())
        .unwrap_or_default();

    let has_images = input.has_images();
    let has_svg = content.contains("<svg");
    let processing_format = request.options.processing_format.unwrap_or_default();

    let user_instruction = request
        .options
        .custom_instruction
        .as_deref()
        .or(input.text.as_deref())
        .map(str::trim)
        .filter(|t| !t.is_empty() && *t != DEFAULT_ANALYZE_PROMPT);
    let instruction = match user_instruction {
        Some(text) => text.to_string(),
        None => format!(
            "Analyze the provided content. {}",
            processing_format.instruction()
        ),
    };

    let ai_input = if has_images || has_svg {
        let mut parts = vec![AiInput::Text(content)];
        parts.extend(input.files.iter().cloned().map(AiInput::File));
        AiInput::Parts(parts)
    } else {
        AiInput::Text(content)
    };

    let data_type = if has_svg {
        "svg"
    } else if has_images {
        "image"
    } else {
        "text"
    };

    let options = AiOptions {
        output_language: Some("auto".to_string()),
        intermediate_recognition: IntermediateRecognition {
            enabled: has_images,
            output_format: Some(
                request
                    .options
                    .recognition_format
                    .map(|f| f.as_str())
                    .unwrap_or("markdown")
                    .to_string(),
            ),
            cache_results: true,
        },
        data_type: Some(data_type.to_string()),
        processing_effort: Some("medium".to_string()),
        processing_verbosity: Some("medium".to_string()),
        ..AiOptions::new(instruction, processing_format.as_str())
    };

    let response = request.ai.process(ai_input, options).await;
    ai_result(response, DataCategory::Processed)
}

async fn share_target_recognize(request: RuleRequest<'_>) -> Result<ProcessedResult, EngineError> {
    let images: Vec<&InputFile> = request.input.files.iter().filter(|f| f.is_image()).collect();

    let (input, instruction) = if images.len() > 1 {
        let intro = format!(
            "Recognize and extract text/content from the following {} shared images:",
            images.len()
        );
        (
            multi_file_message(intro, "Image", &images, Embed::ImageOnly),
            "Recognize and extract text/content from the shared images",
        )
    } else {
        (
            AiInput::File(first_file(&images)?.clone()),
            "Recognize and extract text/content from the shared image",
        )
    };

    let options = recognition_options(&request, instruction.to_string());
    let response = request.ai.recognize(input, options).await;
    ai_result(response, DataCategory::Recognized)
}

async fn share_target_url_analyze(
    request: RuleRequest<'_>,
) -> Result<ProcessedResult, EngineError> {
    let url = request
        .input
        .url
        .clone()
        .filter(|u| !u.is_empty())
        .ok_or(EngineError::MissingUrl)?;
    let processing_format = request.options.processing_format.unwrap_or_default();

    let options = AiOptions {
        output_language: Some("auto".to_string()),
        data_type: Some("text".to_string()),
        ..AiOptions::new(
            format!(
                "Analyze the content from this URL and provide insights. {}",
                processing_format.instruction()
            ),
            processing_format.as_str(),
        )
    };

    let response = request.ai.process(AiInput::Text(url), options).await;
    ai_result(response, DataCategory::Recognized)
}

async fn screenshot_recognize(request: RuleRequest<'_>) -> Result<ProcessedResult, EngineError> {
    let files: Vec<&InputFile> = request.input.files.iter().collect();

    let (input, instruction) = if files.len() > 1 {
        let intro = format!(
            "Analyze the following {} screenshots and extract any visible text or content:",
            files.len()
        );
        (
            multi_file_message(intro, "Screenshot", &files, Embed::ImageOnly),
            "Analyze the screenshots and extract any visible text or content",
        )
    } else {
        let file = first_file(&files)?;
        let input = if file.is_image() {
            AiInput::DataUrl(file.to_data_url())
        } else {
            AiInput::File(file.clone())
        };
        (
            input,
            "Analyze the screenshot and extract any visible text or content",
        )
    };

    let options = recognition_options(&request, instruction.to_string());
    let response = request.ai.recognize(input, options).await;
    ai_result(response, DataCategory::Recognized)
}

async fn launch_queue_process(request: RuleRequest<'_>) -> Result<ProcessedResult, EngineError> {
    let files: Vec<&InputFile> = request.input.files.iter().collect();
    let processing_format = request.options.processing_format.unwrap_or_default();
    let custom = request.options.custom_instruction.clone();

    let (input, instruction) = if files.len() > 1 {
        let intro = format!("Process the following {} files:", files.len());
        (
            multi_file_message(intro, "File", &files, Embed::ImageOrText),
            "Process the provided content",
        )
    } else {
        let file = first_file(&files)?;
        if file.is_image() {
            (
                AiInput::DataUrl(file.to_data_url()),
                "Process the provided image content",
            )
        } else {
            (AiInput::File(file.clone()), "Process the provided content")
        }
    };

    let instruction = custom.unwrap_or_else(|| instruction.to_string());
    let options = AiOptions::new(instruction, processing_format.as_str());
    let response = request.ai.process(input, options).await;
    ai_result(response, DataCategory::Recognized)
}
