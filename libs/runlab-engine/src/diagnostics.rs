/// Diagnostic Extractor - stderr text to editor diagnostics
///
/// **Core Responsibility:**
/// Turn compiler errors and interpreter tracebacks into `CodeEditorDiagnostic`s
/// the editor can underline, without any compiler front end.
///
/// **Rules:**
/// - Patterns are per language and configurable (see `DiagnosticPatterns`)
/// - Unknown stderr shapes produce no diagnostics rather than a guess
/// - Distinct messages on the same line stay separate entries
/// - Output is ordered by source line, encounter order within a line
use crate::config::DiagnosticPatterns;
use regex::Regex;
use runlab_common::types::{CodeEditorDiagnostic, Language, UnderlineSpan};
use std::collections::HashSet;
use std::path::Path;
use tracing::debug;

const FALLBACK_MESSAGE: &str = "Error";

#[derive(Debug, Clone)]
pub struct DiagnosticExtractor {
    language: Language,
    located: Option<Regex>,
    traceback: Option<Regex>,
    excerpt: Option<Regex>,
    source_file: Option<String>,
}

impl DiagnosticExtractor {
    pub fn new(language: Language, patterns: &DiagnosticPatterns) -> Result<Self, regex::Error> {
        let compile = |pattern: &Option<String>| pattern.as_deref().map(Regex::new).transpose();

        Ok(Self {
            language,
            located: compile(&patterns.located)?,
            traceback: compile(&patterns.traceback)?,
            excerpt: compile(&patterns.excerpt)?,
            source_file: None,
        })
    }

    /// Restrict traceback frames to the submission's own file when any frame
    /// names it
    pub fn with_source_file(mut self, file_name: impl Into<String>) -> Self {
        self.source_file = Some(file_name.into());
        self
    }

    pub fn extract(&self, error_output: &str, code: &str) -> Vec<CodeEditorDiagnostic> {
        if error_output.trim().is_empty() {
            return Vec::new();
        }

        let mut collector = DiagnosticCollector::new(code);

        if let Some(located) = &self.located {
            collect_located(located, error_output, &mut collector);
        }
        if let Some(traceback) = &self.traceback {
            self.collect_traceback(traceback, error_output, &mut collector);
        }
        if collector.is_empty() {
            if let Some(excerpt) = &self.excerpt {
                collect_excerpt(excerpt, error_output, &mut collector);
            }
        }

        let diagnostics = collector.finish();
        debug!(language = %self.language, count = diagnostics.len(), "Extracted diagnostics");
        diagnostics
    }

    fn collect_traceback(&self, frame: &Regex, error_output: &str, collector: &mut DiagnosticCollector<'_>) {
        let lines: Vec<&str> = error_output.lines().collect();
        let fallback = exception_line(&lines);

        let frames: Vec<(usize, usize, Option<&str>)> = lines
            .iter()
            .enumerate()
            .filter_map(|(index, text)| {
                let caps = frame.captures(text)?;
                let line = caps.name("line")?.as_str().parse().ok()?;
                Some((index, line, caps.name("file").map(|m| m.as_str())))
            })
            .collect();

        let is_own = |file: Option<&str>| match (&self.source_file, file) {
            (Some(own), Some(file)) => Path::new(file).file_name().map_or(false, |name| name == own.as_str()),
            _ => false,
        };
        let restrict = frames.iter().any(|(_, _, file)| is_own(*file));

        for (index, line, file) in frames {
            if restrict && !is_own(file) {
                continue;
            }

            let source_line = collector.source_line(line);
            let (column, message) = caret_details(frame, &lines, index, source_line);
            let message = message.or(fallback).unwrap_or(FALLBACK_MESSAGE);
            collector.add(line, column, message);
        }
    }
}

fn collect_located(pattern: &Regex, error_output: &str, collector: &mut DiagnosticCollector<'_>) {
    for caps in pattern.captures_iter(error_output) {
        let Some(line) = caps.name("line").and_then(|m| m.as_str().parse().ok()) else {
            continue;
        };
        let column = caps.name("column").and_then(|m| m.as_str().parse().ok());
        let message = caps.name("message").map_or(FALLBACK_MESSAGE, |m| m.as_str());
        collector.add(line, column, message);
    }
}

fn collect_excerpt(pattern: &Regex, error_output: &str, collector: &mut DiagnosticCollector<'_>) {
    for caps in pattern.captures_iter(error_output) {
        if let Some(line) = caps.name("line").and_then(|m| m.as_str().parse().ok()) {
            collector.add(line, None, FALLBACK_MESSAGE);
        }
    }
}

/// Last line that names an exception, used when a frame has no message of
/// its own
fn exception_line<'a>(lines: &[&'a str]) -> Option<&'a str> {
    lines
        .iter()
        .rev()
        .copied()
        .map(str::trim)
        .find(|line| !line.is_empty() && (line.contains("Error") || line.contains("Exception")))
}

/// Column and message for the frame header at `index`.
///
/// A traceback frame is followed by the offending source (re-indented by the
/// interpreter) and optionally a caret line. The caret offset is mapped back
/// onto the original line's indentation.
fn caret_details<'a>(
    frame: &Regex,
    lines: &[&'a str],
    index: usize,
    source_line: Option<&str>,
) -> (Option<usize>, Option<&'a str>) {
    let (Some(excerpt), Some(caret_line)) = (lines.get(index + 1), lines.get(index + 2)) else {
        return (None, None);
    };
    if frame.is_match(excerpt) {
        return (None, None);
    }
    let Some(caret) = caret_line.chars().position(|c| c == '^') else {
        return (None, None);
    };

    let excerpt_indent = leading_whitespace(excerpt);
    let source_indent = source_line.map_or(0, leading_whitespace);
    let column = source_indent + caret.saturating_sub(excerpt_indent) + 1;

    let message = lines
        .get(index + 3)
        .copied()
        .map(str::trim)
        .filter(|candidate| {
            !candidate.is_empty() && !frame.is_match(candidate) && !candidate.starts_with("Traceback")
        });

    (Some(column), message)
}

fn leading_whitespace(text: &str) -> usize {
    text.chars().take_while(|c| c.is_whitespace()).count()
}

/// Span to underline for a diagnostic on `line_text`.
///
/// With a column, the identifier starting there is underlined, or a single
/// character when none starts there. Without a column the whole line is.
pub fn underline_span(line_text: &str, column: Option<usize>) -> UnderlineSpan {
    let chars: Vec<char> = line_text.trim_end_matches('\r').chars().collect();
    let Some(column) = column.filter(|column| *column > 0) else {
        return UnderlineSpan::Line;
    };
    if chars.is_empty() {
        return UnderlineSpan::Line;
    }

    let start = column.min(chars.len());
    let token = chars[start - 1..]
        .iter()
        .take_while(|c| c.is_alphanumeric() || **c == '_')
        .count();

    UnderlineSpan::Columns {
        start,
        length: token.max(1),
    }
}

struct DiagnosticCollector<'a> {
    source_lines: Vec<&'a str>,
    results: Vec<CodeEditorDiagnostic>,
    seen: HashSet<CodeEditorDiagnostic>,
}

impl<'a> DiagnosticCollector<'a> {
    fn new(code: &'a str) -> Self {
        Self {
            source_lines: code.split('\n').collect(),
            results: Vec::new(),
            seen: HashSet::new(),
        }
    }

    fn source_line(&self, line: usize) -> Option<&'a str> {
        line.checked_sub(1).and_then(|index| self.source_lines.get(index).copied())
    }

    fn is_empty(&self) -> bool {
        self.results.is_empty()
    }

    fn add(&mut self, line: usize, column: Option<usize>, message: &str) {
        if line < 1 {
            return;
        }
        let line = line.min(self.source_lines.len().max(1));
        let message = match message.trim() {
            "" => FALLBACK_MESSAGE,
            trimmed => trimmed,
        };
        let span = underline_span(self.source_line(line).unwrap_or(""), column);

        let diagnostic = CodeEditorDiagnostic {
            line,
            column,
            message: message.to_string(),
            span,
        };
        if self.seen.insert(diagnostic.clone()) {
            self.results.push(diagnostic);
        }
    }

    fn finish(mut self) -> Vec<CodeEditorDiagnostic> {
        self.results.sort_by_key(|diagnostic| diagnostic.line);
        self.results
    }
}
